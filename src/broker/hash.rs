//! Topic identity hashing
//!
//! Topic names are client-supplied, so the hash is keyed: every [`TopicHasher`] draws its
//! own random SipHash key and nobody outside the process can predict which names collide
//! or which shard a name lands in.
//!
//! A [`TopicHash`] reads as a big-endian binary fraction in `[0, 1)`, high half first.
//! Shards are picked from its leading bits.

use std::fmt;
use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher13};

/// 128-bit identity of a topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TopicHash {
    high: u64,
    low: u64,
}

impl TopicHash {
    pub const fn from_parts(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Random bits, not derived from any name.
    pub fn random() -> Self {
        Self {
            high: rand::random(),
            low: rand::random(),
        }
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    /// Top `n` bits of the high half, i.e. `floor(hash * 2^n)`.
    ///
    /// Only `n <= 64` is meaningful; larger values are clamped.
    pub fn fractional_bits(&self, n: u32) -> u64 {
        debug_assert!(n <= 64, "fractional_bits supports at most 64 bits");
        match n {
            0 => 0,
            n if n >= 64 => self.high,
            n => self.high >> (64 - n),
        }
    }

    /// 64-bit truncation, used where twice the collision odds are fine.
    pub fn compact(&self) -> u64 {
        self.high
    }
}

impl fmt::Display for TopicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.high)
    }
}

/// Keyed 128-bit hasher for topic names.
#[derive(Clone)]
pub struct TopicHasher {
    key0: u64,
    key1: u64,
}

impl TopicHasher {
    /// A hasher with fresh random key material.
    pub fn new() -> Self {
        Self::with_keys(rand::random(), rand::random())
    }

    /// A hasher with fixed keys. Meant for reproducible tests.
    pub fn with_keys(key0: u64, key1: u64) -> Self {
        Self { key0, key1 }
    }

    pub fn hash(&self, name: &[u8]) -> TopicHash {
        let mut hasher = SipHasher13::new_with_keys(self.key0, self.key1);
        hasher.write(name);
        let digest = hasher.finish128();
        TopicHash::from_parts(digest.h1, digest.h2)
    }
}

impl Default for TopicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TopicHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicHasher").field("key", &"<secret>").finish()
    }
}
