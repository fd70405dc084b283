//! The `broker` module is the sharded subscription core.
//!
//! - `hash`: keyed 128-bit topic identity and shard selection.
//! - `request`: the closed set of requests a shard understands.
//! - `topic`: one topic's watcher set.
//! - `shard`: the single-writer actor owning a slice of the topic space.
//! - `engine`: the [`Router`] that hashes, picks a shard and enqueues.

pub mod engine;
pub mod hash;
pub mod request;
pub(crate) mod shard;
pub mod topic;

pub use engine::{Router, Stats};
pub use hash::{TopicHash, TopicHasher};

#[cfg(test)]
mod tests;
