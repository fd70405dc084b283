//! Topic watcher sets
//!
//! A `Subscription` holds the connections currently watching one topic hash, which is
//! its key in the owning shard's map.
//! It is owned by exactly one shard, which creates it on the first subscribe and drops
//! it as soon as the watcher set is empty. Duplicate subscriptions are a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{CompactKey, Connection};

pub struct Subscription<T> {
    pub watchers: HashMap<CompactKey, Arc<Connection<T>>>,
}

impl<T: 'static> Subscription<T> {
    /// Create a subscription with no watchers yet.
    pub fn new() -> Self {
        Self {
            watchers: HashMap::new(),
        }
    }

    /// Add a watcher. Watching twice is the same as watching once.
    pub fn watch(&mut self, conn: Arc<Connection<T>>) {
        self.watchers.insert(conn.key(), conn);
    }

    /// Remove a watcher by key.
    pub fn unwatch(&mut self, key: CompactKey) -> Option<Arc<Connection<T>>> {
        self.watchers.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }
}
