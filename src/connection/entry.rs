use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::broker::hash::TopicHash;
use crate::connection::registry::RegistryInner;
use crate::utils::error::TransportError;

/// 64-bit identity of a connection inside one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompactKey(pub u64);

impl fmt::Display for CompactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One live transport endpoint known to the broker.
///
/// `T` is whatever handle the transport needs to reach its peer. The handle is taken
/// out on the first [`Connection::close`]; an empty handle is how shards recognise a
/// dead watcher.
pub struct Connection<T> {
    key: CompactKey,
    sequence: u64,
    transport: RwLock<Option<T>>,
    /// Topic hash -> name the peer subscribed with. Only the shard owning a hash writes
    /// its entry.
    topics: Mutex<HashMap<TopicHash, Bytes>>,
    registry: Arc<RegistryInner<T>>,
}

impl<T: 'static> Connection<T> {
    pub(crate) fn new(
        key: CompactKey,
        sequence: u64,
        transport: T,
        registry: Arc<RegistryInner<T>>,
    ) -> Self {
        Self {
            key,
            sequence,
            transport: RwLock::new(Some(transport)),
            topics: Mutex::new(HashMap::new()),
            registry,
        }
    }

    pub fn key(&self) -> CompactKey {
        self.key
    }

    /// Admission order within the registry, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_open(&self) -> bool {
        self.transport.read().is_some()
    }

    /// Name this connection used when it subscribed to `topic`.
    pub fn topic_name(&self, topic: &TopicHash) -> Option<Bytes> {
        self.topics.lock().get(topic).cloned()
    }

    pub fn subscribed_topics(&self) -> Vec<Bytes> {
        self.topics.lock().values().cloned().collect()
    }

    /// Run `f` against the transport handle if the connection is still open.
    pub fn with_transport<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.transport.read().as_ref().map(f)
    }

    pub(crate) fn remember_topic(&self, topic: TopicHash, name: Bytes) {
        self.topics.lock().insert(topic, name);
    }

    pub(crate) fn forget_topic(&self, topic: &TopicHash) {
        self.topics.lock().remove(topic);
    }

    /// Empty the reverse map, returning every topic hash it held.
    pub(crate) fn take_topics(&self) -> Vec<TopicHash> {
        self.topics.lock().drain().map(|(topic, _)| topic).collect()
    }

    /// Hand one published payload to the transport.
    ///
    /// `Ok(false)` means the connection is already closed and nothing was written.
    /// The read side of the handle is held for the duration of the write, so a
    /// concurrent `close` waits for it.
    pub(crate) fn deliver(&self, topic: &TopicHash, payload: &Bytes) -> Result<bool, TransportError> {
        let transport = self.transport.read();
        let Some(handle) = transport.as_ref() else {
            return Ok(false);
        };
        let name = self.topic_name(topic).unwrap_or_default();
        self.registry
            .handler
            .write(self, handle, &name, payload)
            .map(|()| true)
    }

    /// Close the connection.
    ///
    /// Only the first call releases the transport, leaves the registry and fires
    /// `on_close`; it returns `true`. Every later call returns `false`.
    pub fn close(&self, reason: Option<TransportError>) -> bool {
        let Some(transport) = self.transport.write().take() else {
            return false;
        };
        drop(transport);
        self.registry.connections.remove(&self.key);
        self.registry.handler.on_close(self, reason.as_ref());
        true
    }
}

impl<T: 'static> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("sequence", &self.sequence)
            .field("open", &self.is_open())
            .finish()
    }
}
