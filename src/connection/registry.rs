//! Connection registry
//!
//! Every admitted connection gets a [`CompactKey`] made of a random per-registry base
//! plus a sequence number, and sits in a concurrent map until it is closed. The map is
//! for enumeration, statistics and bulk shutdown; publishing never looks at it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::broker::hash::TopicHash;
use crate::connection::entry::{CompactKey, Connection};
use crate::utils::error::TransportError;

/// Hooks a transport supplies to the broker.
pub trait ConnectionHandler<T>: Send + Sync + 'static {
    /// Called once per connection, right after admission.
    fn on_accept(&self, _conn: &Arc<Connection<T>>) {}

    /// Deliver `payload` published on `topic` to the peer behind `transport`.
    ///
    /// Runs on a shard worker: it must not block, and it must not close `conn`
    /// itself. Return an error instead and the shard closes the connection.
    fn write(
        &self,
        conn: &Connection<T>,
        transport: &T,
        topic: &[u8],
        payload: &Bytes,
    ) -> Result<(), TransportError>;

    /// Called exactly once, by the first `close`.
    fn on_close(&self, _conn: &Connection<T>, _reason: Option<&TransportError>) {}
}

pub(crate) struct RegistryInner<T> {
    base: u64,
    sequence: AtomicU64,
    pub(crate) connections: DashMap<CompactKey, Arc<Connection<T>>>,
    pub(crate) handler: Box<dyn ConnectionHandler<T>>,
}

/// All live connections of one transport.
pub struct ConnectionRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: Send + Sync + 'static> ConnectionRegistry<T> {
    pub fn new(handler: impl ConnectionHandler<T>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                base: TopicHash::random().compact(),
                sequence: AtomicU64::new(1),
                connections: DashMap::new(),
                handler: Box::new(handler),
            }),
        }
    }

    /// Admit a freshly accepted transport and fire `on_accept`.
    pub fn admit(&self, transport: T) -> Arc<Connection<T>> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let key = CompactKey(self.inner.base.wrapping_add(sequence));
        let conn = Arc::new(Connection::new(
            key,
            sequence,
            transport,
            self.inner.clone(),
        ));
        self.inner.connections.insert(key, conn.clone());
        debug!(key = %key, sequence, "connection admitted");
        self.inner.handler.on_accept(&conn);
        conn
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn get(&self, key: CompactKey) -> Option<Arc<Connection<T>>> {
        self.inner.connections.get(&key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<CompactKey> {
        self.inner.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Close every live connection. Returns how many this call closed.
    pub fn close_all(&self) -> usize {
        // Collect first: closing removes from the map.
        let live: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        live.into_iter().filter(|conn| conn.close(None)).count()
    }
}

impl<T> Clone for ConnectionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
