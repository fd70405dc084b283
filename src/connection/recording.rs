//! Test handler that records deliveries and closes instead of touching a network.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::{CompactKey, Connection, ConnectionHandler};
use crate::utils::error::TransportError;

/// Transport handle used in tests. `fail_writes` makes every write error out.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FakePeer {
    pub fail_writes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub to: CompactKey,
    pub topic: Bytes,
    pub payload: Bytes,
}

#[derive(Default)]
pub(crate) struct Journal {
    pub accepted: Mutex<Vec<CompactKey>>,
    pub deliveries: Mutex<Vec<Delivery>>,
    pub closed: Mutex<Vec<(CompactKey, Option<String>)>>,
}

impl Journal {
    pub fn deliveries_to(&self, key: CompactKey) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.to == key)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingHandler {
    pub journal: Arc<Journal>,
}

impl ConnectionHandler<FakePeer> for RecordingHandler {
    fn on_accept(&self, conn: &Arc<Connection<FakePeer>>) {
        self.journal.accepted.lock().push(conn.key());
    }

    fn write(
        &self,
        conn: &Connection<FakePeer>,
        transport: &FakePeer,
        topic: &[u8],
        payload: &Bytes,
    ) -> Result<(), TransportError> {
        if transport.fail_writes {
            return Err(TransportError::Write("peer reset".to_string()));
        }
        self.journal.deliveries.lock().push(Delivery {
            to: conn.key(),
            topic: Bytes::copy_from_slice(topic),
            payload: payload.clone(),
        });
        Ok(())
    }

    fn on_close(&self, conn: &Connection<FakePeer>, reason: Option<&TransportError>) {
        self.journal
            .closed
            .lock()
            .push((conn.key(), reason.map(|e| e.to_string())));
    }
}
