//! Requests delivered to a shard
//!
//! Every interaction with a shard's registry is one of these variants, posted into the
//! shard's bounded queue and handled in FIFO order by its single worker.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::broker::hash::TopicHash;
use crate::connection::{CompactKey, Connection};

pub enum Request<T> {
    Subscribe {
        topic: TopicHash,
        name: Bytes,
        conn: Arc<Connection<T>>,
    },
    Unsubscribe {
        topic: TopicHash,
        conn: Arc<Connection<T>>,
    },
    Publish {
        topic: TopicHash,
        sender: Arc<Connection<T>>,
        payload: Bytes,
    },
    /// Answered once everything queued ahead of it has been handled.
    Flush { ack: oneshot::Sender<()> },
    /// Current watcher keys of one topic, read through the actor.
    Watchers {
        topic: TopicHash,
        reply: oneshot::Sender<Vec<CompactKey>>,
    },
}

impl<T> Request<T> {
    /// Short name for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Publish { .. } => "publish",
            Request::Flush { .. } => "flush",
            Request::Watchers { .. } => "watchers",
        }
    }
}
