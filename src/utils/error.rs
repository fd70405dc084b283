//! The `error` module defines the error types used within `shardsub`.
//!
//! - [`BrokerError`] is what a caller of the router sees: construction problems and
//!   enqueue failures (backpressure, stopped shards).
//! - [`TransportError`] is what a transport reports when it cannot read from or write to
//!   its peer. It is fatal to that one connection only and travels into `on_close`.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the subscription router.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The owning shard's queue stayed full for the whole enqueue timeout.
    #[error("shard {shard} queue still full after {waited:?}")]
    Backpressure { shard: usize, waited: Duration },

    /// The owning shard has been shut down and no longer accepts requests.
    #[error("shard {shard} has stopped")]
    ShardStopped { shard: usize },

    #[error("shard bits {bits} out of range (max {max})")]
    InvalidShardBits { bits: u32, max: u32 },

    #[error("shard queue capacity must be at least 1")]
    ZeroQueueCapacity,

    /// The router was built outside a tokio runtime, so its shards cannot be spawned.
    #[error("no tokio runtime to spawn shard workers on")]
    NoRuntime,
}

impl BrokerError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Backpressure { .. } => "backpressure",
            BrokerError::ShardStopped { .. } => "shard_stopped",
            BrokerError::InvalidShardBits { .. } => "invalid_shard_bits",
            BrokerError::ZeroQueueCapacity => "zero_queue_capacity",
            BrokerError::NoRuntime => "no_runtime",
        }
    }
}

/// Failures of a single connection's transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer's outbound side is gone; nothing can be delivered any more.
    #[error("peer is gone")]
    PeerGone,

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
