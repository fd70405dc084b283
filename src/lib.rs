//! # ShardSub
//!
//! `shardsub` is an in-memory publish/subscribe subscription broker. Topic names are
//! hashed with a keyed 128-bit hash and the topic space is split across a power-of-two
//! number of shards, each owned by a single worker task fed through a bounded queue.
//! Publishing fans a payload out to every watcher of a topic except its sender.
//!
//! ## Core Modules
//!
//! - `broker`: topic hashing, the shard actors and the [`broker::Router`] in front of them.
//! - `connection`: connection entries, their keys and the [`connection::ConnectionRegistry`].
//! - `config`: loading settings from a file and the environment.
//! - `transport`: a WebSocket front end speaking a small JSON protocol.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod connection;
pub mod transport;
pub mod utils;
