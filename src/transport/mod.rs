//! The `transport` module is the reference network front end for the broker.
//!
//! It defines the JSON protocol spoken over WebSockets and a server that admits each
//! socket into the connection registry, turns client frames into router calls and
//! forwards published payloads back out through a per-client writer task.

pub mod message;
pub mod websocket;

pub use websocket::{WsHandler, WsPeer, start_websocket_server};
