//! The `connection` module tracks the transport endpoints the broker delivers to.
//!
//! It provides the [`Connection`] entry (compact key, transport handle, reverse topic
//! map), the [`ConnectionRegistry`] that admits and enumerates them, and the
//! [`ConnectionHandler`] hooks a transport implements.

pub mod entry;
pub mod registry;

pub use entry::{CompactKey, Connection};
pub use registry::{ConnectionHandler, ConnectionRegistry};

#[cfg(test)]
pub(crate) mod recording;
