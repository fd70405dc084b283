//! The `utils` module provides definitions shared across the `shardsub` crate:
//! the error types returned by the broker and the transport, and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, TransportError};
