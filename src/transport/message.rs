use serde::{Deserialize, Serialize};

/// Frames a client sends, as JSON text tagged by `type`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: String },
    Ping,
}

/// Frames the server sends back.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A payload published on a topic this client watches.
    Message { topic: String, payload: String },
    Pong,
    Error { message: String },
}
