mod connection;
mod sse;
mod state;
mod websocket;

pub use connection::{StreamConnection, StreamKind};
pub use state::{ConnectionState, EventEmitter, EventHandler, HandlerId, StreamEvent};

use crate::retry::RetryPolicy;

/// Configuration for one push-channel endpoint.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Re-establish automatically after a non-manual drop.
    pub reconnect: bool,
    pub retry: RetryPolicy,
    /// Event type names to deliver (server-sent variant only).
    pub event_types: Vec<String>,
    /// Subprotocols offered during the handshake (WebSocket only).
    pub protocols: Vec<String>,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            retry: RetryPolicy::reconnect_default(),
            event_types: vec!["message".to_string()],
            protocols: Vec::new(),
        }
    }
}
