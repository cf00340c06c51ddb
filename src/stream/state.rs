use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::LiveError;

/// Push-channel connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a stream connection can tell its owner.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connect,
    Disconnect { reason: String },
    Message { data: Value },
    Error { error: LiveError },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Reconnected { attempts: u32 },
    Failed { attempts: u32, last_error: String },
    StateChange { from: ConnectionState, to: ConnectionState },
}

pub type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Token for unsubscribing a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Per-connection callback registry.
///
/// Emission iterates over a snapshot, so handlers may subscribe or
/// unsubscribe from inside an emit without reentrancy hazards.
#[derive(Default)]
pub struct EventEmitter {
    handlers: Mutex<Vec<(u64, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, handler: EventHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .push((id, handler));
        HandlerId(id)
    }

    pub fn off(&self, id: HandlerId) {
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .retain(|(handler_id, _)| *handler_id != id.0);
    }

    pub fn emit(&self, event: &StreamEvent) {
        let snapshot: Vec<EventHandler> = self
            .handlers
            .lock()
            .expect("handler list lock poisoned")
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }
}
