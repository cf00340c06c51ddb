use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::LiveError;
use crate::geojson::{is_feature_collection, parse_feature_collection, FeatureCollection};
use crate::stream::{
    ConnectionState, StreamConfig, StreamConnection, StreamEvent, StreamKind,
};

pub type StreamDataFn = Arc<dyn Fn(&str, FeatureCollection) + Send + Sync>;
pub type StreamErrorFn = Arc<dyn Fn(&str, &LiveError) + Send + Sync>;
pub type StreamStateFn = Arc<dyn Fn(&str, ConnectionState, ConnectionState) + Send + Sync>;

/// Routing callbacks for one managed stream.
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    pub on_data: Option<StreamDataFn>,
    pub on_error: Option<StreamErrorFn>,
    pub on_state_change: Option<StreamStateFn>,
}

/// Per-subscription bookkeeping.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub connection_state: ConnectionState,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            message_count: 0,
            last_message_at: None,
            reconnect_attempts: 0,
        }
    }
}

struct ManagedStream {
    conn: Arc<StreamConnection>,
    status: Arc<RwLock<StreamStatus>>,
}

/// Named collection of stream connections with payload validation.
///
/// Every inbound message is checked against the FeatureCollection
/// predicate before it reaches `on_data`; anything else goes to
/// `on_error`.
pub struct StreamManager {
    streams: DashMap<String, ManagedStream>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// Open a named stream and wire its routing. Fails if the id is
    /// taken or the initial handshake fails.
    pub async fn connect(
        &self,
        id: &str,
        kind: StreamKind,
        config: StreamConfig,
        callbacks: StreamCallbacks,
    ) -> Result<(), LiveError> {
        if self.streams.contains_key(id) {
            return Err(LiveError::Misconfiguration(format!(
                "stream '{}' already exists",
                id
            )));
        }

        let conn = Arc::new(match kind {
            StreamKind::WebSocket => StreamConnection::websocket(config),
            StreamKind::Sse => StreamConnection::sse(config),
        });
        let status = Arc::new(RwLock::new(StreamStatus::default()));

        conn.on(route_events(id.to_string(), Arc::clone(&status), callbacks));

        self.streams.insert(
            id.to_string(),
            ManagedStream {
                conn: Arc::clone(&conn),
                status,
            },
        );

        match conn.connect().await {
            Ok(()) => {
                debug!(id, "stream connected");
                Ok(())
            }
            Err(err) => {
                self.streams.remove(id);
                Err(err)
            }
        }
    }

    /// Serialize and transmit on a bidirectional stream.
    pub async fn send(&self, id: &str, data: &Value) -> Result<(), LiveError> {
        let conn = self
            .streams
            .get(id)
            .map(|entry| Arc::clone(&entry.conn))
            .ok_or_else(|| {
                LiveError::Misconfiguration(format!("unknown stream '{}'", id))
            })?;
        conn.send(data).await
    }

    /// Close and forget a stream. Closing an unknown id is a no-op.
    pub fn disconnect(&self, id: &str) {
        if let Some((_, managed)) = self.streams.remove(id) {
            managed.conn.disconnect();
            debug!(id, "stream disconnected");
        }
    }

    pub fn disconnect_all(&self) {
        let ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id);
        }
    }

    pub fn destroy(&self) {
        self.disconnect_all();
    }

    pub fn state(&self, id: &str) -> Option<StreamStatus> {
        self.streams.get(id).map(|entry| {
            entry
                .status
                .read()
                .expect("stream status lock poisoned")
                .clone()
        })
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.state(id)
            .map(|status| status.connection_state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the event handler that validates payloads and keeps the
/// per-subscription status current.
fn route_events(
    id: String,
    status: Arc<RwLock<StreamStatus>>,
    callbacks: StreamCallbacks,
) -> Arc<dyn Fn(&StreamEvent) + Send + Sync> {
    Arc::new(move |event: &StreamEvent| match event {
        StreamEvent::Message { data } => {
            {
                let mut s = status.write().expect("stream status lock poisoned");
                s.message_count += 1;
                s.last_message_at = Some(Utc::now());
            }
            if is_feature_collection(data) {
                match parse_feature_collection(data.clone()) {
                    Ok(collection) => {
                        if let Some(on_data) = &callbacks.on_data {
                            on_data(&id, collection);
                        }
                    }
                    Err(err) => {
                        warn!(id = %id, error = %err, "stream payload failed validation");
                        if let Some(on_error) = &callbacks.on_error {
                            on_error(&id, &err);
                        }
                    }
                }
            } else {
                let err = LiveError::NotGeoJson(
                    "stream message is not a feature collection".to_string(),
                );
                warn!(id = %id, "dropping non-geojson stream message");
                if let Some(on_error) = &callbacks.on_error {
                    on_error(&id, &err);
                }
            }
        }
        StreamEvent::StateChange { from, to } => {
            {
                let mut s = status.write().expect("stream status lock poisoned");
                s.connection_state = *to;
            }
            if let Some(on_state_change) = &callbacks.on_state_change {
                on_state_change(&id, *from, *to);
            }
        }
        StreamEvent::Reconnecting { .. } => {
            let mut s = status.write().expect("stream status lock poisoned");
            s.reconnect_attempts += 1;
        }
        StreamEvent::Reconnected { .. } => {
            let mut s = status.write().expect("stream status lock poisoned");
            s.reconnect_attempts = 0;
        }
        StreamEvent::Error { error } => {
            if let Some(on_error) = &callbacks.on_error {
                on_error(&id, error);
            }
        }
        StreamEvent::Failed {
            attempts,
            last_error,
        } => {
            warn!(id = %id, attempts, "stream gave up reconnecting");
            let err = LiveError::StreamClosed(last_error.clone());
            if let Some(on_error) = &callbacks.on_error {
                on_error(&id, &err);
            }
        }
        StreamEvent::Connect | StreamEvent::Disconnect { .. } => {}
    })
}
