use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LiveError;
use crate::geojson::FeatureCollection;
use crate::merge::UpdateStrategy;
use crate::poller::MIN_POLL_INTERVAL;
use crate::retry::RetryPolicy;
use crate::stream::{StreamConfig, StreamKind};

/// Source configuration for a GeoJSON-backed layer, as handed over by
/// the outer configuration layer. Recognized exactly for
/// `type: "geojson"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoJsonSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub data: Option<FeatureCollection>,
    #[serde(default)]
    pub prefetched_data: Option<FeatureCollection>,
    #[serde(default)]
    pub cache: CacheOptions,
    #[serde(default)]
    pub refresh: Option<RefreshOptions>,
    #[serde(default)]
    pub stream: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-URL TTL override, milliseconds.
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshOptions {
    /// Polling cadence, milliseconds; 1000 is the floor.
    #[serde(default)]
    pub refresh_interval: Option<u64>,
    #[serde(default)]
    pub update_strategy: StrategyKind,
    #[serde(default)]
    pub update_key: Option<String>,
    #[serde(default)]
    pub window_size: Option<usize>,
    /// Append-window age cap, milliseconds.
    #[serde(default)]
    pub window_duration: Option<u64>,
    #[serde(default)]
    pub timestamp_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Replace,
    Merge,
    AppendWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Websocket,
    Sse,
}

/// A single subprotocol or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(rename = "type")]
    pub transport: TransportKind,
    /// Defaults to the source `url` when absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,
    /// Initial backoff, milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Backoff ceiling, milliseconds.
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: u64,
    /// SSE only.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    /// WebSocket only.
    #[serde(default)]
    pub protocols: Option<OneOrMany>,
    /// Legacy stream shape; always rejected at validation.
    #[serde(default)]
    pub protocol: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_reconnect_max_delay() -> u64 {
    30_000
}

impl GeoJsonSource {
    pub fn from_value(value: serde_json::Value) -> Result<Self, LiveError> {
        let source: Self = serde_json::from_value(value)
            .map_err(|e| LiveError::Misconfiguration(format!("malformed source: {}", e)))?;
        source.validate()?;
        Ok(source)
    }

    pub fn from_json_str(text: &str) -> Result<Self, LiveError> {
        let source: Self = serde_json::from_str(text)
            .map_err(|e| LiveError::Misconfiguration(format!("malformed source: {}", e)))?;
        source.validate()?;
        Ok(source)
    }

    /// Check every constraint at once and report them together.
    pub fn validate(&self) -> Result<(), LiveError> {
        let mut errors = Vec::new();

        if self.source_type != "geojson" {
            errors.push(format!(
                "unsupported source type '{}', expected 'geojson'",
                self.source_type
            ));
        }

        if self.url.is_none() && self.data.is_none() && self.prefetched_data.is_none() {
            errors.push(
                "source needs at least one of 'url', 'data', or 'prefetched_data'".to_string(),
            );
        }

        if let Some(url) = &self.url {
            if Url::parse(url).is_err() {
                errors.push(format!("invalid url '{}'", url));
            }
        }

        if let Some(refresh) = &self.refresh {
            if let Some(interval) = refresh.refresh_interval {
                if Duration::from_millis(interval) < MIN_POLL_INTERVAL {
                    errors.push(format!(
                        "refresh_interval {}ms is below the {}ms minimum",
                        interval,
                        MIN_POLL_INTERVAL.as_millis()
                    ));
                }
            }
            if refresh.update_strategy == StrategyKind::Merge
                && refresh.update_key.as_deref().map_or(true, str::is_empty)
            {
                errors.push("update_strategy 'merge' requires 'update_key'".to_string());
            }
            if refresh.window_size == Some(0) {
                errors.push("window_size must be greater than zero".to_string());
            }
            if refresh.window_duration == Some(0) {
                errors.push("window_duration must be greater than zero".to_string());
            }
        }

        if let Some(stream) = &self.stream {
            if stream.protocol.is_some() {
                errors.push(
                    "legacy 'stream.protocol' is not supported; use 'stream.type' with \
                     'event_types'/'protocols'"
                        .to_string(),
                );
            }
            let stream_url = stream.url.as_ref().or(self.url.as_ref());
            match stream_url {
                None => errors.push("stream needs a url (own or inherited)".to_string()),
                Some(url) => {
                    if Url::parse(url).is_err() {
                        errors.push(format!("invalid stream url '{}'", url));
                    }
                }
            }
            match stream.transport {
                TransportKind::Websocket => {
                    if stream.event_types.is_some() {
                        errors.push("'event_types' applies to sse streams only".to_string());
                    }
                }
                TransportKind::Sse => {
                    if stream.protocols.is_some() {
                        errors.push("'protocols' applies to websocket streams only".to_string());
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LiveError::Misconfiguration(format!(
                "invalid geojson source:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.enabled
    }

    pub fn ttl_override(&self) -> Option<Duration> {
        self.cache.ttl.map(Duration::from_millis)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh
            .as_ref()
            .and_then(|r| r.refresh_interval)
            .map(Duration::from_millis)
    }

    /// The typed merge strategy for refresh and stream routing.
    pub fn update_strategy(&self) -> Result<UpdateStrategy, LiveError> {
        let Some(refresh) = &self.refresh else {
            return Ok(UpdateStrategy::Replace);
        };
        match refresh.update_strategy {
            StrategyKind::Replace => Ok(UpdateStrategy::Replace),
            StrategyKind::Merge => {
                let update_key = refresh
                    .update_key
                    .clone()
                    .filter(|key| !key.is_empty())
                    .ok_or_else(|| {
                        LiveError::Misconfiguration(
                            "update_strategy 'merge' requires 'update_key'".to_string(),
                        )
                    })?;
                Ok(UpdateStrategy::Merge { update_key })
            }
            StrategyKind::AppendWindow => Ok(UpdateStrategy::AppendWindow {
                window_size: refresh.window_size,
                window_duration: refresh.window_duration.map(Duration::from_millis),
                timestamp_field: refresh.timestamp_field.clone(),
            }),
        }
    }

    /// The push-channel kind and configuration, when one is declared.
    pub fn stream_config(&self) -> Option<(StreamKind, StreamConfig)> {
        let stream = self.stream.as_ref()?;
        let url = stream.url.as_ref().or(self.url.as_ref())?.clone();
        let kind = match stream.transport {
            TransportKind::Websocket => StreamKind::WebSocket,
            TransportKind::Sse => StreamKind::Sse,
        };
        let mut config = StreamConfig::new(url);
        config.reconnect = stream.reconnect;
        config.retry = RetryPolicy {
            max_retries: stream.reconnect_max_attempts,
            initial_delay: Duration::from_millis(stream.reconnect_delay),
            max_delay: Duration::from_millis(stream.reconnect_max_delay),
            ..RetryPolicy::reconnect_default()
        };
        if let Some(event_types) = &stream.event_types {
            config.event_types = event_types.clone();
        }
        if let Some(protocols) = &stream.protocols {
            config.protocols = protocols.to_vec();
        }
        Some((kind, config))
    }
}
