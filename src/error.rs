use std::fmt;

/// Errors surfaced by the live-data subsystem.
///
/// The variants map one-to-one onto the failure classes a layer can
/// observe: transport-level faults, per-attempt timeouts, HTTP status
/// failures, payload problems, cancellation, configuration mistakes,
/// and push-stream closure.
#[derive(Debug, Clone)]
pub enum LiveError {
    /// Network failure: DNS, TCP reset, TLS, connection refused.
    Transport(String),
    /// The per-attempt budget was exceeded.
    Timeout(String),
    /// Non-success HTTP response.
    HttpStatus { status: u16, url: String },
    /// The response body could not be parsed as JSON.
    InvalidJson(String),
    /// The parsed body is not a GeoJSON FeatureCollection.
    NotGeoJson(String),
    /// External cancellation or tear-down.
    Cancelled,
    /// Invalid configuration, raised synchronously.
    Misconfiguration(String),
    /// The push-stream transport closed while connected.
    StreamClosed(String),
}

impl fmt::Display for LiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveError::Transport(msg) => write!(f, "transport error: {}", msg),
            LiveError::Timeout(msg) => write!(f, "timeout: {}", msg),
            LiveError::HttpStatus { status, url } => {
                write!(f, "http status {} from {}", status, url)
            }
            LiveError::InvalidJson(msg) => write!(f, "invalid json: {}", msg),
            LiveError::NotGeoJson(msg) => write!(f, "not a feature collection: {}", msg),
            LiveError::Cancelled => write!(f, "cancelled"),
            LiveError::Misconfiguration(msg) => write!(f, "misconfiguration: {}", msg),
            LiveError::StreamClosed(msg) => write!(f, "stream closed: {}", msg),
        }
    }
}

impl std::error::Error for LiveError {}

impl LiveError {
    /// Whether a retry executor may re-attempt after this error.
    ///
    /// Server-side status (>= 500) and rate limiting (429) are
    /// retryable; client errors, bad payloads, cancellation, and
    /// misconfiguration are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LiveError::Transport(_) | LiveError::Timeout(_) => true,
            LiveError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            LiveError::StreamClosed(_) => true,
            LiveError::InvalidJson(_)
            | LiveError::NotGeoJson(_)
            | LiveError::Cancelled
            | LiveError::Misconfiguration(_) => false,
        }
    }

    /// Classify a `reqwest` failure into the taxonomy.
    pub fn from_reqwest(err: &reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            LiveError::Timeout(format!("request to {} timed out", url))
        } else if let Some(status) = err.status() {
            LiveError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else if err.is_decode() {
            LiveError::InvalidJson(err.to_string())
        } else {
            LiveError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        let err = LiveError::HttpStatus {
            status: 503,
            url: "http://example.com/d.geojson".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = LiveError::HttpStatus {
            status: 429,
            url: "http://example.com/d.geojson".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = LiveError::HttpStatus {
            status: 404,
            url: "http://example.com/d.geojson".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_payload_errors_are_not_retryable() {
        assert!(!LiveError::InvalidJson("trailing comma".to_string()).is_retryable());
        assert!(!LiveError::NotGeoJson("got a bare geometry".to_string()).is_retryable());
        assert!(!LiveError::Cancelled.is_retryable());
    }

    #[test]
    fn test_transient_faults_are_retryable() {
        assert!(LiveError::Transport("connection reset".to_string()).is_retryable());
        assert!(LiveError::Timeout("30s elapsed".to_string()).is_retryable());
    }
}
