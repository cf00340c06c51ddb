use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::error::LiveError;
use crate::stream::connection::{StreamTransport, TransportSession};

const LAST_EVENT_ID: &str = "Last-Event-ID";

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Server-sent-events transport over a streaming `reqwest` body.
///
/// The last observed event id is shared between sessions so a
/// reconnect resumes where the previous session left off.
pub(crate) struct SseTransport {
    client: reqwest::Client,
    url: String,
    event_types: Vec<String>,
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl SseTransport {
    pub(crate) fn new(url: String, event_types: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            event_types,
            last_event_id: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn open(&self) -> Result<Box<dyn TransportSession>, LiveError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream");
        let resume_from = self
            .last_event_id
            .lock()
            .expect("event id lock poisoned")
            .clone();
        if let Some(id) = resume_from {
            request = request.header(LAST_EVENT_ID, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LiveError::from_reqwest(&e, &self.url))?;
        if !response.status().is_success() {
            return Err(LiveError::HttpStatus {
                status: response.status().as_u16(),
                url: self.url.clone(),
            });
        }
        debug!(url = %self.url, "event stream open");

        let stream = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()));
        Ok(Box::new(SseSession {
            stream: Box::pin(stream),
            url: self.url.clone(),
            buffer: String::new(),
            data_lines: Vec::new(),
            event_name: None,
            event_types: self.event_types.clone(),
            last_event_id: Arc::clone(&self.last_event_id),
        }))
    }
}

struct SseSession {
    stream: ChunkStream,
    url: String,
    buffer: String,
    data_lines: Vec<String>,
    event_name: Option<String>,
    event_types: Vec<String>,
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl SseSession {
    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_name = Some(value.to_string()),
            "id" => {
                *self.last_event_id.lock().expect("event id lock poisoned") =
                    Some(value.to_string());
            }
            // "retry" and unknown fields are ignored; the reconnect
            // cadence is owned by the retry policy.
            _ => {}
        }
    }

    /// Finish the pending event on a blank line. Returns the data
    /// payload when the event type is subscribed, `None` otherwise.
    fn dispatch_event(&mut self) -> Option<String> {
        let name = self
            .event_name
            .take()
            .unwrap_or_else(|| "message".to_string());
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        if self.event_types.iter().any(|t| t == &name) {
            Some(data)
        } else {
            None
        }
    }
}

#[async_trait]
impl TransportSession for SseSession {
    async fn next_frame(&mut self) -> Result<Option<String>, LiveError> {
        loop {
            while let Some(pos) = self.buffer.find('\n') {
                let mut line: String = self.buffer.drain(..=pos).collect();
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                if line.is_empty() {
                    if let Some(data) = self.dispatch_event() {
                        return Ok(Some(data));
                    }
                } else {
                    self.process_line(&line);
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(err)) => return Err(LiveError::from_reqwest(&err, &self.url)),
                None => return Ok(None),
            }
        }
    }

    async fn send_text(&mut self, _text: String) -> Result<(), LiveError> {
        Err(LiveError::Misconfiguration(
            "server-sent streams are receive-only".to_string(),
        ))
    }

    async fn close(&mut self) {
        // Dropping the body stream tears the connection down.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(event_types: &[&str]) -> SseSession {
        SseSession {
            stream: Box::pin(futures::stream::empty()),
            url: "http://example.com/events".to_string(),
            buffer: String::new(),
            data_lines: Vec::new(),
            event_name: None,
            event_types: event_types.iter().map(ToString::to_string).collect(),
            last_event_id: Arc::new(Mutex::new(None)),
        }
    }

    #[tokio::test]
    async fn test_parses_framed_events() {
        let mut s = session(&["message"]);
        s.buffer.push_str("data: {\"a\":1}\n\ndata: line one\ndata: line two\n\n");

        assert_eq!(s.next_frame().await.unwrap(), Some("{\"a\":1}".to_string()));
        assert_eq!(
            s.next_frame().await.unwrap(),
            Some("line one\nline two".to_string())
        );
        assert_eq!(s.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filters_unsubscribed_event_types() {
        let mut s = session(&["telemetry"]);
        s.buffer.push_str(
            "event: heartbeat\ndata: ignored\n\nevent: telemetry\ndata: kept\n\n",
        );

        assert_eq!(s.next_frame().await.unwrap(), Some("kept".to_string()));
    }

    #[tokio::test]
    async fn test_tracks_last_event_id_and_ignores_comments() {
        let mut s = session(&["message"]);
        s.buffer.push_str(": server comment\nid: evt-42\ndata: x\n\n");

        assert_eq!(s.next_frame().await.unwrap(), Some("x".to_string()));
        assert_eq!(
            s.last_event_id.lock().unwrap().as_deref(),
            Some("evt-42")
        );
    }

    #[tokio::test]
    async fn test_handles_crlf_lines() {
        let mut s = session(&["message"]);
        s.buffer.push_str("data: windows\r\n\r\n");

        assert_eq!(s.next_frame().await.unwrap(), Some("windows".to_string()));
    }
}
