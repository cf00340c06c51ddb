use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::LiveError;
use crate::stream::connection::{StreamTransport, TransportSession};

/// Bidirectional transport over `tokio-tungstenite`.
pub(crate) struct WebSocketTransport {
    url: String,
    protocols: Vec<String>,
}

impl WebSocketTransport {
    pub(crate) fn new(url: String, protocols: Vec<String>) -> Self {
        Self { url, protocols }
    }
}

fn classify(err: &WsError, url: &str) -> LiveError {
    match err {
        WsError::Http(response) => LiveError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        },
        WsError::Url(inner) => LiveError::Misconfiguration(format!(
            "invalid websocket url '{}': {}",
            url, inner
        )),
        other => LiveError::Transport(other.to_string()),
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn open(&self) -> Result<Box<dyn TransportSession>, LiveError> {
        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            LiveError::Misconfiguration(format!("invalid websocket url '{}': {}", self.url, e))
        })?;
        if !self.protocols.is_empty() {
            let joined = self.protocols.join(", ");
            let value = HeaderValue::from_str(&joined).map_err(|e| {
                LiveError::Misconfiguration(format!("invalid websocket subprotocols: {}", e))
            })?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| classify(&e, &self.url))?;
        debug!(url = %self.url, "websocket handshake complete");
        Ok(Box::new(WebSocketSession {
            ws,
            url: self.url.clone(),
        }))
    }
}

struct WebSocketSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

#[async_trait]
impl TransportSession for WebSocketSession {
    async fn next_frame(&mut self) -> Result<Option<String>, LiveError> {
        loop {
            match self.ws.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(url = %self.url, ?frame, "websocket closed by remote");
                    return Ok(None);
                }
                Some(Err(err)) => return Err(classify(&err, &self.url)),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), LiveError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| classify(&e, &self.url))
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }
}
