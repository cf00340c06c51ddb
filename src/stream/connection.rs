use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::LiveError;
use crate::retry::{RetryExecutor, RetryHooks};
use crate::stream::sse::SseTransport;
use crate::stream::state::{ConnectionState, EventEmitter, EventHandler, HandlerId, StreamEvent};
use crate::stream::websocket::WebSocketTransport;
use crate::stream::StreamConfig;

/// Which concrete transport backs a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Sse,
    WebSocket,
}

/// One live session on a transport: a stream of text frames plus, for
/// bidirectional transports, an outbound lane.
#[async_trait]
pub(crate) trait TransportSession: Send {
    /// Next text frame; `Ok(None)` on clean remote close.
    async fn next_frame(&mut self) -> Result<Option<String>, LiveError>;
    async fn send_text(&mut self, text: String) -> Result<(), LiveError>;
    async fn close(&mut self);
}

/// Factory for sessions; reconnection opens a fresh one each attempt.
#[async_trait]
pub(crate) trait StreamTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn TransportSession>, LiveError>;
}

enum ConnCommand {
    Connect {
        ack: oneshot::Sender<Result<(), LiveError>>,
    },
    Disconnect,
    Send {
        text: String,
        ack: oneshot::Sender<Result<(), LiveError>>,
    },
}

/// A single-endpoint push channel with a shared state machine and
/// automatic reconnection, concrete transports behind
/// [`StreamTransport`].
pub struct StreamConnection {
    kind: StreamKind,
    cmd: mpsc::UnboundedSender<ConnCommand>,
    state: Arc<Mutex<ConnectionState>>,
    emitter: Arc<EventEmitter>,
    // Held for liveness bookkeeping; the actor shuts itself down when
    // the command channel closes.
    _task: JoinHandle<()>,
}

impl StreamConnection {
    pub fn websocket(config: StreamConfig) -> Self {
        let transport = Arc::new(WebSocketTransport::new(
            config.url.clone(),
            config.protocols.clone(),
        ));
        Self::spawn(StreamKind::WebSocket, transport, config)
    }

    pub fn sse(config: StreamConfig) -> Self {
        let transport = Arc::new(SseTransport::new(
            config.url.clone(),
            config.event_types.clone(),
        ));
        Self::spawn(StreamKind::Sse, transport, config)
    }

    fn spawn(
        kind: StreamKind,
        transport: Arc<dyn StreamTransport>,
        config: StreamConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let emitter = Arc::new(EventEmitter::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            kind,
            transport,
            config,
            Arc::clone(&state),
            Arc::clone(&emitter),
            rx,
        ));
        Self {
            kind,
            cmd: tx,
            state,
            emitter,
            _task: task,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    pub fn on(&self, handler: EventHandler) -> HandlerId {
        self.emitter.on(handler)
    }

    pub fn off(&self, id: HandlerId) {
        self.emitter.off(id);
    }

    /// Open the connection; resolves with the initial handshake
    /// result. An initial failure does not trigger reconnection.
    pub async fn connect(&self) -> Result<(), LiveError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd
            .send(ConnCommand::Connect { ack: ack_tx })
            .map_err(|_| LiveError::StreamClosed("connection task has ended".to_string()))?;
        ack_rx
            .await
            .map_err(|_| LiveError::StreamClosed("connection task has ended".to_string()))?
    }

    /// Manual close; suppresses auto-reconnect.
    pub fn disconnect(&self) {
        let _ = self.cmd.send(ConnCommand::Disconnect);
    }

    /// Serialize and transmit a value. Only WebSocket connections can
    /// send, and only while connected.
    pub async fn send(&self, data: &Value) -> Result<(), LiveError> {
        if self.kind != StreamKind::WebSocket {
            return Err(LiveError::Misconfiguration(
                "server-sent streams are receive-only".to_string(),
            ));
        }
        if self.state() != ConnectionState::Connected {
            return Err(LiveError::StreamClosed(
                "cannot send while not connected".to_string(),
            ));
        }
        let text = serde_json::to_string(data)
            .map_err(|e| LiveError::InvalidJson(e.to_string()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd
            .send(ConnCommand::Send {
                text,
                ack: ack_tx,
            })
            .map_err(|_| LiveError::StreamClosed("connection task has ended".to_string()))?;
        ack_rx
            .await
            .map_err(|_| LiveError::StreamClosed("connection task has ended".to_string()))?
    }
}

/// Record the edge and notify, suppressing self-loops.
fn transition(state: &Arc<Mutex<ConnectionState>>, emitter: &EventEmitter, to: ConnectionState) {
    let from = {
        let mut guard = state.lock().expect("connection state lock poisoned");
        let from = *guard;
        if from == to {
            return;
        }
        *guard = to;
        from
    };
    emitter.emit(&StreamEvent::StateChange { from, to });
}

/// Route one inbound frame. WebSocket frames that are not JSON pass
/// through as raw text; SSE frames that are not JSON are an error.
fn handle_frame(kind: StreamKind, emitter: &EventEmitter, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => emitter.emit(&StreamEvent::Message { data: value }),
        Err(err) => match kind {
            StreamKind::WebSocket => emitter.emit(&StreamEvent::Message {
                data: Value::String(text.to_string()),
            }),
            StreamKind::Sse => emitter.emit(&StreamEvent::Error {
                error: LiveError::InvalidJson(format!("event payload is not valid json: {}", err)),
            }),
        },
    }
}

enum SessionEnd {
    /// Owner closed the handle; reconnect is suppressed.
    Manual,
    /// Transport dropped with the given reason.
    Closed(String),
    /// The owning handle is gone; shut the task down.
    Shutdown,
}

enum ReconnectEnd {
    Connected(Box<dyn TransportSession>, u32),
    Failed { attempts: u32, last_error: LiveError },
    Manual,
    Shutdown,
}

async fn run_connection(
    kind: StreamKind,
    transport: Arc<dyn StreamTransport>,
    config: StreamConfig,
    state: Arc<Mutex<ConnectionState>>,
    emitter: Arc<EventEmitter>,
    mut rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let executor = RetryExecutor::new(config.retry.clone());
    let mut session: Option<Box<dyn TransportSession>> = None;
    let mut ever_connected = false;

    loop {
        if let Some(live) = session.take() {
            match drive_session(kind, live, &emitter, &mut rx).await {
                SessionEnd::Shutdown => return,
                SessionEnd::Manual => {
                    transition(&state, &emitter, ConnectionState::Disconnected);
                    emitter.emit(&StreamEvent::Disconnect {
                        reason: "manual close".to_string(),
                    });
                }
                SessionEnd::Closed(reason) => {
                    transition(&state, &emitter, ConnectionState::Disconnected);
                    emitter.emit(&StreamEvent::Disconnect {
                        reason: reason.clone(),
                    });
                    if config.reconnect && ever_connected {
                        match reconnect(
                            &transport,
                            &executor,
                            &state,
                            &emitter,
                            &mut rx,
                            LiveError::StreamClosed(reason),
                        )
                        .await
                        {
                            ReconnectEnd::Connected(new_session, attempts) => {
                                transition(&state, &emitter, ConnectionState::Connected);
                                emitter.emit(&StreamEvent::Connect);
                                emitter.emit(&StreamEvent::Reconnected { attempts });
                                session = Some(new_session);
                            }
                            ReconnectEnd::Failed {
                                attempts,
                                last_error,
                            } => {
                                transition(&state, &emitter, ConnectionState::Failed);
                                emitter.emit(&StreamEvent::Failed {
                                    attempts,
                                    last_error: last_error.to_string(),
                                });
                            }
                            ReconnectEnd::Manual => {
                                transition(&state, &emitter, ConnectionState::Disconnected);
                                emitter.emit(&StreamEvent::Disconnect {
                                    reason: "manual close".to_string(),
                                });
                            }
                            ReconnectEnd::Shutdown => return,
                        }
                    }
                }
            }
        } else {
            match rx.recv().await {
                None => return,
                Some(ConnCommand::Disconnect) => {}
                Some(ConnCommand::Send { ack, .. }) => {
                    let _ = ack.send(Err(LiveError::StreamClosed(
                        "cannot send while not connected".to_string(),
                    )));
                }
                Some(ConnCommand::Connect { ack }) => {
                    transition(&state, &emitter, ConnectionState::Connecting);
                    match transport.open().await {
                        Ok(new_session) => {
                            transition(&state, &emitter, ConnectionState::Connected);
                            emitter.emit(&StreamEvent::Connect);
                            ever_connected = true;
                            session = Some(new_session);
                            let _ = ack.send(Ok(()));
                        }
                        Err(err) => {
                            // Initial failure: no reconnect attempted.
                            transition(&state, &emitter, ConnectionState::Disconnected);
                            emitter.emit(&StreamEvent::Error { error: err.clone() });
                            let _ = ack.send(Err(err));
                        }
                    }
                }
            }
        }
    }
}

/// Pump a connected session until it ends one way or another.
async fn drive_session(
    kind: StreamKind,
    mut session: Box<dyn TransportSession>,
    emitter: &EventEmitter,
    rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
) -> SessionEnd {
    loop {
        tokio::select! {
            frame = session.next_frame() => match frame {
                Ok(Some(text)) => handle_frame(kind, emitter, &text),
                Ok(None) => {
                    debug!("stream closed by remote");
                    return SessionEnd::Closed("closed by remote".to_string());
                }
                Err(err) => {
                    warn!(error = %err, "stream transport error");
                    return SessionEnd::Closed(err.to_string());
                }
            },
            cmd = rx.recv() => match cmd {
                None => {
                    session.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(ConnCommand::Disconnect) => {
                    session.close().await;
                    return SessionEnd::Manual;
                }
                Some(ConnCommand::Connect { ack }) => {
                    // Already connected.
                    let _ = ack.send(Ok(()));
                }
                Some(ConnCommand::Send { text, ack }) => {
                    let _ = ack.send(session.send_text(text).await);
                }
            },
        }
    }
}

/// Executor-driven reconnection, seeded with the disconnect error so
/// the first `reconnecting` event fires before the first backoff sleep.
async fn reconnect(
    transport: &Arc<dyn StreamTransport>,
    executor: &RetryExecutor,
    state: &Arc<Mutex<ConnectionState>>,
    emitter: &Arc<EventEmitter>,
    rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
    seed: LiveError,
) -> ReconnectEnd {
    let cancel = CancelToken::new();
    let attempts = AtomicU32::new(0);
    let mut seed_slot = Some(seed);

    let on_retry = |attempt: u32, delay_ms: u64, _err: &LiveError| {
        transition(state, emitter, ConnectionState::Reconnecting);
        emitter.emit(&StreamEvent::Reconnecting { attempt, delay_ms });
    };
    let on_success = |total: u32| {
        attempts.store(total, Ordering::SeqCst);
    };
    let retry_everything_but_cancellation =
        |err: &LiveError| !matches!(err, LiveError::Cancelled);

    let exec = executor.execute(
        Some(&cancel),
        RetryHooks {
            on_retry: Some(&on_retry),
            on_success: Some(&on_success),
            is_retryable: Some(&retry_everything_but_cancellation),
        },
        || {
            let transport = Arc::clone(transport);
            let state = Arc::clone(state);
            let emitter = Arc::clone(emitter);
            let seed = seed_slot.take();
            async move {
                if let Some(err) = seed {
                    return Err(err);
                }
                transition(&state, &emitter, ConnectionState::Connecting);
                match transport.open().await {
                    Ok(session) => Ok(session),
                    Err(err) => {
                        transition(&state, &emitter, ConnectionState::Reconnecting);
                        Err(err)
                    }
                }
            }
        },
    );
    tokio::pin!(exec);

    let mut manual = false;
    let mut commands_open = true;
    loop {
        tokio::select! {
            result = &mut exec => {
                return match result {
                    Ok(session) => {
                        ReconnectEnd::Connected(session, attempts.load(Ordering::SeqCst))
                    }
                    Err(LiveError::Cancelled) => {
                        if manual {
                            ReconnectEnd::Manual
                        } else {
                            ReconnectEnd::Shutdown
                        }
                    }
                    Err(last_error) => ReconnectEnd::Failed {
                        attempts: executor.policy().max_retries + 1,
                        last_error,
                    },
                };
            }
            cmd = rx.recv(), if commands_open => match cmd {
                None => {
                    commands_open = false;
                    cancel.cancel();
                }
                Some(ConnCommand::Disconnect) => {
                    manual = true;
                    cancel.cancel();
                }
                Some(ConnCommand::Connect { ack }) => {
                    let _ = ack.send(Err(LiveError::StreamClosed(
                        "reconnection already in progress".to_string(),
                    )));
                }
                Some(ConnCommand::Send { ack, .. }) => {
                    let _ = ack.send(Err(LiveError::StreamClosed(
                        "cannot send while not connected".to_string(),
                    )));
                }
            },
        }
    }
}
