//! WebSocket endpoint observers use to watch and drive lab terminals.
//!
//! A single path serves both phases of a lab's life:
//!
//! ```text
//! /ws/terminal/{labSessionId}
//!   text frames   daemon -> observer   JSON LabEvent
//!   binary frames daemon -> observer   raw terminal output
//!   binary frames observer -> daemon   raw keystrokes
//!   text frames   observer -> daemon   ClientFrame JSON, or raw keystrokes
//! ```
//!
//! Connecting before the terminal exists registers a progress-only
//! observer and releases the provisioning connect gate. Connecting while
//! the terminal is live re-attaches to the running shell.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use protocol::{ClientFrame, InboundText, LabEvent};
use serde_json::json;

use crate::gate::ConnectWaitGate;
use crate::terminal::{
    ObserverHandle, ObserverMessage, ObserverRegistry, TerminalError, TerminalSessionManager,
};

/// Path prefix of the terminal endpoint.
pub const TERMINAL_PATH_PREFIX: &str = "/ws/terminal/";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Extracts the lab session id from a request path.
///
/// Query strings are ignored. Empty ids and nested paths are rejected.
pub fn parse_terminal_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or(path);
    let id = path.strip_prefix(TERMINAL_PATH_PREFIX)?;
    let id = id.strip_suffix('/').unwrap_or(id);
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

/// Accepts observer connections and wires them to terminals.
pub struct TerminalGateway {
    terminals: Arc<TerminalSessionManager>,
    observers: Arc<ObserverRegistry>,
    gate: Arc<ConnectWaitGate>,
    observer_buffer: usize,
}

impl TerminalGateway {
    pub fn new(
        terminals: Arc<TerminalSessionManager>,
        gate: Arc<ConnectWaitGate>,
        observer_buffer: usize,
    ) -> Self {
        let observers = Arc::clone(terminals.observers());
        Self {
            terminals,
            observers,
            gate,
            observer_buffer,
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Serves `listener` until `cancel` fires.
    pub fn start(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(addr) = listener.local_addr() {
                tracing::info!(addr = %addr, "Terminal gateway listening");
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&gateway);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_connection(stream, peer, cancel).await {
                                    tracing::debug!(peer = %peer, error = %e, "Observer connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                        }
                    },
                }
            }
            tracing::info!("Terminal gateway stopped");
        })
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let mut key = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match parse_terminal_path(request.uri().path()) {
                Some(id) => {
                    key = Some(id);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("unknown endpoint".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(key) = key else {
            return Ok(());
        };

        let (handle, rx) = ObserverHandle::new(self.observer_buffer);
        let connection_id = handle.connection_id().to_string();
        let handle = Arc::new(handle);

        match self.terminals.attach(&key, Arc::clone(&handle)) {
            Ok(()) => {}
            Err(TerminalError::NotFound(_)) | Err(TerminalError::NotActive(_)) => {
                self.observers.attach(&key, Arc::clone(&handle));
                tracing::info!(lab_session_id = %key, connection_id = %connection_id, peer = %peer, "Observer attached for progress");
            }
            Err(e) => {
                tracing::warn!(lab_session_id = %key, error = %e, "Observer attach failed");
                return Ok(());
            }
        }
        // The registry owns the sender from here on; replacing this observer
        // drops it and ends the writer.
        drop(handle);
        self.gate.signal(&key);

        let (ws_tx, mut ws_rx) = ws.split();
        let mut writer = tokio::spawn(write_loop(rx, ws_tx));
        let mut input_dropped = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut writer => {
                    tracing::debug!(lab_session_id = %key, connection_id = %connection_id, "Observer replaced or gone");
                    break;
                }
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        self.forward(&key, Bytes::from(data), &mut input_dropped).await;
                    }
                    Some(Ok(Message::Text(text))) => match ClientFrame::interpret(&text) {
                        InboundText::Input(data) => {
                            self.forward(&key, Bytes::from(data), &mut input_dropped).await
                        }
                        InboundText::Resize { cols, rows } => {
                            if let Err(e) = self.terminals.resize(&key, cols, rows).await {
                                tracing::debug!(lab_session_id = %key, error = %e, "Resize ignored");
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(lab_session_id = %key, error = %e, "Observer socket error");
                        break;
                    }
                },
            }
        }

        writer.abort();
        self.terminals.detach(&key, &connection_id);
        tracing::info!(lab_session_id = %key, connection_id = %connection_id, "Observer disconnected");
        Ok(())
    }

    /// Writes input to the terminal. The observer is warned once per run
    /// of dropped input; a successful write rearms the warning.
    async fn forward(&self, key: &str, data: Bytes, dropped: &mut bool) {
        match self.terminals.forward_input(key, data).await {
            Ok(()) => *dropped = false,
            Err(e) => {
                tracing::debug!(lab_session_id = %key, error = %e, "Input dropped, no active terminal");
                if !*dropped {
                    *dropped = true;
                    self.observers.send_event(
                        key,
                        LabEvent::warning("Terminal is not active, input dropped")
                            .with_data(json!({ "error": e.to_string() })),
                    );
                }
            }
        }
    }
}

/// Drains an observer queue into the socket until either side goes away.
async fn write_loop<S>(mut rx: mpsc::Receiver<ObserverMessage>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = rx.recv().await {
        let frame = match message {
            ObserverMessage::Event(event) => match event.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode event");
                    continue;
                }
            },
            ObserverMessage::Output(data) => Message::Binary(data.to_vec()),
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Observer socket closed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
