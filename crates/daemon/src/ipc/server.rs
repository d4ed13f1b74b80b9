//! IPC Server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and hands each request to a
//! [`RequestHandler`], writing back one response per request.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};

/// Answers IPC requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: IpcRequest) -> IpcResponse;
}

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created. A stale socket file at the path is
    /// removed first.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Serves connections until `cancel` fires, then removes the socket file.
    pub fn start(
        self,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(path = %self.path.display(), "IPC server listening");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.accept() => match accepted {
                        Ok(conn) => {
                            let handler = Arc::clone(&handler);
                            tokio::spawn(serve_connection(conn, handler));
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept IPC connection"),
                    },
                }
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(error = %e, "Socket file already gone");
            }
            tracing::info!("IPC server stopped");
        })
    }
}

async fn serve_connection(mut conn: IpcConnection, handler: Arc<dyn RequestHandler>) {
    loop {
        let response = match conn.read_request().await {
            Ok(Some(request)) => {
                tracing::debug!(request = ?request, "IPC request");
                handler.handle(request).await
            }
            Ok(None) => return,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("malformed request: {}", e),
            },
            Err(e) => {
                tracing::debug!(error = %e, "IPC connection failed");
                return;
            }
        };
        if let Err(e) = conn.send_response(&response).await {
            tracing::debug!(error = %e, "Failed to write IPC response");
            return;
        }
    }
}

/// A connection to an IPC client.
///
/// Wraps a Unix stream, reading requests and writing responses as
/// newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(IpcError::Io)?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim()).map_err(IpcError::Json)?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response).map_err(IpcError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(IpcError::Io)?;
        self.writer.flush().await.map_err(IpcError::Io)?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
