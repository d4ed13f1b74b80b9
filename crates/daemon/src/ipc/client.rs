//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends commands,
//! receiving responses in a request-response pattern.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;
use crate::pipeline::LabRequest;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when nothing listens on the socket, which usually means the
    /// daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await.map_err(IpcError::Io)?;
        Ok(Self::from_stream(stream, Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
    }

    /// Connect to the daemon, bounding both the connect and every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })?
            .map_err(IpcError::Io)?;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                ))
            })?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request).map_err(IpcError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(IpcError::Io)?;
        self.writer.flush().await.map_err(IpcError::Io)?;

        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(IpcError::Io)?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        let response = serde_json::from_str(line.trim()).map_err(IpcError::Json)?;
        Ok(response)
    }

    /// Returns true if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    pub async fn provision(&mut self, request: LabRequest) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Provision { request }).await
    }

    pub async fn cleanup(&mut self, lab_session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Cleanup { lab_session_id }).await
    }

    /// Runs a validation command. Callers usually raise the timeout first,
    /// since validation waits for the remote command.
    pub async fn validate(
        &mut self,
        lab_session_id: String,
        question_id: String,
        command: String,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Validate {
            lab_session_id,
            question_id,
            command,
        })
        .await
    }

    /// Runs a lab test to completion. Like [`validate`](Self::validate),
    /// this needs a timeout covering the whole run.
    pub async fn test_lab(&mut self, request: LabRequest) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::TestLab { request }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;

    /// Serves exactly one request with a canned response.
    async fn serve_once(
        socket_path: &Path,
        expect: IpcRequest,
        response: IpcResponse,
    ) -> tokio::task::JoinHandle<()> {
        let server = IpcServer::bind(socket_path).await.unwrap();
        tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, expect);
            conn.send_response(&response).await.unwrap();
        })
    }

    #[tokio::test]
    async fn test_client_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let result = IpcClient::connect(&socket_path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = serve_once(&socket_path, IpcRequest::Ping, IpcResponse::Pong).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_status() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = serve_once(
            &socket_path,
            IpcRequest::Status,
            IpcResponse::Status {
                running: true,
                uptime_secs: 100,
                lab_count: 2,
                ssh_sessions: 1,
                terminal_count: 1,
                observer_count: 0,
            },
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        match client.status().await.unwrap() {
            IpcResponse::Status {
                running,
                uptime_secs,
                lab_count,
                ..
            } => {
                assert!(running);
                assert_eq!(uptime_secs, 100);
                assert_eq!(lab_count, 2);
            }
            other => panic!("Expected Status response, got {:?}", other),
        }

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_provision() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let request = LabRequest::new("lab-1", "vm-1", "labs");
        let server = serve_once(
            &socket_path,
            IpcRequest::Provision {
                request: request.clone(),
            },
            IpcResponse::Accepted {
                lab_session_id: "lab-1".to_string(),
            },
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.provision(request).await.unwrap();
        assert_eq!(
            response,
            IpcResponse::Accepted {
                lab_session_id: "lab-1".to_string()
            }
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_cleanup() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = serve_once(
            &socket_path,
            IpcRequest::Cleanup {
                lab_session_id: "lab-1".to_string(),
            },
            IpcResponse::CleanedUp {
                lab_session_id: "lab-1".to_string(),
                found: true,
            },
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.cleanup("lab-1".to_string()).await.unwrap();
        assert!(matches!(response, IpcResponse::CleanedUp { found: true, .. }));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        // Accepts but never answers.
        let _server_handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client =
            IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .unwrap();

        let result = client.ping().await;
        assert!(result.is_err());
    }
}
