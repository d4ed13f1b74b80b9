//! Tunnel targets and the duplex stream handed to the SSH client.

use std::any::Any;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Default SSH port on lab VMs.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Errors that can occur while establishing a tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The target pod does not exist.
    #[error("pod not found: {namespace}/{pod}")]
    PodNotFound { namespace: String, pod: String },

    /// The API server refused or failed the port-forward.
    #[error("port-forward to {target} failed: {message}")]
    Forward { target: String, message: String },

    /// The forward was created but the requested port stream was missing.
    #[error("port {port} has no stream on forward to {target}")]
    PortUnavailable { target: String, port: u16 },

    /// No running pod could be found for a VM.
    #[error("no running pod for vm {vm} in namespace {namespace}")]
    PodNotReady { namespace: String, vm: String },

    /// The Kubernetes client could not be built or queried.
    #[error("kubernetes client error: {0}")]
    Client(String),
}

/// Where a tunnel should lead: a port on a pod in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelTarget {
    pub namespace: String,
    pub pod_name: String,
    pub port: u16,
}

impl TunnelTarget {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            port,
        }
    }

    /// Target for the SSH port of a pod.
    pub fn ssh(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self::new(namespace, pod_name, DEFAULT_SSH_PORT)
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod_name, self.port)
    }
}

/// Any byte stream that can carry a tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> TunnelIo for T {}

/// Duplex byte stream to a pod port.
///
/// A port-forward has no handshake of its own, so a stream that exists is
/// connected. Reads and writes go straight to the forwarded port.
pub struct TunnelStream {
    target: TunnelTarget,
    io: Pin<Box<dyn TunnelIo>>,
    /// Whatever must outlive the stream for it to keep flowing.
    guard: Option<Box<dyn Any + Send>>,
    closed: bool,
}

impl TunnelStream {
    pub fn new<T: TunnelIo + 'static>(target: TunnelTarget, io: T) -> Self {
        Self {
            target,
            io: Box::pin(io),
            guard: None,
            closed: false,
        }
    }

    /// Keeps `guard` alive for as long as the stream is open.
    pub fn with_guard<G: Any + Send>(mut self, guard: G) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        true
    }

    /// Shuts down both directions of the stream.
    ///
    /// Calling this on a stream whose peer already went away, or calling it
    /// twice, is not an error.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.io.shutdown().await {
            tracing::debug!(target = %self.target, error = %e, "Tunnel already closed");
        }
        self.guard.take();
    }
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("target", &self.target)
            .field("closed", &self.closed)
            .finish()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().io.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().io.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().io.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().io.as_mut().poll_shutdown(cx)
    }
}
