//! SSH sessions and channels to lab VMs.
//!
//! The rest of the daemon talks to VMs through the traits in this module
//! rather than to russh directly, so the pool, executor and terminal
//! manager can be driven by in-memory sessions in tests.

mod russh_client;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::tunnel::{TunnelError, TunnelTarget};

pub use russh_client::{RusshSession, SshSettings, TunnelSshConnector};

/// Errors raised by SSH sessions and channels.
#[derive(Error, Debug)]
pub enum SshError {
    /// The tunnel under the session could not be opened.
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// The SSH handshake failed.
    #[error("ssh connect failed: {0}")]
    Connect(String),

    /// The handshake did not finish in time.
    #[error("ssh connect timed out after {0}s")]
    ConnectTimeout(u64),

    /// The server rejected the credentials.
    #[error("authentication failed for user {user}")]
    Auth { user: String },

    /// A channel could not be opened or used.
    #[error("channel error: {0}")]
    Channel(String),

    /// The session is no longer connected.
    #[error("session disconnected")]
    Disconnected,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    /// The remote side will send no more data.
    Eof,
    /// The channel is closed. No events follow.
    Closed,
}

/// Pseudo-terminal parameters for an interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// An open channel on a remote session.
#[async_trait]
pub trait RemoteChannel: Send {
    /// Waits for the next event. Returns `None` once the channel is gone.
    ///
    /// Cancel safe: dropping the future loses no event.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    async fn write(&mut self, data: &[u8]) -> Result<(), SshError>;

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SshError>;

    /// Closes the channel. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), SshError>;
}

/// An authenticated SSH connection.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Starts `command` on a fresh exec channel.
    async fn open_exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError>;

    /// Starts a login shell on a fresh channel with a pseudo-terminal.
    async fn open_shell(&self, pty: &PtyRequest) -> Result<Box<dyn RemoteChannel>, SshError>;

    /// Sends a lightweight probe and fails if the server does not answer.
    async fn keepalive(&self) -> Result<(), SshError>;

    fn is_connected(&self) -> bool;

    /// Disconnects the session. Safe to call on a dead session.
    async fn disconnect(&self);
}

/// Builds sessions to tunnel targets.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &TunnelTarget) -> Result<Arc<dyn RemoteSession>, SshError>;
}
