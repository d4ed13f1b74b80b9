//! russh-backed sessions running over port-forward tunnels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Handler, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};

use super::{ChannelEvent, PtyRequest, RemoteChannel, RemoteSession, SessionConnector, SshError};
use crate::config::SshConfig;
use crate::tunnel::{TunnelOpener, TunnelTarget};

/// Upper bound on probes and disconnects against a wedged session.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials and timings for new sessions.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
}

impl From<&SshConfig> for SshSettings {
    fn from(config: &SshConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout(),
            keepalive_interval: config.keepalive_interval(),
            keepalive_max: config.keepalive_max,
        }
    }
}

/// Accepts whatever host key the VM presents.
///
/// The tunnel only reaches the pod after the API server has authorized the
/// port-forward, and lab VMs regenerate host keys on every boot.
struct TrustTunnelHandler;

impl Handler for TrustTunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connects to VMs by running SSH over a tunnel stream.
pub struct TunnelSshConnector {
    tunnels: Arc<dyn TunnelOpener>,
    settings: SshSettings,
}

impl TunnelSshConnector {
    pub fn new(tunnels: Arc<dyn TunnelOpener>, settings: SshSettings) -> Self {
        Self { tunnels, settings }
    }

    async fn handshake(&self, target: &TunnelTarget) -> Result<Handle<TrustTunnelHandler>, SshError> {
        let stream = self.tunnels.open(target).await?;

        let config = Arc::new(Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: self.settings.keepalive_max,
            ..Default::default()
        });

        let mut handle = client::connect_stream(config, stream, TrustTunnelHandler)
            .await
            .map_err(|e| SshError::Connect(e.to_string()))?;

        let auth = handle
            .authenticate_password(self.settings.username.clone(), self.settings.password.clone())
            .await
            .map_err(|e| SshError::Connect(e.to_string()))?;

        if !auth.success() {
            return Err(SshError::Auth {
                user: self.settings.username.clone(),
            });
        }

        Ok(handle)
    }
}

#[async_trait]
impl SessionConnector for TunnelSshConnector {
    async fn connect(&self, target: &TunnelTarget) -> Result<Arc<dyn RemoteSession>, SshError> {
        let handle = tokio::time::timeout(self.settings.connect_timeout, self.handshake(target))
            .await
            .map_err(|_| SshError::ConnectTimeout(self.settings.connect_timeout.as_secs()))??;

        tracing::info!(target = %target, user = %self.settings.username, "SSH session established");

        Ok(Arc::new(RusshSession {
            handle,
            target: target.clone(),
            disconnected: AtomicBool::new(false),
        }))
    }
}

/// An authenticated russh client session.
pub struct RusshSession {
    handle: Handle<TrustTunnelHandler>,
    target: TunnelTarget,
    disconnected: AtomicBool,
}

impl RusshSession {
    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    async fn open_channel(&self) -> Result<Channel<Msg>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn open_exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError> {
        let channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn open_shell(&self, pty: &PtyRequest) -> Result<Box<dyn RemoteChannel>, SshError> {
        let channel = self.open_channel().await?;
        channel
            .request_pty(true, &pty.term, pty.cols as u32, pty.rows as u32, 0, 0, &[])
            .await
            .map_err(|e| SshError::Channel(format!("pty request failed: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| SshError::Channel(format!("shell request failed: {}", e)))?;
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        // A session channel round trip proves the server is still answering.
        let channel = tokio::time::timeout(CONTROL_TIMEOUT, self.open_channel())
            .await
            .map_err(|_| SshError::Disconnected)??;
        if let Err(e) = channel.close().await {
            tracing::debug!(target = %self.target, error = %e, "Probe channel close failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst) && !self.handle.is_closed()
    }

    async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::time::timeout(
            CONTROL_TIMEOUT,
            self.handle.disconnect(Disconnect::ByApplication, "", "en"),
        )
        .await
        {
            Ok(Ok(())) => tracing::debug!(target = %self.target, "SSH session disconnected"),
            Ok(Err(e)) => {
                tracing::debug!(target = %self.target, error = %e, "SSH session already gone")
            }
            Err(_) => {
                tracing::warn!(target = %self.target, "Timeout disconnecting SSH session, dropping it")
            }
        }
    }
}

/// A russh channel adapted to [`RemoteChannel`].
struct RusshChannel {
    channel: Channel<Msg>,
    closed: bool,
}

impl RusshChannel {
    fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel,
            closed: false,
        }
    }
}

#[async_trait]
impl RemoteChannel for RusshChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    ChannelEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Closed,
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
        if self.closed {
            return Err(SshError::Channel("channel closed".to_string()));
        }
        self.channel
            .data(data)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SshError> {
        self.channel
            .window_change(cols as u32, rows as u32, 0, 0)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.channel.eof().await {
            tracing::debug!(error = %e, "Channel eof on closed channel");
        }
        if let Err(e) = self.channel.close().await {
            tracing::debug!(error = %e, "Channel already closed");
        }
        Ok(())
    }
}
