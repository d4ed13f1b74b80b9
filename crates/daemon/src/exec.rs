//! Running single commands to completion over an SSH session.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::ssh::{ChannelEvent, RemoteChannel, RemoteSession, SshError};

/// Appended to output cut short for display.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Errors raised while executing a command.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The exec channel could not be opened.
    #[error("exec channel failed: {0}")]
    Channel(#[from] SshError),

    /// The command ran longer than allowed.
    #[error("command timed out after {seconds}s")]
    Timeout { seconds: i64 },
}

/// Output and exit status of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    /// Exit status, or -1 if the channel closed without reporting one.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn display_stdout(&self, max: usize) -> String {
        truncate_for_display(&self.stdout, max)
    }

    pub fn display_stderr(&self, max: usize) -> String {
        truncate_for_display(&self.stderr, max)
    }
}

/// Cuts `s` to at most `max` bytes plus a marker, on a char boundary.
pub fn truncate_for_display(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

/// Executes commands on exec channels, polling for output.
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor {
    poll_interval: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl CommandExecutor {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Runs `command` and collects its output.
    ///
    /// A `timeout_secs` of zero or less disables the timeout. The channel is
    /// closed on every path out of this function.
    pub async fn execute(
        &self,
        session: &dyn RemoteSession,
        command: &str,
        timeout_secs: i64,
    ) -> Result<CommandResult, ExecError> {
        let mut channel = session.open_exec(command).await?;
        tracing::debug!(command = %command, timeout_secs, "Executing command");

        let result = self.collect(channel.as_mut(), timeout_secs).await;

        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "Exec channel close failed");
        }

        match &result {
            Ok(r) => tracing::debug!(command = %command, exit_code = r.exit_code, "Command finished"),
            Err(e) => tracing::warn!(command = %command, error = %e, "Command failed"),
        }
        result
    }

    async fn collect(
        &self,
        channel: &mut dyn RemoteChannel,
        timeout_secs: i64,
    ) -> Result<CommandResult, ExecError> {
        let deadline = (timeout_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(timeout_secs as u64));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<u32> = None;

        loop {
            match tokio::time::timeout(self.poll_interval, channel.next_event()).await {
                Ok(Some(ChannelEvent::Stdout(data))) => stdout.extend_from_slice(&data),
                Ok(Some(ChannelEvent::Stderr(data))) => stderr.extend_from_slice(&data),
                Ok(Some(ChannelEvent::ExitStatus(code))) => exit_code = Some(code),
                // Exit status may still follow EOF.
                Ok(Some(ChannelEvent::Eof)) => {}
                Ok(Some(ChannelEvent::Closed)) | Ok(None) => break,
                Err(_) => {}
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ExecError::Timeout {
                        seconds: timeout_secs,
                    });
                }
            }
        }

        Ok(CommandResult {
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}
