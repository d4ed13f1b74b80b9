//! IPC message types for CLI-daemon communication.
//!
//! Requests and responses are externally tagged JSON enums, one per line.

use serde::{Deserialize, Serialize};

use protocol::ValidationOutcome;

use crate::pipeline::LabRequest;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List known labs with their SSH and terminal state.
    ListSessions,
    /// Start provisioning a lab. Answered as soon as the run is queued.
    Provision { request: LabRequest },
    /// Tear down a lab.
    Cleanup { lab_session_id: String },
    /// Run a validation command and wait for the verdict.
    Validate {
        lab_session_id: String,
        question_id: String,
        command: String,
    },
    /// Run a lab's setup steps on a throwaway VM and wait for the result.
    TestLab { request: LabRequest },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        /// Labs known to the daemon.
        lab_count: usize,
        /// Live pooled SSH sessions.
        ssh_sessions: usize,
        /// Terminals, active or not.
        terminal_count: usize,
        /// Attached observers.
        observer_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Known labs.
    Sessions { sessions: Vec<IpcSessionInfo> },
    /// A provisioning run was started.
    Accepted { lab_session_id: String },
    /// Cleanup finished. `found` is false when the lab was unknown.
    CleanedUp { lab_session_id: String, found: bool },
    /// Verdict of a validation command.
    Validation { outcome: ValidationOutcome },
    /// Result of a lab test. `error` is set when setup never ran.
    LabTested {
        lab_session_id: String,
        passed: bool,
        executed: usize,
        total: usize,
        failed: usize,
        error: Option<String>,
    },
    /// An error occurred processing the request.
    Error { message: String },
}

/// One lab as seen by `sessions list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub lab_session_id: String,
    pub vm_name: String,
    pub namespace: String,
    /// provisioning, ready or failed.
    pub state: String,
    /// Pod the SSH session is bound to, once known.
    pub pod: Option<String>,
    pub ssh_connected: bool,
    /// Seconds since the SSH session was last used.
    pub idle_secs: Option<u64>,
    pub terminal_active: bool,
    /// Connection id of the attached observer.
    pub observer: Option<String>,
}
