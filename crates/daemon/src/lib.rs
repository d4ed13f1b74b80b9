//! # LabTerm Daemon Library
//!
//! Remote execution and persistent terminals for lab VMs running on
//! Kubernetes.
//!
//! ## Overview
//!
//! The daemon reaches each lab VM through a port-forward tunnel to its pod
//! and keeps one long-lived SSH session per lab session. On top of that
//! session it runs setup scripts, validation commands and an interactive
//! shell that observers watch over a WebSocket. Observers may drop and
//! reconnect at any time without losing shell state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  IPC control socket          Terminal gateway (/ws/terminal/id) │
//! │          │                               │                      │
//! │  ┌───────▼──────────────┐   ┌────────────▼───────────────────┐  │
//! │  │ Provisioning pipeline│──►│ Terminal manager + observers   │  │
//! │  └──┬─────────┬─────────┘   └────────────┬───────────────────┘  │
//! │     │         │                          │                      │
//! │  ┌──▼───┐ ┌───▼──────────┐   ┌───────────▼───────────────────┐  │
//! │  │ Gate │ │ Setup runner │──►│ SSH session pool              │  │
//! │  └──────┘ │  + executor  │   └───────────┬───────────────────┘  │
//! │           └──────────────┘               │                      │
//! │                              ┌───────────▼───────────────────┐  │
//! │                              │ Port-forward tunnel to VM pod │  │
//! │                              └───────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config).await?;
//!     orchestrator.start().await?;
//!
//!     orchestrator.stop_requested().cancelled().await;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`tunnel`]: Pod discovery and port-forward tunnels
//! - [`ssh`]: SSH sessions over tunnels
//! - [`pool`]: Per-lab SSH session reuse and idle eviction
//! - [`exec`]: One-shot remote commands with timeouts
//! - [`setup`]: Ordered setup step execution
//! - [`terminal`]: Persistent interactive shells and their observers
//! - [`gate`]: Waiting for an observer before provisioning
//! - [`gateway`]: WebSocket endpoint for observers
//! - [`pipeline`]: Lab provisioning, validation and teardown
//! - [`ipc`]: Local control socket
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod events;
pub mod exec;
pub mod gate;
pub mod gateway;
pub mod ipc;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod setup;
pub mod ssh;
pub mod terminal;
pub mod tunnel;

#[cfg(test)]
mod testing;

// Re-export protocol crate for convenience
pub use protocol;

pub use config::Config;
pub use events::{EventSink, NullSink, RecordingSink};
pub use exec::{CommandExecutor, CommandResult, ExecError};
pub use gate::ConnectWaitGate;
pub use gateway::{GatewayError, TerminalGateway};
pub use orchestrator::{Backends, DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use pipeline::{LabRequest, LabState, PipelineError, ProvisioningPipeline};
pub use pool::{PoolError, SshSessionPool};
pub use setup::{SetupOutcome, SetupStatus, SetupStep, SetupStepRunner};
pub use ssh::{RemoteSession, SessionConnector, SshError};
pub use terminal::{ObserverRegistry, TerminalError, TerminalSessionManager};
pub use tunnel::{PodLocator, TunnelError, TunnelTarget};
