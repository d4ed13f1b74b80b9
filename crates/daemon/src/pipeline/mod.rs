//! Lab lifecycle: provisioning, answer validation and teardown.
//!
//! Provisioning walks a lab from "requested" to "terminal ready":
//!
//! ```text
//! 0 wait for observer ─► 1 create resources ─► 2 pod running ─► 3 setup steps
//!                                                                    │
//!             6 terminal ready ◄─ 5 activate terminal ◄─ 4 pre-connect SSH
//! ```
//!
//! Every step reports progress to the lab's observer. A failing step ends
//! the run with a single `error` event.
//!
//! A lab test runs the same setup steps on a throwaway VM over a session
//! that is never pooled, then always deletes the VM's resources.

mod resources;

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;

use protocol::{EventKind, LabEvent, Progress, ProtocolError, ValidationOutcome};

use crate::config::Config;
use crate::events::EventSink;
use crate::exec::CommandExecutor;
use crate::gate::ConnectWaitGate;
use crate::pool::{PoolError, SshSessionPool};
use crate::setup::{SetupOutcome, SetupStatus, SetupStep, SetupStepRunner};
use crate::ssh::{RemoteSession, SessionConnector, SshError};
use crate::terminal::{ObserverRegistry, ObserverSink, TerminalError, TerminalSessionManager};
use crate::tunnel::{PodLocator, TunnelError, TunnelTarget};

pub use resources::{LabRequest, LabResources, NoopLabResources, ResourceError};

/// Number of reported provisioning steps.
pub const PROVISION_STEPS: u32 = 6;

/// Number of reported lab test steps.
pub const LAB_TEST_STEPS: u32 = 4;

/// Path observers connect to for a lab's terminal.
pub fn terminal_url(lab_session_id: &str) -> String {
    format!("/ws/terminal/{}", lab_session_id)
}

/// Errors that end a provisioning run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid setup steps: {0}")]
    InvalidSteps(#[from] ProtocolError),

    #[error("resource creation failed: {0}")]
    Resources(#[from] ResourceError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("lab {0} is already provisioning")]
    AlreadyProvisioning(String),

    #[error("setup aborted after {executed} of {total} steps")]
    SetupAborted { executed: usize, total: usize },

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// Timings and limits for the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub connect_wait: Duration,
    pub pod_running_timeout: Duration,
    pub validation_timeout_secs: i64,
    pub cleanup_pause: Duration,
    pub display_limit: usize,
    pub ssh_port: u16,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_wait: Duration::from_secs(config.gateway.connect_wait_secs),
            pod_running_timeout: Duration::from_secs(config.kubernetes.pod_running_timeout_secs),
            validation_timeout_secs: config.exec.validation_timeout_secs,
            cleanup_pause: Duration::from_millis(config.kubernetes.cleanup_pause_ms),
            display_limit: config.exec.display_limit,
            ssh_port: config.ssh.port,
        }
    }
}

/// Where a lab is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabState {
    Provisioning,
    Ready,
    Failed,
}

impl std::fmt::Display for LabState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LabState::Provisioning => "provisioning",
            LabState::Ready => "ready",
            LabState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A lab known to this daemon.
#[derive(Debug, Clone)]
pub struct LabRecord {
    pub request: LabRequest,
    pub state: LabState,
}

/// Everything the pipeline drives.
pub struct PipelineParts {
    pub resources: Arc<dyn LabResources>,
    pub locator: PodLocator,
    pub pool: Arc<SshSessionPool>,
    /// Opens the unpooled sessions lab tests run on.
    pub connector: Arc<dyn SessionConnector>,
    pub terminals: Arc<TerminalSessionManager>,
    pub gate: Arc<ConnectWaitGate>,
    pub observers: Arc<ObserverRegistry>,
    pub executor: CommandExecutor,
}

/// Runs provisioning, validation and cleanup for lab sessions.
pub struct ProvisioningPipeline {
    resources: Arc<dyn LabResources>,
    locator: PodLocator,
    pool: Arc<SshSessionPool>,
    connector: Arc<dyn SessionConnector>,
    terminals: Arc<TerminalSessionManager>,
    gate: Arc<ConnectWaitGate>,
    observers: Arc<ObserverRegistry>,
    executor: CommandExecutor,
    settings: PipelineSettings,
    labs: DashMap<String, LabRecord>,
}

impl ProvisioningPipeline {
    pub fn new(parts: PipelineParts, settings: PipelineSettings) -> Self {
        Self {
            resources: parts.resources,
            locator: parts.locator,
            pool: parts.pool,
            connector: parts.connector,
            terminals: parts.terminals,
            gate: parts.gate,
            observers: parts.observers,
            executor: parts.executor,
            settings,
            labs: DashMap::new(),
        }
    }

    /// Registers `request` as provisioning.
    ///
    /// Returns false, leaving the lab untouched, when a run for the same
    /// lab is already in flight. Ready and failed labs are replaced.
    pub fn begin(&self, request: &LabRequest) -> bool {
        let record = LabRecord {
            request: request.clone(),
            state: LabState::Provisioning,
        };
        match self.labs.entry(request.lab_session_id.clone()) {
            Entry::Occupied(entry) if entry.get().state == LabState::Provisioning => {
                tracing::warn!(lab_session_id = %request.lab_session_id, "Lab is already provisioning");
                return false;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(record);
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
        true
    }

    /// Brings a lab up to a ready terminal.
    ///
    /// Observers see progress for each step; on failure they get exactly
    /// one `error` event carrying the message of the returned error.
    pub async fn provision(&self, request: LabRequest) -> Result<(), PipelineError> {
        if !self.begin(&request) {
            return Err(PipelineError::AlreadyProvisioning(request.lab_session_id));
        }
        self.provision_begun(request).await
    }

    /// Runs provisioning for a lab already registered with
    /// [`begin`](Self::begin).
    pub async fn provision_begun(&self, request: LabRequest) -> Result<(), PipelineError> {
        let key = request.lab_session_id.clone();
        let sink = ObserverSink::new(Arc::clone(&self.observers), key.clone());

        tracing::info!(
            lab_session_id = %key,
            vm = %request.vm_name,
            namespace = %request.namespace,
            "Provisioning lab"
        );

        let result = self.run_provision(&request, &sink).await;

        let state = match &result {
            Ok(()) => {
                tracing::info!(lab_session_id = %key, "Lab ready");
                LabState::Ready
            }
            Err(e) => {
                tracing::error!(lab_session_id = %key, error = %e, "Provisioning failed");
                sink.emit(
                    LabEvent::error(format!("Failed to provision lab: {}", e))
                        .with_data(json!({ "error": e.to_string() })),
                );
                LabState::Failed
            }
        };
        if let Some(mut record) = self.labs.get_mut(&key) {
            record.state = state;
        }
        result
    }

    async fn run_provision(
        &self,
        request: &LabRequest,
        sink: &dyn EventSink,
    ) -> Result<(), PipelineError> {
        let key = request.lab_session_id.as_str();
        let steps = SetupStep::parse_list(&request.setup_steps)?;

        progress(sink, 0, PROVISION_STEPS, "Waiting for observer to connect...");
        if !self.gate.wait(key, self.settings.connect_wait).await {
            tracing::warn!(
                lab_session_id = %key,
                waited_secs = self.settings.connect_wait.as_secs(),
                "Proceeding without an observer"
            );
        }

        progress(sink, 1, PROVISION_STEPS, "Creating Kubernetes resources...");
        self.resources.create(request).await?;

        progress(sink, 2, PROVISION_STEPS, "Waiting for VM to start...");
        let pod = self
            .locator
            .wait_for_running(
                &request.namespace,
                &request.vm_name,
                self.settings.pod_running_timeout,
            )
            .await?;
        tracing::info!(lab_session_id = %key, pod = %pod, "VM pod running");
        self.pool.bind(
            key,
            TunnelTarget::new(request.namespace.clone(), pod, self.settings.ssh_port),
        );

        if steps.is_empty() {
            tracing::debug!(lab_session_id = %key, "No setup steps");
        } else {
            progress(sink, 3, PROVISION_STEPS, "Executing setup steps...");
            let pooled = self.pool.get_or_create_reporting(key, sink).await?;
            let runner = SetupStepRunner::new(self.executor, self.settings.display_limit);
            let outcome = runner.run(pooled.session().as_ref(), &steps, sink).await;
            if outcome.status == SetupStatus::Aborted {
                return Err(PipelineError::SetupAborted {
                    executed: outcome.executed,
                    total: outcome.total,
                });
            }
        }

        progress(sink, 4, PROVISION_STEPS, "Preparing terminal connection...");
        self.pool.get_or_create_reporting(key, sink).await?;

        progress(sink, 5, PROVISION_STEPS, "Starting terminal session...");
        self.terminals.activate(key).await?;

        progress(sink, 6, PROVISION_STEPS, "Lab environment is ready!");
        let url = terminal_url(key);
        sink.emit(
            LabEvent::new(
                EventKind::TerminalReady,
                format!("Terminal is now available at {}", url),
            )
            .with_data(json!({ "labSessionId": key, "terminalUrl": url })),
        );
        Ok(())
    }

    /// Runs a lab's setup steps on a throwaway VM.
    ///
    /// An aborted setup comes back as an outcome; anything that stops the
    /// steps from running is an error. Either way the observer gets one
    /// `error` event, and the VM's resources are deleted once the run ends.
    pub async fn test_lab(&self, request: LabRequest) -> Result<SetupOutcome, PipelineError> {
        let key = request.lab_session_id.clone();
        let sink = ObserverSink::new(Arc::clone(&self.observers), key.clone());
        tracing::info!(
            lab_session_id = %key,
            vm = %request.vm_name,
            namespace = %request.namespace,
            "Testing lab setup"
        );

        let result = self.run_test(&request, &sink).await;

        sink.emit(LabEvent::info("Cleaning up test resources..."));
        match self.resources.delete(&request).await {
            Ok(()) => sink.emit(LabEvent::info("Test resources cleaned up")),
            Err(e) => {
                tracing::error!(lab_session_id = %key, error = %e, "Failed to delete test resources");
                sink.emit(LabEvent::warning(format!("Cleanup error: {}", e)));
            }
        }

        match &result {
            Ok(outcome) if outcome.completed() => {
                tracing::info!(
                    lab_session_id = %key,
                    executed = outcome.executed,
                    failed = outcome.failed,
                    "Lab test passed"
                );
                sink.emit(LabEvent::info(format!(
                    "Lab test passed: {}/{} steps executed",
                    outcome.executed, outcome.total
                )));
            }
            Ok(outcome) => {
                tracing::warn!(lab_session_id = %key, executed = outcome.executed, total = outcome.total, "Lab test failed");
                sink.emit(LabEvent::error(format!(
                    "Lab test failed: setup aborted after {} of {} steps",
                    outcome.executed, outcome.total
                )));
            }
            Err(e) => {
                tracing::error!(lab_session_id = %key, error = %e, "Lab test failed");
                sink.emit(
                    LabEvent::error(format!("Lab test failed: {}", e))
                        .with_data(json!({ "error": e.to_string() })),
                );
            }
        }
        result
    }

    async fn run_test(
        &self,
        request: &LabRequest,
        sink: &dyn EventSink,
    ) -> Result<SetupOutcome, PipelineError> {
        let key = request.lab_session_id.as_str();
        let steps = SetupStep::parse_list(&request.setup_steps)?;

        progress(sink, 0, LAB_TEST_STEPS, "Waiting for observer to connect...");
        self.gate.wait(key, self.settings.connect_wait).await;

        progress(sink, 1, LAB_TEST_STEPS, "Creating test VM resources...");
        self.resources.create(request).await?;

        progress(sink, 2, LAB_TEST_STEPS, "Waiting for test VM to start...");
        let pod = self
            .locator
            .wait_for_running(
                &request.namespace,
                &request.vm_name,
                self.settings.pod_running_timeout,
            )
            .await?;

        if steps.is_empty() {
            sink.emit(LabEvent::info("No setup steps to execute"));
            return Ok(SetupOutcome {
                executed: 0,
                total: 0,
                failed: 0,
                status: SetupStatus::Succeeded,
            });
        }

        progress(sink, 3, LAB_TEST_STEPS, "Connecting to test VM...");
        let target = TunnelTarget::new(request.namespace.clone(), pod, self.settings.ssh_port);
        let session = self.connect_unpooled(key, &target, sink).await?;

        progress(sink, 4, LAB_TEST_STEPS, "Executing setup steps...");
        let runner = SetupStepRunner::new(self.executor, self.settings.display_limit);
        let outcome = runner.run(session.as_ref(), &steps, sink).await;
        session.disconnect().await;
        tracing::debug!(lab_session_id = %key, "Closed test session");
        Ok(outcome)
    }

    /// Connects straight through the connector, retrying like the pool does.
    async fn connect_unpooled(
        &self,
        key: &str,
        target: &TunnelTarget,
        sink: &dyn EventSink,
    ) -> Result<Arc<dyn RemoteSession>, SshError> {
        let policy = self.pool.settings().retry;
        let max = policy.attempts();
        policy
            .run(|attempt| async move {
                let result = self.connector.connect(target).await;
                if let Err(ref e) = result {
                    tracing::warn!(lab_session_id = %key, attempt, max_attempts = max, error = %e, "Test VM connection attempt failed");
                    if attempt < max {
                        sink.emit(LabEvent::warning(format!(
                            "SSH connection attempt {}/{} failed, retrying",
                            attempt, max
                        )));
                    }
                }
                result
            })
            .await
    }

    /// Runs a validation command and reports whether it exited 0.
    ///
    /// Failures to reach the VM are reported as an incorrect answer with
    /// the error text, never as an error.
    pub async fn validate(
        &self,
        lab_session_id: &str,
        question_id: &str,
        command: &str,
    ) -> ValidationOutcome {
        let result = match self.pool.get_or_create(lab_session_id).await {
            Ok(pooled) => self
                .executor
                .execute(
                    pooled.session().as_ref(),
                    command,
                    self.settings.validation_timeout_secs,
                )
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let outcome = match result {
            Ok(r) => ValidationOutcome {
                lab_session_id: lab_session_id.to_string(),
                question_id: question_id.to_string(),
                is_correct: r.exit_code == 0,
                output: r.stdout,
                error: r.stderr,
            },
            Err(message) => ValidationOutcome {
                lab_session_id: lab_session_id.to_string(),
                question_id: question_id.to_string(),
                is_correct: false,
                output: String::new(),
                error: message,
            },
        };

        tracing::info!(
            lab_session_id = %lab_session_id,
            question_id = %question_id,
            is_correct = outcome.is_correct,
            "Validation finished"
        );
        self.observers.send_event(
            lab_session_id,
            LabEvent::new(
                EventKind::ValidationResult,
                format!("Validation for question {} finished", question_id),
            )
            .with_data(&outcome),
        );
        outcome
    }

    /// Tears a lab down: terminal, then SSH session, then resources.
    ///
    /// Each stage runs even if an earlier one had nothing to do. Returns
    /// false when the lab was not known to this daemon, in which case
    /// resources are left alone.
    pub async fn cleanup(&self, lab_session_id: &str) -> bool {
        tracing::info!(lab_session_id = %lab_session_id, "Cleaning up lab");

        self.terminals.cleanup(lab_session_id).await;
        tokio::time::sleep(self.settings.cleanup_pause).await;

        self.pool.remove(lab_session_id).await;
        tokio::time::sleep(self.settings.cleanup_pause).await;

        let Some((_, record)) = self.labs.remove(lab_session_id) else {
            tracing::warn!(lab_session_id = %lab_session_id, "Unknown lab, leaving resources alone");
            return false;
        };
        if let Err(e) = self.resources.delete(&record.request).await {
            tracing::error!(lab_session_id = %lab_session_id, error = %e, "Failed to delete lab resources");
        }
        tracing::info!(lab_session_id = %lab_session_id, "Lab cleaned up");
        true
    }

    pub fn labs(&self) -> Vec<LabRecord> {
        let mut labs: Vec<LabRecord> = self.labs.iter().map(|e| e.value().clone()).collect();
        labs.sort_by(|a, b| a.request.lab_session_id.cmp(&b.request.lab_session_id));
        labs
    }

    pub fn lab_state(&self, lab_session_id: &str) -> Option<LabState> {
        self.labs.get(lab_session_id).map(|r| r.state)
    }
}

fn progress(sink: &dyn EventSink, step: u32, total: u32, message: &str) {
    sink.emit(LabEvent::new(EventKind::Progress, message).with_data(Progress::new(step, total)));
}
