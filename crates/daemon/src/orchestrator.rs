//! Daemon orchestrator for wiring together all components.
//!
//! The orchestrator builds the session pool, terminal manager, connect
//! gate and provisioning pipeline from configuration, then runs the
//! background pieces: the pool sweeper, the observer gateway and the IPC
//! control socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exec::CommandExecutor;
use crate::gate::ConnectWaitGate;
use crate::gateway::TerminalGateway;
use crate::ipc::{get_socket_path, IpcRequest, IpcResponse, IpcServer, IpcSessionInfo, RequestHandler};
use crate::pipeline::{
    LabRequest, LabResources, NoopLabResources, PipelineParts, PipelineSettings,
    ProvisioningPipeline,
};
use crate::pool::{PoolSettings, SshSessionPool};
use crate::ssh::{SessionConnector, SshSettings, TunnelSshConnector};
use crate::terminal::{ObserverRegistry, TerminalSessionManager, TerminalSettings};
use crate::tunnel::{KubePodDiscovery, PodDiscovery, PodLocator, PortForwardTunnel};

/// How long `stop` waits for background tasks before aborting them.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    /// A provisioning run was started.
    LabAccepted { lab_session_id: String },
    /// A provisioning run ended.
    LabFinished { lab_session_id: String, ready: bool },
    /// A lab was torn down.
    LabCleanedUp { lab_session_id: String },
    Error { message: String },
}

/// External collaborators the daemon talks to.
pub struct Backends {
    pub connector: Arc<dyn SessionConnector>,
    pub discovery: Arc<dyn PodDiscovery>,
    pub resources: Arc<dyn LabResources>,
}

impl Backends {
    /// Connects to the cluster from the ambient kubeconfig or service account.
    pub async fn kubernetes(config: &Config) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        let tunnels = Arc::new(PortForwardTunnel::new(client.clone()));
        let connector = Arc::new(TunnelSshConnector::new(tunnels, SshSettings::from(&config.ssh)));
        Ok(Self {
            connector,
            discovery: Arc::new(KubePodDiscovery::new(client)),
            resources: Arc::new(NoopLabResources),
        })
    }
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    started_at: Instant,
    observers: Arc<ObserverRegistry>,
    pool: Arc<SshSessionPool>,
    terminals: Arc<TerminalSessionManager>,
    gate: Arc<ConnectWaitGate>,
    pipeline: Arc<ProvisioningPipeline>,
    socket_path: PathBuf,
    gateway_addr: Option<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancelled when the daemon shuts down.
    shutdown_token: CancellationToken,
    /// Cancelled when a client asks the daemon to stop.
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator talking to the real cluster.
    pub async fn new(config: Config) -> Result<Self> {
        let backends = Backends::kubernetes(&config).await?;
        Ok(Self::with_backends(config, backends))
    }

    /// Creates an orchestrator over the given backends.
    pub fn with_backends(config: Config, backends: Backends) -> Self {
        let observers = Arc::new(ObserverRegistry::new());
        let pool = Arc::new(SshSessionPool::new(
            Arc::clone(&backends.connector),
            PoolSettings::from(&config.pool),
        ));
        let terminals = Arc::new(TerminalSessionManager::new(
            Arc::clone(&pool),
            Arc::clone(&observers),
            TerminalSettings::from(&config.terminal),
        ));
        let gate = Arc::new(ConnectWaitGate::new(Arc::clone(&observers)));
        let locator = PodLocator::new(
            backends.discovery,
            Duration::from_secs(config.kubernetes.pod_poll_interval_secs),
        );
        let pipeline = Arc::new(ProvisioningPipeline::new(
            PipelineParts {
                resources: backends.resources,
                locator,
                pool: Arc::clone(&pool),
                connector: backends.connector,
                terminals: Arc::clone(&terminals),
                gate: Arc::clone(&gate),
                observers: Arc::clone(&observers),
                executor: CommandExecutor::new(Duration::from_millis(config.exec.poll_interval_ms)),
            },
            PipelineSettings::from(&config),
        ));

        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            started_at: Instant::now(),
            observers,
            pool,
            terminals,
            gate,
            pipeline,
            socket_path: get_socket_path(),
            gateway_addr: None,
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        }
    }

    /// Overrides where the IPC socket is created.
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = path;
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the pool sweeper, the observer gateway and the IPC listener.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let listener = TerminalGateway::bind(&self.config.gateway.listen_addr)
            .await
            .context("Failed to start terminal gateway")?;
        self.gateway_addr = listener.local_addr().ok();

        let ipc = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket {}", self.socket_path.display()))?;

        let mut tasks = self.tasks.lock().await;

        tasks.push(self.pool.start_sweep_task(self.shutdown_token.clone()));
        debug!("Started session sweep task");

        let gateway = Arc::new(TerminalGateway::new(
            Arc::clone(&self.terminals),
            Arc::clone(&self.gate),
            self.config.terminal.observer_buffer,
        ));
        tasks.push(gateway.start(listener, self.shutdown_token.clone()));

        let handler = Arc::new(self.control_handler());
        tasks.push(ipc.start(handler, self.shutdown_token.clone()));
        drop(tasks);

        self.started_at = Instant::now();
        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(
            gateway = ?self.gateway_addr,
            socket = %self.socket_path.display(),
            "Daemon orchestrator started successfully"
        );
        Ok(())
    }

    /// Stops the daemon: closes every terminal and SSH session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        let closed = self.terminals.cleanup_all().await;
        debug!(terminals = closed, "Closed terminals");
        self.pool.disconnect_all().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn control_handler(&self) -> ControlHandler {
        ControlHandler {
            pipeline: Arc::clone(&self.pipeline),
            pool: Arc::clone(&self.pool),
            terminals: Arc::clone(&self.terminals),
            observers: Arc::clone(&self.observers),
            started_at: Instant::now(),
            stop_requested: self.stop_requested.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn pipeline(&self) -> &Arc<ProvisioningPipeline> {
        &self.pipeline
    }

    pub fn pool(&self) -> &Arc<SshSessionPool> {
        &self.pool
    }

    pub fn terminals(&self) -> &Arc<TerminalSessionManager> {
        &self.terminals
    }

    /// Address the observer gateway is bound to, once started.
    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway_addr
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Fires when a client sends `Stop` over IPC.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }
}

/// Answers control requests from the CLI.
struct ControlHandler {
    pipeline: Arc<ProvisioningPipeline>,
    pool: Arc<SshSessionPool>,
    terminals: Arc<TerminalSessionManager>,
    observers: Arc<ObserverRegistry>,
    started_at: Instant,
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl ControlHandler {
    fn provision(&self, request: LabRequest) -> IpcResponse {
        let lab_session_id = request.lab_session_id.clone();
        // Registered before spawning so a second request sees it at once.
        if !self.pipeline.begin(&request) {
            return IpcResponse::Error {
                message: format!("lab {} is already provisioning", lab_session_id),
            };
        }

        let pipeline = Arc::clone(&self.pipeline);
        let event_tx = self.event_tx.clone();
        let id = lab_session_id.clone();
        tokio::spawn(async move {
            let ready = pipeline.provision_begun(request).await.is_ok();
            let _ = event_tx.send(OrchestratorEvent::LabFinished {
                lab_session_id: id,
                ready,
            });
        });

        let _ = self.event_tx.send(OrchestratorEvent::LabAccepted {
            lab_session_id: lab_session_id.clone(),
        });
        IpcResponse::Accepted { lab_session_id }
    }

    async fn test_lab(&self, request: LabRequest) -> IpcResponse {
        let lab_session_id = request.lab_session_id.clone();
        match self.pipeline.test_lab(request).await {
            Ok(outcome) => IpcResponse::LabTested {
                lab_session_id,
                passed: outcome.completed(),
                executed: outcome.executed,
                total: outcome.total,
                failed: outcome.failed,
                error: None,
            },
            Err(e) => IpcResponse::LabTested {
                lab_session_id,
                passed: false,
                executed: 0,
                total: 0,
                failed: 0,
                error: Some(e.to_string()),
            },
        }
    }

    fn sessions(&self) -> Vec<IpcSessionInfo> {
        let pooled = self.pool.snapshot();
        let terminals = self.terminals.list();
        self.pipeline
            .labs()
            .into_iter()
            .map(|lab| {
                let id = lab.request.lab_session_id;
                let ssh = pooled.iter().find(|p| p.key == id);
                let terminal = terminals.iter().find(|t| t.key == id);
                IpcSessionInfo {
                    pod: self.pool.target(&id).map(|t| t.pod_name),
                    ssh_connected: ssh.map(|p| p.connected).unwrap_or(false),
                    idle_secs: ssh.map(|p| p.idle_secs),
                    terminal_active: terminal.map(|t| t.active).unwrap_or(false),
                    observer: self.observers.current(&id).map(|h| h.connection_id().to_string()),
                    vm_name: lab.request.vm_name,
                    namespace: lab.request.namespace,
                    state: lab.state.to_string(),
                    lab_session_id: id,
                }
            })
            .collect()
    }
}

#[async_trait]
impl RequestHandler for ControlHandler {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: self.started_at.elapsed().as_secs(),
                lab_count: self.pipeline.labs().len(),
                ssh_sessions: self.pool.len(),
                terminal_count: self.terminals.len(),
                observer_count: self.observers.len(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.sessions(),
            },
            IpcRequest::Provision { request } => self.provision(request),
            IpcRequest::Cleanup { lab_session_id } => {
                let found = self.pipeline.cleanup(&lab_session_id).await;
                if found {
                    let _ = self.event_tx.send(OrchestratorEvent::LabCleanedUp {
                        lab_session_id: lab_session_id.clone(),
                    });
                }
                IpcResponse::CleanedUp {
                    lab_session_id,
                    found,
                }
            }
            IpcRequest::Validate {
                lab_session_id,
                question_id,
                command,
            } => IpcResponse::Validation {
                outcome: self
                    .pipeline
                    .validate(&lab_session_id, &question_id, &command)
                    .await,
            },
            IpcRequest::TestLab { request } => self.test_lab(request).await,
        }
    }
}
