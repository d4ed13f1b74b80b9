//! In-memory lab VMs for integration tests.
//!
//! Exec channels understand a handful of commands. Shell channels behave
//! like a tiny line-oriented shell that remembers `NAME=value` assignments,
//! which is enough to tell a surviving shell from a fresh one.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use daemon::config::Config;
use daemon::ssh::{ChannelEvent, PtyRequest, RemoteChannel, RemoteSession, SessionConnector, SshError};
use daemon::terminal::ObserverMessage;
use daemon::tunnel::{PodDiscovery, PodSummary, TunnelError, TunnelTarget};

/// Config with every wait shortened for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.gateway.listen_addr = "127.0.0.1:0".to_string();
    config.gateway.connect_wait_secs = 0;
    config.kubernetes.cleanup_pause_ms = 0;
    config.kubernetes.pod_poll_interval_secs = 1;
    config.exec.poll_interval_ms = 5;
    config
}

fn exec_script(command: &str) -> Option<Vec<ChannelEvent>> {
    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    let mut events = match verb {
        "true" => vec![ChannelEvent::ExitStatus(0)],
        "echo" => vec![
            ChannelEvent::Stdout(Bytes::from(format!("{}\n", rest))),
            ChannelEvent::ExitStatus(0),
        ],
        "exit" => vec![ChannelEvent::ExitStatus(rest.trim().parse().unwrap_or(1))],
        "sleep" => return None,
        _ => vec![
            ChannelEvent::Stderr(Bytes::from(format!("{}: command not found\n", verb))),
            ChannelEvent::ExitStatus(127),
        ],
    };
    events.push(ChannelEvent::Eof);
    events.push(ChannelEvent::Closed);
    Some(events)
}

struct ExecChannel {
    events: VecDeque<ChannelEvent>,
    hang: bool,
}

#[async_trait]
impl RemoteChannel for ExecChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.events.pop_front()
    }

    async fn write(&mut self, _data: &[u8]) -> Result<(), SshError> {
        Ok(())
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), SshError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        Ok(())
    }
}

/// Shell that keeps variables for as long as the channel lives.
struct LineShell {
    vars: HashMap<String, String>,
    pending: Vec<u8>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    done: bool,
}

impl LineShell {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            vars: HashMap::new(),
            pending: Vec::new(),
            tx,
            rx,
            done: false,
        }
    }

    fn run_line(&mut self, line: &str) {
        let line = line.trim();
        if line == "exit" {
            let _ = self.tx.send(ChannelEvent::ExitStatus(0));
            let _ = self.tx.send(ChannelEvent::Closed);
        } else if let Some(rest) = line.strip_prefix("echo ") {
            let out = match rest.strip_prefix('$') {
                Some(name) => self.vars.get(name).cloned().unwrap_or_default(),
                None => rest.to_string(),
            };
            let _ = self
                .tx
                .send(ChannelEvent::Stdout(Bytes::from(format!("{}\n", out))));
        } else if let Some((name, value)) = line.split_once('=') {
            self.vars.insert(name.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl RemoteChannel for LineShell {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await?;
        if event == ChannelEvent::Closed {
            self.done = true;
        }
        Some(event)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.run_line(&String::from_utf8_lossy(&line));
        }
        Ok(())
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), SshError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        let _ = self.tx.send(ChannelEvent::Closed);
        Ok(())
    }
}

/// One SSH connection to a test VM.
#[derive(Default)]
pub struct VmSession {
    pub commands: Mutex<Vec<String>>,
    pub shells: AtomicUsize,
    pub disconnected: AtomicBool,
}

impl VmSession {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSession for VmSession {
    async fn open_exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.commands.lock().unwrap().push(command.to_string());
        let script = exec_script(command);
        Ok(Box::new(ExecChannel {
            hang: script.is_none(),
            events: script.unwrap_or_default().into(),
        }))
    }

    async fn open_shell(&self, _pty: &PtyRequest) -> Result<Box<dyn RemoteChannel>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.shells.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LineShell::new()))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SshError::Disconnected)
        }
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out [`VmSession`]s and remembering them.
#[derive(Default)]
pub struct VmConnector {
    pub sessions: Mutex<Vec<Arc<VmSession>>>,
    pub targets: Mutex<Vec<TunnelTarget>>,
}

impl VmConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<VmSession> {
        self.sessions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl SessionConnector for VmConnector {
    async fn connect(&self, target: &TunnelTarget) -> Result<Arc<dyn RemoteSession>, SshError> {
        self.targets.lock().unwrap().push(target.clone());
        let session = Arc::new(VmSession::default());
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Discovery reporting one running pod for one VM.
pub struct SinglePod {
    pub vm: String,
    pub pod: String,
}

impl SinglePod {
    pub fn new(vm: &str, pod: &str) -> Arc<Self> {
        Arc::new(Self {
            vm: vm.to_string(),
            pod: pod.to_string(),
        })
    }
}

#[async_trait]
impl PodDiscovery for SinglePod {
    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, TunnelError> {
        if label_selector != format!("kubevirt.io/vm={}", self.vm) {
            return Ok(Vec::new());
        }
        Ok(vec![PodSummary {
            name: self.pod.clone(),
            phase: Some("Running".to_string()),
        }])
    }
}

/// Reads observer messages until terminal output containing `needle`
/// arrives, returning everything seen.
pub async fn output_containing(
    rx: &mut mpsc::Receiver<ObserverMessage>,
    needle: &str,
) -> Vec<ObserverMessage> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("no output containing {:?}; saw {:?}", needle, seen))
            .expect("observer queue closed");
        let found = matches!(
            &message,
            ObserverMessage::Output(data) if String::from_utf8_lossy(data).contains(needle)
        );
        seen.push(message);
        if found {
            return seen;
        }
    }
}
