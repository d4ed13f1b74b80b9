//! In-memory sessions for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ssh::{ChannelEvent, PtyRequest, RemoteChannel, RemoteSession, SessionConnector, SshError};
use crate::tunnel::{PodDiscovery, PodSummary, TunnelError, TunnelTarget};

/// Events an exec channel produces for a command.
///
/// `echo X` prints X and exits 0, `exit N` exits N, `warn X` prints X on
/// stderr and exits 1, `vanish` closes without an exit status and `hang`
/// never finishes. Anything else exits 127.
pub fn script_for(command: &str) -> Option<Vec<ChannelEvent>> {
    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    let events = match verb {
        "echo" => vec![
            ChannelEvent::Stdout(Bytes::from(format!("{}\n", rest))),
            ChannelEvent::ExitStatus(0),
        ],
        "exit" => vec![ChannelEvent::ExitStatus(rest.trim().parse().unwrap_or(1))],
        "warn" => vec![
            ChannelEvent::Stderr(Bytes::from(format!("{}\n", rest))),
            ChannelEvent::ExitStatus(1),
        ],
        "vanish" => vec![],
        "hang" => return None,
        _ => vec![
            ChannelEvent::Stderr(Bytes::from(format!("{}: command not found\n", verb))),
            ChannelEvent::ExitStatus(127),
        ],
    };
    let mut events = events;
    events.push(ChannelEvent::Eof);
    events.push(ChannelEvent::Closed);
    Some(events)
}

/// Exec channel replaying a fixed script.
pub struct ScriptedChannel {
    events: VecDeque<ChannelEvent>,
    hang: bool,
    pub closed: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteChannel for ScriptedChannel {
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
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Shell channel that echoes each input line back as output.
pub struct EchoShell {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    done: bool,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl EchoShell {
    fn new(resizes: Arc<Mutex<Vec<(u16, u16)>>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            done: false,
            resizes,
        }
    }
}

#[async_trait]
impl RemoteChannel for EchoShell {
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
        if data == b"exit\n" {
            let _ = self.tx.send(ChannelEvent::ExitStatus(0));
            let _ = self.tx.send(ChannelEvent::Closed);
            return Ok(());
        }
        let _ = self
            .tx
            .send(ChannelEvent::Stdout(Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SshError> {
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        let _ = self.tx.send(ChannelEvent::Closed);
        Ok(())
    }
}

/// Session handing out scripted exec channels and echo shells.
#[derive(Default)]
pub struct FakeSession {
    pub commands: Mutex<Vec<String>>,
    pub shells_opened: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub probe_fails: AtomicBool,
    pub dead: AtomicBool,
    pub last_exec_closed: Mutex<Option<Arc<AtomicBool>>>,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn open_exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.commands.lock().unwrap().push(command.to_string());
        let closed = Arc::new(AtomicBool::new(false));
        *self.last_exec_closed.lock().unwrap() = Some(closed.clone());
        let script = script_for(command);
        Ok(Box::new(ScriptedChannel {
            hang: script.is_none(),
            events: script.unwrap_or_default().into(),
            closed,
        }))
    }

    async fn open_shell(&self, _pty: &PtyRequest) -> Result<Box<dyn RemoteChannel>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.shells_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EchoShell::new(self.resizes.clone())))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && self.disconnects.load(Ordering::SeqCst) == 0
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector that fails a set number of times before handing out sessions.
#[derive(Default)]
pub struct FakeConnector {
    pub attempts: AtomicUsize,
    pub failures_left: AtomicUsize,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: usize) -> Arc<Self> {
        let connector = Self::default();
        connector.failures_left.store(times, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, target: &TunnelTarget) -> Result<Arc<dyn RemoteSession>, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SshError::Tunnel(TunnelError::PodNotFound {
                namespace: target.namespace.clone(),
                pod: target.pod_name.clone(),
            }));
        }
        let session = FakeSession::new();
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Discovery that reports a fixed set of running VM pods, found by the
/// `kubevirt.io/vm` label.
#[derive(Default)]
pub struct RunningPods {
    pods: Vec<(String, String)>,
}

impl RunningPods {
    pub fn with(vm: &str, pod: &str) -> Self {
        Self {
            pods: vec![(vm.to_string(), pod.to_string())],
        }
    }
}

#[async_trait]
impl PodDiscovery for RunningPods {
    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, TunnelError> {
        Ok(self
            .pods
            .iter()
            .filter(|(vm, _)| label_selector == format!("kubevirt.io/vm={}", vm))
            .map(|(_, pod)| PodSummary {
                name: pod.clone(),
                phase: Some("Running".to_string()),
            })
            .collect())
    }
}
