//! Persistent interactive shells, one per lab session.
//!
//! A terminal outlives the connections that watch it. Observers come and go
//! through the [`ObserverRegistry`]; the shell only ends on explicit
//! cleanup, when the remote shell exits, or at shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use protocol::{now_millis, EventKind, LabEvent};

use super::observer::{ObserverHandle, ObserverRegistry};
use crate::config::TerminalConfig;
use crate::pool::SshSessionPool;
use crate::ssh::{ChannelEvent, PtyRequest, RemoteChannel, SshError};

/// Queue depth between callers and a terminal's reader task.
const COMMAND_QUEUE: usize = 256;

/// Errors returned by the terminal manager.
#[derive(Error, Debug)]
pub enum TerminalError {
    /// There is no pooled SSH session to open a shell on.
    #[error("no ssh session for {0}")]
    NoSession(String),

    /// No terminal exists for the key.
    #[error("no terminal for {0}")]
    NotFound(String),

    /// The terminal exists but its shell is gone.
    #[error("terminal for {0} is not active")]
    NotActive(String),

    /// The shell channel could not be opened.
    #[error("shell channel failed: {0}")]
    Channel(#[from] SshError),
}

/// Shell parameters for new terminals.
#[derive(Debug, Clone, Default)]
pub struct TerminalSettings {
    pub pty: PtyRequest,
}

impl From<&TerminalConfig> for TerminalSettings {
    fn from(config: &TerminalConfig) -> Self {
        Self {
            pty: PtyRequest {
                term: config.term.clone(),
                cols: config.cols,
                rows: config.rows,
            },
        }
    }
}

/// Work handed to a terminal's reader task, in arrival order.
#[derive(Debug)]
enum TerminalCommand {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
}

/// A running shell and the task pumping it.
struct TerminalSession {
    commands: mpsc::Sender<TerminalCommand>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicBool>,
    created_at: u64,
    last_activity: Arc<AtomicU64>,
}

impl TerminalSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Stops the reader and waits for it to close the channel.
    async fn shutdown(&self) {
        self.cancel.cancel();
        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                tracing::warn!(error = %e, "Terminal reader ended abnormally");
            }
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Summary of a terminal, for status listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub key: String,
    pub active: bool,
    pub created_at: u64,
    pub last_activity: u64,
    pub observer: Option<String>,
}

/// Owns every terminal the daemon runs.
pub struct TerminalSessionManager {
    pool: Arc<SshSessionPool>,
    observers: Arc<ObserverRegistry>,
    settings: TerminalSettings,
    sessions: DashMap<String, Arc<TerminalSession>>,
}

impl TerminalSessionManager {
    pub fn new(
        pool: Arc<SshSessionPool>,
        observers: Arc<ObserverRegistry>,
        settings: TerminalSettings,
    ) -> Self {
        Self {
            pool,
            observers,
            settings,
            sessions: DashMap::new(),
        }
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    /// Opens a shell on the pooled session for `key` and starts streaming it.
    ///
    /// An existing terminal for the key is torn down first.
    pub async fn activate(&self, key: &str) -> Result<(), TerminalError> {
        if let Some((_, old)) = self.sessions.remove(key) {
            tracing::info!(lab_session_id = %key, "Replacing existing terminal");
            old.shutdown().await;
        }

        let pooled = self
            .pool
            .get(key)
            .await
            .map_err(|_| TerminalError::NoSession(key.to_string()))?;

        let channel = pooled.session().open_shell(&self.settings.pty).await?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));
        let now = now_millis();
        let last_activity = Arc::new(AtomicU64::new(now));

        self.pool.promote(key);
        let reader = tokio::spawn(pump(
            key.to_string(),
            channel,
            rx,
            cancel.clone(),
            Arc::clone(&self.observers),
            Arc::clone(&self.pool),
            Arc::clone(&active),
            Arc::clone(&last_activity),
        ));

        let session = Arc::new(TerminalSession {
            commands: tx,
            cancel,
            reader: Mutex::new(Some(reader)),
            active,
            created_at: now,
            last_activity,
        });

        if let Some(raced) = self.sessions.insert(key.to_string(), session) {
            raced.shutdown().await;
        }

        tracing::info!(
            lab_session_id = %key,
            cols = self.settings.pty.cols,
            rows = self.settings.pty.rows,
            "Terminal activated"
        );
        Ok(())
    }

    /// Makes `handle` the observer of the terminal for `key`.
    ///
    /// The observer is told right away that the terminal is ready.
    pub fn attach(&self, key: &str, handle: Arc<ObserverHandle>) -> Result<(), TerminalError> {
        let session = self
            .sessions
            .get(key)
            .map(|s| s.value().clone())
            .ok_or_else(|| TerminalError::NotFound(key.to_string()))?;
        if !session.is_active() {
            return Err(TerminalError::NotActive(key.to_string()));
        }

        let connection_id = handle.connection_id().to_string();
        self.observers.attach(key, handle);
        self.observers.send_event(
            key,
            LabEvent::new(EventKind::TerminalReady, "Terminal reconnected")
                .with_data(json!({ "labSessionId": key })),
        );
        tracing::info!(lab_session_id = %key, connection_id = %connection_id, "Observer attached to terminal");
        Ok(())
    }

    /// Writes observer keystrokes to the shell.
    pub async fn forward_input(&self, key: &str, data: Bytes) -> Result<(), TerminalError> {
        let session = self.active_session(key)?;
        session.touch();
        session
            .commands
            .send(TerminalCommand::Input(data))
            .await
            .map_err(|_| TerminalError::NotActive(key.to_string()))
    }

    pub async fn resize(&self, key: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self.active_session(key)?;
        session
            .commands
            .send(TerminalCommand::Resize { cols, rows })
            .await
            .map_err(|_| TerminalError::NotActive(key.to_string()))
    }

    /// Forgets an observer. The shell keeps running.
    pub fn detach(&self, key: &str, connection_id: &str) -> bool {
        let detached = self.observers.detach(key, connection_id);
        if detached {
            tracing::info!(lab_session_id = %key, connection_id = %connection_id, "Observer detached, terminal kept alive");
        }
        detached
    }

    /// Ends the terminal for `key` and tells its observer.
    ///
    /// Returns false when there was nothing to clean up.
    pub async fn cleanup(&self, key: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(key) else {
            tracing::debug!(lab_session_id = %key, "No terminal to clean up");
            return false;
        };

        session.shutdown().await;
        self.pool.demote(key);
        self.observers.send_event(
            key,
            LabEvent::new(EventKind::TerminalClosed, "Terminal session closed")
                .with_data(json!({ "reason": "lab_ended" })),
        );
        tracing::info!(lab_session_id = %key, "Terminal cleaned up");
        true
    }

    /// Cleans up every terminal. Used at shutdown.
    pub async fn cleanup_all(&self) -> usize {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut cleaned = 0;
        for key in keys {
            if self.cleanup(&key).await {
                cleaned += 1;
            }
        }
        cleaned
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.sessions
            .get(key)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self
            .sessions
            .iter()
            .map(|entry| TerminalInfo {
                key: entry.key().clone(),
                active: entry.is_active(),
                created_at: entry.created_at,
                last_activity: entry.last_activity.load(Ordering::Relaxed),
                observer: self
                    .observers
                    .current(entry.key())
                    .map(|h| h.connection_id().to_string()),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    fn active_session(&self, key: &str) -> Result<Arc<TerminalSession>, TerminalError> {
        let Some(session) = self.sessions.get(key).map(|s| s.value().clone()) else {
            tracing::warn!(lab_session_id = %key, "Input for unknown terminal");
            return Err(TerminalError::NotFound(key.to_string()));
        };
        if !session.is_active() {
            tracing::warn!(lab_session_id = %key, "Input for inactive terminal");
            return Err(TerminalError::NotActive(key.to_string()));
        }
        Ok(session)
    }
}

/// Reader task: owns the shell channel until the terminal ends.
#[allow(clippy::too_many_arguments)]
async fn pump(
    key: String,
    mut channel: Box<dyn RemoteChannel>,
    mut commands: mpsc::Receiver<TerminalCommand>,
    cancel: CancellationToken,
    observers: Arc<ObserverRegistry>,
    pool: Arc<SshSessionPool>,
    active: Arc<AtomicBool>,
    last_activity: Arc<AtomicU64>,
) {
    let mut shell_exited = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            command = commands.recv() => match command {
                Some(TerminalCommand::Input(data)) => {
                    if let Err(e) = channel.write(&data).await {
                        tracing::warn!(lab_session_id = %key, error = %e, "Failed to write to shell");
                    }
                }
                Some(TerminalCommand::Resize { cols, rows }) => {
                    if let Err(e) = channel.resize(cols, rows).await {
                        tracing::debug!(lab_session_id = %key, error = %e, "Resize rejected");
                    }
                }
                None => break,
            },

            event = channel.next_event() => match event {
                Some(ChannelEvent::Stdout(data)) | Some(ChannelEvent::Stderr(data)) => {
                    last_activity.store(now_millis(), Ordering::Relaxed);
                    observers.send_output(&key, data);
                }
                Some(ChannelEvent::ExitStatus(code)) => {
                    tracing::debug!(lab_session_id = %key, exit_code = code, "Shell reported exit status");
                }
                Some(ChannelEvent::Eof) => {}
                Some(ChannelEvent::Closed) | None => {
                    shell_exited = true;
                    break;
                }
            },
        }
    }

    active.store(false, Ordering::SeqCst);
    if let Err(e) = channel.close().await {
        tracing::debug!(lab_session_id = %key, error = %e, "Shell channel already closed");
    }

    if shell_exited {
        tracing::info!(lab_session_id = %key, "Remote shell exited");
        // No shell left on the session, so idle eviction applies again.
        pool.demote(&key);
        observers.send_event(
            &key,
            LabEvent::new(EventKind::TerminalClosed, "Remote shell exited")
                .with_data(json!({ "reason": "shell_exited" })),
        );
    } else {
        tracing::debug!(lab_session_id = %key, "Terminal reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolSettings, RetryPolicy};
    use crate::terminal::ObserverMessage;
    use crate::testing::FakeConnector;
    use crate::tunnel::TunnelTarget;
    use std::time::Duration;

    async fn setup() -> (TerminalSessionManager, Arc<FakeConnector>) {
        let connector = FakeConnector::new();
        let settings = PoolSettings {
            retry: RetryPolicy::once(),
            ..PoolSettings::default()
        };
        let pool = Arc::new(SshSessionPool::new(connector.clone(), settings));
        pool.bind("lab", TunnelTarget::ssh("ns", "pod"));
        pool.get_or_create("lab").await.unwrap();
        let manager = TerminalSessionManager::new(
            pool,
            Arc::new(ObserverRegistry::new()),
            TerminalSettings::default(),
        );
        (manager, connector)
    }

    async fn next_output(rx: &mut mpsc::Receiver<ObserverMessage>) -> Bytes {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("observer channel closed");
            if let ObserverMessage::Output(data) = message {
                return data;
            }
        }
    }

    #[tokio::test]
    async fn test_activate_requires_pooled_session() {
        let (manager, _) = setup().await;
        let err = manager.activate("other").await.unwrap_err();
        assert!(matches!(err, TerminalError::NoSession(_)));
        assert!(!manager.is_active("other"));
    }

    #[tokio::test]
    async fn test_attach_without_terminal_fails() {
        let (manager, _) = setup().await;
        let (handle, _rx) = ObserverHandle::new(8);
        assert!(matches!(
            manager.attach("lab", Arc::new(handle)),
            Err(TerminalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_input_round_trips_to_observer() {
        let (manager, _) = setup().await;
        manager.activate("lab").await.unwrap();

        let (handle, mut rx) = ObserverHandle::new(8);
        manager.attach("lab", Arc::new(handle)).unwrap();
        match rx.recv().await {
            Some(ObserverMessage::Event(event)) => assert_eq!(event.kind, EventKind::TerminalReady),
            other => panic!("expected terminal_ready, got {:?}", other),
        }

        manager
            .forward_input("lab", Bytes::from_static(b"whoami\n"))
            .await
            .unwrap();
        assert_eq!(next_output(&mut rx).await, Bytes::from_static(b"whoami\n"));
    }

    #[tokio::test]
    async fn test_detach_keeps_shell_running() {
        let (manager, connector) = setup().await;
        manager.activate("lab").await.unwrap();

        let (first, _rx1) = ObserverHandle::with_id("conn-1", 8);
        manager.attach("lab", Arc::new(first)).unwrap();
        assert!(manager.detach("lab", "conn-1"));
        assert!(manager.is_active("lab"));

        let (second, mut rx2) = ObserverHandle::with_id("conn-2", 8);
        manager.attach("lab", Arc::new(second)).unwrap();
        manager
            .forward_input("lab", Bytes::from_static(b"pwd\n"))
            .await
            .unwrap();
        assert_eq!(next_output(&mut rx2).await, Bytes::from_static(b"pwd\n"));

        let session = connector.session(0);
        assert_eq!(session.shells_opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resize_reaches_channel() {
        let (manager, connector) = setup().await;
        manager.activate("lab").await.unwrap();
        manager.resize("lab", 120, 40).await.unwrap();
        // Input queued behind the resize proves it was processed.
        let (handle, mut rx) = ObserverHandle::new(8);
        manager.attach("lab", Arc::new(handle)).unwrap();
        manager
            .forward_input("lab", Bytes::from_static(b"x\n"))
            .await
            .unwrap();
        next_output(&mut rx).await;
        let resizes = connector.session(0).resizes.lock().unwrap().clone();
        assert_eq!(resizes, vec![(120, 40)]);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_notifies() {
        let (manager, _) = setup().await;
        manager.activate("lab").await.unwrap();
        let (handle, mut rx) = ObserverHandle::new(8);
        manager.attach("lab", Arc::new(handle)).unwrap();

        assert!(manager.cleanup("lab").await);
        assert!(!manager.cleanup("lab").await);

        let mut kinds = Vec::new();
        while let Ok(ObserverMessage::Event(event)) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds, vec![EventKind::TerminalReady, EventKind::TerminalClosed]);

        let (late, _rx) = ObserverHandle::new(8);
        assert!(matches!(
            manager.attach("lab", Arc::new(late)),
            Err(TerminalError::NotFound(_))
        ));
        assert!(matches!(
            manager.forward_input("lab", Bytes::from_static(b"x")).await,
            Err(TerminalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_exit_marks_inactive() {
        let (manager, _) = setup().await;
        manager.activate("lab").await.unwrap();
        let (handle, mut rx) = ObserverHandle::new(8);
        manager.attach("lab", Arc::new(handle)).unwrap();

        manager
            .forward_input("lab", Bytes::from_static(b"exit\n"))
            .await
            .unwrap();

        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ObserverMessage::Event(event) = message {
                if event.kind == EventKind::TerminalClosed {
                    break;
                }
            }
        }
        assert!(!manager.is_active("lab"));
        assert!(matches!(
            manager.forward_input("lab", Bytes::from_static(b"x")).await,
            Err(TerminalError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_exit_demotes_pooled_session() {
        let (manager, _) = setup().await;
        manager.activate("lab").await.unwrap();
        assert!(manager.pool.snapshot()[0].promoted);

        let (handle, mut rx) = ObserverHandle::new(8);
        manager.attach("lab", Arc::new(handle)).unwrap();
        manager
            .forward_input("lab", Bytes::from_static(b"exit\n"))
            .await
            .unwrap();

        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(message, ObserverMessage::Event(ref e) if e.kind == EventKind::TerminalClosed) {
                break;
            }
        }
        let snapshot = manager.pool.snapshot();
        assert!(snapshot[0].connected);
        assert!(!snapshot[0].promoted);
    }

    #[tokio::test]
    async fn test_reactivate_replaces_terminal() {
        let (manager, connector) = setup().await;
        manager.activate("lab").await.unwrap();
        manager.activate("lab").await.unwrap();

        assert_eq!(manager.len(), 1);
        assert!(manager.is_active("lab"));
        assert_eq!(connector.session(0).shells_opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_all_and_list() {
        let (manager, _) = setup().await;
        manager.activate("lab").await.unwrap();
        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].active);
        assert!(listed[0].observer.is_none());

        assert_eq!(manager.cleanup_all().await, 1);
        assert!(manager.is_empty());
    }
}
