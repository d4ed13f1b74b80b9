//! Pool of SSH sessions keyed by lab session id.
//!
//! Sessions are built lazily on first use, reused while they stay
//! connected, probed periodically and evicted once idle. Each key maps to
//! at most one live session: builders for the same key are serialized by a
//! per-key lock, and a dead entry is removed rather than handed out.

mod retry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use protocol::LabEvent;

use crate::config::PoolConfig;
use crate::events::{EventSink, NullSink};
use crate::ssh::{RemoteSession, SessionConnector, SshError};
use crate::tunnel::TunnelTarget;

pub use retry::RetryPolicy;

/// Errors returned by the session pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// No pod has been bound to the key.
    #[error("no target bound for {0}")]
    UnknownTarget(String),

    /// Every connection attempt failed.
    #[error("ssh connection to {key} failed after {attempts} attempts: {source}")]
    Connect {
        key: String,
        attempts: u32,
        #[source]
        source: SshError,
    },

    /// There is no usable session for the key.
    #[error("no live session for {0}")]
    Stale(String),
}

/// Timings for the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            idle_ttl: config.idle_ttl(),
            sweep_interval: config.sweep_interval(),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_delay()),
        }
    }
}

/// A live session owned by the pool.
pub struct PooledSession {
    key: String,
    session: Arc<dyn RemoteSession>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last use.
    last_used_ms: AtomicU64,
    /// Set while a terminal shell runs on the session.
    promoted: AtomicBool,
}

impl PooledSession {
    fn new(key: String, session: Arc<dyn RemoteSession>) -> Self {
        Self {
            key,
            session,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            promoted: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_used_ms.load(Ordering::SeqCst))
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(elapsed, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .field("promoted", &self.is_promoted())
            .finish()
    }
}

/// Point-in-time view of a pooled session, for status listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledSessionInfo {
    pub key: String,
    pub target: Option<String>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub connected: bool,
    pub promoted: bool,
}

/// Owns every SSH session the daemon holds.
pub struct SshSessionPool {
    connector: Arc<dyn SessionConnector>,
    settings: PoolSettings,
    targets: DashMap<String, TunnelTarget>,
    sessions: DashMap<String, Arc<PooledSession>>,
    build_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SshSessionPool {
    pub fn new(connector: Arc<dyn SessionConnector>, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            targets: DashMap::new(),
            sessions: DashMap::new(),
            build_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Records which pod port sessions for `key` connect to.
    pub fn bind(&self, key: &str, target: TunnelTarget) {
        tracing::debug!(lab_session_id = %key, target = %target, "Bound session target");
        self.targets.insert(key.to_string(), target);
    }

    pub fn target(&self, key: &str) -> Option<TunnelTarget> {
        self.targets.get(key).map(|t| t.clone())
    }

    /// Returns the live session for `key`, building one if needed.
    pub async fn get_or_create(&self, key: &str) -> Result<Arc<PooledSession>, PoolError> {
        self.get_or_create_reporting(key, &NullSink).await
    }

    /// Like [`get_or_create`](Self::get_or_create), reporting failed
    /// attempts to `sink` as warnings.
    pub async fn get_or_create_reporting(
        &self,
        key: &str,
        sink: &dyn EventSink,
    ) -> Result<Arc<PooledSession>, PoolError> {
        if let Some(pooled) = self.live(key).await {
            pooled.touch();
            return Ok(pooled);
        }

        if !self.targets.contains_key(key) {
            return Err(PoolError::UnknownTarget(key.to_string()));
        }

        let lock = self
            .build_locks
            .entry(key.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another builder may have finished while we waited.
        if let Some(pooled) = self.live(key).await {
            pooled.touch();
            return Ok(pooled);
        }

        // The key may have been removed while we waited.
        let target = self
            .target(key)
            .ok_or_else(|| PoolError::UnknownTarget(key.to_string()))?;

        let policy = self.settings.retry;
        let max = policy.attempts();
        let target = &target;
        tracing::info!(lab_session_id = %key, target = %target, "Building SSH session");

        let session = policy
            .run(|attempt| async move {
                let result = self.connector.connect(target).await;
                if let Err(ref e) = result {
                    tracing::warn!(lab_session_id = %key, attempt, max_attempts = max, error = %e, "SSH connection attempt failed");
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
            .map_err(|source| PoolError::Connect {
                key: key.to_string(),
                attempts: max,
                source,
            })?;

        let pooled = Arc::new(PooledSession::new(key.to_string(), session));
        if let Some(old) = self.sessions.insert(key.to_string(), pooled.clone()) {
            old.session.disconnect().await;
        }

        tracing::info!(lab_session_id = %key, "SSH session pooled");
        Ok(pooled)
    }

    /// Returns the live session for `key` without building one.
    pub async fn get(&self, key: &str) -> Result<Arc<PooledSession>, PoolError> {
        match self.live(key).await {
            Some(pooled) => {
                pooled.touch();
                Ok(pooled)
            }
            None => Err(PoolError::Stale(key.to_string())),
        }
    }

    /// Disconnects the session for `key` and forgets its target.
    ///
    /// Does nothing when the key is unknown.
    pub async fn remove(&self, key: &str) {
        // Holding the build lock makes an in-flight build finish before the
        // entry goes, so it cannot insert a session afterwards.
        let lock = self
            .build_locks
            .entry(key.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        self.targets.remove(key);
        self.build_locks.remove(key);
        if let Some((_, pooled)) = self.sessions.remove(key) {
            pooled.session.disconnect().await;
            tracing::info!(lab_session_id = %key, "Removed pooled session");
        }
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

    /// Marks the session as carrying a terminal shell.
    pub fn promote(&self, key: &str) {
        if let Some(pooled) = self.sessions.get(key) {
            pooled.promoted.store(true, Ordering::SeqCst);
        }
    }

    pub fn demote(&self, key: &str) {
        if let Some(pooled) = self.sessions.get(key) {
            pooled.promoted.store(false, Ordering::SeqCst);
            pooled.touch();
        }
    }

    pub fn snapshot(&self) -> Vec<PooledSessionInfo> {
        let mut infos: Vec<PooledSessionInfo> = self
            .sessions
            .iter()
            .map(|entry| {
                let pooled = entry.value();
                PooledSessionInfo {
                    key: entry.key().clone(),
                    target: self.targets.get(entry.key()).map(|t| t.to_string()),
                    age_secs: pooled.created_at.elapsed().as_secs(),
                    idle_secs: pooled.idle_for().as_secs(),
                    connected: pooled.is_connected(),
                    promoted: pooled.is_promoted(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Runs one sweep cycle and returns how many sessions were evicted.
    ///
    /// Idle sessions are disconnected. The rest are probed and dropped if
    /// the probe fails. Sessions carrying a terminal are never idle.
    pub async fn sweep(&self) -> usize {
        let entries: Vec<Arc<PooledSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut evicted = 0;
        for pooled in entries {
            let reason = if !pooled.is_promoted() && pooled.idle_for() > self.settings.idle_ttl {
                Some("idle")
            } else if !pooled.is_connected() {
                Some("disconnected")
            } else if let Err(e) = pooled.session.keepalive().await {
                tracing::debug!(lab_session_id = %pooled.key, error = %e, "Keepalive probe failed");
                Some("keepalive failed")
            } else {
                None
            };

            let Some(reason) = reason else { continue };
            if self.evict(&pooled).await {
                tracing::info!(lab_session_id = %pooled.key, reason, "Evicted pooled session");
                evicted += 1;
            }
        }
        evicted
    }

    /// Starts the periodic sweep.
    pub fn start_sweep_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let interval = pool.settings.sweep_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        pool.sweep().await;
                    }
                }
            }
            tracing::debug!("Session sweep stopped");
        })
    }

    /// Disconnects every session. Targets stay bound.
    pub async fn disconnect_all(&self) {
        let entries: Vec<Arc<PooledSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for pooled in entries {
            self.evict(&pooled).await;
        }
    }

    /// Returns the entry for `key` if it is connected, dropping it if not.
    async fn live(&self, key: &str) -> Option<Arc<PooledSession>> {
        let pooled = self.sessions.get(key).map(|e| e.value().clone())?;
        if pooled.is_connected() {
            return Some(pooled);
        }
        tracing::debug!(lab_session_id = %key, "Dropping disconnected session");
        self.evict(&pooled).await;
        None
    }

    /// Removes exactly this entry and disconnects it.
    async fn evict(&self, pooled: &Arc<PooledSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(&pooled.key, |_, current| Arc::ptr_eq(current, pooled))
            .is_some();
        if removed {
            pooled.session.disconnect().await;
        }
        removed
    }
}
