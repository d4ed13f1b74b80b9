//! Waiting for an observer to show up before provisioning proceeds.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::terminal::ObserverRegistry;

/// Per-key one-shot gates fired when an observer attaches.
pub struct ConnectWaitGate {
    observers: Arc<ObserverRegistry>,
    gates: DashMap<String, Arc<watch::Sender<bool>>>,
}

impl ConnectWaitGate {
    pub fn new(observers: Arc<ObserverRegistry>) -> Self {
        Self {
            observers,
            gates: DashMap::new(),
        }
    }

    /// Waits up to `timeout` for an observer on `key`.
    ///
    /// Returns true at once if one is already attached. The gate is removed
    /// on every exit path, so a later wait starts fresh.
    pub async fn wait(&self, key: &str, timeout: Duration) -> bool {
        // Register before checking, so a signal landing in between is kept.
        let gate = self
            .gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(watch::channel(false).0))
            .clone();
        let mut rx = gate.subscribe();

        let attached = if self.observers.is_attached(key) {
            true
        } else {
            tracing::info!(lab_session_id = %key, timeout_secs = timeout.as_secs(), "Waiting for observer");
            matches!(
                tokio::time::timeout(timeout, rx.wait_for(|fired| *fired)).await,
                Ok(Ok(_))
            )
        };

        self.gates.remove_if(key, |_, current| Arc::ptr_eq(current, &gate));

        if attached {
            tracing::info!(lab_session_id = %key, "Observer attached");
        } else {
            tracing::warn!(lab_session_id = %key, "No observer attached before timeout");
        }
        attached
    }

    /// Fires the gate for `key`. A no-op when nobody is waiting.
    pub fn signal(&self, key: &str) {
        if let Some((_, gate)) = self.gates.remove(key) {
            gate.send_replace(true);
            tracing::debug!(lab_session_id = %key, "Connect gate fired");
        }
    }

    /// Number of gates currently waiting.
    pub fn pending(&self) -> usize {
        self.gates.len()
    }
}
