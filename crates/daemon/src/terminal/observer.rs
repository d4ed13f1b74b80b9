//! Observer connections and the registry of who is watching what.
//!
//! At most one observer is current per lab session. Attaching a new one
//! replaces the old, and a late detach from a replaced connection is
//! ignored, so a reconnect racing its predecessor's teardown keeps working.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use protocol::LabEvent;

use crate::events::EventSink;

/// Default capacity of an observer's outbound queue.
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

/// What gets pushed to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMessage {
    /// A status or progress event.
    Event(LabEvent),
    /// Raw terminal output.
    Output(Bytes),
}

/// Sending side of one observer connection.
#[derive(Debug)]
pub struct ObserverHandle {
    connection_id: String,
    tx: mpsc::Sender<ObserverMessage>,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ObserverHandle {
    /// Creates a handle with a fresh connection id.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ObserverMessage>) {
        Self::with_id(uuid::Uuid::new_v4().to_string(), capacity)
    }

    pub fn with_id(
        connection_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ObserverMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            connection_id: connection_id.into(),
            tx,
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        };
        (handle, rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// True once the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Messages dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queues a message without waiting.
    ///
    /// A full queue drops the message; the first drop of a backpressure
    /// episode is logged. Returns whether the message was queued.
    pub fn try_send(&self, message: ObserverMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(connection_id = %self.connection_id, "Observer recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(connection_id = %self.connection_id, "Observer backpressured, dropping output");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Current observer per lab session.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    observers: DashMap<String, Arc<ObserverHandle>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `handle` the observer for `key`, returning the one it replaced.
    pub fn attach(&self, key: &str, handle: Arc<ObserverHandle>) -> Option<Arc<ObserverHandle>> {
        tracing::debug!(lab_session_id = %key, connection_id = %handle.connection_id(), "Observer attached");
        self.observers.insert(key.to_string(), handle)
    }

    /// Removes the observer for `key` if it is still `connection_id`.
    pub fn detach(&self, key: &str, connection_id: &str) -> bool {
        let removed = self
            .observers
            .remove_if(key, |_, current| current.connection_id() == connection_id)
            .is_some();
        if removed {
            tracing::debug!(lab_session_id = %key, connection_id = %connection_id, "Observer detached");
        } else {
            tracing::debug!(lab_session_id = %key, connection_id = %connection_id, "Ignoring detach of replaced observer");
        }
        removed
    }

    pub fn current(&self, key: &str) -> Option<Arc<ObserverHandle>> {
        self.observers.get(key).map(|h| h.value().clone())
    }

    /// True when an observer is attached and still listening.
    pub fn is_attached(&self, key: &str) -> bool {
        self.observers
            .get(key)
            .map(|h| !h.is_closed())
            .unwrap_or(false)
    }

    /// Pushes an event to the current observer, if any.
    pub fn send_event(&self, key: &str, event: LabEvent) -> bool {
        match self.current(key) {
            Some(handle) => handle.try_send(ObserverMessage::Event(event)),
            None => false,
        }
    }

    /// Pushes terminal output to the current observer, or drops it.
    pub fn send_output(&self, key: &str, data: Bytes) -> bool {
        match self.current(key) {
            Some(handle) => handle.try_send(ObserverMessage::Output(data)),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// Sends events to whoever currently observes one lab session.
#[derive(Debug, Clone)]
pub struct ObserverSink {
    observers: Arc<ObserverRegistry>,
    key: String,
}

impl ObserverSink {
    pub fn new(observers: Arc<ObserverRegistry>, key: impl Into<String>) -> Self {
        Self {
            observers,
            key: key.into(),
        }
    }
}

impl EventSink for ObserverSink {
    fn emit(&self, event: LabEvent) {
        tracing::debug!(lab_session_id = %self.key, kind = %event.kind, message = %event.message, "Lab event");
        self.observers.send_event(&self.key, event);
    }
}
