//! Structured events pushed to observers.
//!
//! Every event is a flat JSON record `{type, message, data, timestamp}` so a
//! browser client can render it without knowing the daemon's internals.
//! Payloads carried in `data` use camelCase keys.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Kind of an observer event, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Progress,
    Warning,
    Error,
    StepStart,
    StepSuccess,
    StepFailed,
    SetupComplete,
    TerminalReady,
    TerminalClosed,
    ValidationResult,
}

impl EventKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::Progress => "progress",
            EventKind::Warning => "warning",
            EventKind::Error => "error",
            EventKind::StepStart => "step_start",
            EventKind::StepSuccess => "step_success",
            EventKind::StepFailed => "step_failed",
            EventKind::SetupComplete => "setup_complete",
            EventKind::TerminalReady => "terminal_ready",
            EventKind::TerminalClosed => "terminal_closed",
            EventKind::ValidationResult => "validation_result",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status or progress event delivered to the observer of a lab session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Human readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Creation time in Unix milliseconds.
    pub timestamp: u64,
}

impl LabEvent {
    /// Creates an event stamped with the current time.
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            timestamp: now_millis(),
        }
    }

    /// Attaches a structured payload.
    pub fn with_data<T: Serialize>(mut self, data: T) -> Self {
        // A payload that fails to serialize is dropped, the event is kept.
        self.data = serde_json::to_value(data).ok();
        self
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventKind::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    /// Serializes the event to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an event from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Pipeline progress payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub current_step: u32,
    pub total_steps: u32,
    pub percentage: u32,
}

impl Progress {
    /// Builds a progress payload, computing the percentage.
    pub fn new(current_step: u32, total_steps: u32) -> Self {
        let percentage = if total_steps == 0 {
            100
        } else {
            (current_step.min(total_steps) * 100) / total_steps
        };
        Self {
            current_step,
            total_steps,
            percentage,
        }
    }
}

/// Payload describing a single setup step result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step_number: u32,
    pub total_steps: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Payload of the final `setup_complete` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupSummary {
    pub executed_steps: u32,
    pub total_steps: u32,
    pub failed_steps: u32,
}

/// Result of a validation command, sent back to whoever asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub lab_session_id: String,
    pub question_id: String,
    pub is_correct: bool,
    pub output: String,
    pub error: String,
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
