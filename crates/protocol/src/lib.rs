//! # LabTerm Protocol Library
//!
//! Shared wire types between the LabTerm daemon and the clients that watch
//! and drive lab terminals.
//!
//! ## Overview
//!
//! A lab observer talks to the daemon over a single WebSocket per lab
//! session. Two kinds of traffic share that socket:
//!
//! - **Events** ([`LabEvent`]): JSON text frames describing provisioning
//!   progress, setup step results and terminal lifecycle.
//! - **Terminal bytes**: binary frames carrying raw shell output (server to
//!   client) and raw keystrokes (client to server).
//!
//! ```text
//! ┌──────────────┐   text: LabEvent JSON    ┌──────────────┐
//! │              │ ───────────────────────► │              │
//! │    daemon    │   binary: shell output   │   observer   │
//! │              │ ───────────────────────► │              │
//! │              │ ◄─────────────────────── │              │
//! └──────────────┘  binary / ClientFrame    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`events`]: Observer events and their payloads
//! - [`frames`]: Frames sent by observers
//! - [`steps`]: Setup step descriptors carried by provisioning requests
//! - [`error`]: Error types

pub mod error;
pub mod events;
pub mod frames;
pub mod steps;

pub use error::{ProtocolError, Result};
pub use events::{
    now_millis, EventKind, LabEvent, Progress, SetupSummary, StepReport, ValidationOutcome,
};
pub use frames::{ClientFrame, InboundText};
pub use steps::{parse_descriptors, SetupStepDescriptor};
