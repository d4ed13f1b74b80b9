//! Frames sent by observers over the terminal endpoint.
//!
//! Binary frames are always raw terminal input. Text frames are parsed as a
//! [`ClientFrame`]; text that does not parse is treated as raw input so plain
//! line-oriented clients keep working.

use serde::{Deserialize, Serialize};

/// Control frame sent by an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keystrokes for the remote shell.
    Input { data: String },
    /// Terminal window size change.
    Resize { cols: u16, rows: u16 },
}

/// What an inbound text frame asks the daemon to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundText {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

impl ClientFrame {
    /// Interprets an inbound text frame.
    pub fn interpret(text: &str) -> InboundText {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::Input { data }) => InboundText::Input(data.into_bytes()),
            Ok(ClientFrame::Resize { cols, rows }) => InboundText::Resize { cols, rows },
            Err(_) => InboundText::Input(text.as_bytes().to_vec()),
        }
    }
}
