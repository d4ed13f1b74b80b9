//! Interactive terminals and the observers watching them.

mod manager;
mod observer;

pub use manager::{TerminalError, TerminalInfo, TerminalSessionManager, TerminalSettings};
pub use observer::{
    ObserverHandle, ObserverMessage, ObserverRegistry, ObserverSink, DEFAULT_OBSERVER_BUFFER,
};
