//! Unix Domain Socket IPC between the CLI and the daemon.
//!
//! Each message is a single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/labterm/daemon.sock`
//! - Fallback: `/tmp/labterm-$UID/daemon.sock`
//!
//! The daemon serves the socket with [`IpcServer::start`], dispatching every
//! request to a [`RequestHandler`]. The CLI talks to it through [`IpcClient`].

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use pidfile::{
    get_daemon_pid, get_pid_file_path, is_daemon_running, remove_pid_file, write_pid_file,
};
pub use server::{IpcConnection, IpcError, IpcServer, RequestHandler};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// `$XDG_RUNTIME_DIR/labterm/daemon.sock` when the runtime dir is set,
/// `/tmp/labterm-$UID/daemon.sock` otherwise.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("labterm")
            .join("daemon.sock")
    } else {
        // Get UID by checking metadata of a file we own
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/labterm-{}", uid)).join("daemon.sock")
    }
}

/// Non-Unix platforms are not supported for Unix Domain Sockets.
#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    // This will fail at runtime on non-Unix platforms
    PathBuf::from("/tmp/labterm-unsupported/daemon.sock")
}
