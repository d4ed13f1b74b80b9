//! PID file handling for daemon running detection.
//!
//! The PID file lives at `$XDG_DATA_HOME/labterm/daemon.pid`, falling back
//! to `~/.local/share/labterm/daemon.pid`. Stale files whose process is
//! gone are removed on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("labterm").join("daemon.pid")
}

/// Returns true if a daemon process is currently running.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
pub fn get_daemon_pid() -> Option<u32> {
    read_pid_at(&get_pid_file_path())
}

/// Records the current process as the running daemon.
pub fn write_pid_file() -> io::Result<PathBuf> {
    let path = get_pid_file_path();
    write_pid_at(&path, std::process::id())?;
    Ok(path)
}

/// Removes the PID file if it names the current process.
pub fn remove_pid_file() {
    remove_pid_at(&get_pid_file_path(), std::process::id());
}

fn read_pid_at(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let Ok(pid) = contents.trim().parse::<u32>() else {
        cleanup_stale_pid_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

fn write_pid_at(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid))
}

fn remove_pid_at(path: &Path, pid: u32) {
    // Leave a file written by a newer daemon alone.
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        == Some(pid);
    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid)
            .map(|raw| kill(Pid::from_raw(raw), None).is_ok())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
