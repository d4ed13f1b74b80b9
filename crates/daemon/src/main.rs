//! LabTerm Daemon
//!
//! Headless service that provisions lab VMs, runs their setup scripts and
//! serves their terminals, plus the CLI that controls it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, is_daemon_running, remove_pid_file,
    write_pid_file, IpcClient, IpcRequest, IpcResponse, IpcSessionInfo,
};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::pipeline::LabRequest;
use daemon::setup::SetupStep;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Timeout for quick control requests.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// LabTerm Daemon - remote execution and terminals for Kubernetes lab VMs.
#[derive(Parser, Debug)]
#[command(name = "labterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the LabTerm daemon
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Inspect lab sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Provision a lab and open its terminal
    Provision {
        /// Lab session ID
        lab_session_id: String,

        /// Name of the lab VM
        #[arg(long)]
        vm: String,

        /// Namespace the VM runs in
        #[arg(long, short)]
        namespace: String,

        /// JSON file with the setup steps to run
        #[arg(long, value_name = "FILE")]
        steps_file: Option<PathBuf>,
    },

    /// Tear a lab down
    Cleanup {
        /// Lab session ID
        lab_session_id: String,
    },

    /// Run a validation command against a lab
    Validate {
        /// Lab session ID
        lab_session_id: String,

        /// Question the command validates
        question_id: String,

        /// Shell command; exit code 0 means correct
        command: String,
    },

    /// Run a lab's setup steps on a throwaway VM, then delete it
    TestLab {
        /// Session ID the test reports under
        lab_session_id: String,

        /// Name of the test VM
        #[arg(long)]
        vm: String,

        /// Namespace the test VM runs in
        #[arg(long, short)]
        namespace: String,

        /// JSON file with the setup steps to run
        #[arg(long, value_name = "FILE")]
        steps_file: Option<PathBuf>,
    },
}

/// Subcommands for session inspection.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List known lab sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(cli.verbose, &config)?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Start => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  labterm-daemon stop");
                std::process::exit(1);
            }

            tracing::info!("LabTerm daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config).await?;
            let pid_path = write_pid_file().context("Failed to write PID file")?;
            tracing::debug!(path = %pid_path.display(), "Wrote PID file");

            let result = run_headless(&mut orchestrator).await;
            remove_pid_file();
            result?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!(force, "Stopping daemon");

            let result = if force {
                force_stop_daemon().map(|()| "Daemon forcefully terminated")
            } else {
                graceful_stop_daemon(timeout)
                    .await
                    .map(|()| "Daemon stopped successfully")
            };
            match result {
                Ok(message) => println!("{}", message),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: labterm-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match send_request(IpcRequest::Status).await {
            Ok(IpcResponse::Status {
                running,
                uptime_secs,
                lab_count,
                ssh_sessions,
                terminal_count,
                observer_count,
            }) => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopped" }
                );
                println!("  Uptime:       {}", format_duration(uptime_secs));
                println!("  Labs:         {}", lab_count);
                println!("  SSH sessions: {}", ssh_sessions);
                println!("  Terminals:    {}", terminal_count);
                println!("  Observers:    {}", observer_count);
            }
            Ok(other) => exit_unexpected(other),
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => {
            match send_request(IpcRequest::ListSessions).await {
                Ok(IpcResponse::Sessions { sessions }) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                Ok(other) => exit_unexpected(other),
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Provision {
            lab_session_id,
            vm,
            namespace,
            steps_file,
        } => {
            let request = lab_request(lab_session_id, vm, namespace, steps_file)?;
            match send_request(IpcRequest::Provision { request }).await {
                Ok(IpcResponse::Accepted { lab_session_id }) => {
                    println!("Provisioning started for {}", lab_session_id);
                    println!("Watch progress at /ws/terminal/{}", lab_session_id);
                }
                Ok(other) => exit_unexpected(other),
                Err(e) => {
                    eprintln!("Failed to provision: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Cleanup { lab_session_id } => {
            match send_request(IpcRequest::Cleanup { lab_session_id }).await {
                Ok(IpcResponse::CleanedUp {
                    lab_session_id,
                    found,
                }) => {
                    if found {
                        println!("Lab {} cleaned up", lab_session_id);
                    } else {
                        println!("Lab {} was not known to the daemon", lab_session_id);
                    }
                }
                Ok(other) => exit_unexpected(other),
                Err(e) => {
                    eprintln!("Failed to clean up: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Validate {
            lab_session_id,
            question_id,
            command,
        } => {
            let timeout = validation_wait(&config);
            let socket_path = get_socket_path();
            let mut client = IpcClient::connect_with_timeout(&socket_path, CONTROL_TIMEOUT)
                .await
                .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;
            client.set_timeout(timeout);
            match client.validate(lab_session_id, question_id, command).await? {
                IpcResponse::Validation { outcome } => {
                    println!("{}", if outcome.is_correct { "correct" } else { "incorrect" });
                    if !outcome.output.is_empty() {
                        println!("{}", outcome.output.trim_end());
                    }
                    if !outcome.error.is_empty() {
                        eprintln!("{}", outcome.error.trim_end());
                    }
                    if !outcome.is_correct {
                        std::process::exit(1);
                    }
                }
                other => exit_unexpected(other),
            }
        }
        Commands::TestLab {
            lab_session_id,
            vm,
            namespace,
            steps_file,
        } => {
            let request = lab_request(lab_session_id, vm, namespace, steps_file)?;
            let timeout = lab_test_wait(&config, &request);
            let socket_path = get_socket_path();
            let mut client = IpcClient::connect_with_timeout(&socket_path, CONTROL_TIMEOUT)
                .await
                .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;
            client.set_timeout(timeout);
            println!("Testing lab {} (this waits for the whole run)", request.lab_session_id);
            match client.test_lab(request).await? {
                IpcResponse::LabTested {
                    lab_session_id,
                    passed,
                    executed,
                    total,
                    failed,
                    error,
                } => {
                    match error {
                        Some(error) => println!("Lab test {} failed: {}", lab_session_id, error),
                        None => println!(
                            "Lab test {} {}: {}/{} steps executed, {} failed",
                            lab_session_id,
                            if passed { "passed" } else { "failed" },
                            executed,
                            total,
                            failed
                        ),
                    }
                    if !passed {
                        std::process::exit(1);
                    }
                }
                other => exit_unexpected(other),
            }
        }
    }

    Ok(())
}

/// Builds a lab request, loading setup steps from `steps_file` if given.
fn lab_request(
    lab_session_id: String,
    vm: String,
    namespace: String,
    steps_file: Option<PathBuf>,
) -> anyhow::Result<LabRequest> {
    let request = LabRequest::new(lab_session_id, vm, namespace);
    let Some(path) = steps_file else {
        return Ok(request);
    };
    let steps = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    protocol::parse_descriptors(&steps)
        .with_context(|| format!("Invalid setup steps in {}", path.display()))?;
    Ok(request.with_setup_steps(steps))
}

/// Sets up logging. Returns a guard that must live as long as the process
/// when logs go to a file.
fn init_tracing(verbose: bool, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "labterm-daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// How long the CLI waits for a validation verdict.
fn validation_wait(config: &Config) -> Duration {
    let secs = config.exec.validation_timeout_secs.max(0) as u64;
    Duration::from_secs(secs) + Duration::from_secs(config.ssh.connect_timeout_secs) + CONTROL_TIMEOUT
}

/// How long the CLI waits for a lab test: VM start, SSH retries and
/// every step's own timeout.
fn lab_test_wait(config: &Config, request: &LabRequest) -> Duration {
    let steps: u64 = SetupStep::parse_list(&request.setup_steps)
        .map(|steps| steps.iter().map(|s| s.timeout_seconds.max(0) as u64).sum::<u64>())
        .unwrap_or(0);
    let per_attempt = Duration::from_secs(config.ssh.connect_timeout_secs)
        + Duration::from_millis(config.pool.retry_delay_ms);
    Duration::from_secs(config.gateway.connect_wait_secs)
        + Duration::from_secs(config.kubernetes.pod_running_timeout_secs)
        + per_attempt * config.pool.retry_attempts.max(1)
        + Duration::from_secs(steps)
        + CONTROL_TIMEOUT
}

/// Connects to the daemon and sends one request.
async fn send_request(request: IpcRequest) -> anyhow::Result<IpcResponse> {
    let socket_path = get_socket_path();
    let mut client = IpcClient::connect_with_timeout(&socket_path, CONTROL_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;
    let response = client
        .send(request)
        .await
        .map_err(|e| anyhow::anyhow!("Request failed: {}", e))?;
    if let IpcResponse::Error { message } = response {
        anyhow::bail!("Daemon returned error: {}", message);
    }
    Ok(response)
}

fn exit_unexpected(response: IpcResponse) -> ! {
    eprintln!("Unexpected response from daemon: {:?}", response);
    std::process::exit(1);
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No lab sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.lab_session_id.len())
        .max()
        .unwrap_or(8)
        .clamp(8, 36);
    let pod_width = sessions
        .iter()
        .map(|s| s.pod.as_ref().map(|p| p.len()).unwrap_or(1))
        .max()
        .unwrap_or(3)
        .clamp(3, 40);

    println!(
        "{:<id_width$}  {:<12}  {:<pod_width$}  {:<5}  {:<8}  {:>8}",
        "LAB",
        "STATE",
        "POD",
        "SSH",
        "TERMINAL",
        "IDLE",
        id_width = id_width,
        pod_width = pod_width
    );
    println!("{}", "-".repeat(id_width + pod_width + 49));

    for session in sessions {
        let idle = session
            .idle_secs
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<id_width$}  {:<12}  {:<pod_width$}  {:<5}  {:<8}  {:>8}",
            truncate_str(&session.lab_session_id, id_width),
            session.state,
            truncate_str(session.pod.as_deref().unwrap_or("-"), pod_width),
            if session.ssh_connected { "up" } else { "down" },
            match (session.terminal_active, session.observer.is_some()) {
                (true, true) => "watched",
                (true, false) => "active",
                (false, _) => "-",
            },
            idle,
            id_width = id_width,
            pod_width = pod_width
        );
    }

    println!();
    println!("Total: {} lab(s)", sessions.len());
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();

    let mut client = IpcClient::connect_with_timeout(&socket_path, CONTROL_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message } => {
            anyhow::bail!("Daemon returned error: {}", message);
        }
        _ => {
            anyhow::bail!("Unexpected response from daemon");
        }
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            let _ = std::fs::remove_file(get_pid_file_path());
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}

/// Force stop the daemon using SIGKILL.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = get_pid_file_path();

    if !pid_path.exists() {
        anyhow::bail!("Daemon PID file not found - is the daemon running?");
    }

    let pid_str = std::fs::read_to_string(&pid_path)
        .map_err(|e| anyhow::anyhow!("Failed to read PID file: {}", e))?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid PID in file: {}", e))?;

    kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Runs the daemon until a signal or an IPC stop request arrives.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(state = ?state, "Orchestrator state changed");
                }
                OrchestratorEvent::LabAccepted { lab_session_id } => {
                    tracing::info!(lab_session_id = %lab_session_id, "Provisioning accepted");
                }
                OrchestratorEvent::LabFinished {
                    lab_session_id,
                    ready,
                } => {
                    tracing::info!(lab_session_id = %lab_session_id, ready, "Provisioning finished");
                }
                OrchestratorEvent::LabCleanedUp { lab_session_id } => {
                    tracing::info!(lab_session_id = %lab_session_id, "Lab cleaned up");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!(error = %message, "Orchestrator error");
                }
            }
        }
    });

    let stop_requested = orchestrator.stop_requested();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = stop_requested.cancelled() => {
            tracing::info!("Stop requested by client");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["labterm", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
    }

    #[test]
    fn test_stop_command_defaults() {
        let cli = Cli::try_parse_from(["labterm", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(!force);
                assert_eq!(timeout, 30);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_short_force_and_timeout() {
        let cli = Cli::try_parse_from(["labterm", "stop", "-f", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(force);
                assert_eq!(timeout, 5);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["labterm", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["labterm", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["labterm", "sessions"]).is_err());
    }

    #[test]
    fn test_provision_command() {
        let cli = Cli::try_parse_from([
            "labterm",
            "provision",
            "lab-1",
            "--vm",
            "vm-1",
            "-n",
            "labs",
            "--steps-file",
            "/tmp/steps.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Provision {
                lab_session_id,
                vm,
                namespace,
                steps_file,
            } => {
                assert_eq!(lab_session_id, "lab-1");
                assert_eq!(vm, "vm-1");
                assert_eq!(namespace, "labs");
                assert_eq!(steps_file, Some(PathBuf::from("/tmp/steps.json")));
            }
            _ => panic!("Expected Provision command"),
        }
    }

    #[test]
    fn test_provision_requires_vm_and_namespace() {
        assert!(Cli::try_parse_from(["labterm", "provision", "lab-1"]).is_err());
        assert!(Cli::try_parse_from(["labterm", "provision", "lab-1", "--vm", "vm-1"]).is_err());
    }

    #[test]
    fn test_cleanup_command() {
        let cli = Cli::try_parse_from(["labterm", "cleanup", "lab-1"]).unwrap();
        match cli.command {
            Commands::Cleanup { lab_session_id } => assert_eq!(lab_session_id, "lab-1"),
            _ => panic!("Expected Cleanup command"),
        }
    }

    #[test]
    fn test_validate_command() {
        let cli = Cli::try_parse_from([
            "labterm",
            "validate",
            "lab-1",
            "q7",
            "test -f /etc/hosts",
        ])
        .unwrap();
        match cli.command {
            Commands::Validate {
                lab_session_id,
                question_id,
                command,
            } => {
                assert_eq!(lab_session_id, "lab-1");
                assert_eq!(question_id, "q7");
                assert_eq!(command, "test -f /etc/hosts");
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli =
            Cli::try_parse_from(["labterm", "status", "-v", "--config", "/etc/labterm.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/labterm.toml")));
    }

    #[test]
    fn test_invalid_command_fails() {
        assert!(Cli::try_parse_from(["labterm", "pair"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a-very-long-lab-id", 10), "a-very-...");
    }

    #[test]
    fn test_validation_wait_covers_remote_timeout() {
        let config = Config::default();
        assert!(validation_wait(&config) > Duration::from_secs(30));
    }

    #[test]
    fn test_test_lab_command() {
        let cli = Cli::try_parse_from([
            "labterm",
            "test-lab",
            "test-3",
            "--vm",
            "vm-test-3",
            "--namespace",
            "lab-tests",
        ])
        .unwrap();
        match cli.command {
            Commands::TestLab {
                lab_session_id,
                vm,
                namespace,
                steps_file,
            } => {
                assert_eq!(lab_session_id, "test-3");
                assert_eq!(vm, "vm-test-3");
                assert_eq!(namespace, "lab-tests");
                assert!(steps_file.is_none());
            }
            _ => panic!("Expected TestLab command"),
        }
        assert!(Cli::try_parse_from(["labterm", "test-lab", "test-3"]).is_err());
    }

    #[test]
    fn test_lab_test_wait_grows_with_step_timeouts() {
        let config = Config::default();
        let bare = LabRequest::new("t", "vm", "ns");
        let slow = bare.clone().with_setup_steps(
            r#"[{"stepOrder":1,"title":"Build","setupCommand":"make","timeoutSeconds":900}]"#,
        );
        assert!(lab_test_wait(&config, &bare) > Duration::from_secs(config.kubernetes.pod_running_timeout_secs));
        assert_eq!(
            lab_test_wait(&config, &slow) - lab_test_wait(&config, &bare),
            Duration::from_secs(900)
        );
    }
}
