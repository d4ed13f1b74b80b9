//! Configuration management for the LabTerm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/labterm/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ssh.username must not be empty")]
    EmptyUsername,

    #[error("ssh.port must be greater than 0")]
    InvalidPort,

    #[error("ssh.connect_timeout_secs must be between 1 and 300, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("pool.idle_ttl_secs must be greater than pool.sweep_interval_secs ({sweep}), got {ttl}")]
    InvalidIdleTtl { ttl: u64, sweep: u64 },

    #[error("pool.sweep_interval_secs must be greater than 0")]
    InvalidSweepInterval,

    #[error("pool.retry_attempts must be between 1 and 100, got {0}")]
    InvalidRetryAttempts(u32),

    #[error("exec.poll_interval_ms must be between 1 and 5000, got {0}")]
    InvalidPollInterval(u64),

    #[error("terminal.cols and terminal.rows must be greater than 0, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("terminal.observer_buffer must be greater than 0")]
    InvalidObserverBuffer,

    #[error("gateway.listen_addr is not a valid socket address: {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the LabTerm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// SSH credentials and transport settings.
    pub ssh: SshConfig,

    /// Session pool behaviour.
    pub pool: PoolConfig,

    /// Command execution settings.
    pub exec: ExecConfig,

    /// Interactive terminal settings.
    pub terminal: TerminalConfig,

    /// Observer WebSocket endpoint.
    pub gateway: GatewayConfig,

    /// Cluster interaction settings.
    pub kubernetes: KubernetesConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// SSH credentials and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub username: String,
    pub password: String,
    /// Port forwarded on the VM pod.
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Missed keepalive replies tolerated before the transport gives up.
    pub keepalive_max: usize,
}

/// Session pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle time after which a pooled session is evicted.
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

/// Command execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    pub default_timeout_secs: i64,
    pub poll_interval_ms: u64,
    /// Maximum characters of captured output shown in events.
    pub display_limit: usize,
    pub validation_timeout_secs: i64,
}

/// Interactive terminal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    /// Per-observer queue depth before output is dropped.
    pub observer_buffer: usize,
}

/// Observer endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// How long provisioning waits for an observer before carrying on.
    pub connect_wait_secs: u64,
}

/// Cluster interaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubernetesConfig {
    pub pod_running_timeout_secs: u64,
    pub pod_poll_interval_secs: u64,
    /// Pause between the stages of lab cleanup.
    pub cleanup_pause_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "ubuntu".to_string(),
            password: "1234".to_string(),
            port: 22,
            connect_timeout_secs: 15,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 300, // 5 minutes
            sweep_interval_secs: 60,
            retry_attempts: 20,
            retry_delay_ms: 3000,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            poll_interval_ms: 100,
            display_limit: 500,
            validation_timeout_secs: 30,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            observer_buffer: 256,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8090".to_string(),
            connect_wait_secs: 30,
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            pod_running_timeout_secs: 120,
            pod_poll_interval_secs: 5,
            cleanup_pause_ms: 1000,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labterm")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LABTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - LABTERM_SSH_USERNAME: Override the VM login user
    /// - LABTERM_SSH_PASSWORD: Override the VM login password
    /// - LABTERM_LISTEN_ADDR: Override the observer endpoint address
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = env_value("LABTERM_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(user) = env_value("LABTERM_SSH_USERNAME") {
            tracing::info!("Overriding ssh.username from environment: {}", user);
            self.ssh.username = user;
        }

        if let Some(password) = env_value("LABTERM_SSH_PASSWORD") {
            tracing::info!("Overriding ssh.password from environment");
            self.ssh.password = password;
        }

        if let Some(addr) = env_value("LABTERM_LISTEN_ADDR") {
            tracing::info!("Overriding gateway.listen_addr from environment: {}", addr);
            self.gateway.listen_addr = addr;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }

        if self.ssh.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.ssh.connect_timeout_secs == 0 || self.ssh.connect_timeout_secs > 300 {
            return Err(ConfigError::InvalidConnectTimeout(
                self.ssh.connect_timeout_secs,
            ));
        }

        if self.pool.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        if self.pool.idle_ttl_secs <= self.pool.sweep_interval_secs {
            return Err(ConfigError::InvalidIdleTtl {
                ttl: self.pool.idle_ttl_secs,
                sweep: self.pool.sweep_interval_secs,
            });
        }

        if self.pool.retry_attempts < 1 || self.pool.retry_attempts > 100 {
            return Err(ConfigError::InvalidRetryAttempts(self.pool.retry_attempts));
        }

        if self.exec.poll_interval_ms == 0 || self.exec.poll_interval_ms > 5000 {
            return Err(ConfigError::InvalidPollInterval(self.exec.poll_interval_ms));
        }

        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.terminal.cols,
                rows: self.terminal.rows,
            });
        }

        if self.terminal.observer_buffer == 0 {
            return Err(ConfigError::InvalidObserverBuffer);
        }

        if self
            .gateway
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::InvalidListenAddr(
                self.gateway.listen_addr.clone(),
            ));
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Reads an environment variable, treating empty values as unset.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
