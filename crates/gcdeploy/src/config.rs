//! Configuration management for gcdeploy.
//!
//! This module provides loading and validation of the `.gcd.toml` project
//! file. The file is discovered by walking from the current directory up to
//! the filesystem root, so the tool can be launched from anywhere inside a
//! project.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::{DeploymentPlan, DeploymentStep};
use crate::resolver::InstanceDescriptor;

/// Name of the project configuration file.
pub const CONFIG_FILE_NAME: &str = ".gcd.toml";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("instance.{0} is required in {CONFIG_FILE_NAME}")]
    MissingInstanceField(&'static str),

    #[error("either command or deployment is required in {CONFIG_FILE_NAME}")]
    MissingCommand,

    #[error("deployment[{0}].command is required in {CONFIG_FILE_NAME}")]
    EmptyStepCommand(usize),

    #[error("session.port must be greater than 0")]
    InvalidPort,

    #[error("session.tick_interval_ms must be between 10 and 1000, got {0}")]
    InvalidTickInterval(u64),

    #[error("session.settle_delay_ms must be at most 600000, got {0}")]
    InvalidSettleDelay(u64),

    #[error("session.shell does not exist: {0}")]
    InvalidShellPath(String),

    #[error("logging.level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure, mirroring `.gcd.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Initial command written to the remote shell when no deployment is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Service account key handed to `gcloud` for the instance lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,

    /// Private key used for SSH authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,

    /// The Compute Engine instance to connect to.
    pub instance: InstanceConfig,

    /// Session timing and shell settings.
    pub session: SessionConfig,

    /// Diagnostic log settings.
    pub logging: LoggingConfig,

    /// Ordered deployment steps run after the remote shell is ready.
    pub deployment: Vec<DeploymentStep>,
}

/// Identity of the target instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct InstanceConfig {
    /// Instance name.
    pub name: String,

    /// Project the instance lives in.
    pub project_id: String,

    /// Zone the instance lives in.
    pub zone: String,

    /// Fixed address; when set the `gcloud` lookup is skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Login user override. Defaults to the local user name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Session timing and shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// SSH port on the instance.
    pub port: u16,

    /// Timeout for the SSH handshake in seconds.
    pub connect_timeout_secs: u64,

    /// Delay after a remote deployment step before the next one is dispatched.
    pub settle_delay_ms: u64,

    /// Delay between the shell being opened and the first command being sent.
    pub shell_warmup_ms: u64,

    /// Interval of the output multiplexer tick.
    pub tick_interval_ms: u64,

    /// Shell used to run local commands.
    pub shell: String,
}

/// Diagnostic log configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: 15,
            settle_delay_ms: 2000,
            shell_warmup_ms: 1000,
            tick_interval_ms: 50,
            shell: default_shell(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn shell_warmup(&self) -> Duration {
        Duration::from_millis(self.shell_warmup_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl InstanceConfig {
    /// Returns the immutable descriptor used for address resolution.
    pub fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor {
            name: self.name.clone(),
            project: self.project_id.clone(),
            zone: self.zone.clone(),
        }
    }
}

/// Returns the shell used for local commands when none is configured.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Returns the default SSH private key path (`~/.ssh/google_compute_engine`).
pub fn default_private_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".ssh")
        .join("google_compute_engine")
}

/// Returns the default log file path.
pub fn default_log_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("gcdeploy")
        .join("gcdeploy.log")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - GCD_SSH_KEY_PATH: Override the SSH private key path
    /// - GCD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - GCD_SHELL: Override the shell used for local commands
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("GCD_SSH_KEY_PATH") {
            if !path.is_empty() {
                tracing::info!("Overriding ssh_key_path from environment: {}", path);
                self.ssh_key_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(level) = std::env::var("GCD_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(shell) = std::env::var("GCD_SHELL") {
            if !shell.is_empty() {
                self.session.shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance.name.is_empty() {
            return Err(ConfigError::MissingInstanceField("name"));
        }
        if self.instance.project_id.is_empty() {
            return Err(ConfigError::MissingInstanceField("project_id"));
        }
        if self.instance.zone.is_empty() {
            return Err(ConfigError::MissingInstanceField("zone"));
        }

        let has_command = self.command.as_deref().is_some_and(|c| !c.is_empty());
        if !has_command && self.deployment.is_empty() {
            return Err(ConfigError::MissingCommand);
        }

        if let Some(index) = self
            .deployment
            .iter()
            .position(|step| step.command.trim().is_empty())
        {
            return Err(ConfigError::EmptyStepCommand(index));
        }

        if self.session.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if !(10..=1000).contains(&self.session.tick_interval_ms) {
            return Err(ConfigError::InvalidTickInterval(
                self.session.tick_interval_ms,
            ));
        }

        if self.session.settle_delay_ms > 600_000 {
            return Err(ConfigError::InvalidSettleDelay(self.session.settle_delay_ms));
        }

        let shell_path = Path::new(&self.session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Walks from `start` up to the root looking for [`CONFIG_FILE_NAME`].
    pub fn discover(start: &Path) -> Result<PathBuf> {
        let mut dir = start;
        loop {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Ok(candidate);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => anyhow::bail!(
                    "{} not found in current directory or parent directories",
                    CONFIG_FILE_NAME
                ),
            }
        }
    }

    /// Load the configuration discovered from the current directory.
    ///
    /// Returns the parsed configuration and the path it was read from.
    pub fn load_discovered() -> Result<(Self, PathBuf)> {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        let path = Self::discover(&cwd)?;
        let config = Self::load(&path)?;
        Ok((config, path))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Returns the SSH key path, falling back to the gcloud default key.
    pub fn ssh_key_path(&self) -> PathBuf {
        self.ssh_key_path
            .clone()
            .unwrap_or_else(default_private_key_path)
    }

    /// Returns the configured deployment steps as a plan.
    pub fn plan(&self) -> DeploymentPlan {
        DeploymentPlan::new(self.deployment.clone())
    }

    /// Returns the initial remote command, if one is configured.
    pub fn initial_command(&self) -> Option<&str> {
        self.command.as_deref().filter(|c| !c.is_empty())
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
