use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

use crate::backoff::Backoff;

/// Global configuration for the relay
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend process and retry settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Levels applied to the backend's output
    #[serde(default)]
    pub logs: LogsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` is run through `sh -c` with the permissions of the relay.
/// Configuration files must come from a trusted source.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Shell command used to start the backend
    #[serde(default = "default_command")]
    pub command: String,

    /// Retry backoff settings
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Enables idempotent request retries. `false` forces zero attempts.
    pub retry: Option<bool>,

    /// Seconds a request may take, retries included
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Seconds to wait for the backend to bind to PORT
    #[serde(default = "default_timeout")]
    pub listen_timeout: u64,

    /// Seconds between SIGINT and SIGKILL when retiring a backend
    #[serde(default = "default_timeout")]
    pub shutdown_timeout: u64,

    /// Directory prepended to the backend's PATH
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,

    /// Largest request body buffered in memory so it can be replayed
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            backoff: BackoffConfig::default(),
            retry: None,
            timeout: default_timeout(),
            listen_timeout: default_timeout(),
            shutdown_timeout: default_timeout(),
            bin_dir: default_bin_dir(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl RelayConfig {
    /// Number of retries after the first attempt
    pub fn attempts(&self) -> u32 {
        if self.retry == Some(false) {
            return 0;
        }
        self.backoff.attempts
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Validate the relay configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err(".command: should not be empty".to_string());
        }

        if self.timeout == 0 {
            return Err(".timeout: should be greater than 0".to_string());
        }

        if self.listen_timeout == 0 {
            return Err(".listen_timeout: should be greater than 0".to_string());
        }

        self.backoff.validate().map_err(|e| format!(".backoff{}", e))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    /// Minimum delay in milliseconds
    #[serde(default = "default_backoff_min")]
    pub min: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_backoff_max")]
    pub max: u64,

    /// Growth factor applied for every attempt
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    /// Retries performed before failing
    #[serde(default = "default_backoff_attempts")]
    pub attempts: u32,

    /// Randomize delays between min and the computed value
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: default_backoff_min(),
            max: default_backoff_max(),
            factor: default_backoff_factor(),
            attempts: default_backoff_attempts(),
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Build the delay generator described by this config
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.min),
            Duration::from_millis(self.max),
            self.factor,
            self.jitter,
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min > self.max {
            return Err(".min: should not exceed .max".to_string());
        }

        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(".factor: should be at least 1".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogsConfig {
    /// Level for lines the backend writes to stdout
    #[serde(default = "default_stdout_level")]
    pub stdout: String,

    /// Level for lines the backend writes to stderr
    #[serde(default = "default_stderr_level")]
    pub stderr: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            stdout: default_stdout_level(),
            stderr: default_stderr_level(),
        }
    }
}

/// Parsed output levels for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevels {
    pub stdout: Level,
    pub stderr: Level,
}

impl Default for LogLevels {
    fn default() -> Self {
        Self {
            stdout: Level::INFO,
            stderr: Level::ERROR,
        }
    }
}

impl LogsConfig {
    pub fn levels(&self) -> Result<LogLevels, String> {
        Ok(LogLevels {
            stdout: parse_level(&self.stdout).map_err(|e| format!(".stdout: {}", e))?,
            stderr: parse_level(&self.stderr).map_err(|e| format!(".stderr: {}", e))?,
        })
    }
}

/// Parse a level name. `fatal` is accepted and maps to error.
pub fn parse_level(s: &str) -> Result<Level, String> {
    let name = s.trim().to_ascii_lowercase();
    if name == "fatal" {
        return Ok(Level::ERROR);
    }
    Level::from_str(&name).map_err(|_| format!("invalid log level {:?}", s))
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_command() -> String {
    "./server".to_string()
}

fn default_timeout() -> u64 {
    15
}

fn default_bin_dir() -> String {
    "node_modules/.bin".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_backoff_min() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_attempts() -> u32 {
    3
}

fn default_stdout_level() -> String {
    "info".to_string()
}

fn default_stderr_level() -> String {
    "error".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.relay.validate() {
            errors.push(format!("relay{}", e));
        }

        if let Err(e) = self.logs.levels() {
            errors.push(format!("logs{}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
