//! Configuration management for the termhub server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Scope;
use crate::session::hub::{HubConfig, DEFAULT_REPLAY_BYTES, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::session::{Geometry, MultiplexerKind};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default geometry must be at least 1x1, got {0}x{1}")]
    InvalidGeometry(u16, u16),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("subscriber_capacity must be greater than 0")]
    InvalidSubscriberCapacity,

    #[error("request_timeout_ms must be greater than 0")]
    InvalidRequestTimeout,

    #[error("poll_interval_ms must be between 10 and 60000, got {0}")]
    InvalidPollInterval(u64),

    #[error("auth token digest must be 64 hex characters, got {0:?}")]
    InvalidTokenDigest(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termhub server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General server configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Buffer broadcast hub tuning.
    pub hub: HubSection,

    /// Local control socket configuration.
    pub control: ControlConfig,

    /// External multiplexer integration.
    pub multiplexer: MultiplexerConfig,

    /// Authorization settings.
    pub auth: AuthConfig,
}

/// General server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory for server data (persisted sessions).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Control socket path. Unset means the per-user runtime directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used when a session is created without a command.
    pub default_shell: String,

    /// Maximum number of concurrent (non-exited) sessions.
    pub max_sessions: usize,

    pub default_cols: u16,
    pub default_rows: u16,

    /// Exited sessions older than this are pruned by the cleanup task.
    pub exit_retention_secs: u64,

    /// How often the cleanup task runs (0 disables it).
    pub cleanup_interval_secs: u64,

    /// Grace period between the kill signal and SIGKILL.
    pub kill_timeout_ms: u64,
}

/// Hub tuning, see [`HubConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSection {
    /// Frames buffered per subscriber before the oldest are dropped.
    pub subscriber_capacity: usize,

    /// Bytes of recent output kept for late subscribers.
    pub replay_bytes: usize,
}

/// Control socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// How long an outgoing request waits for its response.
    pub request_timeout_ms: u64,
}

/// Multiplexer integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Screen polling interval for attached panes.
    pub poll_interval_ms: u64,

    /// Preference order when more than one multiplexer is installed.
    pub priority: Vec<MultiplexerKind>,
}

/// Authorization settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// When false every caller is allowed.
    pub enabled: bool,

    /// Treat the local control socket peer as fully privileged.
    pub trust_local_peer: bool,

    /// Accepted bearer tokens.
    pub tokens: Vec<TokenEntry>,
}

/// An accepted bearer token, stored as its SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenEntry {
    /// Lowercase hex SHA-256 of the token.
    pub sha256: String,
    pub scopes: Vec<Scope>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            control_socket: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 64,
            default_cols: 80,
            default_rows: 24,
            exit_retention_secs: 3600,
            cleanup_interval_secs: 60,
            kill_timeout_ms: 3000,
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            replay_bytes: DEFAULT_REPLAY_BYTES,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            priority: vec![MultiplexerKind::Tmux, MultiplexerKind::Zellij],
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trust_local_peer: true,
            tokens: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Geometry for sessions created without one.
    pub fn default_geometry(&self) -> Geometry {
        Geometry::new(self.default_cols, self.default_rows).unwrap_or_default()
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn exit_retention(&self) -> Duration {
        Duration::from_secs(self.exit_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl HubSection {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            subscriber_capacity: self.subscriber_capacity,
            replay_bytes: self.replay_bytes,
        }
    }
}

impl ControlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl MultiplexerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
}

/// Returns the login shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_CONTROL_SOCKET: Override the control socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(socket) = std::env::var("TERMHUB_CONTROL_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding control_socket from environment: {}", socket);
                self.server.control_socket = Some(PathBuf::from(socket));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry(
                self.session.default_cols,
                self.session.default_rows,
            ));
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if self.hub.subscriber_capacity == 0 {
            return Err(ConfigError::InvalidSubscriberCapacity);
        }

        if self.control.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout);
        }

        let poll = self.multiplexer.poll_interval_ms;
        if !(10..=60_000).contains(&poll) {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        for token in &self.auth.tokens {
            if token.sha256.len() != 64 || hex::decode(&token.sha256).is_err() {
                return Err(ConfigError::InvalidTokenDigest(token.sha256.clone()));
            }
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
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn clear_env() {
        std::env::remove_var("TERMHUB_LOG_LEVEL");
        std::env::remove_var("TERMHUB_CONTROL_SOCKET");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.log_level, "info");
        assert!(config.server.control_socket.is_none());
        assert_eq!(config.session.max_sessions, 64);
        assert_eq!(config.session.default_geometry(), Geometry::default());
        assert_eq!(config.hub.subscriber_capacity, DEFAULT_SUBSCRIBER_CAPACITY);
        assert_eq!(config.control.request_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.multiplexer.priority,
            vec![MultiplexerKind::Tmux, MultiplexerKind::Zellij]
        );
        assert!(!config.auth.enabled);
        assert!(config.auth.trust_local_peer);
    }

    #[test]
    fn test_default_data_dir() {
        let config = ServerConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("termhub"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.session.kill_timeout_ms, 3000);
        assert_eq!(config.hub, HubSection::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = format!(
            r#"
[server]
data_dir = "/custom/data"
log_level = "trace"
control_socket = "/run/termhub.sock"

[session]
default_shell = "/bin/zsh"
max_sessions = 20
default_cols = 132
default_rows = 43
exit_retention_secs = 600
cleanup_interval_secs = 30
kill_timeout_ms = 500

[hub]
subscriber_capacity = 64
replay_bytes = 4096

[control]
request_timeout_ms = 2500

[multiplexer]
poll_interval_ms = 100
priority = ["zellij", "tmux"]

[auth]
enabled = true
trust_local_peer = false

[[auth.tokens]]
sha256 = "{DIGEST}"
scopes = ["view"]
"#
        );
        let config = Config::from_toml(&toml).unwrap();

        assert_eq!(config.server.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(
            config.server.control_socket,
            Some(PathBuf::from("/run/termhub.sock"))
        );
        assert_eq!(config.session.default_shell, "/bin/zsh");
        assert_eq!(config.session.default_geometry(), Geometry::new(132, 43).unwrap());
        assert_eq!(config.session.exit_retention(), Duration::from_secs(600));
        assert_eq!(config.session.kill_timeout(), Duration::from_millis(500));
        assert_eq!(
            config.hub.hub_config(),
            HubConfig {
                subscriber_capacity: 64,
                replay_bytes: 4096
            }
        );
        assert_eq!(config.control.request_timeout_ms, 2500);
        assert_eq!(config.multiplexer.poll_interval(), Duration::from_millis(100));
        assert_eq!(
            config.multiplexer.priority,
            vec![MultiplexerKind::Zellij, MultiplexerKind::Tmux]
        );
        assert!(config.auth.enabled);
        assert!(!config.auth.trust_local_peer);
        assert_eq!(config.auth.tokens.len(), 1);
        assert_eq!(config.auth.tokens[0].scopes, vec![Scope::View]);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nlog_level = \"debug\"\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_unknown_multiplexer() {
        let toml = r#"
[multiplexer]
priority = ["screen"]
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termhub"));
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("TERMHUB_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_control_socket() {
        clear_env();
        std::env::set_var("TERMHUB_CONTROL_SOCKET", "/tmp/custom.sock");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(
            config.server.control_socket,
            Some(PathBuf::from("/tmp/custom.sock"))
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("TERMHUB_LOG_LEVEL", "");
        std::env::set_var("TERMHUB_CONTROL_SOCKET", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    fn valid() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_default_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));
        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));
    }

    #[test]
    fn test_validate_zero_geometry() {
        let mut config = valid();
        config.session.default_cols = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidGeometry(0, 24)));
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid();
        config.session.default_shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );

        config.session.default_shell = "nonexistent_shell_xyz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_in_path() {
        let mut config = valid();
        config.session.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_log_level() {
        let mut config = valid();
        config.server.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.server.log_level = "warning".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("warning".to_string()))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_hub_and_control() {
        let mut config = valid();
        config.hub.subscriber_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSubscriberCapacity));

        let mut config = valid();
        config.control.request_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRequestTimeout));

        let mut config = valid();
        config.multiplexer.poll_interval_ms = 5;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(5)));
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_token_digest() {
        let mut config = valid();
        config.auth.tokens.push(TokenEntry {
            sha256: DIGEST.to_string(),
            scopes: vec![Scope::View],
        });
        assert!(config.validate().is_ok());

        config.auth.tokens.push(TokenEntry {
            sha256: "not-hex".to_string(),
            scopes: vec![Scope::View],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTokenDigest(_))
        ));
    }
}
