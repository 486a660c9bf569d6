//! Configuration loading and validation.
//!
//! Loads `config.toml` (default `~/.switchboard/config.toml`). Every section
//! is `#[serde(default)]`, so a missing or empty file yields a usable config.
//!
//! Precedence: env vars (`SWITCHBOARD_*`) > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Upper bound for timeouts and sweep intervals (one week).
pub const MAX_INTERVAL_SECONDS: u64 = 604_800;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Access broker limits and session lifetime.
    pub broker: BrokerConfig,
    /// Command relay deadlines and queue bounds.
    pub relay: RelayConfig,
    /// Per-client rate limits.
    pub rate_limit: RateLimitConfig,
    /// WebSocket listener settings.
    pub server: ServerConfig,
    /// Filesystem locations for audit and log output.
    pub paths: PathsConfig,
}

/// Access broker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Session lifetime when the approver does not pick one.
    pub session_ttl_seconds: u64,
    /// Maximum number of concurrently active sessions.
    pub max_sessions: usize,
    /// Maximum relayed commands per session.
    pub max_requests_per_session: u64,
    /// Interval of the background expiry sweep.
    pub cleanup_interval_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: 300,
            max_sessions: 16,
            max_requests_per_session: 10_000,
            cleanup_interval_seconds: 60,
        }
    }
}

impl BrokerConfig {
    /// Default session TTL as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    /// Expiry sweep interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

/// Command relay settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Deadline for a one-shot command to receive its result.
    pub command_timeout_seconds: u64,
    /// Maximum silence between two chunks of a stream.
    pub stream_inactivity_timeout_seconds: u64,
    /// Maximum undelivered chunks per stream before it fails with overflow.
    pub max_stream_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 30,
            stream_inactivity_timeout_seconds: 60,
            max_stream_queue_depth: 1024,
        }
    }
}

impl RelayConfig {
    /// One-shot command deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Stream inactivity deadline.
    pub fn stream_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_inactivity_timeout_seconds)
    }
}

/// Rate limiter ceilings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per client in any trailing 60 seconds.
    pub requests_per_minute: u32,
    /// Token cost allowed per client in any trailing 60 seconds.
    pub tokens_per_minute: u64,
    /// Interval of the stale-entry sweep.
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            sweep_interval_seconds: 300,
        }
    }
}

/// WebSocket listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,
    /// Deadline for a client to complete the WebSocket handshake.
    pub handshake_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_owned(),
            handshake_timeout_seconds: 10,
        }
    }
}

impl ServerConfig {
    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Output locations. Relative paths are resolved against the config directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Append-only JSON-lines audit file.
    pub audit_log: PathBuf,
    /// Directory for rotated JSON application logs.
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            audit_log: PathBuf::from("audit.jsonl"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Parse a TOML string into config (no env overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrongly typed values.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        override_parsed(
            &env,
            "SWITCHBOARD_SESSION_TTL_SECONDS",
            &mut self.broker.session_ttl_seconds,
        );
        override_parsed(&env, "SWITCHBOARD_MAX_SESSIONS", &mut self.broker.max_sessions);
        override_parsed(
            &env,
            "SWITCHBOARD_MAX_REQUESTS_PER_SESSION",
            &mut self.broker.max_requests_per_session,
        );
        override_parsed(
            &env,
            "SWITCHBOARD_CLEANUP_INTERVAL_SECONDS",
            &mut self.broker.cleanup_interval_seconds,
        );
        override_parsed(
            &env,
            "SWITCHBOARD_COMMAND_TIMEOUT_SECONDS",
            &mut self.relay.command_timeout_seconds,
        );
        override_parsed(
            &env,
            "SWITCHBOARD_STREAM_INACTIVITY_TIMEOUT_SECONDS",
            &mut self.relay.stream_inactivity_timeout_seconds,
        );
        override_parsed(
            &env,
            "SWITCHBOARD_RATE_LIMIT_REQUESTS_PER_MINUTE",
            &mut self.rate_limit.requests_per_minute,
        );
        override_parsed(
            &env,
            "SWITCHBOARD_RATE_LIMIT_TOKENS_PER_MINUTE",
            &mut self.rate_limit.tokens_per_minute,
        );
        if let Some(v) = env("SWITCHBOARD_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = env("SWITCHBOARD_AUDIT_LOG") {
            self.paths.audit_log = PathBuf::from(v);
        }
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.session_ttl_seconds == 0 {
            anyhow::bail!("broker.session_ttl_seconds must be greater than zero");
        }
        if self.broker.max_sessions == 0 {
            anyhow::bail!("broker.max_sessions must be greater than zero");
        }
        check_interval(
            "broker.cleanup_interval_seconds",
            self.broker.cleanup_interval_seconds,
        )?;
        check_interval(
            "relay.command_timeout_seconds",
            self.relay.command_timeout_seconds,
        )?;
        check_interval(
            "relay.stream_inactivity_timeout_seconds",
            self.relay.stream_inactivity_timeout_seconds,
        )?;
        check_interval(
            "rate_limit.sweep_interval_seconds",
            self.rate_limit.sweep_interval_seconds,
        )?;
        check_interval(
            "server.handshake_timeout_seconds",
            self.server.handshake_timeout_seconds,
        )?;
        if self.relay.max_stream_queue_depth == 0 {
            anyhow::bail!("relay.max_stream_queue_depth must be greater than zero");
        }
        if self.rate_limit.requests_per_minute == 0 {
            anyhow::bail!("rate_limit.requests_per_minute must be greater than zero");
        }
        self.server
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("server.bind is not a socket address: {}", self.server.bind))?;
        Ok(())
    }

    /// Resolve relative paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.paths.audit_log.is_relative() {
            self.paths.audit_log = base.join(&self.paths.audit_log);
        }
        if self.paths.logs_dir.is_relative() {
            self.paths.logs_dir = base.join(&self.paths.logs_dir);
        }
    }
}

fn check_interval(name: &str, seconds: u64) -> anyhow::Result<()> {
    if seconds == 0 {
        anyhow::bail!("{name} must be greater than zero");
    }
    if seconds > MAX_INTERVAL_SECONDS {
        anyhow::bail!("{name} must be at most {MAX_INTERVAL_SECONDS}");
    }
    Ok(())
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *target = n,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Load config from `path`, apply env overrides and validate.
///
/// A missing file is not an error: defaults are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading config from file");
            Config::from_toml(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            ))
        }
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.switchboard/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".switchboard"))
}
