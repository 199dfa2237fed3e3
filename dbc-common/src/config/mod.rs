//! Configuration system for DBC.
//!
//! This module provides:
//! - A serde config model (`DistBuildConfig`) loadable from TOML
//! - Environment variable overrides with type safety (`DBC_*`)
//! - Source tracking for debugging (`dbc config`)
//! - Validation on startup

pub mod env;
pub mod source;
pub mod validate;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};
pub use validate::{ConfigWarning, Severity, validate_config};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How the client combines the remote build with local builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBuildMode {
    /// Enqueue the remote build and exit; no local build.
    FireAndForget,
    /// Prime local rule keys, run remote synchronously, report remote status.
    RuleKeyDivergenceCheck,
    /// Skip the racing phase and go straight to the synchronized phase.
    WaitForRemote,
    /// Race a local build against the remote one.
    NoWaitForRemote,
}

impl RemoteBuildMode {
    pub const CHOICES: &'static str =
        "fire_and_forget|rule_key_divergence_check|wait_for_remote|no_wait_for_remote";
}

impl FromStr for RemoteBuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fire_and_forget" => Ok(Self::FireAndForget),
            "rule_key_divergence_check" => Ok(Self::RuleKeyDivergenceCheck),
            "wait_for_remote" => Ok(Self::WaitForRemote),
            "no_wait_for_remote" => Ok(Self::NoWaitForRemote),
            other => Err(format!("unknown remote build mode '{other}'")),
        }
    }
}

impl std::fmt::Display for RemoteBuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FireAndForget => write!(f, "fire_and_forget"),
            Self::RuleKeyDivergenceCheck => write!(f, "rule_key_divergence_check"),
            Self::WaitForRemote => write!(f, "wait_for_remote"),
            Self::NoWaitForRemote => write!(f, "no_wait_for_remote"),
        }
    }
}

/// Top-level DBC configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistBuildConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_mode")]
    pub mode: RemoteBuildMode,
    /// Run the synchronized local build even if the remote build failed.
    #[serde(default = "default_true")]
    pub local_fallback: bool,
    /// Let the remote build drain on its own after the local build wins.
    #[serde(default)]
    pub graceful_shutdown: bool,
    /// Upper bound on waiting for the remote attempt after local wins.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            local_fallback: true,
            graceful_shutdown: false,
            kill_timeout_secs: default_kill_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Silence after which a minion is reported dead.
    #[serde(default = "default_max_silence")]
    pub max_silence_ms: u64,
    /// Heartbeat (and health check) gap that counts as slow.
    #[serde(default = "default_slow_heartbeat")]
    pub slow_heartbeat_warning_ms: u64,
    /// Consecutive slow health checks after which the scan runs anyway.
    #[serde(default = "default_max_consecutive_slow")]
    pub max_consecutive_slow_checks: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_silence_ms: default_max_silence(),
            slow_heartbeat_warning_ms: default_slow_heartbeat(),
            max_consecutive_slow_checks: default_max_consecutive_slow(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Digests per missing-check call.
    #[serde(default = "default_missing_check_limit")]
    pub missing_check_limit: usize,
    /// Cumulative blob bytes per batch upload call.
    #[serde(default = "default_upload_size_limit")]
    pub upload_size_limit_bytes: u64,
    /// Concurrent uploader workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            missing_check_limit: default_missing_check_limit(),
            upload_size_limit_bytes: default_upload_size_limit(),
            worker_count: default_worker_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer for the event bus.
    #[serde(default = "default_event_buffer")]
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: default_event_buffer(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> RemoteBuildMode {
    RemoteBuildMode::NoWaitForRemote
}

fn default_kill_timeout() -> u64 {
    30
}

fn default_max_silence() -> u64 {
    30_000
}

fn default_slow_heartbeat() -> u64 {
    5_000
}

fn default_max_consecutive_slow() -> u32 {
    3
}

fn default_missing_check_limit() -> usize {
    1_000
}

fn default_upload_size_limit() -> u64 {
    4 * 1024 * 1024
}

fn default_worker_count() -> usize {
    4
}

fn default_event_buffer() -> usize {
    256
}

/// Default config file location (`~/.config/dbc/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dbc").join("config.toml"))
}

/// Configuration together with where each value came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: DistBuildConfig,
    pub sources: Vec<ConfigValueSource>,
    pub warnings: Vec<ConfigWarning>,
}

/// Load configuration: defaults, then the TOML file (if any), then `DBC_*`
/// environment overrides. Validation errors fail the load; warnings are
/// returned alongside.
pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let (mut config, file_keys) = match path {
        Some(path) if path.exists() => read_file(path)?,
        Some(path) => {
            debug!("Config file {:?} not found, using defaults", path);
            (DistBuildConfig::default(), Vec::new())
        }
        None => (DistBuildConfig::default(), Vec::new()),
    };

    let mut parser = EnvParser::new();
    let env_sources = apply_env(&mut config, &mut parser);
    if parser.has_errors() {
        return Err(ConfigError::Env(parser.take_errors()));
    }

    let warnings = validate_config(&config)?;
    let sources = collect_sources(&config, &file_keys, &env_sources);
    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

fn read_file(path: &Path) -> Result<(DistBuildConfig, Vec<String>), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let table: toml::Table = toml::from_str(&text).map_err(parse_err)?;
    let config: DistBuildConfig = toml::from_str(&text).map_err(parse_err)?;

    let mut keys = Vec::new();
    for (section, value) in &table {
        if let Some(inner) = value.as_table() {
            keys.extend(inner.keys().map(|key| format!("{section}.{key}")));
        }
    }
    debug!("Loaded config from {:?} ({} keys)", path, keys.len());
    Ok((config, keys))
}

fn apply_env(config: &mut DistBuildConfig, parser: &mut EnvParser) -> Vec<(&'static str, String)> {
    let mut applied = Vec::new();

    macro_rules! apply {
        ($key:literal, $field:expr, $lookup:expr) => {
            if let Some(sourced) = $lookup {
                $field = sourced.value;
                if let Some(var) = sourced.var {
                    applied.push(($key, var));
                }
            }
        };
    }

    apply!("general.log_level", config.general.log_level, parser.get_log_level("LOG_LEVEL"));
    apply!(
        "remote.mode",
        config.remote.mode,
        parser.get_choice::<RemoteBuildMode>("REMOTE_MODE", RemoteBuildMode::CHOICES)
    );
    apply!("remote.local_fallback", config.remote.local_fallback, parser.get_bool("REMOTE_LOCAL_FALLBACK"));
    apply!(
        "remote.graceful_shutdown",
        config.remote.graceful_shutdown,
        parser.get_bool("REMOTE_GRACEFUL_SHUTDOWN")
    );
    apply!(
        "remote.kill_timeout_secs",
        config.remote.kill_timeout_secs,
        parser.get_range("REMOTE_KILL_TIMEOUT_SECS", 0u64, 86_400)
    );
    apply!(
        "health.max_silence_ms",
        config.health.max_silence_ms,
        parser.get_range("HEALTH_MAX_SILENCE_MS", 1u64, 86_400_000)
    );
    apply!(
        "health.slow_heartbeat_warning_ms",
        config.health.slow_heartbeat_warning_ms,
        parser.get_range("HEALTH_SLOW_HEARTBEAT_WARNING_MS", 1u64, 86_400_000)
    );
    apply!(
        "health.max_consecutive_slow_checks",
        config.health.max_consecutive_slow_checks,
        parser.get_range("HEALTH_MAX_CONSECUTIVE_SLOW_CHECKS", 0u32, 10_000)
    );
    apply!(
        "uploader.missing_check_limit",
        config.uploader.missing_check_limit,
        parser.get_range("UPLOADER_MISSING_CHECK_LIMIT", 1usize, 100_000)
    );
    apply!(
        "uploader.upload_size_limit_bytes",
        config.uploader.upload_size_limit_bytes,
        parser.get_range("UPLOADER_UPLOAD_SIZE_LIMIT_BYTES", 1u64, u64::MAX)
    );
    apply!(
        "uploader.worker_count",
        config.uploader.worker_count,
        parser.get_range("UPLOADER_WORKER_COUNT", 1usize, 1_024)
    );
    apply!(
        "events.buffer",
        config.events.buffer,
        parser.get_range("EVENTS_BUFFER", 1usize, 1_000_000)
    );

    applied
}

fn collect_sources(
    config: &DistBuildConfig,
    file_keys: &[String],
    env_sources: &[(&'static str, String)],
) -> Vec<ConfigValueSource> {
    let entries: [(&'static str, String); 12] = [
        ("general.log_level", config.general.log_level.clone()),
        ("remote.mode", config.remote.mode.to_string()),
        ("remote.local_fallback", config.remote.local_fallback.to_string()),
        ("remote.graceful_shutdown", config.remote.graceful_shutdown.to_string()),
        ("remote.kill_timeout_secs", config.remote.kill_timeout_secs.to_string()),
        ("health.max_silence_ms", config.health.max_silence_ms.to_string()),
        (
            "health.slow_heartbeat_warning_ms",
            config.health.slow_heartbeat_warning_ms.to_string(),
        ),
        (
            "health.max_consecutive_slow_checks",
            config.health.max_consecutive_slow_checks.to_string(),
        ),
        ("uploader.missing_check_limit", config.uploader.missing_check_limit.to_string()),
        (
            "uploader.upload_size_limit_bytes",
            config.uploader.upload_size_limit_bytes.to_string(),
        ),
        ("uploader.worker_count", config.uploader.worker_count.to_string()),
        ("events.buffer", config.events.buffer.to_string()),
    ];

    entries
        .into_iter()
        .map(|(key, value)| {
            let sourced = if let Some((_, var)) = env_sources.iter().find(|(k, _)| *k == key) {
                Sourced::from_env(value, var.clone())
            } else if file_keys.iter().any(|k| k == key) {
                Sourced::from_file(value)
            } else {
                Sourced::default_value(value)
            };
            ConfigValueSource::new(key, &sourced)
        })
        .collect()
}
