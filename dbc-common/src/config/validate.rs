//! Startup validation of the effective configuration.

use super::{ConfigError, DistBuildConfig};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// A finding produced by [`validate_config`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigWarning {
    pub severity: Severity,
    pub key: &'static str,
    pub message: String,
}

/// Check cross-field constraints.
///
/// Hard errors fail with [`ConfigError::Invalid`]; soft findings are logged
/// and returned.
pub fn validate_config(config: &DistBuildConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut findings = Vec::new();

    if config.uploader.missing_check_limit == 0 {
        findings.push(error("uploader.missing_check_limit", "must be at least 1"));
    }
    if config.uploader.upload_size_limit_bytes == 0 {
        findings.push(error("uploader.upload_size_limit_bytes", "must be at least 1"));
    }
    if config.uploader.worker_count == 0 {
        findings.push(error("uploader.worker_count", "must be at least 1"));
    }
    if config.health.max_silence_ms == 0 {
        findings.push(error("health.max_silence_ms", "must be at least 1"));
    }
    if config.health.slow_heartbeat_warning_ms >= config.health.max_silence_ms {
        findings.push(ConfigWarning {
            severity: Severity::Warning,
            key: "health.slow_heartbeat_warning_ms",
            message: format!(
                "slow-heartbeat threshold ({}ms) is not below max silence ({}ms); \
                 minions will be declared dead before any slow heartbeat is noticed",
                config.health.slow_heartbeat_warning_ms, config.health.max_silence_ms
            ),
        });
    }
    if config.remote.graceful_shutdown && config.remote.kill_timeout_secs > 0 {
        findings.push(ConfigWarning {
            severity: Severity::Warning,
            key: "remote.kill_timeout_secs",
            message: "ignored while graceful_shutdown is enabled".to_string(),
        });
    }

    let errors: Vec<String> = findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .map(|f| format!("{} {}", f.key, f.message))
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::Invalid(errors.join("; ")));
    }

    for finding in &findings {
        warn!("Config {}: {}", finding.key, finding.message);
    }
    Ok(findings)
}

fn error(key: &'static str, message: &str) -> ConfigWarning {
    ConfigWarning {
        severity: Severity::Error,
        key,
        message: message.to_string(),
    }
}
