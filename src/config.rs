//! Configuration resolution for the controller.
//!
//! Unlike a client SDK embedded in another process, the controller has no
//! caller-supplied parameter layer to fall back on: resolution is ENV over a
//! compiled default, and the handful of values with no sensible default are
//! required — their absence is a startup failure, not a silent fallback.

use std::env;
use std::path::PathBuf;

use tracing::{debug, warn};

/// Configuration keys the controller resolves at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    HttpsPort,
    CertPath,
    KeyPath,
    CaCertPath,
    StateDir,
    StaleTimeoutSeconds,
    ReapIntervalSeconds,
    OtlpEndpoint,
}

impl ConfigKey {
    /// The environment variable name for this key.
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigKey::HttpsPort => "CONTROLLER_HTTPS_PORT",
            ConfigKey::CertPath => "CONTROLLER_CERT_PATH",
            ConfigKey::KeyPath => "CONTROLLER_KEY_PATH",
            ConfigKey::CaCertPath => "CA_CERT_PATH",
            ConfigKey::StateDir => "CONTROLLER_STATE_DIR",
            ConfigKey::StaleTimeoutSeconds => "STALE_TIMEOUT_SECONDS",
            ConfigKey::ReapIntervalSeconds => "REAP_INTERVAL_SECONDS",
            ConfigKey::OtlpEndpoint => "OTEL_EXPORTER_OTLP_ENDPOINT",
        }
    }

    /// The compiled-in default, or `None` if this key has no sensible default and
    /// must be supplied via its environment variable.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            ConfigKey::HttpsPort => Some("9000"),
            ConfigKey::CertPath => None,
            ConfigKey::KeyPath => None,
            ConfigKey::CaCertPath => None,
            ConfigKey::StateDir => Some("./state/controller"),
            ConfigKey::StaleTimeoutSeconds => Some("120"),
            ConfigKey::ReapIntervalSeconds => Some("30"),
            ConfigKey::OtlpEndpoint => None,
        }
    }

    /// Whether this key's value should be redacted before logging.
    ///
    /// No current key carries a credential, but file paths can leak directory
    /// layout, and the redaction discipline is kept uniform for when a future
    /// key does carry a secret.
    pub fn is_sensitive(&self) -> bool {
        false
    }
}

/// Errors that prevent the controller from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingRequired(&'static str),
}

/// Fully resolved configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub https_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub state_dir: PathBuf,
    pub stale_timeout_seconds: u64,
    pub reap_interval_seconds: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Resolve the full configuration from the environment.
    ///
    /// Required values (`CONTROLLER_CERT_PATH`, `CONTROLLER_KEY_PATH`,
    /// `CA_CERT_PATH`) that are missing cause a `ConfigError`, which the caller
    /// turns into an exit code 1 startup failure.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cert_path = require_path(ConfigKey::CertPath)?;
        let key_path = require_path(ConfigKey::KeyPath)?;
        let ca_cert_path = require_path(ConfigKey::CaCertPath)?;

        let https_port = resolve_config_int(ConfigKey::HttpsPort)
            .unwrap_or(9000)
            .try_into()
            .unwrap_or(9000);
        let state_dir = PathBuf::from(
            resolve_config(ConfigKey::StateDir).unwrap_or_else(|| "./state/controller".to_string()),
        );
        let stale_timeout_seconds = resolve_config_int(ConfigKey::StaleTimeoutSeconds).unwrap_or(120) as u64;
        let reap_interval_seconds = resolve_config_int(ConfigKey::ReapIntervalSeconds).unwrap_or(30) as u64;
        let otlp_endpoint = resolve_config(ConfigKey::OtlpEndpoint);

        Ok(Self {
            https_port,
            cert_path,
            key_path,
            ca_cert_path,
            state_dir,
            stale_timeout_seconds,
            reap_interval_seconds,
            otlp_endpoint,
        })
    }
}

fn require_path(key: ConfigKey) -> Result<PathBuf, ConfigError> {
    resolve_config(key)
        .map(PathBuf::from)
        .ok_or(ConfigError::MissingRequired(key.env_var()))
}

/// Redact sensitive values before logging. Currently a no-op since no key is
/// marked sensitive, kept so future keys inherit the discipline automatically.
fn redact_for_logging(key: ConfigKey, value: &str) -> String {
    if key.is_sensitive() {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// Resolve a string configuration value: ENV, falling back to the compiled default.
pub fn resolve_config(key: ConfigKey) -> Option<String> {
    let env_var = key.env_var();
    if let Ok(value) = env::var(env_var) {
        if !value.is_empty() {
            debug!(
                "config '{}' resolved from ENV: {}",
                env_var,
                redact_for_logging(key, &value)
            );
            return Some(value);
        }
    }

    if let Some(default) = key.default_value() {
        debug!(
            "config '{}' resolved from default: {}",
            env_var,
            redact_for_logging(key, default)
        );
        return Some(default.to_string());
    }

    None
}

/// Resolve an integer configuration value. An unparseable ENV value logs a
/// warning and falls back to the compiled default rather than failing startup —
/// a degraded timeout is recoverable, unlike a missing certificate.
pub fn resolve_config_int(key: ConfigKey) -> Option<i64> {
    let env_var = key.env_var();
    if let Ok(value) = env::var(env_var) {
        if !value.is_empty() {
            match value.parse::<i64>() {
                Ok(parsed) => {
                    debug!("config '{}' (int) resolved from ENV: {}", env_var, parsed);
                    return Some(parsed);
                }
                Err(_) => {
                    warn!(
                        "config '{}' has unparseable value '{}', falling back to default",
                        env_var, value
                    );
                }
            }
        }
    }

    key.default_value().and_then(|d| d.parse::<i64>().ok())
}
