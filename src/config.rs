//! Process-wide configuration, read once from `UTILMETA_PROXY_*` environment
//! variables at startup and injected into handlers. Nothing here mutates
//! after `from_env` returns.

use std::env;

use thiserror::Error;
use tracing::warn;

use crate::utils::{is_global_ip, is_loopback_host, resolve_url_ip, url_host};

/// Environment variable prefix for every recognized setting.
pub const ENV_PREFIX: &str = "UTILMETA_PROXY_";

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Invalid cluster key: {0}")]
    InvalidClusterKey(String),
}

/// Immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Canonical external URL of this proxy.
    pub base_url: String,
    /// Port the HTTP server binds. Falls back to the `base_url` port, then 8000.
    pub bind_port: u16,
    /// Whether this is an intranet cluster: non-private sources are rejected.
    pub private: bool,
    /// Whether forward/discovery requires the client IP to match a known instance.
    pub validate_forward_ips: bool,
    pub production: bool,

    pub supervisor_base_url: String,
    pub supervisor_cluster_id: String,
    /// Cluster key as provided (brace-wrapped) or base64-decoded.
    pub cluster_key: String,

    /// Per-request default timeout, seconds.
    pub default_timeout: u64,
    /// Startup wait for the local endpoint to come live, seconds.
    pub load_timeout: u64,
    pub cors_max_age: u64,

    /// Extra hosts the forward mode may send to, beyond the supervisor's own.
    pub trusted_hosts: Vec<String>,

    /// True iff the resolved IP of `base_url` is globally routable.
    pub public_base_url: bool,
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok().filter(|v| !v.is_empty())
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env_var(name).ok_or_else(|| ConfigError::MissingEnvVar(format!("{}{}", ENV_PREFIX, name)))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: format!("{}{}", ENV_PREFIX, name),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env_var(name)
        .unwrap_or_else(|| default.to_string())
        .to_lowercase()
        == "true"
}

/// Normalizes the configured cluster key: brace-wrapped keys are kept
/// verbatim, anything else is treated as base64-encoded key material.
pub fn normalize_cluster_key(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    if raw.starts_with('{') && raw.ends_with('}') {
        return Ok(raw.to_string());
    }
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let decoded = STANDARD
        .decode(raw.as_bytes())
        .map_err(|e| ConfigError::InvalidClusterKey(e.to_string()))?;
    String::from_utf8(decoded).map_err(|e| ConfigError::InvalidClusterKey(e.to_string()))
}

impl ProxyConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env_required("BASE_URL")?;

        let base_url_port = crate::utils::split_netloc(&base_url)
            .and_then(|(netloc, _)| crate::utils::parse_address(netloc).1);
        let bind_port: u16 = env_parse_or("BIND_PORT", base_url_port.unwrap_or(8000))?;

        let supervisor_base_url = env_required("SUPERVISOR_BASE_URL")?;
        let supervisor_cluster_id = env_required("SUPERVISOR_CLUSTER_ID")?;
        let cluster_key = normalize_cluster_key(&env_required("SUPERVISOR_CLUSTER_KEY")?)?;

        let trusted_hosts = env_var("TRUSTED_HOSTS")
            .map(|v| {
                v.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let public_base_url = match resolve_url_ip(&base_url) {
            Some(ip) => is_global_ip(&ip),
            None => {
                warn!(base_url = %base_url, "proxy base URL IP load failed");
                false
            }
        };

        Ok(ProxyConfig {
            base_url,
            bind_port,
            private: env_bool("PRIVATE", false),
            validate_forward_ips: env_bool("VALIDATE_FORWARD_IPS", false),
            production: env_bool("PRODUCTION", false),
            supervisor_base_url,
            supervisor_cluster_id,
            cluster_key,
            default_timeout: env_parse_or("DEFAULT_TIMEOUT", 15)?,
            load_timeout: env_parse_or("LOAD_TIMEOUT", 15)?,
            cors_max_age: env_parse_or("CORS_MAX_AGE", 3600 * 24)?,
            trusted_hosts,
            public_base_url,
        })
    }

    /// Trusted-hosts policy for forward mode.
    ///
    /// A candidate URL is sendable only if its host is the supervisor's own
    /// host, an explicitly trusted host, or (outside production) loopback.
    /// This guards against a poisoned catalog row redirecting forwards to a
    /// hostile address.
    pub fn check_trusted_host(&self, url: &str) -> bool {
        let host = match url_host(url) {
            Some(host) => host,
            None => return false,
        };
        if let Some(supervisor_host) = url_host(&self.supervisor_base_url) {
            if host == supervisor_host {
                return true;
            }
        }
        if self.trusted_hosts.iter().any(|trusted| trusted == &host) {
            return true;
        }
        !self.production && is_loopback_host(&host)
    }
}
