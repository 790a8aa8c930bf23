//! Instance configuration for the communication components.
//!
//! Every tunable (heartbeat interval, staleness threshold, cache TTL,
//! timeouts) is an explicit field on [`CommsConfig`] rather than a
//! module-level constant, so multiple instances can coexist with different
//! settings. Tests shrink the intervals; production uses the defaults.

use crate::error::{CommsError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Default heartbeat interval between self-registration refreshes
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default maximum age of a registry record before discovery ignores it
pub const DEFAULT_STALENESS_THRESHOLD_SECS: u64 = 90;

/// Default configuration cache TTL
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default bound on establishing an outbound peer connection
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default bound on configuration service requests
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Configuration for the discovery, configuration, and client-manager
/// components of one service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommsConfig {
    /// Service name published in the registry
    pub service_name: String,
    /// Service version published in the registry
    pub service_version: String,
    /// Deployment environment tag (development, staging, production)
    pub environment: String,
    /// Host other services use to reach this instance
    pub host: String,
    /// RPC port other services dial
    pub rpc_port: u16,
    /// Optional secondary HTTP port, published for observability tooling
    pub http_port: Option<u16>,
    /// Registry store URL
    pub redis_url: String,
    /// Base URL of the remote configuration service
    pub config_service_url: String,
    /// Bound on configuration service requests
    pub request_timeout: Duration,
    /// Configuration cache TTL
    pub cache_ttl: Duration,
    /// Period between self-registration refreshes
    pub heartbeat_interval: Duration,
    /// Maximum record age before discovery treats it as dead
    pub staleness_threshold: Duration,
    /// Bound on establishing an outbound peer connection
    pub connect_timeout: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            service_name: "exchange-simulator".to_string(),
            service_version: "1.0.0".to_string(),
            environment: "development".to_string(),
            host: "localhost".to_string(),
            rpc_port: 50051,
            http_port: Some(8080),
            redis_url: "redis://localhost:6379".to_string(),
            config_service_url: "http://localhost:8090".to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            staleness_threshold: Duration::from_secs(DEFAULT_STALENESS_THRESHOLD_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl CommsConfig {
    /// Load configuration from the process environment, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            service_name: env_or("SERVICE_NAME", defaults.service_name),
            service_version: env_or("SERVICE_VERSION", defaults.service_version),
            environment: env_or("ENVIRONMENT", defaults.environment),
            host: env_or("SERVICE_HOST", defaults.host),
            rpc_port: env_parsed("RPC_PORT", defaults.rpc_port),
            http_port: env::var("HTTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(defaults.http_port),
            redis_url: env_or("REDIS_URL", defaults.redis_url),
            config_service_url: env_or("CONFIG_SERVICE_URL", defaults.config_service_url),
            request_timeout: env_secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            cache_ttl: env_secs("CACHE_TTL_SECS", defaults.cache_ttl),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            staleness_threshold: env_secs(
                "STALENESS_THRESHOLD_SECS",
                defaults.staleness_threshold,
            ),
            connect_timeout: env_secs("CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
        };

        // Tolerated for backward compatibility, but registry keys and DNS
        // both want conforming names.
        if let Err(err) = Self::validate_service_name(&config.service_name) {
            warn!(error = %err, "service name is not DNS-safe");
        }
        config
    }

    /// Validate that the service name is DNS-safe: lowercase alphanumerics
    /// and hyphens, starting and ending with an alphanumeric, at most 63
    /// characters.
    pub fn validate_service_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 63 {
            return Err(CommsError::configuration(format!(
                "service name '{name}' must be 1-63 characters"
            )));
        }
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        let valid_edges = !name.starts_with('-') && !name.ends_with('-');
        if !valid_chars || !valid_edges {
            return Err(CommsError::configuration(format!(
                "service name '{name}' must be DNS-safe (lowercase alphanumerics and hyphens)"
            )));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
