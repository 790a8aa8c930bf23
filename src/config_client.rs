//! Configuration client.
//!
//! Fetches named configuration values from the remote configuration
//! service and caches them with a TTL. Expiry is lazy: an expired entry is
//! treated as a miss and removed when read. Writes evict the local entry
//! rather than updating it, so the next read always refetches what the
//! server actually persisted. There is no stale-cache fallback; for
//! configuration, correctness wins over availability.

use crate::config::CommsConfig;
use crate::error::{CommsError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SERVICE_NAME_HEADER: &str = "X-Service-Name";

/// A named configuration value as served by the configuration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationValue {
    pub key: String,
    pub value: Value,
    pub environment: String,
    pub service: String,
    pub updated_at: DateTime<Utc>,
}

/// Response envelope of the configuration service.
#[derive(Debug, Deserialize)]
struct ConfigurationResponse {
    success: bool,
    #[serde(default)]
    data: Vec<ConfigurationValue>,
    #[serde(default)]
    error: Option<String>,
}

/// Aggregate configuration-client counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigurationMetrics {
    pub request_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_request: Option<DateTime<Utc>>,
    pub last_cache_update: Option<DateTime<Utc>>,
    pub connected: bool,
    pub last_response_time_ms: u64,
}

struct CacheEntry {
    value: ConfigurationValue,
    expires_at: Instant,
}

/// TTL-caching client for the remote configuration service.
pub struct ConfigurationClient {
    service_name: String,
    base_url: String,
    cache_ttl: Duration,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CacheEntry>>,
    metrics: RwLock<ConfigurationMetrics>,
}

impl ConfigurationClient {
    pub fn new(config: &CommsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CommsError::configuration_with_source("failed to build HTTP client", e))?;

        Ok(Self {
            service_name: config.service_name.clone(),
            base_url: config.config_service_url.trim_end_matches('/').to_string(),
            cache_ttl: config.cache_ttl,
            http,
            cache: RwLock::new(HashMap::new()),
            metrics: RwLock::new(ConfigurationMetrics::default()),
        })
    }

    /// Fetch a configuration value, serving from cache while the entry is
    /// within its TTL.
    pub async fn get_configuration(&self, key: &str) -> Result<ConfigurationValue> {
        let started = Instant::now();
        let result = self.get_inner(key).await;
        self.record_request(started.elapsed());
        result
    }

    async fn get_inner(&self, key: &str) -> Result<ConfigurationValue> {
        if let Some(cached) = self.cached_value(key) {
            self.metrics.write().cache_hits += 1;
            debug!(key, "configuration cache hit");
            return Ok(cached);
        }
        self.metrics.write().cache_misses += 1;

        let url = format!("{}/api/v1/configuration/{}", self.base_url, key);
        let response = self
            .http
            .get(&url)
            .header(SERVICE_NAME_HEADER, &self.service_name)
            .send()
            .await
            .map_err(|e| {
                self.set_connected(false);
                CommsError::configuration_with_source("failed to fetch configuration", e)
            })?;
        self.set_connected(true);

        if !response.status().is_success() {
            return Err(CommsError::configuration(format!(
                "configuration service returned status {}",
                response.status()
            )));
        }

        let envelope: ConfigurationResponse = response
            .json()
            .await
            .map_err(|e| CommsError::configuration_with_source("malformed response body", e))?;

        if !envelope.success {
            return Err(CommsError::configuration(format!(
                "configuration service error: {}",
                envelope.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let Some(value) = envelope.data.into_iter().next() else {
            return Err(CommsError::configuration(format!(
                "configuration key not found: {key}"
            )));
        };

        self.cache_value(key, value.clone());
        debug!(
            key,
            environment = %value.environment,
            service = %value.service,
            "configuration fetched"
        );
        Ok(value)
    }

    /// Write a configuration value and evict the local cache entry for the
    /// key, forcing the next read to refetch.
    pub async fn set_configuration(&self, key: &str, value: Value, environment: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.set_inner(key, value, environment).await;
        self.record_request(started.elapsed());
        result
    }

    async fn set_inner(&self, key: &str, value: Value, environment: &str) -> Result<()> {
        let payload = ConfigurationValue {
            key: key.to_string(),
            value,
            environment: environment.to_string(),
            service: self.service_name.clone(),
            updated_at: Utc::now(),
        };

        let url = format!("{}/api/v1/configuration", self.base_url);
        let response = self
            .http
            .post(&url)
            .header(SERVICE_NAME_HEADER, &self.service_name)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                self.set_connected(false);
                CommsError::configuration_with_source("failed to set configuration", e)
            })?;
        self.set_connected(true);

        let status = response.status();
        if !(status == reqwest::StatusCode::OK || status == reqwest::StatusCode::CREATED) {
            return Err(CommsError::configuration(format!(
                "configuration service returned status {status}"
            )));
        }

        self.cache.write().remove(key);

        info!(key, environment, "configuration set");
        Ok(())
    }

    /// Connectivity as of the most recent remote call
    pub fn is_healthy(&self) -> bool {
        self.metrics.read().connected
    }

    /// Snapshot of the client counters
    pub fn get_metrics(&self) -> ConfigurationMetrics {
        self.metrics.read().clone()
    }

    /// Live cache lookup. Removes the entry when it has outlived the TTL,
    /// making expiry indistinguishable from absence.
    fn cached_value(&self, key: &str) -> Option<ConfigurationValue> {
        let mut cache = self.cache.write();
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_value(&self, key: &str, value: ConfigurationValue) {
        self.cache.write().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        self.metrics.write().last_cache_update = Some(Utc::now());
    }

    fn set_connected(&self, connected: bool) {
        self.metrics.write().connected = connected;
    }

    fn record_request(&self, elapsed: Duration) {
        let mut metrics = self.metrics.write();
        metrics.request_count += 1;
        metrics.last_request = Some(Utc::now());
        metrics.last_response_time_ms = elapsed.as_millis() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_with_ttl(ttl: Duration) -> ConfigurationClient {
        let config = CommsConfig {
            cache_ttl: ttl,
            ..CommsConfig::default()
        };
        ConfigurationClient::new(&config).unwrap()
    }

    fn sample_value(key: &str) -> ConfigurationValue {
        ConfigurationValue {
            key: key.to_string(),
            value: json!({"max_orders": 100}),
            environment: "test".to_string(),
            service: "configuration-service".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cache_entry_expires_lazily() {
        let client = client_with_ttl(Duration::from_millis(20));

        client.cache_value("limits", sample_value("limits"));
        assert!(client.cached_value("limits").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(client.cached_value("limits").is_none());
        // The expired entry was removed on read, not just hidden.
        assert!(client.cache.read().is_empty());
    }

    #[test]
    fn unreachable_service_leaves_client_unhealthy() {
        let client = client_with_ttl(Duration::from_secs(60));
        assert!(!client.is_healthy());
        client.set_connected(true);
        assert!(client.is_healthy());
    }

    #[test]
    fn response_envelope_parses_error_shape() {
        let envelope: ConfigurationResponse =
            serde_json::from_value(json!({"success": false, "error": "validation failed"}))
                .unwrap();
        assert!(!envelope.success);
        assert!(envelope.data.is_empty());
        assert_eq!(envelope.error.as_deref(), Some("validation failed"));
    }
}
