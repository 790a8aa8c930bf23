//! Service discovery client.
//!
//! Publishes this process's liveness into the registry store and resolves
//! other services' live endpoints. Registration is an idempotent overwrite
//! keyed by `services:{name}:{host}:{rpc_port}`, refreshed by a background
//! heartbeat. The store applies its own absolute expiry equal to the
//! staleness threshold, so a crashed process self-heals out of the registry
//! without explicit deregistration.
//!
//! The heartbeat is fail-open: write failures are logged and flip the
//! connectivity metric, but the loop keeps retrying every interval. A
//! partitioned discovery client never crashes the host process; it just
//! fades out of other services' discovery results once its record goes
//! stale.

use crate::config::CommsConfig;
use crate::error::{CommsError, Result};
use crate::registry::RegistryStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SERVICE_KEY_PREFIX: &str = "services:";

/// Reported health of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// One live instance of a named service, as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_name: String,
    pub host: String,
    pub rpc_port: u16,
    pub http_port: Option<u16>,
    pub version: String,
    pub environment: String,
    pub status: HealthStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceRecord {
    /// Deterministic storage key: one process occupies exactly one slot.
    pub fn storage_key(&self) -> String {
        format!(
            "{}{}:{}:{}",
            SERVICE_KEY_PREFIX, self.service_name, self.host, self.rpc_port
        )
    }

    /// Whether the record's last heartbeat is within the staleness bound
    pub fn is_live(&self, staleness_threshold: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_seen);
        match chrono::Duration::from_std(staleness_threshold) {
            Ok(threshold) => age < threshold,
            Err(_) => false,
        }
    }

    /// `host:rpc_port` dial target for this instance
    pub fn rpc_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }
}

/// Aggregate discovery counters, returned by value from
/// [`ServiceDiscovery::get_metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryMetrics {
    pub heartbeat_count: u64,
    pub discovery_count: u64,
    pub lookup_count: u64,
    pub lookup_errors: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_discovery: Option<DateTime<Utc>>,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscoveryState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Self-registering service discovery client.
pub struct ServiceDiscovery {
    config: CommsConfig,
    store: Arc<dyn RegistryStore>,
    record: ServiceRecord,
    metrics: Arc<RwLock<DiscoveryMetrics>>,
    state: RwLock<DiscoveryState>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ServiceDiscovery {
    /// Create a discovery client for this instance. Nothing is written to
    /// the registry until [`start`](Self::start).
    pub fn new(config: CommsConfig, store: Arc<dyn RegistryStore>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), "exchange-simulator".to_string());
        metadata.insert(
            "instance_id".to_string(),
            format!("{}-{}", config.service_name, Utc::now().timestamp()),
        );

        let record = ServiceRecord {
            service_name: config.service_name.clone(),
            host: config.host.clone(),
            rpc_port: config.rpc_port,
            http_port: config.http_port,
            version: config.service_version.clone(),
            environment: config.environment.clone(),
            status: HealthStatus::Healthy,
            last_seen: Utc::now(),
            metadata,
        };

        Self {
            config,
            store,
            record,
            metrics: Arc::new(RwLock::new(DiscoveryMetrics::default())),
            state: RwLock::new(DiscoveryState::Stopped),
            cancel: Mutex::new(None),
        }
    }

    /// Probe the store, register this instance once, and launch the
    /// heartbeat loop. Fails without side effects if the store is
    /// unreachable or registration fails; rejects a second start while
    /// running.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != DiscoveryState::Stopped {
                return Err(CommsError::AlreadyRunning);
            }
            *state = DiscoveryState::Starting;
        }

        if let Err(err) = self.store.ping().await {
            self.metrics.write().connected = false;
            *self.state.write() = DiscoveryState::Stopped;
            return Err(err);
        }
        self.metrics.write().connected = true;

        if let Err(err) =
            register_record(&*self.store, &self.record, self.config.staleness_threshold).await
        {
            *self.state.write() = DiscoveryState::Stopped;
            return Err(err);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.record.clone(),
            self.metrics.clone(),
            self.config.heartbeat_interval,
            self.config.staleness_threshold,
            cancel,
        ));

        *self.state.write() = DiscoveryState::Running;

        info!(
            service = %self.record.service_name,
            rpc_port = self.record.rpc_port,
            environment = %self.record.environment,
            "service discovery started"
        );
        Ok(())
    }

    /// Stop the heartbeat and deregister. Deregistration is best effort:
    /// a failure is logged, the store's expiry cleans up the record. No-op
    /// when not running.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state != DiscoveryState::Running {
                return;
            }
            *state = DiscoveryState::Stopping;
        }

        info!("stopping service discovery");

        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let key = self.record.storage_key();
        if let Err(err) = self.store.delete(&key).await {
            warn!(key, error = %err, "failed to deregister service");
        } else {
            info!(key, "service deregistered");
        }

        *self.state.write() = DiscoveryState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        *self.state.read() == DiscoveryState::Running
    }

    /// Enumerate live records for a service name, or for every service if
    /// the name is empty. Corrupt records are skipped with a warning, not
    /// an error; stale records are filtered out even while the store still
    /// holds them. An empty result is a valid outcome.
    pub async fn discover_services(&self, service_name: &str) -> Result<Vec<ServiceRecord>> {
        {
            let mut metrics = self.metrics.write();
            metrics.discovery_count += 1;
            metrics.last_discovery = Some(Utc::now());
        }

        let pattern = if service_name.is_empty() {
            format!("{SERVICE_KEY_PREFIX}*")
        } else {
            format!("{SERVICE_KEY_PREFIX}{service_name}:*")
        };

        let keys = match self.store.keys(&pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                self.metrics.write().lookup_errors += 1;
                return Err(err);
            }
        };

        let now = Utc::now();
        let mut records = Vec::with_capacity(keys.len());
        for key in &keys {
            let payload = match self.store.get(key).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key, error = %err, "failed to fetch service record");
                    continue;
                }
            };

            let record: ServiceRecord = match serde_json::from_str(&payload) {
                Ok(record) => record,
                Err(err) => {
                    warn!(key, error = %err, "skipping malformed service record");
                    continue;
                }
            };

            if record.is_live(self.config.staleness_threshold, now) {
                records.push(record);
            }
        }

        self.metrics.write().lookup_count += 1;

        debug!(
            pattern,
            keys_found = keys.len(),
            live_records = records.len(),
            "service discovery completed"
        );
        Ok(records)
    }

    /// Resolve a dialable `host:port` for a service. Picks the first live
    /// record; callers wanting load balancing select among
    /// [`discover_services`](Self::discover_services) results themselves.
    pub async fn get_service_endpoint(&self, service_name: &str) -> Result<String> {
        let records = self.discover_services(service_name).await.map_err(|err| {
            self.metrics.write().lookup_errors += 1;
            err
        })?;

        let Some(record) = records.first() else {
            self.metrics.write().lookup_errors += 1;
            return Err(CommsError::NoHealthyInstance {
                service: service_name.to_string(),
            });
        };

        let endpoint = record.rpc_endpoint();
        self.metrics.write().lookup_count += 1;

        debug!(
            service = service_name,
            endpoint,
            version = %record.version,
            "service endpoint resolved"
        );
        Ok(endpoint)
    }

    /// Snapshot of the discovery counters
    pub fn get_metrics(&self) -> DiscoveryMetrics {
        self.metrics.read().clone()
    }

    /// The record this instance publishes about itself
    pub fn own_record(&self) -> &ServiceRecord {
        &self.record
    }
}

/// Overwrite this instance's registry slot with a fresh `last_seen` and a
/// fresh store-side expiry.
async fn register_record(
    store: &dyn RegistryStore,
    template: &ServiceRecord,
    staleness_threshold: Duration,
) -> Result<()> {
    let mut record = template.clone();
    record.last_seen = Utc::now();

    let payload = serde_json::to_string(&record)?;
    store
        .set_with_expiry(&record.storage_key(), &payload, staleness_threshold)
        .await?;

    debug!(key = %record.storage_key(), "service registered");
    Ok(())
}

async fn heartbeat_loop(
    store: Arc<dyn RegistryStore>,
    template: ServiceRecord,
    metrics: Arc<RwLock<DiscoveryMetrics>>,
    interval: Duration,
    staleness_threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; registration already happened in
    // start(), so consume it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeat loop cancelled");
                return;
            }
            _ = ticker.tick() => {
                match register_record(&*store, &template, staleness_threshold).await {
                    Ok(()) => {
                        let mut m = metrics.write();
                        m.connected = true;
                        m.heartbeat_count += 1;
                        m.last_heartbeat = Some(Utc::now());
                    }
                    Err(err) => {
                        warn!(error = %err, "heartbeat registration failed");
                        metrics.write().connected = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistryStore;

    fn test_config(name: &str) -> CommsConfig {
        CommsConfig {
            service_name: name.to_string(),
            host: "127.0.0.1".to_string(),
            rpc_port: 50051,
            heartbeat_interval: Duration::from_millis(50),
            staleness_threshold: Duration::from_secs(90),
            ..CommsConfig::default()
        }
    }

    fn discovery_with_store(name: &str) -> (ServiceDiscovery, Arc<InMemoryRegistryStore>) {
        let store = Arc::new(InMemoryRegistryStore::new());
        let discovery = ServiceDiscovery::new(test_config(name), store.clone());
        (discovery, store)
    }

    #[tokio::test]
    async fn start_registers_and_stop_deregisters() {
        let (discovery, store) = discovery_with_store("exchange-okx");

        discovery.start().await.unwrap();
        assert!(discovery.is_running());

        let keys = store.keys("services:exchange-okx:*").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0], "services:exchange-okx:127.0.0.1:50051");

        discovery.stop().await;
        assert!(!discovery.is_running());
        assert!(store
            .keys("services:exchange-okx:*")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (discovery, _store) = discovery_with_store("exchange-okx");

        discovery.start().await.unwrap();
        let err = discovery.start().await.unwrap_err();
        assert!(matches!(err, CommsError::AlreadyRunning));

        discovery.stop().await;
    }

    #[tokio::test]
    async fn start_against_unreachable_store_fails_cleanly() {
        let (discovery, store) = discovery_with_store("exchange-okx");
        store.set_offline(true);

        let err = discovery.start().await.unwrap_err();
        assert!(matches!(err, CommsError::Registry { .. }));
        assert!(!discovery.is_running());
        assert!(!discovery.get_metrics().connected);

        // Recoverable: the same instance can start once the store is back.
        store.set_offline(false);
        discovery.start().await.unwrap();
        assert!(discovery.is_running());
        discovery.stop().await;
    }

    #[tokio::test]
    async fn heartbeats_overwrite_a_single_slot() {
        let (discovery, store) = discovery_with_store("exchange-okx");

        discovery.start().await.unwrap();

        // Let several heartbeats fire.
        tokio::time::sleep(Duration::from_millis(220)).await;

        let keys = store.keys("services:exchange-okx:*").await.unwrap();
        assert_eq!(keys.len(), 1, "re-registration must overwrite, not append");

        let metrics = discovery.get_metrics();
        assert!(metrics.heartbeat_count >= 2);
        assert!(metrics.connected);

        discovery.stop().await;
    }

    #[tokio::test]
    async fn stale_records_are_filtered_from_discovery() {
        let (discovery, store) = discovery_with_store("exchange-okx");

        // A peer whose last heartbeat is 95s old, past the 90s threshold,
        // but still physically present in the store.
        let stale = ServiceRecord {
            service_name: "audit-correlator".to_string(),
            host: "10.0.0.5".to_string(),
            rpc_port: 50052,
            http_port: None,
            version: "1.0.0".to_string(),
            environment: "development".to_string(),
            status: HealthStatus::Healthy,
            last_seen: Utc::now() - chrono::Duration::seconds(95),
            metadata: HashMap::new(),
        };
        store
            .set_with_expiry(
                &stale.storage_key(),
                &serde_json::to_string(&stale).unwrap(),
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        let records = discovery.discover_services("audit-correlator").await.unwrap();
        assert!(records.is_empty(), "stale record must not be discovered");

        let err = discovery
            .get_service_endpoint("audit-correlator")
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::NoHealthyInstance { .. }));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let (discovery, store) = discovery_with_store("exchange-okx");

        store
            .set_with_expiry(
                "services:audit-correlator:bad:1",
                "not json at all",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let good = ServiceRecord {
            service_name: "audit-correlator".to_string(),
            host: "10.0.0.6".to_string(),
            rpc_port: 50052,
            http_port: None,
            version: "1.0.0".to_string(),
            environment: "development".to_string(),
            status: HealthStatus::Healthy,
            last_seen: Utc::now(),
            metadata: HashMap::new(),
        };
        store
            .set_with_expiry(
                &good.storage_key(),
                &serde_json::to_string(&good).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let records = discovery.discover_services("audit-correlator").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "10.0.0.6");
    }

    #[tokio::test]
    async fn empty_name_enumerates_every_service() {
        let (discovery, _store) = discovery_with_store("exchange-okx");
        discovery.start().await.unwrap();

        let all = discovery.discover_services("").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].service_name, "exchange-okx");

        discovery.stop().await;
    }

    #[test]
    fn record_liveness_boundary() {
        let now = Utc::now();
        let mut record = ServiceRecord {
            service_name: "s".to_string(),
            host: "h".to_string(),
            rpc_port: 1,
            http_port: None,
            version: "1".to_string(),
            environment: "test".to_string(),
            status: HealthStatus::Healthy,
            last_seen: now - chrono::Duration::seconds(89),
            metadata: HashMap::new(),
        };
        let threshold = Duration::from_secs(90);

        assert!(record.is_live(threshold, now));

        record.last_seen = now - chrono::Duration::seconds(90);
        assert!(!record.is_live(threshold, now));
    }
}
