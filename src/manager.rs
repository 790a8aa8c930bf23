//! Inter-service client manager.
//!
//! The single place that turns "call service X" into a working, pooled,
//! instrumented client. One connection is kept per target service; typed
//! capability clients share it through the pool and never close it
//! themselves. A broken connection is discarded and replaced transparently
//! on the next call. Discovery or dial failures surface as
//! [`CommsError::ServiceUnavailable`] carrying the target service name, so
//! callers can tell "that peer is down" apart from other faults.

use crate::config::CommsConfig;
use crate::discovery::ServiceDiscovery;
use crate::error::{CommsError, Result};
use crate::rpc::RpcConnection;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Well-known peer: audit trail correlation
pub const AUDIT_SERVICE: &str = "audit-correlator";

/// Well-known peer: settlement processing
pub const SETTLEMENT_SERVICE: &str = "custodian-simulator";

/// Aggregate connection and call counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerMetrics {
    pub active_connections: usize,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub last_connection_attempt: Option<DateTime<Utc>>,
    pub call_count: u64,
    pub call_errors: u64,
}

/// Shared pool internals. Split out so capability clients can route calls
/// through the same connection map and instrumentation as the manager.
struct ConnectionPool {
    connect_timeout: Duration,
    discovery: Arc<ServiceDiscovery>,
    connections: Mutex<HashMap<String, Arc<RpcConnection>>>,
    metrics: RwLock<ManagerMetrics>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    /// Reuse the pooled connection for a service, or resolve and dial a
    /// fresh one. Broken connections found here are closed and replaced.
    async fn get_or_create(&self, service: &str) -> Result<Arc<RpcConnection>> {
        let mut connections = self.connections.lock().await;

        if self.cancel.is_cancelled() {
            return Err(CommsError::transport("client manager is closed"));
        }

        if let Some(conn) = connections.get(service) {
            if conn.is_healthy() {
                return Ok(conn.clone());
            }
            let stale = connections.remove(service);
            if let Some(conn) = stale {
                debug!(service, "discarding broken connection");
                conn.shutdown().await;
            }
        }

        self.metrics.write().last_connection_attempt = Some(Utc::now());

        let endpoint = match self.discovery.get_service_endpoint(service).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.metrics.write().failed_connections += 1;
                return Err(CommsError::service_unavailable(service, err.to_string()));
            }
        };

        let conn = match RpcConnection::connect(service, &endpoint, self.connect_timeout).await {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                self.metrics.write().failed_connections += 1;
                return Err(CommsError::service_unavailable(
                    service,
                    format!("dial {endpoint}: {err}"),
                ));
            }
        };

        connections.insert(service.to_string(), conn.clone());
        {
            let mut metrics = self.metrics.write();
            metrics.total_connections += 1;
            metrics.active_connections = connections.len();
        }

        info!(service, endpoint, "service connection established");
        Ok(conn)
    }

    /// Every outbound call passes through here: count it, time it, log
    /// failure at warn and success at debug.
    async fn call(&self, service: &str, method: &str, params: Value) -> Result<Value> {
        let conn = self.get_or_create(service).await?;

        self.metrics.write().call_count += 1;
        let started = Instant::now();

        let result = conn.call(method, params).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                debug!(service, method, ?elapsed, "inter-service call completed");
            }
            Err(err) => {
                self.metrics.write().call_errors += 1;
                warn!(service, method, ?elapsed, error = %err, "inter-service call failed");
            }
        }
        result
    }

    async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (service, conn) in connections.drain() {
            debug!(service = %service, "closing pooled connection");
            conn.shutdown().await;
        }
        self.metrics.write().active_connections = 0;
    }
}

/// Typed client for one peer service. Calls are routed through the shared
/// pool, so reconnects and instrumentation apply uniformly.
pub struct PeerClient {
    service_name: String,
    pool: Arc<ConnectionPool>,
}

impl fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerClient")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

impl PeerClient {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Invoke an arbitrary method on the peer.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.pool.call(&self.service_name, method, params).await
    }

    /// Standard health-check call. A peer that answers but is not serving
    /// is reported as an RPC failure naming the peer.
    pub async fn health_check(&self) -> Result<()> {
        let response = self
            .call("health.check", json!({ "service": self.service_name }))
            .await?;

        let serving = response.get("status").and_then(Value::as_str) == Some("serving");
        if !serving {
            return Err(CommsError::Rpc {
                method: "health.check".to_string(),
                message: format!("{} is not serving", self.service_name),
            });
        }
        Ok(())
    }
}

/// Capability client for the audit peer.
pub struct AuditClient {
    peer: Arc<PeerClient>,
}

impl AuditClient {
    pub async fn health_check(&self) -> Result<()> {
        self.peer.health_check().await
    }

    /// Submit one audit event for correlation.
    pub async fn submit_event(&self, event: Value) -> Result<()> {
        self.peer.call("audit.submit_event", event).await?;
        Ok(())
    }
}

/// Capability client for the settlement peer.
pub struct SettlementClient {
    peer: Arc<PeerClient>,
}

impl SettlementClient {
    pub async fn health_check(&self) -> Result<()> {
        self.peer.health_check().await
    }

    /// Hand a settlement instruction to the custodian.
    pub async fn process_settlement(&self, settlement: Value) -> Result<()> {
        self.peer.call("settlement.process", settlement).await?;
        Ok(())
    }
}

/// Owner of all outbound peer connections and typed clients.
pub struct ClientManager {
    pool: Arc<ConnectionPool>,
    clients: RwLock<HashMap<String, Arc<PeerClient>>>,
}

impl ClientManager {
    pub fn new(config: &CommsConfig, discovery: Arc<ServiceDiscovery>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool {
                connect_timeout: config.connect_timeout,
                discovery,
                connections: Mutex::new(HashMap::new()),
                metrics: RwLock::new(ManagerMetrics::default()),
                cancel: CancellationToken::new(),
            }),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Get the memoized client for a service, constructing it on first
    /// use. Construction resolves and dials the peer, so a down peer
    /// surfaces immediately as [`CommsError::ServiceUnavailable`].
    pub async fn get_client(&self, service: &str) -> Result<Arc<PeerClient>> {
        if let Some(client) = self.clients.read().get(service) {
            return Ok(client.clone());
        }

        // Establish the connection eagerly so resolution and dial errors
        // attach to this call rather than the first method invocation.
        self.pool.get_or_create(service).await?;

        let client = Arc::new(PeerClient {
            service_name: service.to_string(),
            pool: self.pool.clone(),
        });
        self.clients
            .write()
            .insert(service.to_string(), client.clone());

        info!(service, "peer client created");
        Ok(client)
    }

    /// Typed client for the audit peer
    pub async fn audit_client(&self) -> Result<AuditClient> {
        Ok(AuditClient {
            peer: self.get_client(AUDIT_SERVICE).await?,
        })
    }

    /// Typed client for the settlement peer
    pub async fn settlement_client(&self) -> Result<SettlementClient> {
        Ok(SettlementClient {
            peer: self.get_client(SETTLEMENT_SERVICE).await?,
        })
    }

    /// Snapshot of connection and call counters
    pub fn get_metrics(&self) -> ManagerMetrics {
        self.pool.metrics.read().clone()
    }

    /// Close every pooled connection and drop all clients. Idempotent;
    /// individual close errors are logged, never returned.
    pub async fn close(&self) {
        info!("closing inter-service client manager");
        self.pool.cancel.cancel();
        self.pool.close_all().await;
        self.clients.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistryStore;

    fn manager_with_empty_registry() -> ClientManager {
        let config = CommsConfig {
            connect_timeout: Duration::from_millis(500),
            ..CommsConfig::default()
        };
        let store = Arc::new(InMemoryRegistryStore::new());
        let discovery = Arc::new(ServiceDiscovery::new(config.clone(), store));
        ClientManager::new(&config, discovery)
    }

    #[tokio::test]
    async fn unresolvable_peer_yields_service_unavailable() {
        let manager = manager_with_empty_registry();

        let err = manager.get_client(AUDIT_SERVICE).await.unwrap_err();
        assert!(err.is_service_unavailable());
        match err {
            CommsError::ServiceUnavailable { service, .. } => {
                assert_eq!(service, AUDIT_SERVICE);
            }
            other => panic!("expected ServiceUnavailable, got {other}"),
        }

        assert_eq!(manager.get_metrics().failed_connections, 1);
        assert_eq!(manager.get_metrics().active_connections, 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_new_connections() {
        let manager = manager_with_empty_registry();

        manager.close().await;
        manager.close().await;

        let err = manager.pool.get_or_create("anything").await.unwrap_err();
        assert!(matches!(err, CommsError::Transport { .. }));
    }
}
