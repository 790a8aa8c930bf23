//! Inter-Service Communication Infrastructure
//!
//! The connective tissue of the exchange simulator: how one service in the
//! trading ecosystem finds, configures against, and calls its siblings.
//!
//! Three cooperating components, built bottom-up:
//!
//! - [`registry`]: thin adapter over a key-value store with expiring keys
//!   and pattern enumeration (Redis in production, in-memory for tests).
//! - [`discovery`]: registers this process's endpoint with a bounded TTL,
//!   refreshes it on a heartbeat, and resolves other services' live
//!   endpoints by enumerating and freshness-filtering registry entries.
//! - [`config_client`]: fetches named configuration values from the remote
//!   configuration service, caching them with a TTL and invalidating on
//!   writes.
//! - [`manager`]: turns a target service name into a pooled, instrumented
//!   typed client, dialing lazily via discovery and reusing connections
//!   across callers.
//!
//! Every component is instrumented with request/latency/error counters
//! exposed as plain snapshots, and every infrastructure failure is a
//! recoverable error: a partitioned registry, an unreachable configuration
//! service, or a down peer degrades this process, never crashes it.

pub mod config;
pub mod config_client;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod registry;
pub mod rpc;

pub use config::CommsConfig;
pub use config_client::{ConfigurationClient, ConfigurationMetrics, ConfigurationValue};
pub use discovery::{DiscoveryMetrics, HealthStatus, ServiceDiscovery, ServiceRecord};
pub use error::{CommsError, Result};
pub use manager::{
    AuditClient, ClientManager, ManagerMetrics, PeerClient, SettlementClient, AUDIT_SERVICE,
    SETTLEMENT_SERVICE,
};
pub use registry::{InMemoryRegistryStore, RedisRegistryStore, RegistryStore};
pub use rpc::{RpcConnection, RpcRequest, RpcResponse};
