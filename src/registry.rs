//! Registry store adapter.
//!
//! Thin wrapper around a key-value store with expiring keys and
//! pattern-based enumeration. Service discovery is the only consumer; the
//! adapter carries no logic of its own beyond connection management.

use crate::error::{CommsError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Key-value store operations required by service discovery.
///
/// Implementations must be safe for concurrent use; callers clone or share
/// the store freely across tasks.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Connectivity probe
    async fn ping(&self) -> Result<()>;

    /// Write a key with an absolute expiry applied by the store itself
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Fetch a key, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate keys matching a glob-style pattern (`prefix*`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Redis-backed registry store.
///
/// Uses a [`ConnectionManager`], which multiplexes one connection across
/// concurrent callers and reconnects on failure.
pub struct RedisRegistryStore {
    manager: ConnectionManager,
}

impl RedisRegistryStore {
    /// Connect to the registry at the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CommsError::registry_with_source("invalid redis URL", e))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CommsError::registry_with_source("failed to connect to redis", e))?;
        debug!(url, "registry store connected");
        Ok(Self { manager })
    }
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }
}

/// In-memory registry store for tests and single-process runs.
///
/// Honors per-key expiry lazily, on read. Can be toggled offline to
/// exercise degraded-store paths without a network.
#[derive(Default)]
pub struct InMemoryRegistryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
    offline: AtomicBool,
}

struct StoredEntry {
    value: String,
    expires_at: Instant,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the store were
    /// unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CommsError::registry("registry store unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_online()?;
        self.entries.lock().insert(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let entries = self.entries.lock();
        let matched = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, _)| key.as_str())
            .filter(|key| matches_pattern(key, pattern))
            .map(String::from)
            .collect();
        Ok(matched)
    }
}

/// Glob matching restricted to the `prefix*` form the registry uses.
fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
