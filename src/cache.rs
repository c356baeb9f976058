//! Time-bounded credential cache
//!
//! Payment rail clients log in with merchant credentials and reuse the
//! returned bearer token until it ages out. The cache owns that state
//! instead of a global, and reads time through a [`Clock`] so expiry can
//! be driven from tests.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Key/value cache whose entries expire after a fixed TTL
pub struct TtlCache<V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    /// Create a cache with the given TTL
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get a live entry
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    /// Insert or replace an entry, starting a fresh TTL
    pub async fn insert(&self, key: &str, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Drop an entry so the next read refreshes it
    pub async fn invalidate(&self, key: &str) {
        if self.entries.write().await.remove(key).is_some() {
            debug!("Cache: invalidated {}", key);
        }
    }

    /// Return the live entry or load, store and return a fresh one
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, load: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        debug!("Cache: refreshing {}", key);
        let value = load().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}
