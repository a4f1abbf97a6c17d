//! Key-value store abstraction
//!
//! Every piece of durable state (credentials, processed markers, rate-limit
//! counters, label cache, classification cache) lives under a single key and is
//! accessed with atomic single-key operations only.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// Operations the triage system needs from its key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set without expiry
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set with a time-to-live
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically increment an integer counter, returning the new value
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Apply a time-to-live to an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remaining time-to-live, `None` when the key is missing or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// All live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn del(&self, key: &str) -> Result<()>;
}

/// Redis-backed store.
///
/// One multiplexed connection is opened on first use and shared by every
/// operation; clones of the store share it too.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<OnceCell<redis::aio::MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Arc::new(OnceCell::new()),
        }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let _: () = conn.expire(key, seconds).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection().await?;
        let seconds: i64 = conn.ttl(key).await?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(seconds).ok().map(Duration::from_secs))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut iter = conn.scan_match::<_, String>(format!("{}*", prefix)).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        debug!("Found {} keys with prefix {}", keys.len(), prefix);
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// In-process store with TTL semantics matching Redis.
///
/// Used for local runs without Redis and throughout the test suite. Clones
/// share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.lock().await;
        map.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        match map.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        let (current, expires_at) = match map.get(key) {
            Some(entry) if entry.is_live(now) => {
                let current = entry.value.parse::<i64>().map_err(|_| {
                    crate::error::TriageError::Store(format!(
                        "value at {} is not an integer",
                        key
                    ))
                })?;
                (current, entry.expires_at)
            }
            _ => (0, None),
        };
        let next = current + 1;
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let map = self.inner.lock().await;
        Ok(map
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|exp| exp.saturating_duration_since(now)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let map = self.inner.lock().await;
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}
