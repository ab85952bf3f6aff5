//! Abstraction over the key-value cache used for presence, rate counters,
//! the live-room index, and chat timeouts.
//!
//! Backed by Redis in production and an in-memory map in tests (or when no
//! `REDIS_URL` is configured).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Error talking to the cache. Callers decide whether to fail open or closed.
#[derive(Debug)]
pub struct KvError(pub String);

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kv error: {}", self.0)
    }
}

impl std::error::Error for KvError {}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    async fn incr(&self, key: &str) -> Result<i64, KvError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, KvError>;
    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, KvError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests and Redis-less deployments)
// ---------------------------------------------------------------------------

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
}

pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
    fail: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            fail: AtomicBool::new(false),
        }
    }

    /// Simulate the cache being unreachable: every call returns `KvError`.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KvError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(KvError("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    /// Remaining TTL of a string key, if one is set.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.strings.get(key).is_some_and(Entry::expired) {
            inner.strings.remove(key);
        }
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.check()?;
        self.inner.lock().unwrap().strings.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.strings.get(key).is_some_and(Entry::expired) {
            inner.strings.remove(key);
        }
        let entry = inner.strings.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        self.check()?;
        if let Some(h) = self.inner.lock().unwrap().hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, KvError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, KvError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let next = hash
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect with automatic reconnection handling.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("redis connected");
        Ok(Self { conn })
    }
}

fn map_err(e: redis::RedisError) -> KvError {
    KvError(e.to_string())
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(map_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_err)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(map_err)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_secs as i64)
            .await
            .map_err(map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(map_err)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(map_err)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await.map_err(map_err)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await.map_err(map_err)?;
        Ok(map.into_iter().collect())
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.hincr(key, field, by).await.map_err(map_err)
    }
}
