use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, anyhow};
use axum::body::Bytes;
use mockall::automock;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::database::RedisDatabase;

pub type DynProxyCacheService = Arc<dyn ProxyCacheServiceTrait + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Manifest,
    Segment,
}

impl CacheKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::Segment => "segment",
        }
    }

    fn parse(value: &[u8]) -> Option<Self> {
        match value {
            b"manifest" => Some(Self::Manifest),
            b"segment" => Some(Self::Segment),
            _ => None,
        }
    }
}

/// a rewritten manifest or raw segment, immutable once stored. backends only ever replace or
/// expire entries
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// the upstream url this came from
    pub key: String,
    pub kind: CacheKind,
    pub payload: Bytes,
    pub content_type: String,
    /// forwarded response headers, Content-Length, Accept-Ranges and the like
    pub extra_headers: Vec<(String, String)>,
}

#[automock]
#[async_trait::async_trait]
pub trait ProxyCacheServiceTrait {
    /// fresh entry for `key`, expired entries are never returned
    async fn get(&self, key: &str) -> anyhow::Result<Option<Arc<CacheEntry>>>;

    /// store `entry` for `ttl`, replacing whatever was there. readers see the old entry or the
    /// new one, never a mix
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> anyhow::Result<()>;

    /// round trip time to the backend in milliseconds
    async fn health_check(&self) -> anyhow::Result<f64>;

    fn backend_name(&self) -> &'static str;

    /// flush/close on graceful shutdown
    async fn shutdown(&self);
}

struct StoredEntry {
    entry: Arc<CacheEntry>,
    expires_at: Instant,
}

/// in process cache, the default backend. the lock is only ever held for a map operation,
/// never across an await
pub struct MemoryProxyCache {
    entries: RwLock<HashMap<String, StoredEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryProxyCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// periodically drop expired entries so segments that are never asked for again don't pile
    /// up. the task only holds a weak handle and ends once the cache is gone
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                match cache.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => debug!("Purged {} expired cache entries", purged),
                    Err(e) => {
                        warn!("Cache sweep failed: {}", e);
                        break;
                    }
                }
            }
        });

        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn purge_expired(&self) -> anyhow::Result<usize> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        let before = entries.len();
        entries.retain(|_, stored| stored.expires_at > now);
        Ok(before - entries.len())
    }

    /// entries currently held, including expired ones that haven't been swept yet
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryProxyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProxyCacheServiceTrait for MemoryProxyCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Arc<CacheEntry>>> {
        let now = Instant::now();

        {
            let entries = self
                .entries
                .read()
                .map_err(|_| anyhow!("memory cache lock poisoned"))?;

            match entries.get(key) {
                Some(stored) if stored.expires_at > now => {
                    return Ok(Some(stored.entry.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // stale, only remove it if nobody replaced it in between
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        if entries.get(key).is_some_and(|s| s.expires_at <= now) {
            entries.remove(key);
        }

        Ok(None)
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> anyhow::Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        let stored = StoredEntry {
            entry: Arc::new(entry),
            expires_at: Instant::now() + ttl,
        };

        self.entries
            .write()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?
            .insert(key.to_string(), stored);

        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<f64> {
        Ok(0.0)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn shutdown(&self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut entries) = self.entries.write() {
            info!("Dropping {} in-memory cache entries", entries.len());
            entries.clear();
        }
    }
}

/// redis backed cache, entries are hashes written in one MULTI so HGETALL never sees half an
/// entry
pub struct RedisProxyCache {
    redis: Arc<RedisDatabase>,
}

impl RedisProxyCache {
    pub fn new(redis: Arc<RedisDatabase>) -> Self {
        Self { redis }
    }

    // urls can be huge and full of credentials, hash them
    fn entry_key(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        format!("pcache:{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait::async_trait]
impl ProxyCacheServiceTrait for RedisProxyCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Arc<CacheEntry>>> {
        let mut conn = self.redis.connection.clone();

        let mut fields: HashMap<String, Vec<u8>> = conn
            .hgetall(Self::entry_key(key))
            .await
            .context("Proxy cache HGETALL failed")?;

        if fields.is_empty() {
            return Ok(None);
        }

        let payload = fields
            .remove("payload")
            .ok_or_else(|| anyhow!("cached entry for {} has no payload", key))?;
        let kind = fields
            .get("kind")
            .and_then(|k| CacheKind::parse(k))
            .ok_or_else(|| anyhow!("cached entry for {} has no kind", key))?;
        let content_type = fields
            .remove("content_type")
            .map(String::from_utf8)
            .transpose()
            .context("cached content type is not utf-8")?
            .unwrap_or_default();
        let extra_headers: Vec<(String, String)> = match fields.get("headers") {
            Some(raw) => serde_json::from_slice(raw).context("cached headers are not valid json")?,
            None => Vec::new(),
        };

        Ok(Some(Arc::new(CacheEntry {
            key: key.to_string(),
            kind,
            payload: Bytes::from(payload),
            content_type,
            extra_headers,
        })))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> anyhow::Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        let redis_key = Self::entry_key(key);
        let headers = serde_json::to_vec(&entry.extra_headers)?;
        let fields: [(&str, &[u8]); 4] = [
            ("payload", entry.payload.as_ref()),
            ("kind", entry.kind.as_str().as_bytes()),
            ("content_type", entry.content_type.as_bytes()),
            ("headers", headers.as_slice()),
        ];

        let mut conn = self.redis.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&redis_key)
            .ignore()
            .hset_multiple(&redis_key, &fields)
            .ignore()
            .pexpire(&redis_key, ttl.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Proxy cache MULTI write failed")?;

        debug!(
            "Cached {} ({} bytes, TTL {}ms)",
            entry.kind.as_str(),
            entry.payload.len(),
            ttl.as_millis()
        );

        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<f64> {
        self.redis.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn shutdown(&self) {
        // entries expire on their own, nothing to flush
        info!("Releasing redis proxy cache connection");
    }
}
