//! Volatile cache tier for the latest binary document state.
//!
//! ```text
//! get(doc) ──► DocumentCache ──► CacheBackend (MemoryCache / external)
//!                  │ error?
//!                  └──► logged, treated as miss / no-op
//! ```
//!
//! The cache is never authoritative: entries expire after a fixed TTL, can
//! be evicted at any time, and any backend failure degrades to a miss so
//! the durable path is never blocked.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::telemetry::{LogSink, PersistEvent, TelemetrySink};

/// Key/value backend with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Liveness check for health reporting.
    async fn ping(&self) -> Result<(), CacheError>;
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process LRU cache with TTL expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of resident entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Namespaced, best-effort document cache.
///
/// Every operation swallows backend errors after reporting them.
#[derive(Clone)]
pub struct DocumentCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    ttl: Duration,
    telemetry: Arc<dyn TelemetrySink>,
}

impl DocumentCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            prefix: config.key_prefix.clone(),
            ttl: config.ttl,
            telemetry: Arc::new(LogSink),
        }
    }

    /// In-memory cache built from `config`.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryCache::new(config.capacity)), config)
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Cache key for a document: `{prefix}:{document_id}`.
    pub fn key(&self, document_id: &str) -> String {
        format!("{}:{}", self.prefix, document_id)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached state, or `None` on miss, expiry, or backend failure.
    pub async fn get(&self, document_id: &str) -> Option<Vec<u8>> {
        match self.backend.get(&self.key(document_id)).await {
            Ok(hit) => hit,
            Err(e) => {
                self.telemetry.emit(PersistEvent::CacheDegraded {
                    operation: "get",
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Store state with a fresh TTL. Returns whether the write landed.
    pub async fn set(&self, document_id: &str, state: &[u8]) -> bool {
        match self.backend.set(&self.key(document_id), state, self.ttl).await {
            Ok(()) => true,
            Err(e) => {
                self.telemetry.emit(PersistEvent::CacheDegraded {
                    operation: "set",
                    error: e.to_string(),
                });
                false
            }
        }
    }

    pub async fn invalidate(&self, document_id: &str) {
        if let Err(e) = self.backend.delete(&self.key(document_id)).await {
            self.telemetry.emit(PersistEvent::CacheDegraded {
                operation: "delete",
                error: e.to_string(),
            });
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.backend.ping().await.is_ok()
    }
}
