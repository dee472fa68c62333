//! Deployment configuration.
//!
//! All knobs have production defaults; `for_testing` variants shrink
//! timers and buffers. `PersistConfig::from_env` overlays `STRATA_*`
//! environment variables on the defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::decode::IdentityStrategy;
use crate::error::ConfigError;

/// How changed document state reaches the durable tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Enqueue a job; the worker pool decodes, diffs and commits.
    Async,
    /// Append a snapshot inline from the triggering event; no projection.
    Direct,
}

/// Volatile cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key namespace, keys are `{prefix}:{document_id}`
    pub key_prefix: String,
    /// TTL applied on every write
    pub ttl: Duration,
    /// Maximum resident entries before LRU eviction
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "doc".to_string(),
            ttl: Duration::from_secs(3600),
            capacity: 10_000,
        }
    }
}

/// Durable job queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// RocksDB directory holding the job column families
    pub path: PathBuf,
    /// Delivery attempts before a job is parked as failed
    pub attempts: u32,
    /// Base delay for exponential backoff
    pub backoff_base: Duration,
    /// Completed-job retention (count, age)
    pub keep_completed: (usize, Duration),
    /// Failed-job retention (count, age)
    pub keep_failed: (usize, Duration),
    /// Enable fsync on every queue write
    pub sync_writes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("strata_queue"),
            attempts: 3,
            backoff_base: Duration::from_millis(2000),
            keep_completed: (100, Duration::from_secs(3600)),
            keep_failed: (500, Duration::from_secs(24 * 3600)),
            sync_writes: false,
        }
    }
}

impl QueueConfig {
    /// Config for testing: temp path, millisecond backoff.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backoff_base: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrently active job slots
    pub concurrency: usize,
    /// Maximum jobs started per `rate_window`
    pub rate_limit_max: usize,
    /// Throughput window
    pub rate_window: Duration,
    /// Idle poll interval when the queue is empty
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_max: 10,
            rate_window: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn for_testing() -> Self {
        Self {
            concurrency: 5,
            rate_limit_max: 1000,
            rate_window: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub mode: PersistMode,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// SQLite file for projection + snapshot log
    pub database_path: PathBuf,
    /// Period of the per-document snapshot timer
    pub snapshot_interval: Duration,
    /// Node identity used when decoding
    pub identity: IdentityStrategy,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            mode: PersistMode::Async,
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            database_path: PathBuf::from("strata.db"),
            snapshot_interval: Duration::from_secs(30),
            identity: IdentityStrategy::ContentDigest,
        }
    }
}

impl PersistConfig {
    /// Config for testing rooted at `dir`.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            queue: QueueConfig::for_testing(dir.join("queue")),
            worker: WorkerConfig::for_testing(),
            database_path: dir.join("strata.db"),
            snapshot_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `STRATA_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("STRATA_MODE") {
            config.mode = match v.to_ascii_lowercase().as_str() {
                "async" | "queue" => PersistMode::Async,
                "direct" | "sync" => PersistMode::Direct,
                _ => return Err(ConfigError::Invalid { key: "STRATA_MODE", value: v }),
            };
        }
        if let Some(v) = lookup("STRATA_CACHE_PREFIX") {
            config.cache.key_prefix = v;
        }
        if let Some(v) = lookup("STRATA_CACHE_TTL_SECS") {
            config.cache.ttl = Duration::from_secs(parse("STRATA_CACHE_TTL_SECS", v)?);
        }
        if let Some(v) = lookup("STRATA_CACHE_CAPACITY") {
            config.cache.capacity = parse("STRATA_CACHE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("STRATA_QUEUE_PATH") {
            config.queue.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STRATA_DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STRATA_WORKER_CONCURRENCY") {
            config.worker.concurrency = parse("STRATA_WORKER_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("STRATA_RATE_LIMIT_MAX") {
            config.worker.rate_limit_max = parse("STRATA_RATE_LIMIT_MAX", v)?;
        }
        if let Some(v) = lookup("STRATA_RATE_LIMIT_WINDOW_MS") {
            config.worker.rate_window =
                Duration::from_millis(parse("STRATA_RATE_LIMIT_WINDOW_MS", v)?);
        }
        if let Some(v) = lookup("STRATA_SNAPSHOT_INTERVAL_SECS") {
            config.snapshot_interval =
                Duration::from_secs(parse("STRATA_SNAPSHOT_INTERVAL_SECS", v)?);
        }
        if let Some(v) = lookup("STRATA_NODE_IDENTITY") {
            config.identity = match v.to_ascii_lowercase().as_str() {
                "digest" | "content-digest" => IdentityStrategy::ContentDigest,
                "stable-key" | "key" => IdentityStrategy::StableKey,
                _ => return Err(ConfigError::Invalid { key: "STRATA_NODE_IDENTITY", value: v }),
            };
        }

        if config.worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "STRATA_WORKER_CONCURRENCY",
                value: "0".into(),
            });
        }
        if config.worker.rate_limit_max == 0 || config.worker.rate_window.is_zero() {
            return Err(ConfigError::Invalid {
                key: "STRATA_RATE_LIMIT_MAX",
                value: config.worker.rate_limit_max.to_string(),
            });
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PersistConfig::default();
        assert_eq!(config.mode, PersistMode::Async);
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert_eq!(config.queue.attempts, 3);
        assert_eq!(config.queue.backoff_base, Duration::from_millis(2000));
        assert_eq!(config.queue.keep_completed, (100, Duration::from_secs(3600)));
        assert_eq!(config.queue.keep_failed, (500, Duration::from_secs(86_400)));
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.identity, IdentityStrategy::ContentDigest);
    }

    #[test]
    fn test_env_overlay() {
        let config = PersistConfig::from_lookup(lookup_from(&[
            ("STRATA_MODE", "direct"),
            ("STRATA_CACHE_PREFIX", "pages"),
            ("STRATA_WORKER_CONCURRENCY", "8"),
            ("STRATA_RATE_LIMIT_WINDOW_MS", "250"),
            ("STRATA_NODE_IDENTITY", "stable-key"),
        ]))
        .unwrap();

        assert_eq!(config.mode, PersistMode::Direct);
        assert_eq!(config.cache.key_prefix, "pages");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.rate_window, Duration::from_millis(250));
        assert_eq!(config.identity, IdentityStrategy::StableKey);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let err = PersistConfig::from_lookup(lookup_from(&[("STRATA_MODE", "sideways")]));
        assert!(matches!(err, Err(ConfigError::Invalid { key: "STRATA_MODE", .. })));

        let err = PersistConfig::from_lookup(lookup_from(&[("STRATA_CACHE_TTL_SECS", "soon")]));
        assert!(err.is_err());

        let err = PersistConfig::from_lookup(lookup_from(&[("STRATA_WORKER_CONCURRENCY", "0")]));
        assert!(err.is_err());
    }
}
