//! # strata-persist — Three-tier persistence for collaborative documents
//!
//! Keeps the state of live, collaboratively edited documents in a volatile
//! cache, an append-only snapshot log, and a relational projection of
//! ordered, typed nodes with version history.
//!
//! ## Architecture
//!
//! ```text
//!  lifecycle events                     ┌───────────────┐
//!  (connect/disconnect/destroy) ──────► │ Persistence-  │ ◄── periodic timers
//!                                       │ Service       │
//!                                       └──┬─────────┬──┘
//!                   cache-aside load       │         │ changed state only
//!              ┌───────────────────────────┘         │ (ChangeDetector)
//!              ▼                                     ▼
//!      ┌──────────────┐  miss   ┌──────────────┐   ┌──────────────┐
//!      │ DocumentCache│ ──────► │ SnapshotLog  │   │ SnapshotQueue│ (RocksDB)
//!      │ (LRU + TTL)  │         │ (SQLite)     │   └──────┬───────┘
//!      └──────────────┘         └──────────────┘          │ at-least-once
//!              ▲                        ▲                 ▼
//!              │                        │          ┌──────────────┐
//!              └──── refresh ───────────┴───────── │ WorkerPool   │
//!                                    one txn:      │ decode, diff │
//!                                    nodes +       │ upsert       │
//!                                    snapshot      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`service`] — Lifecycle handling, cache-aside reads, direct/async writes
//! - [`cache`] — Best-effort namespaced cache
//! - [`fingerprint`] — Change detection by SHA-256 of document state
//! - [`queue`] — Durable job queue with retry/backoff and retention
//! - [`worker`] — Decode, diff and commit of snapshot jobs
//! - [`projection`] — SQLite snapshot log and node projection
//! - [`decode`] — Binary state to ordered node candidates
//! - [`engine`] — Sync engine contract and Yrs implementation
//! - [`session`] — Per-document sessions, fingerprints and timers
//! - [`events`] — Lifecycle event union
//! - [`telemetry`] — Structured pipeline events

pub mod cache;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod projection;
pub mod queue;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod worker;

// Re-exports for convenience
pub use cache::{CacheBackend, DocumentCache, MemoryCache};
pub use config::{CacheConfig, PersistConfig, PersistMode, QueueConfig, WorkerConfig};
pub use decode::{content_node_id, decode_nodes, IdentityStrategy, NodeCandidate};
pub use engine::{decode_state, encode_state, SyncEngine, YrsEngine};
pub use error::{
    CacheError, ConfigError, DecodeError, EngineError, EventError, PersistError,
    ProjectionError, QueueError, WorkerError,
};
pub use events::LifecycleEvent;
pub use fingerprint::{fingerprint, ChangeDetector, Fingerprint};
pub use projection::{
    CommitSummary, Node, NodeVersion, PageCommit, ProjectionStore, SnapshotLog,
    SnapshotRecord, SqliteStore,
};
pub use queue::{
    FailureOutcome, JobCounts, JobOptions, JobState, QueueJob, SnapshotQueue, StoredJob,
};
pub use service::{
    AccessVerifier, AllowAll, EventOutcome, HealthReport, PersistOutcome, PersistPath,
    PersistenceService, PersistenceStack, SYSTEM_ACTOR,
};
pub use session::SessionRegistry;
pub use telemetry::{LogSink, MemorySink, PersistEvent, StateSource, TelemetrySink, Trigger};
pub use worker::{SnapshotWorker, WorkerHandle, WorkerPool};
