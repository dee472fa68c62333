//! Lifecycle handling: the producing side of the pipeline.
//!
//! ```text
//!   connect ──► verify ──► cache.get ──miss──► log.most_recent ──► cache.set
//!                              │                     │
//!                              └──────hit────────────┴──► engine.load_state
//!                                                          register session, start timer
//!
//!   disconnect / tick / destroy
//!           ──► engine.current_state ──► should_persist? ──no──► done
//!                                             │yes
//!                      ┌──────────────────────┴───────────────────┐
//!                  PersistMode::Async                      PersistMode::Direct
//!                  queue.enqueue(job)              decode, log.append, cache.set
//! ```
//!
//! When the last session of a document ends its timer is cancelled, its
//! fingerprint dropped and the engine's copy unloaded.
//!
//! Periodic ticks and disconnect flushes of the same document are not
//! serialized against each other; the last commit wins.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::DocumentCache;
use crate::config::{PersistConfig, PersistMode};
use crate::engine::{decode_state, SyncEngine, YrsEngine};
use crate::error::PersistError;
use crate::events::LifecycleEvent;
use crate::fingerprint::Fingerprint;
use crate::projection::{now_secs, SnapshotLog, SqliteStore};
use crate::queue::{QueueJob, SnapshotQueue};
use crate::session::SessionRegistry;
use crate::telemetry::{LogSink, PersistEvent, StateSource, TelemetrySink, Trigger};
use crate::worker::{SnapshotWorker, WorkerHandle, WorkerPool};

/// Actor recorded for snapshots not attributable to a user.
pub const SYSTEM_ACTOR: &str = "system";

/// Authorization collaborator, consulted before a session is registered.
#[async_trait]
pub trait AccessVerifier: Send + Sync {
    async fn verify(&self, user_id: &str, page_id: &str) -> bool;
}

/// Grants every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl AccessVerifier for AllowAll {
    async fn verify(&self, _user_id: &str, _page_id: &str) -> bool {
        true
    }
}

/// Where changed state goes.
pub enum PersistPath {
    Queue(Arc<SnapshotQueue>),
    Direct,
}

/// Result of one persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Engine has no live copy of the document
    NotLoaded,
    /// Fingerprint matched the last persisted state
    Unchanged,
    Enqueued { job_id: u64 },
    Appended { snapshot_id: i64 },
}

/// Result of handling one lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Opened { source: StateSource, sessions: usize },
    Closed { persisted: PersistOutcome, remaining: usize },
    Destroyed { persisted: PersistOutcome },
}

/// Liveness of the tiers, for an external health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub cache: bool,
    pub durable: bool,
    /// `None` in direct mode
    pub queue: Option<bool>,
}

impl HealthReport {
    /// The cache is best-effort, so only durable tiers decide health.
    pub fn is_healthy(&self) -> bool {
        self.durable && self.queue.unwrap_or(true)
    }
}

pub struct PersistenceService {
    engine: Arc<dyn SyncEngine>,
    cache: DocumentCache,
    log: Arc<dyn SnapshotLog>,
    path: PersistPath,
    snapshot_interval: Duration,
    registry: Mutex<SessionRegistry>,
    verifier: Arc<dyn AccessVerifier>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl PersistenceService {
    pub fn new(
        engine: Arc<dyn SyncEngine>,
        cache: DocumentCache,
        log: Arc<dyn SnapshotLog>,
        path: PersistPath,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            engine,
            cache,
            log,
            path,
            snapshot_interval,
            registry: Mutex::new(SessionRegistry::new()),
            verifier: Arc::new(AllowAll),
            telemetry: Arc::new(LogSink),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn AccessVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn mode(&self) -> PersistMode {
        match self.path {
            PersistPath::Queue(_) => PersistMode::Async,
            PersistPath::Direct => PersistMode::Direct,
        }
    }

    // ─── Event dispatch ───────────────────────────────────────────────

    /// Handle one lifecycle event.
    ///
    /// Disconnect and destroy always release session state, even when the
    /// final flush fails; the flush error is returned afterwards.
    pub async fn handle(self: &Arc<Self>, event: LifecycleEvent) -> Result<EventOutcome, PersistError> {
        event.validate()?;
        match event {
            LifecycleEvent::Connect {
                page_id,
                user_id,
                session_id,
            } => self.on_connect(&page_id, &user_id, session_id).await,
            LifecycleEvent::Disconnect {
                page_id,
                user_id,
                session_id,
            } => self.on_disconnect(&page_id, &user_id, session_id).await,
            LifecycleEvent::Destroy { page_id } => self.on_destroy(&page_id).await,
        }
    }

    /// Parse, validate and handle a JSON event.
    pub async fn handle_json(self: &Arc<Self>, json: &str) -> Result<EventOutcome, PersistError> {
        let event = LifecycleEvent::from_json(json)?;
        self.handle(event).await
    }

    async fn on_connect(
        self: &Arc<Self>,
        page_id: &str,
        user_id: &str,
        session_id: Uuid,
    ) -> Result<EventOutcome, PersistError> {
        if !self.verifier.verify(user_id, page_id).await {
            log::warn!("Rejected session {session_id} of {user_id} on {page_id}");
            return Err(PersistError::Unauthorized {
                user_id: user_id.to_string(),
                page_id: page_id.to_string(),
            });
        }

        let (source, state) = self.load(page_id).await;
        if let Some(state) = &state {
            self.engine.load_state(page_id, state).await?;
        }
        self.telemetry.emit(PersistEvent::StateLoaded {
            page_id: page_id.to_string(),
            source,
            bytes: state.as_ref().map_or(0, Vec::len),
        });

        let (sessions, timer_started) = {
            let mut registry = self.registry.lock();
            let sessions = registry.open_session(page_id, session_id);
            let start = !registry.has_timer(page_id);
            if start {
                registry.install_timer(page_id, self.spawn_timer(page_id));
            }
            (sessions, start)
        };

        self.telemetry.emit(PersistEvent::SessionOpened {
            page_id: page_id.to_string(),
            sessions,
        });
        if timer_started {
            self.telemetry.emit(PersistEvent::TimerStarted {
                page_id: page_id.to_string(),
            });
        }

        Ok(EventOutcome::Opened { source, sessions })
    }

    async fn on_disconnect(
        &self,
        page_id: &str,
        user_id: &str,
        session_id: Uuid,
    ) -> Result<EventOutcome, PersistError> {
        let persisted = self.persist_if_changed(page_id, user_id, Trigger::Disconnect).await;

        let remaining = self.registry.lock().close_session(page_id, session_id);
        self.telemetry.emit(PersistEvent::SessionClosed {
            page_id: page_id.to_string(),
            remaining,
        });
        if remaining == 0 {
            self.release(page_id).await;
        }

        Ok(EventOutcome::Closed {
            persisted: persisted?,
            remaining,
        })
    }

    async fn on_destroy(&self, page_id: &str) -> Result<EventOutcome, PersistError> {
        let persisted = self.persist_if_changed(page_id, SYSTEM_ACTOR, Trigger::Destroy).await;
        self.release(page_id).await;
        Ok(EventOutcome::Destroyed {
            persisted: persisted?,
        })
    }

    /// Drop sessions, timer and fingerprint, then unload the engine copy.
    async fn release(&self, page_id: &str) {
        let released = self.registry.lock().release(page_id);
        if released.timer_cancelled {
            self.telemetry.emit(PersistEvent::TimerCancelled {
                page_id: page_id.to_string(),
            });
        }
        self.engine.unload(page_id).await;
        self.telemetry.emit(PersistEvent::DocumentReleased {
            page_id: page_id.to_string(),
        });
    }

    // ─── Read path ────────────────────────────────────────────────────

    /// Cache-aside load. A durable read failure is reported and treated
    /// as an empty document.
    pub async fn load(&self, page_id: &str) -> (StateSource, Option<Vec<u8>>) {
        if let Some(state) = self.cache.get(page_id).await {
            return (StateSource::Cache, Some(state));
        }

        match self.log.most_recent(page_id).await {
            Ok(Some(state)) => {
                self.cache.set(page_id, &state).await;
                (StateSource::Durable, Some(state))
            }
            Ok(None) => (StateSource::Empty, None),
            Err(e) => {
                self.telemetry.emit(PersistEvent::DurableReadFailed {
                    page_id: page_id.to_string(),
                    error: e.to_string(),
                });
                (StateSource::Empty, None)
            }
        }
    }

    // ─── Write path ───────────────────────────────────────────────────

    /// Persist the engine's current state of `page_id` unless unchanged.
    ///
    /// On failure the recorded fingerprint is rolled back so the next
    /// trigger retries the same state.
    pub async fn persist_if_changed(
        &self,
        page_id: &str,
        actor: &str,
        trigger: Trigger,
    ) -> Result<PersistOutcome, PersistError> {
        let Some(state) = self.engine.current_state(page_id).await else {
            return Ok(PersistOutcome::NotLoaded);
        };

        if !self.registry.lock().should_persist(page_id, &state) {
            self.telemetry.emit(PersistEvent::Unchanged {
                page_id: page_id.to_string(),
                trigger,
            });
            return Ok(PersistOutcome::Unchanged);
        }

        let result = match &self.path {
            PersistPath::Queue(queue) => queue
                .enqueue(QueueJob::new(page_id, state.clone(), actor))
                .map(|job_id| PersistOutcome::Enqueued { job_id })
                .map_err(PersistError::from),
            PersistPath::Direct => self.append_direct(page_id, &state, actor).await,
        };

        match result {
            Ok(outcome) => {
                match outcome {
                    PersistOutcome::Enqueued { job_id } => {
                        self.telemetry.emit(PersistEvent::JobEnqueued {
                            page_id: page_id.to_string(),
                            job_id,
                            trigger,
                        })
                    }
                    PersistOutcome::Appended { .. } => {
                        self.telemetry.emit(PersistEvent::SnapshotAppended {
                            page_id: page_id.to_string(),
                            bytes: state.len(),
                        })
                    }
                    PersistOutcome::NotLoaded | PersistOutcome::Unchanged => {}
                }
                Ok(outcome)
            }
            Err(e) => {
                self.registry.lock().invalidate_fingerprint(page_id, &state);
                self.telemetry.emit(PersistEvent::PersistFailed {
                    page_id: page_id.to_string(),
                    trigger,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Direct path: snapshot only, no projection.
    async fn append_direct(
        &self,
        page_id: &str,
        state: &[u8],
        actor: &str,
    ) -> Result<PersistOutcome, PersistError> {
        decode_state(state)?;
        let snapshot_id = self.log.append(page_id, state, now_secs(), actor).await?;
        self.cache.set(page_id, state).await;
        Ok(PersistOutcome::Appended { snapshot_id })
    }

    // ─── Timers ───────────────────────────────────────────────────────

    fn spawn_timer(self: &Arc<Self>, page_id: &str) -> JoinHandle<()> {
        let service: Weak<Self> = Arc::downgrade(self);
        let page_id = page_id.to_string();
        let period = self.snapshot_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                if let Err(e) = service
                    .persist_if_changed(&page_id, SYSTEM_ACTOR, Trigger::Periodic)
                    .await
                {
                    log::warn!("Periodic snapshot of {page_id} failed: {e}");
                }
            }
        })
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub fn session_count(&self, page_id: &str) -> usize {
        self.registry.lock().session_count(page_id)
    }

    pub fn has_timer(&self, page_id: &str) -> bool {
        self.registry.lock().has_timer(page_id)
    }

    pub fn fingerprint(&self, page_id: &str) -> Option<Fingerprint> {
        self.registry.lock().fingerprint(page_id).copied()
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            cache: self.cache.is_alive().await,
            durable: self.log.ping().await.is_ok(),
            queue: match &self.path {
                PersistPath::Queue(queue) => Some(queue.is_alive()),
                PersistPath::Direct => None,
            },
        }
    }
}

/// Fully wired pipeline: Yrs engine, in-memory cache, SQLite durable
/// tiers, and in async mode a RocksDB queue with running workers.
pub struct PersistenceStack {
    pub service: Arc<PersistenceService>,
    pub engine: Arc<YrsEngine>,
    pub cache: DocumentCache,
    pub store: SqliteStore,
    pub queue: Option<Arc<SnapshotQueue>>,
    workers: Option<WorkerHandle>,
}

impl PersistenceStack {
    /// Open every tier described by `config`. Must run inside a Tokio runtime.
    pub fn open(config: &PersistConfig) -> Result<Self, PersistError> {
        Self::open_with(config, Arc::new(LogSink))
    }

    pub fn open_with(config: &PersistConfig, telemetry: Arc<dyn TelemetrySink>) -> Result<Self, PersistError> {
        let engine = Arc::new(YrsEngine::new());
        let cache = DocumentCache::in_memory(&config.cache).with_telemetry(Arc::clone(&telemetry));
        let store = SqliteStore::open(&config.database_path)?;

        let (path, queue, workers) = match config.mode {
            PersistMode::Async => {
                let queue = Arc::new(SnapshotQueue::open(config.queue.clone())?);
                let worker = SnapshotWorker::new(Arc::new(store.clone()), cache.clone(), config.identity);
                let workers = WorkerPool::new(Arc::clone(&queue), worker, config.worker.clone())
                    .with_telemetry(Arc::clone(&telemetry))
                    .start();
                (PersistPath::Queue(Arc::clone(&queue)), Some(queue), Some(workers))
            }
            PersistMode::Direct => (PersistPath::Direct, None, None),
        };

        let service = PersistenceService::new(
            engine.clone(),
            cache.clone(),
            Arc::new(store.clone()),
            path,
            config.snapshot_interval,
        )
        .with_telemetry(telemetry);

        log::info!(
            "Persistence pipeline ready: mode={:?} db={}",
            config.mode,
            config.database_path.display()
        );

        Ok(Self {
            service: Arc::new(service),
            engine,
            cache,
            store,
            queue,
            workers,
        })
    }

    /// Stop the workers after their in-flight jobs finish.
    pub async fn shutdown(mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::telemetry::MemorySink;

    struct DenyAll;

    #[async_trait]
    impl AccessVerifier for DenyAll {
        async fn verify(&self, _user_id: &str, _page_id: &str) -> bool {
            false
        }
    }

    fn direct_service(sink: Arc<MemorySink>) -> (PersistenceService, SqliteStore) {
        let store = SqliteStore::open_memory().unwrap();
        let service = PersistenceService::new(
            Arc::new(YrsEngine::new()),
            DocumentCache::in_memory(&CacheConfig::default()),
            Arc::new(store.clone()),
            PersistPath::Direct,
            Duration::from_secs(3600),
        )
        .with_telemetry(sink);
        (service, store)
    }

    #[tokio::test]
    async fn test_unauthorized_connect_registers_nothing() {
        let (service, _) = direct_service(Arc::new(MemorySink::new()));
        let service = Arc::new(service.with_verifier(Arc::new(DenyAll)));

        let err = service
            .handle(LifecycleEvent::connect("p", "mallory", Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Unauthorized { .. }));
        assert_eq!(service.session_count("p"), 0);
        assert!(!service.has_timer("p"));
    }

    #[tokio::test]
    async fn test_connect_cold_document_is_empty() {
        let sink = Arc::new(MemorySink::new());
        let (service, _) = direct_service(sink.clone());
        let service = Arc::new(service);

        let outcome = service
            .handle(LifecycleEvent::connect("p", "u", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Opened {
                source: StateSource::Empty,
                sessions: 1
            }
        );
        assert!(service.has_timer("p"));
        assert_eq!(sink.count("timer_started"), 1);
    }

    #[tokio::test]
    async fn test_persist_not_loaded() {
        let (service, _) = direct_service(Arc::new(MemorySink::new()));
        let outcome = service
            .persist_if_changed("nowhere", SYSTEM_ACTOR, Trigger::Periodic)
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::NotLoaded);
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let (service, _) = direct_service(Arc::new(MemorySink::new()));
        let service = Arc::new(service);
        let err = service.handle_json(r#"{"type":"destroy"}"#).await.unwrap_err();
        assert!(matches!(err, PersistError::Event(_)));
    }

    #[tokio::test]
    async fn test_health_in_direct_mode() {
        let (service, _) = direct_service(Arc::new(MemorySink::new()));
        let report = service.health().await;
        assert_eq!(
            report,
            HealthReport {
                cache: true,
                durable: true,
                queue: None
            }
        );
        assert!(report.is_healthy());
    }
}
