//! Snapshot job processing.
//!
//! [`SnapshotWorker::process`] turns one job into one projection commit:
//!
//! ```text
//! QueueJob ─► decode_nodes ─► commit_page (diff + upsert + snapshot, one txn) ─► cache.set
//! ```
//!
//! [`WorkerPool`] runs workers against a [`SnapshotQueue`] with a fixed
//! number of concurrent slots and a token-bucket throughput limit. Each
//! outcome is reported back to the queue, which applies the retry policy.
//!
//! Processing is idempotent under redelivery: node rows are keyed by
//! (page, id), so a repeated job only updates them. The snapshot log is
//! append-only and may gain a duplicate record.

use std::sync::Arc;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::cache::DocumentCache;
use crate::config::WorkerConfig;
use crate::decode::{decode_nodes, IdentityStrategy};
use crate::error::WorkerError;
use crate::projection::{now_secs, CommitSummary, PageCommit, ProjectionStore};
use crate::queue::{FailureOutcome, QueueJob, SnapshotQueue, StoredJob, TokenBucket};
use crate::telemetry::{LogSink, PersistEvent, TelemetrySink};

/// Applies one job to the projection.
pub struct SnapshotWorker {
    projection: Arc<dyn ProjectionStore>,
    cache: DocumentCache,
    identity: IdentityStrategy,
}

impl SnapshotWorker {
    pub fn new(
        projection: Arc<dyn ProjectionStore>,
        cache: DocumentCache,
        identity: IdentityStrategy,
    ) -> Self {
        Self {
            projection,
            cache,
            identity,
        }
    }

    /// Decode, diff against stored nodes and commit with a snapshot record.
    ///
    /// On success the cache entry for the page is refreshed.
    pub async fn process(&self, job: &QueueJob) -> Result<CommitSummary, WorkerError> {
        let nodes = decode_nodes(&job.document_state, self.identity)?;

        let summary = self
            .projection
            .commit_page(PageCommit {
                page_id: job.page_id.clone(),
                nodes,
                snapshot: job.document_state.clone(),
                version: now_secs(),
                actor: job.triggered_by.clone(),
            })
            .await?;

        self.cache.set(&job.page_id, &job.document_state).await;
        Ok(summary)
    }
}

/// Concurrent consumer of a [`SnapshotQueue`].
pub struct WorkerPool {
    queue: Arc<SnapshotQueue>,
    worker: Arc<SnapshotWorker>,
    config: WorkerConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl WorkerPool {
    pub fn new(queue: Arc<SnapshotQueue>, worker: SnapshotWorker, config: WorkerConfig) -> Self {
        Self {
            queue,
            worker: Arc::new(worker),
            config,
            telemetry: Arc::new(LogSink),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Spawn the claim loop. Dropping the handle also stops the pool.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let limiter = TokenBucket::new(self.config.rate_limit_max, self.config.rate_window);
        let mut in_flight = JoinSet::new();

        log::info!(
            "Snapshot workers started: {} slots, {} jobs per {:?}",
            self.config.concurrency,
            self.config.rate_limit_max,
            self.config.rate_window
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            tokio::select! {
                _ = limiter.acquire() => {}
                _ = shutdown.changed() => break,
            }

            let job = match self.queue.claim() {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.queue.wait_for_job(self.config.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
                Err(e) => {
                    log::error!("Failed to claim snapshot job: {e}");
                    drop(permit);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            in_flight.spawn(run_job(
                Arc::clone(&self.queue),
                Arc::clone(&self.worker),
                Arc::clone(&self.telemetry),
                job,
                permit,
            ));
        }

        let pending = in_flight.len();
        if pending > 0 {
            log::info!("Waiting for {pending} in-flight snapshot jobs");
        }
        while in_flight.join_next().await.is_some() {}
        log::info!("Snapshot workers stopped");
    }
}

/// Process one claimed job and report the outcome to the queue.
async fn run_job(
    queue: Arc<SnapshotQueue>,
    worker: Arc<SnapshotWorker>,
    telemetry: Arc<dyn TelemetrySink>,
    job: StoredJob,
    _permit: OwnedSemaphorePermit,
) {
    let payload = job.job.clone();
    // A panicking job must not take the pool down with it
    let result = match tokio::spawn(async move { worker.process(&payload).await }).await {
        Ok(result) => result,
        Err(e) => Err(WorkerError::Panicked(e.to_string())),
    };

    match result {
        Ok(summary) => match queue.complete(job.id) {
            Ok(_) => telemetry.emit(PersistEvent::JobCompleted {
                job_id: job.id,
                page_id: job.job.page_id.clone(),
                inserted: summary.inserted,
                updated: summary.updated,
                deleted: summary.deleted,
            }),
            Err(e) => log::error!("Failed to mark job {} completed: {e}", job.id),
        },
        Err(err) => {
            let error = err.to_string();
            match queue.fail(&job, &error, err.is_retryable()) {
                Ok(FailureOutcome::Retry { attempt, delay }) => {
                    telemetry.emit(PersistEvent::JobRetryScheduled {
                        job_id: job.id,
                        attempt,
                        delay,
                        error,
                    })
                }
                Ok(FailureOutcome::Parked { attempts }) => telemetry.emit(PersistEvent::JobParked {
                    job_id: job.id,
                    attempts,
                    error,
                }),
                Err(e) => log::error!("Failed to record failure of job {}: {e}", job.id),
            }
        }
    }
}

/// Running [`WorkerPool`].
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Snapshot worker loop ended abnormally: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, QueueConfig};
    use crate::decode::ROOT_FRAGMENT;
    use crate::engine::encode_state;
    use crate::error::DecodeError;
    use crate::projection::SqliteStore;
    use crate::queue::JobState;
    use crate::telemetry::MemorySink;
    use std::time::Duration;
    use yrs::{Doc, Transact, XmlElementPrelim, XmlFragment, XmlTextPrelim};

    fn paragraphs(texts: &[&str]) -> Vec<u8> {
        let doc = Doc::new();
        let fragment = doc.get_or_insert_xml_fragment(ROOT_FRAGMENT);
        {
            let mut txn = doc.transact_mut();
            for (i, text) in texts.iter().enumerate() {
                let p = fragment.insert(&mut txn, i as u32, XmlElementPrelim::empty("paragraph"));
                p.insert(&mut txn, 0, XmlTextPrelim::new(*text));
            }
        }
        encode_state(&doc)
    }

    fn worker(store: &SqliteStore, cache: &DocumentCache) -> SnapshotWorker {
        SnapshotWorker::new(
            Arc::new(store.clone()),
            cache.clone(),
            IdentityStrategy::ContentDigest,
        )
    }

    #[tokio::test]
    async fn test_process_commits_and_refreshes_cache() {
        let store = SqliteStore::open_memory().unwrap();
        let cache = DocumentCache::in_memory(&CacheConfig::default());
        let state = paragraphs(&["Hello", "World"]);

        let summary = worker(&store, &cache)
            .process(&QueueJob::new("page", state.clone(), "user-1"))
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(store.nodes("page").await.unwrap().len(), 2);
        assert_eq!(store.snapshot_count("page").await.unwrap(), 1);
        assert_eq!(cache.get("page").await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_process_rejects_malformed_state() {
        let store = SqliteStore::open_memory().unwrap();
        let cache = DocumentCache::in_memory(&CacheConfig::default());

        let err = worker(&store, &cache)
            .process(&QueueJob::new("page", vec![0x01], "user-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Decode(DecodeError::Malformed(_))));
        assert!(!err.is_retryable());
        assert_eq!(store.snapshot_count("page").await.unwrap(), 0);
        assert!(cache.get("page").await.is_none());
    }

    #[tokio::test]
    async fn test_pool_processes_and_parks() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SnapshotQueue::open(QueueConfig::for_testing(dir.path())).unwrap());
        let store = SqliteStore::open_memory().unwrap();
        let cache = DocumentCache::in_memory(&CacheConfig::default());
        let sink = Arc::new(MemorySink::new());

        let handle = WorkerPool::new(Arc::clone(&queue), worker(&store, &cache), WorkerConfig::for_testing())
            .with_telemetry(sink.clone())
            .start();

        let good = queue.enqueue(QueueJob::new("page", paragraphs(&["x"]), "u")).unwrap();
        let bad = queue.enqueue(QueueJob::new("page", vec![0x01], "u")).unwrap();

        for _ in 0..200 {
            let counts = queue.counts().unwrap();
            if counts.completed + counts.failed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(queue.get(good).unwrap().unwrap().0, JobState::Completed);
        let (state, parked) = queue.get(bad).unwrap().unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(parked.attempts_made, 1);
        assert_eq!(sink.count("job_completed"), 1);
        assert_eq!(sink.count("job_parked"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_pool() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SnapshotQueue::open(QueueConfig::for_testing(dir.path())).unwrap());
        let store = SqliteStore::open_memory().unwrap();
        let cache = DocumentCache::in_memory(&CacheConfig::default());

        let handle = WorkerPool::new(queue, worker(&store, &cache), WorkerConfig::for_testing()).start();
        assert!(handle.is_running());
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }
}
