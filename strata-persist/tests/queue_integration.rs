//! Queue and worker pool integration tests.
//!
//! Verifies:
//! - Transient projection failures are retried and the job completes once
//! - Exhausted retries park the job with its last error
//! - Undecodable jobs are parked without retry
//! - Jobs claimed before a crash are redelivered on reopen
//! - Concurrency slots and the throughput limit bound the pool

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use strata_persist::{
    encode_state, CacheConfig, CommitSummary, DocumentCache, IdentityStrategy, JobState,
    MemorySink, Node, PageCommit, ProjectionError, ProjectionStore, QueueConfig, QueueJob,
    SnapshotQueue, SnapshotWorker, SqliteStore, WorkerConfig, WorkerHandle, WorkerPool,
};
use tempfile::{tempdir, TempDir};
use yrs::{Doc, Transact, XmlElementPrelim, XmlFragment, XmlTextPrelim};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn paragraph_state(text: &str) -> Vec<u8> {
    let doc = Doc::new();
    let fragment = doc.get_or_insert_xml_fragment("default");
    {
        let mut txn = doc.transact_mut();
        let p = fragment.insert(&mut txn, 0, XmlElementPrelim::empty("paragraph"));
        p.insert(&mut txn, 0, XmlTextPrelim::new(text));
    }
    encode_state(&doc)
}

fn open_queue(dir: &TempDir) -> Arc<SnapshotQueue> {
    Arc::new(SnapshotQueue::open(QueueConfig::for_testing(dir.path().join("queue"))).unwrap())
}

fn start_pool(
    queue: &Arc<SnapshotQueue>,
    projection: Arc<dyn ProjectionStore>,
    config: WorkerConfig,
    sink: Arc<MemorySink>,
) -> WorkerHandle {
    let worker = SnapshotWorker::new(
        projection,
        DocumentCache::in_memory(&CacheConfig::default()),
        IdentityStrategy::ContentDigest,
    );
    WorkerPool::new(Arc::clone(queue), worker, config)
        .with_telemetry(sink)
        .start()
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Fails the first `failures` commits, then delegates.
struct FlakyStore {
    inner: SqliteStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: SqliteStore, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ProjectionStore for FlakyStore {
    async fn commit_page(&self, commit: PageCommit) -> Result<CommitSummary, ProjectionError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ProjectionError::Unavailable("connection refused".into()));
        }
        self.inner.commit_page(commit).await
    }

    async fn nodes(&self, page_id: &str) -> Result<Vec<Node>, ProjectionError> {
        self.inner.nodes(page_id).await
    }
}

/// Records the highest number of overlapping commits.
#[derive(Default)]
struct OverlapTracker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    commits: AtomicUsize,
}

#[async_trait]
impl ProjectionStore for OverlapTracker {
    async fn commit_page(&self, _: PageCommit) -> Result<CommitSummary, ProjectionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(CommitSummary::default())
    }

    async fn nodes(&self, _: &str) -> Result<Vec<Node>, ProjectionError> {
        Ok(Vec::new())
    }
}

// ─── Retry policy ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failures_retried_until_success() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir);
    let sqlite = SqliteStore::open_memory().unwrap();
    let sink = Arc::new(MemorySink::new());

    let id = queue
        .enqueue(QueueJob::new("page", paragraph_state("retry me"), "alice"))
        .unwrap();
    let workers = start_pool(
        &queue,
        Arc::new(FlakyStore::new(sqlite.clone(), 2)),
        WorkerConfig::for_testing(),
        sink.clone(),
    );

    assert!(wait_until(|| queue.counts().unwrap().completed == 1).await);
    workers.shutdown().await;

    let (state, job) = queue.get(id).unwrap().unwrap();
    assert_eq!(state, JobState::Completed);
    assert_eq!(job.retries, 2);
    assert_eq!(job.attempts_made, 3);
    assert!(job.finished_at_ms.is_some());

    assert_eq!(sqlite.snapshot_count("page").await.unwrap(), 1);
    assert_eq!(sqlite.nodes("page").await.unwrap().len(), 1);
    assert_eq!(sink.count("job_retry_scheduled"), 2);
    assert_eq!(sink.count("job_completed"), 1);
    assert_eq!(sink.count("job_parked"), 0);
}

#[tokio::test]
async fn test_exhausted_retries_park_job() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir);
    let sink = Arc::new(MemorySink::new());

    let id = queue
        .enqueue(QueueJob::new("page", paragraph_state("never"), "alice"))
        .unwrap();
    let workers = start_pool(
        &queue,
        Arc::new(FlakyStore::new(SqliteStore::open_memory().unwrap(), usize::MAX)),
        WorkerConfig::for_testing(),
        sink.clone(),
    );

    assert!(wait_until(|| queue.counts().unwrap().failed == 1).await);
    workers.shutdown().await;

    let (state, job) = queue.get(id).unwrap().unwrap();
    assert_eq!(state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert!(job.last_error.as_deref().unwrap_or("").contains("connection refused"));
    assert_eq!(sink.count("job_retry_scheduled"), 2);
    assert_eq!(sink.count("job_parked"), 1);
}

#[tokio::test]
async fn test_undecodable_job_parked_immediately() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir);
    let sqlite = SqliteStore::open_memory().unwrap();
    let sink = Arc::new(MemorySink::new());

    queue.enqueue(QueueJob::new("page", vec![0x01], "alice")).unwrap();
    let workers = start_pool(
        &queue,
        Arc::new(sqlite.clone()),
        WorkerConfig::for_testing(),
        sink.clone(),
    );

    assert!(wait_until(|| queue.counts().unwrap().failed == 1).await);
    workers.shutdown().await;

    let parked = queue.failed().unwrap();
    assert_eq!(parked[0].attempts_made, 1);
    assert_eq!(sink.count("job_retry_scheduled"), 0);
    assert_eq!(sqlite.snapshot_count("page").await.unwrap(), 0);
}

// ─── Durability ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_claimed_job_redelivered_after_crash() {
    let dir = tempdir().unwrap();
    let id = {
        let queue = open_queue(&dir);
        let id = queue
            .enqueue(QueueJob::new("page", paragraph_state("survivor"), "alice"))
            .unwrap();
        let claimed = queue.claim().unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(queue.counts().unwrap().active, 1);
        id
        // dropped mid-flight
    };

    let queue = open_queue(&dir);
    let counts = queue.counts().unwrap();
    assert_eq!((counts.waiting, counts.active), (1, 0));

    let sqlite = SqliteStore::open_memory().unwrap();
    let workers = start_pool(
        &queue,
        Arc::new(sqlite.clone()),
        WorkerConfig::for_testing(),
        Arc::new(MemorySink::new()),
    );
    assert!(wait_until(|| queue.counts().unwrap().completed == 1).await);
    workers.shutdown().await;

    let (_, job) = queue.get(id).unwrap().unwrap();
    assert_eq!(job.job.page_id, "page");
    assert_eq!(sqlite.nodes("page").await.unwrap()[0].content["text"], "survivor");
}

// ─── Throughput ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrency_slots_bound_overlap() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir);
    for i in 0..8 {
        queue
            .enqueue(QueueJob::new(format!("page-{i}"), paragraph_state("x"), "alice"))
            .unwrap();
    }

    let tracker = Arc::new(OverlapTracker::default());
    let config = WorkerConfig {
        concurrency: 2,
        ..WorkerConfig::for_testing()
    };
    let workers = start_pool(&queue, tracker.clone(), config, Arc::new(MemorySink::new()));

    assert!(wait_until(|| queue.counts().unwrap().completed == 8).await);
    workers.shutdown().await;

    assert_eq!(tracker.commits.load(Ordering::SeqCst), 8);
    let peak = tracker.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak overlap {peak}");
}

#[tokio::test]
async fn test_rate_limit_spreads_job_starts() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir);
    for i in 0..10 {
        queue
            .enqueue(QueueJob::new(format!("page-{i}"), paragraph_state("x"), "alice"))
            .unwrap();
    }

    let tracker = Arc::new(OverlapTracker::default());
    let config = WorkerConfig {
        concurrency: 10,
        rate_limit_max: 5,
        rate_window: Duration::from_millis(500),
        ..WorkerConfig::for_testing()
    };
    let started = Instant::now();
    let workers = start_pool(&queue, tracker.clone(), config, Arc::new(MemorySink::new()));

    assert!(wait_until(|| queue.counts().unwrap().completed == 10).await);
    let elapsed = started.elapsed();
    workers.shutdown().await;

    // a full bucket covers five starts; the other five wait for refill
    assert!(elapsed >= Duration::from_millis(350), "finished in {elapsed:?}");
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_jobs() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir);
    queue
        .enqueue(QueueJob::new("page", paragraph_state("x"), "alice"))
        .unwrap();

    let tracker = Arc::new(OverlapTracker::default());
    let workers = start_pool(
        &queue,
        tracker.clone(),
        WorkerConfig::for_testing(),
        Arc::new(MemorySink::new()),
    );
    assert!(wait_until(|| tracker.in_flight.load(Ordering::SeqCst) == 1).await);

    workers.shutdown().await;
    assert_eq!(tracker.commits.load(Ordering::SeqCst), 1);
    assert_eq!(queue.counts().unwrap().completed, 1);
}
