//! Durable snapshot job queue.
//!
//! Producers [`SnapshotQueue::enqueue`] a [`QueueJob`]; the call returns
//! once the job is durably recorded, not once it is processed. Workers
//! claim jobs, and report each outcome back through
//! [`SnapshotQueue::complete`] or [`SnapshotQueue::fail`], which applies
//! the retry policy:
//!
//! ```text
//! attempt n fails ─┬─ retryable && n < attempts ─► waiting, delay = base · 2^(n-1)
//!                  └─ otherwise ─────────────────► failed (kept for audit)
//! ```
//!
//! Delivery is at-least-once: a job claimed by a worker that dies is
//! redelivered when the queue is reopened.

pub mod limiter;
pub mod store;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::projection::now_millis;

pub use limiter::TokenBucket;
pub use store::{JobCounts, JobState, JobStore, StoredJob};

/// Job kind identifier carried by every snapshot job.
pub const JOB_KIND: &str = "persist-snapshot";

/// Priority of snapshot jobs. All jobs share it.
pub const JOB_PRIORITY: u32 = 1;

/// Snapshot job payload.
///
/// JSON form: `{"pageId", "documentState" (base64), "triggeredBy", "timestamp" (epoch ms)}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub page_id: String,
    #[serde(with = "base64_bytes")]
    pub document_state: Vec<u8>,
    /// Actor credited with the resulting node versions and snapshot
    pub triggered_by: String,
    pub timestamp: i64,
}

impl QueueJob {
    pub fn new(page_id: impl Into<String>, document_state: Vec<u8>, triggered_by: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            document_state,
            triggered_by: triggered_by.into(),
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, QueueError> {
        let job: Self =
            serde_json::from_str(json).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        if job.page_id.is_empty() {
            return Err(QueueError::InvalidPayload("empty pageId".into()));
        }
        Ok(job)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Delivery options recorded with each job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: u32,
    pub attempts: u32,
    pub backoff_base_ms: u64,
}

impl JobOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            priority: JOB_PRIORITY,
            attempts: config.attempts.max(1),
            backoff_base_ms: u64::try_from(config.backoff_base.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay before re-running a job whose `attempt`-th try failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled; `attempt` is the attempt that just failed
    Retry { attempt: u32, delay: Duration },
    /// Moved to the failed set
    Parked { attempts: u32 },
}

/// Durable queue of snapshot jobs.
pub struct SnapshotQueue {
    store: JobStore,
    config: QueueConfig,
    options: JobOptions,
    ready: Notify,
}

impl SnapshotQueue {
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let store = JobStore::open(&config)?;
        Ok(Self {
            store,
            options: JobOptions::from_config(&config),
            config,
            ready: Notify::new(),
        })
    }

    /// Durably record `job`; returns its id.
    pub fn enqueue(&self, job: QueueJob) -> Result<u64, QueueError> {
        let id = self.store.enqueue(job, self.options)?;
        self.ready.notify_one();
        Ok(id)
    }

    /// Claim the next ready job, if any.
    pub fn claim(&self) -> Result<Option<StoredJob>, QueueError> {
        self.store.claim_ready()
    }

    /// Wait until a job is enqueued or `timeout` elapses.
    pub async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.ready.notified()).await;
    }

    /// Mark a claimed job successful and apply completed-job retention.
    pub fn complete(&self, id: u64) -> Result<StoredJob, QueueError> {
        let job = self.store.complete(id)?;
        let (count, age) = self.config.keep_completed;
        self.store.trim(JobState::Completed, count, age)?;
        Ok(job)
    }

    /// Record a failed attempt of a claimed job.
    pub fn fail(&self, job: &StoredJob, error: &str, retryable: bool) -> Result<FailureOutcome, QueueError> {
        let attempt = job.attempts_made;
        if retryable && attempt < job.options.attempts {
            let delay = job.options.backoff(attempt);
            self.store.retry(job.id, error, delay)?;
            return Ok(FailureOutcome::Retry { attempt, delay });
        }

        self.store.park(job.id, error)?;
        let (count, age) = self.config.keep_failed;
        self.store.trim(JobState::Failed, count, age)?;
        Ok(FailureOutcome::Parked { attempts: attempt })
    }

    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        self.store.counts()
    }

    /// Retained successful jobs, oldest first.
    pub fn completed(&self) -> Result<Vec<StoredJob>, QueueError> {
        self.store.list(JobState::Completed)
    }

    /// Retained failed jobs, oldest first.
    pub fn failed(&self) -> Result<Vec<StoredJob>, QueueError> {
        self.store.list(JobState::Failed)
    }

    pub fn get(&self, id: u64) -> Result<Option<(JobState, StoredJob)>, QueueError> {
        self.store.get(id)
    }

    pub fn is_alive(&self) -> bool {
        self.store.count(JobState::Waiting).is_ok()
    }
}
