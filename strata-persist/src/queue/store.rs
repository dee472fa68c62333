//! RocksDB-backed durable job store.
//!
//! Column families, one per job state:
//! - `waiting`  : enqueued or scheduled for retry (`available_at_ms`)
//! - `active`   : claimed by a worker, not yet finished
//! - `completed`: processed successfully, kept for retention window
//! - `failed`   : attempts exhausted or permanent failure, kept for audit
//!
//! Keys are job ids (8 bytes big-endian) so iteration order is enqueue
//! order. Values are bincode-encoded [`StoredJob`]s, LZ4 compressed.
//!
//! ```text
//! enqueue ─► waiting ─claim─► active ─complete─► completed
//!               ▲               │
//!               └────retry──────┤
//!                               └──park────────► failed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{JobOptions, QueueJob, JOB_KIND};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::projection::now_millis;

const CF_WAITING: &str = "waiting";
const CF_ACTIVE: &str = "active";
const CF_COMPLETED: &str = "completed";
const CF_FAILED: &str = "failed";

const COLUMN_FAMILIES: &[&str] = &[CF_WAITING, CF_ACTIVE, CF_COMPLETED, CF_FAILED];

/// Lifecycle state of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    fn cf_name(self) -> &'static str {
        match self {
            JobState::Waiting => CF_WAITING,
            JobState::Active => CF_ACTIVE,
            JobState::Completed => CF_COMPLETED,
            JobState::Failed => CF_FAILED,
        }
    }
}

/// A job plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: u64,
    pub kind: String,
    pub job: QueueJob,
    pub options: JobOptions,
    /// Claims so far, including the one in progress
    pub attempts_made: u32,
    /// Failed attempts that were rescheduled
    pub retries: u32,
    /// Not claimable before this instant (epoch ms)
    pub available_at_ms: i64,
    pub last_error: Option<String>,
    pub enqueued_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

impl StoredJob {
    fn new(id: u64, job: QueueJob, options: JobOptions) -> Self {
        let now = now_millis();
        Self {
            id,
            kind: JOB_KIND.to_string(),
            job,
            options,
            attempts_made: 0,
            retries: 0,
            available_at_ms: now,
            last_error: None,
            enqueued_at_ms: now,
            finished_at_ms: None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, QueueError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| QueueError::Compression(e.to_string()))?;
        let (job, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| QueueError::Deserialization(e.to_string()))?;
        Ok(job)
    }
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Persistent job store. State transitions are atomic write batches.
pub struct JobStore {
    db: DBWithThreadMode<SingleThreaded>,
    sync_writes: bool,
    sequence: AtomicU64,
    /// Serializes claims so a waiting job is handed out once
    claim_lock: Mutex<()>,
}

impl JobStore {
    /// Open the store, creating column families if needed.
    ///
    /// Jobs found in `active` belong to a worker that died mid-job; they are
    /// moved back to `waiting` for redelivery.
    pub fn open(config: &QueueConfig) -> Result<Self, QueueError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        let store = Self {
            db,
            sync_writes: config.sync_writes,
            sequence: AtomicU64::new(sequence),
            claim_lock: Mutex::new(()),
        };

        let recovered = store.requeue_active()?;
        if recovered > 0 {
            log::warn!("Requeued {recovered} jobs interrupted mid-processing");
        }
        Ok(store)
    }

    /// Next id: one past the highest key in any column family.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        COLUMN_FAMILIES
            .iter()
            .filter_map(|name| db.cf_handle(name))
            .filter_map(|cf| match db.iterator_cf(&cf, IteratorMode::End).next() {
                Some(Ok((key, _))) => decode_key(&key).map(|id| id + 1),
                _ => None,
            })
            .max()
            .unwrap_or(1)
    }

    // ─── Transitions ──────────────────────────────────────────────────

    /// Durably record a new waiting job and return its id.
    pub fn enqueue(&self, job: QueueJob, options: JobOptions) -> Result<u64, QueueError> {
        let id = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stored = StoredJob::new(id, job, options);

        let cf = self.cf(CF_WAITING)?;
        self.db
            .put_cf_opt(cf, id.to_be_bytes(), stored.encode()?, &self.write_opts())?;
        Ok(id)
    }

    /// Move the oldest waiting job whose delay has elapsed to `active`.
    pub fn claim_ready(&self) -> Result<Option<StoredJob>, QueueError> {
        let _guard = self.claim_lock.lock();
        let now = now_millis();

        let cf = self.cf(CF_WAITING)?;
        let mut ready = None;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let job = StoredJob::decode(&value)?;
            if job.available_at_ms <= now {
                ready = Some(job);
                break;
            }
        }

        let Some(mut job) = ready else {
            return Ok(None);
        };
        job.attempts_made += 1;
        self.transition(JobState::Waiting, JobState::Active, &job)?;
        Ok(Some(job))
    }

    /// `active` → `completed`.
    pub fn complete(&self, id: u64) -> Result<StoredJob, QueueError> {
        let mut job = self.load(JobState::Active, id)?;
        job.finished_at_ms = Some(now_millis());
        self.transition(JobState::Active, JobState::Completed, &job)?;
        Ok(job)
    }

    /// `active` → `waiting`, claimable again after `delay`.
    pub fn retry(&self, id: u64, error: &str, delay: Duration) -> Result<StoredJob, QueueError> {
        let mut job = self.load(JobState::Active, id)?;
        job.retries += 1;
        job.last_error = Some(error.to_string());
        job.available_at_ms = now_millis().saturating_add(millis(delay));
        self.transition(JobState::Active, JobState::Waiting, &job)?;
        Ok(job)
    }

    /// `active` → `failed`.
    pub fn park(&self, id: u64, error: &str) -> Result<StoredJob, QueueError> {
        let mut job = self.load(JobState::Active, id)?;
        job.last_error = Some(error.to_string());
        job.finished_at_ms = Some(now_millis());
        self.transition(JobState::Active, JobState::Failed, &job)?;
        Ok(job)
    }

    /// Every job in `active` back to `waiting`, immediately claimable.
    pub fn requeue_active(&self) -> Result<usize, QueueError> {
        let now = now_millis();
        let mut count = 0;
        for mut job in self.list(JobState::Active)? {
            job.available_at_ms = now;
            self.transition(JobState::Active, JobState::Waiting, &job)?;
            count += 1;
        }
        Ok(count)
    }

    fn transition(&self, from: JobState, to: JobState, job: &StoredJob) -> Result<(), QueueError> {
        let from_cf = self.cf(from.cf_name())?;
        let to_cf = self.cf(to.cf_name())?;
        let key = job.id.to_be_bytes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(from_cf, key);
        batch.put_cf(to_cf, key, job.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    // ─── Retention ────────────────────────────────────────────────────

    /// Keep at most `max_count` finished jobs in `state`, none older than
    /// `max_age`. Returns the number removed.
    pub fn trim(&self, state: JobState, max_count: usize, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = now_millis().saturating_sub(millis(max_age));
        let mut jobs = self.list(state)?;
        // newest first
        jobs.sort_by_key(|job| std::cmp::Reverse((job.finished_at_ms.unwrap_or(0), job.id)));

        let cf = self.cf(state.cf_name())?;
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for (index, job) in jobs.iter().enumerate() {
            let expired = job.finished_at_ms.unwrap_or(0) < cutoff;
            if index >= max_count || expired {
                batch.delete_cf(cf, job.id.to_be_bytes());
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(removed)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Jobs in `state`, ordered by id.
    pub fn list(&self, state: JobState) -> Result<Vec<StoredJob>, QueueError> {
        let cf = self.cf(state.cf_name())?;
        let mut jobs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            jobs.push(StoredJob::decode(&value)?);
        }
        Ok(jobs)
    }

    pub fn count(&self, state: JobState) -> Result<usize, QueueError> {
        let cf = self.cf(state.cf_name())?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        Ok(JobCounts {
            waiting: self.count(JobState::Waiting)?,
            active: self.count(JobState::Active)?,
            completed: self.count(JobState::Completed)?,
            failed: self.count(JobState::Failed)?,
        })
    }

    /// Locate a job in any state.
    pub fn get(&self, id: u64) -> Result<Option<(JobState, StoredJob)>, QueueError> {
        for state in JobState::ALL {
            let cf = self.cf(state.cf_name())?;
            if let Some(bytes) = self.db.get_cf(cf, id.to_be_bytes())? {
                return Ok(Some((state, StoredJob::decode(&bytes)?)));
            }
        }
        Ok(None)
    }

    fn load(&self, state: JobState, id: u64) -> Result<StoredJob, QueueError> {
        let cf = self.cf(state.cf_name())?;
        match self.db.get_cf(cf, id.to_be_bytes())? {
            Some(bytes) => StoredJob::decode(&bytes),
            None => Err(QueueError::JobNotFound(id)),
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, QueueError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| QueueError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

/// Duration in ms, clamped to `i64::MAX`.
fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn decode_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
