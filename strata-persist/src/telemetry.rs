//! Structured telemetry for the persistence pipeline.
//!
//! Every state transition is emitted as a typed [`PersistEvent`] through a
//! [`TelemetrySink`]. The default [`LogSink`] forwards events to the `log`
//! facade at the event's level; an external observability collaborator
//! can plug in its own sink.

use std::fmt;
use std::time::Duration;

use log::Level;
use parking_lot::Mutex;

/// Where a freshly opened document's state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    Cache,
    Durable,
    Empty,
}

/// What caused a persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Disconnect,
    Periodic,
    Destroy,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Disconnect => "disconnect",
            Trigger::Periodic => "periodic",
            Trigger::Destroy => "destroy",
        }
    }
}

/// A single telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistEvent {
    SessionOpened { page_id: String, sessions: usize },
    SessionClosed { page_id: String, remaining: usize },
    StateLoaded { page_id: String, source: StateSource, bytes: usize },
    CacheDegraded { operation: &'static str, error: String },
    DurableReadFailed { page_id: String, error: String },
    Unchanged { page_id: String, trigger: Trigger },
    JobEnqueued { page_id: String, job_id: u64, trigger: Trigger },
    SnapshotAppended { page_id: String, bytes: usize },
    PersistFailed { page_id: String, trigger: Trigger, error: String },
    JobCompleted { job_id: u64, page_id: String, inserted: usize, updated: usize, deleted: usize },
    JobRetryScheduled { job_id: u64, attempt: u32, delay: Duration, error: String },
    JobParked { job_id: u64, attempts: u32, error: String },
    TimerStarted { page_id: String },
    TimerCancelled { page_id: String },
    DocumentReleased { page_id: String },
}

impl PersistEvent {
    /// Severity of the event.
    pub fn level(&self) -> Level {
        match self {
            PersistEvent::Unchanged { .. } => Level::Trace,
            PersistEvent::TimerStarted { .. }
            | PersistEvent::TimerCancelled { .. }
            | PersistEvent::JobEnqueued { .. } => Level::Debug,
            PersistEvent::SessionOpened { .. }
            | PersistEvent::SessionClosed { .. }
            | PersistEvent::StateLoaded { .. }
            | PersistEvent::SnapshotAppended { .. }
            | PersistEvent::JobCompleted { .. }
            | PersistEvent::DocumentReleased { .. } => Level::Info,
            PersistEvent::CacheDegraded { .. }
            | PersistEvent::DurableReadFailed { .. }
            | PersistEvent::JobRetryScheduled { .. } => Level::Warn,
            PersistEvent::PersistFailed { .. } | PersistEvent::JobParked { .. } => Level::Error,
        }
    }

    /// Stable machine-readable event name.
    pub fn name(&self) -> &'static str {
        match self {
            PersistEvent::SessionOpened { .. } => "session_opened",
            PersistEvent::SessionClosed { .. } => "session_closed",
            PersistEvent::StateLoaded { .. } => "state_loaded",
            PersistEvent::CacheDegraded { .. } => "cache_degraded",
            PersistEvent::DurableReadFailed { .. } => "durable_read_failed",
            PersistEvent::Unchanged { .. } => "unchanged",
            PersistEvent::JobEnqueued { .. } => "job_enqueued",
            PersistEvent::SnapshotAppended { .. } => "snapshot_appended",
            PersistEvent::PersistFailed { .. } => "persist_failed",
            PersistEvent::JobCompleted { .. } => "job_completed",
            PersistEvent::JobRetryScheduled { .. } => "job_retry_scheduled",
            PersistEvent::JobParked { .. } => "job_parked",
            PersistEvent::TimerStarted { .. } => "timer_started",
            PersistEvent::TimerCancelled { .. } => "timer_cancelled",
            PersistEvent::DocumentReleased { .. } => "document_released",
        }
    }
}

impl fmt::Display for PersistEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            PersistEvent::SessionOpened { page_id, sessions } => {
                write!(f, " page={page_id} sessions={sessions}")
            }
            PersistEvent::SessionClosed { page_id, remaining } => {
                write!(f, " page={page_id} remaining={remaining}")
            }
            PersistEvent::StateLoaded { page_id, source, bytes } => {
                write!(f, " page={page_id} source={source:?} bytes={bytes}")
            }
            PersistEvent::CacheDegraded { operation, error } => {
                write!(f, " op={operation} error={error}")
            }
            PersistEvent::DurableReadFailed { page_id, error } => {
                write!(f, " page={page_id} error={error}")
            }
            PersistEvent::Unchanged { page_id, trigger } => {
                write!(f, " page={page_id} trigger={}", trigger.as_str())
            }
            PersistEvent::JobEnqueued { page_id, job_id, trigger } => {
                write!(f, " page={page_id} job={job_id} trigger={}", trigger.as_str())
            }
            PersistEvent::SnapshotAppended { page_id, bytes } => {
                write!(f, " page={page_id} bytes={bytes}")
            }
            PersistEvent::PersistFailed { page_id, trigger, error } => {
                write!(f, " page={page_id} trigger={} error={error}", trigger.as_str())
            }
            PersistEvent::JobCompleted { job_id, page_id, inserted, updated, deleted } => write!(
                f,
                " job={job_id} page={page_id} inserted={inserted} updated={updated} deleted={deleted}"
            ),
            PersistEvent::JobRetryScheduled { job_id, attempt, delay, error } => write!(
                f,
                " job={job_id} attempt={attempt} delay_ms={} error={error}",
                delay.as_millis()
            ),
            PersistEvent::JobParked { job_id, attempts, error } => {
                write!(f, " job={job_id} attempts={attempts} error={error}")
            }
            PersistEvent::TimerStarted { page_id }
            | PersistEvent::TimerCancelled { page_id }
            | PersistEvent::DocumentReleased { page_id } => write!(f, " page={page_id}"),
        }
    }
}

/// Consumer of telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: PersistEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: PersistEvent) {
        log::log!(target: "strata::persist", event.level(), "{event}");
    }
}

/// Records events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PersistEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far.
    pub fn events(&self) -> Vec<PersistEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: PersistEvent) {
        log::log!(target: "strata::persist", event.level(), "{event}");
        self.events.lock().push(event);
    }
}
