//! Durable tiers: the append-only snapshot log and the relational node
//! projection.
//!
//! Both live in one SQLite database so that a page's structural diff and
//! its snapshot record commit (or roll back) together:
//!
//! ```text
//! ┌───────────────┐   commit_page (one transaction)
//! │ SnapshotWorker│ ──────────────────────────────┐
//! └───────────────┘                               ▼
//!                         ┌─────────────────────────────────────────┐
//!                         │ nodes         : current projection      │
//!                         │ node_versions : history of updates      │
//!                         │ snapshots     : append-only binary log  │
//!                         └─────────────────────────────────────────┘
//! ```

pub mod migration;
pub mod sqlite;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;

use crate::decode::NodeCandidate;
use crate::error::ProjectionError;

pub use sqlite::SqliteStore;

/// Stored structured content unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub page_id: String,
    pub node_type: String,
    pub content: Value,
    pub parent_id: Option<String>,
    pub order: i64,
    /// epoch ms
    pub last_synced_at: i64,
}

/// Immutable record of a node update.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeVersion {
    pub id: i64,
    pub page_id: String,
    pub node_id: String,
    pub content: Value,
    pub changed_by: String,
    pub recorded_at: i64,
}

/// Persisted binary snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub id: i64,
    pub page_id: String,
    pub snapshot: Vec<u8>,
    /// Coarse version, epoch seconds
    pub version: i64,
    pub created_by: String,
    /// epoch ms
    pub created_at: i64,
}

/// Everything one job commits for a page.
#[derive(Debug, Clone)]
pub struct PageCommit {
    pub page_id: String,
    pub nodes: Vec<NodeCandidate>,
    pub snapshot: Vec<u8>,
    pub version: i64,
    pub actor: String,
}

/// Outcome of a committed diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub snapshot_id: i64,
}

/// Append-only store of binary snapshots.
#[async_trait]
pub trait SnapshotLog: Send + Sync {
    /// Immutable insert; returns the record id.
    async fn append(
        &self,
        page_id: &str,
        state: &[u8],
        version: i64,
        author: &str,
    ) -> Result<i64, ProjectionError>;

    /// Latest snapshot by insertion order.
    async fn most_recent(&self, page_id: &str) -> Result<Option<Vec<u8>>, ProjectionError>;

    /// Liveness check for health reporting.
    async fn ping(&self) -> Result<(), ProjectionError>;
}

/// Relational projection of decoded content.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Diff `commit.nodes` against the stored nodes of the page, apply
    /// deletes/updates/inserts and append the snapshot, atomically.
    async fn commit_page(&self, commit: PageCommit) -> Result<CommitSummary, ProjectionError>;

    /// Nodes of a page sorted by `order`.
    async fn nodes(&self, page_id: &str) -> Result<Vec<Node>, ProjectionError>;
}

/// Current time, epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Current time, epoch seconds (snapshot version).
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
