//! SQLite implementation of [`SnapshotLog`] and [`ProjectionStore`].
//!
//! Uses rusqlite with bundled SQLite; every call runs on the blocking pool
//! via `tokio::task::spawn_blocking`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::migration;
use super::{
    now_millis, CommitSummary, Node, NodeVersion, PageCommit, ProjectionStore, SnapshotLog,
    SnapshotRecord,
};
use crate::error::ProjectionError;

/// SQLite-backed durable tiers. Cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProjectionError> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_memory() -> Result<Self, ProjectionError> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, ProjectionError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ProjectionError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| ProjectionError::Unavailable(format!("blocking task failed: {e}")))?
    }

    /// Version history of one node, oldest first.
    pub async fn versions(
        &self,
        page_id: &str,
        node_id: &str,
    ) -> Result<Vec<NodeVersion>, ProjectionError> {
        let page_id = page_id.to_string();
        let node_id = node_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, page_id, node_id, content, changed_by, recorded_at
                 FROM node_versions WHERE page_id = ?1 AND node_id = ?2 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![page_id, node_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, page_id, node_id, content, changed_by, recorded_at)| {
                    Ok(NodeVersion {
                        id,
                        page_id,
                        node_id,
                        content: parse_content(&content)?,
                        changed_by,
                        recorded_at,
                    })
                })
                .collect()
        })
        .await
    }

    /// All snapshots of a page in insertion order.
    pub async fn snapshots(&self, page_id: &str) -> Result<Vec<SnapshotRecord>, ProjectionError> {
        let page_id = page_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, page_id, snapshot, version, created_by, created_at
                 FROM snapshots WHERE page_id = ?1 ORDER BY id",
            )?;
            let records = stmt
                .query_map(params![page_id], |row| {
                    Ok(SnapshotRecord {
                        id: row.get(0)?,
                        page_id: row.get(1)?,
                        snapshot: row.get(2)?,
                        version: row.get(3)?,
                        created_by: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    pub async fn snapshot_count(&self, page_id: &str) -> Result<usize, ProjectionError> {
        let page_id = page_id.to_string();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM snapshots WHERE page_id = ?1",
                params![page_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}

fn parse_content(raw: &str) -> Result<Value, ProjectionError> {
    serde_json::from_str(raw).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

fn insert_snapshot(
    conn: &Connection,
    page_id: &str,
    state: &[u8],
    version: i64,
    author: &str,
) -> Result<i64, ProjectionError> {
    conn.execute(
        "INSERT INTO snapshots (page_id, snapshot, version, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![page_id, state, version, author, now_millis()],
    )?;
    Ok(conn.last_insert_rowid())
}

#[async_trait]
impl SnapshotLog for SqliteStore {
    async fn append(
        &self,
        page_id: &str,
        state: &[u8],
        version: i64,
        author: &str,
    ) -> Result<i64, ProjectionError> {
        let page_id = page_id.to_string();
        let state = state.to_vec();
        let author = author.to_string();
        self.blocking(move |conn| insert_snapshot(conn, &page_id, &state, version, &author))
            .await
    }

    async fn most_recent(&self, page_id: &str) -> Result<Option<Vec<u8>>, ProjectionError> {
        let page_id = page_id.to_string();
        self.blocking(move |conn| {
            let state = conn
                .query_row(
                    "SELECT snapshot FROM snapshots WHERE page_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![page_id],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(state)
        })
        .await
    }

    async fn ping(&self) -> Result<(), ProjectionError> {
        self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProjectionStore for SqliteStore {
    async fn commit_page(&self, commit: PageCommit) -> Result<CommitSummary, ProjectionError> {
        self.blocking(move |conn| {
            let PageCommit {
                page_id,
                nodes,
                snapshot,
                version,
                actor,
            } = commit;
            let now = now_millis();
            let tx = conn.transaction()?;

            let mut present: HashSet<String> = {
                let mut stmt = tx.prepare("SELECT id FROM nodes WHERE page_id = ?1")?;
                let ids = stmt
                    .query_map(params![page_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<HashSet<_>, _>>()?;
                ids
            };
            let mut incoming: HashSet<&str> = HashSet::with_capacity(nodes.len());
            for node in &nodes {
                if !incoming.insert(node.id.as_str()) {
                    return Err(ProjectionError::DuplicateNode {
                        page_id: page_id.clone(),
                        node_id: node.id.clone(),
                    });
                }
            }

            let mut summary = CommitSummary::default();

            let removed: Vec<String> = present
                .iter()
                .filter(|id| !incoming.contains(id.as_str()))
                .cloned()
                .collect();
            for id in &removed {
                tx.execute(
                    "DELETE FROM nodes WHERE page_id = ?1 AND id = ?2",
                    params![page_id, id],
                )?;
                present.remove(id);
                summary.deleted += 1;
            }

            for node in &nodes {
                let content = serde_json::to_string(&node.content)
                    .map_err(|e| ProjectionError::Serialization(e.to_string()))?;

                if present.contains(&node.id) {
                    tx.execute(
                        "UPDATE nodes SET type = ?3, content = ?4, parent_id = ?5, ord = ?6,
                                last_synced_at = ?7
                         WHERE page_id = ?1 AND id = ?2",
                        params![
                            page_id,
                            node.id,
                            node.node_type,
                            content,
                            node.parent_id,
                            node.order,
                            now
                        ],
                    )?;
                    tx.execute(
                        "INSERT INTO node_versions (page_id, node_id, content, changed_by, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![page_id, node.id, content, actor, now],
                    )?;
                    summary.updated += 1;
                } else {
                    tx.execute(
                        "INSERT INTO nodes (page_id, id, type, content, parent_id, ord, last_synced_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            page_id,
                            node.id,
                            node.node_type,
                            content,
                            node.parent_id,
                            node.order,
                            now
                        ],
                    )?;
                    present.insert(node.id.clone());
                    summary.inserted += 1;
                }
            }

            summary.snapshot_id = insert_snapshot(&tx, &page_id, &snapshot, version, &actor)?;
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn nodes(&self, page_id: &str) -> Result<Vec<Node>, ProjectionError> {
        let page_id = page_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, page_id, type, content, parent_id, ord, last_synced_at
                 FROM nodes WHERE page_id = ?1 ORDER BY ord, id",
            )?;
            let rows = stmt
                .query_map(params![page_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(
                    |(id, page_id, node_type, content, parent_id, order, last_synced_at)| {
                        Ok(Node {
                            id,
                            page_id,
                            node_type,
                            content: parse_content(&content)?,
                            parent_id,
                            order,
                            last_synced_at,
                        })
                    },
                )
                .collect()
        })
        .await
    }
}
