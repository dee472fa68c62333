//! Projection database schema.
//!
//! One SQLite file holds all three read-side tables, so a single
//! transaction can append a snapshot, upsert the page's nodes and record
//! their history:
//!
//! ```text
//! snapshots       append-only full document states, newest id wins
//! nodes           current decoded content, keyed (page_id, id)
//! node_versions   prior node contents, appended on each update
//! ```
//!
//! Steps are applied in order on open; each one is recorded in
//! `schema_migrations` with the step name.

use rusqlite::{params, Connection};

use super::now_millis;
use crate::error::ProjectionError;

type Step = fn(&Connection) -> Result<(), ProjectionError>;

/// Ordered schema steps. Step `n` (1-based) brings the schema to version `n`.
const STEPS: &[(&str, Step)] = &[("snapshot_log_and_node_projection", apply_v1)];

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

/// Bring `conn` up to [`CURRENT_VERSION`]. A no-op on an up-to-date file;
/// a file written by a newer build is refused rather than downgraded.
pub fn migrate(conn: &mut Connection) -> Result<(), ProjectionError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let found = schema_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(ProjectionError::Migration(format!(
            "database schema v{found} is newer than supported v{CURRENT_VERSION}"
        )));
    }
    if found == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, (name, step)) in (1u32..).zip(STEPS).skip(found as usize) {
        step(&tx)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![version, name, now_millis()],
        )?;
        log::debug!("Applied projection schema step {version} ({name})");
    }
    tx.commit()?;
    log::info!("Projection schema at v{CURRENT_VERSION} (was v{found})");
    Ok(())
}

/// Highest recorded step, 0 for a fresh file.
fn schema_version(conn: &Connection) -> Result<u32, ProjectionError> {
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// v1: snapshot log, node projection, node version history.
fn apply_v1(conn: &Connection) -> Result<(), ProjectionError> {
    conn.execute_batch(
        r#"
        -- Append-only binary snapshots; never updated or deleted
        CREATE TABLE snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            page_id TEXT NOT NULL,
            snapshot BLOB NOT NULL,
            version INTEGER NOT NULL,         -- epoch seconds
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL       -- epoch ms
        );

        -- Decoded content units, one row per (page, node id)
        CREATE TABLE nodes (
            page_id TEXT NOT NULL,
            id TEXT NOT NULL,
            type TEXT NOT NULL,
            content TEXT NOT NULL,            -- JSON
            parent_id TEXT,
            ord INTEGER NOT NULL,
            last_synced_at INTEGER NOT NULL,  -- epoch ms
            PRIMARY KEY (page_id, id)
        );

        -- Immutable history, appended on every node update
        CREATE TABLE node_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            page_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            content TEXT NOT NULL,
            changed_by TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );

        CREATE INDEX idx_snapshots_page ON snapshots(page_id, id);
        CREATE INDEX idx_nodes_page_order ON nodes(page_id, ord);
        CREATE INDEX idx_node_versions_node ON node_versions(page_id, node_id, id);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["snapshots", "nodes", "node_versions", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_steps_recorded_by_name() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let name: String = conn
            .query_row("SELECT name FROM schema_migrations WHERE version = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, STEPS[0].0);
    }

    #[test]
    fn test_newer_schema_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, 'future', 0)",
            params![CURRENT_VERSION + 1],
        )
        .unwrap();

        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, ProjectionError::Migration(_)), "{err}");
    }
}
