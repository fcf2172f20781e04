//! SQLite adapter for [`StateStore`] and [`IntervalSink`].
//!
//! Runtime defaults match every other connection this workspace opens:
//! - `journal_mode = WAL` so a prefetch reader can run beside the writer
//! - `busy_timeout = 5s` to ride out transient lock contention
//! - `synchronous = NORMAL`

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params, params_from_iter};
use tracing::instrument;

use super::{IntervalSink, StateStore, StoreError, migrations};
use crate::model::{DeltaRow, Edge, EventId, GroupId, IntervalRow, StateKey};

/// Busy timeout used for every store connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) a store database, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening, configuring, or migrating the database fails.
pub fn open_store(path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create store directory {}", parent.display()))?;
    }

    let mut conn =
        Connection::open(path).with_context(|| format!("open store {}", path.display()))?;
    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply store migrations")?;

    Ok(SqliteStore::from_parts(conn, Some(path.to_path_buf())))
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// Store backed by one SQLite connection.
///
/// The open interval run is tracked per connection; SQLite itself holds the
/// transaction.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    open_run: RefCell<Option<String>>,
}

impl SqliteStore {
    /// In-memory store, migrated to the latest schema. Cannot hand out
    /// prefetch readers.
    ///
    /// # Errors
    ///
    /// Returns an error if the migrations fail.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory store")?;
        migrations::migrate(&mut conn).context("apply store migrations")?;
        Ok(Self::from_parts(conn, None))
    }

    const fn from_parts(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn,
            path,
            open_run: RefCell::new(None),
        }
    }

    /// Underlying connection, for the query helpers in [`crate::query`].
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Database path; `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn require_open_run(&self, scope: &str) -> Result<(), StoreError> {
        match self.open_run.borrow().as_deref() {
            Some(open) if open == scope => Ok(()),
            _ => Err(StoreError::NoOpenRun(scope.to_owned())),
        }
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Insert groups, edges, and deltas of one scope in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; nothing is written in that case.
    pub fn seed_scope(
        &self,
        scope: &str,
        groups: &[GroupId],
        edges: &[Edge],
        deltas: &[DeltaRow],
    ) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut insert_group =
                tx.prepare_cached("INSERT OR IGNORE INTO state_groups (id, room_id) VALUES (?1, ?2)")?;
            for group in groups {
                insert_group.execute(params![group, scope])?;
            }

            let mut insert_edge = tx.prepare_cached(
                "INSERT OR IGNORE INTO state_group_edges (state_group, prev_state_group)
                 VALUES (?1, ?2)",
            )?;
            for edge in edges {
                insert_group.execute(params![edge.group, scope])?;
                insert_group.execute(params![edge.parent, scope])?;
                insert_edge.execute(params![edge.group, edge.parent])?;
            }

            let mut insert_delta = tx.prepare_cached(
                "INSERT INTO state_groups_state (state_group, room_id, type, state_key, event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in deltas {
                insert_group.execute(params![row.group, scope])?;
                insert_delta.execute(params![
                    row.group,
                    scope,
                    &*row.key.event_type,
                    &*row.key.state_key,
                    row.event_id.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the stored ordering of `scope` with `order` (position = rank).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn store_ordering(&self, scope: &str, order: &[GroupId]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM group_ordering WHERE room_id = ?1", [scope])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO group_ordering (room_id, state_group, ordering)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (rank, group) in order.iter().enumerate() {
                let rank = i64::try_from(rank).map_err(|_| StoreError::OutOfRange {
                    column: "ordering",
                    value: rank.to_string(),
                })?;
                stmt.execute(params![scope, group, rank])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn delta_from_row(row: &Row<'_>) -> rusqlite::Result<DeltaRow> {
    let event_type: String = row.get(1)?;
    let state_key: String = row.get(2)?;
    let event_id: String = row.get(3)?;
    Ok(DeltaRow {
        group: row.get(0)?,
        key: StateKey::new(&event_type, &state_key),
        event_id: EventId::from(event_id),
    })
}

pub(crate) fn step_to_sql(step: u64) -> Result<i64, StoreError> {
    i64::try_from(step).map_err(|_| StoreError::OutOfRange {
        column: "step",
        value: step.to_string(),
    })
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

impl StateStore for SqliteStore {
    fn fetch_edges(&self, scope: &str) -> Result<Vec<Edge>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT e.state_group, e.prev_state_group
             FROM state_group_edges e
             JOIN state_groups g ON g.id = e.state_group
             WHERE g.room_id = ?1
             ORDER BY e.state_group, e.prev_state_group",
        )?;
        let edges = stmt
            .query_map([scope], |row| Ok(Edge::new(row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    fn fetch_groups(&self, scope: &str) -> Result<Vec<GroupId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM state_groups WHERE room_id = ?1 ORDER BY id")?;
        let groups = stmt
            .query_map([scope], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    fn fetch_deltas(&self, scope: &str, groups: &[GroupId]) -> Result<Vec<DeltaRow>, StoreError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; groups.len()].join(", ");
        let sql = format!(
            "SELECT state_group, type, state_key, event_id
             FROM state_groups_state
             WHERE room_id = ? AND state_group IN ({placeholders})
             ORDER BY state_group, type, state_key"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bind = std::iter::once(rusqlite::types::Value::Text(scope.to_owned()))
            .chain(groups.iter().map(|g| rusqlite::types::Value::Integer(*g)));
        let rows = stmt
            .query_map(params_from_iter(bind), delta_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn fetch_group_delta(&self, scope: &str, group: GroupId) -> Result<Vec<DeltaRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT state_group, type, state_key, event_id
             FROM state_groups_state
             WHERE room_id = ?1 AND state_group = ?2
             ORDER BY type, state_key",
        )?;
        let rows = stmt
            .query_map(params![scope, group], delta_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn fetch_ordering(&self, scope: &str) -> Result<Vec<GroupId>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT state_group FROM group_ordering
             WHERE room_id = ?1
             ORDER BY ordering, state_group",
        )?;
        let order = stmt
            .query_map([scope], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(order)
    }

    fn try_clone_reader(&self) -> Result<Option<Box<dyn StateStore + Send>>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let conn = Connection::open(path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        conn.pragma_update(None, "query_only", "ON")?;
        Ok(Some(Box::new(Self::from_parts(conn, Some(path.clone())))))
    }
}

// ---------------------------------------------------------------------------
// IntervalSink
// ---------------------------------------------------------------------------

impl IntervalSink for SqliteStore {
    #[instrument(skip(self))]
    fn begin_intervals(&self, scope: &str) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        if let Err(error) = self
            .conn
            .execute("DELETE FROM state_intervals WHERE room_id = ?1", [scope])
        {
            if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %rollback, scope, "rollback after failed begin also failed");
            }
            return Err(error.into());
        }
        *self.open_run.borrow_mut() = Some(scope.to_owned());
        Ok(())
    }

    fn append_intervals(&self, scope: &str, rows: &[IntervalRow]) -> Result<(), StoreError> {
        self.require_open_run(scope)?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO state_intervals
                (start_step, end_step, start_group, end_group, event_id, room_id, type, state_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for row in rows {
            let end_step = row.end_step.map(step_to_sql).transpose()?;
            stmt.execute(params![
                step_to_sql(row.start_step)?,
                end_step,
                row.start_group,
                row.end_group,
                row.event_id.as_str(),
                scope,
                &*row.key.event_type,
                &*row.key.state_key,
            ])?;
        }
        Ok(())
    }

    fn commit_intervals(&self, scope: &str, steps: u64) -> Result<(), StoreError> {
        self.require_open_run(scope)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO compaction_runs (room_id, steps, completed_at)
             VALUES (?1, ?2, ?3)",
            params![scope, step_to_sql(steps)?, chrono::Utc::now().to_rfc3339()],
        )?;
        self.conn.execute_batch("COMMIT")?;
        self.open_run.borrow_mut().take();
        Ok(())
    }

    fn rollback_intervals(&self, scope: &str) -> Result<(), StoreError> {
        if self.require_open_run(scope).is_err() {
            return Ok(());
        }
        self.open_run.borrow_mut().take();
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
