//! Reads over the compacted interval table.
//!
//! Two query shapes cover every use:
//! - current state: `end_step IS NULL`
//! - state as of step `S`: `start_step <= S AND (end_step IS NULL OR end_step > S)`
//!
//! [`reconstruct_at`] applies the same predicate to rows held in memory.

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::model::{EventId, IntervalRow, StateKey, StateMap};
use crate::store::sqlite::step_to_sql;

const INTERVAL_COLUMNS: &str =
    "start_step, end_step, start_group, end_group, event_id, type, state_key";

fn step_from_sql(idx: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(error)))
}

fn interval_from_row(row: &Row<'_>) -> rusqlite::Result<IntervalRow> {
    let end_step: Option<i64> = row.get(1)?;
    let event_id: String = row.get(4)?;
    let event_type: String = row.get(5)?;
    let state_key: String = row.get(6)?;
    Ok(IntervalRow {
        start_step: step_from_sql(0, row.get(0)?)?,
        end_step: end_step.map(|s| step_from_sql(1, s)).transpose()?,
        start_group: row.get(2)?,
        end_group: row.get(3)?,
        event_id: EventId::from(event_id),
        key: StateKey::new(&event_type, &state_key),
    })
}

fn collect_state(rows: impl IntoIterator<Item = IntervalRow>) -> StateMap {
    rows.into_iter().map(|row| (row.key, row.event_id)).collect()
}

/// Every interval row of `scope`, ordered by start step then event id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn read_intervals(conn: &Connection, scope: &str) -> Result<Vec<IntervalRow>> {
    let sql = format!(
        "SELECT {INTERVAL_COLUMNS} FROM state_intervals
         WHERE room_id = ?1
         ORDER BY start_step, event_id"
    );
    let mut stmt = conn.prepare(&sql).context("prepare interval scan")?;
    let rows = stmt
        .query_map([scope], interval_from_row)
        .context("execute interval scan")?
        .collect::<Result<Vec<_>, _>>()
        .context("collect interval rows")?;
    Ok(rows)
}

/// State after the last processed step.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn current_state(conn: &Connection, scope: &str) -> Result<StateMap> {
    let sql = format!(
        "SELECT {INTERVAL_COLUMNS} FROM state_intervals
         WHERE room_id = ?1 AND end_step IS NULL"
    );
    let mut stmt = conn.prepare_cached(&sql).context("prepare current state query")?;
    let rows = stmt
        .query_map([scope], interval_from_row)
        .context("execute current state query")?
        .collect::<Result<Vec<_>, _>>()
        .context("collect current state")?;
    Ok(collect_state(rows))
}

/// State as of processing step `step`.
///
/// # Errors
///
/// Returns an error if `step` does not fit the column type or the query
/// fails.
pub fn state_at(conn: &Connection, scope: &str, step: u64) -> Result<StateMap> {
    let step = step_to_sql(step)?;
    let sql = format!(
        "SELECT {INTERVAL_COLUMNS} FROM state_intervals
         WHERE room_id = ?1
           AND start_step <= ?2
           AND (end_step IS NULL OR end_step > ?2)"
    );
    let mut stmt = conn.prepare_cached(&sql).context("prepare historic state query")?;
    let rows = stmt
        .query_map(params![scope, step], interval_from_row)
        .context("execute historic state query")?
        .collect::<Result<Vec<_>, _>>()
        .context("collect historic state")?;
    Ok(collect_state(rows))
}

/// Number of steps processed by the last committed run of `scope`.
///
/// Tables written before runs were recorded fall back to one past the
/// largest step any row mentions, which undercounts trailing steps that
/// changed nothing. 0 when nothing is recorded.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn recorded_steps(conn: &Connection, scope: &str) -> Result<u64> {
    let steps: Option<i64> = conn
        .query_row(
            "SELECT steps FROM compaction_runs WHERE room_id = ?1",
            [scope],
            |row| row.get(0),
        )
        .optional()
        .context("query compaction run")?;
    if let Some(steps) = steps {
        return u64::try_from(steps).context("negative step count in compaction_runs");
    }

    let max: Option<i64> = conn
        .query_row(
            "SELECT MAX(MAX(start_step), COALESCE(MAX(end_step), 0))
             FROM state_intervals WHERE room_id = ?1",
            [scope],
            |row| row.get(0),
        )
        .context("query recorded steps")?;
    Ok(max.map_or(0, |m| u64::try_from(m).unwrap_or(0) + 1))
}

/// In-memory form of [`state_at`].
#[must_use]
pub fn reconstruct_at(rows: &[IntervalRow], step: u64) -> StateMap {
    collect_state(rows.iter().filter(|row| row.covers(step)).cloned())
}
