//! Storage seams of the engine.
//!
//! [`StateStore`] is the read side (edges, deltas, stored ordering) and
//! [`IntervalSink`] the write side (transactional, append-only interval
//! persistence). Both take `&self`: the bundled adapters serialize access
//! internally, which lets one object play both roles in a run.
//!
//! Adapters:
//! - [`sqlite::SqliteStore`]: the production adapter over `rusqlite`.
//! - [`memory::MemoryStore`]: in-memory fixture store with fault injection.

pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

use crate::model::{DeltaRow, Edge, GroupId, IntervalRow};

/// Failures raised by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Transient unavailability; callers may retry the read.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no interval run is open for scope {0}")]
    NoOpenRun(String),

    #[error("value out of range for column {column}: {value}")]
    OutOfRange { column: &'static str, value: String },
}

/// Scope-filtered reads of the state-group tables.
pub trait StateStore {
    /// All `(group, parent)` edges of the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn fetch_edges(&self, scope: &str) -> Result<Vec<Edge>, StoreError>;

    /// All group ids of the scope in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn fetch_groups(&self, scope: &str) -> Result<Vec<GroupId>, StoreError>;

    /// Delta rows of `groups`, ordered by group id with each group's rows
    /// contiguous.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn fetch_deltas(&self, scope: &str, groups: &[GroupId]) -> Result<Vec<DeltaRow>, StoreError>;

    /// Delta rows of a single group.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn fetch_group_delta(&self, scope: &str, group: GroupId) -> Result<Vec<DeltaRow>, StoreError>;

    /// Externally computed processing order; empty when none was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn fetch_ordering(&self, scope: &str) -> Result<Vec<GroupId>, StoreError>;

    /// Independent reader handle that can be moved to a prefetch thread.
    ///
    /// `Ok(None)` means the adapter cannot hand out a second reader and the
    /// loader falls back to synchronous reads.
    ///
    /// # Errors
    ///
    /// Returns an error if opening the second handle fails.
    fn try_clone_reader(&self) -> Result<Option<Box<dyn StateStore + Send>>, StoreError> {
        Ok(None)
    }
}

/// Transactional, append-only interval persistence for one scope at a time.
pub trait IntervalSink {
    /// Open the run transaction and drop any rows of earlier runs of `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be opened.
    fn begin_intervals(&self, scope: &str) -> Result<(), StoreError>;

    /// Append one page of rows to the open run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoOpenRun`] without a matching `begin`, or the
    /// adapter's write error.
    fn append_intervals(&self, scope: &str, rows: &[IntervalRow]) -> Result<(), StoreError>;

    /// Make the run's rows visible and record that the run covered `steps`
    /// processing steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit_intervals(&self, scope: &str, steps: u64) -> Result<(), StoreError>;

    /// Discard every row appended since `begin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    fn rollback_intervals(&self, scope: &str) -> Result<(), StoreError>;
}
