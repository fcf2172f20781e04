//! Value types shared by every stage of the compaction pipeline.
//!
//! - [`GroupId`]: a state group, one node of the DAG.
//! - [`StateKey`]: the `(type, state_key)` pair a delta entry is keyed by.
//! - [`EventId`]: the value-reference stored under a key.
//! - [`StateMap`]: a delta or a fully resolved state.
//! - [`IntervalRow`]: one value's presence window in processing-step
//!   coordinates.
//!
//! Strings are held as `Arc<str>` so that copying a resolved state map
//! during overlay never copies key or event text.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a state group.
pub type GroupId = i64;

/// Per-group delta or resolved state: `(type, state_key)` → event.
pub type StateMap = HashMap<StateKey, EventId>;

/// A delta as loaded from the store. Deltas are never mutated after loading.
pub type Delta = StateMap;

/// A materialized state, shared between the memo and its consumers.
pub type ResolvedState = Arc<StateMap>;

// ---------------------------------------------------------------------------
// StateKey
// ---------------------------------------------------------------------------

/// Composite key of a state entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    /// Event type, e.g. `m.room.member`.
    pub event_type: Arc<str>,
    /// State key within the type; empty for singleton state.
    pub state_key: Arc<str>,
}

impl StateKey {
    #[must_use]
    pub fn new(event_type: &str, state_key: &str) -> Self {
        Self {
            event_type: Arc::from(event_type),
            state_key: Arc::from(state_key),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.event_type, &*self.state_key)
    }
}

// ---------------------------------------------------------------------------
// EventId
// ---------------------------------------------------------------------------

/// Opaque value-reference held by a state entry.
///
/// Equality is identity of the reference: two keys holding "the same"
/// payload under different ids are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Arc<str>);

impl EventId {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Store rows
// ---------------------------------------------------------------------------

/// One DAG edge: `group` inherits state from `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub group: GroupId,
    pub parent: GroupId,
}

impl Edge {
    #[must_use]
    pub const fn new(group: GroupId, parent: GroupId) -> Self {
        Self { group, parent }
    }
}

/// One delta entry as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRow {
    pub group: GroupId,
    pub key: StateKey,
    pub event_id: EventId,
}

impl DeltaRow {
    #[must_use]
    pub fn new(group: GroupId, event_type: &str, state_key: &str, event_id: &str) -> Self {
        Self {
            group,
            key: StateKey::new(event_type, state_key),
            event_id: EventId::new(event_id),
        }
    }
}

// ---------------------------------------------------------------------------
// IntervalRow
// ---------------------------------------------------------------------------

/// Presence window of one event in the current state, in step coordinates.
///
/// The event is part of the state at step `S` iff
/// `start_step <= S && end_step.is_none_or(|end| end > S)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRow {
    /// Step at which the event appeared.
    pub start_step: u64,
    /// Step at which the event disappeared; `None` while still present.
    pub end_step: Option<u64>,
    /// Group processed at `start_step`.
    pub start_group: GroupId,
    /// Group processed at `end_step`.
    pub end_group: Option<GroupId>,
    pub event_id: EventId,
    /// Key the event held for the whole lifetime of the row.
    pub key: StateKey,
}

impl IntervalRow {
    /// Returns `true` if the row is part of the state at `step`.
    #[must_use]
    pub fn covers(&self, step: u64) -> bool {
        self.start_step <= step && self.end_step.is_none_or(|end| end > step)
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end_step.is_none()
    }
}
