//! Exact set difference between consecutive resolved states.
//!
//! Diffs operate on value-references. A key whose value changes between two
//! steps contributes one appearance and one disappearance.

use std::collections::HashMap;

use crate::error::CompactError;
use crate::model::{EventId, StateKey, StateMap};

/// Value-reference → the key holding it, for one resolved state.
pub type ValueIndex = HashMap<EventId, StateKey>;

/// Values that appeared and disappeared between two steps, each sorted by
/// event id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub appeared: Vec<(EventId, StateKey)>,
    pub disappeared: Vec<EventId>,
}

impl StateDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }
}

/// Index a resolved state by value.
///
/// # Errors
///
/// Returns [`CompactError::InvariantViolation`] if one value is held by two
/// keys.
pub fn value_index(state: &StateMap) -> Result<ValueIndex, CompactError> {
    let mut index = ValueIndex::with_capacity(state.len());
    for (key, event_id) in state {
        if let Some(other) = index.insert(event_id.clone(), key.clone()) {
            let (first, second) = if other < *key { (&other, key) } else { (key, &other) };
            return Err(CompactError::invariant(format!(
                "event {event_id} is held by both {first} and {second}"
            )));
        }
    }
    Ok(index)
}

/// `appeared = current − previous`, `disappeared = previous − current`.
#[must_use]
pub fn diff(previous: &ValueIndex, current: &ValueIndex) -> StateDiff {
    let mut appeared: Vec<(EventId, StateKey)> = current
        .iter()
        .filter(|(event_id, _)| !previous.contains_key(*event_id))
        .map(|(event_id, key)| (event_id.clone(), key.clone()))
        .collect();
    let mut disappeared: Vec<EventId> = previous
        .keys()
        .filter(|event_id| !current.contains_key(*event_id))
        .cloned()
        .collect();

    appeared.sort_unstable();
    disappeared.sort_unstable();
    StateDiff {
        appeared,
        disappeared,
    }
}
