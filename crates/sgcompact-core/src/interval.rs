//! Interval encoding of step diffs.
//!
//! Each appearance opens a row and each disappearance closes the most
//! recent open row of that value. Closed rows queue up in the order they
//! were closed, which is also ascending `end_step`, and leave in full pages
//! as soon as enough of them have closed. Open rows stay buffered until
//! [`IntervalWriter::finish`], so the buffer holds the current state plus
//! at most one page of closed rows.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::diff::StateDiff;
use crate::error::CompactError;
use crate::model::{EventId, GroupId, IntervalRow, StateKey};

/// Default number of rows per persisted page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Accumulates interval rows for one run.
#[derive(Debug)]
pub struct IntervalWriter {
    page_size: usize,
    /// Closed rows not yet handed out, in close order.
    closed: VecDeque<IntervalRow>,
    /// Open rows keyed by open sequence number.
    open: BTreeMap<u64, IntervalRow>,
    open_seq: HashMap<EventId, u64>,
    open_keys: HashMap<StateKey, EventId>,
    key_of: HashMap<EventId, StateKey>,
    next_seq: u64,
    emitted: u64,
}

impl IntervalWriter {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            closed: VecDeque::new(),
            open: BTreeMap::new(),
            open_seq: HashMap::new(),
            open_keys: HashMap::new(),
            key_of: HashMap::new(),
            next_seq: 0,
            emitted: 0,
        }
    }

    /// Rows currently open.
    #[must_use]
    pub fn open_rows(&self) -> usize {
        self.open.len()
    }

    /// Rows buffered and not yet handed out.
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        self.closed.len() + self.open.len()
    }

    /// Rows handed out so far.
    #[must_use]
    pub const fn emitted_rows(&self) -> u64 {
        self.emitted
    }

    /// Record the diff of `step` (processing `group`). Disappearances are
    /// applied before appearances.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::InvariantViolation`] on a close without an
    /// open row, a second open row for one value or one key, or a value
    /// reappearing under a different key.
    pub fn apply(&mut self, step: u64, group: GroupId, diff: &StateDiff) -> Result<(), CompactError> {
        for event_id in &diff.disappeared {
            let mut row = self
                .open_seq
                .remove(event_id)
                .and_then(|seq| self.open.remove(&seq))
                .ok_or_else(|| {
                    CompactError::invariant(format!(
                        "event {event_id} disappeared at step {step} without an open interval"
                    ))
                })?;
            row.end_step = Some(step);
            row.end_group = Some(group);
            self.open_keys.remove(&row.key);
            self.closed.push_back(row);
        }

        for (event_id, key) in &diff.appeared {
            match self.key_of.get(event_id) {
                Some(known) if known != key => {
                    return Err(CompactError::invariant(format!(
                        "event {event_id} appeared under {key} after being held by {known}"
                    )));
                }
                Some(_) => {}
                None => {
                    self.key_of.insert(event_id.clone(), key.clone());
                }
            }
            if self.open_seq.contains_key(event_id) {
                return Err(CompactError::invariant(format!(
                    "event {event_id} appeared at step {step} while already open"
                )));
            }
            if let Some(holder) = self.open_keys.get(key) {
                return Err(CompactError::invariant(format!(
                    "key {key} gained {event_id} at step {step} while {holder} is still open"
                )));
            }

            self.open_seq.insert(event_id.clone(), self.next_seq);
            self.open_keys.insert(key.clone(), event_id.clone());
            self.open.insert(
                self.next_seq,
                IntervalRow {
                    start_step: step,
                    end_step: None,
                    start_group: group,
                    end_group: None,
                    event_id: event_id.clone(),
                    key: key.clone(),
                },
            );
            self.next_seq += 1;
        }
        Ok(())
    }

    /// Next full page of closed rows, if one is ready.
    pub fn take_page(&mut self) -> Option<Vec<IntervalRow>> {
        if self.closed.len() < self.page_size {
            return None;
        }
        let page: Vec<IntervalRow> = self.closed.drain(..self.page_size).collect();
        self.emitted += self.page_size as u64;
        Some(page)
    }

    /// Every remaining row: closed rows in close order, then open rows in
    /// open order.
    #[must_use]
    pub fn finish(mut self) -> Vec<IntervalRow> {
        let mut rows: Vec<IntervalRow> = self.closed.drain(..).collect();
        rows.extend(std::mem::take(&mut self.open).into_values());
        self.emitted += rows.len() as u64;
        rows
    }
}

impl Default for IntervalWriter {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}
