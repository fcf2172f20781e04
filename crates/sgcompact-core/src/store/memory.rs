//! In-memory [`StateStore`] / [`IntervalSink`] used by tests, the simulator,
//! and benchmarks.
//!
//! Fault injection: [`MemoryStore::fail_next_batches`] makes the next `n`
//! calls to `fetch_deltas` fail with [`StoreError::Unavailable`]. The
//! counter is shared with cloned readers, so prefetch threads see it too.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{IntervalSink, StateStore, StoreError};
use crate::model::{DeltaRow, Edge, GroupId, IntervalRow};

#[derive(Debug, Clone, Default)]
struct ScopeData {
    groups: BTreeSet<GroupId>,
    edges: BTreeSet<Edge>,
    deltas: BTreeMap<GroupId, Vec<DeltaRow>>,
    ordering: Vec<GroupId>,
}

#[derive(Debug, Default)]
struct IntervalLog {
    committed: HashMap<String, Vec<IntervalRow>>,
    steps: HashMap<String, u64>,
    pending: Option<(String, Vec<IntervalRow>)>,
}

/// Counters of store calls, shared between a store and its readers.
#[derive(Debug, Default)]
struct CallCounters {
    batch_faults: AtomicU32,
    single_faults: AtomicU32,
    batch_calls: AtomicU32,
    single_calls: AtomicU32,
}

/// Fixture store holding everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    scopes: HashMap<String, ScopeData>,
    counters: Arc<CallCounters>,
    intervals: Arc<Mutex<IntervalLog>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_mut(&mut self, scope: &str) -> &mut ScopeData {
        self.scopes.entry(scope.to_owned()).or_default()
    }

    /// Register a group without edges or delta rows.
    pub fn add_group(&mut self, scope: &str, group: GroupId) -> &mut Self {
        self.scope_mut(scope).groups.insert(group);
        self
    }

    /// Register `group → parent`; both ends become groups of the scope.
    pub fn add_edge(&mut self, scope: &str, group: GroupId, parent: GroupId) -> &mut Self {
        let data = self.scope_mut(scope);
        data.groups.insert(group);
        data.groups.insert(parent);
        data.edges.insert(Edge::new(group, parent));
        self
    }

    /// Add one delta row to `group`.
    pub fn add_delta(
        &mut self,
        scope: &str,
        group: GroupId,
        event_type: &str,
        state_key: &str,
        event_id: &str,
    ) -> &mut Self {
        let data = self.scope_mut(scope);
        data.groups.insert(group);
        data.deltas
            .entry(group)
            .or_default()
            .push(DeltaRow::new(group, event_type, state_key, event_id));
        self
    }

    /// Replace the stored ordering of `scope`.
    pub fn set_ordering(&mut self, scope: &str, order: Vec<GroupId>) -> &mut Self {
        self.scope_mut(scope).ordering = order;
        self
    }

    /// Fail the next `n` batch reads.
    pub fn fail_next_batches(&self, n: u32) {
        self.counters.batch_faults.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` single-group reads.
    pub fn fail_next_single_reads(&self, n: u32) {
        self.counters.single_faults.store(n, Ordering::SeqCst);
    }

    /// Number of `fetch_deltas` calls so far, including failed ones.
    #[must_use]
    pub fn batch_calls(&self) -> u32 {
        self.counters.batch_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_group_delta` calls so far, including failed ones.
    #[must_use]
    pub fn single_group_calls(&self) -> u32 {
        self.counters.single_calls.load(Ordering::SeqCst)
    }

    /// Rows of the last committed run of `scope`, in append order.
    #[must_use]
    pub fn committed_intervals(&self, scope: &str) -> Vec<IntervalRow> {
        self.intervals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .committed
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    /// Step count recorded by the last committed run of `scope`.
    #[must_use]
    pub fn committed_steps(&self, scope: &str) -> Option<u64> {
        self.intervals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .steps
            .get(scope)
            .copied()
    }

    fn data(&self, scope: &str) -> Option<&ScopeData> {
        self.scopes.get(scope)
    }
}

impl StateStore for MemoryStore {
    fn fetch_edges(&self, scope: &str) -> Result<Vec<Edge>, StoreError> {
        Ok(self
            .data(scope)
            .map(|d| d.edges.iter().copied().collect())
            .unwrap_or_default())
    }

    fn fetch_groups(&self, scope: &str) -> Result<Vec<GroupId>, StoreError> {
        Ok(self
            .data(scope)
            .map(|d| d.groups.iter().copied().collect())
            .unwrap_or_default())
    }

    fn fetch_deltas(&self, scope: &str, groups: &[GroupId]) -> Result<Vec<DeltaRow>, StoreError> {
        self.counters.batch_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .counters
            .batch_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected batch fault".into()));
        }

        let Some(data) = self.data(scope) else {
            return Ok(Vec::new());
        };
        let wanted: BTreeSet<GroupId> = groups.iter().copied().collect();
        Ok(wanted
            .iter()
            .filter_map(|g| data.deltas.get(g))
            .flatten()
            .cloned()
            .collect())
    }

    fn fetch_group_delta(&self, scope: &str, group: GroupId) -> Result<Vec<DeltaRow>, StoreError> {
        self.counters.single_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .counters
            .single_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected single-group fault".into()));
        }
        Ok(self
            .data(scope)
            .and_then(|d| d.deltas.get(&group))
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_ordering(&self, scope: &str) -> Result<Vec<GroupId>, StoreError> {
        Ok(self
            .data(scope)
            .map(|d| d.ordering.clone())
            .unwrap_or_default())
    }

    fn try_clone_reader(&self) -> Result<Option<Box<dyn StateStore + Send>>, StoreError> {
        Ok(Some(Box::new(self.clone())))
    }
}

impl IntervalSink for MemoryStore {
    fn begin_intervals(&self, scope: &str) -> Result<(), StoreError> {
        let mut log = self.intervals.lock().unwrap_or_else(PoisonError::into_inner);
        log.pending = Some((scope.to_owned(), Vec::new()));
        Ok(())
    }

    fn append_intervals(&self, scope: &str, rows: &[IntervalRow]) -> Result<(), StoreError> {
        let mut log = self.intervals.lock().unwrap_or_else(PoisonError::into_inner);
        match log.pending.as_mut() {
            Some((open, pending)) if open == scope => {
                pending.extend_from_slice(rows);
                Ok(())
            }
            _ => Err(StoreError::NoOpenRun(scope.to_owned())),
        }
    }

    fn commit_intervals(&self, scope: &str, steps: u64) -> Result<(), StoreError> {
        let mut log = self.intervals.lock().unwrap_or_else(PoisonError::into_inner);
        match log.pending.take() {
            Some((open, rows)) if open == scope => {
                log.steps.insert(open.clone(), steps);
                log.committed.insert(open, rows);
                Ok(())
            }
            other => {
                log.pending = other;
                Err(StoreError::NoOpenRun(scope.to_owned()))
            }
        }
    }

    fn rollback_intervals(&self, scope: &str) -> Result<(), StoreError> {
        let mut log = self.intervals.lock().unwrap_or_else(PoisonError::into_inner);
        if log.pending.as_ref().is_some_and(|(open, _)| open == scope) {
            log.pending = None;
        }
        Ok(())
    }
}
