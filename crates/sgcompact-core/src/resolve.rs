//! Memoized materialization of resolved states.
//!
//! The resolved state of a group is its own delta overlaid on its parents'
//! resolved states: own entries win, then the first parent in ascending id
//! order, then later parents. Resolution walks ancestors with an explicit
//! stack of enter/exit frames, so DAG depth never reaches the call stack.
//!
//! The memo is an arena indexed by dense DAG index. Counts from
//! [`Pruner`] decide when an entry can be dropped; when a child is the last
//! consumer of its first parent it takes that parent's map and extends it in
//! place instead of copying it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dag::StateDag;
use crate::error::CompactError;
use crate::model::{Delta, GroupId, ResolvedState, StateMap};
use crate::prune::{Pruner, Release};

/// Source of each group's own delta.
pub trait DeltaSource {
    /// Own delta of `group`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be produced; a group that is
    /// not known to the source is an error, never an empty delta.
    fn delta(&mut self, group: GroupId) -> Result<&Delta, CompactError>;
}

impl DeltaSource for HashMap<GroupId, Delta> {
    fn delta(&mut self, group: GroupId) -> Result<&Delta, CompactError> {
        self.get(&group)
            .ok_or_else(|| CompactError::invariant(format!("no delta available for group {group}")))
    }
}

/// Counters of one materializer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializerStats {
    /// States computed (memo misses).
    pub materialized: usize,
    /// Memo hits on `resolve`.
    pub memo_hits: usize,
    /// States built by extending a parent's map in place.
    pub reused_in_place: usize,
    /// Live memo entries right now.
    pub live_entries: usize,
    /// Highest number of simultaneously live memo entries.
    pub peak_live_entries: usize,
    /// Entries dropped by the pruner.
    pub pruned_entries: usize,
}

enum Frame {
    Enter(usize),
    Exit(usize),
}

/// Memo arena plus consumer counts for one run.
#[derive(Debug)]
pub struct Materializer {
    memo: Vec<Option<ResolvedState>>,
    in_progress: Vec<bool>,
    step_done: Vec<bool>,
    pruner: Pruner,
    stats: MaterializerStats,
}

impl Materializer {
    #[must_use]
    pub fn new(dag: &StateDag, prune: bool) -> Self {
        Self {
            memo: vec![None; dag.len()],
            in_progress: vec![false; dag.len()],
            step_done: vec![false; dag.len()],
            pruner: Pruner::new(dag.len(), prune),
            stats: MaterializerStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> MaterializerStats {
        self.stats
    }

    /// Whether `group` currently has a memo entry.
    #[must_use]
    pub fn is_memoized(&self, dag: &StateDag, group: GroupId) -> bool {
        dag.index_of(group)
            .is_some_and(|idx| self.memo[idx].is_some())
    }

    /// Resolved state of `group`.
    ///
    /// # Errors
    ///
    /// - [`CompactError::InvariantViolation`] if `group` is not in `dag`, or a
    ///   delta is missing, or consumer counts go negative.
    /// - [`CompactError::CyclicGraph`] if an ancestor depends on itself.
    pub fn resolve(
        &mut self,
        dag: &StateDag,
        group: GroupId,
        source: &mut dyn DeltaSource,
    ) -> Result<ResolvedState, CompactError> {
        let idx = dag
            .index_of(group)
            .ok_or_else(|| CompactError::invariant(format!("group {group} is not part of the DAG")))?;

        if let Some(state) = &self.memo[idx] {
            self.stats.memo_hits += 1;
            return Ok(Arc::clone(state));
        }

        let mut stack = vec![Frame::Enter(idx)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(node) => {
                    if self.memo[node].is_some() {
                        continue;
                    }
                    if self.in_progress[node] {
                        return Err(CompactError::CyclicGraph {
                            members: dag.cycle_through(node),
                        });
                    }
                    self.in_progress[node] = true;
                    stack.push(Frame::Exit(node));
                    for parent in dag.parents(node).iter().rev() {
                        if self.memo[*parent].is_none() {
                            stack.push(Frame::Enter(*parent));
                        }
                    }
                }
                Frame::Exit(node) => {
                    self.in_progress[node] = false;
                    self.materialize(dag, node, source)?;
                }
            }
        }

        self.memo[idx]
            .clone()
            .ok_or_else(|| CompactError::invariant(format!("group {group} was evicted while resolving")))
    }

    /// Drop the self-hold of `group` once its step was diffed.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::InvariantViolation`] if `group` is unknown,
    /// was never materialized, or its step was already finished.
    pub fn finish_step(&mut self, dag: &StateDag, group: GroupId) -> Result<(), CompactError> {
        let idx = dag
            .index_of(group)
            .ok_or_else(|| CompactError::invariant(format!("group {group} is not part of the DAG")))?;
        if std::mem::replace(&mut self.step_done[idx], true) {
            return Err(CompactError::invariant(format!("step of group {group} finished twice")));
        }
        let release = self.pruner.release(idx)?;
        self.apply(idx, release);
        Ok(())
    }

    fn materialize(
        &mut self,
        dag: &StateDag,
        node: usize,
        source: &mut dyn DeltaSource,
    ) -> Result<(), CompactError> {
        let parents = dag.parents(node);
        let own = source.delta(dag.group_id(node))?;

        let state = match parents.split_first() {
            None => own.clone(),
            Some((first, rest)) => {
                let mut state = self.take_or_copy(*first)?;
                state.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
                for parent in rest {
                    let inherited = self.memo[*parent].as_ref().ok_or_else(|| {
                        CompactError::invariant(format!(
                            "parent {} of group {} is not materialized",
                            dag.group_id(*parent),
                            dag.group_id(node)
                        ))
                    })?;
                    for (key, value) in inherited.iter() {
                        state.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                state
            }
        };

        for parent in parents {
            let release = self.pruner.on_consumed(*parent)?;
            self.apply(*parent, release);
        }

        self.memo[node] = Some(Arc::new(state));
        self.stats.materialized += 1;
        self.stats.live_entries += 1;
        self.stats.peak_live_entries = self.stats.peak_live_entries.max(self.stats.live_entries);

        let step_pending = !self.step_done[node];
        let release = self
            .pruner
            .on_materialized(node, dag.child_count(node), step_pending);
        self.apply(node, release);
        Ok(())
    }

    /// The first parent's map, taken when this is its last consumer.
    fn take_or_copy(&mut self, parent: usize) -> Result<StateMap, CompactError> {
        if self.pruner.is_last_consumer(parent) {
            if let Some(mut arc) = self.memo[parent].take() {
                self.stats.live_entries -= 1;
                self.stats.pruned_entries += 1;
                self.stats.reused_in_place += 1;
                // Copies only if a caller still shares the map.
                return Ok(std::mem::take(Arc::make_mut(&mut arc)));
            }
        }
        self.memo[parent]
            .as_deref()
            .cloned()
            .ok_or_else(|| CompactError::invariant(format!("parent node {parent} is not materialized")))
    }

    fn apply(&mut self, idx: usize, release: Release) {
        if release == Release::Evict && self.memo[idx].take().is_some() {
            self.stats.live_entries -= 1;
            self.stats.pruned_entries += 1;
        }
    }
}
