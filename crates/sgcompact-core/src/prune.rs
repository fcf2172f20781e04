//! Reference counting of memoized states.
//!
//! A materialized group starts with one reference per child plus one
//! self-hold while its own processing step is still pending. Children
//! consume their parents as they materialize; the self-hold is dropped
//! after the group's own step was diffed. At zero the memo entry is no
//! longer reachable by any future computation and can be evicted.
//!
//! Counting runs even with pruning disabled so that double consumption is
//! caught either way; only the eviction decision depends on the flag.

use crate::error::CompactError;

/// What the caller should do with a memo entry after a count update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Keep,
    Evict,
}

/// Per-node consumer counts over dense DAG indices.
#[derive(Debug, Clone)]
pub struct Pruner {
    counts: Vec<usize>,
    tracked: Vec<bool>,
    enabled: bool,
    evicted: usize,
}

impl Pruner {
    #[must_use]
    pub fn new(nodes: usize, enabled: bool) -> Self {
        Self {
            counts: vec![0; nodes],
            tracked: vec![false; nodes],
            enabled,
            evicted: 0,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start counting `idx` with `children` consumers, plus the self-hold
    /// when its step is still pending.
    pub fn on_materialized(&mut self, idx: usize, children: usize, step_pending: bool) -> Release {
        self.tracked[idx] = true;
        self.counts[idx] = children + usize::from(step_pending);
        if self.counts[idx] == 0 {
            self.zero_reached()
        } else {
            Release::Keep
        }
    }

    /// A child of `idx` has consumed its state.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::InvariantViolation`] if `idx` was never
    /// materialized or has no outstanding consumers.
    pub fn on_consumed(&mut self, idx: usize) -> Result<Release, CompactError> {
        self.decrement(idx, "consumed")
    }

    /// Drop the self-hold of `idx` after its step was processed.
    ///
    /// # Errors
    ///
    /// Same as [`Pruner::on_consumed`].
    pub fn release(&mut self, idx: usize) -> Result<Release, CompactError> {
        self.decrement(idx, "released")
    }

    /// Whether the next decrement brings `idx` to zero with pruning on, so
    /// the caller may take the memoized state instead of copying it.
    #[must_use]
    pub fn is_last_consumer(&self, idx: usize) -> bool {
        self.enabled && self.tracked[idx] && self.counts[idx] == 1
    }

    /// Outstanding consumers of `idx`.
    #[must_use]
    pub fn outstanding(&self, idx: usize) -> usize {
        self.counts[idx]
    }

    /// Entries evicted so far.
    #[must_use]
    pub const fn evicted(&self) -> usize {
        self.evicted
    }

    fn decrement(&mut self, idx: usize, action: &str) -> Result<Release, CompactError> {
        if !self.tracked[idx] {
            return Err(CompactError::invariant(format!(
                "node {idx} {action} before it was materialized"
            )));
        }
        let count = &mut self.counts[idx];
        *count = count.checked_sub(1).ok_or_else(|| {
            CompactError::invariant(format!("node {idx} {action} with no outstanding references"))
        })?;
        if *count == 0 {
            Ok(self.zero_reached())
        } else {
            Ok(Release::Keep)
        }
    }

    fn zero_reached(&mut self) -> Release {
        if self.enabled {
            self.evicted += 1;
            Release::Evict
        } else {
            Release::Keep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Pruner, Release};
    use crate::error::CompactError;

    #[test]
    fn evicts_after_children_and_self_hold() {
        let mut pruner = Pruner::new(3, true);
        assert_eq!(pruner.on_materialized(0, 2, true), Release::Keep);
        assert_eq!(pruner.outstanding(0), 3);

        assert_eq!(pruner.on_consumed(0).expect("child 1"), Release::Keep);
        assert_eq!(pruner.release(0).expect("own step"), Release::Keep);
        assert!(pruner.is_last_consumer(0));
        assert_eq!(pruner.on_consumed(0).expect("child 2"), Release::Evict);
        assert_eq!(pruner.evicted(), 1);
    }

    #[test]
    fn sink_is_freed_by_release() {
        let mut pruner = Pruner::new(1, true);
        pruner.on_materialized(0, 0, true);
        assert_eq!(pruner.release(0).expect("release"), Release::Evict);
    }

    #[test]
    fn decrement_below_zero_is_rejected() {
        let mut pruner = Pruner::new(1, true);
        pruner.on_materialized(0, 1, false);
        pruner.on_consumed(0).expect("only consumer");
        let err = pruner.on_consumed(0).expect_err("second consume");
        assert!(matches!(err, CompactError::InvariantViolation(_)));
    }

    #[test]
    fn untracked_node_is_rejected() {
        let mut pruner = Pruner::new(2, false);
        assert!(pruner.release(1).is_err());
    }

    #[test]
    fn disabled_pruner_counts_but_never_evicts() {
        let mut pruner = Pruner::new(1, false);
        pruner.on_materialized(0, 1, true);
        assert!(!pruner.is_last_consumer(0));
        assert_eq!(pruner.on_consumed(0).expect("child"), Release::Keep);
        assert_eq!(pruner.release(0).expect("own step"), Release::Keep);
        assert_eq!(pruner.evicted(), 0);
        assert!(pruner.release(0).is_err(), "still counted");
    }
}
