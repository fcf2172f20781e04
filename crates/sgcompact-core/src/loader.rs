//! Batched delta loading in processing order.
//!
//! The visitation order is cut into batches of `batch_size` groups. Each
//! batch is one `fetch_deltas` read whose rows arrive ordered by group id;
//! [`DeltaAccumulator`] folds them into per-group deltas. A failed read,
//! batched or on-demand, is retried with exponential backoff before
//! surfacing as [`CompactError::BatchLoad`].
//!
//! With prefetch enabled, a scoped background thread reads batch N+1 over a
//! rendezvous channel while batch N is processed, so at most one batch is
//! ever loaded ahead of the consumer.

use std::collections::HashMap;
use std::sync::mpsc::sync_channel;
use std::time::Duration;

use crate::error::CompactError;
use crate::model::{Delta, DeltaRow, GroupId};
use crate::store::{StateStore, StoreError};

/// Upper bound for a single backoff sleep.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// DeltaAccumulator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
enum AccumulatorState {
    #[default]
    Flushed,
    Accumulating { group: GroupId, delta: Delta },
}

/// Folds group-contiguous delta rows into one [`Delta`] per group.
///
/// Transitions `Flushed → Accumulating(group)` on the first row of a group
/// and flushes when a row of a different group arrives.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    state: AccumulatorState,
    done: HashMap<GroupId, Delta>,
}

impl DeltaAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next row.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::InvariantViolation`] if the group's rows are
    /// not contiguous, or if one key is given two different values.
    pub fn push(&mut self, row: DeltaRow) -> Result<(), CompactError> {
        match std::mem::take(&mut self.state) {
            AccumulatorState::Accumulating { group, mut delta } if group == row.group => {
                insert_entry(group, &mut delta, row)?;
                self.state = AccumulatorState::Accumulating { group, delta };
            }
            AccumulatorState::Accumulating { group, delta } => {
                self.done.insert(group, delta);
                self.start(row)?;
            }
            AccumulatorState::Flushed => self.start(row)?,
        }
        Ok(())
    }

    fn start(&mut self, row: DeltaRow) -> Result<(), CompactError> {
        let group = row.group;
        if self.done.contains_key(&group) {
            return Err(CompactError::invariant(format!(
                "delta rows of group {group} are not contiguous"
            )));
        }
        let mut delta = Delta::new();
        insert_entry(group, &mut delta, row)?;
        self.state = AccumulatorState::Accumulating { group, delta };
        Ok(())
    }

    /// Flush the pending group and return every folded delta.
    #[must_use]
    pub fn finish(mut self) -> HashMap<GroupId, Delta> {
        if let AccumulatorState::Accumulating { group, delta } = std::mem::take(&mut self.state) {
            self.done.insert(group, delta);
        }
        self.done
    }
}

fn insert_entry(group: GroupId, delta: &mut Delta, row: DeltaRow) -> Result<(), CompactError> {
    match delta.get(&row.key) {
        Some(existing) if *existing != row.event_id => Err(CompactError::invariant(format!(
            "group {group} maps {} to both {existing} and {}",
            row.key, row.event_id
        ))),
        Some(_) => Ok(()),
        None => {
            delta.insert(row.key, row.event_id);
            Ok(())
        }
    }
}

/// Fold a full row set through a [`DeltaAccumulator`].
///
/// # Errors
///
/// Propagates the accumulator's invariant checks.
pub fn fold_rows(rows: Vec<DeltaRow>) -> Result<HashMap<GroupId, Delta>, CompactError> {
    let mut acc = DeltaAccumulator::new();
    for row in rows {
        acc.push(row)?;
    }
    Ok(acc.finish())
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Exponential backoff for failed delta reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at [`MAX_RETRY_DELAY`].
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Deltas of one batch of groups.
#[derive(Debug, Default)]
pub struct DeltaBatch {
    /// Zero-based batch number.
    pub index: usize,
    /// Groups of the batch, in processing order.
    pub groups: Vec<GroupId>,
    /// Folded deltas; groups without rows are absent.
    pub deltas: HashMap<GroupId, Delta>,
    /// Retries the read needed.
    pub retries: u32,
}

/// Totals over a full pass of [`BatchLoader::for_each_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub batches: usize,
    pub retries: u32,
    pub prefetched: bool,
}

/// Read and fold the deltas of `groups`, retrying per `policy`.
///
/// # Errors
///
/// Returns [`CompactError::BatchLoad`] once retries are exhausted, or
/// [`CompactError::InvariantViolation`] if the rows are malformed or name a
/// group outside the batch.
pub fn load_batch(
    store: &dyn StateStore,
    scope: &str,
    index: usize,
    groups: &[GroupId],
    policy: RetryPolicy,
) -> Result<DeltaBatch, CompactError> {
    let first_group = groups.first().copied().unwrap_or_default();
    let (rows, retries) = read_with_retry(policy, first_group, "delta batch", || {
        store.fetch_deltas(scope, groups)
    })?;

    let deltas = fold_rows(rows)?;
    if let Some(stray) = deltas.keys().find(|g| !groups.contains(g)) {
        return Err(CompactError::invariant(format!(
            "batch starting at group {first_group} returned rows for unrequested group {stray}"
        )));
    }

    tracing::info!(batch = index, first_group, groups = groups.len(), "loaded delta batch");
    Ok(DeltaBatch {
        index,
        groups: groups.to_vec(),
        deltas,
        retries,
    })
}

/// Run `read` until it succeeds or `policy` runs out of retries. Returns
/// the rows and the number of retries spent.
fn read_with_retry(
    policy: RetryPolicy,
    first_group: GroupId,
    what: &str,
    mut read: impl FnMut() -> Result<Vec<DeltaRow>, StoreError>,
) -> Result<(Vec<DeltaRow>, u32), CompactError> {
    let mut retries = 0_u32;
    loop {
        match read() {
            Ok(rows) => return Ok((rows, retries)),
            Err(source) if retries < policy.max_retries => {
                retries += 1;
                let delay = policy.delay_for(retries);
                tracing::warn!(
                    first_group,
                    retry = retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %source,
                    "{what} read failed, retrying"
                );
                std::thread::sleep(delay);
            }
            Err(source) => {
                return Err(CompactError::BatchLoad {
                    first_group,
                    attempts: retries + 1,
                    source,
                });
            }
        }
    }
}

/// Batched loading settings.
#[derive(Debug, Clone, Copy)]
pub struct BatchLoader {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub prefetch: bool,
}

impl BatchLoader {
    /// Load every batch of `order` and hand it to `consume`, in order.
    ///
    /// Stops at the first error from either side.
    ///
    /// # Errors
    ///
    /// Returns the first load error or the first error `consume` returns.
    pub fn for_each_batch<F>(
        &self,
        store: &dyn StateStore,
        scope: &str,
        order: &[GroupId],
        mut consume: F,
    ) -> Result<LoaderStats, CompactError>
    where
        F: FnMut(DeltaBatch) -> Result<(), CompactError>,
    {
        let batch_size = self.batch_size.max(1);

        if self.prefetch {
            match store.try_clone_reader() {
                Ok(Some(reader)) => {
                    return self.prefetched(reader, scope, order, batch_size, consume);
                }
                Ok(None) => {
                    tracing::warn!("store cannot open a second reader; prefetch disabled");
                }
                Err(error) => {
                    tracing::warn!(error = %error, "opening prefetch reader failed; prefetch disabled");
                }
            }
        }

        let mut stats = LoaderStats::default();
        for (index, groups) in order.chunks(batch_size).enumerate() {
            let batch = load_batch(store, scope, index, groups, self.retry)?;
            stats.batches += 1;
            stats.retries += batch.retries;
            consume(batch)?;
        }
        Ok(stats)
    }

    fn prefetched<F>(
        &self,
        reader: Box<dyn StateStore + Send>,
        scope: &str,
        order: &[GroupId],
        batch_size: usize,
        mut consume: F,
    ) -> Result<LoaderStats, CompactError>
    where
        F: FnMut(DeltaBatch) -> Result<(), CompactError>,
    {
        let policy = self.retry;
        std::thread::scope(|s| {
            let (tx, rx) = sync_channel::<Result<DeltaBatch, CompactError>>(0);

            s.spawn(move || {
                for (index, groups) in order.chunks(batch_size).enumerate() {
                    let loaded = load_batch(&*reader, scope, index, groups, policy);
                    let failed = loaded.is_err();
                    if tx.send(loaded).is_err() || failed {
                        break;
                    }
                }
            });

            let mut stats = LoaderStats {
                prefetched: true,
                ..LoaderStats::default()
            };
            for loaded in rx {
                let batch = loaded?;
                stats.batches += 1;
                stats.retries += batch.retries;
                consume(batch)?;
            }
            Ok(stats)
        })
    }
}

/// Read one group's delta outside the batch window, retrying per `policy`.
///
/// # Errors
///
/// Returns [`CompactError::BatchLoad`] once retries are exhausted, or the
/// accumulator's invariant errors.
pub fn load_single(
    store: &dyn StateStore,
    scope: &str,
    group: GroupId,
    policy: RetryPolicy,
) -> Result<Delta, CompactError> {
    let (rows, _) = read_with_retry(policy, group, "single-group delta", || {
        store.fetch_group_delta(scope, group)
    })?;
    if let Some(stray) = rows.iter().find(|r| r.group != group) {
        return Err(CompactError::invariant(format!(
            "single-group read of {group} returned a row of group {}",
            stray.group
        )));
    }
    Ok(fold_rows(rows)?.remove(&group).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::{BatchLoader, DeltaAccumulator, RetryPolicy, fold_rows, load_batch, load_single};
    use crate::error::CompactError;
    use crate::model::{DeltaRow, EventId, StateKey};
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        for group in 1..=7 {
            store.add_delta("!r", group, "t", &format!("k{group}"), &format!("$e{group}"));
        }
        store.add_group("!r", 8);
        store
    }

    #[test]
    fn accumulator_folds_contiguous_groups() {
        let folded = fold_rows(vec![
            DeltaRow::new(1, "t", "a", "$a"),
            DeltaRow::new(1, "t", "b", "$b"),
            DeltaRow::new(2, "t", "a", "$c"),
        ])
        .expect("fold");

        assert_eq!(folded.len(), 2);
        assert_eq!(folded[&1].len(), 2);
        assert_eq!(folded[&2][&StateKey::new("t", "a")], EventId::new("$c"));
    }

    #[test]
    fn accumulator_rejects_interleaved_groups() {
        let mut acc = DeltaAccumulator::new();
        acc.push(DeltaRow::new(1, "t", "a", "$a")).expect("first");
        acc.push(DeltaRow::new(2, "t", "a", "$b")).expect("second");
        let err = acc.push(DeltaRow::new(1, "t", "b", "$c")).expect_err("group 1 again");
        assert!(matches!(err, CompactError::InvariantViolation(_)));
    }

    #[test]
    fn accumulator_rejects_conflicting_key() {
        let err = fold_rows(vec![
            DeltaRow::new(1, "t", "a", "$a"),
            DeltaRow::new(1, "t", "a", "$b"),
        ])
        .expect_err("conflict");
        assert!(matches!(err, CompactError::InvariantViolation(msg) if msg.contains("$b")));

        let same = fold_rows(vec![
            DeltaRow::new(1, "t", "a", "$a"),
            DeltaRow::new(1, "t", "a", "$a"),
        ])
        .expect("repeated identical row is harmless");
        assert_eq!(same[&1].len(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
        assert_eq!(policy.delay_for(64), Duration::from_secs(2));
    }

    #[test]
    fn batch_read_recovers_within_retry_budget() {
        let store = store();
        store.fail_next_batches(2);
        let batch = load_batch(&store, "!r", 0, &[1, 2], fast_retry(3)).expect("recovers");
        assert_eq!(batch.retries, 2);
        assert_eq!(batch.deltas.len(), 2);
        assert_eq!(store.batch_calls(), 3);
    }

    #[test]
    fn batch_read_gives_up_after_budget() {
        let store = store();
        store.fail_next_batches(5);
        let err = load_batch(&store, "!r", 0, &[3, 4], fast_retry(2)).expect_err("exhausted");
        assert!(matches!(
            err,
            CompactError::BatchLoad {
                first_group: 3,
                attempts: 3,
                ..
            }
        ));
    }

    #[test]
    fn batches_follow_processing_order() {
        let store = store();
        let loader = BatchLoader {
            batch_size: 3,
            retry: fast_retry(0),
            prefetch: false,
        };
        let mut seen = Vec::new();
        let stats = loader
            .for_each_batch(&store, "!r", &[8, 7, 1, 2, 6, 3, 5, 4], |batch| {
                seen.push(batch.groups);
                Ok(())
            })
            .expect("pass");
        assert_eq!(stats.batches, 3);
        assert_eq!(seen, vec![vec![8, 7, 1], vec![2, 6, 3], vec![5, 4]]);
    }

    #[test]
    fn prefetch_yields_the_same_batches() {
        let store = store();
        let order: Vec<_> = (1..=8).collect();
        let mut plain = Vec::new();
        let mut prefetched = Vec::new();

        for (prefetch, sink) in [(false, &mut plain), (true, &mut prefetched)] {
            let loader = BatchLoader {
                batch_size: 2,
                retry: fast_retry(0),
                prefetch,
            };
            let stats = loader
                .for_each_batch(&store, "!r", &order, |batch| {
                    let mut groups: Vec<_> = batch.deltas.keys().copied().collect();
                    groups.sort_unstable();
                    sink.push((batch.index, groups));
                    Ok(())
                })
                .expect("pass");
            assert_eq!(stats.prefetched, prefetch);
        }
        assert_eq!(plain, prefetched);
    }

    #[test]
    fn consumer_error_stops_prefetch() {
        let store = store();
        let loader = BatchLoader {
            batch_size: 1,
            retry: fast_retry(0),
            prefetch: true,
        };
        let mut calls = 0;
        let err = loader
            .for_each_batch(&store, "!r", &[1, 2, 3, 4], |_| {
                calls += 1;
                Err(CompactError::invariant("stop"))
            })
            .expect_err("consumer error propagates");
        assert!(matches!(err, CompactError::InvariantViolation(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn single_group_read_defaults_to_empty() {
        let store = store();
        assert_eq!(load_single(&store, "!r", 3, fast_retry(0)).expect("read").len(), 1);
        assert!(load_single(&store, "!r", 8, fast_retry(0)).expect("read").is_empty());
        assert_eq!(store.single_group_calls(), 2);
    }

    #[test]
    fn single_group_read_retries_transient_failures() {
        let store = store();
        store.fail_next_single_reads(2);
        let delta = load_single(&store, "!r", 3, fast_retry(2)).expect("recovers");
        assert_eq!(delta.len(), 1);
        assert_eq!(store.single_group_calls(), 3);

        store.fail_next_single_reads(2);
        let err = load_single(&store, "!r", 3, fast_retry(1)).expect_err("gives up");
        assert!(matches!(err, CompactError::BatchLoad { first_group: 3, attempts: 2, .. }));
    }
}
