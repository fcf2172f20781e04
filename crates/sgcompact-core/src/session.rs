//! One compaction run over one scope.
//!
//! ```text
//! load DAG ─► order ─► begin_intervals
//!                │
//!                ▼
//!   for each batch (loader) ─► for each group in order:
//!        resolve ─► value index ─► diff vs previous step ─► interval writer
//!        finish_step (drop self-hold) ─► flush full pages to the sink
//!                │
//!                ▼
//!   flush remaining rows ─► commit_intervals   (any error: rollback)
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::config::CompactionConfig;
use crate::dag::order::validate_order;
use crate::dag::{StateDag, select_order};
use crate::diff::{ValueIndex, diff, value_index};
use crate::error::CompactError;
use crate::interval::IntervalWriter;
use crate::loader::{DeltaBatch, LoaderStats, RetryPolicy, load_single};
use crate::model::{Delta, GroupId};
use crate::resolve::{DeltaSource, Materializer};
use crate::store::{IntervalSink, StateStore};

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub scope: String,
    pub order: String,
    pub groups: usize,
    pub edges: usize,
    pub batches: usize,
    pub steps: u64,
    pub rows_written: u64,
    pub open_rows: usize,
    pub on_demand_fetches: usize,
    pub batch_retries: u32,
    pub prefetched: bool,
    pub peak_memo_entries: usize,
    pub pruned_entries: usize,
    pub edge_hash: String,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Load the DAG of `scope`, falling back to an edgeless DAG over the
/// scope's groups when it has no edges. Groups without edges are part of
/// the DAG either way.
///
/// # Errors
///
/// Returns [`CompactError::ScopeNotFound`] if the scope has neither edges
/// nor groups, [`CompactError::InvariantViolation`] if an edge names a
/// group the scope does not own, or [`CompactError::Store`] on read
/// failure.
pub fn load_scope_dag(store: &dyn StateStore, scope: &str) -> Result<StateDag, CompactError> {
    let groups = store.fetch_groups(scope)?;
    match StateDag::load(store, scope) {
        Ok(dag) => {
            let known: HashSet<GroupId> = groups.iter().copied().collect();
            let unknown: Vec<GroupId> = dag
                .ids()
                .iter()
                .copied()
                .filter(|id| !known.contains(id))
                .collect();
            if !unknown.is_empty() {
                return Err(CompactError::invariant(format!(
                    "edges of {scope} reference {} group(s) missing from state_groups: {:?}",
                    unknown.len(),
                    &unknown[..unknown.len().min(8)]
                )));
            }
            Ok(dag.with_groups(groups))
        }
        Err(CompactError::ScopeNotFound { .. }) if !groups.is_empty() => {
            tracing::info!(groups = groups.len(), "scope has no edges; every group is a root");
            Ok(StateDag::from_parts(groups, &[]))
        }
        Err(error) => Err(error),
    }
}

/// Run a full compaction of `config.scope`: read from `store`, write the
/// interval table through `sink` in one transaction.
///
/// # Errors
///
/// Returns the first error of any stage; rows written so far are rolled
/// back.
#[instrument(skip_all, fields(scope = %config.scope, order = %config.order))]
pub fn run_compaction(
    store: &dyn StateStore,
    sink: &dyn IntervalSink,
    config: &CompactionConfig,
) -> Result<RunReport, CompactError> {
    let started_at = Utc::now();
    let clock = Instant::now();
    config.validate()?;
    let scope = config.scope.as_str();

    let dag = load_scope_dag(store, scope)?;
    let provider = select_order(config.order, store, scope)?;
    let order = provider.order(&dag)?;
    validate_order(&dag, &order)?;
    tracing::info!(
        groups = dag.len(),
        edges = dag.edge_count(),
        order = provider.name(),
        "starting compaction"
    );

    sink.begin_intervals(scope)?;
    let mut session = CompactionSession::new(store, scope, dag, config);
    let outcome = session.process(&order, config, sink).and_then(|stats| {
        sink.commit_intervals(scope, order.len() as u64)?;
        Ok(stats)
    });

    let stats = match outcome {
        Ok(stats) => stats,
        Err(error) => {
            tracing::error!(error = %error, code = %error.code(), "compaction failed; rolling back");
            if let Err(rollback) = sink.rollback_intervals(scope) {
                tracing::error!(error = %rollback, "rollback failed");
            }
            return Err(error);
        }
    };

    let report = session.report(provider.name(), stats, started_at, clock);
    tracing::info!(
        steps = report.steps,
        rows = report.rows_written,
        open_rows = report.open_rows,
        peak_memo = report.peak_memo_entries,
        elapsed_ms = report.elapsed_ms,
        "compaction committed"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// CompactionSession
// ---------------------------------------------------------------------------

/// All mutable state of one run: DAG, memo, counts, previous step, writer.
pub struct CompactionSession<'run> {
    scope: &'run str,
    dag: StateDag,
    materializer: Materializer,
    window: DeltaWindow<'run>,
    writer: IntervalWriter,
    previous: ValueIndex,
    step: u64,
    rows_written: u64,
    open_rows: usize,
}

impl<'run> CompactionSession<'run> {
    #[must_use]
    pub fn new(
        store: &'run dyn StateStore,
        scope: &'run str,
        dag: StateDag,
        config: &CompactionConfig,
    ) -> Self {
        let materializer = Materializer::new(&dag, config.prune);
        Self {
            scope,
            dag,
            materializer,
            window: DeltaWindow::new(store, scope, config.retry_policy()),
            writer: IntervalWriter::default(),
            previous: ValueIndex::new(),
            step: 0,
            rows_written: 0,
            open_rows: 0,
        }
    }

    /// The DAG this session walks.
    #[must_use]
    pub const fn dag(&self) -> &StateDag {
        &self.dag
    }

    /// Walk `order` batch by batch, appending pages to `sink`, then flush
    /// the remaining rows.
    ///
    /// # Errors
    ///
    /// Returns the first load, resolve, diff, interval, or sink error.
    pub fn process(
        &mut self,
        order: &[GroupId],
        config: &CompactionConfig,
        sink: &dyn IntervalSink,
    ) -> Result<LoaderStats, CompactError> {
        self.writer = IntervalWriter::new(config.page_size);
        let store = self.window.store;
        let scope = self.scope;

        let stats = config
            .loader()
            .for_each_batch(store, scope, order, |batch| self.process_batch(batch, sink))?;

        let writer = std::mem::take(&mut self.writer);
        self.open_rows = writer.open_rows();
        let rest = writer.finish();
        if !rest.is_empty() {
            sink.append_intervals(scope, &rest)?;
            self.rows_written += rest.len() as u64;
        }
        Ok(stats)
    }

    fn process_batch(&mut self, batch: DeltaBatch, sink: &dyn IntervalSink) -> Result<(), CompactError> {
        let groups = self.window.enter_batch(batch);
        for group in groups {
            self.visit(group)?;
            while let Some(page) = self.writer.take_page() {
                sink.append_intervals(self.scope, &page)?;
                self.rows_written += page.len() as u64;
            }
        }
        Ok(())
    }

    /// Process one step: resolve, diff against the previous step, record
    /// intervals, release the group's self-hold.
    fn visit(&mut self, group: GroupId) -> Result<(), CompactError> {
        let state = self.materializer.resolve(&self.dag, group, &mut self.window)?;
        let current = value_index(&state)?;
        drop(state);

        let step_diff = diff(&self.previous, &current);
        tracing::debug!(
            step = self.step,
            group,
            appeared = step_diff.appeared.len(),
            disappeared = step_diff.disappeared.len(),
            "processed step"
        );
        self.writer.apply(self.step, group, &step_diff)?;
        self.previous = current;

        self.materializer.finish_step(&self.dag, group)?;
        self.step += 1;
        Ok(())
    }

    fn report(
        &self,
        order: &str,
        stats: LoaderStats,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> RunReport {
        let memo = self.materializer.stats();
        RunReport {
            scope: self.scope.to_owned(),
            order: order.to_owned(),
            groups: self.dag.len(),
            edges: self.dag.edge_count(),
            batches: stats.batches,
            steps: self.step,
            rows_written: self.rows_written,
            open_rows: self.open_rows,
            on_demand_fetches: self.window.fetches,
            batch_retries: stats.retries,
            prefetched: stats.prefetched,
            peak_memo_entries: memo.peak_live_entries,
            pruned_entries: memo.pruned_entries,
            edge_hash: self.dag.content_hash().to_owned(),
            elapsed_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            started_at,
        }
    }
}

// ---------------------------------------------------------------------------
// DeltaWindow
// ---------------------------------------------------------------------------

/// Deltas of the current batch, plus on-demand reads for groups outside it.
///
/// Callers only ask for groups of the DAG, so a batch group with no rows
/// resolves to an empty delta and any other group is read on demand.
struct DeltaWindow<'run> {
    store: &'run dyn StateStore,
    scope: &'run str,
    retry: RetryPolicy,
    batch_groups: HashSet<GroupId>,
    deltas: HashMap<GroupId, Delta>,
    on_demand: HashMap<GroupId, Delta>,
    empty: Delta,
    fetches: usize,
}

impl<'run> DeltaWindow<'run> {
    fn new(store: &'run dyn StateStore, scope: &'run str, retry: RetryPolicy) -> Self {
        Self {
            store,
            scope,
            retry,
            batch_groups: HashSet::new(),
            deltas: HashMap::new(),
            on_demand: HashMap::new(),
            empty: Delta::new(),
            fetches: 0,
        }
    }

    /// Replace the window with `batch`; returns its groups in order.
    fn enter_batch(&mut self, batch: DeltaBatch) -> Vec<GroupId> {
        self.batch_groups = batch.groups.iter().copied().collect();
        self.deltas = batch.deltas;
        self.on_demand.clear();
        batch.groups
    }
}

impl DeltaSource for DeltaWindow<'_> {
    fn delta(&mut self, group: GroupId) -> Result<&Delta, CompactError> {
        if self.deltas.contains_key(&group) {
            return Ok(&self.deltas[&group]);
        }
        if self.batch_groups.contains(&group) {
            return Ok(&self.empty);
        }
        if !self.on_demand.contains_key(&group) {
            let delta = load_single(self.store, self.scope, group, self.retry)?;
            self.fetches += 1;
            tracing::debug!(group, entries = delta.len(), "fetched delta outside the batch window");
            self.on_demand.insert(group, delta);
        }
        Ok(&self.on_demand[&group])
    }
}
