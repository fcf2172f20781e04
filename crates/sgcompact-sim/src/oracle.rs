use std::collections::{BTreeSet, HashMap};

use sgcompact_core::config::CompactionConfig;
use sgcompact_core::dag::{OrderStrategy, select_order};
use sgcompact_core::query::reconstruct_at;
use sgcompact_core::session::load_scope_dag;
use sgcompact_core::store::memory::MemoryStore;
use sgcompact_core::{CompactError, GroupId, IntervalRow, StateMap, run_compaction};

use crate::generate::GeneratedScope;

// ── Result types ─────────────────────────────────────────────────────────────

/// Outcome of the oracle checks over one generated scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl OracleResult {
    #[must_use]
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    fn fail(violation: Violation) -> Self {
        Self {
            passed: false,
            violations: vec![violation],
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

/// A failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The engine returned an error on an acyclic, well-formed scope.
    Engine {
        strategy: OrderStrategy,
        prune: bool,
        message: String,
    },
    /// Rows reconstructed at `step` differ from the naive state of `group`.
    Reconstruction {
        strategy: OrderStrategy,
        step: u64,
        group: GroupId,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    /// Pruning changed the emitted rows.
    Pruning {
        strategy: OrderStrategy,
        pruned_rows: usize,
        unpruned_rows: usize,
        first_mismatch: Option<usize>,
    },
    /// Two strategies disagree on the state of a group.
    OrderDisagreement {
        group: GroupId,
        first: OrderStrategy,
        second: OrderStrategy,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine {
                strategy,
                prune,
                message,
            } => write!(f, "Engine: {strategy} order (prune={prune}) failed: {message}"),
            Self::Reconstruction {
                strategy,
                step,
                group,
                missing,
                unexpected,
            } => write!(
                f,
                "Reconstruction: {strategy} step {step} (group {group}) \
                 missing={missing:?} unexpected={unexpected:?}"
            ),
            Self::Pruning {
                strategy,
                pruned_rows,
                unpruned_rows,
                first_mismatch,
            } => write!(
                f,
                "Pruning: {strategy} order wrote {pruned_rows} rows pruned vs \
                 {unpruned_rows} unpruned (first mismatch at {first_mismatch:?})"
            ),
            Self::OrderDisagreement {
                group,
                first,
                second,
            } => write!(f, "OrderDisagreement: group {group} differs between {first} and {second}"),
        }
    }
}

// ── Naive resolver ───────────────────────────────────────────────────────────

/// Reference resolver: own delta first, then parents in ascending id order,
/// earlier entries winning. Memoizes everything and never prunes.
#[derive(Debug, Default)]
pub struct NaiveResolver {
    parents: HashMap<GroupId, Vec<GroupId>>,
    deltas: HashMap<GroupId, StateMap>,
    memo: HashMap<GroupId, StateMap>,
}

impl NaiveResolver {
    #[must_use]
    pub fn new(scope: &GeneratedScope) -> Self {
        let mut parents: HashMap<GroupId, Vec<GroupId>> = HashMap::new();
        for edge in &scope.edges {
            parents.entry(edge.group).or_default().push(edge.parent);
        }
        for list in parents.values_mut() {
            list.sort_unstable();
        }

        let mut deltas: HashMap<GroupId, StateMap> = HashMap::new();
        for row in &scope.deltas {
            deltas
                .entry(row.group)
                .or_default()
                .insert(row.key.clone(), row.event_id.clone());
        }

        Self {
            parents,
            deltas,
            memo: HashMap::new(),
        }
    }

    /// State of `group`. The generator only emits acyclic graphs, so the
    /// explicit stack always drains.
    pub fn resolve(&mut self, group: GroupId) -> &StateMap {
        let mut stack = vec![(group, false)];
        while let Some((node, expanded)) = stack.pop() {
            if self.memo.contains_key(&node) {
                continue;
            }
            let parents = self.parents.get(&node).cloned().unwrap_or_default();
            if expanded {
                let mut state = self.deltas.get(&node).cloned().unwrap_or_default();
                for parent in &parents {
                    if let Some(inherited) = self.memo.get(parent) {
                        for (key, value) in inherited {
                            state.entry(key.clone()).or_insert_with(|| value.clone());
                        }
                    }
                }
                self.memo.insert(node, state);
            } else {
                stack.push((node, true));
                stack.extend(
                    parents
                        .into_iter()
                        .filter(|p| !self.memo.contains_key(p))
                        .map(|p| (p, false)),
                );
            }
        }
        self.memo.entry(group).or_default()
    }
}

// ── Oracle ───────────────────────────────────────────────────────────────────

/// Engine settings the oracle runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleOptions {
    pub batch_size: usize,
    pub page_size: usize,
    pub prefetch: bool,
    /// Batch reads that fail before the first success; kept within the
    /// retry budget so runs recover.
    pub transient_faults: u32,
}

impl Default for OracleOptions {
    fn default() -> Self {
        Self {
            batch_size: 7,
            page_size: 5,
            prefetch: false,
            transient_faults: 0,
        }
    }
}

/// Checks engine output against the naive resolver.
pub struct CompactionOracle;

impl CompactionOracle {
    /// Run every check over `scope`.
    #[must_use]
    pub fn check_all(scope: &GeneratedScope, options: OracleOptions) -> OracleResult {
        let mut naive = NaiveResolver::new(scope);
        let mut result = OracleResult::pass();
        let mut per_strategy: Vec<(OrderStrategy, HashMap<GroupId, StateMap>)> = Vec::new();

        for strategy in OrderStrategy::ALL {
            match Self::check_strategy(scope, strategy, options, &mut naive) {
                Ok((checked, states)) => {
                    result = result.merge(checked);
                    per_strategy.push((strategy, states));
                }
                Err(violation) => result = result.merge(OracleResult::fail(violation)),
            }
        }

        result.merge(Self::check_agreement(&per_strategy))
    }

    fn check_strategy(
        scope: &GeneratedScope,
        strategy: OrderStrategy,
        options: OracleOptions,
        naive: &mut NaiveResolver,
    ) -> Result<(OracleResult, HashMap<GroupId, StateMap>), Violation> {
        let store = scope.memory_store();
        store.fail_next_batches(options.transient_faults);

        let pruned = run(&store, scope, strategy, options, true)?;
        let unpruned = run(&store, scope, strategy, options, false)?;

        let mut result = OracleResult::pass();
        if pruned != unpruned {
            let first_mismatch = pruned.iter().zip(&unpruned).position(|(a, b)| a != b);
            result = result.merge(OracleResult::fail(Violation::Pruning {
                strategy,
                pruned_rows: pruned.len(),
                unpruned_rows: unpruned.len(),
                first_mismatch,
            }));
        }

        let engine_error = |error: CompactError| Violation::Engine {
            strategy,
            prune: true,
            message: error.to_string(),
        };
        let dag = load_scope_dag(&store, &scope.scope).map_err(engine_error)?;
        let order = select_order(strategy, &store, &scope.scope)
            .and_then(|provider| provider.order(&dag))
            .map_err(engine_error)?;

        let mut states = HashMap::with_capacity(order.len());
        for (step, group) in (0_u64..).zip(&order) {
            let rebuilt = reconstruct_at(&pruned, step);
            let expected = naive.resolve(*group);
            if rebuilt != *expected {
                result = result.merge(OracleResult::fail(Violation::Reconstruction {
                    strategy,
                    step,
                    group: *group,
                    missing: difference(expected, &rebuilt),
                    unexpected: difference(&rebuilt, expected),
                }));
            }
            states.insert(*group, rebuilt);
        }
        Ok((result, states))
    }

    fn check_agreement(per_strategy: &[(OrderStrategy, HashMap<GroupId, StateMap>)]) -> OracleResult {
        let Some(((first, reference), rest)) = per_strategy.split_first() else {
            return OracleResult::pass();
        };
        let mut result = OracleResult::pass();
        for (second, states) in rest {
            let mut groups: Vec<_> = reference.keys().copied().collect();
            groups.sort_unstable();
            if let Some(group) = groups.into_iter().find(|g| reference.get(g) != states.get(g)) {
                result = result.merge(OracleResult::fail(Violation::OrderDisagreement {
                    group,
                    first: *first,
                    second: *second,
                }));
            }
        }
        result
    }
}

fn run(
    store: &MemoryStore,
    scope: &GeneratedScope,
    strategy: OrderStrategy,
    options: OracleOptions,
    prune: bool,
) -> Result<Vec<IntervalRow>, Violation> {
    let mut config = CompactionConfig::for_scope(scope.scope.clone());
    config.order = strategy;
    config.batch_size = options.batch_size;
    config.page_size = options.page_size;
    config.prefetch = options.prefetch;
    config.prune = prune;
    config.retry_base_delay_ms = 0;

    run_compaction(store, store, &config).map_err(|error| Violation::Engine {
        strategy,
        prune,
        message: error.to_string(),
    })?;
    Ok(store.committed_intervals(&scope.scope))
}

/// Entries of `left` absent from `right`, rendered and sorted.
fn difference(left: &StateMap, right: &StateMap) -> Vec<String> {
    left.iter()
        .filter(|(key, value)| right.get(*key) != Some(*value))
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{CompactionOracle, NaiveResolver, OracleOptions, Violation};
    use crate::generate::{GeneratedScope, GeneratorConfig, generate};
    use sgcompact_core::dag::OrderStrategy;
    use sgcompact_core::{DeltaRow, Edge, EventId, StateKey};

    fn diamond() -> GeneratedScope {
        GeneratedScope {
            scope: "!d".into(),
            seed: 0,
            groups: vec![1, 2, 3, 4],
            edges: vec![Edge::new(2, 1), Edge::new(3, 1), Edge::new(4, 2), Edge::new(4, 3)],
            deltas: vec![
                DeltaRow::new(1, "t", "a", "$a1"),
                DeltaRow::new(2, "t", "b", "$b2"),
                DeltaRow::new(3, "t", "b", "$b3"),
                DeltaRow::new(3, "t", "a", "$a3"),
            ],
            stored_order: vec![4, 3, 2, 1],
        }
    }

    #[test]
    fn naive_resolver_prefers_lower_parents() {
        let mut naive = NaiveResolver::new(&diamond());
        let state = naive.resolve(4).clone();
        // Group 2 carries a=$a1 down from the root and outranks group 3.
        assert_eq!(state[&StateKey::new("t", "b")], EventId::new("$b2"));
        assert_eq!(state[&StateKey::new("t", "a")], EventId::new("$a1"));
        assert_eq!(naive.resolve(3)[&StateKey::new("t", "a")], EventId::new("$a3"));
    }

    #[test]
    fn diamond_passes_every_check() {
        let result = CompactionOracle::check_all(&diamond(), OracleOptions::default());
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn generated_scopes_pass_with_faults_and_prefetch() {
        let options = OracleOptions {
            batch_size: 3,
            page_size: 2,
            prefetch: true,
            transient_faults: 2,
        };
        for seed in 0..10 {
            let scope = generate("!g", seed, &GeneratorConfig::default());
            let result = CompactionOracle::check_all(&scope, options);
            assert!(result.passed, "seed {seed}: {:?}", result.violations);
        }
    }

    #[test]
    fn shared_value_surfaces_as_engine_violation() {
        let mut scope = diamond();
        scope.deltas.push(DeltaRow::new(4, "t", "c", "$b2"));
        let result = CompactionOracle::check_all(&scope, OracleOptions::default());
        assert!(!result.passed);
        assert!(result.violations.iter().all(|v| matches!(v, Violation::Engine { .. })));
        assert_eq!(result.violations.len(), OrderStrategy::ALL.len());
    }
}
