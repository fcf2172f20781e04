//! Pluggable visitation orders over a [`StateDag`].
//!
//! The order decides only which group gets which processing step. Resolved
//! states and diffs are identical under every order; the order only
//! influences how many interval rows the diffs produce.
//!
//! | Strategy    | Provider                    | Source                         |
//! |-------------|-----------------------------|--------------------------------|
//! | `ascending` | [`AscendingOrder`]          | group id                       |
//! | `chunked`   | [`ChunkedTopologicalOrder`] | weak components + Kahn         |
//! | `stored`    | [`StoredOrder`]             | `group_ordering` in the store  |

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::fmt;
use std::str::FromStr;

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use super::graph::StateDag;
use crate::error::CompactError;
use crate::model::GroupId;
use crate::store::StateStore;

/// Supplies the total visitation order over every group of a DAG.
pub trait OrderProvider {
    /// Strategy name for logs and reports.
    fn name(&self) -> &'static str;

    /// Every group of `dag` exactly once, in processing order.
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy cannot order the graph.
    fn order(&self, dag: &StateDag) -> Result<Vec<GroupId>, CompactError>;
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// Configurable order strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStrategy {
    #[default]
    Ascending,
    Chunked,
    Stored,
}

impl OrderStrategy {
    pub const ALL: [Self; 3] = [Self::Ascending, Self::Chunked, Self::Stored];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Chunked => "chunked",
            Self::Stored => "stored",
        }
    }
}

impl fmt::Display for OrderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStrategy {
    type Err = CompactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                CompactError::Config(format!(
                    "unknown order strategy '{s}' (expected ascending, chunked, or stored)"
                ))
            })
    }
}

/// Build the provider for `strategy`, reading the stored column when needed.
///
/// # Errors
///
/// Returns [`CompactError::Store`] if the stored ordering cannot be read.
pub fn select_order(
    strategy: OrderStrategy,
    store: &dyn StateStore,
    scope: &str,
) -> Result<Box<dyn OrderProvider>, CompactError> {
    Ok(match strategy {
        OrderStrategy::Ascending => Box::new(AscendingOrder),
        OrderStrategy::Chunked => Box::new(ChunkedTopologicalOrder),
        OrderStrategy::Stored => Box::new(StoredOrder::load(store, scope)?),
    })
}

/// Check that `order` visits every group of `dag` exactly once.
///
/// # Errors
///
/// Returns [`CompactError::InvariantViolation`] naming the first unknown,
/// repeated, or missing group.
pub fn validate_order(dag: &StateDag, order: &[GroupId]) -> Result<(), CompactError> {
    let mut seen = vec![false; dag.len()];
    for group in order {
        let idx = dag
            .index_of(*group)
            .ok_or_else(|| CompactError::invariant(format!("order names unknown group {group}")))?;
        if std::mem::replace(&mut seen[idx], true) {
            return Err(CompactError::invariant(format!("order visits group {group} twice")));
        }
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(CompactError::invariant(format!(
            "order never visits group {}",
            dag.group_id(missing)
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ascending
// ---------------------------------------------------------------------------

/// Ascending group id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AscendingOrder;

impl OrderProvider for AscendingOrder {
    fn name(&self) -> &'static str {
        "ascending"
    }

    fn order(&self, dag: &StateDag) -> Result<Vec<GroupId>, CompactError> {
        Ok(dag.ids().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Chunked topological
// ---------------------------------------------------------------------------

/// Weakly connected components by smallest member, each in Kahn order with
/// the smallest ready id first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedTopologicalOrder;

impl ChunkedTopologicalOrder {
    /// Dense-index chunks, each sorted, ordered by smallest member.
    #[must_use]
    pub fn chunks(dag: &StateDag) -> Vec<Vec<usize>> {
        let mut components = UnionFind::<usize>::new(dag.len());
        for edge in dag.edges() {
            if let (Some(child), Some(parent)) = (dag.index_of(edge.group), dag.index_of(edge.parent)) {
                components.union(child, parent);
            }
        }

        // Indices are visited ascending, so each chunk's first member is its
        // minimum and the BTreeMap key orders chunks by it.
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut first_of_root: Vec<Option<usize>> = vec![None; dag.len()];
        for idx in 0..dag.len() {
            let root = components.find(idx);
            let first = *first_of_root[root].get_or_insert(idx);
            by_root.entry(first).or_default().push(idx);
        }
        by_root.into_values().collect()
    }
}

impl OrderProvider for ChunkedTopologicalOrder {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn order(&self, dag: &StateDag) -> Result<Vec<GroupId>, CompactError> {
        let mut in_degree: Vec<usize> = (0..dag.len()).map(|idx| dag.parents(idx).len()).collect();
        let mut order = Vec::with_capacity(dag.len());

        for chunk in Self::chunks(dag) {
            let mut ready: BinaryHeap<Reverse<usize>> = chunk
                .iter()
                .filter(|idx| in_degree[**idx] == 0)
                .map(|idx| Reverse(*idx))
                .collect();

            let mut emitted = 0_usize;
            while let Some(Reverse(idx)) = ready.pop() {
                order.push(dag.group_id(idx));
                emitted += 1;
                for child in dag.children(idx) {
                    in_degree[*child] -= 1;
                    if in_degree[*child] == 0 {
                        ready.push(Reverse(*child));
                    }
                }
            }

            if emitted < chunk.len() {
                let stuck: HashSet<GroupId> = chunk
                    .iter()
                    .filter(|idx| in_degree[**idx] > 0)
                    .map(|idx| dag.group_id(*idx))
                    .collect();
                let members = dag
                    .cyclic_components()
                    .into_iter()
                    .find(|cycle| cycle.iter().any(|g| stuck.contains(g)))
                    .unwrap_or_else(|| {
                        let mut members: Vec<_> = stuck.into_iter().collect();
                        members.sort_unstable();
                        members
                    });
                return Err(CompactError::CyclicGraph { members });
            }
        }

        Ok(order)
    }
}

// ---------------------------------------------------------------------------
// Stored
// ---------------------------------------------------------------------------

/// Externally computed order read from the store.
#[derive(Debug, Clone, Default)]
pub struct StoredOrder {
    ordering: Vec<GroupId>,
}

impl StoredOrder {
    #[must_use]
    pub const fn new(ordering: Vec<GroupId>) -> Self {
        Self { ordering }
    }

    /// Read the `group_ordering` column of `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::Store`] if the read fails.
    pub fn load(store: &dyn StateStore, scope: &str) -> Result<Self, CompactError> {
        Ok(Self::new(store.fetch_ordering(scope)?))
    }
}

impl OrderProvider for StoredOrder {
    fn name(&self) -> &'static str {
        "stored"
    }

    fn order(&self, dag: &StateDag) -> Result<Vec<GroupId>, CompactError> {
        let mut seen = vec![false; dag.len()];
        let mut order = Vec::with_capacity(dag.len());
        let mut duplicates = 0_usize;

        for group in &self.ordering {
            let idx = dag.index_of(*group).ok_or_else(|| {
                CompactError::invariant(format!("stored ordering names group {group} outside the DAG"))
            })?;
            if std::mem::replace(&mut seen[idx], true) {
                duplicates += 1;
                continue;
            }
            order.push(*group);
        }

        let missing: Vec<GroupId> = seen
            .iter()
            .enumerate()
            .filter(|(_, s)| !**s)
            .map(|(idx, _)| dag.group_id(idx))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                missing = missing.len(),
                first_missing = missing[0],
                "stored ordering omits groups; appending them in ascending order"
            );
        }
        if duplicates > 0 {
            tracing::warn!(duplicates, "stored ordering repeats groups; keeping first positions");
        }
        order.extend(missing);
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AscendingOrder, ChunkedTopologicalOrder, OrderProvider, OrderStrategy, StoredOrder,
        select_order, validate_order,
    };
    use crate::dag::StateDag;
    use crate::error::CompactError;
    use crate::model::Edge;
    use crate::store::memory::MemoryStore;

    fn two_chunks() -> StateDag {
        // chunk A: 10 ← 3, 10 ← 7 (10 merges 3 and 7); chunk B: 2 ← 5 ← 4
        StateDag::from_edges(&[
            Edge::new(10, 3),
            Edge::new(10, 7),
            Edge::new(5, 2),
            Edge::new(4, 5),
        ])
    }

    #[test]
    fn ascending_is_id_order() {
        let order = AscendingOrder.order(&two_chunks()).expect("order");
        assert_eq!(order, vec![2, 3, 4, 5, 7, 10]);
    }

    #[test]
    fn chunked_orders_components_by_min_id_then_kahn() {
        let order = ChunkedTopologicalOrder.order(&two_chunks()).expect("order");
        // chunk {2, 4, 5} first (min 2): 2, then 5, then 4 (4 depends on 5).
        assert_eq!(order, vec![2, 5, 4, 3, 7, 10]);
        validate_order(&two_chunks(), &order).expect("permutation");
    }

    #[test]
    fn chunked_reports_cycles() {
        let dag = StateDag::from_edges(&[Edge::new(2, 1), Edge::new(3, 2), Edge::new(2, 3)]);
        let err = ChunkedTopologicalOrder.order(&dag).expect_err("cycle");
        assert!(matches!(err, CompactError::CyclicGraph { members } if members == vec![2, 3]));
    }

    #[test]
    fn stored_order_appends_missing_and_drops_duplicates() {
        let order = StoredOrder::new(vec![10, 4, 10, 2])
            .order(&two_chunks())
            .expect("order");
        assert_eq!(order, vec![10, 4, 2, 3, 5, 7]);
    }

    #[test]
    fn stored_order_rejects_unknown_groups() {
        let err = StoredOrder::new(vec![2, 99])
            .order(&two_chunks())
            .expect_err("99 is not in the DAG");
        assert!(matches!(err, CompactError::InvariantViolation(msg) if msg.contains("99")));
    }

    #[test]
    fn select_order_reads_stored_column() {
        let mut store = MemoryStore::new();
        store.add_edge("!r", 2, 1).set_ordering("!r", vec![2, 1]);
        let provider = select_order(OrderStrategy::Stored, &store, "!r").expect("select");
        assert_eq!(provider.name(), "stored");
        let dag = StateDag::load(&store, "!r").expect("load");
        assert_eq!(provider.order(&dag).expect("order"), vec![2, 1]);
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Chunked".parse::<OrderStrategy>().expect("parse"), OrderStrategy::Chunked);
        assert!("random".parse::<OrderStrategy>().is_err());
        assert_eq!(OrderStrategy::default().to_string(), "ascending");
    }

    #[test]
    fn validate_order_catches_gaps_and_repeats() {
        let dag = two_chunks();
        assert!(validate_order(&dag, &[2, 3, 4, 5, 7]).is_err());
        assert!(validate_order(&dag, &[2, 2, 3, 4, 5, 7, 10]).is_err());
        assert!(validate_order(&dag, &[10, 7, 5, 4, 3, 2]).is_ok());
    }
}
