//! Immutable state-group DAG with dense node indices.
//!
//! Group ids are sorted ascending and assigned dense indices in that order,
//! so index order and id order agree: sorting parent lists by index sorts
//! them by id too. Every per-node table in the engine (memo, refcounts) is a
//! `Vec` indexed by these indices.
//!
//! Edges point from a group to the parent it inherits from. Every edge end
//! becomes a node here; [`crate::session::load_scope_dag`] rejects ends the
//! scope does not own as groups.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::instrument;

use crate::error::CompactError;
use crate::model::{Edge, GroupId};
use crate::store::StateStore;

// ---------------------------------------------------------------------------
// StateDag
// ---------------------------------------------------------------------------

/// Forward and backward adjacency of one scope's state groups.
#[derive(Debug, Clone)]
pub struct StateDag {
    ids: Vec<GroupId>,
    index: HashMap<GroupId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    edges: Vec<Edge>,
    content_hash: String,
}

impl StateDag {
    /// Load the edge set of `scope` and build the DAG.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::ScopeNotFound`] if the scope has no edges, or
    /// [`CompactError::Store`] if the read fails.
    #[instrument(skip(store))]
    pub fn load(store: &dyn StateStore, scope: &str) -> Result<Self, CompactError> {
        let edges = store.fetch_edges(scope)?;
        if edges.is_empty() {
            return Err(CompactError::ScopeNotFound {
                scope: scope.to_owned(),
            });
        }

        let dag = Self::from_edges(&edges);
        tracing::info!(
            groups = dag.len(),
            edges = dag.edge_count(),
            "loaded state group edges"
        );
        Ok(dag)
    }

    /// Build from edges alone; the node set is every endpoint.
    #[must_use]
    pub fn from_edges(edges: &[Edge]) -> Self {
        Self::build(std::iter::empty(), edges.iter().copied())
    }

    /// Build from an explicit node set plus edges. Edge endpoints missing
    /// from `groups` are added.
    #[must_use]
    pub fn from_parts(groups: impl IntoIterator<Item = GroupId>, edges: &[Edge]) -> Self {
        Self::build(groups, edges.iter().copied())
    }

    /// Return a DAG that additionally contains `groups` as nodes.
    #[must_use]
    pub fn with_groups(self, groups: impl IntoIterator<Item = GroupId>) -> Self {
        let existing = self.ids;
        Self::build(existing.into_iter().chain(groups), self.edges.into_iter())
    }

    fn build(groups: impl IntoIterator<Item = GroupId>, edges: impl Iterator<Item = Edge>) -> Self {
        let edges: BTreeSet<Edge> = edges.collect();

        let mut nodes: BTreeSet<GroupId> = groups.into_iter().collect();
        for edge in &edges {
            nodes.insert(edge.group);
            nodes.insert(edge.parent);
        }

        let ids: Vec<GroupId> = nodes.into_iter().collect();
        let index: HashMap<GroupId, usize> =
            ids.iter().enumerate().map(|(idx, id)| (*id, idx)).collect();

        let mut parents = vec![Vec::new(); ids.len()];
        let mut children = vec![Vec::new(); ids.len()];
        for edge in &edges {
            let (child, parent) = (index[&edge.group], index[&edge.parent]);
            parents[child].push(parent);
            children[parent].push(child);
        }
        // BTreeSet iteration already yields parents ascending per child.
        for list in &mut children {
            list.sort_unstable();
        }

        let edges: Vec<Edge> = edges.into_iter().collect();
        let content_hash = compute_content_hash(&ids, &edges);

        Self {
            ids,
            index,
            parents,
            children,
            edges,
            content_hash,
        }
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Distinct edges, sorted by `(group, parent)`.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// All group ids in ascending order (position = dense index).
    #[must_use]
    pub fn ids(&self) -> &[GroupId] {
        &self.ids
    }

    #[must_use]
    pub fn contains(&self, group: GroupId) -> bool {
        self.index.contains_key(&group)
    }

    /// Dense index of `group`, if it is part of the DAG.
    #[must_use]
    pub fn index_of(&self, group: GroupId) -> Option<usize> {
        self.index.get(&group).copied()
    }

    /// Group id at dense index `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    #[must_use]
    pub fn group_id(&self, idx: usize) -> GroupId {
        self.ids[idx]
    }

    /// Parent indices of `idx`, ascending.
    #[must_use]
    pub fn parents(&self, idx: usize) -> &[usize] {
        &self.parents[idx]
    }

    /// Child indices of `idx`, ascending.
    #[must_use]
    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    #[must_use]
    pub fn child_count(&self, idx: usize) -> usize {
        self.children[idx].len()
    }

    /// Groups without parents, ascending.
    pub fn roots(&self) -> impl Iterator<Item = GroupId> + '_ {
        (0..self.len())
            .filter(|idx| self.parents[*idx].is_empty())
            .map(|idx| self.ids[idx])
    }

    /// Groups without children, ascending.
    pub fn sinks(&self) -> impl Iterator<Item = GroupId> + '_ {
        (0..self.len())
            .filter(|idx| self.children[*idx].is_empty())
            .map(|idx| self.ids[idx])
    }

    /// BLAKE3 hash of the node and edge sets, `blake3:<hex>`.
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    // -----------------------------------------------------------------------
    // Cycle detection
    // -----------------------------------------------------------------------

    /// Parent → child graph over dense indices, for petgraph algorithms.
    #[must_use]
    pub fn to_petgraph(&self) -> DiGraph<GroupId, ()> {
        let mut graph = DiGraph::with_capacity(self.len(), self.edge_count());
        for id in &self.ids {
            graph.add_node(*id);
        }
        for (child, parents) in self.parents.iter().enumerate() {
            for parent in parents {
                graph.add_edge(NodeIndex::new(*parent), NodeIndex::new(child), ());
            }
        }
        graph
    }

    /// Every strongly connected component that forms a cycle, each sorted
    /// ascending, ordered by smallest member.
    #[must_use]
    pub fn cyclic_components(&self) -> Vec<Vec<GroupId>> {
        let graph = self.to_petgraph();
        let mut cycles: Vec<Vec<GroupId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n))
            })
            .map(|scc| {
                let mut members: Vec<GroupId> = scc.iter().map(|n| graph[*n]).collect();
                members.sort_unstable();
                members
            })
            .collect();
        cycles.sort_unstable();
        cycles
    }

    /// Members of the first cycle, if the graph has one.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<GroupId>> {
        self.cyclic_components().into_iter().next()
    }

    /// Members of the cycle through `idx`; just the group itself when the
    /// component cannot be isolated.
    #[must_use]
    pub fn cycle_through(&self, idx: usize) -> Vec<GroupId> {
        let group = self.ids[idx];
        self.cyclic_components()
            .into_iter()
            .find(|members| members.contains(&group))
            .unwrap_or_else(|| vec![group])
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn compute_content_hash(ids: &[GroupId], edges: &[Edge]) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(&id.to_le_bytes());
    }
    hasher.update(b"\x00edges\x00");
    for edge in edges {
        hasher.update(&edge.group.to_le_bytes());
        hasher.update(&edge.parent.to_le_bytes());
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::StateDag;
    use crate::error::CompactError;
    use crate::model::Edge;
    use crate::store::memory::MemoryStore;

    fn diamond() -> StateDag {
        // 1 ← 2, 1 ← 3, {2, 3} ← 4
        StateDag::from_edges(&[
            Edge::new(2, 1),
            Edge::new(3, 1),
            Edge::new(4, 3),
            Edge::new(4, 2),
        ])
    }

    #[test]
    fn adjacency_is_sorted_and_deduplicated() {
        let dag = StateDag::from_edges(&[
            Edge::new(4, 3),
            Edge::new(4, 2),
            Edge::new(4, 3),
            Edge::new(2, 1),
            Edge::new(3, 1),
        ]);
        assert_eq!(dag.ids(), &[1, 2, 3, 4]);
        assert_eq!(dag.edge_count(), 4);

        let four = dag.index_of(4).expect("4 is a node");
        let parent_ids: Vec<_> = dag.parents(four).iter().map(|i| dag.group_id(*i)).collect();
        assert_eq!(parent_ids, vec![2, 3]);

        let one = dag.index_of(1).expect("1 is a node");
        assert_eq!(dag.child_count(one), 2);
        assert_eq!(dag.roots().collect::<Vec<_>>(), vec![1]);
        assert_eq!(dag.sinks().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn content_hash_ignores_edge_input_order() {
        let a = diamond();
        let b = StateDag::from_edges(&[
            Edge::new(4, 2),
            Edge::new(4, 3),
            Edge::new(3, 1),
            Edge::new(2, 1),
        ]);
        assert!(a.content_hash().starts_with("blake3:"));
        assert_eq!(a.content_hash(), b.content_hash());

        let extended = diamond().with_groups([9]);
        assert_ne!(a.content_hash(), extended.content_hash());
        assert!(extended.contains(9));
        assert_eq!(extended.roots().collect::<Vec<_>>(), vec![1, 9]);
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        assert!(diamond().find_cycle().is_none());
    }

    #[test]
    fn cycle_members_are_reported() {
        let dag = StateDag::from_edges(&[
            Edge::new(2, 1),
            Edge::new(3, 2),
            Edge::new(4, 3),
            Edge::new(2, 4),
        ]);
        assert_eq!(dag.find_cycle(), Some(vec![2, 3, 4]));
        let three = dag.index_of(3).expect("node");
        assert_eq!(dag.cycle_through(three), vec![2, 3, 4]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let dag = StateDag::from_edges(&[Edge::new(5, 5)]);
        assert_eq!(dag.find_cycle(), Some(vec![5]));
    }

    #[test]
    fn load_rejects_scope_without_edges() {
        let mut store = MemoryStore::new();
        store.add_group("!lonely", 1);
        let err = StateDag::load(&store, "!lonely").expect_err("no edges");
        assert!(matches!(err, CompactError::ScopeNotFound { scope } if scope == "!lonely"));
    }

    #[test]
    fn load_builds_from_store_edges() {
        let mut store = MemoryStore::new();
        store.add_edge("!r", 2, 1).add_edge("!r", 3, 2);
        let dag = StateDag::load(&store, "!r").expect("load");
        assert_eq!(dag.ids(), &[1, 2, 3]);
        assert_eq!(dag.edge_count(), 2);
    }
}
