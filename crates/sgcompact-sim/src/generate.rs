//! Seeded generation of state-group DAGs.
//!
//! Groups are created one at a time and only ever point at groups created
//! earlier, so the result is acyclic. Ids are a shuffled set, so ascending
//! id order is usually not a topological order.

use serde::{Deserialize, Serialize};

use sgcompact_core::store::memory::MemoryStore;
use sgcompact_core::store::sqlite::SqliteStore;
use sgcompact_core::store::StoreError;
use sgcompact_core::{DeltaRow, Edge, GroupId};

use crate::rng::DeterministicRng;

/// Shape parameters of a generated scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Number of groups.
    pub groups: usize,
    /// Distinct state keys drawn from.
    pub keys: usize,
    /// Distinct values per key; small values make events reappear.
    pub versions: usize,
    /// Chance a new group starts a disconnected chunk.
    pub new_root_percent: u8,
    /// Chance a group has a second parent.
    pub merge_percent: u8,
    /// Chance a group forks from an old group instead of the latest one.
    pub fork_percent: u8,
    /// Upper bound of keys a single group sets.
    pub max_delta_keys: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            groups: 40,
            keys: 8,
            versions: 3,
            new_root_percent: 5,
            merge_percent: 15,
            fork_percent: 30,
            max_delta_keys: 3,
        }
    }
}

/// A generated scope: groups, edges, deltas, and a stored ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedScope {
    pub scope: String,
    pub seed: u64,
    pub groups: Vec<GroupId>,
    pub edges: Vec<Edge>,
    pub deltas: Vec<DeltaRow>,
    pub stored_order: Vec<GroupId>,
}

impl GeneratedScope {
    /// In-memory store holding this scope.
    #[must_use]
    pub fn memory_store(&self) -> MemoryStore {
        let mut store = MemoryStore::new();
        for group in &self.groups {
            store.add_group(&self.scope, *group);
        }
        for edge in &self.edges {
            store.add_edge(&self.scope, edge.group, edge.parent);
        }
        for row in &self.deltas {
            store.add_delta(
                &self.scope,
                row.group,
                &row.key.event_type,
                &row.key.state_key,
                row.event_id.as_str(),
            );
        }
        store.set_ordering(&self.scope, self.stored_order.clone());
        store
    }

    /// Write this scope, including its stored ordering, into `store`.
    ///
    /// # Errors
    ///
    /// Returns the first failed write.
    pub fn seed_sqlite(&self, store: &SqliteStore) -> Result<(), StoreError> {
        store.seed_scope(&self.scope, &self.groups, &self.edges, &self.deltas)?;
        store.store_ordering(&self.scope, &self.stored_order)
    }
}

/// Generate a scope named `scope` from `seed`.
#[must_use]
pub fn generate(scope: &str, seed: u64, config: &GeneratorConfig) -> GeneratedScope {
    let mut rng = DeterministicRng::new(seed);
    let n = config.groups.max(1);

    let mut ids: Vec<GroupId> = (0..n)
        .map(|i| 1 + GroupId::try_from(i).unwrap_or(GroupId::MAX - 1))
        .collect();
    rng.shuffle(&mut ids);

    let mut edges = Vec::new();
    for node in 1..n {
        if rng.hit_rate_percent(config.new_root_percent) {
            continue;
        }
        let first = if rng.hit_rate_percent(config.fork_percent) {
            rng.next_index(node)
        } else {
            node - 1
        };
        edges.push(Edge::new(ids[node], ids[first]));
        if node > 1 && rng.hit_rate_percent(config.merge_percent) {
            let second = rng.next_index(node);
            if second != first {
                edges.push(Edge::new(ids[node], ids[second]));
            }
        }
    }
    edges.sort_unstable();

    let keys = config.keys.max(1);
    let versions = config.versions.max(1);
    let mut deltas = Vec::new();
    for id in &ids {
        let count = rng.next_index(config.max_delta_keys + 1);
        let mut chosen: Vec<usize> = (0..count).map(|_| rng.next_index(keys)).collect();
        chosen.sort_unstable();
        chosen.dedup();
        for key in chosen {
            let version = rng.next_index(versions);
            deltas.push(DeltaRow::new(
                *id,
                "m.sim",
                &format!("k{key}"),
                &format!("$k{key}-v{version}"),
            ));
        }
    }
    deltas.sort_by_key(|row| row.group);

    let mut stored_order = ids.clone();
    rng.shuffle(&mut stored_order);

    let mut groups = ids;
    groups.sort_unstable();

    GeneratedScope {
        scope: scope.to_owned(),
        seed,
        groups,
        edges,
        deltas,
        stored_order,
    }
}
