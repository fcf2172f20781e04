//! End-to-end runs of the compaction pipeline over in-memory and SQLite
//! stores.

use std::collections::HashMap;

use sgcompact_core::config::CompactionConfig;
use sgcompact_core::dag::{OrderStrategy, StateDag, select_order};
use sgcompact_core::diff::{diff, value_index};
use sgcompact_core::loader::fold_rows;
use sgcompact_core::model::Delta;
use sgcompact_core::query::{self, reconstruct_at};
use sgcompact_core::resolve::Materializer;
use sgcompact_core::store::memory::MemoryStore;
use sgcompact_core::store::sqlite::{SqliteStore, open_store};
use sgcompact_core::store::{IntervalSink, StateStore};
use sgcompact_core::{
    CompactError, DeltaRow, Edge, EventId, GroupId, IntervalRow, StateKey, run_compaction,
};

const ROOM: &str = "!room:example.org";

fn key(name: &str) -> StateKey {
    StateKey::new("t", name)
}

fn summary(rows: &[IntervalRow]) -> Vec<(String, u64, Option<u64>)> {
    rows.iter()
        .map(|r| (r.event_id.to_string(), r.start_step, r.end_step))
        .collect()
}

/// Root 1, 2 → 1, 3 → 2; 1 sets (t,a)=x, 2 sets (t,b)=y, 3 sets (t,a)=z.
fn scenario_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .add_edge(ROOM, 2, 1)
        .add_edge(ROOM, 3, 2)
        .add_delta(ROOM, 1, "t", "a", "x")
        .add_delta(ROOM, 2, "t", "b", "y")
        .add_delta(ROOM, 3, "t", "a", "z");
    store
}

fn all_deltas(store: &dyn StateStore, groups: &[GroupId]) -> HashMap<GroupId, Delta> {
    let rows = store.fetch_deltas(ROOM, groups).expect("read deltas");
    let mut folded = fold_rows(rows).expect("fold");
    for group in groups {
        folded.entry(*group).or_default();
    }
    folded
}

// ---------------------------------------------------------------------------
// Concrete scenario
// ---------------------------------------------------------------------------

#[test]
fn scenario_resolves_diffs_and_encodes_intervals() {
    let store = scenario_store();
    let dag = StateDag::load(&store, ROOM).expect("load");
    let mut source = all_deltas(&store, &[1, 2, 3]);
    let mut materializer = Materializer::new(&dag, true);

    let s1 = materializer.resolve(&dag, 1, &mut source).expect("resolve 1");
    let s2 = materializer.resolve(&dag, 2, &mut source).expect("resolve 2");
    let s3 = materializer.resolve(&dag, 3, &mut source).expect("resolve 3");
    assert_eq!(s1.len(), 1);
    assert_eq!(s3.len(), 2);
    assert_eq!(s3[&key("a")], EventId::new("z"));
    assert_eq!(s3[&key("b")], EventId::new("y"));

    let step = diff(
        &value_index(&s2).expect("index 2"),
        &value_index(&s3).expect("index 3"),
    );
    assert_eq!(step.appeared, vec![(EventId::new("z"), key("a"))]);
    assert_eq!(step.disappeared, vec![EventId::new("x")]);

    let report = run_compaction(&store, &store, &CompactionConfig::for_scope(ROOM)).expect("run");
    assert_eq!(report.steps, 3);
    let json = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(json["order"], "ascending");
    assert_eq!(json["rows_written"], 3);
    assert_eq!(
        summary(&store.committed_intervals(ROOM)),
        vec![
            ("x".to_owned(), 0, Some(2)),
            ("y".to_owned(), 1, None),
            ("z".to_owned(), 2, None),
        ]
    );
}

#[test]
fn override_precedence_along_a_chain() {
    let mut store = MemoryStore::new();
    store
        .add_edge(ROOM, 2, 1)
        .add_edge(ROOM, 3, 2)
        .add_delta(ROOM, 1, "t", "k", "v1")
        .add_delta(ROOM, 2, "t", "k", "v2");
    let dag = StateDag::load(&store, ROOM).expect("load");
    let mut source = all_deltas(&store, &[1, 2, 3]);
    let state = Materializer::new(&dag, true)
        .resolve(&dag, 3, &mut source)
        .expect("resolve");
    assert_eq!(state[&key("k")], EventId::new("v2"));
}

#[test]
fn disjoint_keys_merge_completely() {
    let mut store = MemoryStore::new();
    for group in 1..=20 {
        if group > 1 {
            store.add_edge(ROOM, group, group - 1);
        }
        store.add_delta(ROOM, group, "t", &format!("k{group}"), &format!("e{group}"));
    }
    let groups: Vec<_> = (1..=20).collect();
    let dag = StateDag::load(&store, ROOM).expect("load");
    let mut source = all_deltas(&store, &groups);
    let state = Materializer::new(&dag, true)
        .resolve(&dag, 20, &mut source)
        .expect("resolve");
    assert_eq!(state.len(), 20);
    for group in 1..=20 {
        assert_eq!(state[&key(&format!("k{group}"))], EventId::new(&format!("e{group}")));
    }
}

// ---------------------------------------------------------------------------
// Scope and graph errors
// ---------------------------------------------------------------------------

#[test]
fn edgeless_scope_compacts_its_groups() {
    let mut store = MemoryStore::new();
    store
        .add_delta(ROOM, 5, "t", "a", "a5")
        .add_delta(ROOM, 6, "t", "a", "a6");
    let report = run_compaction(&store, &store, &CompactionConfig::for_scope(ROOM)).expect("run");
    assert_eq!(report.groups, 2);
    assert_eq!(report.edges, 0);
    assert_eq!(
        summary(&store.committed_intervals(ROOM)),
        vec![("a5".to_owned(), 0, Some(1)), ("a6".to_owned(), 1, None)]
    );
}

#[test]
fn unknown_scope_is_not_found() {
    let store = scenario_store();
    let err = run_compaction(&store, &store, &CompactionConfig::for_scope("!nope"))
        .expect_err("empty scope");
    assert!(matches!(err, CompactError::ScopeNotFound { scope } if scope == "!nope"));
}

#[test]
fn cyclic_graph_aborts_the_run() {
    let mut store = scenario_store();
    store.add_edge(ROOM, 1, 3);
    let err = run_compaction(&store, &store, &CompactionConfig::for_scope(ROOM))
        .expect_err("cycle");
    assert!(matches!(err, CompactError::CyclicGraph { members } if members == vec![1, 2, 3]));
    assert!(store.committed_intervals(ROOM).is_empty());

    let mut chunked = CompactionConfig::for_scope(ROOM);
    chunked.order = OrderStrategy::Chunked;
    let err = run_compaction(&store, &store, &chunked).expect_err("cycle");
    assert_eq!(err.code().code(), "E2002");
}

// ---------------------------------------------------------------------------
// Retries and rollback
// ---------------------------------------------------------------------------

#[test]
fn transient_batch_failures_are_retried() {
    let store = scenario_store();
    store.fail_next_batches(2);
    let mut config = CompactionConfig::for_scope(ROOM);
    config.retry_base_delay_ms = 1;

    let report = run_compaction(&store, &store, &config).expect("recovers");
    assert_eq!(report.batch_retries, 2);
    assert_eq!(store.committed_intervals(ROOM).len(), 3);
}

#[test]
fn exhausted_retries_fail_with_batch_load() {
    let store = scenario_store();
    store.fail_next_batches(10);
    let mut config = CompactionConfig::for_scope(ROOM);
    config.retry_base_delay_ms = 1;
    config.max_batch_retries = 1;

    let err = run_compaction(&store, &store, &config).expect_err("gives up");
    assert!(matches!(err, CompactError::BatchLoad { attempts: 2, .. }));
    assert!(err.is_retryable());
}

#[test]
fn failed_rerun_keeps_previous_rows() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir.path().join("state.sqlite3")).expect("open");
    store
        .seed_scope(
            ROOM,
            &[],
            &[Edge::new(2, 1), Edge::new(3, 2)],
            &[
                DeltaRow::new(1, "t", "a", "x"),
                DeltaRow::new(2, "t", "b", "y"),
                DeltaRow::new(3, "t", "a", "z"),
            ],
        )
        .expect("seed");

    let mut config = CompactionConfig::for_scope(ROOM);
    config.page_size = 1;
    run_compaction(&store, &store, &config).expect("first run");
    let before = query::read_intervals(store.conn(), ROOM).expect("scan");
    assert_eq!(before.len(), 3);

    // Group 4 hands y to a second key while (t, b) still holds it.
    store
        .seed_scope(
            ROOM,
            &[],
            &[Edge::new(4, 3)],
            &[DeltaRow::new(4, "t", "c", "y")],
        )
        .expect("seed bad group");
    let err = run_compaction(&store, &store, &config).expect_err("shared value");
    assert!(matches!(err, CompactError::InvariantViolation(_)));

    let after = query::read_intervals(store.conn(), ROOM).expect("scan");
    assert_eq!(after, before);
}

#[test]
fn quiet_trailing_steps_are_still_recorded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir.path().join("state.sqlite3")).expect("open");
    // Groups 3 and 4 add nothing, so no row mentions steps 2 or 3.
    store
        .seed_scope(
            ROOM,
            &[],
            &[Edge::new(2, 1), Edge::new(3, 2), Edge::new(4, 3)],
            &[DeltaRow::new(1, "t", "a", "x"), DeltaRow::new(2, "t", "a", "y")],
        )
        .expect("seed");

    let report = run_compaction(&store, &store, &CompactionConfig::for_scope(ROOM)).expect("run");
    assert_eq!(report.steps, 4);
    assert_eq!(query::recorded_steps(store.conn(), ROOM).expect("steps"), 4);
    assert_eq!(
        query::state_at(store.conn(), ROOM, 3).expect("last step"),
        query::current_state(store.conn(), ROOM).expect("current")
    );
}

#[test]
fn parent_without_a_group_row_is_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir.path().join("state.sqlite3")).expect("open");
    store
        .seed_scope(ROOM, &[2], &[], &[DeltaRow::new(2, "t", "a", "x")])
        .expect("seed");
    // Group 1 exists only as the far end of an edge.
    store
        .conn()
        .execute_batch("INSERT INTO state_group_edges (state_group, prev_state_group) VALUES (2, 1)")
        .expect("dangling edge");

    let err = run_compaction(&store, &store, &CompactionConfig::for_scope(ROOM))
        .expect_err("unknown parent");
    assert!(
        matches!(&err, CompactError::InvariantViolation(msg) if msg.contains("[1]")),
        "{err}"
    );
    assert!(query::read_intervals(store.conn(), ROOM).expect("scan").is_empty());
}

// ---------------------------------------------------------------------------
// SQLite round trip
// ---------------------------------------------------------------------------

fn seed_branching(store: &SqliteStore) {
    // 1 ← 2 ← 4, 1 ← 3, {3, 4} ← 5 ; 7 is a separate root.
    store
        .seed_scope(
            ROOM,
            &[7],
            &[
                Edge::new(2, 1),
                Edge::new(3, 1),
                Edge::new(4, 2),
                Edge::new(5, 3),
                Edge::new(5, 4),
            ],
            &[
                DeltaRow::new(1, "m.room.create", "", "$create"),
                DeltaRow::new(1, "m.room.member", "@a", "$join_a"),
                DeltaRow::new(2, "m.room.member", "@b", "$join_b"),
                DeltaRow::new(3, "m.room.name", "", "$name1"),
                DeltaRow::new(4, "m.room.member", "@a", "$leave_a"),
                DeltaRow::new(5, "m.room.topic", "", "$topic"),
                DeltaRow::new(7, "m.room.create", "", "$create7"),
            ],
        )
        .expect("seed");
}

#[test]
fn sqlite_intervals_reconstruct_every_step() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir.path().join("state.sqlite3")).expect("open");
    seed_branching(&store);

    for strategy in OrderStrategy::ALL {
        if strategy == OrderStrategy::Stored {
            store.store_ordering(ROOM, &[7, 5, 1, 4, 3, 2]).expect("ordering");
        }
        let mut config = CompactionConfig::for_scope(ROOM);
        config.order = strategy;
        config.batch_size = 2;
        config.page_size = 2;
        let report = run_compaction(&store, &store, &config).expect("run");
        assert_eq!(report.steps, 6);

        let dag = StateDag::load(&store, ROOM).expect("load").with_groups([7]);
        let order = select_order(strategy, &store, ROOM)
            .expect("provider")
            .order(&dag)
            .expect("order");
        let rows = query::read_intervals(store.conn(), ROOM).expect("scan");
        let mut source = all_deltas(&store, dag.ids());
        let mut materializer = Materializer::new(&dag, false);

        for (step, group) in order.iter().enumerate() {
            let expected = materializer.resolve(&dag, *group, &mut source).expect("resolve");
            let step = step as u64;
            assert_eq!(reconstruct_at(&rows, step), *expected, "{strategy} step {step}");
            assert_eq!(
                query::state_at(store.conn(), ROOM, step).expect("query"),
                *expected,
                "{strategy} sql step {step}"
            );
        }
        let last = materializer
            .resolve(&dag, *order.last().expect("non-empty"), &mut source)
            .expect("resolve last");
        assert_eq!(query::current_state(store.conn(), ROOM).expect("current"), *last);
    }
}

#[test]
fn prefetch_over_sqlite_matches_synchronous_run() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir.path().join("state.sqlite3")).expect("open");
    seed_branching(&store);

    let mut config = CompactionConfig::for_scope(ROOM);
    config.batch_size = 1;
    run_compaction(&store, &store, &config).expect("sync run");
    let sync_rows = query::read_intervals(store.conn(), ROOM).expect("scan");

    config.prefetch = true;
    let report = run_compaction(&store, &store, &config).expect("prefetch run");
    assert!(report.prefetched);
    assert_eq!(query::read_intervals(store.conn(), ROOM).expect("scan"), sync_rows);
}

#[test]
fn sink_without_begin_rejects_pages() {
    let store = MemoryStore::new();
    let row = IntervalRow {
        start_step: 0,
        end_step: None,
        start_group: 1,
        end_group: None,
        event_id: EventId::new("x"),
        key: key("a"),
    };
    assert!(store.append_intervals(ROOM, &[row]).is_err());
}
