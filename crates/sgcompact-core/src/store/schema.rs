//! Canonical SQLite schema for state groups and the interval table.
//!
//! - `state_groups`, `state_group_edges`, `state_groups_state` hold the
//!   upstream DAG and its deltas (read-only for the engine)
//! - `group_ordering` holds externally computed processing orders
//! - `state_intervals` is the compacted output, one row per presence window

/// Migration v1: upstream state-group tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS state_groups (
    id INTEGER PRIMARY KEY,
    room_id TEXT NOT NULL,
    event_id TEXT
);

CREATE TABLE IF NOT EXISTS state_group_edges (
    state_group INTEGER NOT NULL,
    prev_state_group INTEGER NOT NULL,
    PRIMARY KEY (state_group, prev_state_group)
);

CREATE TABLE IF NOT EXISTS state_groups_state (
    state_group INTEGER NOT NULL,
    room_id TEXT NOT NULL,
    type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    event_id TEXT NOT NULL,
    PRIMARY KEY (state_group, type, state_key)
);

CREATE INDEX IF NOT EXISTS idx_state_groups_room
    ON state_groups(room_id, id);

CREATE INDEX IF NOT EXISTS idx_state_group_edges_prev
    ON state_group_edges(prev_state_group);

CREATE INDEX IF NOT EXISTS idx_state_groups_state_room_group
    ON state_groups_state(room_id, state_group);
";

/// Migration v2: stored orderings and the compacted interval table.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS group_ordering (
    room_id TEXT NOT NULL,
    state_group INTEGER NOT NULL,
    ordering INTEGER NOT NULL,
    PRIMARY KEY (room_id, state_group)
);

CREATE TABLE IF NOT EXISTS state_intervals (
    start_step INTEGER NOT NULL CHECK (start_step >= 0),
    end_step INTEGER CHECK (end_step IS NULL OR end_step > start_step),
    start_group INTEGER NOT NULL,
    end_group INTEGER,
    event_id TEXT NOT NULL,
    room_id TEXT NOT NULL,
    type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    CHECK ((end_step IS NULL) = (end_group IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_group_ordering_room_ordering
    ON group_ordering(room_id, ordering);

CREATE INDEX IF NOT EXISTS idx_state_intervals_room_open
    ON state_intervals(room_id, start_step)
    WHERE end_step IS NULL;

CREATE INDEX IF NOT EXISTS idx_state_intervals_room_range
    ON state_intervals(room_id, start_step, end_step);
";

/// Migration v3: step count of each scope's last committed run.
pub const MIGRATION_V3_SQL: &str = r"
CREATE TABLE IF NOT EXISTS compaction_runs (
    room_id TEXT PRIMARY KEY,
    steps INTEGER NOT NULL CHECK (steps >= 0),
    completed_at TEXT NOT NULL
);
";

/// Indexes the query paths rely on.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_state_groups_room",
    "idx_state_group_edges_prev",
    "idx_state_groups_state_room_group",
    "idx_group_ordering_room_ordering",
    "idx_state_intervals_room_open",
    "idx_state_intervals_room_range",
];
