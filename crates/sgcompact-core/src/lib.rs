#![forbid(unsafe_code)]
//! sgcompact-core library.
//!
//! Walks a room's state-group DAG once, materializes the full state at every
//! group with a reference-counted memo, diffs consecutive states, and writes
//! an interval table from which "state as of step S" is two range lookups.
//!
//! # Pipeline
//!
//! [`dag::StateDag::load`] → [`dag::order`] → [`loader`] (batched deltas) →
//! [`resolve::Materializer`] (with [`prune::Pruner`]) → [`diff`] →
//! [`interval::IntervalWriter`] → [`store::IntervalSink`].
//!
//! [`session::run_compaction`] wires the stages together for one scope.
//!
//! # Conventions
//!
//! - **Errors**: engine stages return [`error::CompactError`]; config and
//!   glue code use `anyhow::Result`.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod config;
pub mod dag;
pub mod diff;
pub mod error;
pub mod interval;
pub mod loader;
pub mod model;
pub mod prune;
pub mod query;
pub mod resolve;
pub mod session;
pub mod store;

pub use error::{CompactError, ErrorCode};
pub use model::{DeltaRow, Edge, EventId, GroupId, IntervalRow, StateKey, StateMap};
pub use session::{RunReport, run_compaction};
