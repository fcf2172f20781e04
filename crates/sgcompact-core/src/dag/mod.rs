//! The state-group DAG and the orders it can be walked in.
//!
//! # Sub-modules
//!
//! - [`graph`]: immutable adjacency built once per run ([`StateDag`]).
//! - [`order`]: pluggable visitation orders ([`OrderProvider`]).

pub mod graph;
pub mod order;

pub use graph::StateDag;
pub use order::{OrderProvider, OrderStrategy, select_order};
