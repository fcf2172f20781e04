//! sgcompact-sim library.
//!
//! Seeded generation of state-group DAGs ([`mod@generate`]) and an oracle
//! ([`oracle`]) that checks engine output against a naive resolver.
//! [`campaign`] runs the oracle over seed ranges.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

#![forbid(unsafe_code)]

pub mod campaign;
pub mod generate;
pub mod oracle;
pub mod rng;

pub use campaign::{CampaignConfig, CampaignReport, SIM_SCOPE, replay_seed, run_campaign};
pub use generate::{GeneratedScope, GeneratorConfig, generate};
pub use oracle::{CompactionOracle, OracleOptions, OracleResult, Violation};
