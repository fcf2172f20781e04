//! Campaign runner: many seeds, one generated scope each, oracle checks on
//! every one, first failing seed reported for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::generate::{GeneratedScope, GeneratorConfig, generate};
use crate::oracle::{CompactionOracle, OracleOptions, OracleResult};
use crate::rng::DeterministicRng;

/// Scope name every simulated run compacts.
pub const SIM_SCOPE: &str = "!sim:example.org";

/// Campaign-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    /// Shape of every generated scope.
    pub generator: GeneratorConfig,
    /// Largest batch size tried; each seed picks one in `1..=max_batch_size`.
    pub max_batch_size: usize,
    /// Chance a seed runs with the prefetching loader.
    pub prefetch_percent: u8,
    /// Chance a seed starts with failing batch reads (recovered by retries).
    pub transient_fault_percent: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            generator: GeneratorConfig::default(),
            max_batch_size: 16,
            prefetch_percent: 30,
            transient_fault_percent: 20,
        }
    }
}

impl CampaignConfig {
    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.generator.groups == 0 {
            bail!("groups must be > 0");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be > 0");
        }
        Ok(())
    }

    /// Engine options for `seed`, drawn from a stream independent of the
    /// generator's.
    #[must_use]
    pub fn options_for_seed(&self, seed: u64) -> OracleOptions {
        let mut rng = DeterministicRng::new(seed.wrapping_add(0xC0FF_EE00));
        let batch_size = 1 + rng.next_index(self.max_batch_size);
        let page_size = 1 + rng.next_index(8);
        let prefetch = rng.hit_rate_percent(self.prefetch_percent);
        let transient_faults = if rng.hit_rate_percent(self.transient_fault_percent) {
            1 + u32::try_from(rng.next_bounded(3)).unwrap_or(0)
        } else {
            0
        };
        OracleOptions {
            batch_size,
            page_size,
            prefetch,
            transient_faults,
        }
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Total groups compacted across seeds.
    pub groups_checked: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Generated scope and oracle outcome of one replayed seed.
#[derive(Debug, Clone)]
pub struct SeedTrace {
    pub scope: GeneratedScope,
    pub options: OracleOptions,
    pub oracle: OracleResult,
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        groups_checked: 0,
    };

    for seed in config.seed_range.clone() {
        let trace = run_seed(seed, config);
        report.seeds_run += 1;
        report.groups_checked += trace.scope.groups.len();

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(ToString::to_string).collect(),
            });
        }
    }

    tracing::info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        groups = report.groups_checked,
        "campaign finished"
    );
    Ok(report)
}

/// Replay a single seed with the generated scope and oracle details.
///
/// # Errors
///
/// Returns an error when config validation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SeedTrace> {
    config.validate()?;
    Ok(run_seed(seed, config))
}

fn run_seed(seed: u64, config: &CampaignConfig) -> SeedTrace {
    let scope = generate(SIM_SCOPE, seed, &config.generator);
    let options = config.options_for_seed(seed);
    let oracle = CompactionOracle::check_all(&scope, options);
    SeedTrace {
        scope,
        options,
        oracle,
    }
}
