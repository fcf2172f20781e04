//! `sgcompact sim`: deterministic simulation campaign over generated DAGs.

use std::io::Write;
use std::ops::Range;
use std::process;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use sgcompact_sim::{CampaignConfig, GeneratorConfig, run_campaign};

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Arguments for `sgcompact sim`.
#[derive(Args, Debug)]
pub struct SimArgs {
    /// Seed range to run, `A..B` (end exclusive).
    #[arg(long, value_name = "A..B", default_value = "0..100", value_parser = parse_seed_range)]
    pub seeds: Range<u64>,

    /// Groups per generated scope.
    #[arg(long, default_value = "40")]
    pub groups: usize,

    /// Largest batch size a seed may draw.
    #[arg(long, default_value = "16")]
    pub max_batch_size: usize,

    /// Percent of seeds run with the prefetching loader.
    #[arg(long, default_value = "30")]
    pub prefetch_percent: u8,

    /// Percent of seeds started with transient batch read failures.
    #[arg(long, default_value = "20")]
    pub fault_percent: u8,
}

/// Parse `A..B` into a seed range.
fn parse_seed_range(raw: &str) -> Result<Range<u64>, String> {
    let (start, end) = raw
        .split_once("..")
        .ok_or_else(|| format!("expected A..B, got '{raw}'"))?;
    let start: u64 = start.trim().parse().map_err(|e| format!("bad range start: {e}"))?;
    let end: u64 = end.trim().parse().map_err(|e| format!("bad range end: {e}"))?;
    if start >= end {
        return Err(format!("empty seed range {start}..{end}"));
    }
    Ok(start..end)
}

#[derive(Debug, Serialize)]
struct SimOutput {
    seeds: String,
    seeds_run: usize,
    seeds_passed: usize,
    groups_checked: usize,
    first_failure: Option<u64>,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

/// Execute `sgcompact sim`; exits with status 1 if any seed fails.
///
/// # Errors
///
/// Returns an error if the campaign configuration is invalid.
pub fn run_sim(args: &SimArgs, output: OutputMode) -> Result<()> {
    let config = CampaignConfig {
        seed_range: args.seeds.clone(),
        generator: GeneratorConfig {
            groups: args.groups,
            ..GeneratorConfig::default()
        },
        max_batch_size: args.max_batch_size,
        prefetch_percent: args.prefetch_percent,
        transient_fault_percent: args.fault_percent,
    };

    let report = run_campaign(&config)?;
    let out = SimOutput {
        seeds: format!("{}..{}", args.seeds.start, args.seeds.end),
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        groups_checked: report.groups_checked,
        first_failure: report.first_failure,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };

    render_mode(output, &out, render_text, render_pretty)?;

    // Exit code 1 on any failure for CI integration
    if !out.all_passed {
        process::exit(1);
    }
    Ok(())
}

fn render_text(out: &SimOutput, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "campaign seeds={} run={} passed={} groups={} all_passed={}",
        out.seeds, out.seeds_run, out.seeds_passed, out.groups_checked, out.all_passed
    )?;
    for failure in out.failures.iter().take(5) {
        writeln!(w, "failure seed={} violations={}", failure.seed, failure.violations.len())?;
    }
    if out.failures.len() > 5 {
        writeln!(w, "failures_truncated count={}", out.failures.len() - 5)?;
    }
    Ok(())
}

fn render_pretty(out: &SimOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Simulation Campaign")?;
    pretty_kv(w, "Seeds", &out.seeds)?;
    pretty_kv(
        w,
        "Results",
        format!(
            "{} passed / {} failed",
            out.seeds_passed,
            out.seeds_run - out.seeds_passed
        ),
    )?;
    pretty_kv(w, "Groups checked", out.groups_checked.to_string())?;

    match out.first_failure {
        None => pretty_kv(w, "Status", "all seeds passed"),
        Some(first) => {
            pretty_kv(w, "Status", format!("first failure at seed {first}"))?;
            writeln!(w)?;
            pretty_section(w, "Failure Samples")?;
            for failure in out.failures.iter().take(5) {
                writeln!(w, "seed {:<8} violations={}", failure.seed, failure.violations.len())?;
                for violation in &failure.violations {
                    writeln!(w, "  - {violation}")?;
                }
            }
            writeln!(w)?;
            pretty_kv(w, "Replay", format!("sgcompact sim --seeds {first}..{}", first + 1))
        }
    }
}
