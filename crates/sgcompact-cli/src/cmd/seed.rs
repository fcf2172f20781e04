//! `sgcompact seed`: write a generated scope into a database.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use sgcompact_sim::{GeneratorConfig, generate};

use crate::cmd::StoreArgs;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Arguments for `sgcompact seed`.
#[derive(Args, Debug)]
pub struct SeedArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Generator seed.
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Number of groups to generate.
    #[arg(long, default_value = "40")]
    pub groups: usize,

    /// Distinct state keys.
    #[arg(long, default_value = "8")]
    pub keys: usize,
}

#[derive(Debug, Serialize)]
struct SeedOutput {
    scope: String,
    seed: u64,
    groups: usize,
    edges: usize,
    delta_rows: usize,
}

/// Execute `sgcompact seed`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or written.
pub fn run_seed(args: &SeedArgs, output: OutputMode) -> Result<()> {
    let config = GeneratorConfig {
        groups: args.groups,
        keys: args.keys,
        ..GeneratorConfig::default()
    };
    let scope = generate(&args.store.scope, args.seed, &config);
    let store = args.store.open()?;
    scope
        .seed_sqlite(&store)
        .with_context(|| format!("Failed to seed scope {}", scope.scope))?;
    tracing::info!(scope = %scope.scope, groups = scope.groups.len(), "seeded scope");

    let out = SeedOutput {
        scope: scope.scope,
        seed: args.seed,
        groups: scope.groups.len(),
        edges: scope.edges.len(),
        delta_rows: scope.deltas.len(),
    };
    render_mode(output, &out, render_text, render_pretty)
}

fn render_text(out: &SeedOutput, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "seeded scope={} seed={} groups={} edges={} delta_rows={}",
        out.scope, out.seed, out.groups, out.edges, out.delta_rows
    )
}

fn render_pretty(out: &SeedOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Seeded scope")?;
    pretty_kv(w, "Scope", &out.scope)?;
    pretty_kv(w, "Seed", out.seed.to_string())?;
    pretty_kv(w, "Groups", out.groups.to_string())?;
    pretty_kv(w, "Edges", out.edges.to_string())?;
    pretty_kv(w, "Delta rows", out.delta_rows.to_string())
}
