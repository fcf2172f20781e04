//! `sgcompact compact`: run the engine over one scope.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use sgcompact_core::config::{CompactionConfig, load_config, resolve_config_path};
use sgcompact_core::dag::OrderStrategy;
use sgcompact_core::{RunReport, run_compaction};

use crate::cmd::StoreArgs;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Arguments for `sgcompact compact`.
#[derive(Args, Debug)]
pub struct CompactArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Config file; defaults to ./sgcompact.toml, then the user config dir.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Groups per delta batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Processing order.
    #[arg(long, value_name = "STRATEGY")]
    pub order: Option<OrderStrategy>,

    /// Interval rows per write page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Keep every memoized state for the whole run.
    #[arg(long)]
    pub no_prune: bool,

    /// Read the next batch on a second connection while the current one is
    /// processed.
    #[arg(long)]
    pub prefetch: bool,

    /// Retries per failed batch read.
    #[arg(long)]
    pub max_batch_retries: Option<u32>,
}

impl CompactArgs {
    /// File config (if any) with flags applied on top.
    fn resolve_config(&self) -> Result<CompactionConfig> {
        let mut config = match resolve_config_path(self.config.as_deref()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                load_config(&path)?
            }
            None => CompactionConfig::default(),
        };

        config.scope.clone_from(&self.store.scope);
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(order) = self.order {
            config.order = order;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if self.no_prune {
            config.prune = false;
        }
        if self.prefetch {
            config.prefetch = true;
        }
        if let Some(retries) = self.max_batch_retries {
            config.max_batch_retries = retries;
        }
        Ok(config)
    }
}

/// Execute `sgcompact compact`.
///
/// # Errors
///
/// Returns an error if the config, the database, or the run fails.
pub fn run_compact(args: &CompactArgs, output: OutputMode) -> Result<()> {
    let config = args.resolve_config()?;
    let store = args.store.open()?;
    let report = run_compaction(&store, &store, &config)
        .with_context(|| format!("Compaction of {} failed", config.scope))?;

    render_mode(output, &report, render_text, render_pretty)
}

fn render_text(report: &RunReport, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "compacted scope={} order={} groups={} edges={} steps={}",
        report.scope, report.order, report.groups, report.edges, report.steps
    )?;
    writeln!(
        w,
        "rows written={} open={} batches={} retries={} fetches={}",
        report.rows_written, report.open_rows, report.batches, report.batch_retries, report.on_demand_fetches
    )?;
    writeln!(
        w,
        "memo peak={} pruned={} elapsed_ms={}",
        report.peak_memo_entries, report.pruned_entries, report.elapsed_ms
    )
}

fn render_pretty(report: &RunReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Compaction")?;
    pretty_kv(w, "Scope", &report.scope)?;
    pretty_kv(w, "Order", &report.order)?;
    pretty_kv(w, "Groups", format!("{} ({} edges)", report.groups, report.edges))?;
    pretty_kv(w, "Steps", report.steps.to_string())?;
    pretty_kv(
        w,
        "Rows",
        format!("{} written, {} open", report.rows_written, report.open_rows),
    )?;
    pretty_kv(
        w,
        "Batches",
        format!(
            "{} ({} retries{})",
            report.batches,
            report.batch_retries,
            if report.prefetched { ", prefetched" } else { "" }
        ),
    )?;
    pretty_kv(w, "Fetched", format!("{} groups on demand", report.on_demand_fetches))?;
    pretty_kv(
        w,
        "Memo",
        format!("peak {} entries, {} pruned", report.peak_memo_entries, report.pruned_entries),
    )?;
    pretty_kv(w, "Edge hash", &report.edge_hash)?;
    pretty_kv(w, "Elapsed", format!("{} ms", report.elapsed_ms))
}
