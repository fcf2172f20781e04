//! `sgcompact order`: print the processing order of a scope.

use std::io::Write;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use sgcompact_core::GroupId;
use sgcompact_core::dag::order::validate_order;
use sgcompact_core::dag::{OrderStrategy, select_order};
use sgcompact_core::session::load_scope_dag;

use crate::cmd::StoreArgs;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Arguments for `sgcompact order`.
#[derive(Args, Debug)]
pub struct OrderArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Order strategy to compute.
    #[arg(long, value_name = "STRATEGY", default_value = "ascending")]
    pub order: OrderStrategy,
}

#[derive(Debug, Serialize)]
struct OrderOutput {
    scope: String,
    order: String,
    edge_hash: String,
    groups: Vec<GroupId>,
}

/// Execute `sgcompact order`.
///
/// # Errors
///
/// Returns an error if the DAG cannot be loaded or ordered.
pub fn run_order(args: &OrderArgs, output: OutputMode) -> Result<()> {
    let store = args.store.open()?;
    let scope = args.store.scope.as_str();
    let dag = load_scope_dag(&store, scope)?;
    let provider = select_order(args.order, &store, scope)?;
    let groups = provider.order(&dag)?;
    validate_order(&dag, &groups)?;

    let out = OrderOutput {
        scope: scope.to_owned(),
        order: provider.name().to_owned(),
        edge_hash: dag.content_hash().to_owned(),
        groups,
    };
    render_mode(output, &out, render_text, render_pretty)
}

fn render_text(out: &OrderOutput, w: &mut dyn Write) -> std::io::Result<()> {
    for group in &out.groups {
        writeln!(w, "{group}")?;
    }
    Ok(())
}

fn render_pretty(out: &OrderOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Processing order")?;
    pretty_kv(w, "Scope", &out.scope)?;
    pretty_kv(w, "Strategy", &out.order)?;
    pretty_kv(w, "Groups", out.groups.len().to_string())?;
    writeln!(w)?;
    for (step, group) in out.groups.iter().enumerate() {
        writeln!(w, "  {step:>6}  {group}")?;
    }
    Ok(())
}
