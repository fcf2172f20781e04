//! `sgcompact state`: current or historic state from the interval table.

use std::io::Write;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use sgcompact_core::query::{current_state, recorded_steps, state_at};

use crate::cmd::StoreArgs;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Arguments for `sgcompact state`.
#[derive(Args, Debug)]
pub struct StateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Processing step to reconstruct; omit for the current state.
    #[arg(long, value_name = "STEP")]
    pub at: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StateEntry {
    #[serde(rename = "type")]
    event_type: String,
    state_key: String,
    event_id: String,
}

#[derive(Debug, Serialize)]
struct StateOutput {
    scope: String,
    step: Option<u64>,
    recorded_steps: u64,
    entries: Vec<StateEntry>,
}

/// Execute `sgcompact state`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or queried.
pub fn run_state(args: &StateArgs, output: OutputMode) -> Result<()> {
    let store = args.store.open()?;
    let scope = args.store.scope.as_str();
    let recorded = recorded_steps(store.conn(), scope)?;

    if let Some(step) = args.at.filter(|step| *step >= recorded) {
        tracing::warn!(step, recorded, "step is past the last recorded step; showing the final state");
    }

    let state = match args.at {
        Some(step) => state_at(store.conn(), scope, step)?,
        None => current_state(store.conn(), scope)?,
    };

    let mut entries: Vec<StateEntry> = state
        .into_iter()
        .map(|(key, event)| StateEntry {
            event_type: key.event_type.to_string(),
            state_key: key.state_key.to_string(),
            event_id: event.to_string(),
        })
        .collect();
    entries.sort_by(|a, b| (&a.event_type, &a.state_key).cmp(&(&b.event_type, &b.state_key)));

    let out = StateOutput {
        scope: scope.to_owned(),
        step: args.at,
        recorded_steps: recorded,
        entries,
    };
    render_mode(output, &out, render_text, render_pretty)
}

fn render_text(out: &StateOutput, w: &mut dyn Write) -> std::io::Result<()> {
    for entry in &out.entries {
        writeln!(w, "{}\t{}\t{}", entry.event_type, entry.state_key, entry.event_id)?;
    }
    Ok(())
}

fn render_pretty(out: &StateOutput, w: &mut dyn Write) -> std::io::Result<()> {
    let heading = out
        .step
        .map_or_else(|| "Current state".to_owned(), |step| format!("State at step {step}"));
    pretty_section(w, &heading)?;
    pretty_kv(w, "Scope", &out.scope)?;
    pretty_kv(w, "Recorded steps", out.recorded_steps.to_string())?;
    pretty_kv(w, "Entries", out.entries.len().to_string())?;
    writeln!(w)?;
    for entry in &out.entries {
        writeln!(
            w,
            "  {:<28} {:<24} {}",
            entry.event_type,
            format!("{:?}", entry.state_key),
            entry.event_id
        )?;
    }
    Ok(())
}
