#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use std::process;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "sgcompact: interval compaction of state-group DAGs",
    long_about = None
)]
struct Cli {
    /// Output format; defaults to pretty on a TTY and text when piped.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Emit JSON output (same as `--format json`).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Compact a scope into the interval table",
        long_about = "Walk the scope's state-group DAG once and rewrite its interval table in one transaction.",
        after_help = "EXAMPLES:\n    # Compact a room with defaults\n    sgcompact compact --db state.sqlite3 --scope '!room:example.org'\n\n    # Chunked order, larger batches, prefetching reader\n    sgcompact compact --db state.sqlite3 --scope '!room:example.org' --order chunked --batch-size 500 --prefetch\n\n    # Emit the run report as JSON\n    sgcompact compact --db state.sqlite3 --scope '!room:example.org' --json"
    )]
    Compact(cmd::compact::CompactArgs),

    #[command(
        about = "Show current or historic state",
        long_about = "Read the state of a scope from its interval table, either current or as of a processing step.",
        after_help = "EXAMPLES:\n    # Current state\n    sgcompact state --db state.sqlite3 --scope '!room:example.org'\n\n    # State as of step 12\n    sgcompact state --db state.sqlite3 --scope '!room:example.org' --at 12"
    )]
    State(cmd::state::StateArgs),

    #[command(
        about = "Print the processing order of a scope",
        after_help = "EXAMPLES:\n    # Chunked topological order, one group per line\n    sgcompact order --db state.sqlite3 --scope '!room:example.org' --order chunked --format text"
    )]
    Order(cmd::order::OrderArgs),

    #[command(
        about = "Run a deterministic simulation campaign",
        long_about = "Generate random state-group DAGs per seed and check engine output against a naive resolver.",
        after_help = "EXAMPLES:\n    # Run 100 seeds\n    sgcompact sim\n\n    # Replay one seed with larger graphs\n    sgcompact sim --seeds 42..43 --groups 200"
    )]
    Sim(cmd::sim::SimArgs),

    #[command(
        about = "Write a generated scope into a database",
        after_help = "EXAMPLES:\n    # Seed 500 groups into a fresh database\n    sgcompact seed --db state.sqlite3 --scope '!demo:example.org' --seed 7 --groups 500"
    )]
    Seed(cmd::seed::SeedArgs),

    #[command(
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    sgcompact completions bash"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SGCOMPACT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "sgcompact=debug,info"
        } else {
            "sgcompact=info,warn"
        })
    });

    let format = env::var("SGCOMPACT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = cli.output_mode();

    let command_result = match cli.command {
        Commands::Compact(ref args) => cmd::compact::run_compact(args, output),
        Commands::State(ref args) => cmd::state::run_state(args, output),
        Commands::Order(ref args) => cmd::order::run_order(args, output),
        Commands::Sim(ref args) => cmd::sim::run_sim(args, output),
        Commands::Seed(ref args) => cmd::seed::run_seed(args, output),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    };

    if let Err(error) = command_result {
        render_error(output, &CliError::from_anyhow(&error))?;
        process::exit(1);
    }
    Ok(())
}
