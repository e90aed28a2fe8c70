//! `edgetel` binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use edge_cli::cli::Cli;
use edge_cli::search::{load_config, search};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("no matching records");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether anything was printed.
async fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = load_config(cli)?;
    let outcome = search(cli, &config, io::stdout()).await?;
    if outcome.timed_out {
        tracing::debug!(printed = outcome.printed, "search timed out");
    }
    Ok(outcome.printed > 0)
}
