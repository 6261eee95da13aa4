//! Kanflow CLI entry point.
//!
//! Binary name: `kanflow`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the workflow
//! command handlers.

mod cli;

use clap::Parser;
use kanflow_observe::tracing_setup::{self, TracingOptions};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _tracing = tracing_setup::init_tracing(&TracingOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json_logs: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))?;

    match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&file, cli.json).await,
        Commands::Run {
            file,
            task,
            data_dir,
        } => cli::workflow::handle_run(&file, task.as_deref(), data_dir, cli.json).await,
        Commands::Check {
            criterion,
            output,
            format,
        } => cli::workflow::handle_check(&criterion, &output, format.as_deref(), cli.json).await,
    }
}
