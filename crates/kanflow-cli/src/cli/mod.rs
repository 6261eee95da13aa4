//! CLI command definitions for the `kanflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run multi-agent kanban workflows.
#[derive(Parser)]
#[command(name = "kanflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write log lines to stderr as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow file, then list its steps.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Run a workflow against a task document.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Task document (JSON or YAML). Defaults to an empty task.
        #[arg(long)]
        task: Option<PathBuf>,

        /// Data directory for config and run artifacts.
        #[arg(long, env = "KANFLOW_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Check one acceptance criterion against an output file.
    Check {
        /// Criterion: substring, `field == value`, or `/regex/flags`.
        #[arg(long)]
        criterion: String,

        /// Output file to check.
        #[arg(long)]
        output: PathBuf,

        /// Parse the output as this file name's format (defaults to the
        /// output file's own extension).
        #[arg(long)]
        format: Option<String>,
    },
}
