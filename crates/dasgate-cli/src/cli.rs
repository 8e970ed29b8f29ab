//! CLI argument definitions for dasgate.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `execute` | Run a logical API for a query spec |
//! | `apis` | List the logical APIs and the parameters they read |
//! | `config` | Print the effective configuration |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | `$DASGATE_CONFIG` | JSON configuration file |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--concurrency` | config | Fetch concurrency limit (0 = unlimited) |
//! | `--retry` | config | Retries per backend call |
//! | `--timeout` | config | Per-request timeout in seconds |
//! | `-v` | warn | Log verbosity, repeat for more |
//!
//! # Examples
//!
//! ```bash
//! dasgate execute --api run_lumi4dataset --spec '{"dataset": "/A/B/RAW", "run": "100"}'
//! dasgate execute --api dataset4site_release --spec-file query.json --pretty
//! dasgate apis
//! ```

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Concurrent fetch-and-aggregate gateway for the experiment's data services.
#[derive(Debug, Parser)]
#[command(
    name = "dasgate",
    author,
    version,
    about = "Data aggregation gateway",
    long_about = "dasgate answers logical queries by fanning out to the bookkeeping and \
data placement services, normalizing their JSON and merging the results.\n\
\n\
Use 'dasgate <command> --help' for command-specific help."
)]
pub struct Cli {
    /// JSON configuration file. Falls back to $DASGATE_CONFIG, then defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Maximum number of backend calls in flight (0 = unlimited).
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Number of retries for a failed backend call.
    #[arg(long, global = true)]
    pub retry: Option<u32>,

    /// Per-request timeout in seconds (0 = none).
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a logical API and print the merged records.
    ///
    /// # Examples
    ///
    ///   dasgate execute --api run_lumi4block --spec '{"block": "/A/B/RAW#1"}'
    ///   dasgate execute --api datasetlist --spec-file spec.json
    Execute(ExecuteArgs),

    /// List logical APIs and their parameters.
    Apis,

    /// Print the effective configuration (credentials redacted).
    Config,
}

#[derive(Debug, Args)]
pub struct ExecuteArgs {
    /// Logical API name, e.g. run_lumi4dataset.
    #[arg(long)]
    pub api: String,

    /// Backend database instance.
    #[arg(long, default_value = dasgate_core::query::DEFAULT_INSTANCE)]
    pub instance: String,

    /// Query spec as an inline JSON object.
    #[arg(long, conflicts_with = "spec_file", required_unless_present = "spec_file")]
    pub spec: Option<String>,

    /// File holding the query spec as a JSON object.
    #[arg(long)]
    pub spec_file: Option<PathBuf>,
}
