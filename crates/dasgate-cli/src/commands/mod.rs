mod apis;
mod config;
mod execute;

use dasgate_core::GatewayConfig;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub async fn run(cli: &Cli) -> Result<Value, CliError> {
    match &cli.command {
        Command::Execute(args) => execute::run(args, load_config(cli)?).await,
        Command::Apis => apis::run(),
        Command::Config => config::run(&load_config(cli)?),
    }
}

/// Configuration from `--config` (or the usual lookup), with command-line
/// overrides applied last.
fn load_config(cli: &Cli) -> Result<GatewayConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_path(path)?.with_env_overrides(),
        None => GatewayConfig::load()?,
    };
    if let Some(concurrency) = cli.concurrency {
        config.concurrency_limit = concurrency;
    }
    if let Some(retry) = cli.retry {
        config.retry_count = retry;
    }
    if let Some(timeout) = cli.timeout {
        config.http_timeout_secs = timeout;
    }
    config.validate()?;
    Ok(config)
}
