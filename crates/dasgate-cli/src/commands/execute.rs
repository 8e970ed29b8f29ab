use std::time::Instant;

use dasgate_core::{CounterSnapshot, Gateway, GatewayConfig, Query, Record, SpecValue};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::cli::ExecuteArgs;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct ExecuteResponseData {
    api: String,
    instance: String,
    fingerprint: String,
    records: Vec<Record>,
    counters: CounterSnapshot,
    latency_ms: u64,
}

pub async fn run(args: &ExecuteArgs, config: GatewayConfig) -> Result<Value, CliError> {
    let query = parse_query(args)?;
    let gateway = Gateway::builder(config).build()?;

    let started = Instant::now();
    let records = gateway.execute(&query, &args.api).await?;
    let latency_ms = started.elapsed().as_millis() as u64;
    info!(api = %args.api, records = records.len(), latency_ms, "query answered");

    let data = ExecuteResponseData {
        api: args.api.clone(),
        instance: query.instance.clone(),
        fingerprint: query.fingerprint()?,
        records,
        counters: gateway.counters(),
        latency_ms,
    };
    Ok(serde_json::to_value(data)?)
}

fn parse_query(args: &ExecuteArgs) -> Result<Query, CliError> {
    let raw = match (&args.spec, &args.spec_file) {
        (Some(spec), _) => spec.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => {
            return Err(CliError::Validation(String::from(
                "one of --spec or --spec-file is required",
            )))
        }
    };
    let spec: Map<String, Value> = serde_json::from_str(&raw)
        .map_err(|e| CliError::Validation(format!("query spec must be a JSON object: {e}")))?;

    Ok(spec
        .into_iter()
        .fold(Query::new(args.instance.as_str()), |query, (key, value)| {
            query.with_param(key, SpecValue::from(value))
        }))
}
