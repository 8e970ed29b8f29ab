use dasgate_core::LogicalApi;
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Debug, Serialize)]
struct ApiDescription {
    name: &'static str,
    parameters: &'static [&'static str],
}

#[derive(Debug, Serialize)]
struct ApisResponseData {
    apis: Vec<ApiDescription>,
}

pub fn run() -> Result<Value, CliError> {
    let apis = LogicalApi::ALL
        .into_iter()
        .map(|api| ApiDescription {
            name: api.as_str(),
            parameters: api.parameters(),
        })
        .collect();

    Ok(serde_json::to_value(ApisResponseData { apis })?)
}
