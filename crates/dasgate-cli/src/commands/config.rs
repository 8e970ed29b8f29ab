use dasgate_core::GatewayConfig;
use serde_json::Value;

use crate::error::CliError;

const REDACTED: &str = "<redacted>";

pub fn run(config: &GatewayConfig) -> Result<Value, CliError> {
    let mut shown = config.clone();
    if shown.auth.token.is_some() {
        shown.auth.token = Some(String::from(REDACTED));
    }
    Ok(serde_json::to_value(shown)?)
}
