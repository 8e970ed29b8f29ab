use serde_json::Value;

use crate::backend::Backend;
use crate::normalize::{parse_json, records_from_array, Normalizer};
use crate::record::Record;
use crate::SchemaError;

const ENVELOPE: &str = "phedex";

/// Data placement service. Payloads wrap their result arrays in a
/// `{"phedex": {...}}` envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhedexNormalizer;

impl PhedexNormalizer {
    fn result_field(api: &str) -> Option<&'static str> {
        match api {
            "blockReplicas" => Some("block"),
            "nodes" => Some("node"),
            _ => None,
        }
    }
}

impl Normalizer for PhedexNormalizer {
    fn backend(&self) -> Backend {
        Backend::Phedex
    }

    fn normalize(&self, api: &str, payload: &[u8]) -> Result<Vec<Record>, SchemaError> {
        let mut envelope = match parse_json(Backend::Phedex, api, payload)? {
            Value::Object(mut root) => match root.remove(ENVELOPE) {
                Some(Value::Object(envelope)) => envelope,
                Some(_) => return Err(SchemaError::unexpected_type(ENVELOPE, "object")),
                None => return Err(SchemaError::missing_field(ENVELOPE)),
            },
            _ => return Err(SchemaError::unexpected_type(ENVELOPE, "object")),
        };

        let (field, items) = match Self::result_field(api) {
            Some(field) => match envelope.remove(field) {
                Some(Value::Array(items)) => (field.to_owned(), items),
                Some(_) => return Err(SchemaError::unexpected_type(field, "array")),
                None => return Err(SchemaError::missing_field(format!("{ENVELOPE}.{field}"))),
            },
            None => {
                let field = envelope
                    .iter()
                    .find(|(_, value)| value.is_array())
                    .map(|(key, _)| key.clone())
                    .ok_or_else(|| SchemaError::missing_field(format!("{ENVELOPE}.<array>")))?;
                match envelope.remove(&field) {
                    Some(Value::Array(items)) => (field, items),
                    _ => return Err(SchemaError::unexpected_type(field, "array")),
                }
            }
        };

        records_from_array(&field, items)
    }
}
