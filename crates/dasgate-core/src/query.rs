//! Parsed client queries.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::SchemaError;

/// Backend database instance used when a query does not name one.
pub const DEFAULT_INSTANCE: &str = "prod/global";

/// A single query parameter: one string, a list of strings, or any other JSON
/// value the planner passes through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SpecValue {
    Text(String),
    List(Vec<String>),
    Structured(Value),
}

impl SpecValue {
    fn scalar_text(value: &Value) -> Option<String> {
        match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for SpecValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<&str> for SpecValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for SpecValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for SpecValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for SpecValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_owned).collect())
    }
}

/// Strings and numbers become text (`3` reads as `"3"`), arrays of strings
/// become lists; anything else is kept structured.
impl From<Value> for SpecValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Number(number) => Self::Text(number.to_string()),
            Value::Array(items) if items.iter().all(Value::is_string) => Self::List(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text),
                        _ => None,
                    })
                    .collect(),
            ),
            other => Self::Structured(other),
        }
    }
}

/// A parsed client query: the spec map plus the backend instance it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub spec: BTreeMap<String, SpecValue>,
    #[serde(default = "default_instance")]
    pub instance: String,
}

fn default_instance() -> String {
    String::from(DEFAULT_INSTANCE)
}

impl Default for Query {
    fn default() -> Self {
        Self::new(DEFAULT_INSTANCE)
    }
}

impl Query {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            spec: BTreeMap::new(),
            instance: instance.into(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<SpecValue>) -> Self {
        self.spec.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&SpecValue> {
        self.spec.get(key)
    }

    /// Returns the string parameter `key`, failing when it is absent or not a
    /// single string.
    pub fn required_str(&self, key: &str) -> Result<&str, SchemaError> {
        self.optional_str(key)?
            .ok_or_else(|| SchemaError::MissingParameter {
                key: key.to_owned(),
            })
    }

    pub fn optional_str(&self, key: &str) -> Result<Option<&str>, SchemaError> {
        match self.spec.get(key) {
            None => Ok(None),
            Some(SpecValue::Text(text)) => Ok(Some(text.as_str())),
            Some(_) => Err(SchemaError::ParameterType {
                key: key.to_owned(),
                expected: "string",
            }),
        }
    }

    /// Returns `key` as a list of strings. A single string becomes a one-item
    /// list, numbers are rendered in decimal and an absent key is empty.
    pub fn str_list(&self, key: &str) -> Result<Vec<String>, SchemaError> {
        let type_error = || SchemaError::ParameterType {
            key: key.to_owned(),
            expected: "string or list of strings",
        };
        match self.spec.get(key) {
            None => Ok(Vec::new()),
            Some(SpecValue::Text(text)) => Ok(vec![text.clone()]),
            Some(SpecValue::List(items)) => Ok(items.clone()),
            Some(SpecValue::Structured(Value::Array(items))) => items
                .iter()
                .map(|item| SpecValue::scalar_text(item).ok_or_else(type_error))
                .collect(),
            Some(SpecValue::Structured(value)) => SpecValue::scalar_text(value)
                .map(|text| vec![text])
                .ok_or_else(type_error),
        }
    }

    /// JSON encoding of the spec map, used as a POST body.
    pub fn spec_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.spec)
    }

    /// Stable identifier of the query: SHA-256 over the canonical JSON of
    /// instance and spec. Map keys are ordered, so equal queries hash equally.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(&(&self.instance, &self.spec))?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}
