//! Normalized record shape shared by normalizers, the aggregator and the store.
//!
//! A [`Record`] is a string-keyed JSON object. Values are strings, numbers,
//! booleans, nested records or lists of records. One-to-many relations
//! (`run`, `lumi`, `file`, `block`, `dataset`) are stored as a single-element
//! list of records so that every relation has the same shape regardless of
//! arity; [`Record::wrapped`] builds that shape and [`Record::path`] reads
//! through it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SchemaError;

/// Reserved field holding the backend URL a record was produced from.
pub const PROVENANCE_FIELD: &str = "url";

/// Normalized output unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds a record from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(SchemaError::unexpected_type("record", "object")),
        }
    }

    /// `{key: [inner]}`
    pub fn wrapped(key: impl Into<String>, inner: Record) -> Self {
        let mut record = Self::new();
        record.set_wrapped(key, inner);
        record
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_provenance(self, url: impl Into<String>) -> Self {
        self.with(PROVENANCE_FIELD, url.into())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn set_wrapped(&mut self, key: impl Into<String>, inner: Record) {
        self.0
            .insert(key.into(), Value::Array(vec![Value::Object(inner.0)]));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn provenance(&self) -> Option<&str> {
        self.get(PROVENANCE_FIELD).and_then(Value::as_str)
    }

    /// Moves the value stored under `from` to `to`.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), SchemaError> {
        let value = self
            .0
            .remove(from)
            .ok_or_else(|| SchemaError::missing_field(from))?;
        self.0.insert(to.to_owned(), value);
        Ok(())
    }

    pub fn require(&self, key: &str) -> Result<&Value, SchemaError> {
        self.get(key).ok_or_else(|| SchemaError::missing_field(key))
    }

    pub fn require_str(&self, key: &str) -> Result<&str, SchemaError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| SchemaError::unexpected_type(key, "string"))
    }

    pub fn require_array(&self, key: &str) -> Result<&Vec<Value>, SchemaError> {
        self.require(key)?
            .as_array()
            .ok_or_else(|| SchemaError::unexpected_type(key, "array"))
    }

    /// Looks up a dotted path such as `lumi.number`, descending through nested
    /// records and single-element record lists.
    pub fn path(&self, dotted: &str) -> Option<&Value> {
        let mut segments = dotted.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = descend(current)?.get(segment)?;
        }
        Some(current)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn descend(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) if items.len() == 1 => items[0].as_object(),
        _ => None,
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_reads_through_wrapped_relations() {
        let record = Record::wrapped("lumi", Record::new().with("number", json!([1, 2])))
            .with("run", json!({"run_number": 100}));

        assert_eq!(record.path("lumi.number"), Some(&json!([1, 2])));
        assert_eq!(record.path("run.run_number"), Some(&json!(100)));
        assert_eq!(record.path("run.missing"), None);
    }

    #[test]
    fn path_does_not_guess_inside_multi_element_lists() {
        let record = Record::new().with("file", json!([{"name": "a"}, {"name": "b"}]));

        assert_eq!(record.path("file.name"), None);
    }

    #[test]
    fn rename_of_absent_field_is_a_schema_error() {
        let mut record = Record::new().with("dataset", "/A/B/C");
        record.rename("dataset", "name").expect("field exists");
        assert_eq!(record.get("name"), Some(&json!("/A/B/C")));

        let error = record
            .rename("dataset", "name")
            .expect_err("field was already moved");
        assert_eq!(error, SchemaError::missing_field("dataset"));
    }

    #[test]
    fn require_str_reports_type_mismatch() {
        let record = Record::new().with("block_name", 42);

        let error = record.require_str("block_name").expect_err("not a string");
        assert_eq!(error, SchemaError::unexpected_type("block_name", "string"));
    }

    #[test]
    fn serializes_as_plain_object_with_provenance() {
        let record = Record::wrapped("file", Record::new().with("name", "/store/a.root"))
            .with_provenance("https://cmsweb.test/dbs/x");

        let value = serde_json::to_value(&record).expect("serializable");
        assert_eq!(
            value,
            json!({"file": [{"name": "/store/a.root"}], "url": "https://cmsweb.test/dbs/x"})
        );
        assert_eq!(record.provenance(), Some("https://cmsweb.test/dbs/x"));
    }
}
