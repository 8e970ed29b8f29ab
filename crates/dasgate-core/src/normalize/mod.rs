//! Reshape raw backend payloads into [`Record`]s.
//!
//! Each backend family has one [`Normalizer`]. Normalizers only reshape; the
//! aggregator attaches provenance and performs any joins.

mod dbs;
mod phedex;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

pub use dbs::DbsNormalizer;
pub use phedex::PhedexNormalizer;

use crate::backend::Backend;
use crate::record::Record;
use crate::SchemaError;

pub trait Normalizer: Send + Sync {
    fn backend(&self) -> Backend;

    fn normalize(&self, api: &str, payload: &[u8]) -> Result<Vec<Record>, SchemaError>;
}

/// Normalizers keyed by the backend they handle.
#[derive(Clone)]
pub struct NormalizerRegistry {
    normalizers: HashMap<Backend, Arc<dyn Normalizer>>,
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        let normalizers: Vec<Arc<dyn Normalizer>> =
            vec![Arc::new(DbsNormalizer), Arc::new(PhedexNormalizer)];
        Self::new(normalizers)
    }
}

impl NormalizerRegistry {
    pub fn new(normalizers: Vec<Arc<dyn Normalizer>>) -> Self {
        Self {
            normalizers: normalizers
                .into_iter()
                .map(|normalizer| (normalizer.backend(), normalizer))
                .collect(),
        }
    }

    pub fn with(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizers.insert(normalizer.backend(), normalizer);
        self
    }

    pub fn get(&self, backend: Backend) -> Result<&dyn Normalizer, SchemaError> {
        self.normalizers
            .get(&backend)
            .map(|normalizer| normalizer.as_ref())
            .ok_or(SchemaError::NoNormalizer {
                system: backend.as_str(),
            })
    }

    pub fn normalize(
        &self,
        backend: Backend,
        api: &str,
        payload: &[u8],
    ) -> Result<Vec<Record>, SchemaError> {
        self.get(backend)?.normalize(api, payload)
    }

    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.normalizers.keys().copied().collect();
        backends.sort_by_key(|backend| backend.as_str());
        backends
    }
}

pub(crate) fn parse_json(system: Backend, api: &str, payload: &[u8]) -> Result<Value, SchemaError> {
    serde_json::from_slice(payload).map_err(|e| SchemaError::InvalidPayload {
        system: system.as_str(),
        api: api.to_owned(),
        message: e.to_string(),
    })
}

/// Converts a JSON array of objects into records.
pub(crate) fn records_from_array(field: &str, items: Vec<Value>) -> Result<Vec<Record>, SchemaError> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(Record::from(map)),
            _ => Err(SchemaError::unexpected_type(field, "array of objects")),
        })
        .collect()
}
