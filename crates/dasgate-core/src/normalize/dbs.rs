use serde_json::Value;

use crate::backend::Backend;
use crate::normalize::{parse_json, records_from_array, Normalizer};
use crate::record::Record;
use crate::SchemaError;

/// Dataset bookkeeping service. Payloads are JSON arrays of objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbsNormalizer;

impl Normalizer for DbsNormalizer {
    fn backend(&self) -> Backend {
        Backend::Dbs
    }

    fn normalize(&self, api: &str, payload: &[u8]) -> Result<Vec<Record>, SchemaError> {
        let records = match parse_json(Backend::Dbs, api, payload)? {
            Value::Array(items) => records_from_array(api, items)?,
            _ => return Err(SchemaError::unexpected_type(api, "array of objects")),
        };

        match api {
            "dataset_info" | "datasets" | "datasetlist" => rename_all(records, "dataset", "name"),
            "physicsgroup" => rename_all(records, "physics_group_name", "name"),
            "site4dataset" => records
                .iter()
                .map(|record| {
                    Ok(Record::new()
                        .with("name", record.require("origin_site_name")?.clone())
                        .with("dataset", record.require("dataset")?.clone()))
                })
                .collect(),
            "fileparents" => explode(&records, "parent_logical_file_name", |value| {
                value
                    .as_str()
                    .map(|name| Record::new().with("name", name))
                    .ok_or_else(|| SchemaError::unexpected_type("parent_logical_file_name", "string"))
            }),
            "runs" | "runs_via_dataset" => explode(&records, "run_num", |value| {
                run_number(value).map(|run| Record::new().with("run_number", run))
            }),
            _ => Ok(records),
        }
    }
}

fn rename_all(mut records: Vec<Record>, from: &str, to: &str) -> Result<Vec<Record>, SchemaError> {
    for record in &mut records {
        record.rename(from, to)?;
    }
    Ok(records)
}

/// One output record per element of the array field `field`.
fn explode<F>(records: &[Record], field: &str, convert: F) -> Result<Vec<Record>, SchemaError>
where
    F: Fn(&Value) -> Result<Record, SchemaError>,
{
    let mut out = Vec::new();
    for record in records {
        for value in record.require_array(field)? {
            out.push(convert(value)?);
        }
    }
    Ok(out)
}

fn run_number(value: &Value) -> Result<String, SchemaError> {
    if let Some(run) = value.as_i64() {
        return Ok(run.to_string());
    }
    value
        .as_f64()
        .filter(|run| run.fract() == 0.0)
        .map(|run| format!("{run:.0}"))
        .ok_or_else(|| SchemaError::unexpected_type("run_num", "integer"))
}
