//! Relation rows built from `filelumis` records and the run/lumi merge.

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::record::Record;
use crate::SchemaError;

/// Relations a `filelumis` record can be projected onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    File,
    Run,
    Lumi,
    Block,
}

impl Relation {
    const fn field(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Run => "run",
            Self::Lumi => "lumi",
            Self::Block => "block",
        }
    }
}

/// Projects a `filelumis` record onto the requested relations, each wrapped
/// as a single-element list:
/// `{file:[{name}], run:[{run_number}], lumi:[{number}], block:[{name}]}`.
pub fn relation_row(record: &Record, relations: &[Relation]) -> Result<Record, SchemaError> {
    let mut row = Record::new();
    for relation in relations {
        let inner = match relation {
            Relation::File => {
                Record::new().with("name", record.require("logical_file_name")?.clone())
            }
            Relation::Run => Record::new().with("run_number", record.require("run_num")?.clone()),
            Relation::Lumi => {
                Record::new().with("number", record.require("lumi_section_num")?.clone())
            }
            Relation::Block => {
                let url = record
                    .provenance()
                    .ok_or_else(|| SchemaError::missing_field(crate::record::PROVENANCE_FIELD))?;
                Record::new().with("name", block_from_url(url)?)
            }
        };
        row.set_wrapped(relation.field(), inner);
    }
    Ok(row)
}

/// Block name carried in the `block_name=` argument of a planned URL.
pub fn block_from_url(url: &str) -> Result<String, SchemaError> {
    let value = url
        .split_once("block_name=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
        .ok_or_else(|| SchemaError::invalid_value("url", url, "no block_name argument"))?;
    urlencoding::decode(value)
        .map(|block| block.into_owned())
        .map_err(|e| SchemaError::invalid_value("block_name", value, e.to_string()))
}

/// Identity of a run or lumi number: `100`, `100.0` and `"100"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NumberKey {
    Integer(i128),
    Float(u64),
    Other(String),
}

impl NumberKey {
    fn of(value: &Value) -> Self {
        let number = match value {
            Value::Number(number) => Some(number.clone()),
            Value::String(text) => text.trim().parse::<serde_json::Number>().ok(),
            _ => None,
        };
        let Some(number) = number else {
            return Self::Other(value.to_string());
        };
        if let Some(int) = number.as_i64() {
            return Self::Integer(i128::from(int));
        }
        if let Some(int) = number.as_u64() {
            return Self::Integer(i128::from(int));
        }
        match number.as_f64() {
            Some(float) if float.fract() == 0.0 && float.abs() < 1e18 => {
                Self::Integer(float as i128)
            }
            Some(float) => Self::Float(float.to_bits()),
            None => Self::Other(number.to_string()),
        }
    }
}

/// Groups rows by `run.run_number` and unions their `lumi.number` values.
///
/// Runs appear in first-seen order; lumis keep their order of appearance and
/// duplicates are dropped, numerically equal values counting as duplicates.
/// The first-seen spelling of each run and lumi is kept. Output records are
/// `{run: {run_number}, lumi: {number: [...]}}`. Merging an already merged set
/// yields the same set.
pub fn order_by_run_lumis(rows: &[Record]) -> Result<Vec<Record>, SchemaError> {
    let mut runs: IndexMap<NumberKey, (Value, IndexMap<NumberKey, Value>)> = IndexMap::new();
    for row in rows {
        let run = row
            .path("run.run_number")
            .ok_or_else(|| SchemaError::missing_field("run.run_number"))?;
        let lumis = row
            .path("lumi.number")
            .ok_or_else(|| SchemaError::missing_field("lumi.number"))?;

        let (_, merged) = runs
            .entry(NumberKey::of(run))
            .or_insert_with(|| (run.clone(), IndexMap::new()));
        for lumi in lumi_values(lumis)? {
            merged
                .entry(NumberKey::of(lumi))
                .or_insert_with(|| lumi.clone());
        }
    }

    Ok(runs
        .into_values()
        .map(|(run, lumis)| {
            let lumis: Vec<Value> = lumis.into_values().collect();
            Record::new()
                .with("run", json!({ "run_number": run }))
                .with("lumi", json!({ "number": lumis }))
        })
        .collect())
}

/// A lumi field holds either one number or a list of numbers.
pub fn lumi_values(value: &Value) -> Result<Vec<&Value>, SchemaError> {
    let values: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    if values.iter().all(|value| value.is_number()) {
        Ok(values)
    } else {
        Err(SchemaError::unexpected_type("lumi.number", "number or list of numbers"))
    }
}

/// Keeps the `file` relation of every row whose lumi numbers contain `lumi`.
pub fn files_with_lumi(rows: &[Record], lumi: f64) -> Result<Vec<Record>, SchemaError> {
    let mut out = Vec::new();
    for row in rows {
        let lumis = row
            .path("lumi.number")
            .ok_or_else(|| SchemaError::missing_field("lumi.number"))?;
        let matched = lumi_values(lumis)?
            .into_iter()
            .any(|value| value.as_f64() == Some(lumi));
        if matched {
            let file = row.require("file")?.clone();
            out.push(Record::new().with("file", file));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filelumi(file: &str, run: u64, lumis: Value) -> Record {
        Record::new()
            .with("logical_file_name", file)
            .with("run_num", run)
            .with("lumi_section_num", lumis)
    }

    #[test]
    fn relation_row_wraps_each_relation() {
        let record = filelumi("/store/a.root", 100, json!([1, 2]))
            .with_provenance("https://h/dbs/x/DBSReader/filelumis?block_name=%2FA%2FB%2FC%23abc&run_num=100");

        let row = relation_row(&record, &[Relation::Block, Relation::File, Relation::Lumi])
            .expect("complete record");

        assert_eq!(
            row.into_value(),
            json!({
                "block": [{"name": "/A/B/C#abc"}],
                "file": [{"name": "/store/a.root"}],
                "lumi": [{"number": [1, 2]}],
            })
        );
    }

    #[test]
    fn relation_row_requires_source_fields() {
        let record = Record::new().with("run_num", 1);

        let error = relation_row(&record, &[Relation::Run, Relation::Lumi]).expect_err("no lumi");
        assert_eq!(error, SchemaError::missing_field("lumi_section_num"));
    }

    #[test]
    fn merge_groups_by_run_in_first_seen_order() {
        let rows: Vec<Record> = [
            filelumi("a", 200, json!(5)),
            filelumi("b", 100, json!([1, 2])),
            filelumi("c", 200, json!([3, 5])),
            filelumi("d", 100, json!(1)),
        ]
        .iter()
        .map(|record| relation_row(record, &[Relation::Run, Relation::Lumi]).expect("row"))
        .collect();

        let merged = order_by_run_lumis(&rows).expect("merge");

        let merged: Vec<Value> = merged.into_iter().map(Record::into_value).collect();
        assert_eq!(
            merged,
            vec![
                json!({"run": {"run_number": 200}, "lumi": {"number": [5, 3]}}),
                json!({"run": {"run_number": 100}, "lumi": {"number": [1, 2]}}),
            ]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let rows: Vec<Record> = [filelumi("a", 1, json!([4, 2])), filelumi("b", 1, json!(4))]
            .iter()
            .map(|record| relation_row(record, &[Relation::Run, Relation::Lumi]).expect("row"))
            .collect();

        let once = order_by_run_lumis(&rows).expect("merge");
        let twice = order_by_run_lumis(&once).expect("merge again");

        assert_eq!(once, twice);
    }

    #[test]
    fn numerically_equal_runs_and_lumis_merge() {
        let rows = vec![
            Record::new()
                .with("run", json!({"run_number": 100}))
                .with("lumi", json!({"number": [1, 2]})),
            Record::new()
                .with("run", json!({"run_number": 100.0}))
                .with("lumi", json!({"number": [2.0, 3]})),
            Record::new()
                .with("run", json!({"run_number": "100"}))
                .with("lumi", json!({"number": 1})),
        ];

        let merged: Vec<Value> = order_by_run_lumis(&rows)
            .expect("merge")
            .into_iter()
            .map(Record::into_value)
            .collect();

        assert_eq!(
            merged,
            vec![json!({"run": {"run_number": 100}, "lumi": {"number": [1, 2, 3]}})]
        );
    }

    #[test]
    fn large_lumi_lists_are_deduplicated_in_order() {
        let lumis: Vec<u64> = (0..5_000).chain((0..5_000).rev()).collect();
        let row = Record::new()
            .with("run", json!({"run_number": 7}))
            .with("lumi", json!({"number": lumis}));

        let merged = order_by_run_lumis(&[row]).expect("merge");

        let expected: Vec<u64> = (0..5_000).collect();
        assert_eq!(
            merged[0].clone().into_value(),
            json!({"run": {"run_number": 7}, "lumi": {"number": expected}})
        );
    }

    #[test]
    fn non_numeric_lumis_are_rejected() {
        let row = Record::new()
            .with("run", json!({"run_number": 1}))
            .with("lumi", json!({"number": ["x"]}));

        assert!(order_by_run_lumis(&[row]).is_err());
    }

    #[test]
    fn files_with_lumi_filters_element_wise() {
        let rows: Vec<Record> = [
            filelumi("/store/a.root", 1, json!([1, 2, 3])),
            filelumi("/store/b.root", 1, json!([4])),
            filelumi("/store/c.root", 1, json!(2)),
        ]
        .iter()
        .map(|record| relation_row(record, &[Relation::File, Relation::Lumi]).expect("row"))
        .collect();

        let files = files_with_lumi(&rows, 2.0).expect("filter");

        let names: Vec<Option<&Value>> = files.iter().map(|f| f.path("file.name")).collect();
        assert_eq!(names, vec![Some(&json!("/store/a.root")), Some(&json!("/store/c.root"))]);
    }

    #[test]
    fn block_name_is_decoded_from_url() {
        assert_eq!(
            block_from_url("https://h/filelumis?block_name=%2FA%2FB%2FC%23x&validFileOnly=1"),
            Ok(String::from("/A/B/C#x"))
        );
        assert!(block_from_url("https://h/filelumis?dataset=/A/B/C").is_err());
    }
}
