//! URL planning: block discovery, per-block URL construction and the small
//! spec-to-argument translations the handlers share.

use std::sync::LazyLock;

use regex::Regex;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time};

use crate::aggregator::{AggregateError, AggregationPhase, Aggregator};
use crate::backend::Backend;
use crate::query::Query;
use crate::SchemaError;

static PHEDEX_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^T[0-9]_[A-Z]+(_)[A-Z]+").expect("node pattern compiles"));
static STORAGE_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+(\.)[a-z]+(\.)").expect("se pattern compiles"));

impl Aggregator {
    /// Blocks named by the spec: the `block` parameter itself, or every block
    /// of `dataset` as reported by the bookkeeping service.
    pub(crate) async fn find_blocks(&self, query: &Query) -> Result<Vec<String>, AggregateError> {
        if let Some(block) = query.optional_str("block").map_err(AggregateError::Query)? {
            return Ok(vec![block.to_owned()]);
        }

        let dataset = query.required_str("dataset").map_err(AggregateError::Query)?;
        let url = format!(
            "{}/blocks?dataset={}",
            self.endpoints.dbs(&query.instance),
            dataset
        );
        let records = self.fetch_records(Backend::Dbs, "blocks", &url, None).await?;
        records
            .iter()
            .map(|record| record.require_str("block_name").map(str::to_owned))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| AggregateError::schema(AggregationPhase::Planning, Backend::Dbs, "blocks", source))
    }

    /// One `{dbs}/{api}?block_name=...` URL per block, with run and validity
    /// filters appended. Duplicates are dropped, order is kept.
    pub(crate) async fn dbs_urls(&self, query: &Query, api: &str) -> Result<Vec<String>, AggregateError> {
        let runs = run_args(query).map_err(AggregateError::Query)?;
        let valid_only = valid_files_only(query).map_err(AggregateError::Query)?;
        let base = self.endpoints.dbs(&query.instance);

        let mut urls = Vec::new();
        for block in self.find_blocks(query).await? {
            let mut url = format!("{base}/{api}?block_name={}{runs}", urlencoding::encode(&block));
            if valid_only {
                url.push_str("&validFileOnly=1");
            }
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }

    /// Dataset names built with `release` (optionally narrowed by `parent` and
    /// `status`).
    pub(crate) async fn dataset4release(&self, query: &Query) -> Result<Vec<String>, AggregateError> {
        let release = query.required_str("release").map_err(AggregateError::Query)?;
        let mut url = format!(
            "{}/datasets?release_version={}",
            self.endpoints.dbs(&query.instance),
            release
        );
        if let Some(parent) = query.optional_str("parent").map_err(AggregateError::Query)? {
            url.push_str(&format!("&parent_dataset={parent}"));
        }
        if let Some(status) = query.optional_str("status").map_err(AggregateError::Query)? {
            url.push_str(&format!("&dataset_access_type={status}"));
        }

        let records = self.fetch_records(Backend::Dbs, "datasets", &url, None).await?;
        let mut datasets: Vec<String> = Vec::new();
        for record in &records {
            let name = record.require_str("name").map_err(|source| {
                AggregateError::schema(AggregationPhase::Planning, Backend::Dbs, "datasets", source)
            })?;
            if !datasets.iter().any(|known| known == name) {
                datasets.push(name.to_owned());
            }
        }
        Ok(datasets)
    }
}

/// `&run_num=<r>` for every run in the spec.
pub fn run_args(query: &Query) -> Result<String, SchemaError> {
    Ok(query
        .str_list("run")?
        .iter()
        .map(|run| format!("&run_num={run}"))
        .collect())
}

/// Whether the spec asks for valid files only (`status=valid`).
pub fn valid_files_only(query: &Query) -> Result<bool, SchemaError> {
    Ok(query
        .optional_str("status")?
        .is_some_and(|status| status.eq_ignore_ascii_case("valid")))
}

/// PhEDEx query argument for a site: `node=<site>*` for node names,
/// `se=<site>` for storage element host names. Values are percent-encoded.
pub fn phedex_node(site: &str) -> Result<String, SchemaError> {
    if PHEDEX_NODE.is_match(site) {
        let node = if site.ends_with('*') {
            site.to_owned()
        } else {
            format!("{site}*")
        };
        Ok(format!("node={}", urlencoding::encode(&node)))
    } else if STORAGE_ELEMENT.is_match(site) {
        Ok(format!("se={}", urlencoding::encode(site)))
    } else {
        Err(SchemaError::invalid_value(
            "site",
            site,
            "not a node name or storage element",
        ))
    }
}

/// Unix seconds at 00:00 UTC of a `YYYYMMDD` date.
pub fn unix_time(date: &str) -> Result<i64, SchemaError> {
    let format = format_description!("[year][month][day]");
    let day = Date::parse(date, &format)
        .map_err(|e| SchemaError::invalid_value("date", date, e.to_string()))?;
    Ok(PrimitiveDateTime::new(day, Time::MIDNIGHT)
        .assume_utc()
        .unix_timestamp())
}
