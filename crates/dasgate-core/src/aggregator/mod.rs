//! Query execution: plan → fan-out → fan-in → normalize → merge.
//!
//! [`Aggregator::execute`] dispatches a logical API name to its handler. Each
//! handler plans backend URLs from the query spec (sometimes with a synchronous
//! discovery call first), submits them to the [`FetchScheduler`], joins every
//! response, normalizes the payloads and merges the result. Any fetch or schema
//! failure fails the whole call; there are no partial results.

mod merge;
mod plan;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use merge::{block_from_url, files_with_lumi, lumi_values, order_by_run_lumis, relation_row, Relation};
pub use plan::{phedex_node, run_args, unix_time, valid_files_only};

use crate::backend::{Backend, Endpoints};
use crate::fetch::{encode_fragment_marker, FetchError, FetchErrorKind, FetchResponse};
use crate::normalize::NormalizerRegistry;
use crate::query::Query;
use crate::record::Record;
use crate::scheduler::{FetchRequest, FetchScheduler};
use crate::store::{RecordStore, StoreKey};
use crate::SchemaError;

/// Logical APIs answered by combining backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalApi {
    Dataset4Block,
    RunLumi4Dataset,
    RunLumi4Block,
    FileLumi4Dataset,
    FileLumi4Block,
    FileRunLumi4Dataset,
    FileRunLumi4Block,
    BlockRunLumi4Dataset,
    File4DatasetRunLumi,
    Blocks4TierDates,
    Lumi4BlockRun,
    DatasetList,
    Dataset4SiteRelease,
}

impl LogicalApi {
    pub const ALL: [Self; 13] = [
        Self::Dataset4Block,
        Self::RunLumi4Dataset,
        Self::RunLumi4Block,
        Self::FileLumi4Dataset,
        Self::FileLumi4Block,
        Self::FileRunLumi4Dataset,
        Self::FileRunLumi4Block,
        Self::BlockRunLumi4Dataset,
        Self::File4DatasetRunLumi,
        Self::Blocks4TierDates,
        Self::Lumi4BlockRun,
        Self::DatasetList,
        Self::Dataset4SiteRelease,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dataset4Block => "dataset4block",
            Self::RunLumi4Dataset => "run_lumi4dataset",
            Self::RunLumi4Block => "run_lumi4block",
            Self::FileLumi4Dataset => "file_lumi4dataset",
            Self::FileLumi4Block => "file_lumi4block",
            Self::FileRunLumi4Dataset => "file_run_lumi4dataset",
            Self::FileRunLumi4Block => "file_run_lumi4block",
            Self::BlockRunLumi4Dataset => "block_run_lumi4dataset",
            Self::File4DatasetRunLumi => "file4dataset_run_lumi",
            Self::Blocks4TierDates => "blocks4tier_dates",
            Self::Lumi4BlockRun => "lumi4block_run",
            Self::DatasetList => "datasetlist",
            Self::Dataset4SiteRelease => "dataset4site_release",
        }
    }

    /// Spec parameters the handler reads.
    pub const fn parameters(self) -> &'static [&'static str] {
        match self {
            Self::Dataset4Block => &["block"],
            Self::RunLumi4Dataset
            | Self::FileLumi4Dataset
            | Self::FileRunLumi4Dataset
            | Self::BlockRunLumi4Dataset => &["dataset", "run?", "status?"],
            Self::RunLumi4Block | Self::FileLumi4Block | Self::FileRunLumi4Block => {
                &["block", "run?", "status?"]
            }
            Self::File4DatasetRunLumi => &["dataset|block", "run", "lumi", "status?"],
            Self::Blocks4TierDates => &["tier", "date"],
            Self::Lumi4BlockRun => &["block", "run", "status?"],
            Self::DatasetList => &["dataset", "..."],
            Self::Dataset4SiteRelease => &["site", "release", "parent?", "status?"],
        }
    }
}

impl Display for LogicalApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalApi {
    type Err = AggregateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|api| api.as_str() == value)
            .ok_or_else(|| AggregateError::UnknownApi(value.to_owned()))
    }
}

/// Stage an aggregation call is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationPhase {
    Planning,
    FanOut,
    Joining,
    Normalizing,
    Merged,
    Failed,
}

impl AggregationPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::FanOut => "fan_out",
            Self::Joining => "joining",
            Self::Normalizing => "normalizing",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }
}

impl Display for AggregationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("unknown logical api '{0}'")]
    UnknownApi(String),

    #[error("invalid query: {0}")]
    Query(#[source] SchemaError),

    #[error("fetch of {url} failed: {source}")]
    Fetch {
        phase: AggregationPhase,
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("unexpected {system} payload for api '{api}': {source}")]
    Schema {
        phase: AggregationPhase,
        system: Backend,
        api: String,
        #[source]
        source: SchemaError,
    },

    #[error("fan-in closed with {outstanding} response(s) outstanding")]
    Incomplete { outstanding: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AggregateError {
    pub(crate) fn schema(
        phase: AggregationPhase,
        system: Backend,
        api: &str,
        source: SchemaError,
    ) -> Self {
        Self::Schema {
            phase,
            system,
            api: api.to_owned(),
            source,
        }
    }

    /// Phase the call was in when it failed.
    pub const fn phase(&self) -> AggregationPhase {
        match self {
            Self::UnknownApi(_) | Self::Query(_) | Self::Serialization(_) => {
                AggregationPhase::Planning
            }
            Self::Fetch { phase, .. } | Self::Schema { phase, .. } => *phase,
            Self::Incomplete { .. } => AggregationPhase::Joining,
        }
    }

    /// True when a fetch failed because no usable credential was available.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Self::Fetch { source, .. } if source.kind() == FetchErrorKind::Credential)
    }
}

pub struct Aggregator {
    scheduler: Arc<FetchScheduler>,
    normalizers: NormalizerRegistry,
    endpoints: Endpoints,
    store: Option<Arc<dyn RecordStore>>,
}

impl Aggregator {
    pub fn new(scheduler: Arc<FetchScheduler>, endpoints: Endpoints) -> Self {
        Self {
            scheduler,
            normalizers: NormalizerRegistry::default(),
            endpoints,
            store: None,
        }
    }

    pub fn with_normalizers(mut self, normalizers: NormalizerRegistry) -> Self {
        self.normalizers = normalizers;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn scheduler(&self) -> &Arc<FetchScheduler> {
        &self.scheduler
    }

    /// Runs the logical API `api` for `query` and returns the merged records.
    pub async fn execute(&self, query: &Query, api: &str) -> Result<Vec<Record>, AggregateError> {
        let api = api.parse::<LogicalApi>()?;
        self.execute_api(query, api).await
    }

    pub async fn execute_api(
        &self,
        query: &Query,
        api: LogicalApi,
    ) -> Result<Vec<Record>, AggregateError> {
        let span = info_span!(
            "execute",
            api = api.as_str(),
            instance = %query.instance,
            request_id = %Uuid::new_v4(),
        );

        async move {
            let started = Instant::now();
            debug!(phase = %AggregationPhase::Planning, "aggregation started");
            let result = self.dispatch(query, api).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(records) => {
                    info!(
                        phase = %AggregationPhase::Merged,
                        records = records.len(),
                        elapsed_ms,
                        "aggregation complete"
                    );
                    self.persist(query, api, records).await;
                }
                Err(error) => warn!(
                    phase = %AggregationPhase::Failed,
                    failed_in = %error.phase(),
                    %error,
                    elapsed_ms,
                    "aggregation failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, query: &Query, api: LogicalApi) -> Result<Vec<Record>, AggregateError> {
        use Relation::{Block, File, Lumi, Run};

        match api {
            LogicalApi::Dataset4Block => dataset4block(query),
            LogicalApi::RunLumi4Dataset | LogicalApi::RunLumi4Block => {
                let rows = self.file_run_lumi(query, &[Run, Lumi]).await?;
                merge_run_lumis(&rows)
            }
            LogicalApi::FileLumi4Dataset | LogicalApi::FileLumi4Block => {
                self.file_run_lumi(query, &[File, Lumi]).await
            }
            LogicalApi::FileRunLumi4Dataset | LogicalApi::FileRunLumi4Block => {
                self.file_run_lumi(query, &[File, Run, Lumi]).await
            }
            LogicalApi::BlockRunLumi4Dataset => self.file_run_lumi(query, &[Block, Run, Lumi]).await,
            LogicalApi::Lumi4BlockRun => self.file_run_lumi(query, &[Lumi]).await,
            LogicalApi::File4DatasetRunLumi => self.file4dataset_run_lumi(query).await,
            LogicalApi::Blocks4TierDates => self.blocks4tier_dates(query).await,
            LogicalApi::DatasetList => self.datasetlist(query).await,
            LogicalApi::Dataset4SiteRelease => self.dataset4site_release(query).await,
        }
    }

    async fn persist(&self, query: &Query, api: LogicalApi, records: &[Record]) {
        let Some(store) = &self.store else {
            return;
        };
        let fingerprint = match query.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(error) => {
                warn!(%error, "unable to fingerprint query; result not stored");
                return;
            }
        };
        let key = StoreKey::new(fingerprint, api.as_str());
        if let Err(error) = store.store(key, records).await {
            warn!(%error, "record store rejected result");
        }
    }

    /// `filelumis` for every planned block, projected onto `relations`.
    async fn file_run_lumi(
        &self,
        query: &Query,
        relations: &[Relation],
    ) -> Result<Vec<Record>, AggregateError> {
        const API: &str = "filelumis";

        let urls = self.dbs_urls(query, API).await?;
        let records = self.process_urls(Backend::Dbs, API, urls).await?;
        records
            .iter()
            .map(|record| relation_row(record, relations))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| {
                AggregateError::schema(AggregationPhase::Normalizing, Backend::Dbs, API, source)
            })
    }

    async fn file4dataset_run_lumi(&self, query: &Query) -> Result<Vec<Record>, AggregateError> {
        let lumi = query.required_str("lumi").map_err(AggregateError::Query)?;
        let lumi: f64 = lumi.trim().parse().map_err(|_| {
            AggregateError::Query(SchemaError::invalid_value("lumi", lumi, "not a number"))
        })?;

        let rows = self
            .file_run_lumi(query, &[Relation::File, Relation::Lumi])
            .await?;
        files_with_lumi(&rows, lumi).map_err(|source| {
            AggregateError::schema(AggregationPhase::Normalizing, Backend::Dbs, "filelumis", source)
        })
    }

    async fn blocks4tier_dates(&self, query: &Query) -> Result<Vec<Record>, AggregateError> {
        const API: &str = "blocks";

        let tier = query.required_str("tier").map_err(AggregateError::Query)?;
        let dates = query.str_list("date").map_err(AggregateError::Query)?;
        let [min_date, max_date] = dates.as_slice() else {
            return Err(AggregateError::Query(SchemaError::invalid_value(
                "date",
                dates.join(","),
                "expected exactly two YYYYMMDD dates",
            )));
        };
        let min_cdate = unix_time(min_date).map_err(AggregateError::Query)?;
        let max_cdate = unix_time(max_date).map_err(AggregateError::Query)?;

        let url = format!(
            "{}/{API}?data_tier_name={tier}&min_cdate={min_cdate}&max_cdate={max_cdate}",
            self.endpoints.dbs(&query.instance)
        );
        let records = self.fetch_records(Backend::Dbs, API, &url, None).await?;

        let schema = |source| AggregateError::schema(AggregationPhase::Normalizing, Backend::Dbs, API, source);
        let mut blocks: Vec<String> = Vec::new();
        for record in &records {
            let block = record.require_str("block_name").map_err(schema)?;
            let dataset = block.split('#').next().unwrap_or(block);
            let block_tier = dataset.split('/').nth(3).ok_or_else(|| {
                schema(SchemaError::invalid_value(
                    "block_name",
                    block,
                    "dataset path has no tier component",
                ))
            })?;
            if block_tier == tier && !blocks.iter().any(|known| known == block) {
                blocks.push(block.to_owned());
            }
        }

        Ok(blocks
            .into_iter()
            .map(|name| Record::wrapped("block", Record::new().with("name", name)))
            .collect())
    }

    async fn datasetlist(&self, query: &Query) -> Result<Vec<Record>, AggregateError> {
        let url = format!("{}/datasetlist", self.endpoints.dbs(&query.instance));
        let body = query.spec_json()?;
        self.fetch_records(Backend::Dbs, "datasetlist", &url, Some(&body))
            .await
    }

    async fn dataset4site_release(&self, query: &Query) -> Result<Vec<Record>, AggregateError> {
        const API: &str = "blockReplicas";

        let site = query.required_str("site").map_err(AggregateError::Query)?;
        let node = phedex_node(site).map_err(AggregateError::Query)?;

        let mut urls: Vec<String> = Vec::new();
        for dataset in self.dataset4release(query).await? {
            let url = format!("{}/{API}?dataset={dataset}&{node}", self.endpoints.phedex());
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        let replicas = self.process_urls(Backend::Phedex, API, urls).await?;
        let mut datasets: Vec<String> = Vec::new();
        for replica in &replicas {
            let block = replica.require_str("name").map_err(|source| {
                AggregateError::schema(AggregationPhase::Normalizing, Backend::Phedex, API, source)
            })?;
            let dataset = block.split('#').next().unwrap_or(block);
            if !datasets.iter().any(|known| known == dataset) {
                datasets.push(dataset.to_owned());
            }
        }

        Ok(datasets
            .into_iter()
            .map(|name| Record::wrapped("dataset", Record::new().with("name", name)))
            .collect())
    }

    /// Single synchronous fetch used while planning.
    async fn fetch_records(
        &self,
        system: Backend,
        api: &str,
        url: &str,
        body: Option<&str>,
    ) -> Result<Vec<Record>, AggregateError> {
        let response = self.scheduler.executor().fetch(url, body).await;
        self.normalize_response(system, api, AggregationPhase::Planning, response)
    }

    /// Submits every URL to the scheduler and joins all responses. Records are
    /// returned in arrival order, each tagged with its source URL.
    async fn process_urls(
        &self,
        system: Backend,
        api: &str,
        urls: Vec<String>,
    ) -> Result<Vec<Record>, AggregateError> {
        let (reply, mut responses) = mpsc::unbounded_channel();
        let mut outstanding: HashMap<String, usize> = HashMap::new();

        debug!(phase = %AggregationPhase::FanOut, %system, api, urls = urls.len(), "submitting fetches");
        for url in urls {
            *outstanding.entry(encode_fragment_marker(&url)).or_default() += 1;
            self.scheduler.submit(FetchRequest::get(url, reply.clone()));
        }
        drop(reply);

        let mut records = Vec::new();
        while !outstanding.is_empty() {
            let Some(response) = responses.recv().await else {
                return Err(AggregateError::Incomplete {
                    outstanding: outstanding.values().sum(),
                });
            };
            settle(&mut outstanding, &response.url);
            records.extend(self.normalize_response(system, api, AggregationPhase::Joining, response)?);
        }
        Ok(records)
    }

    fn normalize_response(
        &self,
        system: Backend,
        api: &str,
        phase: AggregationPhase,
        response: FetchResponse,
    ) -> Result<Vec<Record>, AggregateError> {
        let FetchResponse { url, data, .. } = response;
        let payload = data.map_err(|source| AggregateError::Fetch {
            phase,
            url: url.clone(),
            source,
        })?;
        let phase = match phase {
            AggregationPhase::Joining => AggregationPhase::Normalizing,
            other => other,
        };
        let records = self
            .normalizers
            .normalize(system, api, &payload)
            .map_err(|source| AggregateError::schema(phase, system, api, source))?;
        Ok(records
            .into_iter()
            .map(|record| record.with_provenance(url.as_str()))
            .collect())
    }
}

fn settle(outstanding: &mut HashMap<String, usize>, url: &str) {
    match outstanding.get_mut(url) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            outstanding.remove(url);
        }
        None => debug!(url, "response for an url that was not submitted"),
    }
}

fn dataset4block(query: &Query) -> Result<Vec<Record>, AggregateError> {
    let block = query.required_str("block").map_err(AggregateError::Query)?;
    let dataset = block.split('#').next().unwrap_or(block);
    Ok(vec![Record::wrapped(
        "dataset",
        Record::new().with("name", dataset),
    )])
}

fn merge_run_lumis(rows: &[Record]) -> Result<Vec<Record>, AggregateError> {
    order_by_run_lumis(rows).map_err(|source| {
        AggregateError::schema(AggregationPhase::Normalizing, Backend::Dbs, "filelumis", source)
    })
}
