use std::sync::Arc;

use crate::aggregator::{AggregateError, Aggregator};
use crate::backend::Endpoints;
use crate::config::GatewayConfig;
use crate::credential::CredentialManager;
use crate::fetch::{CounterSnapshot, FetchCounters, FetchExecutor, HeaderPolicy};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::normalize::NormalizerRegistry;
use crate::query::Query;
use crate::record::Record;
use crate::scheduler::FetchScheduler;
use crate::store::RecordStore;
use crate::transport::TransportFactory;
use crate::CoreError;

/// Wires configuration into a running [`Gateway`].
///
/// # Examples
///
/// ```rust,ignore
/// use dasgate_core::{GatewayBuilder, GatewayConfig, Query};
///
/// let gateway = GatewayBuilder::new(GatewayConfig::load()?).build()?;
/// let query = Query::default().with_param("dataset", "/A/B/C");
/// let records = gateway.execute(&query, "run_lumi4dataset").await?;
/// ```
pub struct GatewayBuilder {
    config: GatewayConfig,
    http_client: Option<Arc<dyn HttpClient>>,
    credentials: Option<Arc<CredentialManager>>,
    normalizers: Option<NormalizerRegistry>,
    store: Option<Arc<dyn RecordStore>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            http_client: None,
            credentials: None,
            normalizers: None,
            store: None,
        }
    }

    /// Replaces the reqwest transport, typically with a scripted client in tests.
    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_normalizers(mut self, normalizers: NormalizerRegistry) -> Self {
        self.normalizers = Some(normalizers);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the gateway and starts its scheduler.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime and the configuration asks
    /// for a concurrency limit, since the dispatch loop is spawned here.
    pub fn build(self) -> Result<Gateway, CoreError> {
        let config = self.config;
        config.validate()?;

        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(CredentialManager::from_config(&config)));
        let http_client = match self.http_client {
            Some(http_client) => http_client,
            None => {
                let transport = TransportFactory::from_config(&config, credentials.clone());
                Arc::new(ReqwestHttpClient::new(Arc::new(transport))) as Arc<dyn HttpClient>
            }
        };

        let counters = Arc::new(FetchCounters::default());
        let executor = Arc::new(FetchExecutor::new(
            http_client,
            credentials.clone(),
            HeaderPolicy::from_config(&config),
            config.retry(),
            counters.clone(),
        ));
        let scheduler = Arc::new(FetchScheduler::start(executor, config.concurrency_limit));

        let mut aggregator = Aggregator::new(scheduler, Endpoints::new(&config.backend_url));
        if let Some(normalizers) = self.normalizers {
            aggregator = aggregator.with_normalizers(normalizers);
        }
        if let Some(store) = self.store {
            aggregator = aggregator.with_store(store);
        }

        tracing::debug!(
            backend = %config.backend_url,
            credential_mode = credentials.mode_name(),
            concurrency_limit = config.concurrency_limit,
            retries = config.retry_count,
            "gateway ready"
        );

        Ok(Gateway {
            config,
            credentials,
            counters,
            aggregator,
        })
    }
}

/// Owns every piece of process-scoped state: counters, credential cache, DNS
/// cache and the admission semaphore.
pub struct Gateway {
    config: GatewayConfig,
    credentials: Arc<CredentialManager>,
    counters: Arc<FetchCounters>,
    aggregator: Aggregator,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub async fn execute(&self, query: &Query, api: &str) -> Result<Vec<Record>, AggregateError> {
        self.aggregator.execute(query, api).await
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }
}
