//! Shared fixtures for the behavior tests: a scripted HTTP transport and
//! gateway construction helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dasgate_core::{
    CredentialManager, FetchCounters, FetchExecutor, Gateway, GatewayBuilder, GatewayConfig,
    HeaderPolicy, HttpClient, HttpError, HttpRequest, HttpResponse,
};
use flate2::write::GzEncoder;
use flate2::Compression;

pub const BACKEND: &str = "https://cmsweb.test";

type Scripted = Result<HttpResponse, HttpError>;

struct Route {
    needle: String,
    script: VecDeque<Scripted>,
    fallback: Scripted,
}

/// HTTP client answering from per-URL scripts. The first route whose needle
/// is contained in the request URL answers; its scripted responses are used
/// in order and the last one repeats.
#[derive(Default)]
pub struct ScriptedHttpClient {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn route(self, needle: &str, responses: Vec<Scripted>) -> Self {
        let fallback = responses
            .last()
            .cloned()
            .expect("a route needs at least one scripted response");
        let script: VecDeque<Scripted> = responses.into();
        self.routes
            .lock()
            .expect("routes lock")
            .push(Route {
                needle: needle.to_owned(),
                script,
                fallback,
            });
        self
    }

    pub fn route_json(self, needle: &str, body: &str) -> Self {
        self.route(needle, vec![Ok(HttpResponse::ok(body.as_bytes().to_vec()))])
    }

    pub fn route_gzip_json(self, needle: &str, body: &str) -> Self {
        let response = HttpResponse::ok(gzip(body)).with_header("content-encoding", "gzip");
        self.route(needle, vec![Ok(response)])
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_to(&self, needle: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url.contains(needle))
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, url: &str) -> Scripted {
        let mut routes = self.routes.lock().expect("routes lock");
        match routes.iter_mut().find(|route| url.contains(&route.needle)) {
            Some(route) => route
                .script
                .pop_front()
                .unwrap_or_else(|| route.fallback.clone()),
            None => Err(HttpError::non_retryable(format!("no scripted route for {url}"))),
        }
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let answer = self.answer(&request.url);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            answer
        })
    }
}

pub fn gzip(body: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).expect("compress");
    encoder.finish().expect("finish gzip stream")
}

/// Fast retries against the scripted backend.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        retry_count: 2,
        retry_unit_ms: 1,
        backend_url: String::from(BACKEND),
        ..GatewayConfig::default()
    }
}

/// Builder wired to `client` with anonymous credentials.
pub fn builder(client: Arc<ScriptedHttpClient>, config: GatewayConfig) -> GatewayBuilder {
    GatewayBuilder::new(config)
        .with_http_client(client)
        .with_credentials(Arc::new(CredentialManager::anonymous()))
}

pub fn gateway(client: Arc<ScriptedHttpClient>, config: GatewayConfig) -> Gateway {
    builder(client, config).build().expect("test gateway builds")
}

pub fn executor(client: Arc<ScriptedHttpClient>, config: &GatewayConfig) -> Arc<FetchExecutor> {
    Arc::new(FetchExecutor::new(
        client,
        Arc::new(CredentialManager::anonymous()),
        HeaderPolicy::from_config(config),
        config.retry(),
        Arc::new(FetchCounters::default()),
    ))
}

pub fn dbs(path: &str) -> String {
    format!("{BACKEND}/dbs/prod/global/DBSReader/{path}")
}
