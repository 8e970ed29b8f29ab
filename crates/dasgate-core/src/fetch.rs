//! Single-URL fetch with retry, header policy and content decoding.
//!
//! [`FetchExecutor::fetch`] never fails as a call: every outcome, including an
//! invalid URL or an exhausted retry budget, is reported inside the returned
//! [`FetchResponse`].

use std::fmt::{Display, Formatter};
use std::io::Read;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::credential::CredentialManager;
use crate::http_client::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use crate::retry::RetryConfig;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https|http)://[-A-Za-z0-9_+&@#/%?=~_|!:,.;]*$").expect("url pattern compiles")
});

/// Replaces literal `#` with `%23` so block names survive as query values.
pub fn encode_fragment_marker(url: &str) -> String {
    url.replace('#', "%23")
}

pub fn is_valid_url(url: &str) -> bool {
    URL_PATTERN.is_match(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    InvalidUrl,
    Transport,
    Decode,
    Credential,
}

impl FetchErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Credential => "credential",
        }
    }
}

impl Display for FetchErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
    retryable: bool,
}

impl FetchError {
    pub fn invalid_url(url: &str) -> Self {
        Self {
            kind: FetchErrorKind::InvalidUrl,
            message: format!("invalid url '{url}'"),
            retryable: false,
        }
    }

    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: FetchErrorKind::Transport,
            message: message.into(),
            retryable,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Decode,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Credential,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }
}

/// Outcome of one logical fetch (all attempts included).
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// URL as dispatched, after `#` encoding.
    pub url: String,
    pub method: HttpMethod,
    pub data: Result<Vec<u8>, FetchError>,
    /// Status of the final attempt, when one produced a response.
    pub status: Option<u16>,
    /// Duration of the final attempt only.
    pub elapsed: Duration,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub attempts: u32,
}

impl FetchResponse {
    fn failed(url: String, method: HttpMethod, error: FetchError) -> Self {
        Self {
            url,
            method,
            data: Err(error),
            status: None,
            elapsed: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
            attempts: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.data.is_ok()
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.data.as_ref().err()
    }

    /// One-line summary suitable for logs.
    pub fn details(&self) -> String {
        let outcome = match &self.data {
            Ok(_) => String::from("ok"),
            Err(error) => error.to_string(),
        };
        let status = self
            .status
            .map_or_else(|| String::from("-"), |status| status.to_string());
        format!(
            "{} {} status={} attempts={} sent={}B received={}B elapsed={}ms outcome={}",
            self.method,
            self.url,
            status,
            self.attempts,
            self.bytes_sent,
            self.bytes_received,
            self.elapsed.as_millis(),
            outcome
        )
    }
}

/// Process-wide fetch counters.
#[derive(Debug, Default)]
pub struct FetchCounters {
    get_calls: AtomicU64,
    post_calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    queued: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub get_calls: u64,
    pub post_calls: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub queued: usize,
}

impl FetchCounters {
    pub fn record_call(&self, method: HttpMethod) {
        let counter = match method {
            HttpMethod::Get => &self.get_calls,
            HttpMethod::Post => &self.post_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a fetch as in flight until the guard is dropped.
    pub fn track(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { counters: self }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            get_calls: self.get_calls.load(Ordering::Relaxed),
            post_calls: self.post_calls.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}

pub struct InFlightGuard<'a> {
    counters: &'a FetchCounters,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Request headers derived from the method and the target backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPolicy {
    pub keep_alive: bool,
    pub user_agent: String,
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self {
            keep_alive: false,
            user_agent: String::from("dasgate-server"),
        }
    }
}

impl HeaderPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            keep_alive: config.keep_alive,
            user_agent: config.user_agent(),
        }
    }

    pub fn apply(&self, request: HttpRequest, backend: Backend) -> HttpRequest {
        let mut request = match request.method {
            HttpMethod::Post => request.with_header("content-type", "application/json"),
            HttpMethod::Get => request,
        };
        request = if backend.prefers_gzip() {
            request.with_header("accept-encoding", "gzip")
        } else if request.method == HttpMethod::Get {
            request.with_header("accept-encoding", "identity")
        } else {
            request
        };
        if let Some(accept) = backend.accept() {
            request = request.with_header("accept", accept);
        }
        if self.keep_alive || backend == Backend::Rucio {
            request = request.with_header("connection", "keep-alive");
        }
        if self.keep_alive {
            request = request.with_header("keep-alive", "timeout=5, max=1000");
        }
        request.with_header("user-agent", self.user_agent.as_str())
    }
}

pub struct FetchExecutor {
    client: Arc<dyn HttpClient>,
    credentials: Arc<CredentialManager>,
    headers: HeaderPolicy,
    retry: RetryConfig,
    counters: Arc<FetchCounters>,
}

impl FetchExecutor {
    pub fn new(
        client: Arc<dyn HttpClient>,
        credentials: Arc<CredentialManager>,
        headers: HeaderPolicy,
        retry: RetryConfig,
        counters: Arc<FetchCounters>,
    ) -> Self {
        Self {
            client,
            credentials,
            headers,
            retry,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<FetchCounters> {
        &self.counters
    }

    /// Fetches `url`, as a POST when `body` is non-empty and as a GET
    /// otherwise. Transport failures are retried with linear backoff; decode,
    /// credential and URL errors are returned immediately.
    pub async fn fetch(&self, url: &str, body: Option<&str>) -> FetchResponse {
        let _in_flight = self.counters.track();
        let url = encode_fragment_marker(url);
        let body = body.filter(|body| !body.is_empty());
        let method = if body.is_some() {
            HttpMethod::Post
        } else {
            HttpMethod::Get
        };

        if !is_valid_url(&url) {
            let error = FetchError::invalid_url(&url);
            warn!(%url, %error, "refusing to fetch");
            return FetchResponse::failed(url, method, error);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut response = self.attempt(&url, method, body).await;
            response.attempts = attempt;

            match response.error() {
                None => {
                    debug!(details = %response.details(), "fetch complete");
                    return response;
                }
                Some(error) if error.retryable() && attempt < self.retry.max_attempts() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        url = %response.url,
                        attempt,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Some(_) => {
                    warn!(details = %response.details(), "fetch failed");
                    return response;
                }
            }
        }
    }

    /// Runs [`fetch`](Self::fetch) and delivers the response on `reply`.
    pub async fn fetch_into(
        self: Arc<Self>,
        url: String,
        body: Option<String>,
        reply: mpsc::UnboundedSender<FetchResponse>,
    ) {
        let response = self.fetch(&url, body.as_deref()).await;
        if reply.send(response).is_err() {
            debug!(%url, "fetch result dropped; receiver is gone");
        }
    }

    async fn attempt(&self, url: &str, method: HttpMethod, body: Option<&str>) -> FetchResponse {
        let started = Instant::now();
        let mut request = HttpRequest::new(method, url);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        request = self.headers.apply(request, Backend::from_url(url));

        match self.credentials.bearer_token().await {
            Ok(Some(token)) => request = request.with_bearer_token(&token),
            Ok(None) => {}
            Err(error) => {
                return FetchResponse::failed(
                    url.to_owned(),
                    method,
                    FetchError::credential(error.to_string()),
                );
            }
        }

        let bytes_sent = request.body.as_ref().map_or(0, String::len);
        self.counters.record_call(method);
        let outcome = self.client.execute(request).await;
        let elapsed = started.elapsed();

        let (status, bytes_received, data) = match outcome {
            Ok(response) => (
                Some(response.status),
                response.body.len(),
                decode_body(response),
            ),
            Err(error) if error.is_credential() => {
                (None, 0, Err(FetchError::credential(error.message())))
            }
            Err(error) => (
                None,
                0,
                Err(FetchError::transport(error.message(), error.retryable())),
            ),
        };

        FetchResponse {
            url: url.to_owned(),
            method,
            data,
            status,
            elapsed,
            bytes_sent,
            bytes_received,
            attempts: 0,
        }
    }
}

/// Returns the body, inflated when the response declares gzip encoding.
fn decode_body(response: HttpResponse) -> Result<Vec<u8>, FetchError> {
    let gzipped = response
        .header("content-encoding")
        .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Ok(response.body);
    }

    let mut decoded = Vec::new();
    GzDecoder::new(response.body.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| FetchError::decode(format!("unable to read gzipped content: {e}")))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn url_grammar_accepts_query_urls_and_rejects_spaces() {
        assert!(is_valid_url(
            "https://cmsweb.cern.ch/dbs/prod/global/DBSReader/blocks?dataset=/A/B/C"
        ));
        assert!(is_valid_url("http://localhost:8080/x?a=1&b=2"));
        assert!(!is_valid_url("ftp://cmsweb.cern.ch/"));
        assert!(!is_valid_url("https://cmsweb.cern.ch/a b"));
        assert!(!is_valid_url("https://cmsweb.cern.ch/node=T1_*"));
    }

    #[test]
    fn fragment_marker_is_percent_encoded() {
        assert_eq!(
            encode_fragment_marker("https://h/filelumis?block_name=/A/B/C#123"),
            "https://h/filelumis?block_name=/A/B/C%23123"
        );
    }

    #[test]
    fn gzip_body_is_inflated() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"[{"a":1}]"#).expect("compress");
        let compressed = encoder.finish().expect("finish");
        let response = HttpResponse::ok(compressed).with_header("Content-Encoding", "gzip");

        assert_eq!(decode_body(response).expect("inflates"), br#"[{"a":1}]"#.to_vec());
    }

    #[test]
    fn corrupt_gzip_is_a_decode_error() {
        let response = HttpResponse::ok(b"plainly not gzip".to_vec())
            .with_header("content-encoding", "gzip");

        let error = decode_body(response).expect_err("corrupt stream");
        assert_eq!(error.kind(), FetchErrorKind::Decode);
        assert!(!error.retryable());
    }

    #[test]
    fn header_policy_for_dbs_get_requests_gzip() {
        let policy = HeaderPolicy {
            keep_alive: true,
            user_agent: String::from("dasgate/1.0"),
        };

        let request = policy.apply(
            HttpRequest::get("https://cmsweb.test/dbs/prod/global/DBSReader/blocks"),
            Backend::Dbs,
        );

        assert_eq!(request.header("accept-encoding"), Some("gzip"));
        assert_eq!(request.header("connection"), Some("keep-alive"));
        assert_eq!(request.header("keep-alive"), Some("timeout=5, max=1000"));
        assert_eq!(request.header("user-agent"), Some("dasgate/1.0"));
        assert_eq!(request.header("content-type"), None);
    }

    #[test]
    fn header_policy_for_post_sets_json_content_type() {
        let request = HeaderPolicy::default().apply(
            HttpRequest::post("https://cmsweb.test/phedex/datasvc/json/prod/x", "{}"),
            Backend::Phedex,
        );

        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("accept-encoding"), None);
        assert_eq!(request.header("connection"), None);
    }

    #[test]
    fn rucio_requests_stream_json_and_keep_alive() {
        let request = HeaderPolicy::default().apply(
            HttpRequest::get("https://cms-rucio.cern.ch/replicas"),
            Backend::Rucio,
        );

        assert_eq!(request.header("accept"), Some("application/x-json-stream"));
        assert_eq!(request.header("accept-encoding"), Some("identity"));
        assert_eq!(request.header("connection"), Some("keep-alive"));
    }

    #[test]
    fn in_flight_guard_tracks_peak() {
        let counters = FetchCounters::default();
        {
            let _first = counters.track();
            let _second = counters.track();
            assert_eq!(counters.in_flight(), 2);
        }
        let snapshot = counters.snapshot();

        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.peak_in_flight, 2);
    }

    #[test]
    fn details_summarize_failure() {
        let response = FetchResponse::failed(
            String::from("https://x"),
            HttpMethod::Get,
            FetchError::transport("connection refused", true),
        );

        let details = response.details();
        assert!(details.starts_with("GET https://x status=-"));
        assert!(details.contains("transport error: connection refused"));
    }
}
