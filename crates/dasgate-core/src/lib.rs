//! # dasgate Core
//!
//! Concurrent fetch-and-aggregate core of the dasgate data aggregation gateway.
//!
//! ## Overview
//!
//! A structured query names a logical API (for example `run_lumi4dataset`).
//! The core plans the backend URLs that answer it, fetches them concurrently
//! under an admission limit, normalizes each backend's JSON into a common
//! [`Record`] shape and merges the results.
//!
//! - **Credential management** for X.509 proxies, certificate/key pairs and
//!   bearer tokens, with exclusive refresh and a bounded grace period
//! - **Transport factory** building TLS clients, with an optional DNS cache
//! - **Fetch executor** with URL validation, linear-backoff retry and gzip
//!   decoding
//! - **Fetch scheduler** admitting requests oldest-first under a concurrency
//!   limit
//! - **Backend normalizers** for the bookkeeping (DBS) and placement (PhEDEx)
//!   services
//! - **Aggregator** running the plan → fan-out → fan-in → normalize → merge
//!   pipeline
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`aggregator`] | Logical APIs, URL planning, fan-in and run/lumi merge |
//! | [`backend`] | Backend identification and endpoint URLs |
//! | [`config`] | Layered gateway configuration |
//! | [`credential`] | Certificate and token credentials |
//! | [`dns`] | Host-name resolution cache |
//! | [`error`] | Schema and top-level error types |
//! | [`fetch`] | Fetch executor, responses and counters |
//! | [`gateway`] | Assembly of all components |
//! | [`http_client`] | HTTP client abstraction |
//! | [`normalize`] | Backend payload normalizers |
//! | [`query`] | Structured queries |
//! | [`record`] | Normalized records |
//! | [`retry`] | Retry policy |
//! | [`scheduler`] | Bounded-concurrency scheduler |
//! | [`store`] | Record store collaborator |
//! | [`transport`] | TLS client construction |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  CLI / Caller   │
//! └────────┬────────┘
//!          │ Execute(query, api)
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   Aggregator    │────▶│   Normalizers    │
//! └────────┬────────┘     └──────────────────┘
//!          │ FetchRequest
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Fetch Scheduler │────▶│  Fetch Executor  │
//! └─────────────────┘     └────────┬─────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   Credential    │◀────│ Transport / HTTP │
//! │    Manager      │     │ (reqwest + DNS)  │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Fetch outcomes travel inside [`FetchResponse`]; the aggregator turns the
//! first failed fetch or schema violation into an [`AggregateError`] and
//! reports the phase it happened in:
//!
//! ```rust
//! use dasgate_core::{AggregateError, AggregationPhase};
//!
//! fn report(error: &AggregateError) -> &'static str {
//!     match error.phase() {
//!         AggregationPhase::Planning => "query could not be planned",
//!         AggregationPhase::Joining => "a backend call failed",
//!         AggregationPhase::Normalizing => "a backend returned an unexpected payload",
//!         _ => "aggregation failed",
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - Credential material and tokens are never logged
//! - Server certificate verification stays on unless explicitly disabled

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod credential;
pub mod dns;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod http_client;
pub mod normalize;
pub mod query;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transport;

// Aggregation
pub use aggregator::{AggregateError, AggregationPhase, Aggregator, LogicalApi, Relation};

// Backends
pub use backend::{Backend, Endpoints};

// Configuration
pub use config::{AuthConfig, ConfigError, GatewayConfig};

// Credentials
pub use credential::{
    CertificateLoader, Credential, CredentialBundle, CredentialError, CredentialManager,
    FileCertificateLoader, TokenSource,
};

// DNS cache
pub use dns::DnsCache;

// Error types
pub use error::{CoreError, SchemaError};

// Fetching
pub use fetch::{
    CounterSnapshot, FetchCounters, FetchError, FetchErrorKind, FetchExecutor, FetchResponse,
    HeaderPolicy,
};

// Assembly
pub use gateway::{Gateway, GatewayBuilder};

// HTTP client types
pub use http_client::{
    HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
};

// Normalizers
pub use normalize::{DbsNormalizer, Normalizer, NormalizerRegistry, PhedexNormalizer};

// Queries and records
pub use query::{Query, SpecValue};
pub use record::Record;

// Retry logic
pub use retry::RetryConfig;

// Scheduling
pub use scheduler::{FetchRequest, FetchScheduler};

// Storage
pub use store::{MemoryRecordStore, RecordStore, StoreError, StoreKey};

// Transport
pub use transport::{TransportError, TransportFactory, TransportSettings};
