use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SchemaError;

/// Backend data services reachable through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Dbs,
    Rucio,
    ReqMgr,
    Mcm,
    CondDb,
    Phedex,
    RunRegistry,
    Dashboard,
    SiteDb,
    Combined,
}

impl Backend {
    pub const ALL: [Self; 10] = [
        Self::Dbs,
        Self::Rucio,
        Self::ReqMgr,
        Self::Mcm,
        Self::CondDb,
        Self::Phedex,
        Self::RunRegistry,
        Self::Dashboard,
        Self::SiteDb,
        Self::Combined,
    ];

    /// Order in which URL substrings are checked. `Combined` is the fallback.
    const SNIFF_ORDER: [Self; 9] = [
        Self::Dbs,
        Self::Rucio,
        Self::ReqMgr,
        Self::Mcm,
        Self::CondDb,
        Self::Phedex,
        Self::RunRegistry,
        Self::Dashboard,
        Self::SiteDb,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dbs => "dbs",
            Self::Rucio => "rucio",
            Self::ReqMgr => "reqmgr",
            Self::Mcm => "mcm",
            Self::CondDb => "conddb",
            Self::Phedex => "phedex",
            Self::RunRegistry => "runregistry",
            Self::Dashboard => "dashboard",
            Self::SiteDb => "sitedb",
            Self::Combined => "combined",
        }
    }

    /// Identifies the backend a URL belongs to by substring.
    pub fn from_url(url: &str) -> Self {
        Self::SNIFF_ORDER
            .into_iter()
            .find(|backend| url.contains(backend.as_str()))
            .unwrap_or(Self::Combined)
    }

    /// Whether compressed responses are requested from this backend.
    pub const fn prefers_gzip(self) -> bool {
        matches!(self, Self::Dbs)
    }

    /// Explicit `Accept` header sent to this backend, if any.
    pub const fn accept(self) -> Option<&'static str> {
        match self {
            Self::SiteDb | Self::ReqMgr | Self::Mcm => Some("application/json"),
            Self::Rucio => Some("application/x-json-stream"),
            _ => None,
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|backend| backend.as_str() == normalized)
            .ok_or_else(|| SchemaError::invalid_value("backend", normalized, "unknown backend"))
    }
}

/// Base URLs of the backend services, derived from one deployment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base_url: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/dbs/{instance}/DBSReader`
    pub fn dbs(&self, instance: &str) -> String {
        format!("{}/dbs/{}/DBSReader", self.base_url, instance)
    }

    pub fn phedex(&self) -> String {
        format!("{}/phedex/datasvc/json/prod", self.base_url)
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BACKEND_URL)
    }
}
