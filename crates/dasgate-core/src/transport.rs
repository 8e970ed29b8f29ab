//! Builds HTTP clients carrying the current transport identity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::credential::{Credential, CredentialBundle, CredentialError, CredentialManager};
use crate::dns::DnsCache;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("invalid client identity: {0}")]
    Identity(String),

    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

const KEEP_ALIVE_IDLE: Duration = Duration::from_secs(90);
const KEEP_ALIVE_PROBE: Duration = Duration::from_secs(5);

/// Client settings that do not depend on the credential.
#[derive(Clone)]
pub struct TransportSettings {
    pub timeout: Option<Duration>,
    pub verify_tls: bool,
    /// Reuse pooled connections; when off every call opens a new connection.
    pub keep_alive: bool,
    pub dns_cache: Option<DnsCache>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            verify_tls: true,
            keep_alive: false,
            dns_cache: None,
        }
    }
}

impl TransportSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let dns_cache = config.dns_cache.then(|| {
            DnsCache::new(config.dns_cache_ttl(), config.dns_cache_hosts.clone())
        });
        Self {
            timeout: config.http_timeout(),
            verify_tls: config.verify_tls,
            keep_alive: config.keep_alive,
            dns_cache,
        }
    }
}

struct CachedClient {
    identity: Option<Arc<CredentialBundle>>,
    client: reqwest::Client,
}

/// Produces `reqwest` clients configured with the credential, timeout, TLS
/// policy and DNS cache. The last client is reused until the credential
/// manager hands out a different bundle.
pub struct TransportFactory {
    credentials: Arc<CredentialManager>,
    settings: TransportSettings,
    cached: Mutex<Option<CachedClient>>,
}

impl TransportFactory {
    pub fn new(credentials: Arc<CredentialManager>, settings: TransportSettings) -> Self {
        if !settings.verify_tls {
            warn!("server certificate verification is disabled");
        }
        Self {
            credentials,
            settings,
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(config: &GatewayConfig, credentials: Arc<CredentialManager>) -> Self {
        Self::new(credentials, TransportSettings::from_config(config))
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Returns a client for the current credential.
    pub async fn client(&self) -> Result<reqwest::Client, TransportError> {
        let credential = self.credentials.get_credential().await?;
        let identity = match &credential {
            Credential::Certificate(bundle) => Some(bundle.clone()),
            Credential::Anonymous | Credential::Bearer(_) => None,
        };

        {
            let cached = self.cached.lock().expect("transport cache lock not poisoned");
            if let Some(cached) = cached.as_ref() {
                if same_identity(cached.identity.as_ref(), identity.as_ref()) {
                    return Ok(cached.client.clone());
                }
            }
        }

        let client = self.build_client(&credential)?;
        debug!(
            identity = ?identity.as_ref().map(|bundle| bundle.origin()),
            "http client rebuilt"
        );
        *self.cached.lock().expect("transport cache lock not poisoned") = Some(CachedClient {
            identity,
            client: client.clone(),
        });
        Ok(client)
    }

    pub fn build_client(&self, credential: &Credential) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = self.settings.timeout {
            builder = builder.timeout(timeout);
        }
        if !self.settings.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder = if self.settings.keep_alive {
            builder
                .pool_idle_timeout(KEEP_ALIVE_IDLE)
                .tcp_keepalive(KEEP_ALIVE_PROBE)
        } else {
            builder.pool_max_idle_per_host(0)
        };
        if let Some(dns_cache) = &self.settings.dns_cache {
            builder = builder.dns_resolver(Arc::new(dns_cache.clone()));
        }
        if let Credential::Certificate(bundle) = credential {
            let identity = reqwest::Identity::from_pem(bundle.identity_pem())
                .map_err(|e| TransportError::Identity(e.to_string()))?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}

fn same_identity(
    cached: Option<&Arc<CredentialBundle>>,
    current: Option<&Arc<CredentialBundle>>,
) -> bool {
    match (cached, current) {
        (None, None) => true,
        (Some(cached), Some(current)) => Arc::ptr_eq(cached, current),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn anonymous_client_is_built_once_and_reused() {
        let factory = TransportFactory::new(
            Arc::new(CredentialManager::anonymous()),
            TransportSettings {
                timeout: Some(Duration::from_secs(5)),
                ..TransportSettings::default()
            },
        );

        factory.client().await.expect("first client");
        factory.client().await.expect("cached client");

        let cached = factory.cached.lock().expect("lock");
        assert!(cached.as_ref().is_some_and(|c| c.identity.is_none()));
    }

    #[test]
    fn garbage_identity_is_rejected() {
        let factory = TransportFactory::new(
            Arc::new(CredentialManager::anonymous()),
            TransportSettings::default(),
        );
        let bundle = CredentialBundle::new(
            b"not a pem".to_vec(),
            OffsetDateTime::now_utc() + time::Duration::hours(1),
            1,
            "/tmp/proxy",
        );

        let error = factory
            .build_client(&Credential::Certificate(Arc::new(bundle)))
            .expect_err("identity must not parse");
        assert!(matches!(error, TransportError::Identity(_)));
    }

    #[test]
    fn identities_compare_by_bundle_instance() {
        let bundle = Arc::new(CredentialBundle::new(
            Vec::new(),
            OffsetDateTime::now_utc(),
            1,
            "/tmp/proxy",
        ));
        let reloaded = Arc::new(bundle.as_ref().clone());

        assert!(same_identity(Some(&bundle), Some(&bundle.clone())));
        assert!(!same_identity(Some(&bundle), Some(&reloaded)));
        assert!(!same_identity(None, Some(&bundle)));
    }
}
