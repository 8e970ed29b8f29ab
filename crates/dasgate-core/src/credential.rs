//! Transport identity management.
//!
//! [`CredentialManager`] hands out the credential every outgoing request is
//! made with. It works in one of three modes:
//!
//! | Mode | Source | Refresh |
//! |------|--------|---------|
//! | anonymous | none | never |
//! | token | literal or file path, read on every call | per call |
//! | certificate | X.509 proxy or user cert/key pair | every renew interval |
//!
//! Certificate refresh is exclusive: concurrent callers that find the cached
//! bundle stale wait on the same refresh instead of loading the files
//! themselves. A failed refresh keeps serving the previous bundle for a grace
//! period bounded by its expiry; without a usable previous bundle the failure
//! is returned to the caller.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use x509_parser::pem::Pem;

use crate::config::{AuthConfig, GatewayConfig};

pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid X509 proxy {path}: {reason}")]
    Proxy { path: PathBuf, reason: String },

    #[error("invalid user certificate {path}: {reason}")]
    KeyPair { path: PathBuf, reason: String },

    #[error("no usable credential: {reason}")]
    Unavailable { reason: String },

    #[error("credential expired at {expired_at} and could not be renewed: {reason}")]
    Expired {
        expired_at: OffsetDateTime,
        reason: String,
    },
}

/// Parsed certificate material ready to be installed as a TLS client identity.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    identity_pem: Vec<u8>,
    expires_at: OffsetDateTime,
    chain_len: usize,
    origin: PathBuf,
}

impl CredentialBundle {
    pub fn new(
        identity_pem: impl Into<Vec<u8>>,
        expires_at: OffsetDateTime,
        chain_len: usize,
        origin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identity_pem: identity_pem.into(),
            expires_at,
            chain_len,
            origin: origin.into(),
        }
    }

    /// Parses a proxy file: certificate chain and private key in one PEM file.
    /// The first certificate is the leaf and determines the expiry.
    pub fn from_proxy_pem(pem: &[u8], origin: &Path) -> Result<Self, CredentialError> {
        let invalid = |reason: String| CredentialError::Proxy {
            path: origin.to_path_buf(),
            reason,
        };
        let parts = PemParts::scan(pem).map_err(invalid)?;
        if !parts.has_private_key {
            return Err(invalid(String::from("no private key block found")));
        }
        let expires_at = parts.leaf_expiry().map_err(invalid)?;
        Ok(Self::new(pem, expires_at, parts.certificates.len(), origin))
    }

    /// Parses a separate certificate file and key file.
    pub fn from_key_pair_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        cert_path: &Path,
    ) -> Result<Self, CredentialError> {
        let invalid = |reason: String| CredentialError::KeyPair {
            path: cert_path.to_path_buf(),
            reason,
        };
        let certs = PemParts::scan(cert_pem).map_err(invalid)?;
        let key = PemParts::scan(key_pem).map_err(invalid)?;
        if !key.has_private_key {
            return Err(invalid(String::from("key file holds no private key block")));
        }
        let expires_at = certs.leaf_expiry().map_err(invalid)?;

        let mut identity = cert_pem.to_vec();
        if !identity.ends_with(b"\n") {
            identity.push(b'\n');
        }
        identity.extend_from_slice(key_pem);
        Ok(Self::new(identity, expires_at, certs.certificates.len(), cert_path))
    }

    pub fn identity_pem(&self) -> &[u8] {
        &self.identity_pem
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    pub fn chain_len(&self) -> usize {
        self.chain_len
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Time left until expiry, zero once expired.
    pub fn remaining_at(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(self.expires_at - now).unwrap_or(Duration::ZERO)
    }
}

impl Debug for CredentialBundle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("origin", &self.origin)
            .field("expires_at", &self.expires_at)
            .field("chain_len", &self.chain_len)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct PemParts {
    certificates: Vec<Pem>,
    has_private_key: bool,
}

impl PemParts {
    fn scan(data: &[u8]) -> Result<Self, String> {
        let mut parts = Self::default();
        for block in Pem::iter_from_buffer(data) {
            let block = block.map_err(|e| format!("malformed PEM: {e}"))?;
            if block.label == "CERTIFICATE" {
                parts.certificates.push(block);
            } else if block.label.ends_with("PRIVATE KEY") {
                parts.has_private_key = true;
            }
        }
        Ok(parts)
    }

    fn leaf_expiry(&self) -> Result<OffsetDateTime, String> {
        let leaf = self
            .certificates
            .first()
            .ok_or_else(|| String::from("no certificate block found"))?;
        let certificate = leaf
            .parse_x509()
            .map_err(|e| format!("unparsable certificate: {e}"))?;
        Ok(certificate.validity().not_after.to_datetime())
    }
}

/// Source of certificate material. `Ok(None)` means none is configured.
pub trait CertificateLoader: Send + Sync {
    fn load<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CredentialBundle>, CredentialError>> + Send + 'a>>;
}

/// Reads certificate material from the filesystem.
///
/// The per-user proxy location is tried first (when probing is enabled), then
/// the configured proxy path, then the configured certificate and key pair.
#[derive(Debug, Clone, Default)]
pub struct FileCertificateLoader {
    user_proxy: Option<PathBuf>,
    user_cert: Option<PathBuf>,
    user_key: Option<PathBuf>,
    probe_user_proxy: bool,
}

impl FileCertificateLoader {
    pub fn from_auth(auth: &AuthConfig) -> Self {
        Self {
            user_proxy: auth.user_proxy.clone(),
            user_cert: auth.user_cert.clone(),
            user_key: auth.user_key.clone(),
            probe_user_proxy: auth.probe_user_proxy,
        }
    }

    pub fn proxy(path: impl Into<PathBuf>) -> Self {
        Self {
            user_proxy: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn key_pair(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            user_cert: Some(cert.into()),
            user_key: Some(key.into()),
            ..Self::default()
        }
    }

    fn resolve_proxy(&self) -> Option<PathBuf> {
        if self.probe_user_proxy {
            if let Some(path) = user_proxy_path().filter(|path| path.is_file()) {
                return Some(path);
            }
        }
        self.user_proxy.clone()
    }

    async fn load_files(&self) -> Result<Option<CredentialBundle>, CredentialError> {
        if let Some(proxy) = self.resolve_proxy() {
            let pem = read(&proxy).await?;
            return CredentialBundle::from_proxy_pem(&pem, &proxy).map(Some);
        }

        match (&self.user_cert, &self.user_key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => {
                let cert_pem = read(cert).await?;
                let key_pem = read(key).await?;
                CredentialBundle::from_key_pair_pem(&cert_pem, &key_pem, cert).map(Some)
            }
            (Some(path), None) | (None, Some(path)) => Err(CredentialError::KeyPair {
                path: path.clone(),
                reason: String::from("both a user certificate and a user key are required"),
            }),
        }
    }
}

impl CertificateLoader for FileCertificateLoader {
    fn load<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CredentialBundle>, CredentialError>> + Send + 'a>>
    {
        Box::pin(self.load_files())
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, CredentialError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// `/tmp/x509up_u<uid>`, the conventional per-user proxy location.
#[cfg(unix)]
pub fn user_proxy_path() -> Option<PathBuf> {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    Some(PathBuf::from(format!("/tmp/x509up_u{uid}")))
}

#[cfg(not(unix))]
pub fn user_proxy_path() -> Option<PathBuf> {
    None
}

/// Bearer token given either literally or as a path to a file holding it.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSource {
    value: String,
}

impl TokenSource {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Current token. A value naming an existing file is re-read on every
    /// call with line breaks removed; anything else is the token itself.
    pub async fn read(&self) -> Result<String, CredentialError> {
        let path = Path::new(&self.value);
        let is_file = tokio::fs::metadata(path)
            .await
            .is_ok_and(|metadata| metadata.is_file());
        if !is_file {
            return Ok(self.value.clone());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CredentialError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(raw.replace(['\n', '\r'], ""))
    }
}

impl Debug for TokenSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if Path::new(&self.value).is_file() {
            f.debug_tuple("TokenSource").field(&self.value).finish()
        } else {
            f.write_str("TokenSource(<literal>)")
        }
    }
}

/// Credential attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Bearer(String),
    Certificate(Arc<CredentialBundle>),
}

enum CredentialMode {
    Anonymous,
    Token(TokenSource),
    Certificate(Arc<dyn CertificateLoader>),
}

#[derive(Default)]
struct CertificateState {
    bundle: Option<Arc<CredentialBundle>>,
    next_refresh: Option<Instant>,
}

impl CertificateState {
    fn is_fresh(&self, now: Instant, wall_clock: OffsetDateTime) -> bool {
        let due = self.next_refresh.map_or(true, |at| now >= at);
        let expired = self
            .bundle
            .as_ref()
            .is_some_and(|bundle| bundle.is_expired_at(wall_clock));
        !due && !expired
    }

    fn credential(&self) -> Credential {
        self.bundle
            .clone()
            .map_or(Credential::Anonymous, Credential::Certificate)
    }
}

pub struct CredentialManager {
    mode: CredentialMode,
    renew_interval: Duration,
    grace: Duration,
    state: Mutex<CertificateState>,
    refreshes: AtomicU64,
}

impl CredentialManager {
    fn with_mode(mode: CredentialMode) -> Self {
        Self {
            mode,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            grace: DEFAULT_GRACE,
            state: Mutex::new(CertificateState::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn anonymous() -> Self {
        Self::with_mode(CredentialMode::Anonymous)
    }

    pub fn with_token(source: TokenSource) -> Self {
        Self::with_mode(CredentialMode::Token(source))
    }

    pub fn with_loader(loader: Arc<dyn CertificateLoader>) -> Self {
        Self::with_mode(CredentialMode::Certificate(loader))
    }

    /// Token mode when a token is configured (directly or via `token_env`),
    /// certificate mode otherwise.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let auth = &config.auth;
        let token = auth.token.clone().or_else(|| {
            auth.token_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|value| !value.trim().is_empty())
        });

        let manager = match token {
            Some(token) => Self::with_token(TokenSource::new(token)),
            None => Self::with_loader(Arc::new(FileCertificateLoader::from_auth(auth))),
        };
        manager
            .with_renew_interval(config.credential_renew_interval())
            .with_grace(config.credential_grace())
    }

    pub fn with_renew_interval(mut self, renew_interval: Duration) -> Self {
        self.renew_interval = renew_interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            CredentialMode::Anonymous => "anonymous",
            CredentialMode::Token(_) => "token",
            CredentialMode::Certificate(_) => "certificate",
        }
    }

    /// Number of certificate loads performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Current bearer token, if running in token mode.
    pub async fn bearer_token(&self) -> Result<Option<String>, CredentialError> {
        match &self.mode {
            CredentialMode::Token(source) => source.read().await.map(Some),
            _ => Ok(None),
        }
    }

    pub async fn get_credential(&self) -> Result<Credential, CredentialError> {
        match &self.mode {
            CredentialMode::Anonymous => Ok(Credential::Anonymous),
            CredentialMode::Token(source) => source.read().await.map(Credential::Bearer),
            CredentialMode::Certificate(loader) => self.certificate(loader.as_ref()).await,
        }
    }

    /// Forces the next call to reload certificate material.
    pub async fn invalidate(&self) {
        self.state.lock().await.next_refresh = None;
    }

    async fn certificate(
        &self,
        loader: &dyn CertificateLoader,
    ) -> Result<Credential, CredentialError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let wall_clock = OffsetDateTime::now_utc();
        if state.is_fresh(now, wall_clock) {
            return Ok(state.credential());
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let loaded = match loader.load().await {
            Ok(Some(bundle)) if bundle.is_expired_at(wall_clock) => {
                Err(CredentialError::Expired {
                    expired_at: bundle.expires_at(),
                    reason: format!("{} is past its expiry", bundle.origin().display()),
                })
            }
            other => other,
        };

        match loaded {
            Ok(bundle) => {
                match &bundle {
                    Some(bundle) => info!(
                        origin = %bundle.origin().display(),
                        expires_at = %bundle.expires_at(),
                        chain_len = bundle.chain_len(),
                        "credential refreshed"
                    ),
                    None => debug!("no certificate material configured; using anonymous transport"),
                }
                state.bundle = bundle.map(Arc::new);
                state.next_refresh = Some(now + self.renew_interval);
                Ok(state.credential())
            }
            Err(error) => match state.bundle.clone() {
                Some(previous) if !previous.is_expired_at(wall_clock) => {
                    let extension = self.grace.min(previous.remaining_at(wall_clock));
                    state.next_refresh = Some(now + extension);
                    warn!(
                        %error,
                        extension_secs = extension.as_secs(),
                        expires_at = %previous.expires_at(),
                        "credential refresh failed; serving previous credential"
                    );
                    Ok(Credential::Certificate(previous))
                }
                Some(previous) => Err(CredentialError::Expired {
                    expired_at: previous.expires_at(),
                    reason: error.to_string(),
                }),
                None => match error {
                    expired @ CredentialError::Expired { .. } => {
                        warn!(%expired, "loaded credential is already expired");
                        Err(expired)
                    }
                    error => Err(CredentialError::Unavailable {
                        reason: error.to_string(),
                    }),
                },
            },
        }
    }
}

impl Debug for CredentialManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("mode", &self.mode_name())
            .field("renew_interval", &self.renew_interval)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}
