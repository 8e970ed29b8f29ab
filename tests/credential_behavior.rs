//! Behavior-driven tests for credential management.
//!
//! Covers exclusive certificate refresh, the grace period after a failed
//! refresh, token files and loading real PEM material from disk.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dasgate_core::{
    AuthConfig, CertificateLoader, Credential, CredentialBundle, CredentialError,
    CredentialManager, FileCertificateLoader, TokenSource,
};
use rcgen::{date_time_ymd, Certificate, CertificateParams};
use time::OffsetDateTime;

type LoadResult = Result<Option<CredentialBundle>, CredentialError>;

/// Loader answering from a script; the last entry repeats.
struct ScriptedLoader {
    script: Mutex<VecDeque<LoadResult>>,
    repeat: fn() -> LoadResult,
    delay: Duration,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    fn new(script: Vec<LoadResult>, repeat: fn() -> LoadResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat,
            delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl CertificateLoader for ScriptedLoader {
    fn load<'a>(&'a self) -> Pin<Box<dyn Future<Output = LoadResult> + Send + 'a>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().expect("script lock").pop_front();
            next.unwrap_or_else(|| (self.repeat)())
        })
    }
}

fn bundle_expiring_in(duration: Duration) -> CredentialBundle {
    CredentialBundle::new(
        b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".to_vec(),
        OffsetDateTime::now_utc() + duration,
        1,
        "/tmp/scripted-proxy",
    )
}

fn valid_day() -> LoadResult {
    Ok(Some(bundle_expiring_in(Duration::from_secs(86_400))))
}

fn unreadable() -> LoadResult {
    Err(CredentialError::Proxy {
        path: PathBuf::from("/tmp/scripted-proxy"),
        reason: String::from("truncated file"),
    })
}

fn self_signed(common_name: &str) -> Certificate {
    let mut params = CertificateParams::new(vec![common_name.to_owned()]);
    params.not_before = date_time_ymd(2020, 1, 1);
    params.not_after = date_time_ymd(2099, 6, 30);
    Certificate::from_params(params).expect("certificate generation")
}

// =============================================================================
// Refresh exclusivity
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_many_callers_need_refresh_system_loads_files_once() {
    // Given: a slow loader and a manager with nothing cached yet
    let loader = Arc::new(
        ScriptedLoader::new(Vec::new(), valid_day).with_delay(Duration::from_millis(50)),
    );
    let manager = Arc::new(CredentialManager::with_loader(loader.clone()));

    // When: sixteen callers ask for the credential at the same time
    let callers: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_credential().await })
        })
        .collect();

    let mut credentials = Vec::new();
    for caller in callers {
        credentials.push(
            caller
                .await
                .expect("caller task")
                .expect("credential available"),
        );
    }

    // Then: the files were loaded exactly once and every caller got that bundle
    assert_eq!(loader.loads(), 1);
    assert_eq!(manager.refresh_count(), 1);
    assert!(credentials
        .iter()
        .all(|credential| credential == &credentials[0]));
    assert!(matches!(credentials[0], Credential::Certificate(_)));
}

#[tokio::test]
async fn when_renew_interval_has_not_passed_system_reuses_bundle() {
    let loader = Arc::new(ScriptedLoader::new(Vec::new(), valid_day));
    let manager = CredentialManager::with_loader(loader.clone())
        .with_renew_interval(Duration::from_secs(600));

    manager.get_credential().await.expect("first load");
    manager.get_credential().await.expect("cached");
    assert_eq!(loader.loads(), 1);

    // When: the cache is invalidated
    manager.invalidate().await;
    manager.get_credential().await.expect("reload");

    // Then: the files are read again
    assert_eq!(loader.loads(), 2);
}

// =============================================================================
// Failed refresh
// =============================================================================

#[tokio::test]
async fn when_refresh_fails_system_serves_previous_bundle_during_grace() {
    // Given: a good bundle, then unreadable files
    let loader = Arc::new(ScriptedLoader::new(vec![valid_day()], unreadable));
    let manager = CredentialManager::with_loader(loader.clone())
        .with_renew_interval(Duration::ZERO)
        .with_grace(Duration::from_secs(600));
    let first = manager.get_credential().await.expect("initial load");

    // When: the next refresh fails
    let second = manager
        .get_credential()
        .await
        .expect("previous bundle served");

    // Then: the previous bundle is returned and no retry happens within the grace period
    assert_eq!(first, second);
    manager.get_credential().await.expect("still in grace");
    assert_eq!(loader.loads(), 2);
}

#[tokio::test]
async fn when_previous_bundle_has_expired_system_reports_expiry() {
    // Given: a bundle that expires almost immediately, then unreadable files
    let loader = Arc::new(ScriptedLoader::new(
        vec![Ok(Some(bundle_expiring_in(Duration::from_millis(30))))],
        unreadable,
    ));
    let manager = CredentialManager::with_loader(loader).with_renew_interval(Duration::ZERO);
    manager.get_credential().await.expect("initial load");

    // When: the bundle has expired and the refresh fails
    tokio::time::sleep(Duration::from_millis(60)).await;
    let error = manager
        .get_credential()
        .await
        .expect_err("expired bundle is not served");

    // Then: the caller learns when it expired
    assert!(matches!(error, CredentialError::Expired { .. }));
}

fn expired_an_hour_ago() -> LoadResult {
    Ok(Some(CredentialBundle::new(
        b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".to_vec(),
        OffsetDateTime::now_utc() - time::Duration::hours(1),
        1,
        "/tmp/scripted-proxy",
    )))
}

#[tokio::test]
async fn when_loaded_bundle_is_already_expired_system_refuses_to_serve_it() {
    // Given: files holding a proxy that expired an hour ago
    let loader = Arc::new(ScriptedLoader::new(Vec::new(), expired_an_hour_ago));
    let manager = CredentialManager::with_loader(loader.clone());

    // When: the credential is requested twice
    let first = manager.get_credential().await.expect_err("expired proxy");
    let second = manager.get_credential().await.expect_err("still expired");

    // Then: both calls report expiry and each one tried the files again
    assert!(matches!(first, CredentialError::Expired { .. }));
    assert!(matches!(second, CredentialError::Expired { .. }));
    assert_eq!(loader.loads(), 2);
}

#[tokio::test]
async fn when_reloaded_bundle_is_expired_system_keeps_serving_the_valid_one() {
    // Given: a valid bundle, then files replaced by an expired proxy
    let loader = Arc::new(ScriptedLoader::new(vec![valid_day()], expired_an_hour_ago));
    let manager = CredentialManager::with_loader(loader)
        .with_renew_interval(Duration::ZERO)
        .with_grace(Duration::from_secs(600));
    let first = manager.get_credential().await.expect("initial load");

    // When: the refresh loads the expired proxy
    let second = manager
        .get_credential()
        .await
        .expect("previous bundle served");

    // Then: the still-valid previous bundle is kept
    assert_eq!(first, second);
}

#[tokio::test]
async fn when_first_load_fails_system_reports_unavailable() {
    let loader = Arc::new(ScriptedLoader::new(Vec::new(), unreadable));
    let manager = CredentialManager::with_loader(loader);

    let error = manager
        .get_credential()
        .await
        .expect_err("nothing to fall back to");

    assert!(matches!(error, CredentialError::Unavailable { .. }));
}

#[tokio::test]
async fn when_no_material_is_configured_system_stays_anonymous() {
    let manager = CredentialManager::with_loader(Arc::new(FileCertificateLoader::default()));

    let credential = manager.get_credential().await.expect("no material is fine");

    assert_eq!(credential, Credential::Anonymous);
}

// =============================================================================
// Tokens
// =============================================================================

#[tokio::test]
async fn when_token_file_changes_system_reads_new_value() {
    // Given: a token file with a trailing newline
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("token");
    std::fs::write(&path, "first-token\n").expect("write token");
    let manager =
        CredentialManager::with_token(TokenSource::new(path.to_string_lossy().into_owned()));

    // Then: the newline is stripped
    assert_eq!(
        manager.get_credential().await.expect("token"),
        Credential::Bearer(String::from("first-token"))
    );

    // When: the file is rewritten
    std::fs::write(&path, "second-token\r\n").expect("rewrite token");

    // Then: the next call sees the new token
    assert_eq!(
        manager.bearer_token().await.expect("token"),
        Some(String::from("second-token"))
    );
}

// =============================================================================
// Certificate files
// =============================================================================

#[tokio::test]
async fn when_proxy_file_holds_chain_and_key_system_parses_leaf_expiry() {
    // Given: a proxy file with certificate and key in one PEM file
    let certificate = self_signed("proxy.dasgate.test");
    let dir = tempfile::tempdir().expect("temp dir");
    let proxy = dir.path().join("x509up_test");
    let pem = format!(
        "{}{}",
        certificate.serialize_pem().expect("certificate pem"),
        certificate.serialize_private_key_pem()
    );
    std::fs::write(&proxy, pem).expect("write proxy");

    // When: the manager loads it
    let manager = CredentialManager::with_loader(Arc::new(FileCertificateLoader::proxy(&proxy)));
    let credential = manager.get_credential().await.expect("proxy loads");

    // Then: the bundle knows its origin and expiry
    let Credential::Certificate(bundle) = credential else {
        panic!("expected a certificate credential");
    };
    assert_eq!(bundle.origin(), proxy.as_path());
    assert_eq!(bundle.chain_len(), 1);
    assert_eq!(bundle.expires_at().year(), 2099);
}

#[tokio::test]
async fn when_cert_and_key_are_separate_system_combines_them() {
    let certificate = self_signed("user.dasgate.test");
    let dir = tempfile::tempdir().expect("temp dir");
    let cert = dir.path().join("usercert.pem");
    let key = dir.path().join("userkey.pem");
    std::fs::write(&cert, certificate.serialize_pem().expect("certificate pem"))
        .expect("write cert");
    std::fs::write(&key, certificate.serialize_private_key_pem()).expect("write key");

    let loader = FileCertificateLoader::key_pair(&cert, &key);
    let bundle = loader
        .load()
        .await
        .expect("pair loads")
        .expect("material configured");

    let identity = String::from_utf8(bundle.identity_pem().to_vec()).expect("utf-8 pem");
    assert!(identity.contains("BEGIN CERTIFICATE"));
    assert!(identity.contains("PRIVATE KEY"));
    assert_eq!(bundle.origin(), cert.as_path());
}

#[tokio::test]
async fn when_only_half_a_key_pair_is_configured_system_rejects_it() {
    let dir = tempfile::tempdir().expect("temp dir");
    let auth = AuthConfig {
        user_cert: Some(dir.path().join("usercert.pem")),
        probe_user_proxy: false,
        ..AuthConfig::default()
    };

    let error = FileCertificateLoader::from_auth(&auth)
        .load()
        .await
        .expect_err("incomplete pair");

    assert!(matches!(error, CredentialError::KeyPair { .. }));
}

#[tokio::test]
async fn when_proxy_file_has_no_key_system_rejects_it() {
    let certificate = self_signed("nokey.dasgate.test");
    let dir = tempfile::tempdir().expect("temp dir");
    let proxy = dir.path().join("x509up_nokey");
    std::fs::write(&proxy, certificate.serialize_pem().expect("certificate pem"))
        .expect("write proxy");

    let error = FileCertificateLoader::proxy(&proxy)
        .load()
        .await
        .expect_err("key is required");

    assert!(matches!(error, CredentialError::Proxy { .. }));
}
