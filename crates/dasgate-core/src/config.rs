//! Gateway configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file (named by
//! `DASGATE_CONFIG` or passed explicitly), then environment overrides. Command
//! line flags are applied on top by the binary.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

pub const CONFIG_ENV: &str = "DASGATE_CONFIG";
pub const TOKEN_ENV: &str = "DASGATE_TOKEN";
pub const USER_PROXY_ENV: &str = "X509_USER_PROXY";
pub const USER_CERT_ENV: &str = "X509_USER_CERT";
pub const USER_KEY_ENV: &str = "X509_USER_KEY";

pub const DEFAULT_BACKEND_URL: &str = "https://cmsweb.cern.ch";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Credential sources. A token takes precedence over certificate material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token, either literal or a path to a file holding it.
    pub token: Option<String>,
    /// Environment variable consulted for a token when `token` is unset.
    pub token_env: Option<String>,
    pub user_proxy: Option<PathBuf>,
    pub user_cert: Option<PathBuf>,
    pub user_key: Option<PathBuf>,
    /// Check the per-user proxy location before the configured paths.
    pub probe_user_proxy: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_env: None,
            user_proxy: None,
            user_cert: None,
            user_key: None,
            probe_user_proxy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub retry_count: u32,
    pub retry_unit_ms: u64,
    /// Fetch concurrency ceiling; 0 disables the scheduler queue.
    pub concurrency_limit: usize,
    pub credential_renew_secs: u64,
    pub credential_grace_secs: u64,
    /// Per-request timeout; 0 means none.
    pub http_timeout_secs: u64,
    pub dns_cache: bool,
    pub dns_cache_ttl_secs: u64,
    pub dns_cache_hosts: Vec<String>,
    pub keep_alive: bool,
    pub verify_tls: bool,
    /// Client version advertised in the User-Agent. Unset means server mode.
    pub client_version: Option<String>,
    pub backend_url: String,
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_unit_ms: 1_000,
            concurrency_limit: 0,
            credential_renew_secs: 600,
            credential_grace_secs: 600,
            http_timeout_secs: 0,
            dns_cache: false,
            dns_cache_ttl_secs: 300,
            dns_cache_hosts: vec![String::from("cmsweb"), String::from("cms-rucio.cern.ch")],
            keep_alive: false,
            verify_tls: true,
            client_version: None,
            backend_url: String::from(DEFAULT_BACKEND_URL),
            auth: AuthConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the file named by `DASGATE_CONFIG` (if set), then
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_path(Path::new(&path))?,
            _ => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            origin: String::from("<inline>"),
            source,
        })
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    /// Applies credential overrides from `lookup`. Empty values are ignored.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value_of = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(proxy) = value_of(USER_PROXY_ENV) {
            self.auth.user_proxy = Some(PathBuf::from(proxy));
        }
        if let Some(cert) = value_of(USER_CERT_ENV) {
            self.auth.user_cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = value_of(USER_KEY_ENV) {
            self.auth.user_key = Some(PathBuf::from(key));
        }
        if let Some(token) = value_of(TOKEN_ENV) {
            self.auth.token = Some(token);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "backend_url",
                reason: String::from("must not be empty"),
            });
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "backend_url",
                reason: format!("'{}' is not an http(s) url", self.backend_url),
            });
        }
        if self.retry_unit_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "retry_unit_ms",
                reason: String::from("must be greater than zero"),
            });
        }
        if self.dns_cache && self.dns_cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "dns_cache_ttl_secs",
                reason: String::from("must be greater than zero when the dns cache is enabled"),
            });
        }
        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::linear(self.retry_count, Duration::from_millis(self.retry_unit_ms))
    }

    pub fn http_timeout(&self) -> Option<Duration> {
        (self.http_timeout_secs > 0).then(|| Duration::from_secs(self.http_timeout_secs))
    }

    pub fn credential_renew_interval(&self) -> Duration {
        Duration::from_secs(self.credential_renew_secs)
    }

    pub fn credential_grace(&self) -> Duration {
        Duration::from_secs(self.credential_grace_secs)
    }

    pub fn dns_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_cache_ttl_secs)
    }

    pub fn user_agent(&self) -> String {
        match &self.client_version {
            Some(version) => format!("dasgate/{version}"),
            None => String::from("dasgate-server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.retry().max_retries, 3);
        assert_eq!(config.http_timeout(), None);
        assert_eq!(config.user_agent(), "dasgate-server");
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"concurrency_limit": 8, "http_timeout_secs": 30, "auth": {{"token": "abc"}}}}"#
        )
        .expect("write config");

        let config = GatewayConfig::from_path(file.path()).expect("config parses");

        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.http_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.auth.token.as_deref(), Some("abc"));
        assert!(config.auth.probe_user_proxy);
        assert_eq!(config.retry_count, 3);
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let error = GatewayConfig::from_json_str("{not json").expect_err("must fail");

        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_replace_credential_paths() {
        let vars = HashMap::from([
            (USER_PROXY_ENV, "/tmp/proxy.pem"),
            (USER_CERT_ENV, ""),
            (TOKEN_ENV, "secret"),
        ]);
        let mut base = GatewayConfig::default();
        base.auth.user_cert = Some(PathBuf::from("/home/user/.globus/usercert.pem"));

        let config = base.with_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.auth.user_proxy, Some(PathBuf::from("/tmp/proxy.pem")));
        assert_eq!(
            config.auth.user_cert,
            Some(PathBuf::from("/home/user/.globus/usercert.pem"))
        );
        assert_eq!(config.auth.token.as_deref(), Some("secret"));
    }

    #[test]
    fn validate_rejects_zero_retry_unit_and_bad_backend() {
        let config = GatewayConfig {
            retry_unit_ms: 0,
            ..GatewayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "retry_unit_ms", .. })
        ));

        let config = GatewayConfig {
            backend_url: String::from("ftp://cmsweb.test"),
            ..GatewayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "backend_url", .. })
        ));
    }

    #[test]
    fn client_version_selects_client_user_agent() {
        let config = GatewayConfig {
            client_version: Some(String::from("1.2.3")),
            ..GatewayConfig::default()
        };

        assert_eq!(config.user_agent(), "dasgate/1.2.3");
    }
}
