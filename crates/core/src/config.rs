//! Client configuration and the process-wide API key slot.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;

use crate::credentials::{AuthScheme, Credentials};
use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.ansrstudio.com";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);
/// Captured output beyond this many bytes is trimmed from the front.
pub const DEFAULT_MAX_LOG_BYTES: usize = 200_000;

pub const ENV_API_KEY: &str = "SEER_API_KEY";
pub const ENV_BASE_URL: &str = "SEER_BASE_URL";
pub const ENV_SPOOL_DIR: &str = "SEER_SPOOL_DIR";
pub const ENV_AUTH_SCHEME: &str = "SEER_AUTH_SCHEME";

static API_KEY: RwLock<Option<String>> = RwLock::new(None);

/// Store the API key for the whole process.
pub fn init(api_key: impl Into<String>) {
    let mut slot = API_KEY.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(api_key.into());
}

/// The key stored by [`init`], if any.
pub fn api_key() -> Option<String> {
    API_KEY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SEER_API_KEY not set and no API key was initialized")]
    MissingApiKey,

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Everything a client needs to deliver events.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub credentials: Credentials,
    /// Spool directory; `None` resolves to the per-user data directory.
    pub spool_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub max_log_bytes: usize,
}

impl ClientConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials,
            spool_dir: None,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_log_bytes(mut self, max: usize) -> Self {
        self.max_log_bytes = max;
        self
    }

    /// Build from `SEER_*` environment variables.
    ///
    /// The API key falls back to the one stored with [`init`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let key = non_empty(ENV_API_KEY)
            .or_else(api_key)
            .ok_or(ConfigError::MissingApiKey)?;

        let scheme = match non_empty(ENV_AUTH_SCHEME).as_deref() {
            None | Some("authorization") => AuthScheme::Authorization,
            Some("legacy") | Some("auth") => AuthScheme::Legacy,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: ENV_AUTH_SCHEME,
                    value: other.to_string(),
                });
            }
        };

        let mut config = Self::new(Credentials::new(key).with_scheme(scheme));
        if let Some(base_url) = non_empty(ENV_BASE_URL) {
            config = config.with_base_url(base_url);
        }
        if let Some(dir) = non_empty(ENV_SPOOL_DIR) {
            config = config.with_spool_dir(dir);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_API_KEY, "key-1"),
            (ENV_BASE_URL, "http://localhost:9000"),
            (ENV_SPOOL_DIR, "/tmp/seer-spool"),
            (ENV_AUTH_SCHEME, "legacy"),
        ]))
        .unwrap();

        assert_eq!(config.credentials.api_key(), "key-1");
        assert_eq!(config.credentials.scheme(), AuthScheme::Legacy);
        assert_eq!(config.base_url, "http://localhost:9000");
        assert_eq!(config.spool_dir, Some(PathBuf::from("/tmp/seer-spool")));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn unknown_auth_scheme_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[
            (ENV_API_KEY, "key-1"),
            (ENV_AUTH_SCHEME, "bearer"),
        ]))
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { name: ENV_AUTH_SCHEME, .. }));
    }

    #[test]
    fn global_key_is_the_fallback() {
        init("global-key");

        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.credentials.api_key(), "global-key");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }
}
