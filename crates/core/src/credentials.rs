//! API key handling and request headers.

use serde::{Deserialize, Serialize};

/// Which header carries the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: <api_key>`
    #[default]
    Authorization,
    /// `auth: <api_key>`, accepted by older deployments.
    Legacy,
}

impl AuthScheme {
    pub fn header_name(&self) -> &'static str {
        match self {
            AuthScheme::Authorization => "Authorization",
            AuthScheme::Legacy => "auth",
        }
    }
}

/// The single API key used for every request and for replay.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    api_key: String,
    #[serde(default)]
    scheme: AuthScheme,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            scheme: AuthScheme::default(),
        }
    }

    pub fn with_scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// Headers sent with every payload.
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            (self.scheme.header_name().to_string(), self.api_key.clone()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }
}

// Keep the key out of logs.
impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("scheme", &self.scheme)
            .finish()
    }
}
