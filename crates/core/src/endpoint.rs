//! Remote routes exposed by the monitoring service.

use serde::{Deserialize, Serialize};

/// A route on the monitoring service that accepts event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// Run registration and completion events.
    Monitoring,
    /// Liveness pings.
    Heartbeat,
}

impl Endpoint {
    pub const ALL: [Endpoint; 2] = [Endpoint::Monitoring, Endpoint::Heartbeat];

    /// Short tag used in spool record names.
    pub fn tag(&self) -> &'static str {
        match self {
            Endpoint::Monitoring => "monitoring",
            Endpoint::Heartbeat => "heartbeat",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Monitoring => "/monitoring",
            Endpoint::Heartbeat => "/heartbeat",
        }
    }

    /// Resolve a spool tag back to a route. Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.tag() == tag)
    }

    /// Absolute URL of this route under `base_url`.
    pub fn url(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.path())
    }
}

impl core::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.tag())
    }
}
