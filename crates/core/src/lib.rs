//! `seer-core` — shared data model for the Seer monitoring client.
//!
//! This crate contains the wire payloads, endpoint routing, credentials and
//! configuration used by the delivery and client crates. It performs no I/O.

pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod id;
pub mod payload;
pub mod retry;

pub use config::{ClientConfig, ConfigError};
pub use credentials::{AuthScheme, Credentials};
pub use endpoint::Endpoint;
pub use error::{DeliveryError, DeliveryResult};
pub use id::RunId;
pub use payload::{
    HeartbeatPayload, Metadata, MonitoringPayload, RunStatus, format_timestamp, timestamp_now,
};
pub use retry::RetryPolicy;
