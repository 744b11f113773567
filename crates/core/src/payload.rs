//! Event payloads as they appear on the wire.
//!
//! Every field is serialized, `null`s included, so the service sees the same
//! shape for registration and completion events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::id::RunId;

/// Free-form metadata attached to runs and heartbeats.
pub type Metadata = Map<String, Value>;

/// Lifecycle status reported for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// Payload posted to `/monitoring` for both registration and completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPayload {
    pub job_name: String,
    pub status: RunStatus,
    /// Empty until the service has issued an id.
    pub run_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub metadata: Option<Metadata>,
    pub error_details: Option<String>,
    pub tags: Option<Value>,
    pub logs: Option<String>,
}

impl MonitoringPayload {
    /// The event announcing that a run has started.
    pub fn registration(
        job_name: impl Into<String>,
        start_time: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            status: RunStatus::Running,
            run_id: String::new(),
            start_time: start_time.into(),
            end_time: None,
            metadata,
            error_details: None,
            tags: None,
            logs: None,
        }
    }

    /// The event closing a registered run.
    ///
    /// Requires a [`RunId`]: a completion can only exist for a registered run.
    #[allow(clippy::too_many_arguments)]
    pub fn completion(
        job_name: impl Into<String>,
        status: RunStatus,
        run_id: &RunId,
        start_time: impl Into<String>,
        end_time: impl Into<String>,
        metadata: Option<Metadata>,
        error_details: Option<String>,
        logs: Option<String>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            status,
            run_id: run_id.as_str().to_string(),
            start_time: start_time.into(),
            end_time: Some(end_time.into()),
            metadata,
            error_details,
            tags: None,
            logs,
        }
    }

    /// Attach caller tags. Both events of a run carry the same tags.
    pub fn with_tags(mut self, tags: Option<Value>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_registration(&self) -> bool {
        self.status == RunStatus::Running && self.run_id.is_empty()
    }

    /// JSON body sent to the service and written to the spool.
    pub fn to_value(&self) -> Value {
        json!({
            "job_name": self.job_name,
            "status": self.status,
            "run_id": self.run_id,
            "start_time": self.start_time,
            "end_time": self.end_time,
            "metadata": self.metadata,
            "error_details": self.error_details,
            "tags": self.tags,
            "logs": self.logs,
        })
    }
}

/// Payload posted to `/heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub job_name: String,
    pub current_time: String,
    pub metadata: Option<Metadata>,
}

impl HeartbeatPayload {
    pub fn new(job_name: impl Into<String>, metadata: Option<Metadata>) -> Self {
        Self {
            job_name: job_name.into(),
            current_time: timestamp_now(),
            metadata,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "job_name": self.job_name,
            "current_time": self.current_time,
            "metadata": self.metadata,
        })
    }
}

/// Render a UTC instant the way the service expects:
/// `YYYY-MM-DD HH:MM:SS.ffffff+00:00`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
}

pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}
