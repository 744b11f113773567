use thiserror::Error;

use seer_core::{ConfigError, DeliveryError};
use seer_delivery::{SpoolError, TransportError};

/// A client could not be constructed.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client could not be built: {0}")]
    Transport(#[from] TransportError),

    #[error("spool unavailable: {0}")]
    Spool(#[from] SpoolError),
}

/// Registration did not yield a run id.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("registration response carried no run_id: {body}")]
    MissingRunId { body: String },

    #[error("registration response could not be decoded: {message}")]
    InvalidResponse { message: String },

    #[error("run was not registered")]
    NotRegistered,
}

/// Outcome of a monitored run that did not end in success.
///
/// The work's own error always wins: when both the work and the completion
/// delivery fail, the delivery failure rides along in `delivery`.
#[derive(Debug, Error)]
pub enum MonitorError<E> {
    #[error("monitored work failed: {error}")]
    Work {
        error: E,
        #[source]
        delivery: Option<DeliveryError>,
    },

    #[error("work succeeded but its completion was not delivered: {0}")]
    Delivery(DeliveryError),
}

impl<E> MonitorError<E> {
    pub fn work_error(&self) -> Option<&E> {
        match self {
            MonitorError::Work { error, .. } => Some(error),
            MonitorError::Delivery(_) => None,
        }
    }

    /// Give back the work's error unchanged.
    pub fn into_work_error(self) -> Option<E> {
        match self {
            MonitorError::Work { error, .. } => Some(error),
            MonitorError::Delivery(_) => None,
        }
    }

    pub fn delivery_error(&self) -> Option<&DeliveryError> {
        match self {
            MonitorError::Work { delivery, .. } => delivery.as_ref(),
            MonitorError::Delivery(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn work_error_takes_precedence_and_keeps_delivery_as_source() {
        let err: MonitorError<String> = MonitorError::Work {
            error: "disk full".into(),
            delivery: Some(DeliveryError::transport(
                "http://svc/monitoring",
                5,
                "connection refused",
            )),
        };

        assert_eq!(err.to_string(), "monitored work failed: disk full");
        assert!(err.source().is_some());
        assert_eq!(err.delivery_error().map(DeliveryError::attempts), Some(5));
        assert_eq!(err.into_work_error().as_deref(), Some("disk full"));
    }

    #[test]
    fn delivery_only_failure_has_no_work_error() {
        let err: MonitorError<String> =
            MonitorError::Delivery(DeliveryError::http_status(
                "http://svc/monitoring",
                1,
                503,
                "down",
            ));

        assert!(err.work_error().is_none());
        assert_eq!(err.delivery_error().and_then(DeliveryError::status), Some(503));
    }
}
