//! Delivery error model.

use thiserror::Error;

/// Result type used by anything that talks to the monitoring service.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Delivery failed after the retry budget was spent.
///
/// Both variants carry the number of attempts made so callers can report it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The request never produced a response (connection, DNS, timeout).
    #[error("could not reach {url} after {attempts} attempt(s): {message}")]
    Transport {
        url: String,
        attempts: u32,
        message: String,
    },

    /// The service answered with a non-2xx status.
    #[error("{url} answered {status} after {attempts} attempt(s)\nResponse body:\n{body}")]
    HttpStatus {
        url: String,
        attempts: u32,
        status: u16,
        body: String,
    },
}

impl DeliveryError {
    pub fn transport(url: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn http_status(
        url: impl Into<String>,
        attempts: u32,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            attempts,
            status,
            body: body.into(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Transport { url, .. } | Self::HttpStatus { url, .. } => url,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transport { attempts, .. } | Self::HttpStatus { attempts, .. } => *attempts,
        }
    }

    /// Status code of the last response, if the service answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_message_includes_body() {
        let err = DeliveryError::http_status("https://x/monitoring", 5, 503, "maintenance");
        let msg = err.to_string();

        assert!(msg.contains("503"));
        assert!(msg.contains("Response body:\nmaintenance"));
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.attempts(), 5);
    }

    #[test]
    fn transport_error_has_no_status() {
        let err = DeliveryError::transport("https://x/heartbeat", 1, "connection refused");

        assert_eq!(err.status(), None);
        assert_eq!(err.url(), "https://x/heartbeat");
    }
}
