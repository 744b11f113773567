//! POST with bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use seer_core::{DeliveryError, RetryPolicy};

use crate::transport::{HttpResponse, Transport};

/// Waits between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    fn sleep(&self, delay: Duration) {
        (**self).sleep(delay)
    }
}

/// Delivers one payload, retrying failed attempts per its [`RetryPolicy`].
///
/// Transport errors and non-2xx responses are retried alike. Once the budget
/// is spent the last failure is returned; spooling is left to the caller.
#[derive(Debug, Clone)]
pub struct BackoffSender<T, S = ThreadSleeper> {
    transport: T,
    sleeper: S,
    policy: RetryPolicy,
}

impl<T: Transport> BackoffSender<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            sleeper: ThreadSleeper,
            policy,
        }
    }
}

impl<T: Transport, S: Sleeper> BackoffSender<T, S> {
    /// Replace the sleeper (tests use one that records instead of blocking).
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> BackoffSender<T, S2> {
        BackoffSender {
            transport: self.transport,
            sleeper,
            policy: self.policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn send(
        &self,
        url: &str,
        payload: &Value,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, DeliveryError> {
        let mut attempt = 0u32;

        loop {
            let failure = match self.transport.post_json(url, payload, headers) {
                Ok(resp) if resp.is_success() => {
                    if attempt > 0 {
                        info!(url, attempts = attempt + 1, "delivery succeeded after retries");
                    } else {
                        debug!(url, status = resp.status, "delivered");
                    }
                    return Ok(resp);
                }
                Ok(resp) => {
                    warn!(url, status = resp.status, body = %resp.body, "service rejected payload");
                    DeliveryError::http_status(url, attempt + 1, resp.status, resp.body)
                }
                Err(err) => DeliveryError::transport(url, attempt + 1, err.message),
            };

            if !self.policy.should_retry(attempt) {
                error!(url, attempts = attempt + 1, error = %failure, "delivery failed, giving up");
                return Err(failure);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                url,
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "delivery attempt failed, retrying"
            );
            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }
}
