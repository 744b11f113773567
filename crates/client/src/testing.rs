//! Test doubles shared by the unit tests in this crate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use seer_core::{ClientConfig, Credentials, RetryPolicy};
use seer_delivery::{HttpResponse, Sleeper, Spool, Transport, TransportError};

use crate::client::Seer;

/// Registration response as the service sends it: a JSON string holding a JSON object.
pub const REGISTERED: &str = r#""{\"run_id\": \"abc123\"}""#;

#[derive(Debug, Clone)]
pub enum Step {
    Respond(u16, &'static str),
    Fail(&'static str),
}

/// A successful registration followed by an accepted completion.
pub fn registered_then_ok() -> Vec<Step> {
    vec![Step::Respond(200, REGISTERED), Step::Respond(200, "")]
}

#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

/// Plays back one step per request; the last step repeats.
#[derive(Debug, Default)]
pub struct MockTransport {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(Request {
            url: url.to_string(),
            body: body.clone(),
            headers: headers.to_vec(),
        });

        let step = match self.steps.lock().unwrap().pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = Some(step.clone());
                step
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Step::Fail("no response scripted")),
        };

        match step {
            Step::Respond(status, body) => Ok(HttpResponse::new(status, body)),
            Step::Fail(message) => Err(TransportError::new(message)),
        }
    }
}

pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _delay: Duration) {}
}

pub fn config() -> ClientConfig {
    ClientConfig::new(Credentials::new("test-key"))
        .with_base_url("http://seer.test")
        .with_retry(RetryPolicy::exponential(2, Duration::from_millis(1), Duration::from_millis(1)))
}

pub fn seer(steps: Vec<Step>, spool: Arc<dyn Spool>) -> (Seer, Arc<MockTransport>) {
    seer_with(config(), steps, spool)
}

pub fn seer_with(
    config: ClientConfig,
    steps: Vec<Step>,
    spool: Arc<dyn Spool>,
) -> (Seer, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new(steps));
    let seer = Seer::with_parts(config, transport.clone(), spool).with_sleeper(Arc::new(NoSleep));
    (seer, transport)
}

static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// Captures are process-wide; tests that capture hold this.
pub fn capture_lock() -> MutexGuard<'static, ()> {
    CAPTURE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
