//! One monitored run, from registration to completion.
//!
//! ```text
//! Idle -> Registering -> Running ------> Completing -> Completed
//!                    \                              \-> Failed
//!                     \-> Unregistered
//! ```
//!
//! A run that could not register still executes its work; it just never
//! sends a completion. Every payload that cannot be delivered is spooled.

use std::any::{Any, type_name};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use seer_core::{
    DeliveryError, Endpoint, Metadata, MonitoringPayload, RunId, RunStatus, timestamp_now,
};
use seer_observability::capture::{self, CaptureGuard};

use crate::client::Seer;
use crate::error::RegistrationError;

/// Per-run options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorOptions {
    /// Capture stdout, stderr and log output produced while the work runs
    /// and send it with the completion.
    pub capture_logs: bool,
    pub metadata: Option<Metadata>,
    /// Sent unchanged with both the registration and the completion.
    pub tags: Option<Value>,
}

impl MonitorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_logs(mut self, capture_logs: bool) -> Self {
        self.capture_logs = capture_logs;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tags(mut self, tags: Value) -> Self {
        self.tags = Some(tags);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Registering,
    Running,
    /// Registration failed; the work runs without monitoring.
    Unregistered,
    Completing,
    Completed,
    /// The completion could not be delivered and was spooled.
    Failed,
}

/// What is known about a run so far.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub job_name: String,
    pub metadata: Option<Metadata>,
    pub tags: Option<Value>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: RunStatus,
    pub error_details: Option<String>,
    pub run_id: Option<RunId>,
    pub logs: Option<String>,
}

pub struct RunSession<'a> {
    seer: &'a Seer,
    capture_logs: bool,
    context: RunContext,
    state: RunState,
    capture: Option<CaptureGuard>,
    work_finished: bool,
    /// Registration payload whose spooling failed; retried at completion.
    unsaved_registration: Option<Value>,
}

impl<'a> RunSession<'a> {
    pub fn new(seer: &'a Seer, job_name: &str, options: MonitorOptions) -> Self {
        Self {
            seer,
            capture_logs: options.capture_logs,
            context: RunContext {
                job_name: job_name.to_string(),
                metadata: options.metadata,
                tags: options.tags,
                start_time: timestamp_now(),
                end_time: None,
                status: RunStatus::Running,
                error_details: None,
                run_id: None,
                logs: None,
            },
            state: RunState::Idle,
            capture: None,
            work_finished: false,
            unsaved_registration: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.context.run_id.as_ref()
    }

    /// Send the registration event.
    ///
    /// On failure the registration payload is spooled and the session moves
    /// to [`RunState::Unregistered`]. Log capture, when requested, starts
    /// once registration has resolved either way.
    pub fn register(&mut self) -> Result<RunId, RegistrationError> {
        if self.state != RunState::Idle {
            return self
                .context
                .run_id
                .clone()
                .ok_or(RegistrationError::NotRegistered);
        }
        self.state = RunState::Registering;

        let payload = MonitoringPayload::registration(
            &self.context.job_name,
            &self.context.start_time,
            self.context.metadata.clone(),
        )
        .with_tags(self.context.tags.clone())
        .to_value();

        let outcome = self
            .seer
            .send(Endpoint::Monitoring, &payload)
            .map_err(RegistrationError::from)
            .and_then(|response| parse_run_id(&response.body));

        match &outcome {
            Ok(run_id) => {
                info!(
                    job = %self.context.job_name,
                    run_id = %run_id,
                    "connected to seer, run registered"
                );
                self.context.run_id = Some(run_id.clone());
                self.state = RunState::Running;
            }
            Err(err) => {
                warn!(
                    job = %self.context.job_name,
                    error = %err,
                    "seer unable to start, running unmonitored"
                );
                self.state = RunState::Unregistered;
                if self.seer.spool().save(&payload, Endpoint::Monitoring).is_none() {
                    self.unsaved_registration = Some(payload);
                }
            }
        }

        if self.capture_logs {
            self.capture = Some(CaptureGuard::begin_with_stdio());
            debug!(job = %self.context.job_name, "capturing logs");
        }

        outcome
    }

    /// Run the work, registering first if that has not happened yet.
    ///
    /// The result is handed back untouched. A panic is recorded as a failed
    /// run, the completion is sent, and the panic resumes.
    pub fn execute<T, E, F>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + fmt::Debug,
    {
        if self.state == RunState::Idle {
            // A failed registration is already logged and spooled.
            let _ = self.register();
        }

        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => {
                self.finish(None);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.finish(Some(describe_error(&err)));
                Err(err)
            }
            Err(payload) => {
                self.finish(Some(describe_panic(payload.as_ref())));
                // Undeliverable completions are spooled inside `complete`.
                let _ = self.complete();
                panic::resume_unwind(payload)
            }
        }
    }

    /// Send the completion event for a registered run.
    ///
    /// Does nothing for an unregistered run or one whose work has not
    /// finished. On delivery failure the payload is spooled and the error
    /// returned.
    pub fn complete(&mut self) -> Result<(), DeliveryError> {
        match self.state {
            RunState::Completing => {}
            RunState::Unregistered => {
                if let Some(payload) = self.unsaved_registration.take() {
                    self.seer.spool().save(&payload, Endpoint::Monitoring);
                }
                return Ok(());
            }
            state => {
                debug!(job = %self.context.job_name, ?state, "nothing to complete");
                return Ok(());
            }
        }

        let Some(run_id) = self.context.run_id.as_ref() else {
            return Ok(());
        };
        let ctx = &self.context;
        let payload = MonitoringPayload::completion(
            &ctx.job_name,
            ctx.status,
            run_id,
            &ctx.start_time,
            ctx.end_time.clone().unwrap_or_else(timestamp_now),
            ctx.metadata.clone(),
            ctx.error_details.clone(),
            ctx.logs.clone(),
        )
        .with_tags(ctx.tags.clone())
        .to_value();

        match self.seer.send(Endpoint::Monitoring, &payload) {
            Ok(_) => {
                info!(
                    job = %ctx.job_name,
                    run_id = %run_id,
                    status = ctx.status.as_str(),
                    "monitoring complete"
                );
                self.state = RunState::Completed;
                Ok(())
            }
            Err(err) => {
                error!(
                    job = %ctx.job_name,
                    run_id = %run_id,
                    error = %err,
                    "completion not delivered, spooling"
                );
                self.seer.spool().save(&payload, Endpoint::Monitoring);
                self.state = RunState::Failed;
                Err(err)
            }
        }
    }

    /// Record the work's outcome. Capture is released before `end_time` is taken.
    fn finish(&mut self, error_details: Option<String>) {
        if self.work_finished {
            return;
        }
        self.work_finished = true;

        if let Some(guard) = self.capture.take() {
            let max_bytes = self.seer.config().max_log_bytes;
            self.context.logs = Some(capture::truncate_tail(guard.finish(), max_bytes));
        }
        self.context.end_time = Some(timestamp_now());
        self.context.status = match error_details {
            Some(_) => RunStatus::Failed,
            None => RunStatus::Success,
        };
        self.context.error_details = error_details;

        if self.state == RunState::Running {
            self.state = RunState::Completing;
        }
    }
}

impl fmt::Debug for RunSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSession")
            .field("state", &self.state)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Pull the run id out of a registration response.
///
/// The service encodes its JSON object as a JSON string, so the body is
/// decoded twice. A plain object is accepted as well.
pub(crate) fn parse_run_id(body: &str) -> Result<RunId, RegistrationError> {
    let invalid = |err: serde_json::Error| RegistrationError::InvalidResponse {
        message: err.to_string(),
    };

    let decoded = match serde_json::from_str::<Value>(body).map_err(invalid)? {
        Value::String(inner) => serde_json::from_str::<Value>(&inner).map_err(invalid)?,
        other => other,
    };

    let run_id = match decoded.get("run_id") {
        Some(Value::String(id)) => RunId::parse(id),
        Some(Value::Number(id)) => RunId::parse(&id.to_string()),
        _ => None,
    };
    run_id.ok_or_else(|| RegistrationError::MissingRunId {
        body: body.to_string(),
    })
}

fn describe_error<E: fmt::Display + fmt::Debug>(err: &E) -> String {
    with_backtrace(format!("{}: {}\n{:?}", type_name::<E>(), err, err))
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    let message = match payload.downcast_ref::<&str>() {
        Some(message) => *message,
        None => match payload.downcast_ref::<String>() {
            Some(message) => message.as_str(),
            None => "non-string panic payload",
        },
    };
    with_backtrace(format!("panic: {message}"))
}

/// Append the stack at the point the outcome was recorded. For a panic that
/// is the frame that caught it, below the monitored call.
fn with_backtrace(mut details: String) -> String {
    let backtrace = Backtrace::force_capture();
    if backtrace.status() == BacktraceStatus::Captured {
        details.push_str("\n\nstack backtrace:\n");
        details.push_str(&backtrace.to_string());
    }
    details
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;
    use tracing_subscriber::prelude::*;

    use seer_delivery::{FileSpool, InMemorySpool, Spool};

    use super::*;
    use crate::error::MonitorError;
    use crate::testing::{self, REGISTERED, Step, registered_then_ok};

    #[test]
    fn run_id_is_double_decoded() {
        assert_eq!(parse_run_id(REGISTERED).unwrap().as_str(), "abc123");
        assert_eq!(parse_run_id(r#"{"run_id": "plain"}"#).unwrap().as_str(), "plain");
        assert_eq!(parse_run_id(r#""{\"run_id\": 42}""#).unwrap().as_str(), "42");
    }

    #[test]
    fn missing_or_blank_run_id_is_rejected() {
        assert!(matches!(parse_run_id(r#""{}""#), Err(RegistrationError::MissingRunId { .. })));
        assert!(matches!(
            parse_run_id(r#""{\"run_id\": \"  \"}""#),
            Err(RegistrationError::MissingRunId { .. })
        ));
        assert!(matches!(parse_run_id(""), Err(RegistrationError::InvalidResponse { .. })));
        assert!(matches!(
            parse_run_id(r#""not json""#),
            Err(RegistrationError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn registered_run_walks_every_state() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        let mut session = seer.session("nightly", MonitorOptions::new());
        assert_eq!(session.state(), RunState::Idle);

        let run_id = session.register().unwrap();
        assert_eq!(run_id.as_str(), "abc123");
        assert_eq!(session.state(), RunState::Running);

        let value: Result<u32, String> = session.execute(|| Ok(3));
        assert_eq!(value, Ok(3));
        assert_eq!(session.state(), RunState::Completing);
        assert_eq!(session.context().status, RunStatus::Success);
        assert!(session.context().end_time.is_some());

        session.complete().unwrap();
        assert_eq!(session.state(), RunState::Completed);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].body["status"], json!("running"));
        assert_eq!(requests[0].body["run_id"], json!(""));
        assert_eq!(requests[1].body["status"], json!("success"));
        assert_eq!(requests[1].body["run_id"], json!("abc123"));
        assert!(requests[1].body["error_details"].is_null());
    }

    #[test]
    fn failing_work_is_reported_and_returned() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) =
            testing::seer(registered_then_ok(), spool.clone());

        let result: Result<(), MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new(), || Err("boom".to_string()));

        let err = result.unwrap_err();
        assert!(err.delivery_error().is_none());
        assert_eq!(err.into_work_error().as_deref(), Some("boom"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let completion = &requests[1].body;
        assert_eq!(completion["status"], json!("failed"));
        assert_eq!(completion["run_id"], json!("abc123"));
        let details = completion["error_details"].as_str().unwrap();
        assert!(details.starts_with("alloc::string::String: boom"));
        assert!(details.contains("stack backtrace:"));
        assert!(spool.is_empty());
    }

    #[test]
    fn unregistered_run_still_executes_and_spools_registration() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(vec![Step::Respond(200, r#""{}""#)], spool.clone());
        let ran = AtomicBool::new(false);

        let result: Result<&str, MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new(), || {
                ran.store(true, Ordering::SeqCst);
                Ok("done")
            });

        assert_eq!(result.unwrap(), "done");
        assert!(ran.load(Ordering::SeqCst));
        // No completion for an unregistered run.
        assert_eq!(transport.requests().len(), 1);

        let records = spool.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0.endpoint_tag(), "monitoring");
        assert_eq!(records[0].1["status"], json!("running"));
        assert_eq!(records[0].1["job_name"], json!("nightly"));
    }

    #[test]
    fn unreachable_service_retries_then_runs_unmonitored() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Arc::new(FileSpool::new(tmp.path()));
        let (seer, transport) =
            testing::seer(vec![Step::Fail("connection refused")], spool.clone());

        let mut session = seer.session("nightly", MonitorOptions::new());
        let err = session.register().unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Delivery(DeliveryError::Transport { attempts: 2, .. })
        ));
        assert_eq!(session.state(), RunState::Unregistered);

        let value: Result<i32, String> = session.execute(|| Ok(1));
        assert_eq!(value, Ok(1));
        session.complete().unwrap();
        assert_eq!(session.state(), RunState::Unregistered);

        assert_eq!(transport.requests().len(), 2);
        let pending: Vec<_> = spool.list_pending().unwrap().collect();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].as_str().starts_with("monitoring_"));
    }

    #[test]
    fn undeliverable_completion_is_spooled_and_surfaced() {
        let spool = Arc::new(InMemorySpool::new());
        let steps = vec![Step::Respond(200, REGISTERED), Step::Respond(503, "down")];
        let (seer, _) = testing::seer(steps, spool.clone());

        let result: Result<u8, MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new(), || Ok(1));

        match result.unwrap_err() {
            MonitorError::Delivery(err) => assert_eq!(err.status(), Some(503)),
            other => panic!("unexpected: {other:?}"),
        }
        let records = spool.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1["run_id"], json!("abc123"));
        assert_eq!(records[0].1["status"], json!("success"));
    }

    #[test]
    fn work_error_wins_over_completion_failure() {
        let spool = Arc::new(InMemorySpool::new());
        let steps = vec![Step::Respond(200, REGISTERED), Step::Fail("reset")];
        let (seer, _) = testing::seer(steps, spool.clone());

        let result: Result<(), MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new(), || Err("bad input".to_string()));

        match result.unwrap_err() {
            MonitorError::Work { error, delivery } => {
                assert_eq!(error, "bad input");
                assert!(matches!(delivery, Some(DeliveryError::Transport { .. })));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(spool.len(), 1);
    }

    #[test]
    fn panics_are_reported_then_resumed() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), MonitorError<String>> =
                seer.monitor("nightly", MonitorOptions::new(), || panic!("kaboom"));
        }));

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].body["status"], json!("failed"));
        let details = requests[1].body["error_details"].as_str().unwrap();
        assert!(details.starts_with("panic: kaboom"));
        assert!(details.contains("stack backtrace:"));
    }

    #[test]
    fn captured_output_rides_on_the_completion() {
        let _serial = testing::capture_lock();
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        tracing::info!("before the run");
        let subscriber = tracing_subscriber::registry().with(capture::layer());
        let options = MonitorOptions::new().capture_logs(true);
        let result: Result<(), MonitorError<String>> =
            tracing::subscriber::with_default(subscriber, || {
                seer.monitor("nightly", options, || {
                    tracing::info!(rows = 7, "loaded batch");
                    capture::record("raw line\n");
                    Ok(())
                })
            });
        result.unwrap();

        let logs = transport.requests()[1].body["logs"].as_str().unwrap().to_string();
        assert!(logs.contains("loaded batch"));
        assert!(logs.contains("rows=7"));
        assert!(logs.contains("raw line"));
        assert!(!logs.contains("before the run"));
        assert!(!capture::is_active());
    }

    #[test]
    fn captured_output_keeps_only_the_tail() {
        let _serial = testing::capture_lock();
        let spool = Arc::new(InMemorySpool::new());
        let config = testing::config().with_max_log_bytes(5);
        let (seer, transport) =
            testing::seer_with(config, registered_then_ok(), spool);

        let result: Result<(), MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new().capture_logs(true), || {
                capture::record("0123456789");
                Ok(())
            });
        result.unwrap();

        // Anything the harness writes to stdout meanwhile is captured too.
        let logs = transport.requests()[1].body["logs"].as_str().unwrap().to_string();
        assert!(logs.len() <= 5);
        assert!(!logs.contains("0123"));
    }

    #[test]
    fn stdout_and_stderr_of_the_work_are_captured() {
        let _serial = testing::capture_lock();
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        let result: Result<(), MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new().capture_logs(true), || {
                // Straight to the fds: the test harness intercepts `println!`.
                let mut out = std::io::stdout();
                writeln!(out, "printed by the job").map_err(|e| e.to_string())?;
                out.flush().map_err(|e| e.to_string())?;
                writeln!(std::io::stderr(), "stderr by the job").map_err(|e| e.to_string())?;
                Ok(())
            });
        result.unwrap();

        let logs = transport.requests()[1].body["logs"].as_str().unwrap().to_string();
        assert!(logs.contains("printed by the job"));
        assert!(logs.contains("stderr by the job"));
        assert!(!capture::stdio_captured());
    }

    #[test]
    fn tags_ride_on_both_events() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        let options = MonitorOptions::new().tags(json!({"team": "data", "tier": 1}));
        let result: Result<(), MonitorError<String>> = seer.monitor("nightly", options, || Ok(()));
        result.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].body["tags"], json!({"team": "data", "tier": 1}));
        assert_eq!(requests[1].body["tags"], requests[0].body["tags"]);
    }

    #[test]
    fn tags_default_to_null() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        let result: Result<(), MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new(), || Ok(()));
        result.unwrap();

        assert!(transport.requests()[0].body["tags"].is_null());
        assert!(transport.requests()[1].body["tags"].is_null());
    }

    #[test]
    fn logs_stay_null_without_capture() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(registered_then_ok(), spool);

        let mut metadata = Metadata::new();
        metadata.insert("owner".into(), json!("etl"));
        let result: Result<(), MonitorError<String>> =
            seer.monitor("nightly", MonitorOptions::new().metadata(metadata), || Ok(()));
        result.unwrap();

        let requests = transport.requests();
        assert!(requests[1].body["logs"].is_null());
        assert_eq!(requests[0].body["metadata"], json!({"owner": "etl"}));
        assert_eq!(requests[1].body["metadata"], json!({"owner": "etl"}));
        assert_eq!(requests[0].body["start_time"], requests[1].body["start_time"]);
    }

    #[test]
    fn second_register_returns_the_first_outcome() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(vec![Step::Respond(200, REGISTERED)], spool);

        let mut session = seer.session("nightly", MonitorOptions::new());
        session.register().unwrap();
        assert_eq!(session.register().unwrap().as_str(), "abc123");
        assert_eq!(transport.requests().len(), 1);
    }
}
