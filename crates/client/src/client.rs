//! The `Seer` client handle.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use seer_core::{ClientConfig, DeliveryError, Endpoint};
use seer_delivery::{
    BackoffSender, FileSpool, HttpResponse, HttpTransport, ReplaySummary, Replayer, Sleeper, Spool,
    ThreadSleeper, Transport,
};

use crate::error::{ClientError, MonitorError};
use crate::session::{MonitorOptions, RunSession};

type Sender = BackoffSender<Arc<dyn Transport>, Arc<dyn Sleeper>>;

/// Monitoring client.
///
/// Holds the configuration, one HTTP client reused for every request, and the
/// spool that catches undeliverable payloads. Cheap to share by reference
/// across threads.
pub struct Seer {
    config: ClientConfig,
    sender: Sender,
    spool: Arc<dyn Spool>,
}

impl Seer {
    /// Build a client that talks HTTP and spools to disk.
    ///
    /// The spool lives in `config.spool_dir`, or in the per-user data
    /// directory when that is unset.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(config.request_timeout)?;
        let spool = match &config.spool_dir {
            Some(dir) => FileSpool::new(dir),
            None => FileSpool::open_default()?,
        };
        info!(base_url = %config.base_url, spool_dir = %spool.dir().display(), "seer client ready");
        Ok(Self::with_parts(config, Arc::new(transport), Arc::new(spool)))
    }

    /// Build a client from `SEER_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Build a client from explicit parts.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        spool: Arc<dyn Spool>,
    ) -> Self {
        let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
        let sender = BackoffSender::new(transport, config.retry).with_sleeper(sleeper);
        Self {
            config,
            sender,
            spool,
        }
    }

    /// Replace how backoff delays are waited out.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sender = self.sender.with_sleeper(sleeper);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn spool(&self) -> &dyn Spool {
        self.spool.as_ref()
    }

    /// Start a run session for `job_name` without running anything yet.
    pub fn session(&self, job_name: &str, options: MonitorOptions) -> RunSession<'_> {
        RunSession::new(self, job_name, options)
    }

    /// Run `work` as a monitored run of `job_name`.
    ///
    /// The work runs whether or not registration succeeds. Its result is
    /// returned as is on success; on failure it comes back through
    /// [`MonitorError::Work`]. A panic in `work` is reported as a failed run
    /// and then resumed.
    pub fn monitor<T, E, F>(
        &self,
        job_name: &str,
        options: MonitorOptions,
        work: F,
    ) -> Result<T, MonitorError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + fmt::Debug,
    {
        let mut session = self.session(job_name, options);
        let outcome = session.execute(work);
        let delivery = session.complete();

        match (outcome, delivery) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(MonitorError::Delivery(err)),
            (Err(error), delivery) => Err(MonitorError::Work {
                error,
                delivery: delivery.err(),
            }),
        }
    }

    /// Resend every spooled payload with this client's credentials.
    pub fn replay_failed(&self) -> ReplaySummary {
        Replayer::new(&self.sender, self.spool.as_ref(), &self.config.base_url)
            .replay_all(&self.config.credentials)
    }

    pub(crate) fn send(
        &self,
        endpoint: Endpoint,
        payload: &Value,
    ) -> Result<HttpResponse, DeliveryError> {
        self.sender.send(
            &endpoint.url(&self.config.base_url),
            payload,
            &self.config.credentials.headers(),
        )
    }
}

impl fmt::Debug for Seer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seer")
            .field("config", &self.config)
            .field("retry", self.sender.policy())
            .finish_non_exhaustive()
    }
}
