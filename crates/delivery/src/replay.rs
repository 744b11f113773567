//! Resend spooled payloads.

use tracing::{debug, info, warn};

use seer_core::{Credentials, Endpoint};

use crate::sender::{BackoffSender, Sleeper};
use crate::spool::{Spool, SpoolError};
use crate::transport::Transport;

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Resent and removed from the spool.
    pub delivered: usize,
    /// Still undeliverable or unreadable; left for the next pass.
    pub failed: usize,
    /// Endpoint tag unknown to this version; left in place.
    pub skipped: usize,
}

impl ReplaySummary {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Drains a spool through a sender.
///
/// Records are visited in spool order, not event order. A failing record never
/// stops the pass. Records whose endpoint tag is not recognized are kept, so a
/// newer client can still deliver them.
pub struct Replayer<'a, T, S> {
    sender: &'a BackoffSender<T, S>,
    spool: &'a dyn Spool,
    base_url: &'a str,
}

impl<'a, T: Transport, S: Sleeper> Replayer<'a, T, S> {
    pub fn new(sender: &'a BackoffSender<T, S>, spool: &'a dyn Spool, base_url: &'a str) -> Self {
        Self {
            sender,
            spool,
            base_url,
        }
    }

    pub fn replay_all(&self, credentials: &Credentials) -> ReplaySummary {
        let mut summary = ReplaySummary::default();

        let pending = match self.spool.list_pending() {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "unable to list spooled payloads");
                return summary;
            }
        };

        let headers = credentials.headers();

        for id in pending {
            let Some(endpoint) = Endpoint::from_tag(id.endpoint_tag()) else {
                warn!(
                    record = %id,
                    tag = id.endpoint_tag(),
                    "unrecognized endpoint tag, leaving record in place"
                );
                summary.skipped += 1;
                continue;
            };

            let payload = match self.spool.load(&id) {
                Ok((payload, _)) => payload,
                // Another replayer got there first.
                Err(SpoolError::NotFound(_)) => {
                    debug!(record = %id, "record vanished before it was read");
                    continue;
                }
                Err(err) => {
                    warn!(record = %id, error = %err, "unable to read spooled payload");
                    summary.failed += 1;
                    continue;
                }
            };

            match self.sender.send(&endpoint.url(self.base_url), &payload, &headers) {
                Ok(_) => {
                    if let Err(err) = self.spool.delete(&id) {
                        warn!(
                            record = %id,
                            error = %err,
                            "payload resent but record could not be removed"
                        );
                    }
                    info!(record = %id, endpoint = %endpoint, "spooled payload delivered");
                    summary.delivered += 1;
                }
                Err(err) => {
                    warn!(record = %id, error = %err, "spooled payload still undeliverable");
                    summary.failed += 1;
                }
            }
        }

        info!(
            delivered = summary.delivered,
            failed = summary.failed,
            skipped = summary.skipped,
            "replay pass finished"
        );
        summary
    }
}
