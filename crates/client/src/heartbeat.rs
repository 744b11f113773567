//! Liveness pings.

use tracing::{debug, warn};

use seer_core::{Endpoint, HeartbeatPayload, Metadata};
use seer_delivery::RecordId;

use crate::client::Seer;

/// Where a heartbeat ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    /// Delivery failed. Holds the spool record, or `None` if spooling failed too.
    Spooled(Option<RecordId>),
}

impl Dispatch {
    pub fn is_sent(&self) -> bool {
        matches!(self, Dispatch::Sent)
    }
}

impl Seer {
    /// Send one heartbeat for `job_name`. Never fails: an undeliverable
    /// heartbeat is spooled.
    pub fn heartbeat(&self, job_name: &str, metadata: Option<Metadata>) -> Dispatch {
        let payload = HeartbeatPayload::new(job_name, metadata).to_value();

        match self.send(Endpoint::Heartbeat, &payload) {
            Ok(_) => {
                debug!(job = job_name, "heartbeat sent");
                Dispatch::Sent
            }
            Err(err) => {
                warn!(job = job_name, error = %err, "heartbeat not delivered, spooling");
                Dispatch::Spooled(self.spool().save(&payload, Endpoint::Heartbeat))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use seer_delivery::{FileSpool, InMemorySpool, Spool};

    use crate::testing::{self, Step};

    use super::*;

    #[test]
    fn delivered_heartbeat_is_not_spooled() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, transport) = testing::seer(vec![Step::Respond(200, "")], spool.clone());

        let mut metadata = Metadata::new();
        metadata.insert("host".into(), json!("worker-3"));
        assert!(seer.heartbeat("pinger", Some(metadata)).is_sent());

        assert!(spool.is_empty());
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://seer.test/heartbeat");
        assert_eq!(requests[0].body["job_name"], json!("pinger"));
        assert_eq!(requests[0].body["metadata"], json!({"host": "worker-3"}));
        assert!(requests[0].body["current_time"].is_string());
    }

    #[test]
    fn unreachable_service_spools_a_heartbeat_record() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Arc::new(FileSpool::new(tmp.path()));
        let (seer, transport) = testing::seer(vec![Step::Fail("no route to host")], spool.clone());

        let dispatch = seer.heartbeat("pinger", None);

        let Dispatch::Spooled(Some(id)) = dispatch.clone() else {
            panic!("expected a spooled heartbeat, got {dispatch:?}");
        };
        assert_eq!(id.endpoint_tag(), "heartbeat");
        assert_eq!(transport.requests().len(), 2);

        let (payload, tag) = spool.load(&id).unwrap();
        assert_eq!(tag, "heartbeat");
        assert_eq!(payload["job_name"], json!("pinger"));
        assert!(payload["metadata"].is_null());
    }

    #[test]
    fn rejected_heartbeat_is_spooled_too() {
        let spool = Arc::new(InMemorySpool::new());
        let (seer, _) = testing::seer(vec![Step::Respond(401, "bad key")], spool.clone());

        assert!(!seer.heartbeat("pinger", None).is_sent());
        assert_eq!(spool.records()[0].0.endpoint_tag(), "heartbeat");
    }
}
