//! `seer-delivery`
//!
//! **Responsibility:** getting event payloads to the monitoring service, or
//! keeping them on disk until they can be.
//!
//! This crate provides:
//! - `BackoffSender`: HTTP POST with bounded exponential backoff
//! - `Spool`: durable storage for payloads whose delivery was exhausted
//! - `Replayer`: drains the spool back through the sender
//!
//! Everything here is synchronous; backoff sleeps block the calling thread.

pub mod replay;
pub mod sender;
pub mod spool;
pub mod transport;

pub use replay::{ReplaySummary, Replayer};
pub use sender::{BackoffSender, Sleeper, ThreadSleeper};
pub use spool::{FileSpool, InMemorySpool, RecordId, Spool, SpoolError};
pub use transport::{HttpResponse, HttpTransport, Transport, TransportError};
