//! `seer-client`
//!
//! **Responsibility:** the surface a job author touches.
//!
//! - `Seer::monitor` wraps a unit of work in a run session: a registration
//!   event before the work, a completion event after it, optional log capture
//!   in between
//! - `Seer::heartbeat` sends a liveness ping
//! - `Seer::replay_failed` resends whatever the spool holds
//! - `Seer::run_command` monitors a child process
//!
//! Delivery problems never stop the work from running. They are logged, the
//! payload is spooled, and the work's own outcome is what the caller sees.

pub mod client;
pub mod command;
pub mod error;
pub mod heartbeat;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use client::Seer;
pub use command::CommandFailed;
pub use error::{ClientError, MonitorError, RegistrationError};
pub use heartbeat::Dispatch;
pub use session::{MonitorOptions, RunContext, RunSession, RunState};

pub use seer_core::{ClientConfig, Credentials, Metadata, RunId, RunStatus};
pub use seer_delivery::ReplaySummary;
