//! Tracing, logging and output capture (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init();
}

/// Scoped capture of textual output.
pub mod capture;

/// Subscriber configuration (filters, layers).
pub mod subscriber;

mod stdio;

pub use capture::{CaptureGuard, CaptureLayer, TeeWriter};
