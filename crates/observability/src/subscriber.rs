//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::capture;

/// Initialize tracing/logging for the process.
///
/// JSON logs go to stdout, where stdio capture picks them up. Platforms
/// without stdio capture get the events rendered into active captures by
/// [`capture::layer`] instead. Safe to call multiple times (subsequent calls
/// are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(unix)]
    let capture = None::<capture::CaptureLayer>;
    #[cfg(not(unix))]
    let capture = Some(capture::layer());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(tracing_subscriber::fmt::time::SystemTime)
                .with_target(false),
        )
        .with(capture)
        .try_init();
}
