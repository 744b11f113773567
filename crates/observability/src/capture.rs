//! Scoped capture of textual output.
//!
//! A capture is a buffer registered on a process-wide stack for as long as
//! its [`CaptureGuard`] lives. Text recorded while it is registered (tracing
//! events through [`CaptureLayer`], writes through a [`TeeWriter`], or
//! explicit [`record`] calls) is appended to every registered buffer, so
//! nested and overlapping captures each see exactly the output of their own
//! region. Dropping the guard unregisters its buffer, on every exit path.
//!
//! Recording is process-wide: output from any thread lands in every active
//! capture. [`CaptureGuard::begin_with_stdio`] additionally intercepts the
//! process's stdout and stderr (Unix), so `println!`, raw writes and child
//! processes inheriting the streams are captured too. The interception stays
//! installed until the last such guard is released.

use std::fmt::{self, Write as _};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::stdio::StdioRedirect;

type Buffer = Arc<Mutex<String>>;

static ACTIVE: Mutex<Vec<(u64, Buffer)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static STDIO_CAPTURED: AtomicBool = AtomicBool::new(false);

struct Stdio {
    /// Guards that asked for stdio interception.
    users: usize,
    redirect: Option<StdioRedirect>,
}

// Lock order: STDIO before ACTIVE. The pump threads only take ACTIVE.
static STDIO: Mutex<Stdio> = Mutex::new(Stdio {
    users: 0,
    redirect: None,
});

fn active() -> MutexGuard<'static, Vec<(u64, Buffer)>> {
    ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn stdio() -> MutexGuard<'static, Stdio> {
    STDIO.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock(buffer: &Buffer) -> MutexGuard<'_, String> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registration of one capture buffer.
#[derive(Debug)]
pub struct CaptureGuard {
    id: u64,
    buffer: Buffer,
    stdio: bool,
}

impl CaptureGuard {
    /// Start capturing recorded text and tracing events.
    pub fn begin() -> Self {
        Self::register(false)
    }

    /// Start capturing, including everything written to stdout and stderr.
    ///
    /// Falls back to [`CaptureGuard::begin`] behavior when the streams cannot
    /// be intercepted.
    pub fn begin_with_stdio() -> Self {
        let mut stdio = stdio();
        let guard = Self::register(true);
        if stdio.users == 0 {
            match StdioRedirect::install() {
                Ok(redirect) => {
                    stdio.redirect = Some(redirect);
                    STDIO_CAPTURED.store(true, Ordering::SeqCst);
                }
                Err(err) => tracing::warn!(error = %err, "stdout/stderr will not be captured"),
            }
        }
        stdio.users += 1;
        guard
    }

    fn register(stdio: bool) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let buffer: Buffer = Arc::new(Mutex::new(String::new()));
        active().push((id, buffer.clone()));
        Self { id, buffer, stdio }
    }

    /// Text captured so far.
    pub fn contents(&self) -> String {
        lock(&self.buffer).clone()
    }

    /// Stop capturing and return everything captured.
    pub fn finish(mut self) -> String {
        self.release();
        std::mem::take(&mut *lock(&self.buffer))
    }

    fn release(&mut self) {
        if self.stdio {
            self.stdio = false;
            let mut stdio = stdio();
            stdio.users = stdio.users.saturating_sub(1);
            if stdio.users == 0 {
                // Drained while this buffer is still registered.
                if let Some(redirect) = stdio.redirect.take() {
                    STDIO_CAPTURED.store(false, Ordering::SeqCst);
                    redirect.restore();
                }
            }
        }
        active().retain(|(id, _)| *id != self.id);
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Number of captures currently registered.
pub fn depth() -> usize {
    active().len()
}

pub fn is_active() -> bool {
    depth() > 0
}

/// Whether stdout and stderr are currently being intercepted.
pub fn stdio_captured() -> bool {
    STDIO_CAPTURED.load(Ordering::SeqCst)
}

/// Append `text` to every active capture.
pub fn record(text: &str) {
    if text.is_empty() {
        return;
    }
    for (_, buffer) in active().iter() {
        lock(buffer).push_str(text);
    }
}

/// Keep the last `max_bytes` of `text`, cutting on a char boundary.
pub fn truncate_tail(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Writes to an inner writer and records the same bytes into active captures.
#[derive(Debug)]
pub struct TeeWriter<W> {
    inner: W,
}

impl<W: io::Write> TeeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl TeeWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl TeeWriter<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: io::Write> io::Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        record(&String::from_utf8_lossy(&buf[..written]));
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Renders tracing events as plain text lines into active captures.
///
/// Add it to a host subscriber whose output does not go to stdout or
/// stderr. Output that does is already captured by
/// [`CaptureGuard::begin_with_stdio`], and this layer would duplicate it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureLayer;

pub fn layer() -> CaptureLayer {
    CaptureLayer
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !is_active() {
            return;
        }

        let mut line = LineVisitor::default();
        event.record(&mut line);

        let meta = event.metadata();
        record(&format!(
            "{} {:>5} {}: {}{}\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            meta.level(),
            meta.target(),
            line.message,
            line.fields
        ));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
