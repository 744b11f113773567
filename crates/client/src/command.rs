//! Monitoring a child process.

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::Context as _;
use thiserror::Error;
use tracing::warn;

use seer_observability::TeeWriter;
use seer_observability::capture;

use crate::client::Seer;
use crate::error::MonitorError;
use crate::session::MonitorOptions;

/// The child ran but exited unsuccessfully.
///
/// Reaches callers inside an [`anyhow::Error`]; `downcast_ref` recovers it.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("command exited with {status}")]
pub struct CommandFailed {
    pub status: ExitStatus,
}

impl Seer {
    /// Run `program` with `args` as a monitored run of `job_name`.
    ///
    /// With log capture on, the child's stdout and stderr still reach the
    /// terminal and are also captured. The child inherits the intercepted
    /// streams; where they are not intercepted its output is piped through
    /// [`TeeWriter`]s instead. A non-zero exit is a failed run carrying
    /// [`CommandFailed`].
    pub fn run_command<I, S>(
        &self,
        job_name: &str,
        options: MonitorOptions,
        program: impl AsRef<OsStr>,
        args: I,
    ) -> Result<ExitStatus, MonitorError<anyhow::Error>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program.as_ref());
        command.args(args);
        let capture_logs = options.capture_logs;

        self.monitor(job_name, options, || {
            let tee = capture_logs && !capture::stdio_captured();
            run_child(&mut command, tee)
        })
    }
}

fn run_child(command: &mut Command, tee: bool) -> anyhow::Result<ExitStatus> {
    let program = command.get_program().to_string_lossy().into_owned();
    if tee {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start `{program}`"))?;

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, TeeWriter::stdout()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, TeeWriter::stderr()));
    }

    let status = child
        .wait()
        .with_context(|| format!("failed waiting for `{program}`"))?;

    for handle in pumps {
        match handle.join() {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(program = %program, error = %err, "child output was cut short"),
            Err(_) => warn!(program = %program, "output pump panicked"),
        }
    }

    if status.success() {
        Ok(status)
    } else {
        Err(CommandFailed { status }.into())
    }
}

fn pump<R, W>(mut reader: R, mut writer: TeeWriter<W>) -> JoinHandle<io::Result<u64>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let copied = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        Ok(copied)
    })
}
