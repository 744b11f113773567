//! Process-level interception of stdout and stderr.
//!
//! While installed, fds 1 and 2 point at pipes. A pump thread per stream
//! copies everything to the original destination and records it into the
//! active captures. Restoring puts the original fds back and waits for the
//! pumps to drain, so nothing written before the restore is lost.
//!
//! A child process that outlives the capture keeps its pipe open, and the
//! restore then waits for it to exit.

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
    use std::thread::{self, JoinHandle};

    use nix::unistd::{dup2, pipe};
    use tracing::warn;

    use crate::capture;

    pub(crate) struct StdioRedirect {
        streams: [Redirected; 2],
    }

    struct Redirected {
        target: RawFd,
        saved: OwnedFd,
        pump: JoinHandle<()>,
    }

    impl StdioRedirect {
        pub(crate) fn install() -> io::Result<Self> {
            flush_std();
            let stdout = redirect(io::stdout())?;
            let stderr = match redirect(io::stderr()) {
                Ok(stderr) => stderr,
                Err(err) => {
                    stdout.restore();
                    return Err(err);
                }
            };
            Ok(Self {
                streams: [stdout, stderr],
            })
        }

        pub(crate) fn restore(self) {
            flush_std();
            for stream in self.streams {
                stream.restore();
            }
        }
    }

    impl Redirected {
        fn restore(self) {
            match dup2(self.saved.as_raw_fd(), self.target) {
                Ok(_) => {
                    if self.pump.join().is_err() {
                        warn!(fd = self.target, "stdio capture pump panicked");
                    }
                }
                Err(err) => {
                    warn!(
                        fd = self.target,
                        error = %err,
                        "could not restore stdio, pump left running"
                    );
                }
            }
        }
    }

    fn flush_std() {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }

    fn redirect(stream: impl AsFd) -> io::Result<Redirected> {
        let fd = stream.as_fd();
        let target = fd.as_raw_fd();
        let saved = fd.try_clone_to_owned()?;
        let original = File::from(saved.try_clone()?);

        let (read, write) = pipe()?;
        let pump = thread::Builder::new()
            .name("seer-stdio-capture".into())
            .spawn(move || pump(File::from(read), original))?;

        // On failure `write` is dropped here, the pump sees EOF and exits.
        dup2(write.as_raw_fd(), target)?;
        Ok(Redirected {
            target,
            saved,
            pump,
        })
    }

    fn pump(mut source: File, mut original: File) {
        let mut buf = [0u8; 8192];
        let mut pending = Vec::new();
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let _ = original.write_all(&buf[..n]);
            pending.extend_from_slice(&buf[..n]);
            capture::record(&take_utf8(&mut pending));
        }
        if !pending.is_empty() {
            capture::record(&String::from_utf8_lossy(&pending));
        }
    }

    /// Take the decodable prefix of `pending`, leaving a split multi-byte
    /// sequence at the end for the next read.
    pub(super) fn take_utf8(pending: &mut Vec<u8>) -> String {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                let text = text.to_string();
                pending.clear();
                text
            }
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                *pending = pending.split_off(valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(pending).into_owned();
                pending.clear();
                text
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    pub(crate) struct StdioRedirect;

    impl StdioRedirect {
        pub(crate) fn install() -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stdio capture needs a unix platform",
            ))
        }

        pub(crate) fn restore(self) {}
    }
}

pub(crate) use imp::StdioRedirect;
