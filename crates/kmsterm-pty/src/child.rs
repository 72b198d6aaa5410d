//! Child process lifecycle over a pseudo-terminal.
//!
//! [`PtyChild`] spawns the shell (or any program) on the slave side of a
//! PTY and keeps the master side for the event loop: the master
//! descriptor is switched to non-blocking so output can be drained from
//! a readiness callback, and a dup of it can be handed to the poller.
//! Termination is cooperative first (SIGTERM with a short grace period)
//! and forced after that.

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use kmsterm_core::ioctl;
use libc::c_int;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};

/// Upper bound on bytes consumed by one [`PtyChild::drain`] call. A
/// flooding child must not starve the event loop; the descriptor stays
/// readable and the loop comes back for the rest.
const DRAIN_LIMIT: usize = 64 * 1024;

const READ_CHUNK: usize = 8192;

/// Grace period granted after SIGTERM: 10 polls, 10 ms apart.
const TERM_POLLS: u32 = 10;
const TERM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a blocked write waits for the child before giving up, in
/// milliseconds.
const WRITE_STALL_TIMEOUT: c_int = 100;

/// Errors from spawning or talking to the child.
#[derive(Debug)]
pub enum PtyError {
    /// Launching the program failed.
    SpawnFailed { program: String, reason: String },
    /// The platform PTY did not expose a pollable master descriptor.
    NoMasterFd,
    /// An operation on the open PTY failed.
    Pty(String),
    /// Reading from or writing to the master side failed.
    Io(io::Error),
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed { program, reason } => {
                write!(f, "failed to spawn {program}: {reason}")
            }
            Self::NoMasterFd => write!(f, "pty master has no pollable file descriptor"),
            Self::Pty(reason) => write!(f, "pty operation failed: {reason}"),
            Self::Io(err) => write!(f, "pty i/o failed: {err}"),
        }
    }
}

impl Error for PtyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PtyError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub type PtyResult<T> = Result<T, PtyError>;

/// A program running on the slave side of a PTY.
pub struct PtyChild {
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    master_fd: RawFd,
    eof: bool,
    exit: Option<u32>,
}

impl fmt::Debug for PtyChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyChild")
            .field("pid", &self.child.process_id())
            .field("master_fd", &self.master_fd)
            .field("eof", &self.eof)
            .field("exit", &self.exit)
            .finish()
    }
}

impl PtyChild {
    /// Spawn `program` with `args` on a fresh PTY sized `rows` x `cols`.
    ///
    /// The child gets `TERM=xterm-256color` and `COLORTERM=truecolor`.
    pub fn spawn(program: &str, args: &[String], rows: u16, cols: u16) -> PtyResult<Self> {
        let spawn_err = |err: &dyn fmt::Display| PtyError::SpawnFailed {
            program: program.to_string(),
            reason: err.to_string(),
        };

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| spawn_err(&err))?;
        let child = pair.slave.spawn_command(cmd).map_err(|err| spawn_err(&err))?;
        // The slave handle must go away so master reads can observe the
        // child's side closing.
        drop(pair.slave);

        let master_fd = pair.master.as_raw_fd().ok_or(PtyError::NoMasterFd)?;
        let flags = ioctl::retry(|| unsafe { libc::fcntl(master_fd, libc::F_GETFL) })?;
        ioctl::retry(|| unsafe {
            libc::fcntl(master_fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
        })?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| PtyError::Pty(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| PtyError::Pty(err.to_string()))?;

        tracing::info!(program, pid = child.process_id(), rows, cols, "child started");
        Ok(Self {
            child,
            reader,
            writer,
            master: pair.master,
            master_fd,
            eof: false,
            exit: None,
        })
    }

    /// The master descriptor, for readiness polling. Owned by `self`;
    /// valid until drop.
    #[must_use]
    pub fn master_fd(&self) -> RawFd {
        self.master_fd
    }

    /// Dup the master descriptor into an owned handle an event loop can
    /// register and keep.
    pub fn try_clone_master(&self) -> PtyResult<OwnedFd> {
        let fd = ioctl::retry(|| unsafe {
            libc::fcntl(self.master_fd, libc::F_DUPFD_CLOEXEC, 0)
        })?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// True once the child's side of the PTY has closed for good.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read whatever output is pending without blocking.
    ///
    /// Returns at most [`DRAIN_LIMIT`] bytes per call.
    pub fn drain(&mut self) -> PtyResult<Vec<u8>> {
        let mut bytes = Vec::new();
        if self.eof {
            return Ok(bytes);
        }
        let mut chunk = [0u8; READ_CHUNK];
        while bytes.len() < DRAIN_LIMIT {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the child side is
                // gone; that is EOF, not a failure.
                Err(err) if err.raw_os_error() == Some(libc::EIO) => {
                    self.eof = true;
                    break;
                }
                Err(err) => return Err(PtyError::Io(err)),
            }
        }
        if !bytes.is_empty() {
            tracing::trace!(bytes = bytes.len(), "drained child output");
        }
        Ok(bytes)
    }

    /// Forward input bytes to the child.
    ///
    /// A child that stops reading gets [`WRITE_STALL_TIMEOUT`] ms of
    /// patience; after that the remaining bytes are dropped, the way a
    /// real tty discards input when its buffer is full.
    pub fn write(&mut self, bytes: &[u8]) -> PtyResult<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.writer.write(rest) {
                Ok(0) => return Err(PtyError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => rest = &rest[n..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !self.await_writable()? {
                        tracing::warn!(
                            dropped = rest.len(),
                            "child is not reading input, dropping the rest"
                        );
                        return Ok(());
                    }
                }
                Err(err) => return Err(PtyError::Io(err)),
            }
        }
        Ok(())
    }

    fn await_writable(&self) -> PtyResult<bool> {
        let mut pfd = libc::pollfd {
            fd: self.master_fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let ready = ioctl::retry(|| unsafe { libc::poll(&mut pfd, 1, WRITE_STALL_TIMEOUT) })?;
        Ok(ready > 0)
    }

    /// Propagate new grid dimensions to the child's window size.
    pub fn resize(&mut self, rows: u16, cols: u16) -> PtyResult<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Pty(err.to_string()))?;
        tracing::debug!(rows, cols, "pty resized");
        Ok(())
    }

    /// Check for child exit without blocking. The code is cached; later
    /// calls keep returning it.
    pub fn try_wait(&mut self) -> PtyResult<Option<u32>> {
        if let Some(code) = self.exit {
            return Ok(Some(code));
        }
        match self.child.try_wait().map_err(PtyError::Io)? {
            Some(status) => {
                let code = status.exit_code();
                tracing::info!(code, "child exited");
                self.exit = Some(code);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Terminate the child: SIGTERM, a short grace period, then SIGKILL.
    ///
    /// Best-effort; failures are logged, not returned. The exit code is
    /// reported when the child could be reaped.
    pub fn shutdown(&mut self) -> Option<u32> {
        match self.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "exit status check failed"),
        }

        self.send_signal(libc::SIGTERM);
        for _ in 0..TERM_POLLS {
            thread::sleep(TERM_POLL_INTERVAL);
            if let Ok(Some(code)) = self.try_wait() {
                return Some(code);
            }
        }

        tracing::warn!("child ignored sigterm, killing it");
        if self.child.process_id().is_some() {
            self.send_signal(libc::SIGKILL);
        } else if let Err(err) = self.child.kill() {
            tracing::warn!(error = %err, "hard kill failed");
        }
        match self.child.wait() {
            Ok(status) => {
                let code = status.exit_code();
                self.exit = Some(code);
                Some(code)
            }
            Err(err) => {
                tracing::warn!(error = %err, "reaping the killed child failed");
                None
            }
        }
    }

    fn send_signal(&self, signal: c_int) {
        let Some(pid) = self.child.process_id() else {
            return;
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            tracing::debug!(
                pid,
                signal,
                error = %io::Error::last_os_error(),
                "signal delivery failed"
            );
        }
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        if self.exit.is_some() {
            return;
        }
        let _ = self.writer.flush();
        self.send_signal(libc::SIGKILL);
        let _ = self.child.try_wait();
    }
}
