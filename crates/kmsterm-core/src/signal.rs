//! Signal-to-pipe adapters.
//!
//! The VT switch handshake arrives as process signals (one for "release the
//! console", one for "the console is yours again"), and the rest of the
//! process lifecycle (SIGCHLD, SIGINT, SIGTERM) arrives the same way. A
//! single-threaded readiness loop cannot take callbacks inside a signal
//! handler, so each signal of interest is registered as a self-pipe: the
//! async-signal-safe handler writes one byte into a socketpair, and the read
//! half becomes an ordinary pollable fd for the loop.
//!
//! One pipe per signal keeps deliveries distinguishable without decoding.
//! Coalescing is intentional: the kernel never issues a second VT switch
//! request before the first one is acknowledged, so draining N pending bytes
//! into one handler run is correct.

use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use libc::c_int;
use signal_hook::SigId;
use signal_hook::low_level::pipe;

/// A registered signal with a pollable delivery pipe.
///
/// Dropping the pipe unregisters the signal-hook action; the write half is
/// owned (and closed) by signal-hook itself.
#[derive(Debug)]
pub struct SignalPipe {
    signal: c_int,
    read: UnixStream,
    id: SigId,
}

impl SignalPipe {
    /// Register `signal` for self-pipe delivery.
    ///
    /// Both halves are nonblocking: the write side so the signal handler can
    /// never block (an unread backlog simply coalesces), the read side so
    /// [`drain`](Self::drain) can empty the pipe without stalling the loop.
    pub fn register(signal: c_int) -> io::Result<Self> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        let id = pipe::register(signal, write)?;
        tracing::debug!(signal, "signal pipe registered");
        Ok(Self { signal, read, id })
    }

    /// The signal number this pipe was registered for.
    pub fn signal(&self) -> c_int {
        self.signal
    }

    /// Consume every pending delivery, reporting whether at least one signal
    /// arrived since the last drain.
    pub fn drain(&mut self) -> io::Result<bool> {
        let mut seen = false;
        let mut buf = [0u8; 64];
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => return Ok(seen),
                Ok(_) => seen = true,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(seen),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Duplicate the read half for event-loop registration.
    ///
    /// The clone shares the pipe's file description, so readiness observed on
    /// the clone corresponds to bytes drained through `self`.
    pub fn try_clone_read_half(&self) -> io::Result<UnixStream> {
        self.read.try_clone()
    }
}

impl AsFd for SignalPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
        tracing::debug!(signal = self.signal, "signal pipe unregistered");
    }
}
