//! VT ownership guard.
//!
//! This module gives the process exclusive, revocable control of one Linux
//! virtual terminal. Ownership is entered in stages and every stage is undone
//! in reverse order on teardown:
//!
//! 1. **Activation** (optional) - switch the visible VT to ours and wait for
//!    the switch to complete; teardown switches back to the previously active
//!    VT, but only if ours is still the visible one.
//! 2. **Raw input mode** - unbuffered, unechoed, signal-free keyboard input
//!    with a 1-byte minimum read; teardown restores the captured line
//!    discipline verbatim.
//! 3. **Process-controlled switching** - `VT_SETMODE` with two caller-chosen
//!    signals so the kernel asks (rather than yanks) when another process
//!    wants the console; teardown restores automatic switching.
//! 4. **Graphics mode** - `KDSETMODE(KD_GRAPHICS)` suspends the kernel's own
//!    text rendering onto this VT; teardown restores the captured mode and
//!    tolerates failure, since the VT may already be gone.
//!
//! # Switch handshake
//!
//! The kernel delivers the release/acquire signals registered at
//! `VT_SETMODE` time; delivery itself is routed through
//! [`crate::signal::SignalPipe`]. The acknowledgements are separate and
//! unconditional: failing to call [`VtSession::ack_release`] or
//! [`VtSession::ack_acquire`] after a delivery wedges the kernel's VT
//! subsystem for every process on the machine. Release is acknowledged
//! *after* the owner's release work (so the display is already surrendered),
//! acquire is acknowledged *before* the owner's acquire work.
//!
//! # Panic safety
//!
//! A process hook restores text mode, automatic switching, and the saved
//! line discipline before the panic propagates, so a crash never leaves the
//! machine with an unusable console.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;

use libc::{c_char, c_int, c_short, c_ulong};

use crate::ioctl::{ioctl_ptr, ioctl_val, retry};

// linux/vt.h
const VT_GETSTATE: c_ulong = 0x5603;
const VT_SETMODE: c_ulong = 0x5602;
const VT_RELDISP: c_ulong = 0x5605;
const VT_ACTIVATE: c_ulong = 0x5606;
const VT_WAITACTIVE: c_ulong = 0x5607;

const VT_AUTO: c_char = 0;
const VT_PROCESS: c_char = 1;
const VT_ACKACQ: c_ulong = 2;

// linux/kd.h
const KDGETMODE: c_ulong = 0x4B3B;
const KDSETMODE: c_ulong = 0x4B3A;
const KD_TEXT: c_ulong = 0x00;
const KD_GRAPHICS: c_ulong = 0x01;

/// Default signal the kernel sends when another process wants this VT.
pub const RELEASE_SIGNAL: c_int = libc::SIGUSR1;
/// Default signal the kernel sends when this VT is handed back.
pub const ACQUIRE_SIGNAL: c_int = libc::SIGUSR2;

/// `struct vt_mode` for `VT_SETMODE`.
#[repr(C)]
#[derive(Clone, Copy)]
struct VtMode {
    mode: c_char,
    waitv: c_char,
    relsig: c_short,
    acqsig: c_short,
    frsig: c_short,
}

/// `struct vt_stat` for `VT_GETSTATE`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// Errors from VT ownership operations.
#[derive(Debug)]
pub enum VtError {
    /// The VT device node could not be opened.
    DeviceUnavailable { path: PathBuf, source: io::Error },
    /// A device-control request was rejected by the kernel.
    ControlFailed { op: &'static str, source: io::Error },
}

impl fmt::Display for VtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceUnavailable { path, source } => {
                write!(f, "VT device {} unavailable: {source}", path.display())
            }
            Self::ControlFailed { op, source } => {
                write!(f, "VT request {op} failed: {source}")
            }
        }
    }
}

impl std::error::Error for VtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DeviceUnavailable { source, .. } | Self::ControlFailed { source, .. } => {
                Some(source)
            }
        }
    }
}

/// Convenience alias for VT operations.
pub type VtResult<T> = Result<T, VtError>;

fn ctrl(op: &'static str) -> impl FnOnce(io::Error) -> VtError {
    move |source| VtError::ControlFailed { op, source }
}

/// Configuration for [`VtSession::new`].
#[derive(Debug, Clone)]
pub struct VtOptions {
    /// Target VT number; `None` resolves the currently active VT.
    pub vt: Option<u16>,
    /// Switch the visible VT to the target before taking ownership.
    pub activate: bool,
    /// Signal number installed as the kernel's release notification.
    pub release_signal: c_int,
    /// Signal number installed as the kernel's acquire notification.
    pub acquire_signal: c_int,
}

impl Default for VtOptions {
    fn default() -> Self {
        Self {
            vt: None,
            activate: false,
            release_signal: RELEASE_SIGNAL,
            acquire_signal: ACQUIRE_SIGNAL,
        }
    }
}

/// Exclusive, revocable ownership of one virtual terminal.
///
/// Stages are tracked individually so a construction failure part-way through
/// still unwinds exactly what was entered. Field order mirrors acquisition
/// order; [`cleanup`](Self::cleanup) runs the inverse sequence and is also
/// invoked from `Drop`.
#[derive(Debug)]
pub struct VtSession {
    tty: File,
    vt: u16,
    previous_vt: Option<u16>,
    saved_termios: Option<libc::termios>,
    process_mode_set: bool,
    saved_kd_mode: Option<c_int>,
}

impl VtSession {
    /// Open the target VT and enter all ownership stages.
    ///
    /// # Errors
    ///
    /// [`VtError::DeviceUnavailable`] if the device node cannot be opened,
    /// [`VtError::ControlFailed`] if any stage's kernel request is rejected.
    /// Stages already entered are undone before the error returns.
    pub fn new(options: VtOptions) -> VtResult<Self> {
        let vt = match options.vt {
            Some(n) => n,
            None => active_vt().map_err(ctrl("VT_GETSTATE"))?,
        };
        let path = PathBuf::from(format!("/dev/tty{vt}"));

        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(&path)
            .map_err(|source| VtError::DeviceUnavailable { path, source })?;

        tracing::info!(vt, "vt opened");

        let mut session = Self {
            tty,
            vt,
            previous_vt: None,
            saved_termios: None,
            process_mode_set: false,
            saved_kd_mode: None,
        };

        if options.activate {
            session.make_active()?;
        }
        session.enter_raw_mode()?;
        session.enter_process_switch(options.release_signal, options.acquire_signal)?;
        session.enter_graphics_mode()?;

        install_console_rescue(ConsoleRescue {
            fd: session.tty.as_raw_fd(),
            termios: session.saved_termios,
            kd_mode: session.saved_kd_mode.unwrap_or(KD_TEXT as c_int),
        });

        Ok(session)
    }

    /// The VT number this session owns.
    pub fn vt_number(&self) -> u16 {
        self.vt
    }

    /// Duplicate the VT handle for event-loop registration.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.tty.try_clone()
    }

    /// Read available keyboard bytes, retrying interrupted reads.
    ///
    /// In raw mode the kernel keymap has already translated scancodes, so the
    /// bytes are ready to forward to the child as-is.
    pub fn read_input(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.tty).read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Grant a pending release request (`VT_RELDISP(1)`).
    pub fn ack_release(&self) -> VtResult<()> {
        ioctl_val(self.tty.as_fd(), VT_RELDISP, 1)
            .map(drop)
            .map_err(ctrl("VT_RELDISP"))
    }

    /// Acknowledge a completed acquire (`VT_RELDISP(VT_ACKACQ)`).
    pub fn ack_acquire(&self) -> VtResult<()> {
        ioctl_val(self.tty.as_fd(), VT_RELDISP, VT_ACKACQ)
            .map(drop)
            .map_err(ctrl("VT_RELDISP"))
    }

    fn make_active(&mut self) -> VtResult<()> {
        let stat = self.get_state()?;
        if stat.v_active == self.vt {
            return Ok(());
        }
        ioctl_val(self.tty.as_fd(), VT_ACTIVATE, c_ulong::from(self.vt))
            .map_err(ctrl("VT_ACTIVATE"))?;
        ioctl_val(self.tty.as_fd(), VT_WAITACTIVE, c_ulong::from(self.vt))
            .map_err(ctrl("VT_WAITACTIVE"))?;
        self.previous_vt = Some(stat.v_active);
        tracing::info!(vt = self.vt, previous = stat.v_active, "vt activated");
        Ok(())
    }

    fn enter_raw_mode(&mut self) -> VtResult<()> {
        let fd = self.tty.as_raw_fd();
        let mut saved: libc::termios = unsafe { mem::zeroed() };
        retry(|| unsafe { libc::tcgetattr(fd, &mut saved) }).map_err(ctrl("tcgetattr"))?;

        let mut attrs = saved;
        unsafe { libc::cfmakeraw(&mut attrs) };
        attrs.c_cc[libc::VMIN] = 1;
        attrs.c_cc[libc::VTIME] = 0;
        retry(|| unsafe { libc::tcsetattr(fd, libc::TCSANOW, &attrs) })
            .map_err(ctrl("tcsetattr"))?;

        self.saved_termios = Some(saved);
        tracing::info!("vt raw input mode enabled");
        Ok(())
    }

    fn enter_process_switch(&mut self, release_signal: c_int, acquire_signal: c_int) -> VtResult<()> {
        let mut mode = VtMode {
            mode: VT_PROCESS,
            waitv: 0,
            relsig: release_signal as c_short,
            acqsig: acquire_signal as c_short,
            frsig: 0,
        };
        unsafe { ioctl_ptr(self.tty.as_fd(), VT_SETMODE, (&raw mut mode).cast()) }
            .map_err(ctrl("VT_SETMODE"))?;
        self.process_mode_set = true;
        tracing::info!(release_signal, acquire_signal, "vt process-controlled switching enabled");
        Ok(())
    }

    fn enter_graphics_mode(&mut self) -> VtResult<()> {
        let mut current: c_int = 0;
        unsafe { ioctl_ptr(self.tty.as_fd(), KDGETMODE, (&raw mut current).cast()) }
            .map_err(ctrl("KDGETMODE"))?;
        ioctl_val(self.tty.as_fd(), KDSETMODE, KD_GRAPHICS).map_err(ctrl("KDSETMODE"))?;
        self.saved_kd_mode = Some(current);
        tracing::info!("vt graphics mode enabled");
        Ok(())
    }

    fn get_state(&self) -> VtResult<VtStat> {
        let mut stat = VtStat::default();
        unsafe { ioctl_ptr(self.tty.as_fd(), VT_GETSTATE, (&raw mut stat).cast()) }
            .map_err(ctrl("VT_GETSTATE"))?;
        Ok(stat)
    }

    /// Undo every entered stage in reverse order.
    ///
    /// Failures are logged and skipped: partial console restoration is
    /// strictly better than none, and the VT may already have been torn down
    /// by the kernel.
    fn cleanup(&mut self) {
        if let Some(mode) = self.saved_kd_mode.take() {
            if let Err(err) = ioctl_val(self.tty.as_fd(), KDSETMODE, mode as c_ulong) {
                tracing::warn!(%err, "failed to restore console display mode");
            } else {
                tracing::info!("vt graphics mode disabled");
            }
        }

        if self.process_mode_set {
            let mut auto_mode = VtMode {
                mode: VT_AUTO,
                waitv: 0,
                relsig: 0,
                acqsig: 0,
                frsig: 0,
            };
            if let Err(err) =
                unsafe { ioctl_ptr(self.tty.as_fd(), VT_SETMODE, (&raw mut auto_mode).cast()) }
            {
                tracing::warn!(%err, "failed to restore automatic vt switching");
            } else {
                tracing::info!("vt process-controlled switching disabled");
            }
            self.process_mode_set = false;
        }

        if let Some(saved) = self.saved_termios.take() {
            let fd = self.tty.as_raw_fd();
            if let Err(err) = retry(|| unsafe { libc::tcsetattr(fd, libc::TCSANOW, &saved) }) {
                tracing::warn!(%err, "failed to restore vt line discipline");
            } else {
                tracing::info!("vt raw input mode disabled");
            }
        }

        if let Some(previous) = self.previous_vt.take() {
            // Only undo our own switch; if the visible VT moved for an
            // unrelated reason, leave it alone.
            match self.get_state() {
                Ok(stat) if stat.v_active == self.vt => {
                    if let Err(err) =
                        ioctl_val(self.tty.as_fd(), VT_ACTIVATE, c_ulong::from(previous))
                    {
                        tracing::warn!(%err, previous, "failed to restore previous vt");
                    } else {
                        tracing::info!(previous, "previous vt restored");
                    }
                }
                Ok(_) => tracing::debug!("vt no longer active, leaving switch in place"),
                Err(err) => tracing::warn!(%err, "could not query vt state during teardown"),
            }
        }
    }
}

impl AsFd for VtSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.tty.as_fd()
    }
}

impl Drop for VtSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Resolve the currently active VT number.
///
/// Prefers the sysfs report; falls back to `VT_GETSTATE` on the console
/// multiplexer for kernels without the sysfs attribute.
pub fn active_vt() -> io::Result<u16> {
    if let Ok(contents) = fs::read_to_string("/sys/class/tty/tty0/active")
        && let Some(vt) = parse_active_vt(&contents)
    {
        return Ok(vt);
    }

    let tty0 = File::open("/dev/tty0")?;
    let mut stat = VtStat::default();
    unsafe { ioctl_ptr(tty0.as_fd(), VT_GETSTATE, (&raw mut stat).cast()) }?;
    Ok(stat.v_active)
}

fn parse_active_vt(contents: &str) -> Option<u16> {
    contents.trim().strip_prefix("tty")?.parse().ok()
}

struct ConsoleRescue {
    fd: RawFd,
    termios: Option<libc::termios>,
    kd_mode: c_int,
}

static CONSOLE_RESCUE: OnceLock<ConsoleRescue> = OnceLock::new();

/// Install a panic hook that puts the console back into a usable state.
///
/// Runs before the default hook so the panic message lands on a readable
/// terminal; with `panic = "abort"` this is the only cleanup that happens.
fn install_console_rescue(rescue: ConsoleRescue) {
    if CONSOLE_RESCUE.set(rescue).is_err() {
        return;
    }
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(rescue) = CONSOLE_RESCUE.get() {
            unsafe {
                libc::ioctl(rescue.fd, KDSETMODE, rescue.kd_mode as c_ulong);
                let mut auto_mode = VtMode {
                    mode: VT_AUTO,
                    waitv: 0,
                    relsig: 0,
                    acqsig: 0,
                    frsig: 0,
                };
                libc::ioctl(rescue.fd, VT_SETMODE, &raw mut auto_mode);
                if let Some(saved) = rescue.termios {
                    libc::tcsetattr(rescue.fd, libc::TCSANOW, &saved);
                }
            }
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vt_mode_layout_matches_kernel_abi() {
        assert_eq!(mem::size_of::<VtMode>(), 8);
    }

    #[test]
    fn vt_stat_layout_matches_kernel_abi() {
        assert_eq!(mem::size_of::<VtStat>(), 6);
    }

    #[test]
    fn request_codes_match_uapi_headers() {
        assert_eq!(VT_SETMODE, 0x5602);
        assert_eq!(VT_GETSTATE, 0x5603);
        assert_eq!(VT_RELDISP, 0x5605);
        assert_eq!(VT_ACTIVATE, 0x5606);
        assert_eq!(VT_WAITACTIVE, 0x5607);
        assert_eq!(KDSETMODE, 0x4B3A);
        assert_eq!(KDGETMODE, 0x4B3B);
    }

    #[test]
    fn parse_active_vt_accepts_sysfs_format() {
        assert_eq!(parse_active_vt("tty1\n"), Some(1));
        assert_eq!(parse_active_vt("tty12"), Some(12));
    }

    #[test]
    fn parse_active_vt_rejects_garbage() {
        assert_eq!(parse_active_vt(""), None);
        assert_eq!(parse_active_vt("console\n"), None);
        assert_eq!(parse_active_vt("ttyS0\n"), None);
    }

    #[test]
    fn default_options_use_distinct_handshake_signals() {
        let options = VtOptions::default();
        assert_ne!(options.release_signal, options.acquire_signal);
    }

    #[test]
    fn error_display_includes_operation() {
        let err = VtError::ControlFailed {
            op: "VT_SETMODE",
            source: io::Error::from_raw_os_error(libc::EPERM),
        };
        assert!(err.to_string().contains("VT_SETMODE"));
    }

    #[test]
    fn error_display_includes_device_path() {
        let err = VtError::DeviceUnavailable {
            path: PathBuf::from("/dev/tty9"),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(err.to_string().contains("/dev/tty9"));
    }
}
