//! Device-control requests with transparent retry.
//!
//! The kernel may interrupt an ioctl with a signal (`EINTR`) or report a
//! transient `EAGAIN`; neither is an error for the non-blocking console and
//! mode-setting requests this workspace issues, so every device-control call
//! funnels through [`retry`], which repeats until the request settles. The
//! retry is indefinite: a spuriously interrupted request must eventually
//! succeed, and surfacing the interruption would force every caller to
//! reimplement the same loop.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use libc::{c_int, c_ulong, c_void};

/// Repeat `op` until it returns a non-negative value or fails with an errno
/// other than `EINTR`/`EAGAIN`.
///
/// `op` must set `errno` on failure (i.e. be a thin syscall wrapper).
pub fn retry<F>(mut op: F) -> io::Result<c_int>
where
    F: FnMut() -> c_int,
{
    loop {
        let rc = op();
        if rc >= 0 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

/// Issue a request that takes no argument.
pub fn ioctl_none(fd: BorrowedFd<'_>, request: c_ulong) -> io::Result<c_int> {
    retry(|| unsafe { libc::ioctl(fd.as_raw_fd(), request) })
}

/// Issue a request whose argument is a plain integer value.
pub fn ioctl_val(fd: BorrowedFd<'_>, request: c_ulong, val: c_ulong) -> io::Result<c_int> {
    retry(|| unsafe { libc::ioctl(fd.as_raw_fd(), request, val) })
}

/// Issue a request whose argument is a pointer to a kernel-defined struct.
///
/// # Safety
///
/// `arg` must point to a live object of the exact type `request` expects, and
/// must stay valid for the duration of the call.
pub unsafe fn ioctl_ptr(fd: BorrowedFd<'_>, request: c_ulong, arg: *mut c_void) -> io::Result<c_int> {
    retry(|| unsafe { libc::ioctl(fd.as_raw_fd(), request, arg) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_errno(errno: c_int) {
        unsafe {
            *libc::__errno_location() = errno;
        }
    }

    #[test]
    fn retry_returns_first_success() {
        let result = retry(|| 7);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn retry_repeats_on_eintr_then_succeeds() {
        let mut attempts = 0;
        let result = retry(|| {
            attempts += 1;
            if attempts < 3 {
                set_errno(libc::EINTR);
                -1
            } else {
                0
            }
        });
        assert_eq!(result.unwrap(), 0);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_repeats_on_eagain_then_succeeds() {
        let mut attempts = 0;
        let result = retry(|| {
            attempts += 1;
            if attempts == 1 {
                set_errno(libc::EAGAIN);
                -1
            } else {
                4
            }
        });
        assert_eq!(result.unwrap(), 4);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn retry_surfaces_other_errors() {
        let mut attempts = 0;
        let result = retry(|| {
            attempts += 1;
            set_errno(libc::ENOTTY);
            -1
        });
        assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::ENOTTY));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn retry_zero_is_success() {
        assert_eq!(retry(|| 0).unwrap(), 0);
    }
}
