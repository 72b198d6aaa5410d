//! Virtual-terminal plumbing for kmsterm.
//!
//! This crate owns the kernel-facing half of console ownership: issuing
//! device-control requests with the retry discipline the VT subsystem needs,
//! turning the kernel's VT-switch signals into pollable pipe events, and the
//! [`vt::VtSession`] guard that acquires (and reliably releases) raw input,
//! process-controlled switching, and graphics mode on one `/dev/ttyN`.
//!
//! # Modules
//!
//! - [`ioctl`] - device-control requests with transparent EINTR/EAGAIN retry.
//! - [`signal`] - per-signal self-pipes feeding a readiness-based event loop.
//! - [`vt`] - the VT ownership guard and switch handshake.
//!
//! # Role in kmsterm
//! Everything here is Linux-specific and deliberately small: the display side
//! lives in `kmsterm-drm`, and the orchestration of release/acquire against
//! rendering lives in the binary. This crate guarantees only that whatever VT
//! state was entered is undone, in reverse, on every exit path.

/// Device-control (ioctl) requests with transparent retry.
pub mod ioctl;

/// Signal-to-pipe adapters for event-loop delivery.
pub mod signal;

/// VT ownership guard and switch handshake.
pub mod vt;
