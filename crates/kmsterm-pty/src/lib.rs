//! Child process management for kmsterm.
//!
//! The terminal's only job besides drawing is to keep one program alive
//! on the slave side of a PTY and shuttle bytes both ways. [`PtyChild`]
//! wraps the spawn, the non-blocking master-side reads the event loop
//! drains on readiness, input forwarding, window-size propagation, and
//! a SIGTERM-then-SIGKILL shutdown path.

pub mod child;

pub use child::{PtyChild, PtyError, PtyResult};
