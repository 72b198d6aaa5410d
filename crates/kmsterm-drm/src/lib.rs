//! KMS display stack for kmsterm.
//!
//! Everything needed to put pixels on a Linux display without a display
//! server: open an adapter node, discover a connector/encoder/CRTC path,
//! allocate a CPU-drawable scanout buffer, and pace frames off the display's
//! vertical blank.
//!
//! # Modules
//!
//! - [`device`] - the adapter [`Card`], display-path discovery, DRM master
//!   ownership, and saved-CRTC restore.
//! - [`framebuffer`] - dumb-buffer allocation, on-demand mapping, and
//!   full-surface dirty commits.
//! - [`vblank`] - one-shot vblank arming and event draining.
//!
//! # Lifetime discipline
//!
//! Mappings borrow the [`OffscreenBuffer`]; the buffer is destroyed before
//! the CRTC is restored; the restore happens before the [`Card`] closes.
//! Construction is fail-fast, teardown is log-and-continue.

pub mod device;
pub mod framebuffer;
pub mod vblank;

pub use device::{Card, DrmError, DrmResult, Screen};
pub use framebuffer::{OffscreenBuffer, PixelFormat};
