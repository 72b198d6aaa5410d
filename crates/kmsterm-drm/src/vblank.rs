//! Vblank scheduling.
//!
//! One-shot requests against the scanout CRTC: [`arm`] asks the kernel to
//! deliver an event at the next vertical blank, firing immediately when the
//! deadline has already passed, and [`drain`] consumes whatever events are
//! pending once the adapter fd polls readable. There is no standing
//! subscription; the owner re-arms after every delivery, and a missed
//! re-arm stops the tick stream permanently.

use drm::control::{Device as ControlDevice, Event};
use drm::{Device, VblankWaitFlags, VblankWaitTarget};

use crate::device::{Card, DrmResult, ctrl, retry_control};

/// Request one vblank event for the CRTC at `crtc_index`.
pub fn arm(card: &Card, crtc_index: u32) -> DrmResult<()> {
    retry_control(|| {
        card.wait_vblank(
            VblankWaitTarget::Relative(1),
            VblankWaitFlags::EVENT | VblankWaitFlags::NEXT_ON_MISS,
            crtc_index,
            0,
        )
    })
    .map(drop)
    .map_err(ctrl("WAIT_VBLANK"))
}

/// Consume pending adapter events, returning how many vblank ticks fired.
///
/// Coalescing is deliberate: however many ticks were pending, the caller
/// renders one frame and re-arms once.
pub fn drain(card: &Card) -> DrmResult<usize> {
    let events = card.receive_events().map_err(ctrl("READ_EVENTS"))?;
    let ticks = events
        .filter(|event| matches!(event, Event::Vblank(_)))
        .count();
    tracing::trace!(ticks, "drained vblank events");
    Ok(ticks)
}
