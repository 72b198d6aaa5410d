//! CPU-drawable scanout surface.
//!
//! A kernel-allocated dumb buffer wrapped in a framebuffer object. The
//! kernel's reported stride and length are authoritative: the stride may
//! exceed `width * bytes_per_pixel`, so all pixel addressing goes through
//! [`OffscreenBuffer::pitch`]. The buffer is mapped on demand for pixel
//! access; the mapping borrows the buffer and can never outlive it.
//!
//! Teardown is explicit and ordered: [`OffscreenBuffer::destroy`] removes
//! the framebuffer object first, then the dumb buffer, and consuming `self`
//! makes a second teardown unrepresentable. The owner destroys the surface
//! before restoring the CRTC and closing the adapter.

use std::io;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::Device as ControlDevice;
use drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use drm::control::framebuffer;

use crate::device::{Card, DrmError, DrmResult, ctrl, retry_control};

/// Pixel layout of a scanout surface.
///
/// A closed set: the compositor renders exactly these two layouts, each
/// carrying its own framebuffer depth and bits-per-pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Little-endian 32-bit `XRGB` words, 24 bits of color.
    Packed32,
    /// Single-channel 8-bit grayscale.
    Gray8,
}

impl PixelFormat {
    /// Color depth advertised on the framebuffer object.
    pub fn depth(self) -> u32 {
        match self {
            PixelFormat::Packed32 => 24,
            PixelFormat::Gray8 => 8,
        }
    }

    /// Bits per pixel in the dumb buffer.
    pub fn bpp(self) -> u32 {
        match self {
            PixelFormat::Packed32 => 32,
            PixelFormat::Gray8 => 8,
        }
    }

    /// Bytes per pixel, for stride arithmetic.
    pub fn bytes_per_pixel(self) -> usize {
        (self.bpp() / 8) as usize
    }

    fn fourcc(self) -> DrmFourcc {
        match self {
            PixelFormat::Packed32 => DrmFourcc::Xrgb8888,
            PixelFormat::Gray8 => DrmFourcc::R8,
        }
    }
}

/// Dumb buffer plus the framebuffer object that makes it scannable.
pub struct OffscreenBuffer {
    dumb: DumbBuffer,
    fb: framebuffer::Handle,
    format: PixelFormat,
    width: u32,
    height: u32,
    pitch: u32,
    dirty_supported: bool,
}

impl OffscreenBuffer {
    /// Allocate a `width x height` surface on `card`.
    pub fn create(card: &Card, (width, height): (u32, u32), format: PixelFormat) -> DrmResult<Self> {
        let dumb = card
            .create_dumb_buffer((width, height), format.fourcc(), format.bpp())
            .map_err(ctrl("MODE_CREATE_DUMB"))?;
        let pitch = dumb.pitch();

        let fb = match card.add_framebuffer(&dumb, format.depth(), format.bpp()) {
            Ok(handle) => handle,
            Err(source) => {
                if let Err(err) = card.destroy_dumb_buffer(dumb) {
                    tracing::warn!(error = %err, "MODE_DESTROY_DUMB failed");
                }
                return Err(DrmError::ControlFailed {
                    op: "MODE_ADDFB",
                    source,
                });
            }
        };

        tracing::debug!(width, height, pitch, ?format, "allocated scanout surface");
        Ok(Self {
            dumb,
            fb,
            format,
            width,
            height,
            pitch,
            dirty_supported: true,
        })
    }

    /// Framebuffer object handle, for CRTC programming.
    pub fn framebuffer(&self) -> framebuffer::Handle {
        self.fb
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Kernel-reported bytes per scanline.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Map the buffer for CPU pixel access.
    pub fn map(&mut self, card: &Card) -> DrmResult<DumbMapping<'_>> {
        card.map_dumb_buffer(&mut self.dumb)
            .map_err(ctrl("MODE_MAP_DUMB"))
    }

    /// Tell the driver the whole surface changed.
    ///
    /// Direct-scanout drivers have no dirty hook and report the request as
    /// unsupported; that is remembered and later commits become no-ops.
    pub fn commit(&mut self, card: &Card) -> DrmResult<()> {
        if !self.dirty_supported {
            return Ok(());
        }
        match retry_control(|| card.dirty_framebuffer(self.fb, &[])) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                tracing::debug!("driver scans out directly; disabling dirty notifications");
                self.dirty_supported = false;
                Ok(())
            }
            Err(source) => Err(DrmError::ControlFailed {
                op: "MODE_DIRTYFB",
                source,
            }),
        }
    }

    /// Release the framebuffer object, then the dumb buffer.
    ///
    /// Failures are logged and skipped; the kernel reclaims both at device
    /// close anyway.
    pub fn destroy(self, card: &Card) {
        if let Err(err) = card.destroy_framebuffer(self.fb) {
            tracing::warn!(error = %err, "MODE_RMFB failed");
        }
        if let Err(err) = card.destroy_dumb_buffer(self.dumb) {
            tracing::warn!(error = %err, "MODE_DESTROY_DUMB failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed32_matches_xrgb8888_parameters() {
        assert_eq!(PixelFormat::Packed32.depth(), 24);
        assert_eq!(PixelFormat::Packed32.bpp(), 32);
        assert_eq!(PixelFormat::Packed32.bytes_per_pixel(), 4);
    }

    #[test]
    fn gray8_is_one_byte_per_pixel() {
        assert_eq!(PixelFormat::Gray8.depth(), 8);
        assert_eq!(PixelFormat::Gray8.bpp(), 8);
        assert_eq!(PixelFormat::Gray8.bytes_per_pixel(), 1);
    }
}
