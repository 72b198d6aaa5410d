//! Pixel primitives.
//!
//! Everything here works in XRGB8888: one `u32` per pixel, red in bits
//! 16..24, the top byte unused. [`PixelImage`] is an owned rectangle of
//! pixels; [`Surface`] is a borrowed view over a mapped scanout buffer
//! (raw bytes plus a pitch) with clipped fill, blit, and patch capture.
//! All operations silently clip to the destination bounds.

/// Pack RGB components into an XRGB8888 pixel.
#[must_use]
pub const fn xrgb(r: u8, g: u8, b: u8) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// An owned rectangle of XRGB8888 pixels, tightly packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelImage {
    width: u32,
    height: u32,
    data: Vec<u32>,
}

impl PixelImage {
    /// A black image of the given size.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn pixels(&self) -> &[u32] {
        &self.data
    }

    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        (x < self.width && y < self.height)
            .then(|| self.data[y as usize * self.width as usize + x as usize])
    }

    /// Set one pixel; out-of-bounds writes are dropped.
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: u32) {
        if x < self.width && y < self.height {
            self.data[y as usize * self.width as usize + x as usize] = pixel;
        }
    }

    /// Fill a rectangle, clipped to the image.
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, pixel: u32) {
        let x_end = x.saturating_add(w).min(self.width);
        let y_end = y.saturating_add(h).min(self.height);
        for row in y.min(self.height)..y_end {
            let start = row as usize * self.width as usize;
            self.data[start + x as usize..start + x_end as usize].fill(pixel);
        }
    }
}

/// A mutable view over a mapped framebuffer: raw bytes, a row pitch in
/// bytes, and the pixel dimensions of the drawable area.
pub struct Surface<'a> {
    data: &'a mut [u8],
    pitch: usize,
    width: u32,
    height: u32,
}

impl<'a> Surface<'a> {
    pub fn new(data: &'a mut [u8], pitch: usize, width: u32, height: u32) -> Self {
        Self {
            data,
            pitch,
            width,
            height,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.pitch + x as usize * 4
    }

    /// Copy an image onto the surface with its top-left corner at (x, y),
    /// clipping whatever falls outside.
    pub fn blit(&mut self, x: u32, y: u32, image: &PixelImage) {
        let w = image.width().min(self.width.saturating_sub(x));
        let h = image.height().min(self.height.saturating_sub(y));
        for row in 0..h {
            let src_start = row as usize * image.width() as usize;
            let mut off = self.offset(x, y + row);
            for &pixel in &image.pixels()[src_start..src_start + w as usize] {
                self.data[off..off + 4].copy_from_slice(&pixel.to_le_bytes());
                off += 4;
            }
        }
    }

    /// Fill a rectangle, clipped to the surface.
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, pixel: u32) {
        let w = w.min(self.width.saturating_sub(x));
        let h = h.min(self.height.saturating_sub(y));
        let bytes = pixel.to_le_bytes();
        for row in 0..h {
            let mut off = self.offset(x, y + row);
            for _ in 0..w {
                self.data[off..off + 4].copy_from_slice(&bytes);
                off += 4;
            }
        }
    }

    /// Copy a rectangle out of the surface, clipped. The result may be
    /// smaller than requested at the edges.
    #[must_use]
    pub fn save_patch(&self, x: u32, y: u32, w: u32, h: u32) -> PixelImage {
        let w = w.min(self.width.saturating_sub(x));
        let h = h.min(self.height.saturating_sub(y));
        let mut image = PixelImage::new(w, h);
        for row in 0..h {
            let mut off = self.offset(x, y + row);
            for col in 0..w {
                let pixel = u32::from_le_bytes([
                    self.data[off],
                    self.data[off + 1],
                    self.data[off + 2],
                    self.data[off + 3],
                ]);
                image.put_pixel(col, row, pixel);
                off += 4;
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_buf(height: u32, pitch: usize) -> Vec<u8> {
        vec![0u8; pitch * height as usize]
    }

    #[test]
    fn xrgb_packs_channels() {
        assert_eq!(xrgb(0xAA, 0xBB, 0xCC), 0x00AA_BBCC);
        assert_eq!(xrgb(0, 0, 0), 0);
    }

    #[test]
    fn image_fill_clips_to_bounds() {
        let mut image = PixelImage::new(4, 3);
        image.fill_rect(2, 1, 10, 10, 7);
        assert_eq!(image.pixel(2, 1), Some(7));
        assert_eq!(image.pixel(3, 2), Some(7));
        assert_eq!(image.pixel(1, 1), Some(0));
        assert_eq!(image.pixel(2, 0), Some(0));
    }

    #[test]
    fn blit_respects_pitch_padding() {
        // Pitch wider than width * 4, as dumb buffers often are.
        let pitch = 4 * 4 + 8;
        let mut buf = surface_buf(2, pitch);
        let mut image = PixelImage::new(2, 2);
        image.fill_rect(0, 0, 2, 2, xrgb(1, 2, 3));
        {
            let mut surface = Surface::new(&mut buf, pitch, 4, 2);
            surface.blit(1, 0, &image);
        }
        // Row 1, pixel at x=1 starts at pitch + 4 bytes.
        assert_eq!(&buf[pitch + 4..pitch + 8], &[3, 2, 1, 0]);
        // Padding bytes stay untouched.
        assert_eq!(&buf[16..24], &[0; 8]);
    }

    #[test]
    fn blit_clips_at_the_edges() {
        let pitch = 3 * 4;
        let mut buf = surface_buf(3, pitch);
        let mut image = PixelImage::new(5, 5);
        image.fill_rect(0, 0, 5, 5, 0xFFFF_FFFF);
        let mut surface = Surface::new(&mut buf, pitch, 3, 3);
        surface.blit(2, 2, &image);
        let patch = surface.save_patch(0, 0, 3, 3);
        assert_eq!(patch.pixel(2, 2), Some(0x00FF_FFFF));
        assert_eq!(patch.pixel(1, 2), Some(0));
        assert_eq!(patch.pixel(2, 1), Some(0));
    }

    #[test]
    fn save_and_blit_round_trip_restores_pixels() {
        let pitch = 6 * 4;
        let mut buf = surface_buf(4, pitch);
        let mut surface = Surface::new(&mut buf, pitch, 6, 4);
        for x in 0..6u32 {
            for y in 0..4u32 {
                surface.fill_rect(x, y, 1, 1, x * 100 + y);
            }
        }
        let saved = surface.save_patch(2, 1, 3, 2);
        surface.fill_rect(2, 1, 3, 2, 0xDEAD);
        surface.blit(2, 1, &saved);
        assert_eq!(surface.save_patch(2, 1, 3, 2), saved);
    }

    #[test]
    fn patches_shrink_at_the_boundary() {
        let pitch = 4 * 4;
        let mut buf = surface_buf(4, pitch);
        let surface = Surface::new(&mut buf, pitch, 4, 4);
        let patch = surface.save_patch(3, 3, 5, 5);
        assert_eq!((patch.width(), patch.height()), (1, 1));
        let off_screen = surface.save_patch(10, 10, 2, 2);
        assert_eq!((off_screen.width(), off_screen.height()), (0, 0));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn surface_strategy() -> impl Strategy<Value = (u32, u32, usize, Vec<u8>)> {
            (1u32..=8, 1u32..=6, 0usize..=8).prop_flat_map(|(w, h, pad)| {
                let pitch = w as usize * 4 + pad;
                proptest::collection::vec(any::<u8>(), pitch * h as usize)
                    .prop_map(move |data| (w, h, pitch, data))
            })
        }

        proptest! {
            /// Saving a patch, scribbling over its area, and blitting the
            /// patch back restores the buffer byte for byte, padding
            /// included, for any rectangle position including overhanging
            /// and fully off-surface ones.
            #[test]
            fn patch_round_trip_is_lossless(
                (w, h, pitch, mut data) in surface_strategy(),
                x in 0u32..12,
                y in 0u32..10,
                pw in 0u32..12,
                ph in 0u32..10,
            ) {
                let before = data.clone();
                let mut surface = Surface::new(&mut data, pitch, w, h);
                let patch = surface.save_patch(x, y, pw, ph);
                surface.fill_rect(x, y, pw, ph, 0xFFFF_FFFF);
                surface.blit(x, y, &patch);
                prop_assert_eq!(data, before);
            }
        }
    }
}
