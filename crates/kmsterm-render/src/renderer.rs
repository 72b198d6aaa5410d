//! Cell-span rasterizer.
//!
//! [`Renderer`] turns runs of terminal cells into [`PixelImage`]s: solid
//! background, glyph coverage blended over it, and the decoration set
//! (synthetic bold, underline variants, strike-through, reverse video).
//! The cell box is derived from the font's line metrics and the advance
//! of a reference glyph, so every cell in a monospace face lands on the
//! same grid. Rasterized glyphs are cached per codepoint and boldness.

use std::collections::HashMap;
use std::mem;

use fontdue::{Font, FontSettings, Metrics};
use kmsterm_term::{Cell, Color, StyleFlags, Underline};

use crate::font::{RenderError, RenderResult};
use crate::pixel::{PixelImage, xrgb};

/// The standard 16-entry palette, VGA values.
const PALETTE: [u32; 16] = [
    xrgb(0, 0, 0),
    xrgb(170, 0, 0),
    xrgb(0, 170, 0),
    xrgb(170, 170, 0),
    xrgb(0, 0, 170),
    xrgb(170, 0, 170),
    xrgb(0, 170, 170),
    xrgb(170, 170, 170),
    xrgb(85, 85, 85),
    xrgb(255, 85, 85),
    xrgb(85, 255, 85),
    xrgb(255, 255, 85),
    xrgb(85, 85, 255),
    xrgb(255, 85, 255),
    xrgb(85, 255, 255),
    xrgb(255, 255, 255),
];

struct Glyph {
    metrics: Metrics,
    /// Coverage row width; one wider than `metrics.width` for bold.
    width: usize,
    coverage: Vec<u8>,
}

/// Rasterizes cell spans with a single monospace font.
pub struct Renderer {
    font: Font,
    px: f32,
    cell_width: u32,
    cell_height: u32,
    baseline: i32,
    cache: HashMap<(char, bool), Glyph>,
}

impl Renderer {
    /// Parse the font and derive the cell box for `point_size` at `dpi`.
    pub fn new(font_data: Vec<u8>, point_size: f32, dpi: u32) -> RenderResult<Self> {
        let font = Font::from_bytes(font_data, FontSettings::default())
            .map_err(RenderError::FontParse)?;
        let px = point_size * dpi as f32 / 72.0;
        let line = font
            .horizontal_line_metrics(px)
            .ok_or(RenderError::FontParse("missing horizontal line metrics"))?;
        let reference = font.metrics('M', px);
        let cell_width = (reference.advance_width.round() as u32).max(1);
        let cell_height = (line.new_line_size.ceil() as u32).max(1);
        let baseline = line.ascent.round() as i32;
        tracing::info!(cell_width, cell_height, px, "font ready");
        Ok(Self {
            font,
            px,
            cell_width,
            cell_height,
            baseline,
            cache: HashMap::new(),
        })
    }

    /// The cell box in pixels.
    #[must_use]
    pub fn cell_size(&self) -> (u32, u32) {
        (self.cell_width, self.cell_height)
    }

    /// Rasterize a run of cells into one image, one cell box per column.
    /// Wide heads take two boxes; continuation cells contribute nothing of
    /// their own.
    pub fn render_span(&mut self, cells: &[Cell]) -> PixelImage {
        let cols: u32 = cells.iter().map(|c| u32::from(c.width())).sum();
        let mut image = PixelImage::new(cols * self.cell_width, self.cell_height);
        let mut x = 0;
        for cell in cells {
            if cell.is_continuation() {
                continue;
            }
            let span = u32::from(cell.width()) * self.cell_width;
            self.draw_cell(&mut image, x, span, cell);
            x += span;
        }
        image
    }

    fn draw_cell(&mut self, image: &mut PixelImage, x: u32, span: u32, cell: &Cell) {
        let style = cell.style;
        let mut fg = resolve_color(style.fg, true);
        let mut bg = resolve_color(style.bg, false);
        if style.flags.contains(StyleFlags::REVERSE) {
            mem::swap(&mut fg, &mut bg);
        }
        let cell_height = self.cell_height;
        let baseline = self.baseline;
        image.fill_rect(x, 0, span, cell_height, bg);

        let ch = cell.content();
        if ch != ' ' {
            let bold = style.flags.contains(StyleFlags::BOLD);
            let glyph = self.glyph(ch, bold);
            let gx = x as i32 + glyph.metrics.xmin;
            let gy = baseline - glyph.metrics.height as i32 - glyph.metrics.ymin;
            let right = (x + span) as i32;
            for (row, line) in glyph.coverage.chunks_exact(glyph.width.max(1)).enumerate() {
                let py = gy + row as i32;
                if py < 0 || py >= cell_height as i32 {
                    continue;
                }
                for (col, &alpha) in line.iter().enumerate() {
                    if alpha == 0 {
                        continue;
                    }
                    let px = gx + col as i32;
                    if px < x as i32 || px >= right {
                        continue;
                    }
                    image.put_pixel(px as u32, py as u32, blend(fg, bg, alpha));
                }
            }
        }

        let thickness = (cell_height / 16).max(1);
        let max_y = cell_height.saturating_sub(thickness);
        let under_y = (baseline.max(0) as u32 + 1).min(max_y);
        match style.underline {
            Underline::None => {}
            Underline::Single => image.fill_rect(x, under_y, span, thickness, fg),
            Underline::Double => {
                image.fill_rect(x, under_y, span, thickness, fg);
                image.fill_rect(x, (under_y + 2 * thickness).min(max_y), span, thickness, fg);
            }
            Underline::Curly => {
                // A 4-step triangle wave, two pixels per step.
                for col in 0..span {
                    let step = ((x + col) / 2) % 4;
                    let dy = [0, 1, 2, 1][step as usize] * thickness;
                    image.fill_rect(x + col, (under_y + dy).min(max_y), 1, thickness, fg);
                }
            }
        }
        if style.flags.contains(StyleFlags::STRIKE) {
            let strike_y = (baseline.max(0) as u32 * 2 / 3).min(max_y);
            image.fill_rect(x, strike_y, span, thickness, fg);
        }
    }

    fn glyph(&mut self, ch: char, bold: bool) -> &Glyph {
        let font = &self.font;
        let px = self.px;
        self.cache.entry((ch, bold)).or_insert_with(|| {
            let (metrics, coverage) = font.rasterize(ch, px);
            if bold {
                Glyph {
                    metrics,
                    width: metrics.width + 1,
                    coverage: embolden(&coverage, metrics.width),
                }
            } else {
                Glyph {
                    metrics,
                    width: metrics.width,
                    coverage,
                }
            }
        })
    }
}

/// Synthetic bold: merge the coverage with itself shifted one pixel
/// right, producing rows one pixel wider.
fn embolden(coverage: &[u8], width: usize) -> Vec<u8> {
    if width == 0 {
        return Vec::new();
    }
    let height = coverage.len() / width;
    let wide = width + 1;
    let mut out = vec![0u8; wide * height];
    for row in 0..height {
        for col in 0..width {
            let v = coverage[row * width + col];
            let base = row * wide + col;
            out[base] = out[base].max(v);
            out[base + 1] = out[base + 1].max(v);
        }
    }
    out
}

/// Map a terminal color to a pixel. Defaults resolve to palette white on
/// black.
#[must_use]
pub fn resolve_color(color: Color, foreground: bool) -> u32 {
    match color {
        Color::Default => {
            if foreground {
                PALETTE[7]
            } else {
                PALETTE[0]
            }
        }
        Color::Named(n) => PALETTE[n as usize & 15],
        Color::Indexed(n) => indexed_color(n),
        Color::Rgb(r, g, b) => xrgb(r, g, b),
    }
}

fn indexed_color(index: u8) -> u32 {
    match index {
        0..=15 => PALETTE[index as usize],
        16..=231 => {
            // 6x6x6 cube.
            let n = u32::from(index) - 16;
            let level = |v: u32| if v == 0 { 0 } else { 55 + 40 * v };
            let r = level(n / 36);
            let g = level((n / 6) % 6);
            let b = level(n % 6);
            r << 16 | g << 8 | b
        }
        232..=255 => {
            // Grayscale ramp.
            let v = 8 + 10 * (u32::from(index) - 232);
            v << 16 | v << 8 | v
        }
    }
}

fn blend(fg: u32, bg: u32, alpha: u8) -> u32 {
    match alpha {
        0 => bg,
        255 => fg,
        _ => {
            let a = u32::from(alpha);
            let channel = |shift: u32| {
                let f = (fg >> shift) & 0xFF;
                let b = (bg >> shift) & 0xFF;
                ((f * a + b * (255 - a)) / 255) & 0xFF
            };
            channel(16) << 16 | channel(8) << 8 | channel(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_colors_follow_the_vga_table() {
        assert_eq!(resolve_color(Color::Named(1), true), xrgb(170, 0, 0));
        assert_eq!(resolve_color(Color::Named(11), true), xrgb(255, 255, 85));
        // Out-of-range names wrap into the table.
        assert_eq!(resolve_color(Color::Named(17), true), xrgb(170, 0, 0));
    }

    #[test]
    fn defaults_are_white_on_black() {
        assert_eq!(resolve_color(Color::Default, true), xrgb(170, 170, 170));
        assert_eq!(resolve_color(Color::Default, false), 0);
    }

    #[test]
    fn indexed_colors_cover_cube_and_grayscale() {
        assert_eq!(resolve_color(Color::Indexed(1), true), PALETTE[1]);
        assert_eq!(resolve_color(Color::Indexed(16), true), 0);
        assert_eq!(resolve_color(Color::Indexed(196), true), xrgb(255, 0, 0));
        assert_eq!(resolve_color(Color::Indexed(231), true), xrgb(255, 255, 255));
        assert_eq!(resolve_color(Color::Indexed(232), true), xrgb(8, 8, 8));
        assert_eq!(resolve_color(Color::Indexed(255), true), xrgb(238, 238, 238));
    }

    #[test]
    fn truecolor_passes_through() {
        assert_eq!(resolve_color(Color::Rgb(1, 2, 3), true), xrgb(1, 2, 3));
    }

    #[test]
    fn blend_interpolates_between_endpoints() {
        let fg = xrgb(255, 255, 255);
        let bg = xrgb(0, 0, 0);
        assert_eq!(blend(fg, bg, 0), bg);
        assert_eq!(blend(fg, bg, 255), fg);
        assert_eq!(blend(fg, bg, 128), xrgb(128, 128, 128));
        assert_eq!(blend(xrgb(100, 0, 0), xrgb(0, 0, 100), 255), xrgb(100, 0, 0));
    }

    #[test]
    fn embolden_merges_a_shifted_copy() {
        // A 2x1 glyph becomes 3x1 with the maximum of both strikes.
        let out = embolden(&[200, 100], 2);
        assert_eq!(out, vec![200, 200, 100]);
        assert!(embolden(&[], 0).is_empty());
    }

    #[test]
    fn embolden_keeps_rows_independent() {
        let out = embolden(&[255, 0, 0, 255], 2);
        assert_eq!(out, vec![255, 255, 0, 0, 255, 255]);
    }
}
