//! Font rasterization and pixel compositing.
//!
//! This crate turns terminal cells into pixels and moves them onto a
//! mapped framebuffer:
//!
//! - [`font`]: font discovery and loading with a built-in search list.
//! - [`renderer`]: a fontdue-backed cell rasterizer with a glyph cache,
//!   palette resolution, and text decorations.
//! - [`pixel`]: [`PixelImage`] buffers and the [`Surface`] view over raw
//!   XRGB8888 bytes, with clipped blits and rectangle fills.
//!
//! Nothing here talks to the kernel; the caller owns the framebuffer
//! mapping and hands out [`Surface`]s over it.

pub mod font;
pub mod pixel;
pub mod renderer;

pub use font::{FONT_SEARCH_PATHS, RenderError, RenderResult, load_font};
pub use pixel::{PixelImage, Surface, xrgb};
pub use renderer::{Renderer, resolve_color};
