//! Font file discovery.
//!
//! An explicit `--font` path is used as-is; otherwise a fixed list of
//! well-known monospace font locations is probed in order.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Rendering errors.
#[derive(Debug)]
pub enum RenderError {
    /// No font file could be read; lists every path that was tried.
    FontUnavailable { searched: Vec<PathBuf> },
    /// The font file was read but could not be parsed.
    FontParse(&'static str),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FontUnavailable { searched } => {
                write!(f, "no usable font; searched:")?;
                for path in searched {
                    write!(f, " {}", path.display())?;
                }
                Ok(())
            }
            Self::FontParse(reason) => write!(f, "failed to parse font: {reason}"),
        }
    }
}

impl Error for RenderError {}

pub type RenderResult<T> = Result<T, RenderError>;

pub const FONT_SEARCH_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
    "/usr/share/fonts/liberation-fonts/LiberationMono-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansMono-Regular.ttf",
    "/usr/share/fonts/noto/NotoSansMono-Regular.ttf",
];

/// Read a font file from an explicit path, or the first hit from the
/// search list.
pub fn load_font(explicit: Option<&Path>) -> RenderResult<Vec<u8>> {
    if let Some(path) = explicit {
        return match fs::read(path) {
            Ok(data) => {
                tracing::info!(path = %path.display(), "using font");
                Ok(data)
            }
            Err(_) => Err(RenderError::FontUnavailable {
                searched: vec![path.to_path_buf()],
            }),
        };
    }
    for candidate in FONT_SEARCH_PATHS {
        if let Ok(data) = fs::read(candidate) {
            tracing::info!(path = %candidate, "using font");
            return Ok(data);
        }
        tracing::trace!(path = %candidate, "font candidate missing");
    }
    Err(RenderError::FontUnavailable {
        searched: FONT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_path_reports_what_was_searched() {
        let missing = Path::new("/nonexistent/kmsterm-font.ttf");
        match load_font(Some(missing)) {
            Err(RenderError::FontUnavailable { searched }) => {
                assert_eq!(searched, vec![missing.to_path_buf()]);
            }
            other => panic!("expected FontUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn explicit_path_reads_the_bytes() {
        let path = std::env::temp_dir().join("kmsterm-render-font-probe.bin");
        fs::write(&path, b"not really a font").unwrap();
        let data = load_font(Some(&path)).unwrap();
        assert_eq!(data, b"not really a font");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn errors_render_readable_messages() {
        let err = RenderError::FontUnavailable {
            searched: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        assert_eq!(err.to_string(), "no usable font; searched: /a /b");
        assert_eq!(
            RenderError::FontParse("bad tables").to_string(),
            "failed to parse font: bad tables"
        );
    }
}
