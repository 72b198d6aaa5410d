//! Terminal emulation for kmsterm: cell grid, VT/ANSI parser, and the
//! engine that ties them together.
//!
//! The crate is deliberately display-agnostic. [`Terminal`] consumes the
//! child's output bytes and exposes three things to its caller: the cell
//! grid, a drained damage list saying which cells changed, and queued
//! reply bytes (cursor position reports and similar) to write back to the
//! child. Rendering, scanout, and input routing live elsewhere.
//!
//! ```
//! use kmsterm_term::Terminal;
//!
//! let mut term = Terminal::new(24, 80);
//! term.feed(b"\x1b[31mhello\x1b[0m");
//! let cell = term.grid().cell(0, 0).copied();
//! assert_eq!(cell.map(|c| c.content()), Some('h'));
//! ```

pub mod cell;
pub mod grid;
pub mod parser;
pub mod terminal;

pub use cell::{Cell, Color, Style, StyleFlags, Underline};
pub use grid::{DamageSpan, Grid};
pub use parser::{Action, CsiParam, Parser};
pub use terminal::{Cursor, CursorShape, Terminal};
