//! Terminal cell: one grid position's character and styling.
//!
//! A cell stores a single primary codepoint plus its style. Double-width
//! characters occupy two cells: the head carries the codepoint with width 2,
//! the continuation to its right is empty with width 0. Renderers draw the
//! head across both columns and skip continuations.

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

bitflags! {
    /// Style attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StyleFlags: u8 {
        const BOLD = 1 << 0;
        const ITALIC = 1 << 1;
        const STRIKE = 1 << 2;
        const REVERSE = 1 << 3;
    }
}

/// Underline kind, orthogonal to the other style flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Underline {
    #[default]
    None,
    Single,
    Double,
    Curly,
}

/// Color in the terminal hierarchy: default, 16 named, 256 indexed, 24-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    /// Terminal default (SGR 39 / SGR 49).
    #[default]
    Default,
    /// Named color index (0-15): standard 8 plus bright 8.
    Named(u8),
    /// 256-color palette index.
    Indexed(u8),
    /// 24-bit true color.
    Rgb(u8, u8, u8),
}

/// Attributes applied to printed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub flags: StyleFlags,
    pub underline: Underline,
    pub fg: Color,
    pub bg: Color,
}

impl Style {
    /// Reset to default (SGR 0).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A single cell in the terminal grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    /// The character content. A space for empty and erased cells.
    content: char,
    /// Columns covered: 1 narrow, 2 wide head, 0 wide continuation.
    width: u8,
    pub style: Style,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            content: ' ',
            width: 1,
            style: Style::default(),
        }
    }
}

impl Cell {
    /// A narrow cell with the given character and style.
    pub fn narrow(ch: char, style: Style) -> Self {
        Self {
            content: ch,
            width: 1,
            style,
        }
    }

    /// A wide (2-column) character as a `(head, continuation)` pair.
    ///
    /// The head holds the character; the continuation is an empty
    /// placeholder carrying the same style.
    pub fn wide(ch: char, style: Style) -> (Self, Self) {
        let head = Self {
            content: ch,
            width: 2,
            style,
        };
        let continuation = Self {
            content: ' ',
            width: 0,
            style,
        };
        (head, continuation)
    }

    pub fn content(&self) -> char {
        self.content
    }

    /// Columns covered: 1 narrow, 2 wide head, 0 continuation.
    pub fn width(&self) -> u8 {
        self.width
    }

    /// Whether this cell is the head of a double-width character.
    pub fn is_wide(&self) -> bool {
        self.width == 2
    }

    /// Whether this cell is the empty right half of a double-width character.
    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    /// Blank the cell, keeping `bg` (background color erase).
    pub fn erase(&mut self, bg: Color) {
        *self = Self::default();
        self.style.bg = bg;
    }

    /// Display width of a scalar in terminal columns (0, 1, or 2).
    ///
    /// Zero-width scalars (combining marks, format controls) report 0 and
    /// are not representable as cells.
    pub fn display_width(ch: char) -> u8 {
        UnicodeWidthChar::width(ch).unwrap_or(0) as u8
    }
}
