//! Terminal engine.
//!
//! [`Terminal`] owns the parser, two grids (primary and alternate), the
//! cursor, and the mode flags, and turns the child's byte stream into grid
//! edits. Sequences that require an answer (DA, DSR) queue their reply
//! bytes internally; the caller drains them with [`Terminal::take_output`]
//! and writes them back to the child. Pointer input enters through
//! [`Terminal::pointer_moved`] and [`Terminal::pointer_button`] and is
//! encoded according to the mouse modes the child selected.
//!
//! # Invariants
//!
//! 1. The cursor always addresses a real cell: `row < rows`, `col < cols`.
//!    The deferred-wrap state is a separate flag, not an out-of-range
//!    column.
//! 2. The scroll region always satisfies `top < bottom <= rows`.
//! 3. Report bytes appear in `take_output` in the order the requests were
//!    parsed.

use std::io::Write as _;
use std::mem;

use tracing::{debug, trace};

use crate::cell::{Cell, Color, Style, StyleFlags, Underline};
use crate::grid::{DamageSpan, Grid};
use crate::parser::{Action, CsiParam, Parser};

/// Cursor glyph form, selected with DECSCUSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorShape {
    #[default]
    Block,
    Underline,
    Bar,
}

/// Cursor state as the renderer needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
    pub shape: CursorShape,
    pub blink: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            visible: true,
            shape: CursorShape::Block,
            blink: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum MouseProtocol {
    #[default]
    Off,
    /// X10 compatibility (mode 9): presses only.
    Press,
    /// Mode 1000: presses and releases.
    Click,
    /// Mode 1002: clicks plus motion while a button is held.
    Drag,
    /// Mode 1003: all motion.
    Motion,
}

#[derive(Debug, Clone, Copy)]
struct SavedCursor {
    row: u16,
    col: u16,
    style: Style,
    pending_wrap: bool,
}

impl Default for SavedCursor {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            style: Style::default(),
            pending_wrap: false,
        }
    }
}

/// The terminal state machine.
pub struct Terminal {
    parser: Parser,
    grid: Grid,
    /// The inactive screen; swapped with `grid` on alternate-screen entry.
    saved_grid: Grid,
    alternate: bool,
    cursor: Cursor,
    pending_wrap: bool,
    style: Style,
    /// Scroll region rows, `top` inclusive and `bottom` exclusive.
    scroll_top: u16,
    scroll_bottom: u16,
    origin_mode: bool,
    autowrap: bool,
    tabs: Vec<bool>,
    saved_cursor: Option<SavedCursor>,
    mouse_protocol: MouseProtocol,
    sgr_mouse: bool,
    held_button: Option<u8>,
    last_report_cell: Option<(u16, u16)>,
    title: String,
    output: Vec<u8>,
}

impl Terminal {
    /// A terminal of the given size with everything dirty, so the first
    /// damage flush repaints the whole surface. Zero dimensions are
    /// clamped to one.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        let mut grid = Grid::new(rows, cols);
        grid.damage_all();
        let rows = grid.rows();
        let cols = grid.cols();
        Self {
            parser: Parser::new(),
            saved_grid: grid.clone(),
            grid,
            alternate: false,
            cursor: Cursor::default(),
            pending_wrap: false,
            style: Style::default(),
            scroll_top: 0,
            scroll_bottom: rows,
            origin_mode: false,
            autowrap: true,
            tabs: (0..cols).map(|col| col % 8 == 0).collect(),
            saved_cursor: None,
            mouse_protocol: MouseProtocol::Off,
            sgr_mouse: false,
            held_button: None,
            last_report_cell: None,
            title: String::new(),
            output: Vec::new(),
        }
    }

    #[must_use]
    pub fn rows(&self) -> u16 {
        self.grid.rows()
    }

    #[must_use]
    pub fn cols(&self) -> u16 {
        self.grid.cols()
    }

    /// The active screen's cells, for the renderer.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether the child asked for any mouse reporting.
    #[must_use]
    pub fn mouse_reporting(&self) -> bool {
        self.mouse_protocol != MouseProtocol::Off
    }

    /// Parse a chunk of child output and apply it.
    pub fn feed(&mut self, bytes: &[u8]) {
        let actions = self.parser.feed(bytes);
        for action in actions {
            self.apply(action);
        }
    }

    /// Drain the queued reply bytes for the child.
    #[must_use]
    pub fn take_output(&mut self) -> Vec<u8> {
        mem::take(&mut self.output)
    }

    /// Drain the active screen's damage.
    pub fn flush_damage(&mut self) -> Vec<DamageSpan> {
        self.grid.flush_damage()
    }

    /// Mark the whole active screen dirty.
    pub fn damage_all(&mut self) {
        self.grid.damage_all();
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Print(ch) => self.print_char(ch),
            Action::Newline => {
                self.pending_wrap = false;
                self.index_down();
            }
            Action::CarriageReturn => {
                self.pending_wrap = false;
                self.cursor.col = 0;
            }
            Action::Tab => {
                self.pending_wrap = false;
                self.tab_forward(1);
            }
            Action::Backspace => {
                self.pending_wrap = false;
                self.cursor.col = self.cursor.col.saturating_sub(1);
            }
            Action::Bell => debug!("bell"),
            Action::CursorUp(n) => {
                self.pending_wrap = false;
                self.move_up(n);
            }
            Action::CursorDown(n) => {
                self.pending_wrap = false;
                self.move_down(n);
            }
            Action::CursorRight(n) => {
                self.pending_wrap = false;
                self.cursor.col = self.cursor.col.saturating_add(n).min(self.cols() - 1);
            }
            Action::CursorLeft(n) => {
                self.pending_wrap = false;
                self.cursor.col = self.cursor.col.saturating_sub(n);
            }
            Action::CursorNextLine(n) => {
                self.pending_wrap = false;
                self.move_down(n);
                self.cursor.col = 0;
            }
            Action::CursorPrevLine(n) => {
                self.pending_wrap = false;
                self.move_up(n);
                self.cursor.col = 0;
            }
            Action::CursorColumn(col) => {
                self.pending_wrap = false;
                self.cursor.col = col.min(self.cols() - 1);
            }
            Action::CursorRow(row) => {
                self.pending_wrap = false;
                self.set_row(row);
            }
            Action::CursorPosition { row, col } => {
                self.pending_wrap = false;
                self.set_row(row);
                self.cursor.col = col.min(self.cols() - 1);
            }
            Action::EraseInDisplay(mode) => {
                self.pending_wrap = false;
                let (row, col) = (self.cursor.row, self.cursor.col);
                match mode {
                    0 => self.grid.erase_below(row, col, self.style.bg),
                    1 => self.grid.erase_above(row, col, self.style.bg),
                    _ => self.grid.erase_all(self.style.bg),
                }
            }
            Action::EraseInLine(mode) => {
                self.pending_wrap = false;
                let (row, col) = (self.cursor.row, self.cursor.col);
                match mode {
                    0 => self.grid.erase_line_right(row, col, self.style.bg),
                    1 => self.grid.erase_line_left(row, col, self.style.bg),
                    _ => self.grid.erase_line(row, self.style.bg),
                }
            }
            Action::InsertLines(n) => {
                self.pending_wrap = false;
                if self.in_scroll_region() {
                    self.grid
                        .scroll_down(self.cursor.row, self.scroll_bottom, n, self.style.bg);
                }
            }
            Action::DeleteLines(n) => {
                self.pending_wrap = false;
                if self.in_scroll_region() {
                    self.grid
                        .scroll_up(self.cursor.row, self.scroll_bottom, n, self.style.bg);
                }
            }
            Action::InsertChars(n) => {
                self.pending_wrap = false;
                self.grid
                    .insert_chars(self.cursor.row, self.cursor.col, n, self.style.bg);
            }
            Action::DeleteChars(n) => {
                self.pending_wrap = false;
                self.grid
                    .delete_chars(self.cursor.row, self.cursor.col, n, self.style.bg);
            }
            Action::EraseChars(n) => {
                self.pending_wrap = false;
                self.grid
                    .erase_chars(self.cursor.row, self.cursor.col, n, self.style.bg);
            }
            Action::ScrollUp(n) => {
                self.grid
                    .scroll_up(self.scroll_top, self.scroll_bottom, n, self.style.bg);
            }
            Action::ScrollDown(n) => {
                self.grid
                    .scroll_down(self.scroll_top, self.scroll_bottom, n, self.style.bg);
            }
            Action::SetScrollRegion { top, bottom } => self.set_scroll_region(top, bottom),
            Action::Sgr(params) => self.apply_sgr(&params),
            Action::DecSet(modes) => {
                for mode in modes {
                    self.set_dec_mode(mode, true);
                }
            }
            Action::DecRst(modes) => {
                for mode in modes {
                    self.set_dec_mode(mode, false);
                }
            }
            Action::SaveCursor => self.save_cursor(),
            Action::RestoreCursor => self.restore_cursor(),
            Action::Index => {
                self.pending_wrap = false;
                self.index_down();
            }
            Action::ReverseIndex => {
                self.pending_wrap = false;
                self.index_up();
            }
            Action::NextLine => {
                self.pending_wrap = false;
                self.cursor.col = 0;
                self.index_down();
            }
            Action::FullReset => {
                debug!("full reset");
                *self = Self::new(self.rows(), self.cols());
            }
            Action::SetTabStop => {
                self.tabs[self.cursor.col as usize] = true;
            }
            Action::ClearTabStop(mode) => match mode {
                0 => self.tabs[self.cursor.col as usize] = false,
                3 => self.tabs.iter_mut().for_each(|t| *t = false),
                other => trace!(mode = other, "ignoring tab clear mode"),
            },
            Action::BackTab(n) => {
                self.pending_wrap = false;
                self.tab_backward(n);
            }
            Action::DeviceAttributes => {
                // Identify as a VT102.
                self.output.extend_from_slice(b"\x1b[?6c");
            }
            Action::DeviceStatus(report) => self.device_status(report),
            Action::CursorStyle(style) => self.set_cursor_style(style),
            Action::SetTitle(title) => {
                debug!(title = %title, "window title updated");
                self.title = title;
            }
            Action::Unhandled(seq) => {
                trace!(sequence = %seq.escape_ascii(), "dropping unhandled sequence");
            }
        }
    }

    // ── Printing ────────────────────────────────────────────────────

    fn print_char(&mut self, ch: char) {
        let width = u16::from(Cell::display_width(ch));
        if width == 0 {
            trace!(codepoint = ?ch, "dropping zero-width character");
            return;
        }
        let cols = self.cols();
        if self.pending_wrap {
            self.pending_wrap = false;
            self.cursor.col = 0;
            self.index_down();
        }
        // A wide character that cannot fit wraps before printing.
        if width == 2 && self.cursor.col + 1 >= cols && self.autowrap {
            self.cursor.col = 0;
            self.index_down();
        }
        let written = self
            .grid
            .write_printable(self.cursor.row, self.cursor.col, ch, self.style);
        let advanced = self.cursor.col + written;
        if advanced >= cols {
            self.cursor.col = cols - 1;
            if self.autowrap {
                self.pending_wrap = true;
            }
        } else {
            self.cursor.col = advanced;
        }
    }

    // ── Cursor motion ───────────────────────────────────────────────

    fn move_up(&mut self, n: u16) {
        let limit = if self.cursor.row >= self.scroll_top {
            self.scroll_top
        } else {
            0
        };
        self.cursor.row = self.cursor.row.saturating_sub(n).max(limit);
    }

    fn move_down(&mut self, n: u16) {
        let limit = if self.cursor.row < self.scroll_bottom {
            self.scroll_bottom - 1
        } else {
            self.rows() - 1
        };
        self.cursor.row = self.cursor.row.saturating_add(n).min(limit);
    }

    fn set_row(&mut self, row: u16) {
        self.cursor.row = if self.origin_mode {
            self.scroll_top
                .saturating_add(row)
                .min(self.scroll_bottom - 1)
        } else {
            row.min(self.rows() - 1)
        };
    }

    fn index_down(&mut self) {
        if self.cursor.row + 1 == self.scroll_bottom {
            self.grid
                .scroll_up(self.scroll_top, self.scroll_bottom, 1, self.style.bg);
        } else if self.cursor.row + 1 < self.rows() {
            self.cursor.row += 1;
        }
    }

    fn index_up(&mut self) {
        if self.cursor.row == self.scroll_top {
            self.grid
                .scroll_down(self.scroll_top, self.scroll_bottom, 1, self.style.bg);
        } else if self.cursor.row > 0 {
            self.cursor.row -= 1;
        }
    }

    fn in_scroll_region(&self) -> bool {
        self.cursor.row >= self.scroll_top && self.cursor.row < self.scroll_bottom
    }

    fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        self.pending_wrap = false;
        let rows = self.rows();
        let bottom = if bottom == 0 || bottom > rows {
            rows
        } else {
            bottom
        };
        if top < bottom {
            self.scroll_top = top;
            self.scroll_bottom = bottom;
        } else {
            trace!(top, bottom, "ignoring degenerate scroll region");
        }
        self.cursor.col = 0;
        self.cursor.row = if self.origin_mode { self.scroll_top } else { 0 };
    }

    fn tab_forward(&mut self, n: u16) {
        let cols = self.cols();
        let mut col = self.cursor.col;
        for _ in 0..n {
            col = (col + 1..cols)
                .find(|&c| self.tabs[c as usize])
                .unwrap_or(cols - 1);
        }
        self.cursor.col = col;
    }

    fn tab_backward(&mut self, n: u16) {
        let mut col = self.cursor.col;
        for _ in 0..n {
            col = (0..col).rev().find(|&c| self.tabs[c as usize]).unwrap_or(0);
        }
        self.cursor.col = col;
    }

    fn save_cursor(&mut self) {
        self.saved_cursor = Some(SavedCursor {
            row: self.cursor.row,
            col: self.cursor.col,
            style: self.style,
            pending_wrap: self.pending_wrap,
        });
    }

    fn restore_cursor(&mut self) {
        let saved = self.saved_cursor.unwrap_or_default();
        self.cursor.row = saved.row.min(self.rows() - 1);
        self.cursor.col = saved.col.min(self.cols() - 1);
        self.style = saved.style;
        self.pending_wrap = saved.pending_wrap;
    }

    // ── Attributes ──────────────────────────────────────────────────

    fn apply_sgr(&mut self, params: &[CsiParam]) {
        if params.is_empty() {
            self.style.reset();
            return;
        }
        let mut i = 0;
        while i < params.len() {
            let p = &params[i];
            match p.value {
                0 => self.style.reset(),
                1 => self.style.flags.insert(StyleFlags::BOLD),
                3 => self.style.flags.insert(StyleFlags::ITALIC),
                4 => {
                    self.style.underline = match p.subs.first().copied() {
                        Some(0) => Underline::None,
                        Some(2) => Underline::Double,
                        Some(3) => Underline::Curly,
                        _ => Underline::Single,
                    };
                }
                7 => self.style.flags.insert(StyleFlags::REVERSE),
                9 => self.style.flags.insert(StyleFlags::STRIKE),
                21 => self.style.underline = Underline::Double,
                22 => self.style.flags.remove(StyleFlags::BOLD),
                23 => self.style.flags.remove(StyleFlags::ITALIC),
                24 => self.style.underline = Underline::None,
                27 => self.style.flags.remove(StyleFlags::REVERSE),
                29 => self.style.flags.remove(StyleFlags::STRIKE),
                30..=37 => self.style.fg = Color::Named((p.value - 30) as u8),
                38 => {
                    if let Some((color, consumed)) = Self::extended_color(params, i) {
                        self.style.fg = color;
                        i += consumed;
                    }
                }
                39 => self.style.fg = Color::Default,
                40..=47 => self.style.bg = Color::Named((p.value - 40) as u8),
                48 => {
                    if let Some((color, consumed)) = Self::extended_color(params, i) {
                        self.style.bg = color;
                        i += consumed;
                    }
                }
                49 => self.style.bg = Color::Default,
                90..=97 => self.style.fg = Color::Named((p.value - 90 + 8) as u8),
                100..=107 => self.style.bg = Color::Named((p.value - 100 + 8) as u8),
                other => trace!(param = other, "ignoring sgr parameter"),
            }
            i += 1;
        }
    }

    /// Extended 38/48 colors in both the semicolon form (`38;5;n`,
    /// `38;2;r;g;b`) and the colon form (`38:5:n`, `38:2:r:g:b`). Returns
    /// the color and how many extra semicolon parameters were consumed.
    fn extended_color(params: &[CsiParam], i: usize) -> Option<(Color, usize)> {
        let as_u8 = |v: u16| v.min(255) as u8;
        let subs = params[i].subs.as_slice();
        if !subs.is_empty() {
            return match *subs {
                [5, n] => Some((Color::Indexed(as_u8(n)), 0)),
                [2, r, g, b] => Some((Color::Rgb(as_u8(r), as_u8(g), as_u8(b)), 0)),
                // The colorspace-id variant: 38:2::r:g:b.
                [2, _, r, g, b] => Some((Color::Rgb(as_u8(r), as_u8(g), as_u8(b)), 0)),
                _ => None,
            };
        }
        match params.get(i + 1).map(|p| p.value) {
            Some(5) => {
                let n = params.get(i + 2)?.value;
                Some((Color::Indexed(as_u8(n)), 2))
            }
            Some(2) => {
                let r = params.get(i + 2)?.value;
                let g = params.get(i + 3)?.value;
                let b = params.get(i + 4)?.value;
                Some((Color::Rgb(as_u8(r), as_u8(g), as_u8(b)), 4))
            }
            _ => None,
        }
    }

    // ── Modes ───────────────────────────────────────────────────────

    fn set_dec_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            6 => {
                self.origin_mode = enable;
                self.pending_wrap = false;
                self.cursor.col = 0;
                self.cursor.row = if enable { self.scroll_top } else { 0 };
            }
            7 => {
                self.autowrap = enable;
                if !enable {
                    self.pending_wrap = false;
                }
            }
            9 => self.set_mouse(MouseProtocol::Press, enable),
            12 => self.cursor.blink = enable,
            25 => self.cursor.visible = enable,
            47 => self.switch_screen(enable),
            1000 => self.set_mouse(MouseProtocol::Click, enable),
            1002 => self.set_mouse(MouseProtocol::Drag, enable),
            1003 => self.set_mouse(MouseProtocol::Motion, enable),
            1006 => self.sgr_mouse = enable,
            1047 => {
                if !enable && self.alternate {
                    // Leaving clears the alternate screen behind us.
                    self.grid.erase_all(self.style.bg);
                }
                self.switch_screen(enable);
            }
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.switch_screen(true);
                    if self.alternate {
                        self.grid.erase_all(self.style.bg);
                        self.cursor.row = 0;
                        self.cursor.col = 0;
                        self.pending_wrap = false;
                    }
                } else {
                    self.switch_screen(false);
                    self.restore_cursor();
                }
            }
            other => trace!(mode = other, enable, "ignoring dec mode"),
        }
    }

    fn switch_screen(&mut self, to_alternate: bool) {
        if self.alternate == to_alternate {
            return;
        }
        mem::swap(&mut self.grid, &mut self.saved_grid);
        self.alternate = to_alternate;
        self.grid.damage_all();
    }

    fn set_mouse(&mut self, protocol: MouseProtocol, enable: bool) {
        if enable {
            self.mouse_protocol = protocol;
        } else if self.mouse_protocol == protocol {
            self.mouse_protocol = MouseProtocol::Off;
        }
        self.last_report_cell = None;
    }

    fn set_cursor_style(&mut self, style: u16) {
        let (shape, blink) = match style {
            0 | 1 => (CursorShape::Block, true),
            2 => (CursorShape::Block, false),
            3 => (CursorShape::Underline, true),
            4 => (CursorShape::Underline, false),
            5 => (CursorShape::Bar, true),
            6 => (CursorShape::Bar, false),
            other => {
                trace!(style = other, "ignoring unknown cursor style");
                return;
            }
        };
        self.cursor.shape = shape;
        self.cursor.blink = blink;
    }

    // ── Reports ─────────────────────────────────────────────────────

    fn device_status(&mut self, report: u16) {
        match report {
            5 => self.output.extend_from_slice(b"\x1b[0n"),
            6 => {
                let row = if self.origin_mode {
                    self.cursor.row.saturating_sub(self.scroll_top)
                } else {
                    self.cursor.row
                };
                let _ = write!(self.output, "\x1b[{};{}R", row + 1, self.cursor.col + 1);
            }
            other => trace!(report = other, "ignoring status request"),
        }
    }

    // ── Pointer input ───────────────────────────────────────────────

    /// Report pointer motion to the child if the active mouse mode wants
    /// it. Repeated reports from the same cell are suppressed.
    pub fn pointer_moved(&mut self, row: u16, col: u16) {
        let reportable = match self.mouse_protocol {
            MouseProtocol::Motion => true,
            MouseProtocol::Drag => self.held_button.is_some(),
            _ => false,
        };
        if !reportable || self.last_report_cell == Some((row, col)) {
            return;
        }
        self.last_report_cell = Some((row, col));
        // Motion adds 32 to the button code; 3 means no button held.
        let cb = 32 + self.held_button.unwrap_or(3);
        self.encode_mouse(cb, row, col, true);
    }

    /// Report a button press or release. `button` is 0 left, 1 middle,
    /// 2 right.
    pub fn pointer_button(&mut self, button: u8, pressed: bool, row: u16, col: u16) {
        let button = button.min(2);
        if pressed {
            self.held_button = Some(button);
        } else if self.held_button == Some(button) {
            self.held_button = None;
        }
        if self.mouse_protocol == MouseProtocol::Off {
            return;
        }
        if !pressed && self.mouse_protocol == MouseProtocol::Press {
            return;
        }
        self.last_report_cell = Some((row, col));
        let cb = if pressed || self.sgr_mouse { button } else { 3 };
        self.encode_mouse(cb, row, col, pressed);
    }

    fn encode_mouse(&mut self, cb: u8, row: u16, col: u16, press: bool) {
        if self.sgr_mouse {
            let tail = if press { 'M' } else { 'm' };
            let _ = write!(self.output, "\x1b[<{};{};{}{}", cb, col + 1, row + 1, tail);
        } else {
            // Byte encoding caps coordinates at 222 (255 - 33).
            let col = col.min(222) as u8;
            let row = row.min(222) as u8;
            self.output
                .extend_from_slice(&[0x1b, b'[', b'M', 32 + cb, 33 + col, 33 + row]);
        }
    }
}
