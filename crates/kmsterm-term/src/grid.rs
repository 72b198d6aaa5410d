//! The cell grid.
//!
//! A fixed-size, row-major matrix of [`Cell`]s plus per-row damage spans.
//! Every mutation widens affected spans over wide-character pairs so a
//! head cell and its continuation are never split by an edit, and taints
//! the damage map so the renderer repaints exactly what changed.
//!
//! Erase operations take an explicit background color: erased cells keep
//! the current background the way hardware terminals do.

use crate::cell::{Cell, Color, Style};

/// A half-open dirty column range on one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageSpan {
    pub row: u16,
    pub start: u16,
    pub end: u16,
}

/// Fixed-size cell matrix with damage tracking.
#[derive(Debug, Clone)]
pub struct Grid {
    rows: u16,
    cols: u16,
    cells: Vec<Cell>,
    damage: Vec<Option<(u16, u16)>>,
}

impl Grid {
    /// A blank grid of the given size. Zero dimensions are clamped to one.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Self {
            rows,
            cols,
            cells: vec![Cell::default(); rows as usize * cols as usize],
            damage: vec![None; rows as usize],
        }
    }

    #[must_use]
    pub fn rows(&self) -> u16 {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> u16 {
        self.cols
    }

    fn idx(&self, row: u16, col: u16) -> usize {
        row as usize * self.cols as usize + col as usize
    }

    /// The cell at a position, if in bounds.
    #[must_use]
    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        (row < self.rows && col < self.cols).then(|| &self.cells[self.idx(row, col)])
    }

    /// Up to `count` cells starting at a position, clamped to the row end.
    /// Out-of-bounds positions yield an empty slice.
    #[must_use]
    pub fn cells(&self, row: u16, col: u16, count: u16) -> &[Cell] {
        if row >= self.rows || col >= self.cols {
            return &[];
        }
        let end = col.saturating_add(count).min(self.cols);
        &self.cells[self.idx(row, col)..self.idx(row, end)]
    }

    /// Write one printable character at a position and return the number of
    /// columns it occupied (0 for zero-width input or out-of-bounds writes).
    ///
    /// Overwriting half of a wide pair blanks the other half. A wide
    /// character that would not fit in the final column blanks that column
    /// instead.
    pub fn write_printable(&mut self, row: u16, col: u16, ch: char, style: Style) -> u16 {
        if row >= self.rows || col >= self.cols {
            return 0;
        }
        match Cell::display_width(ch) {
            0 => 0,
            2 if col + 1 >= self.cols => {
                self.split_wide_at(row, col);
                let i = self.idx(row, col);
                self.cells[i].erase(style.bg);
                self.taint(row, col, col + 1);
                1
            }
            2 => {
                self.split_wide_at(row, col);
                self.split_wide_at(row, col + 1);
                let (head, continuation) = Cell::wide(ch, style);
                let i = self.idx(row, col);
                self.cells[i] = head;
                self.cells[i + 1] = continuation;
                self.taint(row, col, col + 2);
                2
            }
            _ => {
                self.split_wide_at(row, col);
                let i = self.idx(row, col);
                self.cells[i] = Cell::narrow(ch, style);
                self.taint(row, col, col + 1);
                1
            }
        }
    }

    /// Blank the partner of a wide pair before the cell at `col` is
    /// overwritten, keeping the partner's background.
    fn split_wide_at(&mut self, row: u16, col: u16) {
        let i = self.idx(row, col);
        if self.cells[i].is_continuation() && col > 0 {
            let head = self.idx(row, col - 1);
            let bg = self.cells[head].style.bg;
            self.cells[head].erase(bg);
            self.taint(row, col - 1, col);
        } else if self.cells[i].is_wide() && col + 1 < self.cols {
            let cont = self.idx(row, col + 1);
            let bg = self.cells[cont].style.bg;
            self.cells[cont].erase(bg);
            self.taint(row, col + 1, col + 2);
        }
    }

    /// Grow a half-open span so it never cuts a wide pair in half.
    fn widen_span(&self, row: u16, mut start: u16, mut end: u16) -> (u16, u16) {
        while start > 0 && self.cells[self.idx(row, start)].is_continuation() {
            start -= 1;
        }
        while end < self.cols && self.cells[self.idx(row, end)].is_continuation() {
            end += 1;
        }
        (start, end)
    }

    fn blank_span(&mut self, row: u16, start: u16, end: u16, bg: Color) {
        let start = start.min(self.cols);
        let end = end.min(self.cols);
        if start >= end {
            return;
        }
        let (start, end) = self.widen_span(row, start, end);
        for col in start..end {
            let i = self.idx(row, col);
            self.cells[i].erase(bg);
        }
        self.taint(row, start, end);
    }

    /// EL 0: blank from `col` to the end of the row, inclusive.
    pub fn erase_line_right(&mut self, row: u16, col: u16, bg: Color) {
        if row >= self.rows {
            return;
        }
        self.blank_span(row, col, self.cols, bg);
    }

    /// EL 1: blank from the start of the row through `col`, inclusive.
    pub fn erase_line_left(&mut self, row: u16, col: u16, bg: Color) {
        if row >= self.rows {
            return;
        }
        self.blank_span(row, 0, col.saturating_add(1), bg);
    }

    /// EL 2: blank the whole row.
    pub fn erase_line(&mut self, row: u16, bg: Color) {
        if row >= self.rows {
            return;
        }
        self.blank_span(row, 0, self.cols, bg);
    }

    /// ED 0: blank from the cursor to the end of the display.
    pub fn erase_below(&mut self, row: u16, col: u16, bg: Color) {
        if row >= self.rows {
            return;
        }
        self.erase_line_right(row, col, bg);
        for r in row + 1..self.rows {
            self.erase_line(r, bg);
        }
    }

    /// ED 1: blank from the start of the display through the cursor.
    pub fn erase_above(&mut self, row: u16, col: u16, bg: Color) {
        if row >= self.rows {
            return;
        }
        for r in 0..row {
            self.erase_line(r, bg);
        }
        self.erase_line_left(row, col, bg);
    }

    /// ED 2: blank the whole display.
    pub fn erase_all(&mut self, bg: Color) {
        for row in 0..self.rows {
            self.erase_line(row, bg);
        }
    }

    /// ECH: blank `count` cells from `col` without shifting the rest.
    pub fn erase_chars(&mut self, row: u16, col: u16, count: u16, bg: Color) {
        if row >= self.rows || col >= self.cols || count == 0 {
            return;
        }
        self.blank_span(row, col, col.saturating_add(count), bg);
    }

    /// ICH: shift the tail of the row right by `count`, inserting blanks at
    /// `col`. Cells pushed past the row end are dropped.
    pub fn insert_chars(&mut self, row: u16, col: u16, count: u16, bg: Color) {
        if row >= self.rows || col >= self.cols || count == 0 {
            return;
        }
        let count = count.min(self.cols - col);
        self.split_wide_at(row, col);
        let start = self.idx(row, col);
        let end = self.idx(row, self.cols);
        self.cells
            .copy_within(start..end - count as usize, start + count as usize);
        for c in col..col + count {
            let i = self.idx(row, c);
            self.cells[i].erase(bg);
        }
        // A head shifted into the final column lost its continuation.
        let last = self.idx(row, self.cols - 1);
        if self.cells[last].is_wide() {
            let bg = self.cells[last].style.bg;
            self.cells[last].erase(bg);
        }
        self.taint(row, col, self.cols);
    }

    /// DCH: shift the tail of the row left by `count` into `col`, blanking
    /// the vacated cells at the row end.
    pub fn delete_chars(&mut self, row: u16, col: u16, count: u16, bg: Color) {
        if row >= self.rows || col >= self.cols || count == 0 {
            return;
        }
        let count = count.min(self.cols - col);
        self.split_wide_at(row, col);
        if col + count < self.cols {
            // The first kept cell must not be an orphaned continuation.
            let i = self.idx(row, col + count);
            if self.cells[i].is_continuation() {
                let bg = self.cells[i].style.bg;
                self.cells[i].erase(bg);
            }
        }
        let start = self.idx(row, col);
        let kept = self.idx(row, col + count);
        let end = self.idx(row, self.cols);
        self.cells.copy_within(kept..end, start);
        for c in self.cols - count..self.cols {
            let i = self.idx(row, c);
            self.cells[i].erase(bg);
        }
        self.taint(row, col, self.cols);
    }

    /// Move rows `[top + count, bottom)` up by `count` and blank the bottom
    /// of the region. `bottom` is exclusive.
    pub fn scroll_up(&mut self, top: u16, bottom: u16, count: u16, bg: Color) {
        if top >= bottom || bottom > self.rows || count == 0 {
            return;
        }
        let height = bottom - top;
        let count = count.min(height);
        let len = (height - count) as usize * self.cols as usize;
        let src = self.idx(top + count, 0);
        let dst = self.idx(top, 0);
        self.cells.copy_within(src..src + len, dst);
        for row in bottom - count..bottom {
            self.erase_line(row, bg);
        }
        for row in top..bottom {
            self.taint(row, 0, self.cols);
        }
    }

    /// Move rows `[top, bottom - count)` down by `count` and blank the top
    /// of the region. `bottom` is exclusive.
    pub fn scroll_down(&mut self, top: u16, bottom: u16, count: u16, bg: Color) {
        if top >= bottom || bottom > self.rows || count == 0 {
            return;
        }
        let height = bottom - top;
        let count = count.min(height);
        let len = (height - count) as usize * self.cols as usize;
        let src = self.idx(top, 0);
        let dst = self.idx(top + count, 0);
        self.cells.copy_within(src..src + len, dst);
        for row in top..top + count {
            self.erase_line(row, bg);
        }
        for row in top..bottom {
            self.taint(row, 0, self.cols);
        }
    }

    fn taint(&mut self, row: u16, start: u16, end: u16) {
        if row >= self.rows || start >= end {
            return;
        }
        let end = end.min(self.cols);
        let span = &mut self.damage[row as usize];
        *span = Some(match *span {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    /// Mark every cell dirty.
    pub fn damage_all(&mut self) {
        for row in 0..self.rows {
            self.taint(row, 0, self.cols);
        }
    }

    /// Drain the accumulated damage, one merged span per dirty row.
    pub fn flush_damage(&mut self) -> Vec<DamageSpan> {
        let mut out = Vec::new();
        for (row, span) in self.damage.iter_mut().enumerate() {
            if let Some((start, end)) = span.take() {
                out.push(DamageSpan {
                    row: row as u16,
                    start,
                    end,
                });
            }
        }
        out
    }
}
