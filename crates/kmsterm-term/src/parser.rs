//! VT/ANSI parser.
//!
//! A deterministic state machine converting the child's output byte stream
//! into typed actions for the terminal engine:
//!
//! - printable characters (ASCII + incremental UTF-8) -> [`Action::Print`]
//! - C0 controls -> dedicated actions
//! - CSI sequences (cursor, erase, scroll, SGR, DEC private modes, reports)
//! - OSC sequences (title), ignored to their terminator otherwise
//! - ESC-level sequences (cursor save/restore, index, full reset)
//!
//! Anything outside the recognized set is still consumed as a complete
//! sequence and surfaces as [`Action::Unhandled`], which the engine logs at
//! `trace` and drops; unknown output must never leak into the grid as text.

/// One CSI parameter with its colon-separated subparameters (`4:3`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CsiParam {
    pub value: u16,
    pub subs: Vec<u16>,
}

impl CsiParam {
    fn plain(value: u16) -> Self {
        Self {
            value,
            subs: Vec::new(),
        }
    }
}

/// Parser output actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Print a single character (ASCII or decoded UTF-8).
    Print(char),
    /// Line feed; VT and FF are folded into this.
    Newline,
    /// Carriage return.
    CarriageReturn,
    /// Horizontal tab.
    Tab,
    /// Backspace.
    Backspace,
    /// Bell.
    Bell,
    /// CUU (`CSI Ps A`): cursor up by count (default 1).
    CursorUp(u16),
    /// CUD (`CSI Ps B`): cursor down by count (default 1).
    CursorDown(u16),
    /// CUF (`CSI Ps C`): cursor right by count (default 1).
    CursorRight(u16),
    /// CUB (`CSI Ps D`): cursor left by count (default 1).
    CursorLeft(u16),
    /// CNL (`CSI Ps E`): cursor down by count, to column 0.
    CursorNextLine(u16),
    /// CPL (`CSI Ps F`): cursor up by count, to column 0.
    CursorPrevLine(u16),
    /// CHA (`CSI Ps G`): cursor to absolute column (0-indexed).
    CursorColumn(u16),
    /// VPA (`CSI Ps d`): cursor to absolute row (0-indexed).
    CursorRow(u16),
    /// CUP/HVP: cursor to absolute 0-indexed row/col.
    CursorPosition { row: u16, col: u16 },
    /// ED (`CSI Ps J`): 0 below, 1 above, 2 all.
    EraseInDisplay(u8),
    /// EL (`CSI Ps K`): 0 right, 1 left, 2 line.
    EraseInLine(u8),
    /// IL (`CSI Ps L`): insert blank lines at the cursor row.
    InsertLines(u16),
    /// DL (`CSI Ps M`): delete lines at the cursor row.
    DeleteLines(u16),
    /// ICH (`CSI Ps @`): insert blank cells at the cursor column.
    InsertChars(u16),
    /// DCH (`CSI Ps P`): delete cells at the cursor column.
    DeleteChars(u16),
    /// ECH (`CSI Ps X`): blank cells at the cursor without shifting.
    EraseChars(u16),
    /// SU (`CSI Ps S`): scroll the region up by count.
    ScrollUp(u16),
    /// SD (`CSI Ps T`): scroll the region down by count.
    ScrollDown(u16),
    /// DECSTBM (`CSI Pt ; Pb r`): scroll region. `top` is 0-indexed
    /// inclusive; `bottom == 0` means "full height" since the parser does
    /// not know the grid size, otherwise 0-indexed exclusive.
    SetScrollRegion { top: u16, bottom: u16 },
    /// SGR (`CSI ... m`): raw attribute parameters; the engine interprets
    /// them since they are stateful.
    Sgr(Vec<CsiParam>),
    /// DECSET (`CSI ? Pm h`).
    DecSet(Vec<u16>),
    /// DECRST (`CSI ? Pm l`).
    DecRst(Vec<u16>),
    /// DECSC (`ESC 7`) / SCOSC (`CSI s`).
    SaveCursor,
    /// DECRC (`ESC 8`) / SCORC (`CSI u`).
    RestoreCursor,
    /// IND (`ESC D`): cursor down, scrolling at the bottom margin.
    Index,
    /// RI (`ESC M`): cursor up, scrolling at the top margin.
    ReverseIndex,
    /// NEL (`ESC E`): carriage return plus index.
    NextLine,
    /// RIS (`ESC c`): full reset.
    FullReset,
    /// HTS (`ESC H`): set a tab stop at the cursor column.
    SetTabStop,
    /// TBC (`CSI Ps g`): 0 = at cursor, 3 = all.
    ClearTabStop(u16),
    /// CBT (`CSI Ps Z`): cursor backward tabulation by count.
    BackTab(u16),
    /// Primary DA (`CSI c`): the host answers with its identity.
    DeviceAttributes,
    /// DSR (`CSI Ps n`): 5 = status, 6 = cursor position report.
    DeviceStatus(u16),
    /// DECSCUSR (`CSI Ps SP q`): cursor shape and blink.
    CursorStyle(u16),
    /// OSC 0/2: window/icon title.
    SetTitle(String),
    /// A complete but unrecognized sequence, captured verbatim.
    Unhandled(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Esc,
    Csi,
    Osc,
    OscEsc,
    /// Accumulating a multi-byte UTF-8 character; counts the continuation
    /// bytes still expected.
    Utf8 {
        bytes_remaining: u8,
    },
}

/// VT/ANSI parser state.
#[derive(Debug, Clone)]
pub struct Parser {
    state: State,
    buf: Vec<u8>,
    utf8_buf: [u8; 4],
    utf8_len: u8,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// A parser in ground state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            buf: Vec::new(),
            utf8_buf: [0; 4],
            utf8_len: 0,
        }
    }

    /// Feed a chunk of bytes and return the parsed actions.
    #[must_use]
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Action> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(action) = self.advance(b) {
                out.push(action);
            }
        }
        out
    }

    /// Advance the parser by one byte; returns an action when a complete
    /// token is recognized.
    pub fn advance(&mut self, b: u8) -> Option<Action> {
        match self.state {
            State::Ground => self.advance_ground(b),
            State::Esc => self.advance_esc(b),
            State::Csi => self.advance_csi(b),
            State::Osc => self.advance_osc(b),
            State::OscEsc => self.advance_osc_esc(b),
            State::Utf8 { bytes_remaining } => self.advance_utf8(b, bytes_remaining),
        }
    }

    fn advance_ground(&mut self, b: u8) -> Option<Action> {
        match b {
            // LF, VT, and FF all move down a line.
            b'\n' | 0x0B | 0x0C => Some(Action::Newline),
            b'\r' => Some(Action::CarriageReturn),
            b'\t' => Some(Action::Tab),
            0x08 => Some(Action::Backspace),
            0x07 => Some(Action::Bell),
            0x1b => {
                self.state = State::Esc;
                self.buf.clear();
                self.buf.push(0x1b);
                None
            }
            0x20..=0x7E => Some(Action::Print(b as char)),
            // UTF-8 lead bytes; 0xC0/0xC1 (overlong) and 0xF5+ (beyond
            // Unicode) fall through to the ignore arm.
            0xC2..=0xDF => {
                self.begin_utf8(b, 1);
                None
            }
            0xE0..=0xEF => {
                self.begin_utf8(b, 2);
                None
            }
            0xF0..=0xF4 => {
                self.begin_utf8(b, 3);
                None
            }
            // Remaining C0 controls and invalid lead bytes are dropped.
            _ => None,
        }
    }

    fn begin_utf8(&mut self, lead: u8, continuations: u8) {
        self.utf8_buf[0] = lead;
        self.utf8_len = 1;
        self.state = State::Utf8 {
            bytes_remaining: continuations,
        };
    }

    fn advance_utf8(&mut self, b: u8, bytes_remaining: u8) -> Option<Action> {
        if (0x80..=0xBF).contains(&b) {
            let idx = self.utf8_len as usize;
            if idx < 4 {
                self.utf8_buf[idx] = b;
                self.utf8_len += 1;
            }
            if bytes_remaining == 1 {
                self.state = State::Ground;
                let len = self.utf8_len as usize;
                let ch = core::str::from_utf8(&self.utf8_buf[..len])
                    .ok()
                    .and_then(|s| s.chars().next());
                self.utf8_len = 0;
                ch.map(Action::Print)
            } else {
                self.state = State::Utf8 {
                    bytes_remaining: bytes_remaining - 1,
                };
                None
            }
        } else {
            // Malformed sequence: drop it and reprocess this byte in ground
            // state, the way terminals discard bad UTF-8.
            self.state = State::Ground;
            self.utf8_len = 0;
            self.advance_ground(b)
        }
    }

    fn advance_esc(&mut self, b: u8) -> Option<Action> {
        // Intermediates (charset designations and friends) accumulate; the
        // next non-intermediate byte is final for the whole sequence.
        if (0x20..=0x2F).contains(&b) {
            self.buf.push(b);
            return None;
        }
        if self.buf.len() > 1 {
            self.buf.push(b);
            self.state = State::Ground;
            return Some(Action::Unhandled(self.take_buf()));
        }
        self.buf.push(b);
        match b {
            b'[' => {
                self.state = State::Csi;
                None
            }
            b']' => {
                self.state = State::Osc;
                None
            }
            b'7' => self.emit(Action::SaveCursor),
            b'8' => self.emit(Action::RestoreCursor),
            b'D' => self.emit(Action::Index),
            b'M' => self.emit(Action::ReverseIndex),
            b'E' => self.emit(Action::NextLine),
            b'c' => self.emit(Action::FullReset),
            b'H' => self.emit(Action::SetTabStop),
            _ => {
                self.state = State::Ground;
                Some(Action::Unhandled(self.take_buf()))
            }
        }
    }

    fn emit(&mut self, action: Action) -> Option<Action> {
        self.state = State::Ground;
        self.buf.clear();
        Some(action)
    }

    fn advance_csi(&mut self, b: u8) -> Option<Action> {
        self.buf.push(b);
        // Final byte for CSI is 0x40..=0x7E (ECMA-48).
        if (0x40..=0x7E).contains(&b) {
            self.state = State::Ground;
            let seq = self.take_buf();
            return Some(Self::decode_csi(&seq).unwrap_or(Action::Unhandled(seq)));
        }
        None
    }

    fn advance_osc(&mut self, b: u8) -> Option<Action> {
        self.buf.push(b);
        match b {
            // BEL terminator.
            0x07 => {
                self.state = State::Ground;
                let seq = self.take_buf();
                Some(Self::decode_osc(&seq).unwrap_or(Action::Unhandled(seq)))
            }
            // ESC, possibly starting the ST terminator (ESC \).
            0x1b => {
                self.state = State::OscEsc;
                None
            }
            _ => None,
        }
    }

    fn advance_osc_esc(&mut self, b: u8) -> Option<Action> {
        self.buf.push(b);
        if b == b'\\' {
            self.state = State::Ground;
            let seq = self.take_buf();
            return Some(Self::decode_osc(&seq).unwrap_or(Action::Unhandled(seq)));
        }
        self.state = State::Osc;
        None
    }

    fn take_buf(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        core::mem::swap(&mut out, &mut self.buf);
        out
    }

    fn decode_csi(seq: &[u8]) -> Option<Action> {
        if seq.len() < 3 || seq[0] != 0x1b || seq[1] != b'[' {
            return None;
        }
        let final_byte = *seq.last()?;
        let body = &seq[2..seq.len().saturating_sub(1)];

        // Parameter bytes first, then any intermediates (ECMA-48 5.4).
        let inter_start = body
            .iter()
            .position(|b| (0x20..=0x2F).contains(b))
            .unwrap_or(body.len());
        let (param_bytes, intermediates) = body.split_at(inter_start);

        if !intermediates.is_empty() {
            // DECSCUSR is the only intermediate form the console uses.
            if intermediates == b" " && final_byte == b'q' {
                let params = Self::parse_params(param_bytes)?;
                return Some(Action::CursorStyle(Self::value_or(&params, 0, 1)));
            }
            return None;
        }

        // DEC private mode indicator.
        if param_bytes.first() == Some(&b'?') {
            let params = Self::parse_params(&param_bytes[1..])?;
            let values = Self::values(&params);
            return match final_byte {
                b'h' => Some(Action::DecSet(values)),
                b'l' => Some(Action::DecRst(values)),
                _ => None,
            };
        }
        // Other private prefixes (secondary DA and friends) are unhandled.
        if matches!(param_bytes.first(), Some(b'<' | b'=' | b'>')) {
            return None;
        }

        let params = Self::parse_params(param_bytes)?;

        match final_byte {
            b'A' => Some(Action::CursorUp(Self::count_or_one(&params))),
            b'B' => Some(Action::CursorDown(Self::count_or_one(&params))),
            b'C' => Some(Action::CursorRight(Self::count_or_one(&params))),
            b'D' => Some(Action::CursorLeft(Self::count_or_one(&params))),
            b'E' => Some(Action::CursorNextLine(Self::count_or_one(&params))),
            b'F' => Some(Action::CursorPrevLine(Self::count_or_one(&params))),
            b'G' => Some(Action::CursorColumn(
                Self::count_or_one(&params).saturating_sub(1),
            )),
            b'd' => Some(Action::CursorRow(
                Self::count_or_one(&params).saturating_sub(1),
            )),
            b'H' | b'f' => {
                // CUP/HVP are 1-indexed; 0 is treated as 1.
                let row = Self::value_or(&params, 0, 1).max(1).saturating_sub(1);
                let col = Self::value_or(&params, 1, 1).max(1).saturating_sub(1);
                Some(Action::CursorPosition { row, col })
            }
            b'J' => {
                let mode = Self::value_or(&params, 0, 0);
                (mode <= 2).then_some(Action::EraseInDisplay(mode as u8))
            }
            b'K' => {
                let mode = Self::value_or(&params, 0, 0);
                (mode <= 2).then_some(Action::EraseInLine(mode as u8))
            }
            b'L' => Some(Action::InsertLines(Self::count_or_one(&params))),
            b'M' => Some(Action::DeleteLines(Self::count_or_one(&params))),
            b'@' => Some(Action::InsertChars(Self::count_or_one(&params))),
            b'P' => Some(Action::DeleteChars(Self::count_or_one(&params))),
            b'X' => Some(Action::EraseChars(Self::count_or_one(&params))),
            b'S' => Some(Action::ScrollUp(Self::count_or_one(&params))),
            b'T' => Some(Action::ScrollDown(Self::count_or_one(&params))),
            b'r' => {
                let top = Self::value_or(&params, 0, 0).max(1).saturating_sub(1);
                let bottom = Self::value_or(&params, 1, 0);
                Some(Action::SetScrollRegion { top, bottom })
            }
            b'm' => Some(Action::Sgr(params)),
            b'g' => Some(Action::ClearTabStop(Self::value_or(&params, 0, 0))),
            b'Z' => Some(Action::BackTab(Self::count_or_one(&params))),
            b'c' => {
                (Self::value_or(&params, 0, 0) == 0).then_some(Action::DeviceAttributes)
            }
            b'n' => Some(Action::DeviceStatus(Self::value_or(&params, 0, 0))),
            b's' => params.is_empty().then_some(Action::SaveCursor),
            b'u' => params.is_empty().then_some(Action::RestoreCursor),
            _ => None,
        }
    }

    fn decode_osc(seq: &[u8]) -> Option<Action> {
        if seq.len() < 4 || seq[0] != 0x1b || seq[1] != b']' {
            return None;
        }

        // Strip the terminator (BEL or ST).
        let content = if *seq.last()? == 0x07 {
            &seq[2..seq.len().saturating_sub(1)]
        } else if seq.len() >= 4 && seq[seq.len() - 2] == 0x1b && seq[seq.len() - 1] == b'\\' {
            &seq[2..seq.len().saturating_sub(2)]
        } else {
            return None;
        };

        let first_semi = content.iter().position(|&b| b == b';')?;
        let cmd: u16 = core::str::from_utf8(&content[..first_semi])
            .ok()?
            .parse()
            .ok()?;
        let rest = &content[first_semi + 1..];

        match cmd {
            0 | 2 => Some(Action::SetTitle(String::from_utf8_lossy(rest).to_string())),
            _ => None,
        }
    }

    fn parse_params(params: &[u8]) -> Option<Vec<CsiParam>> {
        if params.is_empty() {
            return Some(Vec::new());
        }
        let s = core::str::from_utf8(params).ok()?;
        let mut out = Vec::new();
        for part in s.split(';') {
            if part.is_empty() {
                out.push(CsiParam::plain(0));
                continue;
            }
            let mut pieces = part.split(':');
            let value = Self::parse_value(pieces.next()?)?;
            let mut subs = Vec::new();
            for sub in pieces {
                subs.push(Self::parse_value(sub)?);
            }
            out.push(CsiParam { value, subs });
        }
        Some(out)
    }

    fn parse_value(text: &str) -> Option<u16> {
        if text.is_empty() {
            return Some(0);
        }
        let value = text.parse::<u32>().ok()?;
        Some(value.min(u32::from(u16::MAX)) as u16)
    }

    fn values(params: &[CsiParam]) -> Vec<u16> {
        params.iter().map(|p| p.value).collect()
    }

    fn value_or(params: &[CsiParam], index: usize, default: u16) -> u16 {
        params.get(index).map_or(default, |p| p.value)
    }

    fn count_or_one(params: &[CsiParam]) -> u16 {
        Self::value_or(params, 0, 1).max(1)
    }
}
