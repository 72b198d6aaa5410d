//! Pointer input from `/dev/input/mice`.
//!
//! The kernel aggregates every attached mouse into one stream of 3-byte
//! PS/2 packets: a button bitfield, then signed x and y counts. Decoding
//! and position tracking live in [`PointerState`], which owns no file
//! descriptor; [`Pointer`] wraps the device and feeds it.
//!
//! Position accumulates in fractional cells so sub-cell motion at low
//! speeds is not lost. The device reports y upward while rows grow
//! downward, so dy is subtracted.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;

const BUTTON_LEFT: u8 = 1 << 0;
const BUTTON_RIGHT: u8 = 1 << 1;
const BUTTON_MIDDLE: u8 = 1 << 2;

/// A decoded pointer change, in grid cells.
///
/// `button` follows the terminal's numbering: 0 left, 1 middle, 2 right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    Moved { row: u16, col: u16 },
    Button { button: u8, pressed: bool, row: u16, col: u16 },
}

/// Packet decoder and position tracker, separate from the device so it can
/// be driven byte-by-byte in tests.
pub struct PointerState {
    rows: u16,
    cols: u16,
    speed: f32,
    row: f32,
    col: f32,
    cell: (u16, u16),
    buttons: u8,
    pending: Vec<u8>,
}

impl PointerState {
    pub fn new(rows: u16, cols: u16, speed: f32) -> Self {
        Self {
            rows,
            cols,
            speed,
            row: 0.0,
            col: 0.0,
            cell: (0, 0),
            buttons: 0,
            pending: Vec::new(),
        }
    }

    /// Decode a run of device bytes into events.
    ///
    /// Bytes short of a full packet are carried over to the next call.
    /// Moves are reported only when the pointer crosses into a new cell;
    /// buttons are reported only on state changes, one event per button.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<PointerEvent> {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - self.pending.len() % 3;
        let taken: Vec<u8> = self.pending.drain(..complete).collect();

        let mut events = Vec::new();
        for packet in taken.chunks_exact(3) {
            self.apply([packet[0], packet[1], packet[2]], &mut events);
        }
        events
    }

    fn apply(&mut self, packet: [u8; 3], events: &mut Vec<PointerEvent>) {
        let dx = packet[1] as i8;
        let dy = packet[2] as i8;

        self.row = (self.row - f32::from(dy) * self.speed)
            .clamp(0.0, f32::from(self.rows.saturating_sub(1)));
        self.col = (self.col + f32::from(dx) * self.speed)
            .clamp(0.0, f32::from(self.cols.saturating_sub(1)));

        let cell = (self.row as u16, self.col as u16);
        if cell != self.cell {
            self.cell = cell;
            events.push(PointerEvent::Moved {
                row: cell.0,
                col: cell.1,
            });
        }

        let buttons = packet[0] & (BUTTON_LEFT | BUTTON_RIGHT | BUTTON_MIDDLE);
        let changed = buttons ^ self.buttons;
        self.buttons = buttons;
        for (bit, button) in [(BUTTON_LEFT, 0u8), (BUTTON_MIDDLE, 1), (BUTTON_RIGHT, 2)] {
            if changed & bit != 0 {
                events.push(PointerEvent::Button {
                    button,
                    pressed: buttons & bit != 0,
                    row: self.cell.0,
                    col: self.cell.1,
                });
            }
        }
    }
}

/// The pointer device plus its decoder.
pub struct Pointer {
    file: File,
    state: PointerState,
}

impl Pointer {
    const DEVICE: &'static str = "/dev/input/mice";

    /// Open the pointer device nonblocking.
    ///
    /// A console without a mouse is normal; the terminal runs without
    /// pointer support, so absence logs and returns `None`.
    pub fn open(rows: u16, cols: u16, speed: f32) -> Option<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(Self::DEVICE)
        {
            Ok(file) => file,
            Err(err) => {
                tracing::info!(path = Self::DEVICE, error = %err, "no pointer device, mouse disabled");
                return None;
            }
        };
        tracing::info!(path = Self::DEVICE, speed, "pointer device open");
        Some(Self {
            file,
            state: PointerState::new(rows, cols, speed),
        })
    }

    /// Duplicate the device handle for event-loop registration.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Read and decode everything the device has buffered.
    pub fn drain(&mut self) -> io::Result<Vec<PointerEvent>> {
        let mut events = Vec::new();
        // 32 packets per read.
        let mut chunk = [0u8; 96];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => events.extend(self.state.feed(&chunk[..n])),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PointerState {
        PointerState::new(24, 80, 1.0)
    }

    /// Build a packet from button bits and signed counts.
    fn packet(buttons: u8, dx: i8, dy: i8) -> [u8; 3] {
        [buttons, dx as u8, dy as u8]
    }

    #[test]
    fn downward_motion_increases_row() {
        let mut s = state();
        // The device reports y upward, so moving the mouse down is -dy.
        let events = s.feed(&packet(0, 0, -5));
        assert_eq!(events, vec![PointerEvent::Moved { row: 5, col: 0 }]);
    }

    #[test]
    fn rightward_motion_increases_col() {
        let mut s = state();
        let events = s.feed(&packet(0, 7, 0));
        assert_eq!(events, vec![PointerEvent::Moved { row: 0, col: 7 }]);
    }

    #[test]
    fn position_clamps_to_grid() {
        let mut s = state();
        assert!(s.feed(&packet(0, 0, 127)).is_empty(), "already at row 0");
        let events = s.feed(&packet(0, 127, -128));
        assert_eq!(events, vec![PointerEvent::Moved { row: 23, col: 79 }]);
        // Further motion into the corner changes nothing.
        assert!(s.feed(&packet(0, 100, -100)).is_empty());
    }

    #[test]
    fn sub_cell_motion_accumulates() {
        let mut s = PointerState::new(24, 80, 0.5);
        assert!(s.feed(&packet(0, 1, 0)).is_empty(), "half a cell");
        assert_eq!(
            s.feed(&packet(0, 1, 0)),
            vec![PointerEvent::Moved { row: 0, col: 1 }]
        );
    }

    #[test]
    fn motion_within_a_cell_is_not_reported() {
        let mut s = PointerState::new(24, 80, 0.25);
        assert!(s.feed(&packet(0, 1, 0)).is_empty());
        assert!(s.feed(&packet(0, 1, 0)).is_empty());
        assert!(s.feed(&packet(0, 1, 0)).is_empty());
    }

    #[test]
    fn button_edges_map_to_terminal_numbering() {
        let mut s = state();
        assert_eq!(
            s.feed(&packet(BUTTON_LEFT, 0, 0)),
            vec![PointerEvent::Button { button: 0, pressed: true, row: 0, col: 0 }]
        );
        // Held button repeats are silent.
        assert!(s.feed(&packet(BUTTON_LEFT, 0, 0)).is_empty());
        assert_eq!(
            s.feed(&packet(0, 0, 0)),
            vec![PointerEvent::Button { button: 0, pressed: false, row: 0, col: 0 }]
        );

        assert_eq!(
            s.feed(&packet(BUTTON_MIDDLE, 0, 0)),
            vec![PointerEvent::Button { button: 1, pressed: true, row: 0, col: 0 }]
        );
        assert_eq!(
            s.feed(&packet(BUTTON_MIDDLE | BUTTON_RIGHT, 0, 0)),
            vec![PointerEvent::Button { button: 2, pressed: true, row: 0, col: 0 }]
        );
    }

    #[test]
    fn drag_reports_motion_and_edge_separately() {
        let mut s = state();
        let events = s.feed(&packet(BUTTON_LEFT, 3, -2));
        assert_eq!(
            events,
            vec![
                PointerEvent::Moved { row: 2, col: 3 },
                PointerEvent::Button { button: 0, pressed: true, row: 2, col: 3 },
            ]
        );
        // Dragging with the button held only reports motion.
        assert_eq!(
            s.feed(&packet(BUTTON_LEFT, 1, 0)),
            vec![PointerEvent::Moved { row: 2, col: 4 }]
        );
    }

    #[test]
    fn partial_packets_carry_over() {
        let mut s = state();
        assert!(s.feed(&[0]).is_empty());
        assert!(s.feed(&[5]).is_empty());
        let events = s.feed(&[0]);
        assert_eq!(events, vec![PointerEvent::Moved { row: 0, col: 5 }]);
    }

    #[test]
    fn several_packets_in_one_read() {
        let mut s = state();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&packet(0, 2, 0));
        bytes.extend_from_slice(&packet(BUTTON_LEFT, 2, 0));
        bytes.extend_from_slice(&packet(0, 0, 0));
        let events = s.feed(&bytes);
        assert_eq!(
            events,
            vec![
                PointerEvent::Moved { row: 0, col: 2 },
                PointerEvent::Moved { row: 0, col: 4 },
                PointerEvent::Button { button: 0, pressed: true, row: 0, col: 4 },
                PointerEvent::Button { button: 0, pressed: false, row: 0, col: 4 },
            ]
        );
    }

    #[test]
    fn single_row_grid_pins_the_pointer() {
        let mut s = PointerState::new(1, 1, 4.0);
        assert!(s.feed(&packet(0, 50, -50)).is_empty());
        assert!(s.feed(&packet(0, -50, 50)).is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// No packet stream can push the reported cell outside the
            /// grid, whatever the speed.
            #[test]
            fn reported_cells_stay_in_bounds(
                bytes in proptest::collection::vec(any::<u8>(), 0..256),
                speed in 0.1f32..8.0,
            ) {
                let mut s = PointerState::new(24, 80, speed);
                for event in s.feed(&bytes) {
                    let (row, col) = match event {
                        PointerEvent::Moved { row, col } => (row, col),
                        PointerEvent::Button { row, col, .. } => (row, col),
                    };
                    prop_assert!(row < 24, "row {row}");
                    prop_assert!(col < 80, "col {col}");
                }
            }

            /// Presses and releases alternate per button no matter how the
            /// bitfield flaps.
            #[test]
            fn button_edges_alternate(
                fields in proptest::collection::vec(0u8..8, 1..64),
            ) {
                let mut s = PointerState::new(24, 80, 1.0);
                let mut held = [false; 3];
                for field in fields {
                    for event in s.feed(&packet(field, 0, 0)) {
                        if let PointerEvent::Button { button, pressed, .. } = event {
                            let slot = &mut held[usize::from(button)];
                            prop_assert_ne!(*slot, pressed, "duplicate edge");
                            *slot = pressed;
                        }
                    }
                }
            }
        }
    }
}
