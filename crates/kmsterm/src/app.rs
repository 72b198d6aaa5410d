//! The compositor that is the kmsterm binary.
//!
//! One thread, one [`calloop`] event loop, readiness callbacks only. Every
//! file descriptor the terminal lives on is registered level-triggered: the
//! VT for keyboard bytes, the PTY master for child output, the adapter for
//! vblank events, one self-pipe per signal, and the pointer device when
//! there is one.
//!
//! Frames are vblank-paced: one vblank request is armed at startup and
//! re-armed after every delivery, and each tick flushes engine damage and
//! commits. A paint restores the saved pixels under the overlays, blits
//! freshly rendered damage spans, then redraws the caret and pointer
//! marker over the new content, each saving the patch it covers. Painting
//! carries on while the VT is switched away so the buffer stays current;
//! only the commit is gated on console ownership.
//!
//! The VT switch handshake and the teardown sequence run against small
//! traits ([`DisplayControl`], [`TeardownSteps`]) so their choreography is
//! testable without a console to own.

use std::fmt;
use std::io;
use std::os::fd::AsFd;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction};

use kmsterm_core::signal::SignalPipe;
use kmsterm_core::vt::{ACQUIRE_SIGNAL, RELEASE_SIGNAL, VtError, VtOptions, VtSession};
use kmsterm_drm::vblank;
use kmsterm_drm::{Card, DrmError, OffscreenBuffer, PixelFormat, Screen};
use kmsterm_pty::{PtyChild, PtyError};
use kmsterm_render::{PixelImage, RenderError, Renderer, Surface, load_font, resolve_color};
use kmsterm_term::{Cell, CursorShape, DamageSpan, Grid, Style, StyleFlags, Terminal};

use crate::cli::Opts;
use crate::pointer::{Pointer, PointerEvent};

/// Any failure that can abort startup or the loop.
#[derive(Debug)]
pub enum AppError {
    Vt(VtError),
    Display(DrmError),
    Render(RenderError),
    Child(PtyError),
    EventLoop(calloop::Error),
    Io(io::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Vt(err) => err.fmt(f),
            AppError::Display(err) => err.fmt(f),
            AppError::Render(err) => err.fmt(f),
            AppError::Child(err) => err.fmt(f),
            AppError::EventLoop(err) => write!(f, "event loop failed: {err}"),
            AppError::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Vt(err) => Some(err),
            AppError::Display(err) => Some(err),
            AppError::Render(err) => Some(err),
            AppError::Child(err) => Some(err),
            AppError::EventLoop(err) => Some(err),
            AppError::Io(err) => Some(err),
        }
    }
}

impl From<VtError> for AppError {
    fn from(err: VtError) -> Self {
        AppError::Vt(err)
    }
}

impl From<DrmError> for AppError {
    fn from(err: DrmError) -> Self {
        AppError::Display(err)
    }
}

impl From<RenderError> for AppError {
    fn from(err: RenderError) -> Self {
        AppError::Render(err)
    }
}

impl From<PtyError> for AppError {
    fn from(err: PtyError) -> Self {
        AppError::Child(err)
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Io(err)
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Commands the VT switch handshake issues against the live display.
///
/// Every operation is best-effort: failures are logged by the
/// implementation and the choreography continues.
trait DisplayControl {
    fn drop_master(&mut self);
    fn take_master(&mut self);
    /// Point the CRTC back at our framebuffer.
    fn show_console(&mut self);
    fn ack_release(&mut self);
    fn ack_acquire(&mut self);
}

/// Console ownership state driving the VT switch handshake.
///
/// A release surrenders DRM master before the ack, so the next owner can
/// mode-set the moment the kernel completes the switch. An acquire acks
/// first and restores our configuration behind it. Both acks are
/// unconditional: the kernel asked, the kernel gets its answer, even when
/// a request repeats.
struct Handshake {
    enabled: bool,
}

impl Handshake {
    fn new() -> Self {
        Self { enabled: true }
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    /// Handle the kernel's release request. Returns true when this call
    /// actually gave the console up.
    fn on_release(&mut self, ctl: &mut impl DisplayControl) -> bool {
        let released = self.enabled;
        if released {
            self.enabled = false;
            ctl.drop_master();
        }
        ctl.ack_release();
        released
    }

    /// Handle the kernel's acquire notification. Returns true when this
    /// call actually took the console back.
    fn on_acquire(&mut self, ctl: &mut impl DisplayControl) -> bool {
        ctl.ack_acquire();
        let reacquired = !self.enabled;
        if reacquired {
            ctl.take_master();
            ctl.show_console();
            self.enabled = true;
        }
        reacquired
    }
}

/// [`DisplayControl`] backed by the real devices.
struct LiveControl<'a> {
    card: &'a Card,
    screen: &'a mut Screen,
    buffer: Option<&'a OffscreenBuffer>,
    vt: &'a VtSession,
}

impl DisplayControl for LiveControl<'_> {
    fn drop_master(&mut self) {
        if let Err(err) = self.card.release_master() {
            tracing::warn!(error = %err, "dropping drm master failed");
        }
    }

    fn take_master(&mut self) {
        if let Err(err) = self.card.acquire_master() {
            tracing::warn!(error = %err, "re-acquiring drm master failed");
        }
    }

    fn show_console(&mut self) {
        if let Some(buffer) = self.buffer
            && let Err(err) = self.screen.activate(self.card, buffer.framebuffer())
        {
            tracing::warn!(error = %err, "re-activating display failed");
        }
    }

    fn ack_release(&mut self) {
        if let Err(err) = self.vt.ack_release() {
            tracing::warn!(error = %err, "release ack failed");
        }
    }

    fn ack_acquire(&mut self) {
        if let Err(err) = self.vt.ack_acquire() {
            tracing::warn!(error = %err, "acquire ack failed");
        }
    }
}

/// The exit path, split out so its ordering is testable.
trait TeardownSteps {
    fn destroy_surface(&mut self);
    fn restore_display(&mut self);
    fn surrender_master(&mut self);
}

/// Unwind the display in reverse construction order. Runs to the end no
/// matter which steps fail; mastership is surrendered only if still held.
fn run_teardown(steps: &mut impl TeardownSteps, master_held: bool) {
    steps.destroy_surface();
    steps.restore_display();
    if master_held {
        steps.surrender_master();
    }
}

/// [`TeardownSteps`] backed by the real devices.
struct LiveTeardown<'a> {
    card: &'a Card,
    screen: &'a mut Screen,
    buffer: &'a mut Option<OffscreenBuffer>,
}

impl TeardownSteps for LiveTeardown<'_> {
    fn destroy_surface(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.destroy(self.card);
        }
    }

    fn restore_display(&mut self) {
        self.screen.restore(self.card);
    }

    fn surrender_master(&mut self) {
        if let Err(err) = self.card.release_master() {
            tracing::warn!(error = %err, "dropping drm master failed");
        }
    }
}

/// Where an overlay goes: a cell position widened to the full glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OverlayTarget {
    row: u16,
    col: u16,
    /// Cells covered: 2 over a wide character, else 1.
    width: u16,
    shape: CursorShape,
}

/// How an overlay is painted, prepared before the framebuffer is mapped.
enum OverlayPaint {
    /// A block caret: the covered cells re-rendered with reverse video.
    Image(PixelImage),
    /// A bar along the cell bottom in the cell's foreground color.
    Underline(u32),
    /// A bar along the cell's left edge in its foreground color.
    Bar(u32),
}

struct OverlayPlan {
    target: OverlayTarget,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    paint: OverlayPaint,
}

/// One overlay (caret or pointer marker) and the pixels it covers.
///
/// Holds at most one saved patch at a time: `draw` captures the pixels
/// under the overlay, `undraw` puts them back. Paint order is stack-like,
/// so overlapping overlays restore cleanly in reverse.
#[derive(Default)]
struct Overlay {
    drawn: Option<OverlayTarget>,
    patch: Option<(u32, u32, PixelImage)>,
}

impl Overlay {
    fn undraw(&mut self, surface: &mut Surface<'_>) {
        if let Some((x, y, patch)) = self.patch.take() {
            surface.blit(x, y, &patch);
        }
        self.drawn = None;
    }

    fn draw(&mut self, surface: &mut Surface<'_>, plan: OverlayPlan) {
        debug_assert!(self.patch.is_none(), "overlay drawn twice without undraw");
        self.patch = Some((plan.x, plan.y, surface.save_patch(plan.x, plan.y, plan.w, plan.h)));
        match plan.paint {
            OverlayPaint::Image(image) => surface.blit(plan.x, plan.y, &image),
            OverlayPaint::Underline(color) => {
                surface.fill_rect(plan.x, plan.y + plan.h.saturating_sub(2), plan.w, 2, color);
            }
            OverlayPaint::Bar(color) => surface.fill_rect(plan.x, plan.y, 2, plan.h, color),
        }
        self.drawn = Some(plan.target);
    }
}

/// Resolve the color a thin caret is drawn in: the cell's effective
/// foreground after reverse video.
fn effective_fg(style: Style) -> u32 {
    if style.flags.contains(StyleFlags::REVERSE) {
        resolve_color(style.bg, false)
    } else {
        resolve_color(style.fg, true)
    }
}

/// Shift a cell position off a wide character's continuation onto its head
/// and report how many cells the glyph covers.
fn shift_to_head(grid: &Grid, row: u16, mut col: u16) -> (u16, u16) {
    if col > 0 && grid.cell(row, col).is_some_and(Cell::is_continuation) {
        col -= 1;
    }
    let width = grid.cell(row, col).map_or(1, |cell| if cell.is_wide() { 2 } else { 1 });
    (col, width)
}

/// Where the caret goes, if anywhere.
fn caret_target(terminal: &Terminal) -> Option<OverlayTarget> {
    let cursor = terminal.cursor();
    if !cursor.visible {
        return None;
    }
    let grid = terminal.grid();
    let row = cursor.row.min(grid.rows().saturating_sub(1));
    let col = cursor.col.min(grid.cols().saturating_sub(1));
    let (col, width) = shift_to_head(grid, row, col);
    Some(OverlayTarget {
        row,
        col,
        width,
        shape: cursor.shape,
    })
}

/// Where the pointer marker goes; always a block, absent until the mouse
/// first moves.
fn pointer_target(grid: &Grid, cell: Option<(u16, u16)>) -> Option<OverlayTarget> {
    let (row, col) = cell?;
    let (col, width) = shift_to_head(grid, row, col);
    Some(OverlayTarget {
        row,
        col,
        width,
        shape: CursorShape::Block,
    })
}

/// Clip a damage span to the grid, widen it one cell where not at an edge
/// (glyphs overhang their box, italics especially), and keep wide
/// characters whole. Returns `(row, start, end)` or `None` for spans with
/// nothing visible.
fn snap_span(grid: &Grid, span: &DamageSpan) -> Option<(u16, u16, u16)> {
    let cols = grid.cols();
    if span.row >= grid.rows() || span.start >= cols {
        return None;
    }
    let mut start = span.start;
    let mut end = span.end.min(cols);
    if start >= end {
        return None;
    }
    if start > 0 {
        start -= 1;
    }
    if end < cols {
        end += 1;
    }
    if start > 0 && grid.cell(span.row, start).is_some_and(Cell::is_continuation) {
        start -= 1;
    }
    if end < cols && grid.cell(span.row, end).is_some_and(Cell::is_continuation) {
        end += 1;
    }
    Some((span.row, start, end))
}

/// Rasterize an overlay before the framebuffer is mapped.
fn plan_overlay(
    renderer: &mut Renderer,
    grid: &Grid,
    cell: (u32, u32),
    target: OverlayTarget,
) -> OverlayPlan {
    let (cw, ch) = cell;
    let paint = match target.shape {
        CursorShape::Block => {
            let mut cells: Vec<Cell> = grid.cells(target.row, target.col, target.width).to_vec();
            for cell in &mut cells {
                cell.style.flags.toggle(StyleFlags::REVERSE);
            }
            OverlayPaint::Image(renderer.render_span(&cells))
        }
        CursorShape::Underline => {
            let style = grid.cell(target.row, target.col).map_or_else(Style::default, |c| c.style);
            OverlayPaint::Underline(effective_fg(style))
        }
        CursorShape::Bar => {
            let style = grid.cell(target.row, target.col).map_or_else(Style::default, |c| c.style);
            OverlayPaint::Bar(effective_fg(style))
        }
    };
    OverlayPlan {
        target,
        x: u32::from(target.col) * cw,
        y: u32::from(target.row) * ch,
        w: u32::from(target.width) * cw,
        h: ch,
        paint,
    }
}

fn drained(pipe: &mut SignalPipe) -> bool {
    match pipe.drain() {
        Ok(signaled) => signaled,
        Err(err) => {
            tracing::warn!(error = %err, "signal pipe read failed");
            false
        }
    }
}

/// Everything the terminal session owns, wired into one event loop.
pub struct App {
    terminal: Terminal,
    renderer: Renderer,
    pty: PtyChild,
    pointer: Option<Pointer>,
    caret: Overlay,
    marker: Overlay,
    /// Last pointer cell, raw (not head-shifted); `None` until first move.
    pointer_cell: Option<(u16, u16)>,
    /// Cell box in pixels.
    cell: (u32, u32),
    handshake: Handshake,
    /// Ticks are live; cleared when a re-arm fails, restored on acquire.
    vblank_armed: bool,
    /// Exit code once the child is gone; `None` while it runs.
    exit: Option<i32>,
    signal: LoopSignal,
    buffer: Option<OffscreenBuffer>,
    screen: Screen,
    card: Card,
    // Declaration order is drop order: the VT guard leaves
    // process-controlled switching before the pipes unregister their
    // handlers, so no switch signal can arrive with nothing behind it.
    vt: VtSession,
    release_pipe: SignalPipe,
    acquire_pipe: SignalPipe,
    child_pipe: SignalPipe,
    interrupt_pipe: SignalPipe,
    terminate_pipe: SignalPipe,
}

impl App {
    /// Bring up the whole stack in dependency order. Any failure here
    /// abandons startup; partially entered state unwinds through drops.
    fn new(opts: &Opts, signal: LoopSignal) -> AppResult<Self> {
        // The kernel starts delivering switch signals the moment the VT
        // enters process-controlled mode; the pipes must exist first.
        let release_pipe = SignalPipe::register(RELEASE_SIGNAL)?;
        let acquire_pipe = SignalPipe::register(ACQUIRE_SIGNAL)?;
        let child_pipe = SignalPipe::register(libc::SIGCHLD)?;
        let interrupt_pipe = SignalPipe::register(libc::SIGINT)?;
        let terminate_pipe = SignalPipe::register(libc::SIGTERM)?;

        let vt = VtSession::new(VtOptions {
            vt: opts.tty,
            activate: opts.activate,
            ..VtOptions::default()
        })?;

        let card = Card::open_card(opts.card)?;
        let mut screen = Screen::discover(&card)?;
        card.acquire_master()?;

        let buffer = OffscreenBuffer::create(&card, screen.resolution(), PixelFormat::Packed32)?;
        screen.activate(&card, buffer.framebuffer())?;
        // The tick source runs from here on; every delivery re-arms it.
        vblank::arm(&card, screen.crtc_index())?;

        let font = load_font(opts.font.as_deref())?;
        let dpi = opts.dpi.unwrap_or_else(|| screen.dpi());
        let renderer = Renderer::new(font, opts.font_size, dpi)?;

        let (cw, ch) = renderer.cell_size();
        let (width, height) = screen.resolution();
        let rows = (height / ch).clamp(1, u32::from(u16::MAX)) as u16;
        let cols = (width / cw).clamp(1, u32::from(u16::MAX)) as u16;
        tracing::info!(vt = vt.vt_number(), rows, cols, width, height, "console ready");

        let terminal = Terminal::new(rows, cols);
        let pty = PtyChild::spawn(&opts.program, &opts.args, rows, cols)?;
        let pointer = Pointer::open(rows, cols, opts.mouse_speed);

        Ok(Self {
            terminal,
            renderer,
            pty,
            pointer,
            caret: Overlay::default(),
            marker: Overlay::default(),
            pointer_cell: None,
            cell: (cw, ch),
            handshake: Handshake::new(),
            vblank_armed: true,
            exit: None,
            signal,
            buffer: Some(buffer),
            screen,
            card,
            vt,
            release_pipe,
            acquire_pipe,
            child_pipe,
            interrupt_pipe,
            terminate_pipe,
        })
    }

    /// Re-arm the tick source. A missed re-arm permanently stops ticks, so
    /// a failure is loud and the next console acquire retries.
    fn arm_vblank(&mut self) {
        match vblank::arm(&self.card, self.screen.crtc_index()) {
            Ok(()) => self.vblank_armed = true,
            Err(err) => {
                self.vblank_armed = false;
                tracing::warn!(error = %err, "vblank arm failed, ticks suspended");
            }
        }
    }

    /// One tick: flush damage into the framebuffer, redraw overlays that
    /// moved, and commit. Render work runs even while the console is
    /// switched away, keeping the buffer current; only the commit needs
    /// ownership.
    fn frame(&mut self) {
        let spans = self.terminal.flush_damage();
        let caret = caret_target(&self.terminal);
        let marker = pointer_target(self.terminal.grid(), self.pointer_cell);
        if !spans.is_empty() || caret != self.caret.drawn || marker != self.marker.drawn {
            let (cw, ch) = self.cell;
            let mut patches = Vec::with_capacity(spans.len());
            for span in &spans {
                let Some((row, start, end)) = snap_span(self.terminal.grid(), span) else {
                    continue;
                };
                let cells = self.terminal.grid().cells(row, start, end - start).to_vec();
                let image = self.renderer.render_span(&cells);
                patches.push((u32::from(start) * cw, u32::from(row) * ch, image));
            }
            let caret_plan =
                caret.map(|t| plan_overlay(&mut self.renderer, self.terminal.grid(), self.cell, t));
            let marker_plan =
                marker.map(|t| plan_overlay(&mut self.renderer, self.terminal.grid(), self.cell, t));

            if let Some(buffer) = self.buffer.as_mut() {
                let pitch = buffer.pitch() as usize;
                let (bw, bh) = (buffer.width(), buffer.height());
                match buffer.map(&self.card) {
                    Ok(mut mapping) => {
                        let mut surface = Surface::new(mapping.as_mut(), pitch, bw, bh);
                        // Reverse paint order, so overlapping patches nest.
                        self.marker.undraw(&mut surface);
                        self.caret.undraw(&mut surface);
                        for (x, y, image) in &patches {
                            surface.blit(*x, *y, image);
                        }
                        if let Some(plan) = caret_plan {
                            self.caret.draw(&mut surface, plan);
                        }
                        if let Some(plan) = marker_plan {
                            self.marker.draw(&mut surface, plan);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "framebuffer map failed, frame dropped");
                        self.terminal.damage_all();
                    }
                }
            }
        }
        if self.handshake.enabled()
            && let Some(buffer) = self.buffer.as_mut()
            && let Err(err) = buffer.commit(&self.card)
        {
            tracing::debug!(error = %err, "frame commit failed");
        }
    }

    fn on_vt_readable(&mut self) {
        let mut buf = [0u8; 1024];
        match self.vt.read_input(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if let Err(err) = self.pty.write(&buf[..n]) {
                    tracing::warn!(error = %err, "forwarding keyboard input failed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => tracing::warn!(error = %err, "keyboard read failed"),
        }
    }

    fn on_pty_readable(&mut self) {
        match self.pty.drain() {
            Ok(bytes) if !bytes.is_empty() => {
                self.terminal.feed(&bytes);
                let reply = self.terminal.take_output();
                if !reply.is_empty()
                    && let Err(err) = self.pty.write(&reply)
                {
                    tracing::warn!(error = %err, "forwarding terminal reply failed");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "child output read failed"),
        }
        if self.pty.is_eof() {
            self.reap_child();
        }
    }

    fn on_pointer_readable(&mut self) {
        let Some(pointer) = self.pointer.as_mut() else {
            return;
        };
        let events = match pointer.drain() {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, "pointer read failed");
                return;
            }
        };
        if events.is_empty() {
            return;
        }
        for event in events {
            match event {
                PointerEvent::Moved { row, col } => {
                    self.pointer_cell = Some((row, col));
                    self.terminal.pointer_moved(row, col);
                }
                PointerEvent::Button { button, pressed, row, col } => {
                    self.terminal.pointer_button(button, pressed, row, col);
                }
            }
        }
        let reply = self.terminal.take_output();
        if !reply.is_empty()
            && let Err(err) = self.pty.write(&reply)
        {
            tracing::warn!(error = %err, "forwarding mouse report failed");
        }
    }

    fn on_drm_readable(&mut self) {
        if let Err(err) = vblank::drain(&self.card) {
            tracing::debug!(error = %err, "vblank drain failed");
        }
        self.frame();
        self.arm_vblank();
    }

    fn on_release_signal(&mut self) {
        if !drained(&mut self.release_pipe) {
            return;
        }
        let mut ctl = LiveControl {
            card: &self.card,
            screen: &mut self.screen,
            buffer: self.buffer.as_ref(),
            vt: &self.vt,
        };
        if self.handshake.on_release(&mut ctl) {
            tracing::info!("console released");
        }
    }

    fn on_acquire_signal(&mut self) {
        if !drained(&mut self.acquire_pipe) {
            return;
        }
        let mut ctl = LiveControl {
            card: &self.card,
            screen: &mut self.screen,
            buffer: self.buffer.as_ref(),
            vt: &self.vt,
        };
        if self.handshake.on_acquire(&mut ctl) {
            tracing::info!("console re-acquired");
            if !self.vblank_armed {
                self.arm_vblank();
            }
        }
    }

    fn on_child_signal(&mut self) {
        if !drained(&mut self.child_pipe) {
            return;
        }
        self.reap_child();
    }

    fn on_interrupt_signal(&mut self) {
        if !drained(&mut self.interrupt_pipe) {
            return;
        }
        self.stop_requested(libc::SIGINT);
    }

    fn on_terminate_signal(&mut self) {
        if !drained(&mut self.terminate_pipe) {
            return;
        }
        self.stop_requested(libc::SIGTERM);
    }

    fn stop_requested(&mut self, signal: libc::c_int) {
        tracing::info!(signal, "termination signal received, leaving the loop");
        self.signal.stop();
    }

    fn reap_child(&mut self) {
        match self.pty.try_wait() {
            Ok(Some(code)) => {
                self.exit.get_or_insert(code as i32);
                self.signal.stop();
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "child status check failed"),
        }
    }

    /// Settle the child, unwind the display, and report the exit code.
    /// The VT guard and signal pipes unwind in the drop that follows.
    fn finish(mut self) -> i32 {
        let code = match self.exit {
            Some(code) => code,
            None => {
                self.pty.shutdown();
                0
            }
        };
        let master_held = self.handshake.enabled();
        let mut steps = LiveTeardown {
            card: &self.card,
            screen: &mut self.screen,
            buffer: &mut self.buffer,
        };
        run_teardown(&mut steps, master_held);
        code
    }
}

fn insert_fd<F>(handle: &LoopHandle<'_, App>, fd: F, action: fn(&mut App)) -> AppResult<()>
where
    F: AsFd + 'static,
{
    handle
        .insert_source(Generic::new(fd, Interest::READ, Mode::Level), move |_, _, app| {
            action(app);
            Ok(PostAction::Continue)
        })
        .map(drop)
        .map_err(|err| AppError::EventLoop(err.error))
}

fn register_sources(handle: &LoopHandle<'_, App>, app: &App) -> AppResult<()> {
    insert_fd(handle, app.vt.try_clone_file()?, App::on_vt_readable)?;
    insert_fd(handle, app.card.try_clone_file()?, App::on_drm_readable)?;
    insert_fd(handle, app.pty.try_clone_master()?, App::on_pty_readable)?;
    insert_fd(handle, app.release_pipe.try_clone_read_half()?, App::on_release_signal)?;
    insert_fd(handle, app.acquire_pipe.try_clone_read_half()?, App::on_acquire_signal)?;
    insert_fd(handle, app.child_pipe.try_clone_read_half()?, App::on_child_signal)?;
    insert_fd(handle, app.interrupt_pipe.try_clone_read_half()?, App::on_interrupt_signal)?;
    insert_fd(handle, app.terminate_pipe.try_clone_read_half()?, App::on_terminate_signal)?;
    if let Some(pointer) = &app.pointer {
        insert_fd(handle, pointer.try_clone_file()?, App::on_pointer_readable)?;
    }
    Ok(())
}

/// Build the session and drive it until the child exits or a termination
/// signal stops the loop.
pub fn run(opts: &Opts) -> AppResult<i32> {
    let mut event_loop: EventLoop<'_, App> =
        EventLoop::try_new().map_err(AppError::EventLoop)?;
    let mut app = App::new(opts, event_loop.get_signal())?;
    register_sources(&event_loop.handle(), &app)?;

    // First paint: the grid starts fully damaged.
    app.frame();

    event_loop
        .run(None, &mut app, |_| {})
        .map_err(AppError::EventLoop)?;
    Ok(app.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmsterm_render::xrgb;
    use kmsterm_term::Color;

    #[derive(Default)]
    struct RecordingControl {
        log: Vec<&'static str>,
    }

    impl DisplayControl for RecordingControl {
        fn drop_master(&mut self) {
            self.log.push("drop_master");
        }
        fn take_master(&mut self) {
            self.log.push("take_master");
        }
        fn show_console(&mut self) {
            self.log.push("show_console");
        }
        fn ack_release(&mut self) {
            self.log.push("ack_release");
        }
        fn ack_acquire(&mut self) {
            self.log.push("ack_acquire");
        }
    }

    #[test]
    fn handshake_starts_enabled() {
        assert!(Handshake::new().enabled());
    }

    #[test]
    fn release_surrenders_master_then_acks() {
        let mut handshake = Handshake::new();
        let mut ctl = RecordingControl::default();
        assert!(handshake.on_release(&mut ctl));
        assert_eq!(ctl.log, ["drop_master", "ack_release"]);
        assert!(!handshake.enabled());
    }

    #[test]
    fn repeated_release_acks_without_surrendering() {
        let mut handshake = Handshake::new();
        let mut ctl = RecordingControl::default();
        handshake.on_release(&mut ctl);
        ctl.log.clear();
        assert!(!handshake.on_release(&mut ctl));
        assert_eq!(ctl.log, ["ack_release"]);
    }

    #[test]
    fn acquire_acks_before_restoring() {
        let mut handshake = Handshake::new();
        let mut ctl = RecordingControl::default();
        handshake.on_release(&mut ctl);
        ctl.log.clear();
        assert!(handshake.on_acquire(&mut ctl));
        assert_eq!(ctl.log, ["ack_acquire", "take_master", "show_console"]);
        assert!(handshake.enabled());
    }

    #[test]
    fn repeated_acquire_acks_only() {
        let mut handshake = Handshake::new();
        let mut ctl = RecordingControl::default();
        assert!(!handshake.on_acquire(&mut ctl));
        assert_eq!(ctl.log, ["ack_acquire"]);
        assert!(handshake.enabled());
    }

    #[test]
    fn switch_cycles_are_stable() {
        let mut handshake = Handshake::new();
        let mut ctl = RecordingControl::default();
        for _ in 0..3 {
            assert!(handshake.on_release(&mut ctl));
            assert!(handshake.on_acquire(&mut ctl));
        }
        let drops = ctl.log.iter().filter(|s| **s == "drop_master").count();
        let takes = ctl.log.iter().filter(|s| **s == "take_master").count();
        assert_eq!((drops, takes), (3, 3));
        assert!(handshake.enabled());
    }

    #[derive(Default)]
    struct RecordingTeardown {
        log: Vec<&'static str>,
    }

    impl TeardownSteps for RecordingTeardown {
        fn destroy_surface(&mut self) {
            self.log.push("destroy_surface");
        }
        fn restore_display(&mut self) {
            self.log.push("restore_display");
        }
        fn surrender_master(&mut self) {
            self.log.push("surrender_master");
        }
    }

    #[test]
    fn teardown_unwinds_in_reverse_construction_order() {
        let mut steps = RecordingTeardown::default();
        run_teardown(&mut steps, true);
        assert_eq!(steps.log, ["destroy_surface", "restore_display", "surrender_master"]);
    }

    #[test]
    fn teardown_without_master_skips_the_surrender() {
        let mut steps = RecordingTeardown::default();
        run_teardown(&mut steps, false);
        assert_eq!(steps.log, ["destroy_surface", "restore_display"]);
    }

    /// 4x10 grid with a wide character occupying (1,2) and (1,3).
    fn demo_grid() -> Grid {
        let mut grid = Grid::new(4, 10);
        grid.write_printable(1, 2, '\u{6C49}', Style::default());
        grid
    }

    fn span(row: u16, start: u16, end: u16) -> DamageSpan {
        DamageSpan { row, start, end }
    }

    #[test]
    fn spans_widen_one_cell_for_overhang() {
        let grid = demo_grid();
        assert_eq!(snap_span(&grid, &span(0, 1, 4)), Some((0, 0, 5)));
        // At the grid edges there is nothing to widen into.
        assert_eq!(snap_span(&grid, &span(0, 0, 10)), Some((0, 0, 10)));
    }

    #[test]
    fn widened_span_never_starts_on_a_continuation() {
        let grid = demo_grid();
        // Widening 4..6 to 3..7 lands on the continuation at 3; the head
        // at 2 comes along.
        assert_eq!(snap_span(&grid, &span(1, 4, 6)), Some((1, 2, 7)));
    }

    #[test]
    fn widened_span_never_splits_a_trailing_wide_character() {
        let grid = demo_grid();
        // Widening 1..2 to 0..3 would end between the head at 2 and its
        // continuation at 3.
        assert_eq!(snap_span(&grid, &span(1, 1, 2)), Some((1, 0, 4)));
    }

    #[test]
    fn spans_outside_the_grid_vanish() {
        let grid = demo_grid();
        assert_eq!(snap_span(&grid, &span(4, 0, 3)), None);
        assert_eq!(snap_span(&grid, &span(0, 10, 12)), None);
        assert_eq!(snap_span(&grid, &span(0, 5, 5)), None);
    }

    #[test]
    fn span_end_clamps_to_the_grid() {
        let grid = demo_grid();
        assert_eq!(snap_span(&grid, &span(0, 5, 99)), Some((0, 4, 10)));
    }

    #[test]
    fn hidden_cursor_has_no_caret() {
        let mut term = Terminal::new(4, 10);
        term.feed(b"\x1b[?25l");
        assert_eq!(caret_target(&term), None);
        term.feed(b"\x1b[?25h");
        assert!(caret_target(&term).is_some());
    }

    #[test]
    fn caret_covers_both_cells_of_a_wide_character() {
        let mut term = Terminal::new(4, 10);
        term.feed(b"ab");
        term.feed("\u{6C49}".as_bytes());
        // Park the cursor on the continuation cell.
        term.feed(b"\x1b[1;4H");
        let target = caret_target(&term);
        assert_eq!(
            target,
            Some(OverlayTarget {
                row: 0,
                col: 2,
                width: 2,
                shape: CursorShape::Block,
            })
        );
    }

    #[test]
    fn caret_shape_follows_the_terminal() {
        let mut term = Terminal::new(4, 10);
        term.feed(b"\x1b[6 q");
        assert_eq!(caret_target(&term).map(|t| t.shape), Some(CursorShape::Bar));
        term.feed(b"\x1b[4 q");
        assert_eq!(caret_target(&term).map(|t| t.shape), Some(CursorShape::Underline));
    }

    #[test]
    fn pointer_marker_is_a_block_on_the_head_cell() {
        let grid = demo_grid();
        assert_eq!(
            pointer_target(&grid, Some((1, 3))),
            Some(OverlayTarget {
                row: 1,
                col: 2,
                width: 2,
                shape: CursorShape::Block,
            })
        );
        assert_eq!(
            pointer_target(&grid, Some((0, 0))),
            Some(OverlayTarget {
                row: 0,
                col: 0,
                width: 1,
                shape: CursorShape::Block,
            })
        );
    }

    #[test]
    fn pointer_marker_absent_until_first_move() {
        let grid = demo_grid();
        assert_eq!(pointer_target(&grid, None), None);
    }

    #[test]
    fn thin_caret_color_follows_reverse_video() {
        let mut style = Style::default();
        style.fg = Color::Rgb(10, 20, 30);
        assert_eq!(effective_fg(style), xrgb(10, 20, 30));
        style.flags.insert(StyleFlags::REVERSE);
        // Reversed cells draw their caret in the effective foreground,
        // which is the cell's background color.
        assert_eq!(effective_fg(style), xrgb(0, 0, 0));
    }

    /// A surface buffer with a distinct pixel at every position.
    fn patterned(width: u32, height: u32, pitch: usize) -> Vec<u8> {
        let mut buf = vec![0u8; pitch * height as usize];
        for y in 0..height {
            for x in 0..width {
                let off = y as usize * pitch + x as usize * 4;
                buf[off..off + 4].copy_from_slice(&(y * 1000 + x).to_le_bytes());
            }
        }
        buf
    }

    fn filled_image(w: u32, h: u32, pixel: u32) -> PixelImage {
        let mut image = PixelImage::new(w, h);
        image.fill_rect(0, 0, w, h, pixel);
        image
    }

    fn plan_at(x: u32, y: u32, w: u32, h: u32, paint: OverlayPaint) -> OverlayPlan {
        OverlayPlan {
            target: OverlayTarget {
                row: 0,
                col: 0,
                width: 1,
                shape: CursorShape::Block,
            },
            x,
            y,
            w,
            h,
            paint,
        }
    }

    fn pixel_at(buf: &mut [u8], pitch: usize, w: u32, h: u32, x: u32, y: u32) -> u32 {
        let surface = Surface::new(buf, pitch, w, h);
        let patch = surface.save_patch(x, y, 1, 1);
        patch.pixel(0, 0).unwrap()
    }

    #[test]
    fn overlay_draw_then_undraw_restores_every_pixel() {
        let (w, h, pitch) = (16u32, 8u32, 16 * 4 + 8);
        let mut buf = patterned(w, h, pitch);
        let before = buf.clone();
        let mut overlay = Overlay::default();

        let red = xrgb(200, 0, 0);
        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.draw(&mut surface, plan_at(4, 0, 8, 8, OverlayPaint::Image(filled_image(8, 8, red))));
        }
        assert!(overlay.drawn.is_some());
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 4, 0), red);
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 11, 7), red);
        // Just outside the overlay the pattern survives.
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 3, 0), 3);

        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.undraw(&mut surface);
        }
        assert_eq!(buf, before, "undraw must restore the overlay area bit for bit");
        assert!(overlay.drawn.is_none());
    }

    #[test]
    fn overlay_redraw_cycles_track_a_moving_target() {
        let (w, h, pitch) = (16u32, 8u32, 16 * 4);
        let mut buf = patterned(w, h, pitch);
        let before = buf.clone();
        let mut overlay = Overlay::default();
        let green = xrgb(0, 200, 0);

        for x in [0u32, 8, 4] {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.undraw(&mut surface);
            overlay.draw(&mut surface, plan_at(x, 0, 8, 8, OverlayPaint::Image(filled_image(8, 8, green))));
        }
        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.undraw(&mut surface);
        }
        assert_eq!(buf, before);
    }

    #[test]
    fn underline_paint_touches_only_the_bottom_rows() {
        let (w, h, pitch) = (8u32, 8u32, 8 * 4);
        let mut buf = patterned(w, h, pitch);
        let before = buf.clone();
        let mut overlay = Overlay::default();
        let color = xrgb(1, 2, 3);
        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.draw(&mut surface, plan_at(0, 0, 8, 8, OverlayPaint::Underline(color)));
        }
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 0, 6), color);
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 7, 7), color);
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 0, 5), 5000);
        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.undraw(&mut surface);
        }
        assert_eq!(buf, before);
    }

    #[test]
    fn bar_paint_touches_only_the_left_columns() {
        let (w, h, pitch) = (8u32, 8u32, 8 * 4);
        let mut buf = patterned(w, h, pitch);
        let before = buf.clone();
        let mut overlay = Overlay::default();
        let color = xrgb(9, 9, 9);
        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.draw(&mut surface, plan_at(0, 0, 8, 8, OverlayPaint::Bar(color)));
        }
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 0, 0), color);
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 1, 3), color);
        assert_eq!(pixel_at(&mut buf, pitch, w, h, 2, 3), 3002);
        {
            let mut surface = Surface::new(&mut buf, pitch, w, h);
            overlay.undraw(&mut surface);
        }
        assert_eq!(buf, before);
    }
}
