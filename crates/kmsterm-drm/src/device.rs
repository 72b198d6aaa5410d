//! Adapter device and display-path discovery.
//!
//! [`Card`] wraps one `/dev/dri/cardN` node and implements the `drm` crate's
//! device traits, so every mode-setting request goes through the crate's
//! typed ioctl surface. [`Screen::discover`] walks the adapter's resources
//! once and commits to the first viable display path:
//!
//! 1. the first connected connector reporting at least one mode;
//! 2. that connector's already-lit encoder/CRTC pairing when the kernel has
//!    one, otherwise the first (encoder, CRTC) pair the encoder's
//!    compatibility mask allows, in resource order.
//!
//! Individual resource queries that fail are skipped, never fatal; only the
//! two terminal outcomes ([`DrmError::NoDisplayFound`],
//! [`DrmError::NoEncoderCrtcCombo`]) abort discovery. The chosen CRTC's
//! pre-existing configuration is captured before our first mode-set and
//! replayed exactly once at teardown, so whatever was on the console before
//! us comes back after us.
//!
//! Discovery runs without DRM master; [`Screen::activate`] requires it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use drm::Device;
use drm::control::{
    Device as ControlDevice, Mode, ResourceHandles, connector, crtc, encoder, framebuffer,
};

/// Errors raised by the display stack.
#[derive(Debug)]
pub enum DrmError {
    /// The adapter node could not be opened (or none exists).
    DeviceUnavailable {
        path: PathBuf,
        source: io::Error,
    },
    /// No connector is both connected and reporting modes.
    NoDisplayFound,
    /// The connected connector has no usable encoder/CRTC pairing.
    NoEncoderCrtcCombo,
    /// The mode-set programming the display path was rejected.
    ModeSetFailed(io::Error),
    /// Any other mode-setting request failed.
    ControlFailed {
        op: &'static str,
        source: io::Error,
    },
}

impl fmt::Display for DrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrmError::DeviceUnavailable { path, source } => {
                write!(f, "display adapter {} unavailable: {source}", path.display())
            }
            DrmError::NoDisplayFound => write!(f, "no connected display with usable modes"),
            DrmError::NoEncoderCrtcCombo => {
                write!(f, "no encoder/CRTC combination can drive the connected display")
            }
            DrmError::ModeSetFailed(source) => write!(f, "mode-set rejected: {source}"),
            DrmError::ControlFailed { op, source } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for DrmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DrmError::DeviceUnavailable { source, .. }
            | DrmError::ModeSetFailed(source)
            | DrmError::ControlFailed { source, .. } => Some(source),
            DrmError::NoDisplayFound | DrmError::NoEncoderCrtcCombo => None,
        }
    }
}

pub type DrmResult<T> = Result<T, DrmError>;

/// Wrap an `io::Error` with the name of the failing request.
pub(crate) fn ctrl(op: &'static str) -> impl FnOnce(io::Error) -> DrmError {
    move |source| DrmError::ControlFailed { op, source }
}

/// Re-issue a mode-setting call while it reports EINTR/EAGAIN.
///
/// The VT switch handshake delivers signals at arbitrary points, so any
/// request running concurrently can come back interrupted.
pub(crate) fn retry_control<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            other => return other,
        }
    }
}

/// Highest `/dev/dri/cardN` index probed when no card number is given.
const CARD_SCAN_LIMIT: u32 = 16;

/// One DRM adapter node.
///
/// Owns the open file descriptor; the `drm` crate traits give it the full
/// mode-setting call surface. Dropping the card closes the node, which also
/// releases master if we still hold it.
pub struct Card {
    file: File,
    path: PathBuf,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Open an adapter node by path.
    pub fn open<P: AsRef<Path>>(path: P) -> DrmResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DrmError::DeviceUnavailable {
                path: path.clone(),
                source,
            })?;
        tracing::info!(path = %path.display(), "opened display adapter");
        Ok(Self { file, path })
    }

    /// Open `/dev/dri/cardN`, scanning for the first node present when no
    /// number is given.
    pub fn open_card(card: Option<u32>) -> DrmResult<Self> {
        if let Some(n) = card {
            return Self::open(format!("/dev/dri/card{n}"));
        }
        for n in 0..CARD_SCAN_LIMIT {
            let path = PathBuf::from(format!("/dev/dri/card{n}"));
            if path.exists() {
                return Self::open(path);
            }
        }
        Err(DrmError::DeviceUnavailable {
            path: PathBuf::from("/dev/dri"),
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicate the adapter handle for event-loop registration.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Become the adapter's mode-setting master.
    ///
    /// Required before any CRTC programming; re-acquired on every VT acquire.
    pub fn acquire_master(&self) -> DrmResult<()> {
        tracing::info!("acquiring drm master");
        retry_control(|| self.acquire_master_lock()).map_err(ctrl("SET_MASTER"))
    }

    /// Surrender mode-setting mastership so the next console owner can take
    /// it. Called on every VT release.
    pub fn release_master(&self) -> DrmResult<()> {
        tracing::info!("dropping drm master");
        retry_control(|| self.release_master_lock()).map_err(ctrl("DROP_MASTER"))
    }
}

/// CRTC state captured before our first mode-set.
struct SavedCrtc {
    framebuffer: Option<framebuffer::Handle>,
    position: (u32, u32),
    mode: Option<Mode>,
}

/// The display path discovery committed to.
///
/// Holds the connector, CRTC, and mode driving the console plus the captured
/// previous CRTC configuration. [`Screen::restore`] replays the capture at
/// most once, and only if [`Screen::activate`] actually changed the CRTC.
pub struct Screen {
    connector: connector::Handle,
    crtc: crtc::Handle,
    crtc_index: u32,
    mode: Mode,
    dpi: u32,
    saved: Option<SavedCrtc>,
    changed: bool,
}

impl Screen {
    /// Walk the adapter's resources and commit to a display path.
    pub fn discover(card: &Card) -> DrmResult<Self> {
        let resources = card.resource_handles().map_err(ctrl("GET_RESOURCES"))?;
        tracing::debug!(
            connectors = resources.connectors().len(),
            encoders = resources.encoders().len(),
            crtcs = resources.crtcs().len(),
            "enumerated adapter resources"
        );

        let view = CardView {
            card,
            resources: &resources,
        };
        let (conn_handle, crtc_handle) = pick_display(&view)?;

        let conn = card
            .get_connector(conn_handle, false)
            .map_err(ctrl("GET_CONNECTOR"))?;
        let mode = conn
            .modes()
            .first()
            .copied()
            .ok_or(DrmError::NoDisplayFound)?;
        let dpi = derive_dpi(mode.size(), conn.size());

        // Capture what the CRTC shows now; a failed capture only means
        // nothing to put back later.
        let saved = match card.get_crtc(crtc_handle) {
            Ok(info) => Some(SavedCrtc {
                framebuffer: info.framebuffer(),
                position: info.position(),
                mode: info.mode(),
            }),
            Err(err) => {
                tracing::warn!(error = %err, "could not capture previous crtc state");
                None
            }
        };

        let crtc_index = resources
            .crtcs()
            .iter()
            .position(|&handle| handle == crtc_handle)
            .unwrap_or(0) as u32;

        let (width, height) = mode.size();
        tracing::info!(
            interface = ?conn.interface(),
            interface_id = conn.interface_id(),
            width,
            height,
            refresh = mode.vrefresh(),
            dpi,
            "outputting to display"
        );

        Ok(Self {
            connector: conn_handle,
            crtc: crtc_handle,
            crtc_index,
            mode,
            dpi,
            saved,
            changed: false,
        })
    }

    /// Program the CRTC to scan out `fb` with the discovered mode.
    ///
    /// Idempotent from the caller's perspective: re-issuing the same
    /// configuration is how the console is re-lit after a VT acquire.
    pub fn activate(&mut self, card: &Card, fb: framebuffer::Handle) -> DrmResult<()> {
        tracing::info!("setting up crtc");
        retry_control(|| {
            card.set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], Some(self.mode))
        })
        .map_err(DrmError::ModeSetFailed)?;
        self.changed = true;
        Ok(())
    }

    /// Put back whatever the CRTC showed before us.
    ///
    /// Consumes the capture, so a second call does nothing; a capture is only
    /// replayed if [`Screen::activate`] succeeded at least once.
    pub fn restore(&mut self, card: &Card) {
        let Some(saved) = restore_once(&mut self.saved, self.changed) else {
            return;
        };
        tracing::info!("restoring previous crtc");
        if let Err(err) = retry_control(|| {
            card.set_crtc(
                self.crtc,
                saved.framebuffer,
                saved.position,
                &[self.connector],
                saved.mode,
            )
        }) {
            tracing::warn!(error = %err, "failed to restore previous crtc");
        }
    }

    /// Pixel dimensions of the selected mode.
    pub fn resolution(&self) -> (u32, u32) {
        let (width, height) = self.mode.size();
        (u32::from(width), u32::from(height))
    }

    /// Pixel density derived from the connector's physical size, or 96.
    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Index of the chosen CRTC among the adapter's CRTCs, for vblank
    /// requests.
    pub fn crtc_index(&self) -> u32 {
        self.crtc_index
    }
}

/// Restore gating: the capture is consumed on first call, and only a
/// mode-set by us makes it worth replaying.
fn restore_once<T>(saved: &mut Option<T>, changed: bool) -> Option<T> {
    let target = saved.take()?;
    changed.then_some(target)
}

/// Pixels per inch averaged over both axes, rounded; 96 when the connector
/// does not report a physical size.
fn derive_dpi(resolution: (u16, u16), physical_mm: Option<(u32, u32)>) -> u32 {
    const FALLBACK_DPI: u32 = 96;
    let Some((mm_width, mm_height)) = physical_mm else {
        return FALLBACK_DPI;
    };
    if mm_width == 0 || mm_height == 0 {
        return FALLBACK_DPI;
    }
    let horizontal = 25.4 * f64::from(resolution.0) / f64::from(mm_width);
    let vertical = 25.4 * f64::from(resolution.1) / f64::from(mm_height);
    ((horizontal + vertical) / 2.0 + 0.5) as u32
}

/// The slice of adapter state the discovery walk reads.
///
/// [`Card`] backs this with live queries; tests back it with fixtures.
/// Per-resource query failures surface as absent data, which the walk skips.
trait ResourceView {
    type Connector: Copy;
    type Encoder: Copy;
    type Crtc: Copy;

    fn connectors(&self) -> Vec<Self::Connector>;
    fn is_connected(&self, connector: Self::Connector) -> bool;
    fn has_modes(&self, connector: Self::Connector) -> bool;
    fn current_encoder(&self, connector: Self::Connector) -> Option<Self::Encoder>;
    fn encoders(&self, connector: Self::Connector) -> Vec<Self::Encoder>;
    fn current_crtc(&self, encoder: Self::Encoder) -> Option<Self::Crtc>;
    /// CRTCs the encoder's compatibility mask allows, in resource order.
    fn compatible_crtcs(&self, encoder: Self::Encoder) -> Vec<Self::Crtc>;
}

/// First-match display-path selection.
///
/// Commits to the first usable connector before looking at encoders: a
/// connected, mode-bearing connector with no CRTC pairing is a hard failure,
/// not a reason to try the next connector.
fn pick_display<V: ResourceView>(view: &V) -> DrmResult<(V::Connector, V::Crtc)> {
    let connector = view
        .connectors()
        .into_iter()
        .find(|&conn| view.is_connected(conn) && view.has_modes(conn))
        .ok_or(DrmError::NoDisplayFound)?;

    if let Some(encoder) = view.current_encoder(connector)
        && let Some(crtc) = view.current_crtc(encoder)
    {
        return Ok((connector, crtc));
    }

    for encoder in view.encoders(connector) {
        if let Some(crtc) = view.compatible_crtcs(encoder).into_iter().next() {
            return Ok((connector, crtc));
        }
    }
    Err(DrmError::NoEncoderCrtcCombo)
}

/// Live [`ResourceView`] over an open adapter.
struct CardView<'a> {
    card: &'a Card,
    resources: &'a ResourceHandles,
}

impl CardView<'_> {
    fn connector_info(&self, handle: connector::Handle) -> Option<connector::Info> {
        match self.card.get_connector(handle, false) {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::debug!(connector = ?handle, error = %err, "connector query failed");
                None
            }
        }
    }

    fn encoder_info(&self, handle: encoder::Handle) -> Option<encoder::Info> {
        match self.card.get_encoder(handle) {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::debug!(encoder = ?handle, error = %err, "encoder query failed");
                None
            }
        }
    }
}

impl ResourceView for CardView<'_> {
    type Connector = connector::Handle;
    type Encoder = encoder::Handle;
    type Crtc = crtc::Handle;

    fn connectors(&self) -> Vec<connector::Handle> {
        self.resources.connectors().to_vec()
    }

    fn is_connected(&self, handle: connector::Handle) -> bool {
        self.connector_info(handle)
            .is_some_and(|info| info.state() == connector::State::Connected)
    }

    fn has_modes(&self, handle: connector::Handle) -> bool {
        self.connector_info(handle)
            .is_some_and(|info| !info.modes().is_empty())
    }

    fn current_encoder(&self, handle: connector::Handle) -> Option<encoder::Handle> {
        self.connector_info(handle)?.current_encoder()
    }

    fn encoders(&self, handle: connector::Handle) -> Vec<encoder::Handle> {
        self.connector_info(handle)
            .map(|info| info.encoders().to_vec())
            .unwrap_or_default()
    }

    fn current_crtc(&self, handle: encoder::Handle) -> Option<crtc::Handle> {
        self.encoder_info(handle)?.crtc()
    }

    fn compatible_crtcs(&self, handle: encoder::Handle) -> Vec<crtc::Handle> {
        match self.encoder_info(handle) {
            Some(info) => self.resources.filter_crtcs(info.possible_crtcs()),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// In-memory adapter fixture keyed by plain ids.
    #[derive(Default)]
    struct FakeAdapter {
        connectors: Vec<u32>,
        connected: HashSet<u32>,
        with_modes: HashSet<u32>,
        current_encoder: HashMap<u32, u32>,
        encoders: HashMap<u32, Vec<u32>>,
        current_crtc: HashMap<u32, u32>,
        compatible: HashMap<u32, Vec<u32>>,
    }

    impl ResourceView for FakeAdapter {
        type Connector = u32;
        type Encoder = u32;
        type Crtc = u32;

        fn connectors(&self) -> Vec<u32> {
            self.connectors.clone()
        }

        fn is_connected(&self, conn: u32) -> bool {
            self.connected.contains(&conn)
        }

        fn has_modes(&self, conn: u32) -> bool {
            self.with_modes.contains(&conn)
        }

        fn current_encoder(&self, conn: u32) -> Option<u32> {
            self.current_encoder.get(&conn).copied()
        }

        fn encoders(&self, conn: u32) -> Vec<u32> {
            self.encoders.get(&conn).cloned().unwrap_or_default()
        }

        fn current_crtc(&self, enc: u32) -> Option<u32> {
            self.current_crtc.get(&enc).copied()
        }

        fn compatible_crtcs(&self, enc: u32) -> Vec<u32> {
            self.compatible.get(&enc).cloned().unwrap_or_default()
        }
    }

    fn usable_connector(adapter: &mut FakeAdapter, conn: u32) {
        adapter.connectors.push(conn);
        adapter.connected.insert(conn);
        adapter.with_modes.insert(conn);
    }

    #[test]
    fn discovery_skips_disconnected_and_modeless_connectors() {
        let mut adapter = FakeAdapter::default();
        // 10: disconnected; 11: connected but no probed modes; 12: usable.
        adapter.connectors.push(10);
        adapter.connectors.push(11);
        adapter.connected.insert(11);
        usable_connector(&mut adapter, 12);
        adapter.encoders.insert(12, vec![20]);
        adapter.compatible.insert(20, vec![30]);

        let (conn, crtc) = pick_display(&adapter).unwrap();
        assert_eq!(conn, 12);
        assert_eq!(crtc, 30);
    }

    #[test]
    fn discovery_without_usable_connector_reports_no_display() {
        let mut adapter = FakeAdapter::default();
        adapter.connectors.push(1);
        adapter.connected.insert(1);

        assert!(matches!(
            pick_display(&adapter),
            Err(DrmError::NoDisplayFound)
        ));
    }

    #[test]
    fn discovery_prefers_the_lit_encoder_crtc_pair() {
        let mut adapter = FakeAdapter::default();
        usable_connector(&mut adapter, 1);
        adapter.current_encoder.insert(1, 21);
        adapter.current_crtc.insert(21, 31);
        // The scan order would pick a different pair.
        adapter.encoders.insert(1, vec![20, 21]);
        adapter.compatible.insert(20, vec![30]);

        let (_, crtc) = pick_display(&adapter).unwrap();
        assert_eq!(crtc, 31);
    }

    #[test]
    fn discovery_falls_back_when_current_encoder_has_no_crtc() {
        let mut adapter = FakeAdapter::default();
        usable_connector(&mut adapter, 1);
        adapter.current_encoder.insert(1, 21);
        adapter.encoders.insert(1, vec![21, 22]);
        adapter.compatible.insert(21, vec![]);
        adapter.compatible.insert(22, vec![32, 33]);

        let (_, crtc) = pick_display(&adapter).unwrap();
        assert_eq!(crtc, 32);
    }

    #[test]
    fn discovery_commits_to_the_first_usable_connector() {
        let mut adapter = FakeAdapter::default();
        // The first usable connector has no pairing; a later one does. The
        // walk must not fall through to it.
        usable_connector(&mut adapter, 1);
        usable_connector(&mut adapter, 2);
        adapter.encoders.insert(2, vec![20]);
        adapter.compatible.insert(20, vec![30]);

        assert!(matches!(
            pick_display(&adapter),
            Err(DrmError::NoEncoderCrtcCombo)
        ));
    }

    #[test]
    fn discovery_on_a_mixed_adapter_selects_the_expected_path() {
        // Two-output adapter: external output unplugged, internal panel lit.
        let mut adapter = FakeAdapter::default();
        adapter.connectors.push(40);
        usable_connector(&mut adapter, 41);
        adapter.current_encoder.insert(41, 50);
        adapter.current_crtc.insert(50, 60);
        adapter.encoders.insert(41, vec![50, 51]);
        adapter.compatible.insert(51, vec![61]);

        let (conn, crtc) = pick_display(&adapter).unwrap();
        assert_eq!((conn, crtc), (41, 60));
    }

    #[test]
    fn dpi_averages_both_axes_and_rounds() {
        // 25.4 * 254 / 25 = 258.064 on both axes.
        assert_eq!(derive_dpi((254, 254), Some((25, 25))), 258);
        // 1920x1080 on a 509x286 mm panel is ~96 dpi.
        assert_eq!(derive_dpi((1920, 1080), Some((509, 286))), 96);
    }

    #[test]
    fn dpi_defaults_when_physical_size_is_missing_or_zero() {
        assert_eq!(derive_dpi((1920, 1080), None), 96);
        assert_eq!(derive_dpi((1920, 1080), Some((0, 286))), 96);
        assert_eq!(derive_dpi((1920, 1080), Some((509, 0))), 96);
    }

    #[test]
    fn restore_target_is_consumed_on_first_take() {
        let mut saved = Some("previous");
        assert_eq!(restore_once(&mut saved, true), Some("previous"));
        assert_eq!(restore_once(&mut saved, true), None);
    }

    #[test]
    fn restore_target_is_withheld_unless_we_changed_the_crtc() {
        let mut saved = Some("previous");
        assert_eq!(restore_once(&mut saved, false), None);
        // The capture is still consumed; it can never fire later.
        assert_eq!(restore_once(&mut saved, true), None);
    }

    #[test]
    fn error_display_includes_operation() {
        let err = DrmError::ControlFailed {
            op: "SET_MASTER",
            source: io::Error::from_raw_os_error(13),
        };
        assert!(err.to_string().contains("SET_MASTER"));
    }

    #[test]
    fn error_display_includes_device_path() {
        let err = DrmError::DeviceUnavailable {
            path: PathBuf::from("/dev/dri/card7"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/dev/dri/card7"));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// With exactly one valid (connector, encoder, CRTC) path in the
            /// fixture, discovery finds it regardless of how much dead
            /// hardware surrounds it or where it sits in resource order.
            #[test]
            fn discovery_finds_the_single_valid_path(
                dead_connectors in proptest::collection::hash_set(10u32..1000, 0..8),
                dead_encoders in proptest::collection::hash_set(10u32..1000, 0..8),
                live_connector_pos in 0usize..9,
                live_encoder_pos in 0usize..9,
            ) {
                const LIVE_CONNECTOR: u32 = 1;
                const LIVE_ENCODER: u32 = 2;
                const LIVE_CRTC: u32 = 3;

                let mut adapter = FakeAdapter::default();

                let mut order: Vec<u32> = dead_connectors.iter().copied().collect();
                let at = live_connector_pos.min(order.len());
                order.insert(at, LIVE_CONNECTOR);
                for (i, &conn) in order.iter().enumerate() {
                    adapter.connectors.push(conn);
                    if conn == LIVE_CONNECTOR {
                        adapter.connected.insert(conn);
                        adapter.with_modes.insert(conn);
                    } else if i % 2 == 0 {
                        // Dead connectors alternate between disconnected and
                        // connected-but-modeless.
                        adapter.connected.insert(conn);
                    }
                }

                let mut encoders: Vec<u32> = dead_encoders.iter().copied().collect();
                let at = live_encoder_pos.min(encoders.len());
                encoders.insert(at, LIVE_ENCODER);
                for &enc in &encoders {
                    if enc != LIVE_ENCODER {
                        adapter.compatible.insert(enc, vec![]);
                    }
                }
                adapter.compatible.insert(LIVE_ENCODER, vec![LIVE_CRTC]);
                adapter.encoders.insert(LIVE_CONNECTOR, encoders);

                let picked = pick_display(&adapter).unwrap();
                prop_assert_eq!(picked, (LIVE_CONNECTOR, LIVE_CRTC));
            }
        }
    }
}
