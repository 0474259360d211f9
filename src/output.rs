//! Per-output state
//!
//! An [`Output`] is one display slot of the renderer. Its state is split along the
//! two subsystems allowed to write it:
//!
//! - [`TopologyState`] is replaced wholesale by detection,
//! - [`BindingState`] is updated by the plane committer after a successful commit.
//!
//! Neither subsystem touches the other half.

use drm::control::{connector, crtc, encoder, framebuffer, plane};

use crate::{
    allocator::BufferHandle,
    device::{CrtcMask, DisplayMode, PropertyMap},
    planes::SidebandPlane,
    utils::{Buffer, Physical, Rectangle},
};

/// Identifier of a display slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

impl OutputId {
    /// The built-in or main display
    pub const PRIMARY: OutputId = OutputId(0);
    /// The first external display
    pub const EXTERNAL: OutputId = OutputId(1);
}

/// Detection state of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputStatus {
    /// Detection did not run yet, or the output was reset
    #[default]
    Undetected,
    /// A connector of the output drives an active crtc
    Connected,
    /// Detection ran, but found nothing to display on
    Disconnected,
}

/// Mounting orientation of a panel, as reported by the `panel orientation` connector property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanelOrientation {
    /// Mounted upright
    #[default]
    Normal,
    /// Mounted upside down
    UpsideDown,
    /// Rotated to the left
    LeftSideUp,
    /// Rotated to the right
    RightSideUp,
}

impl PanelOrientation {
    /// Decode the raw value of the `panel orientation` enum property
    pub fn from_raw(value: u64) -> PanelOrientation {
        match value {
            1 => PanelOrientation::UpsideDown,
            2 => PanelOrientation::LeftSideUp,
            3 => PanelOrientation::RightSideUp,
            _ => PanelOrientation::Normal,
        }
    }
}

/// Everything detection learned about a single connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    /// Connector handle
    pub connector: connector::Handle,
    /// Connector name, e.g. `HDMI-A-1`
    pub connector_name: String,
    /// Connection state at detection time
    pub state: connector::State,
    /// Encoder currently feeding the connector
    pub encoder: Option<encoder::Handle>,
    /// Crtc currently driving the connector
    pub crtc: Option<crtc::Handle>,
    /// Mode of that crtc
    pub mode: Option<DisplayMode>,
    /// Properties of the connector
    pub props: PropertyMap,
    /// Crtcs any encoder of the connector can be driven by
    pub possible_crtcs: CrtcMask,
    /// Sideband plane found for `crtc`
    pub plane: Option<plane::Handle>,
    /// Panel orientation
    pub orientation: PanelOrientation,
}

impl ModeInfo {
    /// Returns true if the connector is connected to a crtc with an active mode
    pub fn is_active(&self) -> bool {
        self.state == connector::State::Connected && self.crtc.is_some() && self.mode.is_some()
    }
}

/// Summary of a logical display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Output this display belongs to
    pub display_id: OutputId,
    /// Crtc driving the display
    pub crtc: Option<crtc::Handle>,
    /// Name of the connector
    pub connector_name: String,
    /// Whether the display can show content
    pub connected: bool,
}

/// State owned by detection
#[derive(Debug, Clone, Default)]
pub struct TopologyState {
    /// Detection state
    pub status: OutputStatus,
    /// All connectors routed to this output
    pub mode_infos: Vec<ModeInfo>,
    /// Index into `mode_infos` of the connector content is shown on
    pub active: Option<usize>,
    /// Plane selected for sideband content
    pub plane: Option<SidebandPlane>,
}

impl TopologyState {
    /// Record of the connector content is shown on
    pub fn active_mode_info(&self) -> Option<&ModeInfo> {
        self.active.and_then(|idx| self.mode_infos.get(idx))
    }

    /// Crtc content is shown on
    pub fn crtc(&self) -> Option<crtc::Handle> {
        self.active_mode_info().and_then(|info| info.crtc)
    }

    /// Mode content is shown in
    pub fn mode(&self) -> Option<&DisplayMode> {
        self.active_mode_info().and_then(|info| info.mode.as_ref())
    }

    /// Summary of this topology
    pub fn display_info(&self, id: OutputId) -> DisplayInfo {
        let info = self.active_mode_info().or_else(|| self.mode_infos.first());
        DisplayInfo {
            display_id: id,
            crtc: info.and_then(|info| info.crtc),
            connector_name: info.map(|info| info.connector_name.clone()).unwrap_or_default(),
            connected: self.status == OutputStatus::Connected,
        }
    }
}

/// State owned by the plane committer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingState {
    /// Framebuffer currently scanned out by the sideband plane
    pub fb: Option<framebuffer::Handle>,
    /// Allocator buffer `fb` was registered for
    pub buffer: Option<BufferHandle>,
    /// Source rectangle of the last commit
    pub src: Option<Rectangle<Buffer>>,
    /// Destination rectangle of the last commit
    pub dst: Option<Rectangle<Physical>>,
}

/// A display slot
#[derive(Debug, Clone)]
pub struct Output {
    id: OutputId,
    /// Written by detection
    pub topology: TopologyState,
    /// Written by the plane committer
    pub binding: BindingState,
}

impl Output {
    /// Create an undetected output
    pub fn new(id: OutputId) -> Output {
        Output {
            id,
            topology: TopologyState::default(),
            binding: BindingState::default(),
        }
    }

    /// Identifier of this output
    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Drop all state, returning the output to [`OutputStatus::Undetected`]
    pub fn reset(&mut self) {
        self.topology = TopologyState::default();
        self.binding = BindingState::default();
    }

    /// Returns true if the output can take a sideband commit
    pub fn is_ready(&self) -> bool {
        self.topology.status == OutputStatus::Connected && self.topology.plane.is_some()
    }
}
