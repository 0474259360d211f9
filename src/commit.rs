//! Construction of the atomic transactions binding sideband content to a plane
//!
//! [`PlaneConfig::compute`] places the content on the display according to a
//! [`ScalingMode`], [`build_plane_request`] turns the result into the property
//! assignments of a single atomic commit and [`build_clear_request`] produces the
//! transaction unbinding the plane again.

use std::os::unix::io::RawFd;

use drm::control::{crtc, framebuffer, property};

use crate::{
    config::Overscan,
    device::{prop_handle, AtomicRequest},
    error::Error,
    output::PanelOrientation,
    planes::SidebandPlane,
    utils::{Buffer, Physical, Rectangle, Size},
};

/// Policy used to fit content into the display area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScalingMode {
    /// Scale preserving the aspect ratio, letterboxing the remaining area
    #[default]
    Fit,
    /// Scale to the full display area, ignoring the aspect ratio
    Stretch,
    /// Scale preserving the aspect ratio, cropping content outside the display area
    Crop,
}

/// Raw scaling mode value that is not known
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Unknown scaling mode {0}")]
pub struct UnknownScalingMode(pub u32);

impl TryFrom<u32> for ScalingMode {
    type Error = UnknownScalingMode;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ScalingMode::Fit),
            1 => Ok(ScalingMode::Stretch),
            2 => Ok(ScalingMode::Crop),
            x => Err(UnknownScalingMode(x)),
        }
    }
}

/// Placement of the content on the plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneConfig {
    /// Region of the buffer to scan out
    pub src: Rectangle<Buffer>,
    /// Region of the display to scan out to
    pub dst: Rectangle<Physical>,
}

impl PlaneConfig {
    /// Compute the placement of `content` sized content stored in a `buffer` sized buffer
    /// on a display of `display` size.
    ///
    /// The source never exceeds the buffer. With `overscan` set the display area is
    /// shrunk by the given margins before the scaling policy is applied.
    pub fn compute(
        content: Size<Buffer>,
        buffer: Size<Buffer>,
        display: Size<Physical>,
        overscan: Option<Overscan>,
        mode: ScalingMode,
    ) -> PlaneConfig {
        let mut src = Rectangle::from_size((content.w.min(buffer.w), content.h.min(buffer.h)));
        let area = display_area(display, overscan);

        if src.size.is_empty() || area.size.is_empty() {
            return PlaneConfig { src, dst: area };
        }

        let (sw, sh) = (src.size.w as i64, src.size.h as i64);
        let (aw, ah) = (area.size.w as i64, area.size.h as i64);
        // content is relatively wider than the display area
        let wider = sw * ah > aw * sh;

        let dst = match mode {
            ScalingMode::Stretch => area,
            ScalingMode::Fit => {
                let (w, h) = if wider {
                    (aw, (sh * aw / sw).max(1))
                } else {
                    ((sw * ah / sh).max(1), ah)
                };
                Rectangle::from_loc_and_size(
                    (area.loc.x + ((aw - w) / 2) as i32, area.loc.y + ((ah - h) / 2) as i32),
                    (w as i32, h as i32),
                )
            }
            ScalingMode::Crop => {
                if wider {
                    let w = (aw * sh / ah).max(1);
                    src = Rectangle::from_loc_and_size((((sw - w) / 2) as i32, 0), (w as i32, sh as i32));
                } else {
                    let h = (ah * sw / aw).max(1);
                    src = Rectangle::from_loc_and_size((0, ((sh - h) / 2) as i32), (sw as i32, h as i32));
                }
                area
            }
        };

        PlaneConfig { src, dst }
    }
}

fn display_area(display: Size<Physical>, overscan: Option<Overscan>) -> Rectangle<Physical> {
    let full = Rectangle::from_size(display);
    let Some(overscan) = overscan else {
        return full;
    };

    let margin = |len: i32, percent: u8| len * percent.min(100) as i32 / 100;
    let left = margin(display.w, overscan.left);
    let right = margin(display.w, overscan.right);
    let top = margin(display.h, overscan.top);
    let bottom = margin(display.h, overscan.bottom);

    let w = display.w - left - right;
    let h = display.h - top - bottom;
    if w <= 0 || h <= 0 {
        return full;
    }
    Rectangle::from_loc_and_size((left, top), (w, h))
}

bitflags::bitflags! {
    /// Values of the `rotation` plane property
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DrmRotation: u8 {
        /// No rotation
        const ROTATE_0      =   0b00000001;
        /// Rotated by 90 degrees counter-clockwise
        const ROTATE_90     =   0b00000010;
        /// Rotated by 180 degrees
        const ROTATE_180    =   0b00000100;
        /// Rotated by 270 degrees counter-clockwise
        const ROTATE_270    =   0b00001000;
        /// Mirrored horizontally
        const REFLECT_X     =   0b00010000;
        /// Mirrored vertically
        const REFLECT_Y     =   0b00100000;
    }
}

impl From<PanelOrientation> for DrmRotation {
    fn from(orientation: PanelOrientation) -> Self {
        match orientation {
            PanelOrientation::UpsideDown => DrmRotation::ROTATE_180,
            // sideband content is only compensated for upside down panels
            PanelOrientation::Normal | PanelOrientation::LeftSideUp | PanelOrientation::RightSideUp => {
                DrmRotation::ROTATE_0
            }
        }
    }
}

/// Per commit parameters of [`build_plane_request`]
#[derive(Debug, Clone, Copy)]
pub struct PlaneState {
    /// Crtc to attach the plane to
    pub crtc: crtc::Handle,
    /// Framebuffer to scan out
    pub fb: framebuffer::Handle,
    /// Placement of the content
    pub config: PlaneConfig,
    /// Rotation compensating the panel orientation
    pub rotation: DrmRotation,
    /// Fence to wait on before scanning out `fb`
    pub fence: Option<RawFd>,
}

/// Build the transaction binding `state.fb` to the sideband plane
///
/// The `zpos` property is written only if the driver exposes it as mutable
/// on this plane, which is signalled by its presence in the property map.
pub fn build_plane_request(plane: &SidebandPlane, state: &PlaneState) -> Result<AtomicRequest, Error> {
    let handle = plane.handle;
    let props = &plane.props;
    let mut req = AtomicRequest::new();

    // connect the plane to the CRTC
    req.add_property(
        handle,
        prop_handle(props, handle, "CRTC_ID")?,
        property::Value::CRTC(Some(state.crtc)),
    );

    // Set the fb for the plane
    req.add_property(
        handle,
        prop_handle(props, handle, "FB_ID")?,
        property::Value::Framebuffer(Some(state.fb)),
    );

    let src = state.config.src;
    req.add_property(
        handle,
        prop_handle(props, handle, "SRC_X")?,
        // these are 16.16. fixed point
        property::Value::UnsignedRange(to_fixed(src.loc.x) as u64),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "SRC_Y")?,
        property::Value::UnsignedRange(to_fixed(src.loc.y) as u64),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "SRC_W")?,
        property::Value::UnsignedRange(to_fixed(src.size.w) as u64),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "SRC_H")?,
        property::Value::UnsignedRange(to_fixed(src.size.h) as u64),
    );

    let dst = state.config.dst;
    req.add_property(
        handle,
        prop_handle(props, handle, "CRTC_X")?,
        property::Value::SignedRange(dst.loc.x as i64),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "CRTC_Y")?,
        property::Value::SignedRange(dst.loc.y as i64),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "CRTC_W")?,
        property::Value::UnsignedRange(dst.size.w as u64),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "CRTC_H")?,
        property::Value::UnsignedRange(dst.size.h as u64),
    );

    if let (Some(entry), Some(zpos)) = (props.get("zpos"), plane.zpos) {
        req.add_property(handle, entry.handle, property::Value::UnsignedRange(zpos as u64));
    }

    if let Ok(prop) = prop_handle(props, handle, "rotation") {
        req.add_property(handle, prop, property::Value::Bitmask(state.rotation.bits() as u64));
    } else if state.rotation != DrmRotation::ROTATE_0 {
        return Err(Error::UnknownProperty {
            handle: handle.into(),
            name: "rotation",
        });
    }

    if let Ok(prop) = prop_handle(props, handle, "IN_FENCE_FD") {
        let fence = state.fence.map(i64::from).unwrap_or(-1);
        req.add_property(handle, prop, property::Value::SignedRange(fence));
    }

    Ok(req)
}

/// Build the transaction detaching the sideband plane from its framebuffer and crtc
pub fn build_clear_request(plane: &SidebandPlane) -> Result<AtomicRequest, Error> {
    let handle = plane.handle;
    let props = &plane.props;
    let mut req = AtomicRequest::new();

    req.add_property(
        handle,
        prop_handle(props, handle, "CRTC_ID")?,
        property::Value::CRTC(None),
    );
    req.add_property(
        handle,
        prop_handle(props, handle, "FB_ID")?,
        property::Value::Framebuffer(None),
    );
    for name in ["SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_W", "CRTC_H"] {
        req.add_property(
            handle,
            prop_handle(props, handle, name)?,
            property::Value::UnsignedRange(0u64),
        );
    }
    for name in ["CRTC_X", "CRTC_Y"] {
        req.add_property(
            handle,
            prop_handle(props, handle, name)?,
            property::Value::SignedRange(0i64),
        );
    }
    if let Ok(prop) = prop_handle(props, handle, "IN_FENCE_FD") {
        req.add_property(handle, prop, property::Value::SignedRange(-1));
    }

    Ok(req)
}

fn to_fixed(n: i32) -> u32 {
    (n.max(0) as u32) << 16
}
