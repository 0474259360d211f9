//! Abstraction over the drm device used for sideband scan-out
//!
//! All driver interaction of this crate goes through the [`KmsDevice`] trait.
//! [`DrmDeviceFd`] implements it on top of an open drm node using [`drm-rs`](drm),
//! while the `test_device` feature provides an in-memory [`FakeDevice`](test::FakeDevice).
//!
//! The info types returned by the trait are owned snapshots of the driver objects,
//! which keeps the detection code independent of the lifetime of any ioctl result.

use std::{
    collections::HashMap,
    io,
    os::unix::io::RawFd,
    path::PathBuf,
};

use drm::{
    buffer,
    control::{
        connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags, PlaneType,
        RawResourceHandle, ResourceHandle,
    },
};

use crate::{
    error::{AccessError, Error},
    framebuffer::BufferDescriptor,
};

mod fd;
pub use fd::DrmDeviceFd;


/// Bitmask of crtcs, indexed by the position of the crtc in [`Resources::crtcs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CrtcMask(pub u32);

impl CrtcMask {
    /// Returns true if the crtc at `index` is part of the mask
    pub fn contains_index(&self, index: usize) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }
}

/// Modesetting resources of a device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resources {
    /// All connectors
    pub connectors: Vec<connector::Handle>,
    /// All encoders
    pub encoders: Vec<encoder::Handle>,
    /// All crtcs, in driver order
    pub crtcs: Vec<crtc::Handle>,
}

impl Resources {
    /// Position of the crtc in the driver order
    pub fn crtc_index(&self, crtc: crtc::Handle) -> Option<usize> {
        self.crtcs.iter().position(|c| *c == crtc)
    }

    /// Returns all crtcs that are part of the given mask
    pub fn filter_crtcs(&self, mask: CrtcMask) -> Vec<crtc::Handle> {
        self.crtcs
            .iter()
            .enumerate()
            .filter(|(idx, _)| mask.contains_index(*idx))
            .map(|(_, crtc)| *crtc)
            .collect()
    }

    /// Build the mask matching the given set of crtcs
    pub fn mask_for(&self, crtcs: &[crtc::Handle]) -> CrtcMask {
        CrtcMask(
            crtcs
                .iter()
                .filter_map(|crtc| self.crtc_index(*crtc))
                .filter(|idx| *idx < 32)
                .fold(0, |mask, idx| mask | (1 << idx)),
        )
    }
}

/// Snapshot of a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Connector handle
    pub handle: connector::Handle,
    /// Physical interface type
    pub interface: connector::Interface,
    /// Index of the connector among connectors of the same interface
    pub interface_id: u32,
    /// Connection state
    pub state: connector::State,
    /// Encoders the connector can be driven by
    pub encoders: Vec<encoder::Handle>,
    /// Encoder currently feeding the connector
    pub current_encoder: Option<encoder::Handle>,
}

impl ConnectorInfo {
    /// Human readable connector name, e.g. `HDMI-A-1`
    pub fn name(&self) -> String {
        format!("{}-{}", self.interface.as_str(), self.interface_id)
    }
}

/// Snapshot of an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Encoder handle
    pub handle: encoder::Handle,
    /// Crtc currently bound to the encoder
    pub crtc: Option<crtc::Handle>,
    /// Crtcs the encoder can be driven by
    pub possible_crtcs: CrtcMask,
}

/// A display mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    /// Active area in pixels
    pub size: (u16, u16),
    /// Refresh rate in Hz
    pub vrefresh: u32,
    /// Mode name, e.g. `1920x1080`
    pub name: String,
}

/// Snapshot of a crtc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    /// Crtc handle
    pub handle: crtc::Handle,
    /// Mode the crtc is currently scanning out, `None` if it is disabled
    pub mode: Option<DisplayMode>,
}

/// Snapshot of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Plane handle
    pub handle: plane::Handle,
    /// Crtcs the plane can be attached to
    pub possible_crtcs: CrtcMask,
}

/// Current value of a property on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyEntry {
    /// Property handle
    pub handle: property::Handle,
    /// Raw current value
    pub value: property::RawValue,
}

/// Mapping of property names to their handles and current values for a single object
pub type PropertyMap = HashMap<String, PropertyEntry>;

/// Returns the handle of the named property or an [`Error::UnknownProperty`]
pub fn prop_handle<H: ResourceHandle>(
    props: &PropertyMap,
    handle: H,
    name: &'static str,
) -> Result<property::Handle, Error> {
    props
        .get(name)
        .map(|entry| entry.handle)
        .ok_or_else(|| Error::UnknownProperty {
            handle: handle.into(),
            name,
        })
}

/// Returns a closure wrapping a device error into an [`Error::Access`]
pub(crate) fn access_error<'a, D: KmsDevice>(
    device: &'a D,
    errmsg: &'static str,
) -> impl FnOnce(io::Error) -> Error + 'a {
    move |source| {
        Error::Access(AccessError {
            errmsg,
            dev: device.dev_path(),
            source,
        })
    }
}

/// Decode the `type` property of a plane
pub fn plane_type(props: &PropertyMap) -> Option<PlaneType> {
    props.get("type").and_then(|entry| match entry.value {
        x if x == PlaneType::Overlay as u64 => Some(PlaneType::Overlay),
        x if x == PlaneType::Primary as u64 => Some(PlaneType::Primary),
        x if x == PlaneType::Cursor as u64 => Some(PlaneType::Cursor),
        _ => None,
    })
}

/// Decode the `zpos` property of a plane
pub fn plane_zpos(props: &PropertyMap) -> Option<i32> {
    props.get("zpos").map(|entry| entry.value as i32)
}

/// A set of property changes to be applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    props: Vec<(RawResourceHandle, property::Handle, property::RawValue)>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property of an object, replacing any earlier value of the same property
    pub fn add_property<H: ResourceHandle>(
        &mut self,
        handle: H,
        property: property::Handle,
        value: property::Value<'_>,
    ) {
        self.add_raw_property(handle.into(), property, value.into());
    }

    /// Set a property of an object with a raw value
    pub fn add_raw_property(
        &mut self,
        object: RawResourceHandle,
        property: property::Handle,
        value: property::RawValue,
    ) {
        if let Some(entry) = self
            .props
            .iter_mut()
            .find(|(obj, prop, _)| *obj == object && *prop == property)
        {
            entry.2 = value;
        } else {
            self.props.push((object, property, value));
        }
    }

    /// Value the request assigns to the given property, if any
    pub fn get<H: ResourceHandle>(&self, handle: H, property: property::Handle) -> Option<property::RawValue> {
        let object: RawResourceHandle = handle.into();
        self.props
            .iter()
            .find(|(obj, prop, _)| *obj == object && *prop == property)
            .map(|(_, _, value)| *value)
    }

    /// Iterate over all assignments in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (RawResourceHandle, property::Handle, property::RawValue)> + '_ {
        self.props.iter().copied()
    }

    /// Number of property assignments
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Returns true if the request assigns nothing
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

/// A drm device capable of atomic modesetting
///
/// Every method maps onto a single driver ioctl (or a small fixed set of them)
/// and blocks for its duration.
pub trait KmsDevice: Send {
    /// Path of the underlying device node, if known
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }

    /// Enable the universal planes and atomic client capabilities
    fn enable_atomic(&self) -> io::Result<()>;

    /// Enumerate the modesetting resources
    fn resources(&self) -> io::Result<Resources>;

    /// Query a connector, optionally forcing the driver to re-probe it
    fn connector(&self, handle: connector::Handle, force_probe: bool) -> io::Result<ConnectorInfo>;

    /// Query an encoder
    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo>;

    /// Query a crtc
    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcInfo>;

    /// Enumerate all planes
    fn planes(&self) -> io::Result<Vec<plane::Handle>>;

    /// Query a plane
    fn plane(&self, handle: plane::Handle) -> io::Result<PlaneInfo>;

    /// Read all properties of an object
    fn properties<H: ResourceHandle>(&self, object: H) -> io::Result<PropertyMap>;

    /// Import a dma-buf into a driver memory handle
    fn import_buffer(&self, fd: RawFd) -> io::Result<buffer::Handle>;

    /// Release a driver memory handle
    fn close_buffer(&self, handle: buffer::Handle) -> io::Result<()>;

    /// Register a (multi-planar) framebuffer
    fn add_framebuffer(&self, descriptor: &BufferDescriptor) -> io::Result<framebuffer::Handle>;

    /// Remove a framebuffer
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;

    /// Submit a set of property changes atomically
    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use drm::control::{crtc, from_u32, property};

    use super::{AtomicRequest, CrtcMask, Resources};

    fn crtc(id: u32) -> crtc::Handle {
        from_u32(id).unwrap()
    }

    #[test]
    fn crtc_mask_roundtrip() {
        let res = Resources {
            crtcs: vec![crtc(30), crtc(40), crtc(50)],
            ..Default::default()
        };
        let mask = res.mask_for(&[crtc(50), crtc(30)]);
        assert_eq!(mask, CrtcMask(0b101));
        assert_eq!(res.filter_crtcs(mask), vec![crtc(30), crtc(50)]);
        assert!(!CrtcMask(u32::MAX).contains_index(32));
    }

    #[test]
    fn request_replaces_duplicate_assignments() {
        let prop: property::Handle = from_u32(7).unwrap();
        let mut req = AtomicRequest::new();
        req.add_property(crtc(30), prop, property::Value::UnsignedRange(1));
        req.add_property(crtc(30), prop, property::Value::UnsignedRange(2));
        assert_eq!(req.len(), 1);
        assert_eq!(req.get(crtc(30), prop), Some(2));
    }
}
