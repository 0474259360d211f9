use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use drm::{
    buffer::{self, PlanarBuffer},
    control::{
        connector, crtc, encoder, framebuffer, plane, AtomicCommitFlags, Device as ControlDevice,
        FbCmd2Flags, RawResourceHandle, ResourceHandle,
    },
    ClientCapability, Device as BasicDevice,
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{error, info, trace, warn};

use super::{
    AtomicRequest, ConnectorInfo, CrtcInfo, CrtcMask, DisplayMode, EncoderInfo, KmsDevice, PlaneInfo, PropertyEntry,
    PropertyMap, Resources,
};
use crate::framebuffer::BufferDescriptor;

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    path: Option<PathBuf>,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.path);
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd` from an already open drm node.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    pub fn new(fd: OwnedFd, path: Option<PathBuf>) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            path,
            privileged: false,
        };

        // Atomic commits on planes we do not own through a lease require master.
        // Display servers usually hold it already, in which case we continue unprivileged
        // and rely on the kernel to grant plane updates on the shared node.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Open the drm node at the given path
    pub fn open(path: impl AsRef<Path>) -> io::Result<DrmDeviceFd> {
        let path = path.as_ref();
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(DrmDeviceFd::new(OwnedFd::from(file), Some(path.to_path_buf())))
    }

    /// Returns true if the master lock was acquired for this device
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }
}

fn crtc_mask(all: &[crtc::Handle], possible: &[crtc::Handle]) -> CrtcMask {
    Resources {
        crtcs: all.to_vec(),
        ..Default::default()
    }
    .mask_for(possible)
}

struct DescriptorBuffer<'a> {
    descriptor: &'a BufferDescriptor,
    fourcc: DrmFourcc,
}

impl<'a> PlanarBuffer for DescriptorBuffer<'a> {
    fn size(&self) -> (u32, u32) {
        (self.descriptor.width, self.descriptor.height)
    }

    fn format(&self) -> DrmFourcc {
        self.fourcc
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.descriptor.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.descriptor.gem_handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.descriptor.offsets
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        self.0.path.clone()
    }

    fn enable_atomic(&self) -> io::Result<()> {
        self.set_client_capability(ClientCapability::UniversalPlanes, true)?;
        self.set_client_capability(ClientCapability::Atomic, true)
    }

    fn resources(&self) -> io::Result<Resources> {
        let res = self.resource_handles()?;
        Ok(Resources {
            connectors: res.connectors().to_vec(),
            encoders: res.encoders().to_vec(),
            crtcs: res.crtcs().to_vec(),
        })
    }

    fn connector(&self, handle: connector::Handle, force_probe: bool) -> io::Result<ConnectorInfo> {
        let info = self.get_connector(handle, force_probe)?;
        Ok(ConnectorInfo {
            handle,
            interface: info.interface(),
            interface_id: info.interface_id(),
            state: info.state(),
            encoders: info.encoders().to_vec(),
            current_encoder: info.current_encoder(),
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        let info = self.get_encoder(handle)?;
        let res = self.resource_handles()?;
        let possible = res.filter_crtcs(info.possible_crtcs());
        Ok(EncoderInfo {
            handle,
            crtc: info.crtc(),
            possible_crtcs: crtc_mask(res.crtcs(), &possible),
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcInfo> {
        let info = self.get_crtc(handle)?;
        Ok(CrtcInfo {
            handle,
            mode: info.mode().map(|mode| DisplayMode {
                size: mode.size(),
                vrefresh: mode.vrefresh(),
                name: mode.name().to_string_lossy().into_owned(),
            }),
        })
    }

    fn planes(&self) -> io::Result<Vec<plane::Handle>> {
        self.plane_handles()
    }

    fn plane(&self, handle: plane::Handle) -> io::Result<PlaneInfo> {
        let info = self.get_plane(handle)?;
        let res = self.resource_handles()?;
        let possible = res.filter_crtcs(info.possible_crtcs());
        Ok(PlaneInfo {
            handle,
            possible_crtcs: crtc_mask(res.crtcs(), &possible),
        })
    }

    fn properties<H: ResourceHandle>(&self, object: H) -> io::Result<PropertyMap> {
        let props = self.get_properties(object)?;
        let (handles, values) = props.as_props_and_values();
        let mut map = PropertyMap::new();
        for (&handle, &value) in handles.iter().zip(values.iter()) {
            // properties we can not query are not usable for commits either
            if let Ok(info) = self.get_property(handle) {
                let name = info.name().to_string_lossy().into_owned();
                map.insert(name, PropertyEntry { handle, value });
            }
        }
        let raw: RawResourceHandle = object.into();
        trace!(object = ?raw, "mapped {} properties", map.len());
        Ok(map)
    }

    fn import_buffer(&self, fd: RawFd) -> io::Result<buffer::Handle> {
        // SAFETY: the allocator keeps the dma-buf open for the lifetime of the buffer,
        // which outlives this call.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.prime_fd_to_buffer(fd)
    }

    fn close_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        ControlDevice::close_buffer(self, handle)
    }

    #[profiling::function]
    fn add_framebuffer(&self, descriptor: &BufferDescriptor) -> io::Result<framebuffer::Handle> {
        if let Some(fourcc) = descriptor.format.as_fourcc() {
            let buffer = DescriptorBuffer { descriptor, fourcc };
            return self.add_planar_framebuffer(&buffer, FbCmd2Flags::empty());
        }

        // vendor formats are unknown to drm-fourcc, so we go through the raw ioctl
        let handles = descriptor
            .gem_handles
            .map(|handle| handle.map(u32::from).unwrap_or(0));
        let cmd = drm_ffi::mode::add_fb2(
            self.as_fd(),
            descriptor.width,
            descriptor.height,
            descriptor.format.0,
            &handles,
            &descriptor.pitches,
            &descriptor.offsets,
            &[0; 4],
            0,
        )?;
        drm::control::from_u32(cmd.fb_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "driver returned framebuffer id 0"))
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, fb)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> io::Result<()> {
        let mut req = drm::control::atomic::AtomicModeReq::new();
        for (object, property, value) in request.iter() {
            req.add_raw_property(object, property, value);
        }
        ControlDevice::atomic_commit(self, flags, req)
    }
}
