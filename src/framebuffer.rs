//! Registration of allocator buffers as drm framebuffers
//!
//! Sideband producers cycle through a small pool of buffers, so registering a
//! framebuffer is done once per buffer and the resulting id is cached under the
//! [`BufferHandle`]. The cache is bounded: once it grows beyond its capacity the
//! least recently used framebuffer, that is not bound to any plane, gets removed
//! from the driver again.

use std::os::unix::io::RawFd;

use drm::{buffer, control::framebuffer};
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::{
    allocator::{BufferHandle, BufferLayout, BufferMapper},
    device::{access_error, KmsDevice},
    error::Error,
    format::{drm_format_for_input, FourccCode, InputType},
};

/// Description of a buffer as handed to the driver for framebuffer creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Drm format of the buffer
    pub format: FourccCode,
    /// Bytes per row, per plane
    pub pitches: [u32; 4],
    /// Offset of each plane into its memory handle
    pub offsets: [u32; 4],
    /// Driver memory handle of each plane
    pub gem_handles: [Option<buffer::Handle>; 4],
    /// Framebuffer created for this descriptor
    pub fb_id: Option<framebuffer::Handle>,
    /// Fence the producer attached to the buffer
    pub acquire_fence: Option<RawFd>,
    /// Allocator buffer this descriptor was built from
    pub private: Option<BufferHandle>,
}

#[derive(Debug, Clone, Copy)]
struct CachedFramebuffer {
    fb: framebuffer::Handle,
    size: (u32, u32),
    byte_len: usize,
}

/// Cache mapping allocator buffers to registered framebuffers
#[derive(Debug)]
pub struct FramebufferCache {
    // ordered from least to most recently used
    entries: IndexMap<BufferHandle, CachedFramebuffer>,
    capacity: usize,
}

impl FramebufferCache {
    /// Create an empty cache holding at most `capacity` framebuffers
    pub fn new(capacity: usize) -> FramebufferCache {
        FramebufferCache {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up a cached framebuffer without touching the driver
    pub fn get(&mut self, handle: BufferHandle) -> Option<framebuffer::Handle> {
        let entry = self.entries.shift_remove(&handle)?;
        self.entries.insert(handle, entry);
        Some(entry.fb)
    }

    /// Returns the framebuffer for the given buffer, registering it with the driver if necessary.
    ///
    /// `pinned` lists framebuffers currently bound to a plane, those are never evicted.
    /// On failure the cache is left unchanged.
    #[profiling::function]
    pub fn resolve<D, M>(
        &mut self,
        device: &D,
        mapper: &M,
        handle: BufferHandle,
        input: InputType,
        pinned: &[framebuffer::Handle],
    ) -> Result<framebuffer::Handle, Error>
    where
        D: KmsDevice,
        M: BufferMapper + ?Sized,
    {
        if let Some(fb) = self.get(handle) {
            trace!(?handle, ?fb, "framebuffer cache hit");
            return Ok(fb);
        }

        let layout = mapper.describe(handle)?;
        let (fb, descriptor) = register(device, handle, &layout, input)?;
        debug!(
            ?handle,
            ?fb,
            format = ?descriptor.format,
            "registered {}x{} framebuffer",
            descriptor.width,
            descriptor.height
        );

        self.entries.insert(
            handle,
            CachedFramebuffer {
                fb,
                size: (descriptor.width, descriptor.height),
                byte_len: layout.byte_len,
            },
        );
        self.evict(device, handle, pinned);
        Ok(fb)
    }

    /// Drop the framebuffer of a buffer that was released by the allocator
    pub fn release<D: KmsDevice>(&mut self, device: &D, handle: BufferHandle) -> Option<framebuffer::Handle> {
        let entry = self.entries.shift_remove(&handle)?;
        destroy(device, entry.fb);
        Some(entry.fb)
    }

    /// Remove every cached framebuffer from the driver
    pub fn destroy_all<D: KmsDevice>(&mut self, device: &D) {
        for (_, entry) in self.entries.drain(..) {
            destroy(device, entry.fb);
        }
    }

    /// Dimensions of a cached buffer in pixels
    pub fn size(&self, handle: BufferHandle) -> Option<(u32, u32)> {
        self.entries.get(&handle).map(|entry| entry.size)
    }

    /// Size in bytes of a cached buffer
    pub fn byte_len(&self, handle: BufferHandle) -> Option<usize> {
        self.entries.get(&handle).map(|entry| entry.byte_len)
    }

    /// Number of cached framebuffers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict<D: KmsDevice>(&mut self, device: &D, keep: BufferHandle, pinned: &[framebuffer::Handle]) {
        while self.entries.len() > self.capacity {
            let Some(victim) = self
                .entries
                .iter()
                .find(|(handle, entry)| **handle != keep && !pinned.contains(&entry.fb))
                .map(|(handle, _)| *handle)
            else {
                break;
            };
            if let Some(entry) = self.entries.shift_remove(&victim) {
                debug!(handle = ?victim, fb = ?entry.fb, "evicting framebuffer");
                destroy(device, entry.fb);
            }
        }
    }
}

fn destroy<D: KmsDevice>(device: &D, fb: framebuffer::Handle) {
    trace!(?fb, "destroying framebuffer");
    if let Err(err) = device.destroy_framebuffer(fb) {
        warn!(?fb, ?err, "failed to destroy framebuffer");
    }
}

/// Import the memory of a buffer and register it as a framebuffer.
///
/// The imported memory handles are closed again before returning,
/// the framebuffer keeps its own reference to the memory.
pub fn register<D: KmsDevice>(
    device: &D,
    handle: BufferHandle,
    layout: &BufferLayout,
    input: InputType,
) -> Result<(framebuffer::Handle, BufferDescriptor), Error> {
    if layout.width == 0 || layout.height == 0 {
        return Err(Error::InvalidDimensions {
            width: layout.width as i32,
            height: layout.height as i32,
        });
    }
    if layout.planes.is_empty() || layout.planes.len() > 4 {
        return Err(Error::TooManyPlanes(layout.planes.len()));
    }
    let format = drm_format_for_input(layout.format, input).ok_or(Error::UnsupportedFormat(layout.format))?;

    let mut descriptor = BufferDescriptor {
        width: layout.width,
        height: layout.height,
        format,
        pitches: [0; 4],
        offsets: [0; 4],
        gem_handles: [None; 4],
        fb_id: None,
        acquire_fence: layout.acquire_fence,
        private: Some(handle),
    };

    // planes frequently share one dma-buf, which imports to the same memory handle
    let mut imported: SmallVec<[(RawFd, buffer::Handle); 4]> = SmallVec::new();
    let result = (|| {
        for (idx, plane) in layout.planes.iter().enumerate() {
            let gem = match imported.iter().find(|(fd, _)| *fd == plane.fd) {
                Some((_, gem)) => *gem,
                None => {
                    let gem = device
                        .import_buffer(plane.fd)
                        .map_err(access_error(device, "Failed to import dma-buf"))?;
                    imported.push((plane.fd, gem));
                    gem
                }
            };
            descriptor.pitches[idx] = plane.pitch;
            descriptor.offsets[idx] = plane.offset;
            descriptor.gem_handles[idx] = Some(gem);
        }

        device
            .add_framebuffer(&descriptor)
            .map_err(access_error(device, "Failed to add framebuffer"))
    })();

    for (_, gem) in imported {
        if let Err(err) = device.close_buffer(gem) {
            warn!(?err, "failed to close imported memory handle");
        }
    }

    let fb = result?;
    descriptor.fb_id = Some(fb);
    Ok((fb, descriptor))
}
