//! Access to the buffer allocator
//!
//! The sideband path never allocates buffers itself. Buffers are produced by the
//! platform allocator and identified by an opaque [`BufferHandle`]. A [`BufferMapper`]
//! resolves such a handle into its memory layout, which is all that is needed to
//! register the buffer as a drm framebuffer.

use std::os::unix::io::RawFd;

use smallvec::SmallVec;

use crate::format::HalFormat;

/// Opaque identity of an allocator buffer
///
/// Two handles compare equal, if they refer to the same physical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub usize);

/// A single memory plane of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Dma-buf file descriptor backing this plane
    ///
    /// Owned by the allocator and valid for as long as the buffer is alive.
    pub fd: RawFd,
    /// Bytes per row
    pub pitch: u32,
    /// Offset of the first pixel in the memory segment
    pub offset: u32,
}

/// Memory layout of an allocator buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format as reported by the allocator
    pub format: HalFormat,
    /// Memory planes, in format order
    pub planes: SmallVec<[PlaneLayout; 4]>,
    /// Total size of the allocation in bytes
    pub byte_len: usize,
    /// Fence to wait on before the buffer contents may be scanned out
    pub acquire_fence: Option<RawFd>,
}

/// Error returned by a [`BufferMapper`]
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// The handle does not refer to a live buffer
    #[error("Buffer {0:?} is unknown to the allocator")]
    UnknownBuffer(BufferHandle),
    /// The allocator failed to map the buffer
    #[error("Failed to query buffer {handle:?}: {reason}")]
    Query {
        /// Buffer that failed
        handle: BufferHandle,
        /// Reason reported by the allocator
        reason: String,
    },
}

/// Capability to resolve allocator handles into memory layouts
pub trait BufferMapper: Send + Sync {
    /// Describe the memory layout of the given buffer
    fn describe(&self, handle: BufferHandle) -> Result<BufferLayout, AllocatorError>;

    /// Fence guarding the current contents of the buffer
    ///
    /// Queried on every commit, as opposed to [`describe`](BufferMapper::describe)
    /// which is only used when a buffer is first registered.
    fn acquire_fence(&self, handle: BufferHandle) -> Option<RawFd> {
        let _ = handle;
        None
    }
}

impl<M: BufferMapper + ?Sized> BufferMapper for std::sync::Arc<M> {
    fn describe(&self, handle: BufferHandle) -> Result<BufferLayout, AllocatorError> {
        (**self).describe(handle)
    }

    fn acquire_fence(&self, handle: BufferHandle) -> Option<RawFd> {
        (**self).acquire_fence(handle)
    }
}

impl<M: BufferMapper + ?Sized> BufferMapper for Box<M> {
    fn describe(&self, handle: BufferHandle) -> Result<BufferLayout, AllocatorError> {
        (**self).describe(handle)
    }

    fn acquire_fence(&self, handle: BufferHandle) -> Option<RawFd> {
        (**self).acquire_fence(handle)
    }
}
