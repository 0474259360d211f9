//! Errors reported by the sideband renderer

use std::{io, path::PathBuf};

use drm::control::RawResourceHandle;

use crate::{allocator::AllocatorError, format::HalFormat, output::OutputId};

/// Errors thrown by the [`SidebandRenderer`](crate::SidebandRenderer)
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The renderer has no open drm device
    #[error("The renderer is not initialized")]
    NotInitialized,
    /// `initialize` was called on an already initialized renderer
    #[error("The renderer is already initialized")]
    AlreadyInitialized,
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The output index is not mapped to any display slot
    #[error("Output `{0:?}` is not mapped to a display slot")]
    UnknownOutput(OutputId),
    /// A zero sized frame was requested
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions {
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
    },
    /// The pixel format of a buffer has no drm counterpart
    #[error("Pixel format `{0:?}` has no drm representation")]
    UnsupportedFormat(HalFormat),
    /// The output has no connected connector with an active crtc
    #[error("Output `{0:?}` is not connected")]
    OutputNotConnected(OutputId),
    /// Detection found no overlay plane usable for sideband content
    #[error("Output `{0:?}` has no sideband plane")]
    NoSidebandPlane(OutputId),
    /// A drm object is missing a required property
    #[error("The drm object ({handle:?}) is missing a required property '{name}'")]
    UnknownProperty {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// The allocator failed to describe a buffer
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    /// The buffer layout exceeds what a drm framebuffer can describe
    #[error("Buffer reports {0} memory planes, at most 4 are supported")]
    TooManyPlanes(usize),
}

/// DRM access error
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl Error {
    /// Returns true if the error was caused by the caller passing arguments
    /// that can never succeed, as opposed to the device or topology refusing them.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::UnknownOutput(_) | Error::InvalidDimensions { .. } | Error::UnsupportedFormat(_)
        )
    }
}
