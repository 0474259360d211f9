#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Sideband: direct scan-out of decoded video on drm overlay planes
//!
//! This crate presents buffers produced outside the normal composition path, for example
//! by a hardware video decoder or a HDMI capture unit, directly on an overlay plane of a
//! drm device. It translates a "show this buffer on this output" request into a
//! consistent set of plane properties and submits them as a single atomic commit.
//!
//! ## Structure of the crate
//!
//! - [`device`] abstracts the drm device through the [`KmsDevice`](device::KmsDevice) trait,
//! - [`allocator`] abstracts the buffer allocator through the [`BufferMapper`](allocator::BufferMapper) trait,
//! - [`format`] maps allocator pixel formats onto drm formats,
//! - [`framebuffer`] registers buffers as drm framebuffers and caches them,
//! - [`scanner`] and [`planes`] detect the topology of each output and its sideband plane,
//! - [`commit`] builds the atomic transactions,
//! - [`renderer`] ties all of the above together behind a single lock.
//!
//! Most users only need [`SidebandRenderer`]:
//!
//! ```no_run
//! use sideband::{
//!     allocator::{AllocatorError, BufferHandle, BufferLayout, BufferMapper},
//!     commit::ScalingMode,
//!     device::DrmDeviceFd,
//!     format::InputType,
//!     OutputId, SidebandConfig, SidebandRenderer,
//! };
//!
//! #[derive(Debug)]
//! struct Gralloc;
//!
//! impl BufferMapper for Gralloc {
//!     fn describe(&self, handle: BufferHandle) -> Result<BufferLayout, AllocatorError> {
//!         Err(AllocatorError::UnknownBuffer(handle))
//!     }
//! }
//!
//! let renderer: SidebandRenderer<DrmDeviceFd, _> =
//!     SidebandRenderer::new(SidebandConfig::from_env(), Gralloc).expect("no clock");
//! renderer.initialize().expect("failed to open the drm device");
//! renderer
//!     .set_plane(
//!         OutputId::PRIMARY,
//!         1920,
//!         1080,
//!         BufferHandle(0x1234),
//!         ScalingMode::Fit,
//!         InputType::Decoder,
//!     )
//!     .expect("failed to show frame");
//! ```
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging, but never installs
//! a subscriber. All events of a renderer are emitted inside a `sideband` span.
//! [`SidebandRenderer::set_debug_level`] raises the level submitted transactions are logged at.

pub mod allocator;
pub mod commit;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod framebuffer;
pub mod output;
pub mod planes;
pub mod renderer;
pub mod scanner;
pub mod skip_frame;
pub mod utils;

pub use config::SidebandConfig;
pub use error::Error;
pub use output::{DisplayInfo, OutputId};
pub use renderer::{CommitOutcome, SidebandRenderer};
