//! The host facing sideband renderer
//!
//! [`SidebandRenderer`] owns the drm device, the per-output state, the framebuffer
//! cache and the skip-frame guard behind a single [`Mutex`]. Every operation touching
//! any of them holds that lock for its full duration, so detection and commits of
//! concurrent callers are strictly serialized in lock acquisition order.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use drm::control::{framebuffer, plane, AtomicCommitFlags};
use indexmap::IndexMap;
use tracing::{debug, debug_span, error, info, info_span, trace, warn};

use crate::{
    allocator::{BufferHandle, BufferMapper},
    commit::{build_clear_request, build_plane_request, DrmRotation, PlaneConfig, PlaneState, ScalingMode},
    config::SidebandConfig,
    device::{access_error, AtomicRequest, DrmDeviceFd, KmsDevice},
    error::{AccessError, Error},
    format::InputType,
    framebuffer::FramebufferCache,
    output::{BindingState, DisplayInfo, Output, OutputId, OutputStatus},
    scanner,
    skip_frame::SkipFrameGuard,
    utils::{Clock, Monotonic, Size},
};

/// Result of a successful [`SidebandRenderer::set_plane`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The frame was committed to the plane
    Committed,
    /// The frame was dropped by the skip-frame guard, the previous frame stays visible
    Skipped,
}

struct RendererState<D> {
    device: Option<D>,
    outputs: IndexMap<OutputId, Output>,
    cache: FramebufferCache,
    skip_frame: SkipFrameGuard,
}

impl<D> fmt::Debug for RendererState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererState")
            .field("initialized", &self.device.is_some())
            .field("outputs", &self.outputs)
            .field("cache", &self.cache)
            .field("skip_frame", &self.skip_frame)
            .finish()
    }
}

impl<D> RendererState<D> {
    fn pinned(&self) -> Vec<framebuffer::Handle> {
        self.outputs.values().filter_map(|o| o.binding.fb).collect()
    }
}

/// Renders sideband content onto overlay planes
///
/// Generic over the drm device `D` and the buffer allocator `M`.
pub struct SidebandRenderer<D: KmsDevice, M: BufferMapper> {
    state: Mutex<RendererState<D>>,
    mapper: M,
    config: SidebandConfig,
    clock: Box<dyn Clock>,
    debug_level: AtomicU32,
    span: tracing::Span,
}

impl<D: KmsDevice, M: BufferMapper + fmt::Debug> fmt::Debug for SidebandRenderer<D, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidebandRenderer")
            .field("state", &self.state)
            .field("mapper", &self.mapper)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("debug_level", &self.debug_level)
            .finish()
    }
}

impl<M: BufferMapper> SidebandRenderer<DrmDeviceFd, M> {
    /// Open the configured drm node and detect all outputs
    pub fn initialize(&self) -> Result<(), Error> {
        let path = &self.config.device_path;
        info!(parent: &self.span, "Opening drm device {}", path.display());
        let device = DrmDeviceFd::open(path).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to open drm device",
                dev: Some(path.clone()),
                source,
            })
        })?;
        self.initialize_with(device)
    }
}

impl<D: KmsDevice, M: BufferMapper> SidebandRenderer<D, M> {
    /// Create an uninitialized renderer
    pub fn new(config: SidebandConfig, mapper: M) -> Result<Self, Error> {
        let clock = Monotonic::new().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to read the monotonic clock",
                dev: None,
                source,
            })
        })?;
        Ok(Self::with_clock(config, mapper, clock))
    }

    /// Create an uninitialized renderer using a custom clock
    pub fn with_clock(config: SidebandConfig, mapper: M, clock: impl Clock + 'static) -> Self {
        let span = info_span!("sideband");
        let outputs = config
            .routing
            .outputs()
            .take(config.max_outputs)
            .map(|id| (id, Output::new(id)))
            .collect();
        let state = RendererState {
            device: None,
            outputs,
            cache: FramebufferCache::new(config.framebuffer_cache_capacity),
            skip_frame: SkipFrameGuard::new(config.skip_frame_window),
        };
        SidebandRenderer {
            state: Mutex::new(state),
            mapper,
            config,
            clock: Box::new(clock),
            debug_level: AtomicU32::new(0),
            span,
        }
    }

    /// Configuration of this renderer
    pub fn config(&self) -> &SidebandConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RendererState<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of an already opened device and detect all outputs.
    ///
    /// On failure the device is dropped again and the renderer stays uninitialized.
    pub fn initialize_with(&self, device: D) -> Result<(), Error> {
        let _guard = self.span.enter();
        let mut state = self.lock();
        if state.device.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        device
            .enable_atomic()
            .map_err(access_error(&device, "Error enabling atomic modesetting"))?;
        state.device = Some(device);

        if let Err(err) = self.detect_locked(&mut state, None) {
            error!("Initial detection failed: {}", err);
            state.device = None;
            for output in state.outputs.values_mut() {
                output.reset();
            }
            state.skip_frame.disarm();
            return Err(err);
        }

        info!("Sideband renderer initialized");
        Ok(())
    }

    /// Returns true if a device is open
    pub fn is_initialized(&self) -> bool {
        self.lock().device.is_some()
    }

    /// Unbind all planes, remove all framebuffers and close the device
    ///
    /// Does nothing if the renderer is not initialized.
    pub fn deinitialize(&self) {
        let _guard = self.span.enter();
        let mut state = self.lock();
        let Some(device) = state.device.take() else {
            return;
        };

        for output in state.outputs.values_mut() {
            if output.binding.fb.is_none() {
                continue;
            }
            if let Some(plane) = output.topology.plane.as_ref() {
                let result = build_clear_request(plane).and_then(|req| {
                    device
                        .atomic_commit(AtomicCommitFlags::empty(), &req)
                        .map_err(access_error(&device, "Error unbinding sideband plane"))
                });
                if let Err(err) = result {
                    warn!(output = ?output.id(), "Failed to unbind plane: {}", err);
                }
            }
        }

        state.cache.destroy_all(&device);
        for output in state.outputs.values_mut() {
            output.reset();
        }
        state.skip_frame.disarm();
        info!("Sideband renderer deinitialized");
    }

    /// Detect the topology of all outputs
    ///
    /// Outputs failing detection keep their previous state, the first error is returned
    /// after all outputs were processed.
    pub fn detect(&self) -> Result<(), Error> {
        let _guard = self.span.enter();
        let mut state = self.lock();
        self.detect_locked(&mut state, None)
    }

    /// Detect the topology of a single output
    pub fn detect_output(&self, id: OutputId) -> Result<(), Error> {
        let _guard = self.span.enter();
        let mut state = self.lock();
        if !state.outputs.contains_key(&id) {
            return Err(Error::UnknownOutput(id));
        }
        self.detect_locked(&mut state, Some(id))
    }

    fn detect_locked(&self, state: &mut RendererState<D>, only: Option<OutputId>) -> Result<(), Error> {
        let RendererState {
            device,
            outputs,
            skip_frame,
            ..
        } = state;
        let device = device.as_ref().ok_or(Error::NotInitialized)?;
        let probe = scanner::probe(device)?;

        let ids = outputs
            .keys()
            .copied()
            .filter(|id| only.map_or(true, |only| only == *id))
            .collect::<Vec<_>>();

        let mut result = Ok(());
        for id in ids {
            let _span = debug_span!("detect", output = ?id).entered();
            let claimed = outputs
                .values()
                .filter(|o| o.id() != id)
                .filter_map(|o| o.topology.plane.as_ref().map(|p| p.handle))
                .collect::<Vec<_>>();

            let topology = match scanner::scan_output(device, &probe, id, &self.config, &claimed) {
                Ok(topology) => topology,
                Err(err) => {
                    warn!("Detection failed, keeping previous state: {}", err);
                    if result.is_ok() {
                        result = Err(err);
                    }
                    continue;
                }
            };

            let Some(output) = outputs.get_mut(&id) else {
                continue;
            };
            let previous = &output.topology;
            if previous.status != OutputStatus::Undetected
                && (previous.status != topology.status || previous.mode() != topology.mode())
            {
                debug!(from = ?previous.status, to = ?topology.status, "display mode changed");
                skip_frame.arm(self.clock.now());
            }
            let same_target = previous.crtc() == topology.crtc()
                && previous.plane.as_ref().map(|p| p.handle) == topology.plane.as_ref().map(|p| p.handle);
            if !same_target && output.binding.fb.is_some() {
                debug!("plane target changed, dropping binding");
                output.binding = BindingState::default();
            }
            output.topology = topology;
        }
        result
    }

    /// Returns true if the cached topology no longer matches the device
    pub fn needs_redetect(&self) -> Result<bool, Error> {
        let state = self.lock();
        let device = state.device.as_ref().ok_or(Error::NotInitialized)?;
        scanner::needs_redetect(device, &state.outputs, &self.config)
    }

    /// Return an output to its undetected state
    ///
    /// The plane is not touched, the next detection pass picks it up again.
    pub fn reset_output(&self, id: OutputId) -> Result<(), Error> {
        let mut state = self.lock();
        let output = state.outputs.get_mut(&id).ok_or(Error::UnknownOutput(id))?;
        debug!(parent: &self.span, output = ?id, "resetting output");
        output.reset();
        Ok(())
    }

    /// Summary of all detected outputs
    pub fn display_infos(&self) -> Vec<DisplayInfo> {
        self.lock()
            .outputs
            .values()
            .filter(|o| o.topology.status != OutputStatus::Undetected)
            .map(|o| o.topology.display_info(o.id()))
            .collect()
    }

    /// Show `buffer` on the sideband plane of `output`.
    ///
    /// `width` and `height` give the size of the content within the buffer.
    /// Returns [`CommitOutcome::Skipped`] without touching the plane while the
    /// skip-frame guard is armed. On failure the previously committed frame stays visible.
    #[profiling::function]
    pub fn set_plane(
        &self,
        output: OutputId,
        width: i32,
        height: i32,
        buffer: BufferHandle,
        scaling_mode: ScalingMode,
        input_type: InputType,
    ) -> Result<CommitOutcome, Error> {
        let _guard = self.span.enter();
        if width <= 0 || height <= 0 {
            return Err(Error::InvalidDimensions { width, height });
        }

        let mut state = self.lock();
        let pinned = state.pinned();
        let RendererState {
            device,
            outputs,
            cache,
            skip_frame,
        } = &mut *state;
        let device = device.as_ref().ok_or(Error::NotInitialized)?;
        let out = outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
        if !out.is_ready() {
            return Err(match out.topology.status {
                OutputStatus::Connected => Error::NoSidebandPlane(output),
                _ => Error::OutputNotConnected(output),
            });
        }
        let (Some(plane), Some(info)) = (out.topology.plane.as_ref(), out.topology.active_mode_info()) else {
            return Err(Error::NoSidebandPlane(output));
        };
        let (Some(crtc), Some(mode)) = (info.crtc, info.mode.as_ref()) else {
            return Err(Error::OutputNotConnected(output));
        };

        let fb = cache.resolve(device, &self.mapper, buffer, input_type, &pinned)?;
        let (buffer_w, buffer_h) = cache.size(buffer).unwrap_or((width as u32, height as u32));

        if skip_frame.should_skip(self.clock.now()) {
            debug!(output = ?output, ?fb, "skip-frame guard armed, dropping frame");
            return Ok(CommitOutcome::Skipped);
        }

        let config = PlaneConfig::compute(
            Size::from((width, height)),
            Size::from((buffer_w as i32, buffer_h as i32)),
            Size::from((mode.size.0 as i32, mode.size.1 as i32)),
            self.config.overscan,
            scaling_mode,
        );
        let plane_state = PlaneState {
            crtc,
            fb,
            config,
            rotation: DrmRotation::from(info.orientation),
            fence: self.mapper.acquire_fence(buffer),
        };
        let req = build_plane_request(plane, &plane_state)?;
        self.dump_request(&plane_state, &req);

        device
            .atomic_commit(AtomicCommitFlags::empty(), &req)
            .map_err(access_error(device, "Error committing sideband plane"))?;

        out.binding = BindingState {
            fb: Some(fb),
            buffer: Some(buffer),
            src: Some(config.src),
            dst: Some(config.dst),
        };
        Ok(CommitOutcome::Committed)
    }

    /// Detach the framebuffer from the sideband plane of `output`
    ///
    /// The plane stays selected, so a later [`set_plane`](Self::set_plane) can rebind
    /// content without another detection pass. `width` and `height` describe the content
    /// being removed and must not be empty.
    pub fn clear_plane_content(&self, output: OutputId, width: i32, height: i32) -> Result<(), Error> {
        let _guard = self.span.enter();
        if width <= 0 || height <= 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        let mut state = self.lock();
        let RendererState { device, outputs, .. } = &mut *state;
        let device = device.as_ref().ok_or(Error::NotInitialized)?;
        let out = outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
        let plane = out.topology.plane.as_ref().ok_or(Error::NoSidebandPlane(output))?;

        trace!(?output, width, height, plane = ?plane.handle, "clearing sideband plane");
        let req = build_clear_request(plane)?;
        device
            .atomic_commit(AtomicCommitFlags::empty(), &req)
            .map_err(access_error(device, "Error clearing sideband plane"))?;

        out.binding = BindingState::default();
        Ok(())
    }

    /// Plane currently selected for sideband content
    pub fn sideband_plane_id(&self) -> Option<plane::Handle> {
        self.lock()
            .outputs
            .values()
            .find_map(|o| o.topology.plane.as_ref().map(|p| p.handle))
    }

    /// Change the verbosity of transaction dumps
    ///
    /// At level 1 and above every submitted transaction is logged at debug level,
    /// otherwise only at trace level.
    pub fn set_debug_level(&self, level: u32) {
        self.debug_level.store(level, Ordering::Relaxed);
    }

    /// Current verbosity of transaction dumps
    pub fn debug_level(&self) -> u32 {
        self.debug_level.load(Ordering::Relaxed)
    }

    fn dump_request(&self, plane_state: &PlaneState, req: &AtomicRequest) {
        if self.debug_level() >= 1 {
            debug!(?plane_state, "submitting {} properties: {:?}", req.len(), req);
        } else {
            trace!(?plane_state, "submitting {} properties: {:?}", req.len(), req);
        }
    }

    /// Arm the skip-frame guard, dropping frames until the configured window elapsed
    pub fn arm_skip_frame(&self) {
        self.lock().skip_frame.arm(self.clock.now());
    }

    /// Forget a buffer released by the allocator and remove its framebuffer.
    ///
    /// If the buffer is still shown, its plane is cleared first.
    /// Returns whether a framebuffer was registered for the buffer.
    pub fn release_buffer(&self, buffer: BufferHandle) -> Result<bool, Error> {
        let _guard = self.span.enter();
        let mut state = self.lock();
        let RendererState {
            device, outputs, cache, ..
        } = &mut *state;
        let device = device.as_ref().ok_or(Error::NotInitialized)?;

        for out in outputs.values_mut().filter(|o| o.binding.buffer == Some(buffer)) {
            if let Some(plane) = out.topology.plane.as_ref() {
                let req = build_clear_request(plane)?;
                device
                    .atomic_commit(AtomicCommitFlags::empty(), &req)
                    .map_err(access_error(device, "Error clearing sideband plane"))?;
            }
            debug!(output = ?out.id(), ?buffer, "released buffer was bound, plane cleared");
            out.binding = BindingState::default();
        }

        Ok(cache.release(device, buffer).is_some())
    }

    /// Size in bytes of the allocation backing `buffer`
    pub fn framebuffer_length(&self, buffer: BufferHandle) -> Result<usize, Error> {
        if let Some(len) = self.lock().cache.byte_len(buffer) {
            return Ok(len);
        }
        Ok(self.mapper.describe(buffer)?.byte_len)
    }

    /// Number of framebuffers currently cached
    pub fn cached_framebuffers(&self) -> usize {
        self.lock().cache.len()
    }
}

impl<D: KmsDevice, M: BufferMapper> Drop for SidebandRenderer<D, M> {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    use drm::control::connector::State;
    use drm_fourcc::DrmFourcc;

    use super::{CommitOutcome, SidebandRenderer};
    use crate::{
        allocator::BufferHandle,
        commit::ScalingMode,
        config::SidebandConfig,
        device::test::{FakeDevice, FakeEvent, FakeMapper},
        error::Error,
        format::{HalFormat, InputType},
        output::OutputId,
        utils::ManualClock,
    };

    type Renderer = SidebandRenderer<FakeDevice, Arc<FakeMapper>>;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn setup(device: &FakeDevice, config: SidebandConfig) -> (Renderer, Arc<FakeMapper>, ManualClock) {
        init_logging();
        let mapper = Arc::new(FakeMapper::new());
        mapper.insert_nv12(BufferHandle(1), 1920, 1080);
        mapper.insert_nv12(BufferHandle(2), 1920, 1080);
        mapper.insert_nv12(BufferHandle(3), 1280, 720);
        let clock = ManualClock::new(Duration::from_secs(100));
        let renderer = SidebandRenderer::with_clock(config, mapper.clone(), clock.clone());
        renderer.initialize_with(device.clone()).unwrap();
        (renderer, mapper, clock)
    }

    fn set(renderer: &Renderer, output: OutputId, buffer: usize) -> Result<CommitOutcome, Error> {
        renderer.set_plane(
            output,
            1920,
            1080,
            BufferHandle(buffer),
            ScalingMode::Fit,
            InputType::Decoder,
        )
    }

    #[test]
    fn commits_frame_to_sideband_plane() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());

        assert_eq!(renderer.sideband_plane_id(), Some(FakeDevice::plane_handle(41)));
        renderer.set_debug_level(1);
        assert_eq!(renderer.debug_level(), 1);
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Committed);

        assert_eq!(device.commit_count(), 1);
        let fb = device.framebuffers()[0];
        assert_eq!(device.plane_property(41, "FB_ID"), Some(u32::from(fb) as u64));
        assert_eq!(device.plane_property(41, "CRTC_ID"), Some(30));
        assert_eq!(device.plane_property(41, "CRTC_W"), Some(1920));
    }

    #[test]
    fn zero_dimensions_do_not_commit() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());

        for (w, h) in [(0, 1080), (1920, 0), (-1, 1080)] {
            let err = renderer
                .set_plane(
                    OutputId::PRIMARY,
                    w,
                    h,
                    BufferHandle(1),
                    ScalingMode::Fit,
                    InputType::Decoder,
                )
                .unwrap_err();
            assert!(err.is_invalid_argument());
        }
        assert_eq!(device.commit_count(), 0);
        assert_eq!(device.import_count(), 0);
    }

    #[test]
    fn unknown_or_disconnected_outputs_fail() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());

        assert!(matches!(set(&renderer, OutputId(7), 1), Err(Error::UnknownOutput(OutputId(7)))));
        assert!(matches!(
            set(&renderer, OutputId::EXTERNAL, 1),
            Err(Error::OutputNotConnected(OutputId::EXTERNAL))
        ));
        assert_eq!(device.commit_count(), 0);
    }

    #[test]
    fn skip_frame_debounces_commits() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, clock) = setup(&device, SidebandConfig::default());

        renderer.arm_skip_frame();
        let first = set(&renderer, OutputId::PRIMARY, 1).unwrap();
        clock.advance(Duration::from_millis(500));
        let second = set(&renderer, OutputId::PRIMARY, 2).unwrap();
        assert!(device.commit_count() <= 1);
        assert_eq!((first, second), (CommitOutcome::Skipped, CommitOutcome::Skipped));

        clock.advance(Duration::from_secs(2));
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Committed);
        assert_eq!(device.commit_count(), 1);
    }

    #[test]
    fn mode_change_arms_skip_frame() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, clock) = setup(&device, SidebandConfig::default());
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Committed);

        device.set_crtc_mode(30, Some((1280, 720)));
        renderer.detect().unwrap();
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Skipped);

        clock.advance(Duration::from_secs(3));
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Committed);
        assert_eq!(device.plane_property(41, "CRTC_W"), Some(1280));
    }

    #[test]
    fn clear_keeps_plane() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());
        set(&renderer, OutputId::PRIMARY, 1).unwrap();

        let plane = renderer.sideband_plane_id();
        renderer.clear_plane_content(OutputId::PRIMARY, 1920, 1080).unwrap();
        assert_eq!(renderer.sideband_plane_id(), plane);
        assert_eq!(device.plane_property(41, "FB_ID"), Some(0));

        // rebinding works without detection
        assert_eq!(set(&renderer, OutputId::PRIMARY, 2).unwrap(), CommitOutcome::Committed);
    }

    #[test]
    fn clear_rejects_empty_content() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());
        set(&renderer, OutputId::PRIMARY, 1).unwrap();

        for (w, h) in [(0, 1080), (1920, -1)] {
            let err = renderer.clear_plane_content(OutputId::PRIMARY, w, h).unwrap_err();
            assert!(err.is_invalid_argument());
        }
        assert_eq!(device.commit_count(), 1);
        assert_ne!(device.plane_property(41, "FB_ID"), Some(0));
    }

    #[test]
    fn small_cache_keeps_committed_framebuffer() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default().with_framebuffer_cache_capacity(1));

        for buffer in [1, 2, 3, 1] {
            assert_eq!(set(&renderer, OutputId::PRIMARY, buffer).unwrap(), CommitOutcome::Committed);
            let shown = device.plane_property(41, "FB_ID").unwrap();
            assert!(device
                .framebuffers()
                .iter()
                .any(|fb| u32::from(*fb) as u64 == shown));
        }
        // the bound framebuffer and the one replacing it at most
        assert!(device.framebuffers().len() <= 2);
    }

    #[test]
    fn acquire_fence_reaches_plane() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, mapper, _) = setup(&device, SidebandConfig::default());

        mapper.set_fence(BufferHandle(1), Some(77));
        set(&renderer, OutputId::PRIMARY, 1).unwrap();
        assert_eq!(device.plane_property(41, "IN_FENCE_FD"), Some(77));

        set(&renderer, OutputId::PRIMARY, 2).unwrap();
        assert_eq!(device.plane_property(41, "IN_FENCE_FD"), Some(-1i64 as u64));
    }

    #[test]
    fn hdmi_input_registers_nv16() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, mapper, _) = setup(&device, SidebandConfig::default());
        let mut layout = mapper.layout(BufferHandle(3)).unwrap();
        layout.format = HalFormat::IMPLEMENTATION_DEFINED;
        mapper.insert(BufferHandle(5), layout);

        let outcome = renderer
            .set_plane(
                OutputId::PRIMARY,
                1280,
                720,
                BufferHandle(5),
                ScalingMode::Stretch,
                InputType::HdmiIn,
            )
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let fb = device.framebuffers()[0];
        assert_eq!(device.framebuffer_format(fb), Some(DrmFourcc::Nv16.into()));
        assert_eq!(device.plane_property(41, "FB_ID"), Some(u32::from(fb) as u64));
    }

    #[test]
    fn repeated_detection_is_stable() {
        let device = FakeDevice::dual_output();
        let (renderer, _, _) = setup(&device, SidebandConfig::default());

        let first = renderer.display_infos();
        renderer.detect().unwrap();
        let second = renderer.display_infos();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|info| info.connected));
        assert_eq!(first[1].connector_name, "DP-1");
        assert!(!renderer.needs_redetect().unwrap());

        device.set_connector_state(11, State::Disconnected);
        assert!(renderer.needs_redetect().unwrap());
        renderer.detect_output(OutputId::EXTERNAL).unwrap();
        assert!(!renderer.display_infos()[1].connected);
    }

    #[test]
    fn failed_commit_keeps_binding() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());
        set(&renderer, OutputId::PRIMARY, 1).unwrap();
        let shown = device.plane_property(41, "FB_ID");

        device.fail_commit(true);
        assert!(matches!(set(&renderer, OutputId::PRIMARY, 2), Err(Error::Access(_))));
        assert_eq!(device.plane_property(41, "FB_ID"), shown);

        device.fail_commit(false);
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Committed);
        assert_eq!(device.commit_count(), 2);
    }

    #[test]
    fn failed_initialization_leaves_no_state() {
        init_logging();
        let device = FakeDevice::single_output(1920, 1080);
        device.fail_resources(true);
        let renderer: Renderer = SidebandRenderer::with_clock(
            SidebandConfig::default(),
            Arc::new(FakeMapper::new()),
            ManualClock::default(),
        );

        assert!(renderer.initialize_with(device.clone()).is_err());
        assert!(!renderer.is_initialized());
        assert!(renderer.display_infos().is_empty());
        assert_eq!(renderer.sideband_plane_id(), None);
        assert!(matches!(renderer.detect(), Err(Error::NotInitialized)));

        device.fail_resources(false);
        renderer.initialize_with(device.clone()).unwrap();
        assert!(matches!(
            renderer.initialize_with(device),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn failed_detection_keeps_topology() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());
        let before = renderer.display_infos();

        device.fail_resources(true);
        assert!(renderer.detect().is_err());
        assert_eq!(renderer.display_infos(), before);

        renderer.reset_output(OutputId::PRIMARY).unwrap();
        assert!(matches!(
            set(&renderer, OutputId::PRIMARY, 1),
            Err(Error::OutputNotConnected(OutputId::PRIMARY))
        ));
    }

    #[test]
    fn release_and_deinitialize_remove_framebuffers() {
        let device = FakeDevice::single_output(1920, 1080);
        let (renderer, _, _) = setup(&device, SidebandConfig::default());
        set(&renderer, OutputId::PRIMARY, 1).unwrap();
        set(&renderer, OutputId::PRIMARY, 2).unwrap();
        assert_eq!(device.framebuffers().len(), 2);
        assert_eq!(renderer.framebuffer_length(BufferHandle(3)).unwrap(), 1280 * 720 * 3 / 2);

        assert!(renderer.release_buffer(BufferHandle(1)).unwrap());
        assert!(!renderer.release_buffer(BufferHandle(1)).unwrap());
        assert_eq!(device.framebuffers().len(), 1);

        // the released buffer was not shown, the plane still is
        assert_ne!(device.plane_property(41, "FB_ID"), Some(0));

        renderer.deinitialize();
        assert!(device.framebuffers().is_empty());
        assert_eq!(device.plane_property(41, "FB_ID"), Some(0));
        assert!(!renderer.is_initialized());
    }

    #[test]
    fn commit_waits_for_detection() {
        let device = FakeDevice::single_output(1920, 1080);
        let config = SidebandConfig::default().with_skip_frame_window(Duration::ZERO);
        let (renderer, _, _) = setup(&device, config);
        let renderer = Arc::new(renderer);

        device.set_crtc_mode(30, Some((1280, 720)));
        device.set_resources_delay(Some(Duration::from_millis(200)));
        let start = device.events().len();

        let barrier = Arc::new(Barrier::new(2));
        let detector = {
            let renderer = renderer.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                renderer.detect().unwrap();
            })
        };

        barrier.wait();
        // wait until detection holds the lock
        while !device.events()[start..].contains(&FakeEvent::ResourcesStarted) {
            thread::yield_now();
        }
        assert_eq!(set(&renderer, OutputId::PRIMARY, 1).unwrap(), CommitOutcome::Committed);
        detector.join().unwrap();

        let events = device.events()[start..].to_vec();
        let finished = events.iter().position(|e| *e == FakeEvent::ResourcesFinished).unwrap();
        let commit = events.iter().position(|e| *e == FakeEvent::Commit).unwrap();
        assert!(commit > finished);
        // the commit was built from the new topology
        assert_eq!(device.plane_property(41, "CRTC_W"), Some(1280));
    }
}
