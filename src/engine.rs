use {
    crate::{
        backend::{GpuDevice, ProgramError, SinkId},
        color::ColorManager,
        event::{Effect, Event, OutputKey, SurfaceKey},
        output::{Border, BorderSide, OutputState, RepaintResources},
        paint::{FanDebug, PaintNode, ViewState},
        shader::{ProgramCache, ProgramCacheConfig},
        surface::SurfaceState,
    },
    slab::Slab,
    smallvec::SmallVec,
    std::{sync::Arc, time::Duration},
};

/// Injected time source; all MRU timestamps come from here so tests
/// are deterministic.
pub trait FrameClock: std::fmt::Debug + Send + Sync {
    fn now(&self) -> Duration;
}

/// The process monotonic clock.
#[derive(Debug)]
pub struct MonotonicClock {
    start: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl FrameClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: parking_lot::Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock::default())
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl FrameClock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Engine construction knobs.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Per-axis 3D LUT dimension for color transforms.
    pub lut_len: u32,

    pub program_cache: ProgramCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            lut_len: 33,
            program_cache: ProgramCacheConfig::default(),
        }
    }
}

/// The composition core.
///
/// One engine owns one GPU device, the color manager, the program
/// cache, and every surface and output. The event loop drives it
/// through [`Engine::handle_event`]; there are no callbacks and no
/// hidden statics.
#[derive(Debug)]
pub struct Engine<D: GpuDevice> {
    device: D,
    clock: Arc<dyn FrameClock>,
    color: ColorManager,
    programs: ProgramCache,

    surfaces: Slab<SurfaceState>,
    outputs: Slab<OutputState>,

    fan_debug: FanDebug,
    green_tint: bool,
}

impl<D: GpuDevice> Engine<D> {
    /// Builds the engine and the fallback shader.
    ///
    /// Failing to build the fallback program means the GPU stack is
    /// unusable; initialization aborts.
    pub fn new(
        mut device: D,
        clock: Arc<dyn FrameClock>,
        config: EngineConfig,
    ) -> Result<Self, ProgramError> {
        let programs = ProgramCache::new(&mut device, config.program_cache)?;

        Ok(Engine {
            device,
            clock,
            color: ColorManager::new(config.lut_len),
            programs,
            surfaces: Slab::new(),
            outputs: Slab::new(),
            fan_debug: FanDebug::default(),
            green_tint: false,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn color(&self) -> &ColorManager {
        &self.color
    }

    pub fn shader_cache_len(&self) -> usize {
        self.programs.len()
    }

    pub fn create_surface(&mut self) -> SurfaceKey {
        SurfaceKey(self.surfaces.insert(SurfaceState::new()))
    }

    pub fn surface(&self, key: SurfaceKey) -> Option<&SurfaceState> {
        self.surfaces.get(key.0)
    }

    pub fn surface_mut(&mut self, key: SurfaceKey) -> Option<&mut SurfaceState> {
        self.surfaces.get_mut(key.0)
    }

    /// Registers an output drawing to `sink`.
    pub fn create_output(&mut self, sink: SinkId) -> OutputKey {
        let output = OutputState::new(&self.device, sink);
        OutputKey(self.outputs.insert(output))
    }

    pub fn output(&self, key: OutputKey) -> Option<&OutputState> {
        self.outputs.get(key.0)
    }

    pub fn output_mut(&mut self, key: OutputKey) -> Option<&mut OutputState> {
        self.outputs.get_mut(key.0)
    }

    /// Places `surface` on `output`, replacing any previous view of
    /// the same surface there.
    pub fn set_view(&mut self, output: OutputKey, surface: SurfaceKey, view: ViewState, z: i32) {
        let Some(output) = self.outputs.get_mut(output.0) else {
            return;
        };

        match output.nodes.iter_mut().find(|n| n.surface == surface) {
            Some(node) => {
                node.view = view;
                node.z = z;
            }
            None => output.nodes.push(PaintNode::new(surface, view, z)),
        }
    }

    pub fn remove_view(&mut self, output: OutputKey, surface: SurfaceKey) {
        let Some(output) = self.outputs.get_mut(output.0) else {
            return;
        };

        let mut removed: Vec<PaintNode> = Vec::new();
        let mut kept: Vec<PaintNode> = Vec::new();
        for node in output.nodes.drain(..) {
            if node.surface == surface {
                removed.push(node);
            } else {
                kept.push(node);
            }
        }
        output.nodes = kept;

        for mut node in removed {
            node.invalidate_color(&mut self.device);
        }
    }

    pub fn set_border(&mut self, output: OutputKey, side: BorderSide, border: Option<Border>) {
        let Engine {
            device, outputs, ..
        } = self;
        if let Some(output) = outputs.get_mut(output.0) {
            output.set_border(device, side, border);
        }
    }

    /// RGBA8 snapshot of the output's content area.
    pub fn capture_output(&mut self, key: OutputKey) -> Option<Vec<u8>> {
        let Engine {
            device, outputs, ..
        } = self;
        outputs.get(key.0).map(|output| output.capture(device))
    }

    /// Emits timestamps for any signalled timeline points.
    pub fn poll_timelines(&mut self) -> SmallVec<[Effect; 4]> {
        let mut effects = SmallVec::new();
        for (index, output) in self.outputs.iter_mut() {
            output.poll_timeline(OutputKey(index), &self.device, &mut effects);
        }
        effects
    }

    /// Feeds one event through the core.
    ///
    /// Per-frame and per-surface failures are contained here; they
    /// produce effects and log lines, never corrupted cache state.
    pub fn handle_event(&mut self, event: Event) -> SmallVec<[Effect; 4]> {
        let mut effects: SmallVec<[Effect; 4]> = SmallVec::new();

        match event {
            Event::BufferAttached { surface, spec } => {
                let Engine {
                    device, surfaces, ..
                } = self;
                if let Some(state) = surfaces.get_mut(surface.0) {
                    if let Err(err) = state.attach(device, spec) {
                        tracing::error!(%err, ?surface, "buffer attach failed");
                    }
                }
            }

            Event::SurfaceDamaged { surface, region } => {
                if let Some(state) = self.surfaces.get_mut(surface.0) {
                    state.damage(&region);
                }
            }

            Event::SurfaceOpaqueRegion { surface, region } => {
                if let Some(state) = self.surfaces.get_mut(surface.0) {
                    state.opaque_region = region;
                }
            }

            Event::SurfaceProfileAttached { surface, profile } => {
                if let Some(state) = self.surfaces.get_mut(surface.0) {
                    state.profile = profile;
                }
                self.invalidate_surface_nodes(surface);
            }

            Event::AcquireFence { surface, fence } => {
                if let Some(state) = self.surfaces.get_mut(surface.0) {
                    state.acquire_fence = Some(fence);
                }
            }

            Event::SurfaceDestroyed { surface } => {
                for (_, output) in self.outputs.iter_mut() {
                    let mut kept = Vec::new();
                    for mut node in output.nodes.drain(..) {
                        if node.surface == surface {
                            node.invalidate_color(&mut self.device);
                        } else {
                            kept.push(node);
                        }
                    }
                    output.nodes = kept;
                }

                if self.surfaces.contains(surface.0) {
                    let mut state = self.surfaces.remove(surface.0);
                    state.destroy(&mut self.device);
                }
            }

            Event::OutputProfileAttached { output, profile } => {
                if let Some(state) = self.outputs.get_mut(output.0) {
                    state.set_profile(profile);
                }
            }

            Event::OutputEotfChanged { output, mode } => {
                if let Some(state) = self.outputs.get_mut(output.0) {
                    state.set_eotf(mode);
                }
            }

            Event::OutputRemoved { output } => {
                if self.outputs.contains(output.0) {
                    let mut state = self.outputs.remove(output.0);
                    state.destroy(&mut self.device);
                }
            }

            Event::FrameRequested { output, damage } => {
                let Engine {
                    device,
                    clock,
                    color,
                    programs,
                    surfaces,
                    outputs,
                    fan_debug,
                    green_tint,
                    ..
                } = self;

                if let Some(state) = outputs.get_mut(output.0) {
                    let mut res = RepaintResources {
                        device,
                        programs,
                        color,
                        surfaces,
                        now: clock.now(),
                        fan_debug,
                        green_tint: *green_tint,
                    };

                    if let Err(err) = state.repaint(output, &mut res, &damage, &mut effects) {
                        tracing::warn!(%err, ?output, "frame skipped");
                        effects.push(Effect::FrameSkipped { output });
                    }
                }
            }

            Event::FanDebug { enabled } => {
                self.fan_debug.enabled = enabled;
            }

            Event::GreenTint { enabled } => {
                self.green_tint = enabled;
            }
        }

        effects
    }

    /// Invalidates cached color state of every node showing `surface`.
    fn invalidate_surface_nodes(&mut self, surface: SurfaceKey) {
        let Engine {
            device, outputs, ..
        } = self;
        for (_, output) in outputs.iter_mut() {
            for node in &mut output.nodes {
                if node.surface == surface {
                    node.invalidate_color(device);
                }
            }
        }
    }
}
