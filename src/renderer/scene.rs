//! Per-frame orchestration: probe scheduling, alpha ordering, then the
//! geometry, light, material, and post-process stages, once per output
//! buffer set.

use glam::{Mat4, Vec3};
use log::info;

use crate::renderer::alpha::AlphaSorter;
use crate::renderer::camera::CameraState;
use crate::renderer::device::{ClearMask, GraphicsDevice};
use crate::renderer::framebuffers::FrameBufferSet;
use crate::renderer::lights::LightRecord;
use crate::renderer::passes::lighting::{default_strategy, LightPassInputs, LightingStrategy};
use crate::renderer::passes::{GeometryPass, MaterialPass};
use crate::renderer::postprocess::{PostHandler, PostProcess};
use crate::renderer::probes::{EnvironmentProbe, ProbeCadence, ProbeHandle};
use crate::renderer::submissions::{
    Drawable, PassTag, RawDrawCallback, SubmissionHandle, SubmissionRegistry,
};
use crate::renderer::targets::{GenArena, TargetArena};
use crate::settings::RenderSettings;

#[derive(Clone, Copy, Debug, Default)]
pub struct RendererStats {
    pub geometry_opaque_draws: u32,
    pub geometry_alpha_draws: u32,
    pub material_opaque_draws: u32,
    pub material_alpha_draws: u32,
    pub lights_accumulated: u32,
    pub probes_refreshed: u32,
    pub post_handlers_invoked: u32,
}

impl RendererStats {
    pub fn total_draw_calls(&self) -> u32 {
        self.geometry_opaque_draws
            + self.geometry_alpha_draws
            + self.material_opaque_draws
            + self.material_alpha_draws
    }
}

pub struct SceneRenderer<D: GraphicsDevice> {
    device: D,
    arena: TargetArena,
    settings: RenderSettings,
    buffers: FrameBufferSet,
    sorter: AlphaSorter,
    registry: SubmissionRegistry,
    probes: GenArena<EnvironmentProbe>,
    post: PostProcess,
    lighting: Box<dyn LightingStrategy>,
    raw_draws: Vec<RawDrawCallback>,
    particles: Vec<RawDrawCallback>,
    camera: CameraState,
    window: (u32, u32),
    enabled: bool,
    stats: RendererStats,
}

impl<D: GraphicsDevice> SceneRenderer<D> {
    pub fn new(mut device: D, settings: RenderSettings) -> Self {
        let settings = settings.validate();
        let window = (settings.resolution.width, settings.resolution.height);
        let mut arena = TargetArena::default();
        let buffers = FrameBufferSet::provision(&mut device, &mut arena, window, &settings, true);
        Self {
            device,
            arena,
            settings,
            buffers,
            sorter: AlphaSorter::default(),
            registry: SubmissionRegistry::default(),
            probes: GenArena::default(),
            post: PostProcess::default(),
            lighting: default_strategy(),
            raw_draws: Vec::new(),
            particles: Vec::new(),
            camera: CameraState::default(),
            window,
            enabled: true,
            stats: RendererStats::default(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn arena(&self) -> &TargetArena {
        &self.arena
    }

    pub fn buffers(&self) -> &FrameBufferSet {
        &self.buffers
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn camera(&self) -> CameraState {
        self.camera
    }

    pub fn set_camera(&mut self, camera: CameraState) {
        self.camera = camera;
    }

    /// Skip (or un-skip) whole frames; checked once at the top of
    /// `draw()`.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn register_opaque(&mut self, drawable: Box<dyn Drawable>) -> SubmissionHandle {
        self.registry.register_opaque(drawable)
    }

    pub fn register_alpha(&mut self, drawable: Box<dyn Drawable>) -> SubmissionHandle {
        self.registry.register_alpha(drawable)
    }

    pub fn unregister_opaque(&mut self, handle: SubmissionHandle) -> bool {
        self.registry.unregister_opaque(handle)
    }

    pub fn unregister_alpha(&mut self, handle: SubmissionHandle) -> bool {
        self.registry.unregister_alpha(handle)
    }

    pub fn add_raw_draw(&mut self, callback: RawDrawCallback) {
        self.raw_draws.push(callback);
    }

    pub fn add_particle_system(&mut self, callback: RawDrawCallback) {
        self.particles.push(callback);
    }

    pub fn add_post_handler(&mut self, handler: PostHandler) {
        self.post.add_handler(handler);
    }

    pub fn add_probe(
        &mut self,
        size: u32,
        position: Vec3,
        rotation: Mat4,
        cadence: ProbeCadence,
        capture_alpha: bool,
    ) -> ProbeHandle {
        let probe = EnvironmentProbe::new(
            &mut self.device,
            &mut self.arena,
            &self.settings,
            size,
            position,
            rotation,
            cadence,
            capture_alpha,
        );
        self.probes.insert(probe)
    }

    pub fn probe_buffers(&self, handle: ProbeHandle) -> Option<&FrameBufferSet> {
        self.probes.get(handle).map(|probe| &probe.buffers)
    }

    pub fn remove_probe(&mut self, handle: ProbeHandle) {
        if let Some(probe) = self.probes.remove(handle) {
            probe.destroy(&mut self.device, &mut self.arena);
        }
    }

    /// Tear down and re-provision the frame buffer set for a new display
    /// size. Safe to call with the current size; the old set is fully
    /// released either way.
    pub fn handle_resize(&mut self, width: u32, height: u32) {
        info!("Display resized to {}x{}; reprovisioning buffers", width, height);
        self.window = (width, height);
        self.buffers.teardown(&mut self.device, &mut self.arena);
        self.buffers =
            FrameBufferSet::provision(&mut self.device, &mut self.arena, self.window, &self.settings, true);
    }

    pub fn last_frame_stats(&self) -> RendererStats {
        self.stats
    }

    pub fn sorter(&self) -> &AlphaSorter {
        &self.sorter
    }

    /// Render one frame. All pass-local failures are absorbed and logged;
    /// this never panics or propagates errors in release builds.
    pub fn draw(&mut self, lights: &[LightRecord]) {
        if !self.enabled {
            if self.settings.clear_when_disabled {
                for fb in self.buffers.buffers() {
                    if FrameBufferSet::bind(&mut self.device, &self.arena, fb) {
                        self.device
                            .clear(ClearMask::COLOR | ClearMask::DEPTH | ClearMask::STENCIL);
                        self.device.stop_draw();
                    }
                }
            }
            return;
        }

        self.stats = RendererStats::default();

        // Environment probes render first, from their own viewpoints into
        // their own buffer sets. Camera state restoration must be exact.
        for handle in self.probes.handles() {
            let Some(probe) = self.probes.get_mut(handle) else {
                continue;
            };
            if !probe.cadence.should_render() {
                continue;
            }

            let saved = self.camera;
            let mut probe_camera = saved;
            probe_camera.position = probe.position;
            probe_camera.rotation = probe.rotation;
            if let Some(res) = probe.buffers.resolutions {
                probe_camera.viewport = res.render;
            }
            self.camera = probe_camera;

            rebuild_sorter(&mut self.sorter, &self.registry, &self.camera);
            GeometryPass::render(
                &mut self.device,
                &self.arena,
                &probe.buffers,
                &mut self.registry,
                &self.sorter,
                &mut self.raw_draws,
                PassTag::PROBE,
            );
            run_lighting(
                &mut self.device,
                &self.arena,
                self.lighting.as_mut(),
                &probe.buffers,
                lights,
                &self.camera,
            );
            MaterialPass::render(
                &mut self.device,
                &self.arena,
                &probe.buffers,
                &mut self.registry,
                &self.sorter,
                &mut self.particles,
                PassTag::PROBE,
            );

            debug_assert_eq!(
                self.camera, probe_camera,
                "probe passes must not disturb the camera"
            );
            self.camera = saved;
            self.stats.probes_refreshed += 1;
        }

        if let Some(res) = self.buffers.resolutions {
            self.camera.viewport = res.render;
        }

        rebuild_sorter(&mut self.sorter, &self.registry, &self.camera);

        let (geometry_opaque, geometry_alpha) = GeometryPass::render(
            &mut self.device,
            &self.arena,
            &self.buffers,
            &mut self.registry,
            &self.sorter,
            &mut self.raw_draws,
            PassTag::empty(),
        );
        self.stats.geometry_opaque_draws = geometry_opaque;
        self.stats.geometry_alpha_draws = geometry_alpha;

        self.stats.lights_accumulated = run_lighting(
            &mut self.device,
            &self.arena,
            self.lighting.as_mut(),
            &self.buffers,
            lights,
            &self.camera,
        );

        let (material_opaque, material_alpha) = MaterialPass::render(
            &mut self.device,
            &self.arena,
            &self.buffers,
            &mut self.registry,
            &self.sorter,
            &mut self.particles,
            PassTag::empty(),
        );
        self.stats.material_opaque_draws = material_opaque;
        self.stats.material_alpha_draws = material_alpha;

        self.stats.post_handlers_invoked =
            self.post.execute(&mut self.device, &self.arena, &self.buffers);
    }
}

fn rebuild_sorter(sorter: &mut AlphaSorter, registry: &SubmissionRegistry, camera: &CameraState) {
    sorter.begin_frame();
    for (handle, drawable) in registry.alpha_iter() {
        for sub_object in 0..drawable.sub_object_count() {
            if let Some(bounds) = drawable.alpha_bounds(sub_object) {
                sorter.push(handle, sub_object, bounds);
            }
        }
    }
    sorter.sort_and_assign(camera);
}

/// Run the lighting back-end over every geometry/light buffer pair the
/// set carries.
fn run_lighting(
    device: &mut dyn GraphicsDevice,
    arena: &TargetArena,
    lighting: &mut dyn LightingStrategy,
    set: &FrameBufferSet,
    lights: &[LightRecord],
    camera: &CameraState,
) -> u32 {
    let mut accumulated = 0u32;
    for (geometry, light) in [
        (&set.geometry, &set.light),
        (&set.alpha_geometry, &set.alpha_light),
    ] {
        if let (Some(geometry), Some(light)) = (geometry, light) {
            accumulated += lighting.accumulate(
                device,
                &LightPassInputs {
                    arena,
                    geometry,
                    light,
                    lights,
                    camera,
                },
            );
        }
    }
    accumulated
}
