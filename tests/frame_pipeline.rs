mod common;

use std::sync::{Arc, Mutex};

use common::{Call, RecordingDevice};
use glam::Vec3;
use inferred_renderer::renderer::alpha::ExtendedBounds;
use inferred_renderer::renderer::device::{
    BlendMode, ClearMask, CullMode, DepthFunc, GraphicsDevice, StencilMode, TargetId,
};
use inferred_renderer::renderer::lights::LightRecord;
use inferred_renderer::renderer::probes::ProbeCadence;
use inferred_renderer::renderer::scene::SceneRenderer;
use inferred_renderer::renderer::submissions::{Drawable, PassTag};
use inferred_renderer::settings::{AntiAliasSetting, RenderSettings};

type DrawLog = Arc<Mutex<Vec<(PassTag, u32, u8)>>>;

struct TestDrawable {
    log: DrawLog,
    sub_objects: u32,
    bounds: Option<ExtendedBounds>,
}

impl TestDrawable {
    fn opaque(log: DrawLog) -> Box<Self> {
        Box::new(Self {
            log,
            sub_objects: 1,
            bounds: None,
        })
    }

    fn alpha(log: DrawLog, position: Vec3) -> Box<Self> {
        let mut bounds = ExtendedBounds::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        bounds.position = position;
        Box::new(Self {
            log,
            sub_objects: 1,
            bounds: Some(bounds),
        })
    }
}

impl Drawable for TestDrawable {
    fn draw(&mut self, _device: &mut dyn GraphicsDevice, pass: PassTag, sub_object: u32, mask: u8) {
        self.log.lock().unwrap().push((pass, sub_object, mask));
    }

    fn sub_object_count(&self) -> u32 {
        self.sub_objects
    }

    fn alpha_bounds(&self, _sub_object: u32) -> Option<ExtendedBounds> {
        self.bounds
    }
}

fn renderer_with(settings: RenderSettings) -> SceneRenderer<RecordingDevice> {
    SceneRenderer::new(RecordingDevice::new(), settings)
}

fn start_draw_sequence(device: &RecordingDevice) -> Vec<TargetId> {
    device
        .calls
        .iter()
        .filter_map(|c| match c {
            Call::StartDraw(id) => Some(*id),
            _ => None,
        })
        .collect()
}

#[cfg(not(feature = "tiled-lights"))]
#[test]
fn frame_runs_passes_in_pipeline_order() {
    let mut renderer = renderer_with(RenderSettings::default());
    let log: DrawLog = Arc::default();
    renderer.register_opaque(TestDrawable::opaque(log.clone()));
    renderer.register_alpha(TestDrawable::alpha(log.clone(), Vec3::new(0.0, 0.0, -5.0)));
    renderer.device_mut().reset_calls();

    let lights = [LightRecord::directional(Vec3::NEG_Y, Vec3::ONE)];
    renderer.draw(&lights);

    // Allocation order: geometry, alpha geometry, light, alpha light,
    // scene, fxaa resolve.
    let ids = renderer.buffers().target_ids(renderer.arena());
    assert_eq!(ids.len(), 6);
    let expected = vec![
        ids[0], // geometry pass
        ids[1], // alpha geometry pass
        ids[2], // light accumulation
        ids[3], // alpha light accumulation
        ids[4], // material pass into scene
        ids[5], // fxaa luma pre-pass
        ids[4], // fxaa filter back into scene
    ];
    assert_eq!(start_draw_sequence(renderer.device()), expected);

    let log = log.lock().unwrap();
    assert!(log.contains(&(PassTag::GEOMETRY, 0, 0)));
    assert!(log.contains(&(PassTag::MATERIAL, 0, 0)));
}

#[test]
fn every_pass_leaves_default_raster_state() {
    let mut renderer = renderer_with(RenderSettings::default());
    let log: DrawLog = Arc::default();
    renderer.register_opaque(TestDrawable::opaque(log));

    let lights = [
        LightRecord::point(Vec3::new(0.0, 0.0, -50.0), 10.0, Vec3::ONE),
        LightRecord::directional(Vec3::NEG_Y, Vec3::ONE),
    ];
    renderer.draw(&lights);

    let device = renderer.device();
    assert!(!device.stop_states.is_empty());
    for state in &device.stop_states {
        assert!(state.is_default(), "pass ended with dirty state: {:?}", state);
    }
}

#[cfg(not(feature = "tiled-lights"))]
#[test]
fn outer_point_light_runs_the_two_subpass_stencil_technique() {
    let mut renderer = renderer_with(RenderSettings::default());
    renderer.device_mut().reset_calls();

    let lights = [LightRecord::point(Vec3::new(0.0, 0.0, -50.0), 10.0, Vec3::ONE)];
    renderer.draw(&lights);

    let device = renderer.device();
    // Mark, then shade, per buffer pair (main + alpha).
    assert_eq!(
        device.count(|c| matches!(c, Call::SetStencil(StencilMode::MarkDepthFail(1)))),
        2
    );
    assert_eq!(
        device.count(|c| matches!(c, Call::SetStencil(StencilMode::TestNotEqual(0)))),
        2
    );
    assert_eq!(device.count(|c| matches!(c, Call::DrawLightVolume)), 4);
    // The stencil buffer is cleared on its own before each mark.
    assert_eq!(
        device.count(|c| matches!(c, Call::Clear(mask) if *mask == ClearMask::STENCIL)),
        2
    );
}

#[cfg(not(feature = "tiled-lights"))]
#[test]
fn inner_point_light_uses_inverted_depth_instead() {
    let mut renderer = renderer_with(RenderSettings::default());
    renderer.device_mut().reset_calls();

    // Camera at the origin sits inside this volume.
    let lights = [LightRecord::point(Vec3::new(0.0, 0.0, -2.0), 10.0, Vec3::ONE)];
    renderer.draw(&lights);

    let device = renderer.device();
    assert_eq!(
        device.count(|c| matches!(c, Call::SetDepth(DepthFunc::Greater, false))),
        2
    );
    assert_eq!(
        device.count(|c| matches!(c, Call::SetStencil(StencilMode::MarkDepthFail(_)))),
        0
    );
    // One volume draw per buffer pair.
    assert_eq!(device.count(|c| matches!(c, Call::DrawLightVolume)), 2);
    assert_eq!(
        device.count(|c| matches!(c, Call::SetCull(CullMode::Front))),
        2
    );
}

#[cfg(not(feature = "tiled-lights"))]
#[test]
fn boundary_light_classifies_inner_on_every_frame() {
    let mut renderer = renderer_with(RenderSettings::default());
    let near = renderer.camera().near;
    let radius = 10.0;
    let lights = [LightRecord::point(
        Vec3::new(0.0, 0.0, -(radius + near)),
        radius,
        Vec3::ONE,
    )];

    for _ in 0..3 {
        renderer.device_mut().reset_calls();
        renderer.draw(&lights);
        let device = renderer.device();
        assert!(device.count(|c| matches!(c, Call::SetDepth(DepthFunc::Greater, false))) > 0);
        assert_eq!(
            device.count(|c| matches!(c, Call::SetStencil(StencilMode::MarkDepthFail(_)))),
            0
        );
    }
}

#[cfg(not(feature = "tiled-lights"))]
#[test]
fn directional_light_draws_one_fullscreen_quad_per_pair() {
    let settings = RenderSettings {
        anti_alias: AntiAliasSetting::Off,
        ..RenderSettings::default()
    };
    let mut renderer = renderer_with(settings);
    renderer.device_mut().reset_calls();

    let lights = [LightRecord::directional(Vec3::NEG_Y, Vec3::ONE)];
    renderer.draw(&lights);

    let device = renderer.device();
    assert_eq!(device.count(|c| matches!(c, Call::DrawFullscreen)), 2);
    assert!(device.count(|c| matches!(c, Call::SetDepth(DepthFunc::Always, false))) > 0);
    assert_eq!(device.count(|c| matches!(c, Call::DrawLightVolume)), 0);
}

#[test]
fn disabled_scene_skips_the_frame() {
    let mut renderer = renderer_with(RenderSettings::default());
    renderer.set_enabled(false);
    renderer.device_mut().reset_calls();

    renderer.draw(&[]);

    assert!(renderer.device().calls.is_empty());
}

#[test]
fn disabled_scene_clears_when_configured() {
    let settings = RenderSettings {
        clear_when_disabled: true,
        ..RenderSettings::default()
    };
    let mut renderer = renderer_with(settings);
    renderer.set_enabled(false);
    renderer.device_mut().reset_calls();

    renderer.draw(&[]);

    let device = renderer.device();
    assert_eq!(device.count(|c| matches!(c, Call::StartDraw(_))), 6);
    assert_eq!(device.count(|c| matches!(c, Call::Clear(_))), 6);
    assert_eq!(device.count(|c| matches!(c, Call::StopDraw)), 6);
    assert_eq!(device.count(|c| matches!(c, Call::DrawFullscreen)), 0);
}

#[test]
fn probe_renders_on_cadence_and_restores_the_camera() {
    let settings = RenderSettings {
        anti_alias: AntiAliasSetting::Off,
        ..RenderSettings::default()
    };
    let mut renderer = renderer_with(settings);
    let probe = renderer.add_probe(
        128,
        Vec3::new(3.0, 1.0, 0.0),
        glam::Mat4::IDENTITY,
        ProbeCadence::nth(2),
        false,
    );

    let mut camera = renderer.camera();
    camera.position = Vec3::new(10.0, 0.0, 0.0);
    renderer.set_camera(camera);

    let mut refreshed = Vec::new();
    for _ in 0..4 {
        renderer.draw(&[]);
        refreshed.push(renderer.last_frame_stats().probes_refreshed);
    }
    assert_eq!(refreshed, vec![1, 0, 1, 0]);
    assert_eq!(renderer.camera().position, Vec3::new(10.0, 0.0, 0.0));

    let live_before = renderer.device().live_target_count();
    renderer.remove_probe(probe);
    assert!(renderer.device().live_target_count() < live_before);
}

#[test]
fn probe_frame_composes_into_its_scene_buffer() {
    let settings = RenderSettings {
        anti_alias: AntiAliasSetting::Off,
        ..RenderSettings::default()
    };
    let mut renderer = renderer_with(settings);
    let log: DrawLog = Arc::default();
    renderer.register_opaque(TestDrawable::opaque(log.clone()));
    let probe = renderer.add_probe(
        128,
        Vec3::new(3.0, 1.0, 0.0),
        glam::Mat4::IDENTITY,
        ProbeCadence::every_frame(),
        false,
    );
    let scene_ref = renderer
        .probe_buffers(probe)
        .unwrap()
        .scene
        .as_ref()
        .unwrap()
        .target;
    let scene_id = renderer.arena().get(scene_ref).unwrap().id;
    renderer.device_mut().reset_calls();

    renderer.draw(&[]);

    // The probe frame composes into its own scene buffer, not just the
    // geometry and light targets.
    assert!(
        renderer
            .device()
            .count(|c| matches!(c, Call::StartDraw(id) if *id == scene_id))
            > 0
    );
    let log = log.lock().unwrap();
    assert!(log.contains(&(PassTag::MATERIAL | PassTag::PROBE, 0, 0)));
}

#[test]
fn alpha_material_draws_sample_the_alpha_buffer_pair() {
    let mut renderer = renderer_with(RenderSettings::default());
    let log: DrawLog = Arc::default();
    renderer.register_alpha(TestDrawable::alpha(log, Vec3::new(0.0, 0.0, -5.0)));
    renderer.device_mut().reset_calls();

    renderer.draw(&[]);

    let arena = renderer.arena();
    let buffers = renderer.buffers();
    let alpha_geometry = arena
        .get(buffers.alpha_geometry.as_ref().unwrap().target)
        .unwrap()
        .id;
    let alpha_light = arena
        .get(buffers.alpha_light.as_ref().unwrap().target)
        .unwrap()
        .id;
    let device = renderer.device();
    assert!(
        device.count(
            |c| matches!(c, Call::BindTexture { name, target, .. } if name == "g_buffer" && *target == alpha_geometry)
        ) > 0
    );
    assert!(
        device.count(
            |c| matches!(c, Call::BindTexture { name, target, .. } if name == "l_buffer" && *target == alpha_light)
        ) > 0
    );
}

#[test]
fn material_pass_uses_equal_depth_when_scene_shares_geometry_depth() {
    let mut renderer = renderer_with(RenderSettings::default());
    renderer.device_mut().reset_calls();
    renderer.draw(&[]);
    assert!(
        renderer
            .device()
            .count(|c| matches!(c, Call::SetDepth(DepthFunc::Equal, false)))
            > 0
    );

    // With a scaled render resolution the scene owns its depth and the
    // optimization cannot apply.
    let scaled = RenderSettings {
        inferred_scale: 0.5,
        ..RenderSettings::default()
    };
    let mut renderer = renderer_with(scaled);
    renderer.device_mut().reset_calls();
    renderer.draw(&[]);
    assert_eq!(
        renderer
            .device()
            .count(|c| matches!(c, Call::SetDepth(DepthFunc::Equal, false))),
        0
    );
}

#[test]
fn alpha_submissions_draw_front_to_back_then_back_to_front() {
    let mut renderer = renderer_with(RenderSettings::default());
    let log: DrawLog = Arc::default();
    renderer.register_alpha(TestDrawable::alpha(log.clone(), Vec3::new(0.0, 0.0, -5.0)));
    renderer.register_alpha(TestDrawable::alpha(log.clone(), Vec3::new(0.2, 0.0, -9.0)));

    renderer.draw(&[]);

    let log = log.lock().unwrap();
    let geometry_masks: Vec<u8> = log
        .iter()
        .filter(|(pass, _, _)| pass.contains(PassTag::GEOMETRY))
        .map(|&(_, _, mask)| mask)
        .collect();
    let material_masks: Vec<u8> = log
        .iter()
        .filter(|(pass, _, _)| pass.contains(PassTag::MATERIAL))
        .map(|&(_, _, mask)| mask)
        .collect();

    // Overlapping pair: near object gets group 1, far one group 2. The
    // material pass sees them in the opposite order.
    assert_eq!(geometry_masks, vec![1, 2]);
    assert_eq!(material_masks, vec![2, 1]);
}

#[test]
fn material_pass_blends_alpha_with_premultiplied_alpha() {
    let mut renderer = renderer_with(RenderSettings::default());
    let log: DrawLog = Arc::default();
    renderer.register_alpha(TestDrawable::alpha(log, Vec3::new(0.0, 0.0, -5.0)));
    renderer.device_mut().reset_calls();

    renderer.draw(&[]);

    assert!(
        renderer
            .device()
            .count(|c| matches!(c, Call::SetBlend(BlendMode::PremultipliedAlpha)))
            > 0
    );
}

#[test]
fn stats_count_draws_lights_and_post_steps() {
    let mut renderer = renderer_with(RenderSettings::default());
    let log: DrawLog = Arc::default();
    renderer.register_opaque(TestDrawable::opaque(log.clone()));
    renderer.register_opaque(TestDrawable::opaque(log.clone()));
    renderer.register_alpha(TestDrawable::alpha(log, Vec3::new(0.0, 0.0, -5.0)));
    renderer.add_post_handler(Box::new(|_, _| {}));

    let lights = [LightRecord::directional(Vec3::NEG_Y, Vec3::ONE)];
    renderer.draw(&lights);

    let stats = renderer.last_frame_stats();
    assert_eq!(stats.geometry_opaque_draws, 2);
    assert_eq!(stats.geometry_alpha_draws, 1);
    assert_eq!(stats.material_opaque_draws, 2);
    assert_eq!(stats.material_alpha_draws, 1);
    // One directional light accumulated into both buffer pairs.
    assert_eq!(stats.lights_accumulated, 2);
    assert_eq!(stats.post_handlers_invoked, 1);
    assert_eq!(stats.total_draw_calls(), 6);
}

#[test]
fn resize_reprovisions_without_leaking_targets() {
    let mut renderer = renderer_with(RenderSettings::default());
    let before = renderer.device().live_target_count();

    renderer.handle_resize(1920, 1080);

    assert_eq!(renderer.device().live_target_count(), before);
    let res = renderer.buffers().resolutions.unwrap();
    assert_eq!(res.display, (1920, 1080));
}

#[cfg(feature = "tiled-lights")]
#[test]
fn tiled_backend_syncs_uploads_and_dispatches() {
    let mut renderer = renderer_with(RenderSettings::default());
    renderer.device_mut().reset_calls();

    let lights = [LightRecord::point(Vec3::new(0.0, 0.0, -50.0), 10.0, Vec3::ONE)];
    renderer.draw(&lights);

    let device = renderer.device();
    // One sync + upload + dispatch per buffer pair; render resolution is
    // 1280x720 over 32px tiles.
    assert_eq!(device.count(|c| matches!(c, Call::Finish)), 2);
    assert_eq!(device.count(|c| matches!(c, Call::UploadLights(_))), 2);
    assert_eq!(
        device.count(|c| matches!(c, Call::Dispatch { groups: (40, 23), .. })),
        2
    );
    assert_eq!(device.count(|c| matches!(c, Call::DrawLightVolume)), 0);
}
