//! Material pass: re-shade surfaces from geometry + light buffer samples
//! into the scene buffer, then blend alpha submissions and particles.

use log::warn;

use crate::renderer::alpha::AlphaSorter;
use crate::renderer::device::{
    BlendMode, ClearMask, CullMode, DepthFunc, GraphicsDevice,
};
use crate::renderer::framebuffers::{DepthSource, FrameBuffer, FrameBufferSet};
use crate::renderer::submissions::{PassTag, RawDrawCallback, SubmissionRegistry};
use crate::renderer::targets::TargetArena;

#[derive(Default)]
pub struct MaterialPass;

impl MaterialPass {
    /// Returns (opaque draw count, alpha draw count).
    pub fn render(
        device: &mut dyn GraphicsDevice,
        arena: &TargetArena,
        set: &FrameBufferSet,
        registry: &mut SubmissionRegistry,
        sorter: &AlphaSorter,
        particles: &mut [RawDrawCallback],
        mode: PassTag,
    ) -> (u32, u32) {
        let Some(scene) = &set.scene else {
            warn!("Material pass skipped: no scene buffer");
            return (0, 0);
        };
        if !FrameBufferSet::bind(device, arena, scene) {
            return (0, 0);
        }

        bind_stage_inputs(device, arena, set.geometry.as_ref(), set.light.as_ref());

        // When the scene buffer reuses the geometry depth attachment, an
        // EQUAL depth test with writes off rejects every pixel outside the
        // already-resolved opaque mask. Purely an optimization; the
        // mismatched-resolution path clears and tests LESS as usual.
        let shares_geometry_depth = matches!(
            (scene.depth, set.geometry.as_ref()),
            (DepthSource::Shared(depth_ref), Some(geometry)) if depth_ref == geometry.target
        );
        if shares_geometry_depth {
            device.clear(ClearMask::COLOR);
            device.set_depth(DepthFunc::Equal, false);
        } else {
            device.clear(ClearMask::COLOR | ClearMask::DEPTH);
            device.set_depth(DepthFunc::Less, true);
        }
        device.set_cull(CullMode::Back);
        device.set_blend(BlendMode::Disabled);

        let pass = PassTag::MATERIAL | mode;
        let mut opaque_draws = 0u32;
        for (_, drawable) in registry.opaque_iter_mut() {
            for sub_object in 0..drawable.sub_object_count() {
                drawable.draw(device, pass, sub_object, 0);
                opaque_draws += 1;
            }
        }

        device.set_depth(DepthFunc::Less, true);

        // Alpha submissions blend back-to-front with premultiplied alpha,
        // sampling the alpha-captured buffer pair when one was provisioned.
        device.set_blend(BlendMode::PremultipliedAlpha);
        if set.alpha_geometry.is_some() {
            bind_stage_inputs(
                device,
                arena,
                set.alpha_geometry.as_ref(),
                set.alpha_light.as_ref(),
            );
        }
        let mut alpha_draws = 0u32;
        let entries: Vec<_> = sorter
            .iter_back_to_front()
            .map(|e| (e.submission, e.sub_object, e.mask))
            .collect();
        for (submission, sub_object, mask) in entries {
            match registry.alpha_get_mut(submission) {
                Some(drawable) => {
                    drawable.draw(device, pass, sub_object, mask);
                    alpha_draws += 1;
                }
                None => warn!("Alpha submission {:?} vanished mid-frame", submission),
            }
        }

        for particle_system in particles.iter_mut() {
            particle_system(device, pass);
        }

        device.set_blend(BlendMode::Disabled);
        device.stop_draw();

        (opaque_draws, alpha_draws)
    }
}

fn bind_stage_inputs(
    device: &mut dyn GraphicsDevice,
    arena: &TargetArena,
    geometry: Option<&FrameBuffer>,
    light: Option<&FrameBuffer>,
) {
    for (name, fb) in [("g_buffer", geometry), ("l_buffer", light)] {
        if let Some(fb) = fb {
            match arena.get(fb.target) {
                Some(entry) => device.bind_target_texture(name, entry.id, 0),
                None => warn!("Material input {:?} is stale", fb.target),
            }
        }
    }
    if let Some(geometry) = geometry {
        if let Some(entry) = arena.get(geometry.target) {
            device.bind_target_depth("g_depth", entry.id);
        }
    }
}
