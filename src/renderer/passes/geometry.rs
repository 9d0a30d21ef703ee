//! Geometry pass: rasterize surface attributes and depth/stencil into the
//! geometry buffer(s).

use log::warn;

use crate::renderer::alpha::AlphaSorter;
use crate::renderer::device::{BlendMode, ClearMask, CullMode, DepthFunc, GraphicsDevice, StencilMode};
use crate::renderer::framebuffers::FrameBufferSet;
use crate::renderer::submissions::{PassTag, RawDrawCallback, SubmissionRegistry};
use crate::renderer::targets::TargetArena;

#[derive(Default)]
pub struct GeometryPass;

impl GeometryPass {
    /// Returns (opaque draw count, alpha draw count).
    pub fn render(
        device: &mut dyn GraphicsDevice,
        arena: &TargetArena,
        set: &FrameBufferSet,
        registry: &mut SubmissionRegistry,
        sorter: &AlphaSorter,
        raw_callbacks: &mut [RawDrawCallback],
        mode: PassTag,
    ) -> (u32, u32) {
        let Some(geometry) = &set.geometry else {
            warn!("Geometry pass skipped: no geometry buffer");
            return (0, 0);
        };
        if !FrameBufferSet::bind(device, arena, geometry) {
            return (0, 0);
        }

        device.set_depth(DepthFunc::Less, true);
        device.set_cull(CullMode::Back);
        device.set_blend(BlendMode::Disabled);
        device.set_stencil(StencilMode::Disabled);
        device.clear(ClearMask::COLOR | ClearMask::DEPTH | ClearMask::STENCIL);

        let pass = PassTag::GEOMETRY | mode;
        let mut opaque_draws = 0u32;
        for (_, drawable) in registry.opaque_iter_mut() {
            for sub_object in 0..drawable.sub_object_count() {
                drawable.draw(device, pass, sub_object, 0);
                opaque_draws += 1;
            }
        }
        for callback in raw_callbacks.iter_mut() {
            callback(device, pass);
        }
        device.stop_draw();

        // Alpha geometry capture, front-to-back so per-pixel tests can use
        // an ordinal mask. Absent on platforms without multi-attachment
        // support.
        let mut alpha_draws = 0u32;
        if let Some(alpha_geometry) = &set.alpha_geometry {
            if FrameBufferSet::bind(device, arena, alpha_geometry) {
                device.clear(ClearMask::COLOR | ClearMask::DEPTH | ClearMask::STENCIL);
                let entries: Vec<_> = sorter
                    .iter_front_to_back()
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
                device.stop_draw();
            }
        }

        (opaque_draws, alpha_draws)
    }
}
