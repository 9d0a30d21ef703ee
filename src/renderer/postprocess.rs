//! Post-process composition: optional FXAA resolve plus externally
//! registered post handlers, run in registration order over the scene
//! buffer.

use glam::Vec2;
use log::warn;

use crate::renderer::device::{
    AntiAliasMode, GraphicsDevice, ShaderId, TargetId, UniformValue, Winding,
};
use crate::renderer::framebuffers::FrameBufferSet;
use crate::renderer::targets::TargetArena;

/// Externally supplied post-processing step; receives the scene buffer's
/// backend id.
pub type PostHandler = Box<dyn FnMut(&mut dyn GraphicsDevice, TargetId)>;

#[derive(Default)]
pub struct PostProcess {
    luma_shader: Option<ShaderId>,
    fxaa_shader: Option<ShaderId>,
    handlers: Vec<PostHandler>,
}

impl PostProcess {
    pub fn add_handler(&mut self, handler: PostHandler) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn execute(
        &mut self,
        device: &mut dyn GraphicsDevice,
        arena: &TargetArena,
        set: &FrameBufferSet,
    ) -> u32 {
        let Some(scene) = &set.scene else {
            return 0;
        };
        let Some(scene_id) = arena.get(scene.target).map(|e| e.id) else {
            warn!("Post-process skipped: scene target {:?} is stale", scene.target);
            return 0;
        };

        if scene.anti_alias == AntiAliasMode::Fxaa {
            if let Some(resolve) = &set.fxaa {
                if let Some(resolve_id) = arena.get(resolve.target).map(|e| e.id) {
                    self.run_fxaa(device, scene_id, resolve_id, (scene.width, scene.height));
                } else {
                    warn!("FXAA skipped: resolve target {:?} is stale", resolve.target);
                }
            }
        }

        let mut invoked = 0u32;
        for handler in &mut self.handlers {
            handler(device, scene_id);
            invoked += 1;
        }
        invoked
    }

    fn run_fxaa(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scene_id: TargetId,
        resolve_id: TargetId,
        size: (u32, u32),
    ) {
        if self.luma_shader.is_none() {
            self.luma_shader = Some(device.get_shader("fxaa", "luma"));
            self.fxaa_shader = Some(device.get_shader("fxaa", ""));
        }
        let luma = self.luma_shader.unwrap_or_default();
        let fxaa = self.fxaa_shader.unwrap_or_default();

        // Luma pre-pass into the resolve buffer.
        device.start_draw(resolve_id);
        device.bind_shader(luma);
        device.bind_target_texture("scene", scene_id, 0);
        device.draw_fullscreen();
        device.stop_draw();

        // Edge-aware filter back into the scene buffer. The full-screen
        // triangle's vertex order comes out reversed under this resolve
        // path, so flip the front face for the draw.
        device.start_draw(scene_id);
        device.bind_shader(fxaa);
        device.bind_target_texture("luma", resolve_id, 0);
        device.set_uniform(
            "inv_screen_size",
            UniformValue::Vec2(Vec2::new(1.0 / size.0 as f32, 1.0 / size.1 as f32)),
        );
        device.set_front_face(Winding::Cw);
        device.draw_fullscreen();
        device.set_front_face(Winding::Ccw);
        device.stop_draw();
    }
}
