//! Light accumulation: per-pixel lighting summed into the light buffer.
//!
//! Two back-ends share one contract (geometry/depth buffer plus light list
//! in, additive accumulation out): rasterized stencil light volumes, and a
//! tiled compute kernel selected by the `tiled-lights` cargo feature. Both
//! must produce the same additive output.

use glam::{Mat4, Vec2, Vec3};
use log::warn;

use crate::renderer::camera::CameraState;
use crate::renderer::device::{
    BlendMode, ClearMask, CullMode, DepthFunc, GraphicsDevice, ShaderId, StencilMode, UniformValue,
};
use crate::renderer::framebuffers::{FrameBuffer, FrameBufferSet};
use crate::renderer::lights::{
    classify_point_light, LightKind, LightRecord, TiledLightsUniform, VolumeClass, TILE_SIZE,
};
use crate::renderer::targets::TargetArena;

pub struct LightPassInputs<'a> {
    pub arena: &'a TargetArena,
    pub geometry: &'a FrameBuffer,
    pub light: &'a FrameBuffer,
    pub lights: &'a [LightRecord],
    pub camera: &'a CameraState,
}

/// One light accumulation back-end. Returns the number of lights
/// accumulated.
pub trait LightingStrategy {
    fn accumulate(&mut self, device: &mut dyn GraphicsDevice, inputs: &LightPassInputs<'_>) -> u32;
}

/// Restore the renderer's default raster state. Runs unconditionally at
/// the end of the pass, whatever subset of lights was processed.
fn restore_defaults(device: &mut dyn GraphicsDevice) {
    device.set_stencil(StencilMode::Disabled);
    device.set_depth(DepthFunc::Less, true);
    device.set_cull(CullMode::Back);
    device.set_blend(BlendMode::Disabled);
}

fn bind_geometry_inputs(
    device: &mut dyn GraphicsDevice,
    inputs: &LightPassInputs<'_>,
) -> bool {
    let Some(entry) = inputs.arena.get(inputs.geometry.target) else {
        warn!(
            "Light pass skipped: geometry target {:?} is stale",
            inputs.geometry.target
        );
        return false;
    };
    device.bind_target_texture("g_attributes", entry.id, 0);
    if entry.desc.color_attachments > 1 {
        device.bind_target_texture("g_material", entry.id, 1);
    }
    device.bind_target_depth("g_depth", entry.id);
    device.set_uniform(
        "inv_view_proj",
        UniformValue::Mat4(inputs.camera.view_proj().inverse()),
    );
    device.set_uniform(
        "viewport",
        UniformValue::Vec2(Vec2::new(
            inputs.light.width as f32,
            inputs.light.height as f32,
        )),
    );
    device.set_uniform(
        "camera_position",
        UniformValue::Vec3(inputs.camera.position),
    );
    true
}

fn point_light_uniforms(device: &mut dyn GraphicsDevice, light: &LightRecord) {
    device.set_uniform("light_position", UniformValue::Vec3(light.position));
    device.set_uniform("light_radius", UniformValue::Float(light.radius));
    device.set_uniform("light_color", UniformValue::Vec3(light.color));
    device.set_uniform(
        "light_ambient",
        UniformValue::Vec3(light.ambient.unwrap_or(Vec3::ZERO)),
    );
}

fn volume_transform(camera: &CameraState, light: &LightRecord) -> Mat4 {
    camera.view_proj()
        * Mat4::from_translation(light.position)
        * Mat4::from_scale(Vec3::splat(light.radius))
}

/// Rasterized stencil-volume back-end: a two-sub-pass stencil technique
/// per outer point light, an inverted depth test for lights containing
/// the camera, and one full-screen draw per directional light.
#[derive(Default)]
pub struct StencilVolumeLighting {
    volume_shader: Option<ShaderId>,
    point_shader: Option<ShaderId>,
    directional_shader: Option<ShaderId>,
}

impl StencilVolumeLighting {
    fn ensure_shaders(&mut self, device: &mut dyn GraphicsDevice) {
        if self.volume_shader.is_none() {
            self.volume_shader = Some(device.get_shader("light_volume", "mask"));
            self.point_shader = Some(device.get_shader("light_point", ""));
            self.directional_shader = Some(device.get_shader("light_directional", ""));
        }
    }
}

impl LightingStrategy for StencilVolumeLighting {
    fn accumulate(&mut self, device: &mut dyn GraphicsDevice, inputs: &LightPassInputs<'_>) -> u32 {
        self.ensure_shaders(device);
        let (volume, point, directional) = (
            self.volume_shader.unwrap_or_default(),
            self.point_shader.unwrap_or_default(),
            self.directional_shader.unwrap_or_default(),
        );

        if !FrameBufferSet::bind(device, inputs.arena, inputs.light) {
            return 0;
        }
        device.clear(ClearMask::COLOR);
        device.set_blend(BlendMode::Additive);

        let mut accumulated = 0u32;
        for light in inputs.lights.iter().filter(|l| l.enabled) {
            match light.kind {
                LightKind::Point | LightKind::Spot => {
                    let mvp = volume_transform(inputs.camera, light);
                    // Camera inside or outside the light volume decides
                    // the technique; recomputed every frame.
                    match classify_point_light(inputs.camera.position, inputs.camera.near, light) {
                        VolumeClass::Outer => {
                            device.clear(ClearMask::STENCIL);

                            // Sub-pass 1: mark pixels inside the volume by
                            // writing stencil where back faces fail depth.
                            device.bind_shader(volume);
                            device.set_depth(DepthFunc::Less, false);
                            device.set_cull(CullMode::Front);
                            device.set_stencil(StencilMode::MarkDepthFail(1));
                            device.draw_light_volume(mvp);

                            // Sub-pass 2: shade front faces only where the
                            // mark landed.
                            device.bind_shader(point);
                            if !bind_geometry_inputs(device, inputs) {
                                break;
                            }
                            point_light_uniforms(device, light);
                            device.set_stencil(StencilMode::TestNotEqual(0));
                            device.set_cull(CullMode::Back);
                            device.set_depth(DepthFunc::Less, false);
                            device.draw_light_volume(mvp);
                        }
                        VolumeClass::Inner => {
                            device.bind_shader(point);
                            if !bind_geometry_inputs(device, inputs) {
                                break;
                            }
                            point_light_uniforms(device, light);
                            device.set_stencil(StencilMode::Disabled);
                            device.set_depth(DepthFunc::Greater, false);
                            device.set_cull(CullMode::Front);
                            device.draw_light_volume(mvp);
                        }
                    }
                    accumulated += 1;
                }
                LightKind::Directional => {
                    device.bind_shader(directional);
                    if !bind_geometry_inputs(device, inputs) {
                        break;
                    }
                    device.set_uniform("light_direction", UniformValue::Vec3(light.direction));
                    device.set_uniform("light_color", UniformValue::Vec3(light.color));
                    device.set_uniform(
                        "light_ambient",
                        UniformValue::Vec3(light.ambient.unwrap_or(Vec3::ZERO)),
                    );
                    device.set_stencil(StencilMode::Disabled);
                    device.set_depth(DepthFunc::Always, false);
                    device.set_cull(CullMode::Back);
                    device.draw_fullscreen();
                    accumulated += 1;
                }
            }
        }

        restore_defaults(device);
        device.stop_draw();
        accumulated
    }
}

/// Tiled compute back-end: one dispatch over fixed-size tiles consuming
/// the same geometry/depth buffer and the packed light list.
#[derive(Default)]
pub struct TiledComputeLighting {
    kernel: Option<ShaderId>,
}

impl LightingStrategy for TiledComputeLighting {
    fn accumulate(&mut self, device: &mut dyn GraphicsDevice, inputs: &LightPassInputs<'_>) -> u32 {
        if self.kernel.is_none() {
            self.kernel = Some(device.get_shader("light_tiled", ""));
        }
        let kernel = self.kernel.unwrap_or_default();

        let Some(light_entry) = inputs.arena.get(inputs.light.target) else {
            warn!(
                "Tiled light pass skipped: light target {:?} is stale",
                inputs.light.target
            );
            return 0;
        };
        let light_id = light_entry.id;

        // The kernel samples rasterizer output; wait for the geometry
        // pass to land before reading it.
        device.finish();

        let uniform = TiledLightsUniform::from_records(inputs.lights);
        device.upload_lights(bytemuck::bytes_of(&uniform));

        if !bind_geometry_inputs(device, inputs) {
            return 0;
        }
        device.bind_target_texture("light_output", light_id, 0);

        let groups_x = inputs.light.width.div_ceil(TILE_SIZE);
        let groups_y = inputs.light.height.div_ceil(TILE_SIZE);
        device.dispatch(kernel, groups_x, groups_y);

        restore_defaults(device);
        uniform.counts[0]
    }
}

/// The compile-time selected back-end.
#[cfg(not(feature = "tiled-lights"))]
pub fn default_strategy() -> Box<dyn LightingStrategy> {
    Box::new(StencilVolumeLighting::default())
}

#[cfg(feature = "tiled-lights")]
pub fn default_strategy() -> Box<dyn LightingStrategy> {
    Box::new(TiledComputeLighting::default())
}
