//! The graphics surface the renderer core draws through.
//!
//! The core never touches GPU objects directly; it issues calls against
//! [`GraphicsDevice`] and treats shader programs as opaque ids resolved by
//! string identifier plus an option string. The wgpu-backed implementation
//! lives in `gpu.rs`; tests substitute a recording fake.

use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3, Vec4};
use thiserror::Error;

/// Backend-issued id for an allocated render target.
pub type TargetId = u32;

/// Backend-issued id for a resolved shader program variant.
pub type ShaderId = u32;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClearMask: u32 {
        const COLOR   = 1 << 0;
        const DEPTH   = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthFunc {
    Less,
    LessEqual,
    Equal,
    /// Inverted test used when the camera sits inside a light volume.
    Greater,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilMode {
    Disabled,
    /// Write the reference value wherever the fragment fails the depth
    /// test. Used on light-volume back faces to mark covered pixels.
    MarkDepthFail(u8),
    /// Pass only where the stored stencil value differs from the
    /// reference. Used on light-volume front faces to shade marked pixels.
    TestNotEqual(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Disabled,
    /// dst = dst + src, the light accumulation blend.
    Additive,
    /// (ONE, ONE_MINUS_SRC_ALPHA) for premultiplied alpha output.
    PremultipliedAlpha,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    Back,
    Front,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Winding {
    Ccw,
    Cw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Rgba8,
    Rgba16Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filtering {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Wrap {
    Clamp,
    Repeat,
}

/// Anti-aliasing mode carried per buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AntiAliasMode {
    None,
    Msaa,
    Fxaa,
    Ssaa,
}

/// Depth/stencil request for a new target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthSpec {
    None,
    /// Depth/stencil allocated as a sampleable 2D texture so later passes
    /// can read scene depth.
    OwnedTexture,
    /// Depth/stencil allocated as a renderbuffer, never sampled.
    OwnedRenderbuffer,
    /// Attach another target's depth/stencil by reference. The backend
    /// must never free it when this target is deleted.
    SharedWith(TargetId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub color_attachments: u32,
    pub format: TargetFormat,
    pub filtering: Filtering,
    pub wrap: Wrap,
    pub anti_alias: AntiAliasMode,
    pub depth: DepthSpec,
    pub auto_mipmap: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    pub max_texture_size: u32,
    /// Whether multiple color attachments per target are supported; the
    /// alpha geometry buffer is skipped without it.
    pub multi_attachment: bool,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target '{label}' ({width}x{height}) is incomplete: {status}")]
    Incomplete {
        label: &'static str,
        width: u32,
        height: u32,
        status: String,
    },
    #[error("target '{label}' shares depth with unknown target {shared_with}")]
    UnknownSharedDepth {
        label: &'static str,
        shared_with: TargetId,
    },
    #[error("target '{label}' exceeds maximum texture size ({width}x{height} > {max})")]
    TooLarge {
        label: &'static str,
        width: u32,
        height: u32,
        max: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

/// Render-target allocation, raster state, and shader binding surface.
///
/// Calls are serialized on one command stream; a pass is the span between
/// `start_draw` and `stop_draw`. `finish` is the single blocking point,
/// used by the tiled lighting back-end before its dispatch reads
/// rasterizer output.
pub trait GraphicsDevice {
    fn caps(&self) -> DeviceCaps;

    fn add_buffer(&mut self, desc: &TargetDesc) -> Result<TargetId, TargetError>;
    fn delete_buffer(&mut self, id: TargetId);

    fn start_draw(&mut self, id: TargetId);
    fn stop_draw(&mut self);
    fn clear(&mut self, mask: ClearMask);

    fn set_depth(&mut self, func: DepthFunc, write: bool);
    fn set_stencil(&mut self, mode: StencilMode);
    fn set_blend(&mut self, mode: BlendMode);
    fn set_cull(&mut self, mode: CullMode);
    fn set_front_face(&mut self, winding: Winding);

    /// Resolve a shader program by identifier plus variant option string.
    fn get_shader(&mut self, identifier: &str, option: &str) -> ShaderId;
    fn bind_shader(&mut self, shader: ShaderId);
    fn set_uniform(&mut self, name: &str, value: UniformValue);
    /// Bind a target's color attachment as a sampled texture.
    fn bind_target_texture(&mut self, name: &str, target: TargetId, attachment: u32);
    /// Bind a target's depth attachment as a sampled texture.
    fn bind_target_depth(&mut self, name: &str, target: TargetId);

    fn draw_fullscreen(&mut self);
    /// Draw the unit light-volume mesh under the given transform.
    fn draw_light_volume(&mut self, model_view_proj: Mat4);

    /// Upload the packed light list consumed by the tiled compute kernel.
    fn upload_lights(&mut self, data: &[u8]);
    fn dispatch(&mut self, shader: ShaderId, groups_x: u32, groups_y: u32);

    /// Block until previously submitted GPU work completes.
    fn finish(&mut self);
}
