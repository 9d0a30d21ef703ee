#![allow(dead_code)]

//! CPU-only [`GraphicsDevice`] fake that records every call, tracks live
//! targets, and snapshots raster state at each `stop_draw`.

use std::collections::{HashMap, HashSet};

use glam::Mat4;
use inferred_renderer::renderer::device::{
    BlendMode, ClearMask, CullMode, DepthFunc, DepthSpec, DeviceCaps, GraphicsDevice, ShaderId,
    StencilMode, TargetDesc, TargetError, TargetId, UniformValue, Winding,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    AddBuffer {
        label: &'static str,
        width: u32,
        height: u32,
        attachments: u32,
        depth: DepthSpec,
    },
    DeleteBuffer(TargetId),
    StartDraw(TargetId),
    StopDraw,
    Clear(ClearMask),
    SetDepth(DepthFunc, bool),
    SetStencil(StencilMode),
    SetBlend(BlendMode),
    SetCull(CullMode),
    SetFrontFace(Winding),
    BindShader(ShaderId),
    SetUniform(String),
    BindTexture {
        name: String,
        target: TargetId,
        attachment: u32,
    },
    BindDepth {
        name: String,
        target: TargetId,
    },
    DrawFullscreen,
    DrawLightVolume,
    UploadLights(usize),
    Dispatch {
        shader: ShaderId,
        groups: (u32, u32),
    },
    Finish,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateSnapshot {
    pub depth: (DepthFunc, bool),
    pub stencil: StencilMode,
    pub blend: BlendMode,
    pub cull: CullMode,
    pub winding: Winding,
}

impl StateSnapshot {
    pub fn is_default(&self) -> bool {
        self.depth == (DepthFunc::Less, true)
            && self.stencil == StencilMode::Disabled
            && self.blend == BlendMode::Disabled
            && self.cull == CullMode::Back
            && self.winding == Winding::Ccw
    }
}

pub struct RecordingDevice {
    pub caps: DeviceCaps,
    pub calls: Vec<Call>,
    /// Raster state observed at each `stop_draw`.
    pub stop_states: Vec<StateSnapshot>,
    live: HashSet<TargetId>,
    next_target: TargetId,
    shaders: HashMap<(String, String), ShaderId>,
    state: StateSnapshot,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_caps(DeviceCaps {
            max_texture_size: 16384,
            multi_attachment: true,
        })
    }

    pub fn with_caps(caps: DeviceCaps) -> Self {
        Self {
            caps,
            calls: Vec::new(),
            stop_states: Vec::new(),
            live: HashSet::new(),
            next_target: 1,
            shaders: HashMap::new(),
            state: StateSnapshot {
                depth: (DepthFunc::Less, true),
                stencil: StencilMode::Disabled,
                blend: BlendMode::Disabled,
                cull: CullMode::Back,
                winding: Winding::Ccw,
            },
        }
    }

    pub fn live_target_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_targets(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self.live.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(|c| predicate(c))
    }

    pub fn reset_calls(&mut self) {
        self.calls.clear();
        self.stop_states.clear();
    }
}

impl GraphicsDevice for RecordingDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn add_buffer(&mut self, desc: &TargetDesc) -> Result<TargetId, TargetError> {
        self.calls.push(Call::AddBuffer {
            label: desc.label,
            width: desc.width,
            height: desc.height,
            attachments: desc.color_attachments,
            depth: desc.depth,
        });
        if desc.width > self.caps.max_texture_size || desc.height > self.caps.max_texture_size {
            return Err(TargetError::TooLarge {
                label: desc.label,
                width: desc.width,
                height: desc.height,
                max: self.caps.max_texture_size,
            });
        }
        if let DepthSpec::SharedWith(owner) = desc.depth {
            if !self.live.contains(&owner) {
                return Err(TargetError::UnknownSharedDepth {
                    label: desc.label,
                    shared_with: owner,
                });
            }
        }
        let id = self.next_target;
        self.next_target += 1;
        self.live.insert(id);
        Ok(id)
    }

    fn delete_buffer(&mut self, id: TargetId) {
        self.calls.push(Call::DeleteBuffer(id));
        assert!(self.live.remove(&id), "double delete of target {}", id);
    }

    fn start_draw(&mut self, id: TargetId) {
        assert!(self.live.contains(&id), "draw into dead target {}", id);
        self.calls.push(Call::StartDraw(id));
    }

    fn stop_draw(&mut self) {
        self.calls.push(Call::StopDraw);
        self.stop_states.push(self.state);
    }

    fn clear(&mut self, mask: ClearMask) {
        self.calls.push(Call::Clear(mask));
    }

    fn set_depth(&mut self, func: DepthFunc, write: bool) {
        self.state.depth = (func, write);
        self.calls.push(Call::SetDepth(func, write));
    }

    fn set_stencil(&mut self, mode: StencilMode) {
        self.state.stencil = mode;
        self.calls.push(Call::SetStencil(mode));
    }

    fn set_blend(&mut self, mode: BlendMode) {
        self.state.blend = mode;
        self.calls.push(Call::SetBlend(mode));
    }

    fn set_cull(&mut self, mode: CullMode) {
        self.state.cull = mode;
        self.calls.push(Call::SetCull(mode));
    }

    fn set_front_face(&mut self, winding: Winding) {
        self.state.winding = winding;
        self.calls.push(Call::SetFrontFace(winding));
    }

    fn get_shader(&mut self, identifier: &str, option: &str) -> ShaderId {
        let next = self.shaders.len() as ShaderId + 1;
        *self
            .shaders
            .entry((identifier.to_owned(), option.to_owned()))
            .or_insert(next)
    }

    fn bind_shader(&mut self, shader: ShaderId) {
        self.calls.push(Call::BindShader(shader));
    }

    fn set_uniform(&mut self, name: &str, _value: UniformValue) {
        self.calls.push(Call::SetUniform(name.to_owned()));
    }

    fn bind_target_texture(&mut self, name: &str, target: TargetId, attachment: u32) {
        self.calls.push(Call::BindTexture {
            name: name.to_owned(),
            target,
            attachment,
        });
    }

    fn bind_target_depth(&mut self, name: &str, target: TargetId) {
        self.calls.push(Call::BindDepth {
            name: name.to_owned(),
            target,
        });
    }

    fn draw_fullscreen(&mut self) {
        self.calls.push(Call::DrawFullscreen);
    }

    fn draw_light_volume(&mut self, _model_view_proj: Mat4) {
        self.calls.push(Call::DrawLightVolume);
    }

    fn upload_lights(&mut self, data: &[u8]) {
        self.calls.push(Call::UploadLights(data.len()));
    }

    fn dispatch(&mut self, shader: ShaderId, groups_x: u32, groups_y: u32) {
        self.calls.push(Call::Dispatch {
            shader,
            groups: (groups_x, groups_y),
        });
    }

    fn finish(&mut self) {
        self.calls.push(Call::Finish);
    }
}
