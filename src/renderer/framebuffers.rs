//! Frame buffer provisioning for the geometry/light/material stages.
//!
//! The geometry buffer owns the depth/stencil attachment as a sampleable
//! texture; the light buffer attaches to it by reference; the scene buffer
//! reuses it only when the display resolution matches the render
//! resolution. Provisioning failures are diagnostic, never fatal: a frame
//! with a missing buffer degrades visually instead of stalling.

use log::{error, info, warn};

use crate::renderer::device::{
    AntiAliasMode, DepthSpec, DeviceCaps, Filtering, GraphicsDevice, TargetDesc, TargetFormat,
    TargetId, Wrap,
};
use crate::renderer::targets::{TargetArena, TargetEntry, TargetRef};
use crate::settings::RenderSettings;

/// Depth/stencil role of one provisioned buffer.
///
/// `Shared` is a weak reference to the owning buffer; the sharer must
/// never delete the attachment and a teardown nulls all sharers before
/// the owner goes away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthSource {
    None,
    Owned,
    Shared(TargetRef),
}

#[derive(Clone, Copy, Debug)]
pub struct FrameBuffer {
    pub target: TargetRef,
    pub width: u32,
    pub height: u32,
    pub anti_alias: AntiAliasMode,
    pub depth: DepthSource,
    pub auto_mipmap: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolutions {
    /// Geometry/light stage resolution (display x inferred scale).
    pub render: (u32, u32),
    /// Final/scene stage resolution.
    pub display: (u32, u32),
}

/// The per-output collection of render targets. One set backs the main
/// frame; each environment probe owns another.
#[derive(Default)]
pub struct FrameBufferSet {
    pub geometry: Option<FrameBuffer>,
    pub alpha_geometry: Option<FrameBuffer>,
    pub light: Option<FrameBuffer>,
    pub alpha_light: Option<FrameBuffer>,
    pub scene: Option<FrameBuffer>,
    pub fxaa: Option<FrameBuffer>,
    pub resolutions: Option<Resolutions>,
}

fn round_up_even(v: u32) -> u32 {
    let v = v.max(2);
    v + (v & 1)
}

fn scaled(window: (u32, u32), factor: u32, inferred_scale: f32) -> Resolutions {
    let display = (
        round_up_even(window.0.saturating_mul(factor)),
        round_up_even(window.1.saturating_mul(factor)),
    );
    let render = (
        round_up_even((display.0 as f32 * inferred_scale).ceil() as u32),
        round_up_even((display.1 as f32 * inferred_scale).ceil() as u32),
    );
    Resolutions { render, display }
}

fn fits(res: Resolutions, max: u32) -> bool {
    res.display.0 <= max && res.display.1 <= max && res.render.0 <= max && res.render.1 <= max
}

/// Compute the render/display resolutions for a requested window size,
/// degrading the SSAA factor (halving until it fits the device maximum,
/// disabling SSAA if no factor >= 2 fits).
pub fn compute_resolutions(
    window: (u32, u32),
    settings: &RenderSettings,
    caps: DeviceCaps,
) -> (Resolutions, u32, AntiAliasMode) {
    let mut mode = settings.anti_alias_mode();
    let mut factor = 1u32;

    if mode == AntiAliasMode::Ssaa {
        let mut candidate = settings.ssaa_factor.max(2);
        loop {
            let res = scaled(window, candidate, settings.inferred_scale);
            if fits(res, caps.max_texture_size) {
                if candidate != settings.ssaa_factor {
                    warn!(
                        "SSAA factor {} exceeds max texture size {}; reduced to {}",
                        settings.ssaa_factor, caps.max_texture_size, candidate
                    );
                }
                factor = candidate;
                break;
            }
            if candidate <= 2 {
                error!(
                    "No SSAA factor >= 2 fits {}x{} under max texture size {}; supersampling disabled",
                    window.0, window.1, caps.max_texture_size
                );
                mode = AntiAliasMode::None;
                break;
            }
            candidate /= 2;
        }
    }

    (scaled(window, factor, settings.inferred_scale), factor, mode)
}

fn allocate(
    device: &mut dyn GraphicsDevice,
    arena: &mut TargetArena,
    desc: TargetDesc,
) -> Option<FrameBuffer> {
    let (width, height, anti_alias, auto_mipmap) =
        (desc.width, desc.height, desc.anti_alias, desc.auto_mipmap);
    let depth = match desc.depth {
        DepthSpec::None => DepthSource::None,
        DepthSpec::OwnedTexture | DepthSpec::OwnedRenderbuffer => DepthSource::Owned,
        // Callers patch in the real TargetRef after allocation.
        DepthSpec::SharedWith(_) => DepthSource::None,
    };
    match device.add_buffer(&desc) {
        Ok(id) => {
            let target = arena.insert(TargetEntry { id, desc });
            Some(FrameBuffer {
                target,
                width,
                height,
                anti_alias,
                depth,
                auto_mipmap,
            })
        }
        Err(err) => {
            // Diagnostic, not fatal: the rest of the pipeline still runs.
            error!("Failed to provision render target: {}", err);
            None
        }
    }
}

fn target_id(arena: &TargetArena, fb: &FrameBuffer) -> Option<TargetId> {
    arena.get(fb.target).map(|entry| entry.id)
}

impl FrameBufferSet {
    /// Allocate the full buffer set for one output. Allocation order
    /// matters: geometry buffers own depth, light buffers attach to it by
    /// reference, the scene buffer reuses it only on an exact resolution
    /// match, the FXAA resolve buffer is color-only.
    pub fn provision(
        device: &mut dyn GraphicsDevice,
        arena: &mut TargetArena,
        window: (u32, u32),
        settings: &RenderSettings,
        capture_alpha: bool,
    ) -> Self {
        let caps = device.caps();
        let (resolutions, factor, mode) = compute_resolutions(window, settings, caps);
        let (rw, rh) = resolutions.render;
        let (dw, dh) = resolutions.display;
        info!(
            "Provisioning buffers: render {}x{}, display {}x{}, aa {:?}, factor {}",
            rw, rh, dw, dh, mode, factor
        );

        let mut set = FrameBufferSet {
            resolutions: Some(resolutions),
            ..FrameBufferSet::default()
        };

        let geometry_attachments = if caps.multi_attachment { 2 } else { 1 };
        set.geometry = allocate(
            device,
            arena,
            TargetDesc {
                label: "geometry",
                width: rw,
                height: rh,
                color_attachments: geometry_attachments,
                format: TargetFormat::Rgba16Float,
                filtering: Filtering::Nearest,
                wrap: Wrap::Clamp,
                anti_alias: mode,
                depth: DepthSpec::OwnedTexture,
                auto_mipmap: false,
            },
        );

        // Alpha geometry capture needs multi-attachment support; without
        // it the feature is skipped and the frame stays valid.
        if capture_alpha && caps.multi_attachment {
            set.alpha_geometry = allocate(
                device,
                arena,
                TargetDesc {
                    label: "alpha_geometry",
                    width: rw,
                    height: rh,
                    color_attachments: 2,
                    format: TargetFormat::Rgba16Float,
                    filtering: Filtering::Nearest,
                    wrap: Wrap::Clamp,
                    anti_alias: mode,
                    depth: DepthSpec::OwnedTexture,
                    auto_mipmap: false,
                },
            );
        } else if capture_alpha {
            warn!("Multi-attachment targets unsupported; alpha geometry capture disabled");
        }

        set.light = set.geometry.as_ref().and_then(|geometry| {
            let owner_id = target_id(arena, geometry)?;
            let mut fb = allocate(
                device,
                arena,
                TargetDesc {
                    label: "light",
                    width: rw,
                    height: rh,
                    color_attachments: 1,
                    format: TargetFormat::Rgba16Float,
                    filtering: Filtering::Linear,
                    wrap: Wrap::Clamp,
                    anti_alias: mode,
                    depth: DepthSpec::SharedWith(owner_id),
                    auto_mipmap: false,
                },
            )?;
            fb.depth = DepthSource::Shared(geometry.target);
            Some(fb)
        });

        set.alpha_light = set.alpha_geometry.as_ref().and_then(|geometry| {
            let owner_id = target_id(arena, geometry)?;
            let mut fb = allocate(
                device,
                arena,
                TargetDesc {
                    label: "alpha_light",
                    width: rw,
                    height: rh,
                    color_attachments: 1,
                    format: TargetFormat::Rgba16Float,
                    filtering: Filtering::Linear,
                    wrap: Wrap::Clamp,
                    anti_alias: mode,
                    depth: DepthSpec::SharedWith(owner_id),
                    auto_mipmap: false,
                },
            )?;
            fb.depth = DepthSource::Shared(geometry.target);
            Some(fb)
        });

        // Scene depth reuses the geometry attachment only on an exact
        // resolution match; otherwise it owns an unsampled renderbuffer.
        let shared_scene_depth = if resolutions.display == resolutions.render {
            set.geometry
                .as_ref()
                .and_then(|g| target_id(arena, g).map(|id| (g.target, id)))
        } else {
            None
        };
        set.scene = {
            let depth_spec = match shared_scene_depth {
                Some((_, id)) => DepthSpec::SharedWith(id),
                None => DepthSpec::OwnedRenderbuffer,
            };
            let mut fb = allocate(
                device,
                arena,
                TargetDesc {
                    label: "scene",
                    width: dw,
                    height: dh,
                    color_attachments: 1,
                    format: TargetFormat::Rgba8,
                    filtering: Filtering::Linear,
                    wrap: Wrap::Clamp,
                    anti_alias: mode,
                    depth: depth_spec,
                    auto_mipmap: mode == AntiAliasMode::Ssaa,
                },
            );
            if let (Some(fb), Some((owner_ref, _))) = (fb.as_mut(), shared_scene_depth) {
                fb.depth = DepthSource::Shared(owner_ref);
            }
            fb
        };

        if mode == AntiAliasMode::Fxaa {
            set.fxaa = allocate(
                device,
                arena,
                TargetDesc {
                    label: "fxaa_resolve",
                    width: dw,
                    height: dh,
                    color_attachments: 1,
                    format: TargetFormat::Rgba8,
                    filtering: Filtering::Linear,
                    wrap: Wrap::Clamp,
                    anti_alias: mode,
                    depth: DepthSpec::None,
                    auto_mipmap: false,
                },
            );
        }

        set
    }

    /// Tear down every buffer. Shared depth references are nulled first so
    /// no dependent buffer points at a freed attachment while the owners
    /// are deleted.
    pub fn teardown(&mut self, device: &mut dyn GraphicsDevice, arena: &mut TargetArena) {
        for fb in [
            &mut self.light,
            &mut self.alpha_light,
            &mut self.scene,
            &mut self.fxaa,
        ]
        .into_iter()
        .flatten()
        {
            if matches!(fb.depth, DepthSource::Shared(_)) {
                fb.depth = DepthSource::None;
            }
        }

        // Reverse allocation order: dependents before depth owners.
        for fb in [
            self.fxaa.take(),
            self.scene.take(),
            self.alpha_light.take(),
            self.light.take(),
            self.alpha_geometry.take(),
            self.geometry.take(),
        ]
        .into_iter()
        .flatten()
        {
            match arena.remove(fb.target) {
                Some(entry) => device.delete_buffer(entry.id),
                None => warn!("Render target {:?} already removed", fb.target),
            }
        }
        self.resolutions = None;
    }

    /// Bind a buffer for drawing, failing softly on a stale reference.
    pub fn bind(
        device: &mut dyn GraphicsDevice,
        arena: &TargetArena,
        fb: &FrameBuffer,
    ) -> bool {
        match arena.get(fb.target) {
            Some(entry) => {
                device.start_draw(entry.id);
                true
            }
            None => {
                warn!("Skipping pass: render target {:?} is stale", fb.target);
                false
            }
        }
    }

    /// Backend ids of every live buffer in the set, in allocation order.
    pub fn target_ids(&self, arena: &TargetArena) -> Vec<TargetId> {
        [
            &self.geometry,
            &self.alpha_geometry,
            &self.light,
            &self.alpha_light,
            &self.scene,
            &self.fxaa,
        ]
        .into_iter()
        .flatten()
        .filter_map(|fb| target_id(arena, fb))
        .collect()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &FrameBuffer> {
        [
            &self.geometry,
            &self.alpha_geometry,
            &self.light,
            &self.alpha_light,
            &self.scene,
            &self.fxaa,
        ]
        .into_iter()
        .flatten()
    }
}
