//! wgpu-backed [`GraphicsDevice`].
//!
//! Raster state calls mutate a shadow state; draws snapshot it. A pass is
//! recorded between `start_draw`/`stop_draw` and replayed as one or more
//! render passes, split wherever a mid-pass clear lands (the stencil
//! volume technique clears stencil per light).

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use log::{info, warn};
use wgpu::util::DeviceExt;

use crate::renderer::device::{
    BlendMode, ClearMask, CullMode, DepthFunc, DepthSpec, DeviceCaps, GraphicsDevice, ShaderId,
    StencilMode, TargetDesc, TargetError, TargetFormat, TargetId, UniformValue, Winding,
};

const SPHERE_STACKS: u32 = 16;
const SPHERE_SLICES: u32 = 24;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

const FALLBACK_WGSL: &str = "
struct VsOut {
    @builtin(position) position: vec4<f32>,
};
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    var out: VsOut;
    out.position = vec4<f32>(positions[index], 0.0, 1.0);
    return out;
}
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 1.0, 1.0);
}
";

/// How a shader program expects to be fed geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderKind {
    /// Full-screen triangle, no vertex buffer.
    Fullscreen,
    /// The unit light-volume sphere mesh.
    Volume,
    Compute,
}

struct ShaderEntry {
    module: wgpu::ShaderModule,
    kind: ShaderKind,
    color_writes: wgpu::ColorWrites,
}

struct BuiltinShader {
    identifier: &'static str,
    option: &'static str,
    source: &'static str,
    kind: ShaderKind,
    color_writes: wgpu::ColorWrites,
}

const BUILTIN_SHADERS: &[BuiltinShader] = &[
    BuiltinShader {
        identifier: "light_point",
        option: "",
        source: include_str!("shaders/light_point.wgsl"),
        kind: ShaderKind::Volume,
        color_writes: wgpu::ColorWrites::ALL,
    },
    BuiltinShader {
        identifier: "light_volume",
        option: "mask",
        source: include_str!("shaders/light_volume.wgsl"),
        kind: ShaderKind::Volume,
        color_writes: wgpu::ColorWrites::empty(),
    },
    BuiltinShader {
        identifier: "light_directional",
        option: "",
        source: include_str!("shaders/light_directional.wgsl"),
        kind: ShaderKind::Fullscreen,
        color_writes: wgpu::ColorWrites::ALL,
    },
    BuiltinShader {
        identifier: "fxaa",
        option: "luma",
        source: include_str!("shaders/fxaa_luma.wgsl"),
        kind: ShaderKind::Fullscreen,
        color_writes: wgpu::ColorWrites::ALL,
    },
    BuiltinShader {
        identifier: "fxaa",
        option: "",
        source: include_str!("shaders/fxaa.wgsl"),
        kind: ShaderKind::Fullscreen,
        color_writes: wgpu::ColorWrites::ALL,
    },
    BuiltinShader {
        identifier: "light_tiled",
        option: "",
        source: include_str!("shaders/light_tiled.wgsl"),
        kind: ShaderKind::Compute,
        color_writes: wgpu::ColorWrites::ALL,
    },
];

/// Per-draw uniform block, mirrored by `DrawUniforms` in the WGSL
/// sources. `viewport` packs viewport extent in xy and the inverse screen
/// size in zw.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DrawUniforms {
    model_view_proj: [[f32; 4]; 4],
    inv_view_proj: [[f32; 4]; 4],
    camera_position: [f32; 4],
    light_position: [f32; 4],
    light_direction: [f32; 4],
    light_color: [f32; 4],
    light_ambient: [f32; 4],
    viewport: [f32; 4],
}

impl Default for DrawUniforms {
    fn default() -> Self {
        let mut uniforms = Self::zeroed();
        uniforms.model_view_proj = Mat4::IDENTITY.to_cols_array_2d();
        uniforms.inv_view_proj = Mat4::IDENTITY.to_cols_array_2d();
        uniforms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct RasterState {
    depth_func: DepthFunc,
    depth_write: bool,
    stencil: StencilMode,
    blend: BlendMode,
    cull: CullMode,
    winding: Winding,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            depth_func: DepthFunc::Less,
            depth_write: true,
            stencil: StencilMode::Disabled,
            blend: BlendMode::Disabled,
            cull: CullMode::Back,
            winding: Winding::Ccw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: ShaderId,
    state: RasterState,
    color_format: wgpu::TextureFormat,
    attachment_count: u32,
    has_depth: bool,
}

struct GpuTarget {
    desc: TargetDesc,
    color_format: wgpu::TextureFormat,
    color_views: Vec<wgpu::TextureView>,
    /// Full depth/stencil view used as a render pass attachment.
    depth_attachment: Option<wgpu::TextureView>,
    /// Depth-aspect view used for sampling; absent for renderbuffer-style
    /// and shared-from-renderbuffer depth.
    depth_sample: Option<wgpu::TextureView>,
}

#[derive(Clone, Copy)]
enum DrawGeometry {
    Fullscreen,
    Volume,
}

struct DrawCall {
    shader: ShaderId,
    state: RasterState,
    uniforms: DrawUniforms,
    textures: [Option<wgpu::TextureView>; 2],
    depth_texture: Option<wgpu::TextureView>,
    geometry: DrawGeometry,
}

enum Command {
    Clear(ClearMask),
    Draw(DrawCall),
}

struct PendingPass {
    target: TargetId,
    commands: Vec<Command>,
}

struct PassSegment {
    clear: ClearMask,
    draw_range: std::ops::Range<usize>,
    depth_writable: bool,
    stencil_writable: bool,
}

struct PreparedDraw {
    key: PipelineKey,
    uniform_bind: wgpu::BindGroup,
    texture_bind: wgpu::BindGroup,
    stencil_reference: u32,
    geometry: DrawGeometry,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,

    targets: HashMap<TargetId, GpuTarget>,
    next_target: TargetId,

    shaders: Vec<ShaderEntry>,
    shader_lookup: HashMap<(String, String), ShaderId>,
    render_pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    compute_pipelines: HashMap<ShaderId, wgpu::ComputePipeline>,

    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    compute_texture_layout: wgpu::BindGroupLayout,
    render_pipeline_layout: wgpu::PipelineLayout,
    compute_pipeline_layout: wgpu::PipelineLayout,

    sampler: wgpu::Sampler,
    fallback_texture: wgpu::TextureView,
    fallback_depth: wgpu::TextureView,

    sphere_vertices: wgpu::Buffer,
    sphere_indices: wgpu::Buffer,
    sphere_index_count: u32,
    lights_buffer: wgpu::Buffer,

    state: RasterState,
    uniforms: DrawUniforms,
    current_shader: ShaderId,
    bound_textures: [Option<wgpu::TextureView>; 2],
    bound_depth: Option<wgpu::TextureView>,
    storage_output: Option<wgpu::TextureView>,
    pending: Option<PendingPass>,
}

impl WgpuDevice {
    pub fn new() -> Self {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .expect("adapter");

        info!("Using adapter: {:?}", adapter.get_info());

        let mut required_features = wgpu::Features::empty();
        if adapter
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE)
        {
            required_features |= wgpu::Features::FLOAT32_FILTERABLE;
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features,
                required_limits: wgpu::Limits::default(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .expect("device");

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("UniformLayout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX
                    | wgpu::ShaderStages::FRAGMENT
                    | wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let sampled_texture = wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        };
        let depth_texture = wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Depth,
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        };

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("TextureLayout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: sampled_texture,
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: sampled_texture,
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: depth_texture,
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let compute_texture_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("ComputeTextureLayout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: sampled_texture,
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: depth_texture,
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: true },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::Rgba16Float,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });

        let render_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("RenderPipelineLayout"),
                bind_group_layouts: &[&uniform_layout, &texture_layout],
                push_constant_ranges: &[],
            });
        let compute_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("ComputePipelineLayout"),
                bind_group_layouts: &[&uniform_layout, &compute_texture_layout],
                push_constant_ranges: &[],
            });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("LinearClamp"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let fallback_texture = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("FallbackTexture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());
        let fallback_depth = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("FallbackDepth"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: DEPTH_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor {
                aspect: wgpu::TextureAspect::DepthOnly,
                ..Default::default()
            });

        let (sphere_vertex_data, sphere_index_data) = build_sphere(SPHERE_STACKS, SPHERE_SLICES);
        let sphere_vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("LightVolumeVertices"),
            contents: bytemuck::cast_slice(&sphere_vertex_data),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let sphere_indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("LightVolumeIndices"),
            contents: bytemuck::cast_slice(&sphere_index_data),
            usage: wgpu::BufferUsages::INDEX,
        });

        let lights_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("TiledLights"),
            size: std::mem::size_of::<crate::renderer::lights::TiledLightsUniform>()
                as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut gpu = Self {
            device,
            queue,
            targets: HashMap::new(),
            next_target: 1,
            shaders: Vec::new(),
            shader_lookup: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            uniform_layout,
            texture_layout,
            compute_texture_layout,
            render_pipeline_layout,
            compute_pipeline_layout,
            sampler,
            fallback_texture,
            fallback_depth,
            sphere_vertices,
            sphere_indices,
            sphere_index_count: sphere_index_data.len() as u32,
            lights_buffer,
            state: RasterState::default(),
            uniforms: DrawUniforms::default(),
            current_shader: 0,
            bound_textures: [None, None],
            bound_depth: None,
            storage_output: None,
            pending: None,
        };

        // Shader id 0 is the fallback for unknown identifiers.
        gpu.register_shader("fallback", "", FALLBACK_WGSL, ShaderKind::Fullscreen);
        gpu
    }

    /// Compile and register a shader program variant. Re-registering an
    /// identifier/option pair replaces the module; pipelines built from the
    /// old module stay cached under the same id.
    pub fn register_shader(
        &mut self,
        identifier: &str,
        option: &str,
        source: &str,
        kind: ShaderKind,
    ) -> ShaderId {
        let color_writes = BUILTIN_SHADERS
            .iter()
            .find(|b| b.identifier == identifier && b.option == option)
            .map(|b| b.color_writes)
            .unwrap_or(wgpu::ColorWrites::ALL);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(identifier),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let id = self.shaders.len() as ShaderId;
        self.shaders.push(ShaderEntry {
            module,
            kind,
            color_writes,
        });
        self.shader_lookup
            .insert((identifier.to_owned(), option.to_owned()), id);
        id
    }

    fn ensure_render_pipeline(&mut self, key: PipelineKey) {
        if self.render_pipelines.contains_key(&key) {
            return;
        }
        let Some(entry) = self.shaders.get(key.shader as usize) else {
            warn!("Unknown shader id {} for pipeline", key.shader);
            return;
        };

        let blend = match key.state.blend {
            BlendMode::Disabled => None,
            BlendMode::Additive => Some(wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
            }),
            BlendMode::PremultipliedAlpha => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        };
        let color_targets: Vec<Option<wgpu::ColorTargetState>> = (0..key.attachment_count)
            .map(|_| {
                Some(wgpu::ColorTargetState {
                    format: key.color_format,
                    blend,
                    write_mask: entry.color_writes,
                })
            })
            .collect();

        const SPHERE_ATTRIBUTES: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x3,
            offset: 0,
            shader_location: 0,
        }];
        let vertex_buffers: Vec<wgpu::VertexBufferLayout<'_>> = match entry.kind {
            ShaderKind::Volume => vec![wgpu::VertexBufferLayout {
                array_stride: 12,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &SPHERE_ATTRIBUTES,
            }],
            _ => Vec::new(),
        };

        let depth_stencil = key.has_depth.then(|| wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: key.state.depth_write,
            depth_compare: compare_function(key.state.depth_func),
            stencil: stencil_state(key.state.stencil),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("ScenePipeline"),
                layout: Some(&self.render_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &entry.module,
                    entry_point: Some("vs_main"),
                    buffers: &vertex_buffers,
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &entry.module,
                    entry_point: Some("fs_main"),
                    targets: &color_targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: match key.state.cull {
                        CullMode::Back => Some(wgpu::Face::Back),
                        CullMode::Front => Some(wgpu::Face::Front),
                        CullMode::None => None,
                    },
                    front_face: match key.state.winding {
                        Winding::Ccw => wgpu::FrontFace::Ccw,
                        Winding::Cw => wgpu::FrontFace::Cw,
                    },
                    polygon_mode: wgpu::PolygonMode::Fill,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        self.render_pipelines.insert(key, pipeline);
    }

    fn ensure_compute_pipeline(&mut self, shader: ShaderId) {
        if self.compute_pipelines.contains_key(&shader) {
            return;
        }
        let Some(entry) = self.shaders.get(shader as usize) else {
            warn!("Unknown shader id {} for compute pipeline", shader);
            return;
        };
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("LightKernel"),
                layout: Some(&self.compute_pipeline_layout),
                module: &entry.module,
                entry_point: Some("cs_main"),
                compilation_options: Default::default(),
                cache: None,
            });
        self.compute_pipelines.insert(shader, pipeline);
    }

    fn uniform_bind_group(&self, uniforms: &DrawUniforms) -> wgpu::BindGroup {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("DrawUniforms"),
                contents: bytemuck::bytes_of(uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("DrawUniformsBind"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        })
    }

    fn texture_bind_group(&self, draw: &DrawCall) -> wgpu::BindGroup {
        let tex0 = draw.textures[0].as_ref().unwrap_or(&self.fallback_texture);
        let tex1 = draw.textures[1].as_ref().unwrap_or(&self.fallback_texture);
        let depth = draw.depth_texture.as_ref().unwrap_or(&self.fallback_depth);
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("DrawTexturesBind"),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(tex0),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(tex1),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(depth),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    /// Replay one recorded pass. Commands are split into segments at clear
    /// boundaries; each segment maps to one render pass whose load ops
    /// carry the clear.
    fn flush(&mut self, pass: PendingPass) {
        let Some(target) = self.targets.get(&pass.target) else {
            warn!("Dropping pass against deleted target {}", pass.target);
            return;
        };
        let color_format = target.color_format;
        let attachment_count = target.color_views.len() as u32;
        let has_depth = target.depth_attachment.is_some();

        // Segment the command stream and collect the pipeline keys it
        // needs before any encoder borrows begin.
        let mut segments: Vec<PassSegment> = Vec::new();
        let mut draws: Vec<&DrawCall> = Vec::new();
        let mut current = PassSegment {
            clear: ClearMask::empty(),
            draw_range: 0..0,
            depth_writable: false,
            stencil_writable: false,
        };
        for command in &pass.commands {
            match command {
                Command::Clear(mask) => {
                    if !current.draw_range.is_empty() {
                        segments.push(current);
                        current = PassSegment {
                            clear: ClearMask::empty(),
                            draw_range: draws.len()..draws.len(),
                            depth_writable: false,
                            stencil_writable: false,
                        };
                    }
                    current.clear |= *mask;
                    current.depth_writable |= mask.contains(ClearMask::DEPTH);
                    current.stencil_writable |= mask.contains(ClearMask::STENCIL);
                }
                Command::Draw(draw) => {
                    current.depth_writable |= draw.state.depth_write;
                    current.stencil_writable |=
                        matches!(draw.state.stencil, StencilMode::MarkDepthFail(_));
                    draws.push(draw);
                    current.draw_range.end = draws.len();
                }
            }
        }
        if !current.draw_range.is_empty() || !current.clear.is_empty() {
            segments.push(current);
        }

        let keys: Vec<PipelineKey> = draws
            .iter()
            .map(|draw| PipelineKey {
                shader: draw.shader,
                state: draw.state,
                color_format,
                attachment_count,
                has_depth,
            })
            .collect();
        let prepared: Vec<PreparedDraw> = draws
            .iter()
            .zip(&keys)
            .map(|(draw, key)| PreparedDraw {
                key: *key,
                uniform_bind: self.uniform_bind_group(&draw.uniforms),
                texture_bind: self.texture_bind_group(draw),
                stencil_reference: match draw.state.stencil {
                    StencilMode::MarkDepthFail(reference)
                    | StencilMode::TestNotEqual(reference) => reference as u32,
                    StencilMode::Disabled => 0,
                },
                geometry: draw.geometry,
            })
            .collect();
        for key in &keys {
            self.ensure_render_pipeline(*key);
        }

        // Re-borrow after the pipeline cache mutation.
        let Some(target) = self.targets.get(&pass.target) else {
            return;
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("PassEncoder"),
            });

        for segment in &segments {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = target
                .color_views
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: if segment.clear.contains(ClearMask::COLOR) {
                                wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();

            let depth_stencil_attachment =
                target
                    .depth_attachment
                    .as_ref()
                    .map(|view| wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: segment.depth_writable.then_some(wgpu::Operations {
                            load: if segment.clear.contains(ClearMask::DEPTH) {
                                wgpu::LoadOp::Clear(1.0)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: segment.stencil_writable.then_some(wgpu::Operations {
                            load: if segment.clear.contains(ClearMask::STENCIL) {
                                wgpu::LoadOp::Clear(0)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                    });

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("ScenePass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &prepared[segment.draw_range.clone()] {
                let Some(pipeline) = self.render_pipelines.get(&draw.key) else {
                    continue;
                };
                rpass.set_pipeline(pipeline);
                rpass.set_bind_group(0, &draw.uniform_bind, &[]);
                rpass.set_bind_group(1, &draw.texture_bind, &[]);
                rpass.set_stencil_reference(draw.stencil_reference);
                match draw.geometry {
                    DrawGeometry::Fullscreen => rpass.draw(0..3, 0..1),
                    DrawGeometry::Volume => {
                        rpass.set_vertex_buffer(0, self.sphere_vertices.slice(..));
                        rpass.set_index_buffer(
                            self.sphere_indices.slice(..),
                            wgpu::IndexFormat::Uint16,
                        );
                        rpass.draw_indexed(0..self.sphere_index_count, 0, 0..1);
                    }
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
    }

    fn record_draw(&mut self, geometry: DrawGeometry) {
        let draw = DrawCall {
            shader: self.current_shader,
            state: self.state,
            uniforms: self.uniforms,
            textures: self.bound_textures.clone(),
            depth_texture: self.bound_depth.clone(),
            geometry,
        };
        match self.pending.as_mut() {
            Some(pass) => pass.commands.push(Command::Draw(draw)),
            None => warn!("Draw issued outside start_draw/stop_draw"),
        }
    }
}

impl GraphicsDevice for WgpuDevice {
    fn caps(&self) -> DeviceCaps {
        let limits = self.device.limits();
        DeviceCaps {
            max_texture_size: limits.max_texture_dimension_2d,
            multi_attachment: limits.max_color_attachments >= 2,
        }
    }

    fn add_buffer(&mut self, desc: &TargetDesc) -> Result<TargetId, TargetError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(TargetError::Incomplete {
                label: desc.label,
                width: desc.width,
                height: desc.height,
                status: "zero-sized target".to_owned(),
            });
        }
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width > max || desc.height > max {
            return Err(TargetError::TooLarge {
                label: desc.label,
                width: desc.width,
                height: desc.height,
                max,
            });
        }

        let color_format = match desc.format {
            TargetFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TargetFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        };
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        if desc.format == TargetFormat::Rgba16Float {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        let size = wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        };
        let color_views = (0..desc.color_attachments.max(1))
            .map(|_| {
                self.device
                    .create_texture(&wgpu::TextureDescriptor {
                        label: Some(desc.label),
                        size,
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension: wgpu::TextureDimension::D2,
                        format: color_format,
                        usage,
                        view_formats: &[],
                    })
                    .create_view(&wgpu::TextureViewDescriptor::default())
            })
            .collect();

        let (depth_attachment, depth_sample) = match desc.depth {
            DepthSpec::None => (None, None),
            DepthSpec::OwnedTexture | DepthSpec::OwnedRenderbuffer => {
                let sampleable = desc.depth == DepthSpec::OwnedTexture;
                let mut depth_usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
                if sampleable {
                    depth_usage |= wgpu::TextureUsages::TEXTURE_BINDING;
                }
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(desc.label),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: DEPTH_FORMAT,
                    usage: depth_usage,
                    view_formats: &[],
                });
                let attachment = texture.create_view(&wgpu::TextureViewDescriptor::default());
                let sample = sampleable.then(|| {
                    texture.create_view(&wgpu::TextureViewDescriptor {
                        aspect: wgpu::TextureAspect::DepthOnly,
                        ..Default::default()
                    })
                });
                (Some(attachment), sample)
            }
            DepthSpec::SharedWith(owner) => {
                let Some(owner_target) = self.targets.get(&owner) else {
                    return Err(TargetError::UnknownSharedDepth {
                        label: desc.label,
                        shared_with: owner,
                    });
                };
                // Views are refcounted; the owner being deleted first
                // keeps the attachment alive until this target goes too.
                (
                    owner_target.depth_attachment.clone(),
                    owner_target.depth_sample.clone(),
                )
            }
        };

        let id = self.next_target;
        self.next_target += 1;
        self.targets.insert(
            id,
            GpuTarget {
                desc: desc.clone(),
                color_format,
                color_views,
                depth_attachment,
                depth_sample,
            },
        );
        Ok(id)
    }

    fn delete_buffer(&mut self, id: TargetId) {
        if self.targets.remove(&id).is_none() {
            warn!("delete_buffer on unknown target {}", id);
        }
    }

    fn start_draw(&mut self, id: TargetId) {
        if let Some(pass) = self.pending.take() {
            warn!("start_draw with a pass still open; flushing it");
            self.flush(pass);
        }
        self.pending = Some(PendingPass {
            target: id,
            commands: Vec::new(),
        });
    }

    fn stop_draw(&mut self) {
        match self.pending.take() {
            Some(pass) => self.flush(pass),
            None => warn!("stop_draw without start_draw"),
        }
    }

    fn clear(&mut self, mask: ClearMask) {
        match self.pending.as_mut() {
            Some(pass) => pass.commands.push(Command::Clear(mask)),
            None => warn!("clear issued outside start_draw/stop_draw"),
        }
    }

    fn set_depth(&mut self, func: DepthFunc, write: bool) {
        self.state.depth_func = func;
        self.state.depth_write = write;
    }

    fn set_stencil(&mut self, mode: StencilMode) {
        self.state.stencil = mode;
    }

    fn set_blend(&mut self, mode: BlendMode) {
        self.state.blend = mode;
    }

    fn set_cull(&mut self, mode: CullMode) {
        self.state.cull = mode;
    }

    fn set_front_face(&mut self, winding: Winding) {
        self.state.winding = winding;
    }

    fn get_shader(&mut self, identifier: &str, option: &str) -> ShaderId {
        let key = (identifier.to_owned(), option.to_owned());
        if let Some(&id) = self.shader_lookup.get(&key) {
            return id;
        }
        if let Some(builtin) = BUILTIN_SHADERS
            .iter()
            .find(|b| b.identifier == identifier && b.option == option)
        {
            return self.register_shader(identifier, option, builtin.source, builtin.kind);
        }
        warn!(
            "Unknown shader '{}' (option '{}'); using fallback",
            identifier, option
        );
        0
    }

    fn bind_shader(&mut self, shader: ShaderId) {
        self.current_shader = shader;
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        match (name, value) {
            ("model_view_proj", UniformValue::Mat4(m)) => {
                self.uniforms.model_view_proj = m.to_cols_array_2d();
            }
            ("inv_view_proj", UniformValue::Mat4(m)) => {
                self.uniforms.inv_view_proj = m.to_cols_array_2d();
            }
            ("camera_position", UniformValue::Vec3(v)) => {
                self.uniforms.camera_position = [v.x, v.y, v.z, 0.0];
            }
            ("light_position", UniformValue::Vec3(v)) => {
                self.uniforms.light_position[0] = v.x;
                self.uniforms.light_position[1] = v.y;
                self.uniforms.light_position[2] = v.z;
            }
            ("light_radius", UniformValue::Float(r)) => {
                self.uniforms.light_position[3] = r;
            }
            ("light_direction", UniformValue::Vec3(v)) => {
                self.uniforms.light_direction = [v.x, v.y, v.z, 0.0];
            }
            ("light_color", UniformValue::Vec3(v)) => {
                self.uniforms.light_color = [v.x, v.y, v.z, 0.0];
            }
            ("light_ambient", UniformValue::Vec3(v)) => {
                self.uniforms.light_ambient = [v.x, v.y, v.z, 0.0];
            }
            ("viewport", UniformValue::Vec2(v)) => {
                self.uniforms.viewport[0] = v.x;
                self.uniforms.viewport[1] = v.y;
            }
            ("inv_screen_size", UniformValue::Vec2(v)) => {
                self.uniforms.viewport[2] = v.x;
                self.uniforms.viewport[3] = v.y;
            }
            _ => {
                log::debug!("Unhandled uniform '{}'", name);
            }
        }
    }

    fn bind_target_texture(&mut self, name: &str, target: TargetId, attachment: u32) {
        let Some(gpu_target) = self.targets.get(&target) else {
            warn!("bind_target_texture on unknown target {}", target);
            return;
        };
        let Some(view) = gpu_target.color_views.get(attachment as usize) else {
            warn!(
                "Target {} has no color attachment {} ('{}')",
                target, attachment, name
            );
            return;
        };
        match name {
            "light_output" => self.storage_output = Some(view.clone()),
            "g_material" | "l_buffer" => self.bound_textures[1] = Some(view.clone()),
            _ => self.bound_textures[0] = Some(view.clone()),
        }
    }

    fn bind_target_depth(&mut self, name: &str, target: TargetId) {
        let Some(gpu_target) = self.targets.get(&target) else {
            warn!("bind_target_depth on unknown target {}", target);
            return;
        };
        match &gpu_target.depth_sample {
            Some(view) => self.bound_depth = Some(view.clone()),
            None => warn!(
                "Target {} ('{}', label '{}') has no sampleable depth",
                target, name, gpu_target.desc.label
            ),
        }
    }

    fn draw_fullscreen(&mut self) {
        self.record_draw(DrawGeometry::Fullscreen);
    }

    fn draw_light_volume(&mut self, model_view_proj: Mat4) {
        self.uniforms.model_view_proj = model_view_proj.to_cols_array_2d();
        self.record_draw(DrawGeometry::Volume);
    }

    fn upload_lights(&mut self, data: &[u8]) {
        let capacity = self.lights_buffer.size() as usize;
        let len = data.len().min(capacity);
        if data.len() > capacity {
            warn!(
                "Light upload of {} bytes truncated to buffer capacity {}",
                data.len(),
                capacity
            );
        }
        self.queue.write_buffer(&self.lights_buffer, 0, &data[..len]);
    }

    fn dispatch(&mut self, shader: ShaderId, groups_x: u32, groups_y: u32) {
        self.ensure_compute_pipeline(shader);
        let Some(pipeline) = self.compute_pipelines.get(&shader) else {
            return;
        };
        let Some(output) = self.storage_output.as_ref() else {
            warn!("dispatch without a bound output texture");
            return;
        };

        let uniform_bind = self.uniform_bind_group(&self.uniforms);
        let tex0 = self.bound_textures[0]
            .as_ref()
            .unwrap_or(&self.fallback_texture);
        let depth = self.bound_depth.as_ref().unwrap_or(&self.fallback_depth);
        let texture_bind = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ComputeBind"),
            layout: &self.compute_texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(tex0),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(depth),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.lights_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(output),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ComputeEncoder"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("LightKernel"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &uniform_bind, &[]);
            cpass.set_bind_group(1, &texture_bind, &[]);
            cpass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn finish(&mut self) {
        if let Some(pass) = self.pending.take() {
            self.flush(pass);
        }
        let _ = self.device.poll(wgpu::PollType::wait_indefinitely());
    }
}

fn compare_function(func: DepthFunc) -> wgpu::CompareFunction {
    match func {
        DepthFunc::Less => wgpu::CompareFunction::Less,
        DepthFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        DepthFunc::Equal => wgpu::CompareFunction::Equal,
        DepthFunc::Greater => wgpu::CompareFunction::Greater,
        DepthFunc::Always => wgpu::CompareFunction::Always,
    }
}

fn stencil_state(mode: StencilMode) -> wgpu::StencilState {
    match mode {
        StencilMode::Disabled => wgpu::StencilState::default(),
        StencilMode::MarkDepthFail(_) => {
            let face = wgpu::StencilFaceState {
                compare: wgpu::CompareFunction::Always,
                fail_op: wgpu::StencilOperation::Keep,
                depth_fail_op: wgpu::StencilOperation::Replace,
                pass_op: wgpu::StencilOperation::Keep,
            };
            wgpu::StencilState {
                front: face,
                back: face,
                read_mask: 0xFF,
                write_mask: 0xFF,
            }
        }
        StencilMode::TestNotEqual(_) => {
            let face = wgpu::StencilFaceState {
                compare: wgpu::CompareFunction::NotEqual,
                fail_op: wgpu::StencilOperation::Keep,
                depth_fail_op: wgpu::StencilOperation::Keep,
                pass_op: wgpu::StencilOperation::Keep,
            };
            wgpu::StencilState {
                front: face,
                back: face,
                read_mask: 0xFF,
                write_mask: 0,
            }
        }
    }
}

/// Unit-radius lat/long sphere used as the point light volume.
fn build_sphere(stacks: u32, slices: u32) -> (Vec<[f32; 3]>, Vec<u16>) {
    let mut vertices = Vec::with_capacity(((stacks + 1) * (slices + 1)) as usize);
    for stack in 0..=stacks {
        let phi = std::f32::consts::PI * stack as f32 / stacks as f32;
        let (sin_phi, cos_phi) = phi.sin_cos();
        for slice in 0..=slices {
            let theta = std::f32::consts::TAU * slice as f32 / slices as f32;
            let (sin_theta, cos_theta) = theta.sin_cos();
            vertices.push([sin_phi * cos_theta, cos_phi, sin_phi * sin_theta]);
        }
    }

    let ring = slices + 1;
    let mut indices = Vec::with_capacity((stacks * slices * 6) as usize);
    for stack in 0..stacks {
        for slice in 0..slices {
            let a = (stack * ring + slice) as u16;
            let b = a + 1;
            let c = a + ring as u16;
            let d = c + 1;
            indices.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }
    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_mesh_is_closed_and_unit_radius() {
        let (vertices, indices) = build_sphere(8, 12);
        assert_eq!(vertices.len(), 9 * 13);
        assert_eq!(indices.len() as u32, 8 * 12 * 6);
        for v in &vertices {
            let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            assert!((len - 1.0).abs() < 1e-4);
        }
        let max = *indices.iter().max().unwrap() as usize;
        assert!(max < vertices.len());
    }

    #[test]
    fn stencil_mark_writes_on_depth_fail() {
        let state = stencil_state(StencilMode::MarkDepthFail(1));
        assert_eq!(state.front.depth_fail_op, wgpu::StencilOperation::Replace);
        assert_eq!(state.write_mask, 0xFF);
    }

    #[test]
    fn stencil_test_is_read_only() {
        let state = stencil_state(StencilMode::TestNotEqual(0));
        assert_eq!(state.front.compare, wgpu::CompareFunction::NotEqual);
        assert_eq!(state.write_mask, 0);
    }
}
