use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Upper bound on lights consumed by one tiled compute dispatch.
pub const MAX_TILED_LIGHTS: usize = 128;
/// Tile edge length in pixels for the tiled lighting back-end.
pub const TILE_SIZE: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightKind {
    Point,
    /// Reserved; treated like a point light until spot shading lands.
    Spot,
    Directional,
}

/// Scene-owned light description. The renderer only reads these.
#[derive(Clone, Copy, Debug)]
pub struct LightRecord {
    pub kind: LightKind,
    pub position: Vec3,
    pub radius: f32,
    pub direction: Vec3,
    pub color: Vec3,
    pub ambient: Option<Vec3>,
    pub enabled: bool,
}

impl LightRecord {
    pub fn point(position: Vec3, radius: f32, color: Vec3) -> Self {
        Self {
            kind: LightKind::Point,
            position,
            radius,
            direction: Vec3::NEG_Z,
            color,
            ambient: None,
            enabled: true,
        }
    }

    pub fn directional(direction: Vec3, color: Vec3) -> Self {
        Self {
            kind: LightKind::Directional,
            position: Vec3::ZERO,
            radius: 0.0,
            direction: direction.normalize_or_zero(),
            color,
            ambient: None,
            enabled: true,
        }
    }

    pub fn with_ambient(mut self, ambient: Vec3) -> Self {
        self.ambient = Some(ambient);
        self
    }
}

/// Whether the camera sits inside a point light's bounding sphere.
///
/// Inner lights are drawn with the inverted depth technique, outer lights
/// with the two-pass stencil volume. Recomputed every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeClass {
    Inner,
    Outer,
}

pub fn classify_point_light(camera_position: Vec3, near: f32, light: &LightRecord) -> VolumeClass {
    if camera_position.distance(light.position) - near <= light.radius {
        VolumeClass::Inner
    } else {
        VolumeClass::Outer
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct TiledLightRaw {
    pub position_radius: [f32; 4],
    pub color_kind: [f32; 4],
    pub direction: [f32; 4],
    pub ambient: [f32; 4],
}

impl TiledLightRaw {
    pub fn from_record(record: &LightRecord) -> Self {
        let kind = match record.kind {
            LightKind::Point => 0.0,
            LightKind::Spot => 1.0,
            LightKind::Directional => 2.0,
        };
        let ambient = record.ambient.unwrap_or(Vec3::ZERO);
        Self {
            position_radius: [
                record.position.x,
                record.position.y,
                record.position.z,
                record.radius,
            ],
            color_kind: [record.color.x, record.color.y, record.color.z, kind],
            direction: [
                record.direction.x,
                record.direction.y,
                record.direction.z,
                0.0,
            ],
            ambient: [ambient.x, ambient.y, ambient.z, 0.0],
        }
    }
}

/// Single-buffer light upload for the tiled kernel, mirroring the
/// accumulation inputs of the rasterized path.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct TiledLightsUniform {
    pub counts: [u32; 4],
    pub lights: [TiledLightRaw; MAX_TILED_LIGHTS],
}

impl TiledLightsUniform {
    pub fn from_records(records: &[LightRecord]) -> Self {
        let mut uniform = Self::zeroed();
        let mut count = 0usize;
        for record in records.iter().filter(|l| l.enabled) {
            if count == MAX_TILED_LIGHTS {
                log::warn!(
                    "Tiled lighting truncated to {} lights ({} submitted)",
                    MAX_TILED_LIGHTS,
                    records.len()
                );
                break;
            }
            uniform.lights[count] = TiledLightRaw::from_record(record);
            count += 1;
        }
        uniform.counts[0] = count as u32;
        uniform
    }
}
