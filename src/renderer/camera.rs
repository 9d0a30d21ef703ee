use glam::{Mat4, Vec3};

/// Camera state threaded through the pass pipeline for one frame.
///
/// Probes override and restore this wholesale, so everything the passes
/// read must live here rather than in globals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    pub position: Vec3,
    pub rotation: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub viewport: (u32, u32),
}

impl CameraState {
    pub fn new(position: Vec3, rotation: Mat4, projection: Mat4, near: f32) -> Self {
        Self {
            position,
            rotation,
            projection,
            near,
            viewport: (0, 0),
        }
    }

    pub fn view(&self) -> Mat4 {
        self.rotation * Mat4::from_translation(-self.position)
    }

    pub fn view_proj(&self) -> Mat4 {
        self.projection * self.view()
    }
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Mat4::IDENTITY,
            projection: Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0),
            near: 0.1,
            viewport: (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_translates_world_opposite_to_camera() {
        let cam = CameraState {
            position: Vec3::new(0.0, 0.0, 5.0),
            ..CameraState::default()
        };
        let view_space = cam.view().transform_point3(Vec3::ZERO);
        assert!((view_space.z - -5.0).abs() < 1e-6);
    }
}
