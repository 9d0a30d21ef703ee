//! Alpha submission ordering and blend-group mask assignment.
//!
//! Transparent objects are sorted by camera distance and then split into
//! blend groups by screen-space bounding-rectangle overlap. The rectangle
//! test is a deliberate approximation of polygon overlap (a separating-axis
//! test would be exact, TODO if overlap artifacts ever show up in
//! practice); keep the AABB behavior as-is.

use glam::{Mat4, Vec2, Vec3};

use crate::renderer::camera::CameraState;
use crate::renderer::submissions::SubmissionHandle;

/// Number of distinguishable blend groups. The top value doubles as the
/// sentinel for objects whose bounds never project onto the screen.
pub const MAX_MASK_ID: u8 = 7;

/// World-space bounding box extended with the transform of its owner:
/// local corners go through `view`, then are offset by `position`.
#[derive(Clone, Copy, Debug)]
pub struct ExtendedBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub view: Mat4,
    pub position: Vec3,
}

impl ExtendedBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min,
            max,
            view: Mat4::IDENTITY,
            position: Vec3::ZERO,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn world_center(&self) -> Vec3 {
        self.view.transform_point3(self.center()) + self.position
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, hi.z),
            Vec3::new(hi.x, hi.y, hi.z),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenRect {
    pub min: Vec2,
    pub max: Vec2,
}

impl ScreenRect {
    pub fn intersects(&self, other: &ScreenRect) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AlphaOrderEntry {
    pub submission: SubmissionHandle,
    pub sub_object: u32,
    pub bounds: ExtendedBounds,
    /// 0 = unassigned, 1..=MAX_MASK_ID = blend group; recomputed every
    /// frame, never persisted.
    pub mask: u8,
}

/// Project the eight box corners into screen space and build the clamped
/// axis-aligned rectangle of the corners that survive projection. Returns
/// `None` when every corner is behind the camera or degenerate.
pub fn project_rect(bounds: &ExtendedBounds, camera: &CameraState) -> Option<ScreenRect> {
    let view_proj = camera.view_proj();
    let (vw, vh) = (camera.viewport.0 as f32, camera.viewport.1 as f32);
    if vw <= 0.0 || vh <= 0.0 {
        return None;
    }

    let mut rect: Option<ScreenRect> = None;
    for corner in bounds.corners() {
        let world = bounds.view.transform_point3(corner) + bounds.position;
        let clip = view_proj * world.extend(1.0);
        if clip.w <= f32::EPSILON {
            continue;
        }
        let ndc = clip.truncate() / clip.w;
        let screen = Vec2::new((ndc.x * 0.5 + 0.5) * vw, (0.5 - ndc.y * 0.5) * vh);
        rect = Some(match rect {
            Some(r) => ScreenRect {
                min: r.min.min(screen),
                max: r.max.max(screen),
            },
            None => ScreenRect {
                min: screen,
                max: screen,
            },
        });
    }

    rect.map(|r| ScreenRect {
        min: r.min.clamp(Vec2::ZERO, Vec2::new(vw, vh)),
        max: r.max.clamp(Vec2::ZERO, Vec2::new(vw, vh)),
    })
}

#[derive(Default)]
pub struct AlphaSorter {
    entries: Vec<AlphaOrderEntry>,
    rects: Vec<Option<ScreenRect>>,
    overlaps: Vec<usize>,
}

impl AlphaSorter {
    pub fn begin_frame(&mut self) {
        self.entries.clear();
        self.rects.clear();
    }

    pub fn push(&mut self, submission: SubmissionHandle, sub_object: u32, bounds: ExtendedBounds) {
        self.entries.push(AlphaOrderEntry {
            submission,
            sub_object,
            bounds,
            mask: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending camera distance. The material pass iterates
    /// this in reverse for back-to-front blending.
    pub fn iter_front_to_back(&self) -> impl DoubleEndedIterator<Item = &AlphaOrderEntry> {
        self.entries.iter()
    }

    pub fn iter_back_to_front(&self) -> impl DoubleEndedIterator<Item = &AlphaOrderEntry> {
        self.entries.iter().rev()
    }

    pub fn entries(&self) -> &[AlphaOrderEntry] {
        &self.entries
    }

    /// Sort by camera distance, project every entry to a screen rectangle,
    /// and assign blend-group masks from rectangle overlap. O(n^2) in the
    /// number of alpha objects; fine for the expected handful of
    /// simultaneously visible transparent objects.
    pub fn sort_and_assign(&mut self, camera: &CameraState) {
        self.entries.sort_by(|a, b| {
            let da = a.bounds.world_center().distance_squared(camera.position);
            let db = b.bounds.world_center().distance_squared(camera.position);
            da.total_cmp(&db)
        });

        self.rects.clear();
        self.rects
            .extend(self.entries.iter().map(|e| project_rect(&e.bounds, camera)));

        for index in 0..self.entries.len() {
            self.entries[index].mask = self.assign_mask(index);
        }
    }

    fn assign_mask(&mut self, index: usize) -> u8 {
        let Some(rect) = self.rects[index] else {
            // Unprojectable objects still draw, but blend-group
            // separation is undefined for them.
            return MAX_MASK_ID;
        };

        self.overlaps.clear();
        for (other, other_rect) in self.rects.iter().enumerate() {
            if other == index {
                continue;
            }
            if let Some(other_rect) = other_rect {
                if rect.intersects(other_rect) {
                    self.overlaps.push(other);
                }
            }
        }

        if self.overlaps.is_empty() {
            return 1;
        }

        let mut mask = 1u8;
        for &other in &self.overlaps {
            if other < index {
                mask = mask.saturating_add(1);
            } else {
                break;
            }
        }
        mask.min(MAX_MASK_ID)
    }
}
