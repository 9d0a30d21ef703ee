use glam::{Mat4, Vec3};
use inferred_renderer::renderer::alpha::{AlphaSorter, ExtendedBounds, MAX_MASK_ID};
use inferred_renderer::renderer::camera::CameraState;
use inferred_renderer::renderer::submissions::SubmissionHandle;

/// Orthographic camera so screen rectangles are linear in world x/y and
/// overlap layouts can be stated exactly.
fn ortho_camera() -> CameraState {
    CameraState {
        projection: Mat4::orthographic_rh(-10.0, 10.0, -10.0, 10.0, 0.1, 100.0),
        viewport: (800, 600),
        ..CameraState::default()
    }
}

fn handle() -> SubmissionHandle {
    SubmissionHandle::dangling()
}

fn box_at(x: f32, z: f32) -> ExtendedBounds {
    let mut bounds = ExtendedBounds::new(Vec3::splat(-0.5), Vec3::splat(0.5));
    bounds.position = Vec3::new(x, 0.0, z);
    bounds
}

fn masks(sorter: &AlphaSorter) -> Vec<u8> {
    sorter.entries().iter().map(|e| e.mask).collect()
}

#[test]
fn chain_overlap_counts_nearer_intersectors_only() {
    // A overlaps B, B overlaps C, A and C are disjoint. Sorted near to
    // far as A, B, C: A keeps group 1, B counts A, C counts B.
    let mut sorter = AlphaSorter::default();
    sorter.begin_frame();
    sorter.push(handle(), 0, box_at(0.0, -5.0));
    sorter.push(handle(), 0, box_at(0.75, -6.0));
    sorter.push(handle(), 0, box_at(1.5, -7.0));
    sorter.sort_and_assign(&ortho_camera());

    assert_eq!(masks(&sorter), vec![1, 2, 2]);
}

#[test]
fn far_object_counts_every_nearer_overlap() {
    // B sits behind both A and C and overlaps both; A and C are disjoint.
    let mut sorter = AlphaSorter::default();
    sorter.begin_frame();
    sorter.push(handle(), 0, box_at(0.0, -5.0));
    sorter.push(handle(), 0, box_at(1.5, -6.0));
    sorter.push(handle(), 0, box_at(0.75, -7.0));
    sorter.sort_and_assign(&ortho_camera());

    assert_eq!(masks(&sorter), vec![1, 1, 3]);
}

#[test]
fn deep_stack_saturates_at_max_mask() {
    let mut sorter = AlphaSorter::default();
    sorter.begin_frame();
    for i in 0..10 {
        sorter.push(handle(), 0, box_at(0.0, -5.0 - i as f32));
    }
    sorter.sort_and_assign(&ortho_camera());

    let masks = masks(&sorter);
    for (i, &mask) in masks.iter().enumerate() {
        assert_eq!(mask, ((i as u8) + 1).min(MAX_MASK_ID));
    }
}

#[test]
fn behind_perspective_camera_is_sentinel_but_still_ordered() {
    let camera = CameraState {
        viewport: (800, 600),
        ..CameraState::default()
    };
    let mut sorter = AlphaSorter::default();
    sorter.begin_frame();
    sorter.push(handle(), 0, box_at(0.0, -5.0));
    sorter.push(handle(), 0, box_at(0.0, 20.0));
    sorter.sort_and_assign(&camera);

    assert_eq!(sorter.len(), 2);
    // Nearer object first, unprojectable one keeps the sentinel mask.
    assert_eq!(sorter.entries()[0].bounds.position.z, -5.0);
    assert_eq!(sorter.entries()[1].mask, MAX_MASK_ID);
}

#[test]
fn masks_are_recomputed_from_scratch_each_frame() {
    let mut sorter = AlphaSorter::default();
    sorter.begin_frame();
    sorter.push(handle(), 0, box_at(0.0, -5.0));
    sorter.push(handle(), 0, box_at(0.2, -7.0));
    sorter.sort_and_assign(&ortho_camera());
    assert_eq!(masks(&sorter), vec![1, 2]);

    // Next frame the pair no longer overlaps; no state leaks over.
    sorter.begin_frame();
    sorter.push(handle(), 0, box_at(-4.0, -5.0));
    sorter.push(handle(), 0, box_at(4.0, -7.0));
    sorter.sort_and_assign(&ortho_camera());
    assert_eq!(masks(&sorter), vec![1, 1]);
}

#[test]
fn ordering_follows_world_center_not_position() {
    // Offset the local box so the world center moves away from the raw
    // position; the sort must follow the transformed center.
    let mut near = ExtendedBounds::new(Vec3::new(-0.5, -0.5, -10.5), Vec3::new(0.5, 0.5, -9.5));
    near.position = Vec3::new(0.0, 0.0, 5.0);
    let far = box_at(0.0, -9.0);

    let mut sorter = AlphaSorter::default();
    sorter.begin_frame();
    sorter.push(handle(), 1, far);
    sorter.push(handle(), 2, near);
    sorter.sort_and_assign(&ortho_camera());

    // `near` has world center z = -5, closer than `far` at -9.
    assert_eq!(sorter.entries()[0].sub_object, 2);
    assert_eq!(sorter.entries()[1].sub_object, 1);
}
