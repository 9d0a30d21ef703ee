mod common;

use common::{Call, RecordingDevice};
use inferred_renderer::renderer::device::DeviceCaps;
use inferred_renderer::renderer::framebuffers::{DepthSource, FrameBufferSet};
use inferred_renderer::renderer::targets::TargetArena;
use inferred_renderer::settings::{AntiAliasSetting, RenderSettings};

fn provision(
    device: &mut RecordingDevice,
    arena: &mut TargetArena,
    settings: &RenderSettings,
) -> FrameBufferSet {
    FrameBufferSet::provision(device, arena, (1280, 720), settings, true)
}

#[test]
fn default_settings_provision_the_full_set() {
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &RenderSettings::default());

    assert!(set.geometry.is_some());
    assert!(set.alpha_geometry.is_some());
    assert!(set.light.is_some());
    assert!(set.alpha_light.is_some());
    assert!(set.scene.is_some());
    // Default anti-alias is FXAA, so the resolve buffer exists too.
    assert!(set.fxaa.is_some());
    assert_eq!(device.live_target_count(), 6);
}

#[test]
fn light_buffers_share_their_geometry_depth() {
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &RenderSettings::default());

    let geometry = set.geometry.unwrap();
    let light = set.light.unwrap();
    assert_eq!(light.depth, DepthSource::Shared(geometry.target));

    let alpha_geometry = set.alpha_geometry.unwrap();
    let alpha_light = set.alpha_light.unwrap();
    assert_eq!(alpha_light.depth, DepthSource::Shared(alpha_geometry.target));
}

#[test]
fn scene_shares_depth_only_on_matching_resolution() {
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &RenderSettings::default());
    let geometry_target = set.geometry.unwrap().target;
    assert_eq!(
        set.scene.unwrap().depth,
        DepthSource::Shared(geometry_target)
    );

    let scaled = RenderSettings {
        inferred_scale: 0.5,
        ..RenderSettings::default()
    };
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &scaled);
    assert_eq!(set.scene.unwrap().depth, DepthSource::Owned);
}

#[test]
fn teardown_releases_every_target() {
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let mut set = provision(&mut device, &mut arena, &RenderSettings::default());

    set.teardown(&mut device, &mut arena);

    assert_eq!(device.live_target_count(), 0);
    assert!(set.resolutions.is_none());
    assert!(set.geometry.is_none());
    assert_eq!(arena.len(), 0);
}

#[test]
fn reprovision_after_teardown_issues_fresh_handles() {
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let settings = RenderSettings::default();

    let mut first = provision(&mut device, &mut arena, &settings);
    let first_ids = first.target_ids(&arena);
    first.teardown(&mut device, &mut arena);
    let second = provision(&mut device, &mut arena, &settings);
    let second_ids = second.target_ids(&arena);

    assert_eq!(first_ids.len(), second_ids.len());
    for id in &second_ids {
        assert!(!first_ids.contains(id));
    }
    assert_eq!(device.live_target_count(), second_ids.len());
}

#[test]
fn missing_multi_attachment_support_skips_alpha_capture() {
    let mut device = RecordingDevice::with_caps(DeviceCaps {
        max_texture_size: 16384,
        multi_attachment: false,
    });
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &RenderSettings::default());

    assert!(set.alpha_geometry.is_none());
    assert!(set.alpha_light.is_none());
    assert!(set.geometry.is_some());
    // The geometry buffer drops to a single attachment.
    let single = device.count(|c| {
        matches!(
            c,
            Call::AddBuffer {
                label: "geometry",
                attachments: 1,
                ..
            }
        )
    });
    assert_eq!(single, 1);
}

#[test]
fn oversized_window_degrades_instead_of_panicking() {
    let mut device = RecordingDevice::with_caps(DeviceCaps {
        max_texture_size: 512,
        multi_attachment: true,
    });
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &RenderSettings::default());

    // Every allocation fails; the set comes back empty but intact.
    assert!(set.geometry.is_none());
    assert!(set.light.is_none());
    assert!(set.scene.is_none());
    assert_eq!(device.live_target_count(), 0);
}

#[test]
fn ssaa_scene_buffer_requests_mipmaps() {
    let settings = RenderSettings {
        anti_alias: AntiAliasSetting::Ssaa,
        ssaa_factor: 2,
        ..RenderSettings::default()
    };
    let mut device = RecordingDevice::new();
    let mut arena = TargetArena::default();
    let set = provision(&mut device, &mut arena, &settings);

    assert!(set.scene.unwrap().auto_mipmap);
    // SSAA renders at factor x window; no FXAA resolve buffer.
    assert!(set.fxaa.is_none());
    let res = set.resolutions.unwrap();
    assert_eq!(res.display, (2560, 1440));
}
