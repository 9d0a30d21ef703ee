//! Environment probes: secondary viewpoints re-rendered on a per-probe
//! cadence into their own buffer sets.

use glam::{Mat4, Vec3};

use crate::renderer::device::GraphicsDevice;
use crate::renderer::framebuffers::FrameBufferSet;
use crate::renderer::targets::{GenHandle, TargetArena};
use crate::settings::{RenderSettings, Resolution};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeCadence {
    /// Render while the counter is positive, then never again.
    Once { remaining: u32 },
    EveryFrame,
    /// Render every `frequency`-th frame, tracked by a countdown.
    Nth { frequency: u32, countdown: u32 },
}

impl ProbeCadence {
    pub fn once() -> Self {
        ProbeCadence::Once { remaining: 1 }
    }

    pub fn every_frame() -> Self {
        ProbeCadence::EveryFrame
    }

    pub fn nth(frequency: u32) -> Self {
        ProbeCadence::Nth {
            frequency,
            countdown: 0,
        }
    }

    /// Advance the cadence by one frame and report whether the probe
    /// re-renders this frame.
    pub fn should_render(&mut self) -> bool {
        match self {
            ProbeCadence::Once { remaining } => {
                if *remaining > 0 {
                    *remaining -= 1;
                    true
                } else {
                    false
                }
            }
            ProbeCadence::EveryFrame => true,
            ProbeCadence::Nth {
                frequency,
                countdown,
            } => {
                if *countdown == 0 {
                    *countdown = frequency.saturating_sub(1);
                    true
                } else {
                    *countdown -= 1;
                    false
                }
            }
        }
    }
}

pub struct EnvironmentProbe {
    pub position: Vec3,
    pub rotation: Mat4,
    pub cadence: ProbeCadence,
    pub capture_alpha: bool,
    pub buffers: FrameBufferSet,
}

pub type ProbeHandle = GenHandle<EnvironmentProbe>;

impl EnvironmentProbe {
    /// Provision a probe with its own buffer set. Probes render square and
    /// never run the display-side anti-alias resolve.
    pub fn new(
        device: &mut dyn GraphicsDevice,
        arena: &mut TargetArena,
        settings: &RenderSettings,
        size: u32,
        position: Vec3,
        rotation: Mat4,
        cadence: ProbeCadence,
        capture_alpha: bool,
    ) -> Self {
        let probe_settings = RenderSettings {
            anti_alias: crate::settings::AntiAliasSetting::Off,
            resolution: Resolution {
                width: size,
                height: size,
            },
            ..settings.clone()
        };
        let buffers = FrameBufferSet::provision(
            device,
            arena,
            (size, size),
            &probe_settings,
            capture_alpha,
        );
        Self {
            position,
            rotation,
            cadence,
            capture_alpha,
            buffers,
        }
    }

    /// Release the probe's buffer set.
    pub fn destroy(mut self, device: &mut dyn GraphicsDevice, arena: &mut TargetArena) {
        self.buffers.teardown(device, arena);
    }
}
