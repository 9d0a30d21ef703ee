pub mod alpha;
pub mod camera;
pub mod device;
pub mod framebuffers;
pub mod gpu;
pub mod lights;
pub mod passes;
pub mod postprocess;
pub mod probes;
pub mod scene;
pub mod submissions;
pub mod targets;

pub use camera::CameraState;
pub use device::{DeviceCaps, GraphicsDevice, ShaderId, TargetId};
pub use gpu::WgpuDevice;
pub use lights::LightRecord;
pub use probes::{ProbeCadence, ProbeHandle};
pub use scene::{RendererStats, SceneRenderer};
pub use submissions::{Drawable, PassTag, SubmissionHandle};
