pub mod renderer;
pub mod settings;

pub use renderer::{
    CameraState, Drawable, GraphicsDevice, LightRecord, PassTag, ProbeCadence, SceneRenderer,
    WgpuDevice,
};
pub use settings::RenderSettings;

/// Install the default logger. Call once at startup; later calls are
/// ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
