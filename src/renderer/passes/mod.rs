pub mod geometry;
pub mod lighting;
pub mod material;

pub use geometry::GeometryPass;
pub use lighting::{LightingStrategy, StencilVolumeLighting, TiledComputeLighting};
pub use material::MaterialPass;
