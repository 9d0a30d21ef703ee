//! Drawable registration. Model and particle owners register their
//! submissions before a frame and unregister on deletion; the renderer
//! holds only generation-checked handles, never owning references to the
//! scene objects themselves.

use bitflags::bitflags;

use crate::renderer::alpha::ExtendedBounds;
use crate::renderer::device::GraphicsDevice;
use crate::renderer::targets::{GenArena, GenHandle};

bitflags! {
    /// Pass tag composed into every draw callback. The pass bits say which
    /// stage is rasterizing; the mode bits say which output the stage is
    /// rendering for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PassTag: u32 {
        const GEOMETRY = 1 << 0;
        const MATERIAL = 1 << 1;
        /// Set while rendering into an environment probe's buffer set.
        const PROBE    = 1 << 4;
    }
}

/// A renderable unit. Opaque submissions are drawn in registration order;
/// alpha submissions additionally expose bounds for the sorter and receive
/// the per-frame mask id.
pub trait Drawable {
    fn draw(&mut self, device: &mut dyn GraphicsDevice, pass: PassTag, sub_object: u32, mask: u8);

    fn sub_object_count(&self) -> u32 {
        1
    }

    /// Bounds for one alpha sub-object; `None` marks it opaque-only.
    fn alpha_bounds(&self, _sub_object: u32) -> Option<ExtendedBounds> {
        None
    }
}

pub type SubmissionHandle = GenHandle<Box<dyn Drawable>>;

/// Bare draw callback invoked after the registered submissions of a pass;
/// used for immediate-mode debug geometry and particle systems.
pub type RawDrawCallback = Box<dyn FnMut(&mut dyn GraphicsDevice, PassTag)>;

/// Registered draw submissions, split by blend class. Handles stay valid
/// until `unregister`; a handle kept past that never aliases a recycled
/// slot.
#[derive(Default)]
pub struct SubmissionRegistry {
    opaque: GenArena<Box<dyn Drawable>>,
    alpha: GenArena<Box<dyn Drawable>>,
}

impl SubmissionRegistry {
    pub fn register_opaque(&mut self, drawable: Box<dyn Drawable>) -> SubmissionHandle {
        self.opaque.insert(drawable)
    }

    pub fn register_alpha(&mut self, drawable: Box<dyn Drawable>) -> SubmissionHandle {
        self.alpha.insert(drawable)
    }

    pub fn unregister_opaque(&mut self, handle: SubmissionHandle) -> bool {
        self.opaque.remove(handle).is_some()
    }

    pub fn unregister_alpha(&mut self, handle: SubmissionHandle) -> bool {
        self.alpha.remove(handle).is_some()
    }

    pub fn opaque_iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (SubmissionHandle, &mut Box<dyn Drawable>)> {
        self.opaque.iter_mut()
    }

    pub fn alpha_iter(&self) -> impl Iterator<Item = (SubmissionHandle, &Box<dyn Drawable>)> {
        self.alpha.iter()
    }

    pub fn alpha_get_mut(&mut self, handle: SubmissionHandle) -> Option<&mut Box<dyn Drawable>> {
        self.alpha.get_mut(handle)
    }

    pub fn opaque_len(&self) -> usize {
        self.opaque.len()
    }

    pub fn alpha_len(&self) -> usize {
        self.alpha.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl Drawable for Nothing {
        fn draw(
            &mut self,
            _device: &mut dyn GraphicsDevice,
            _pass: PassTag,
            _sub_object: u32,
            _mask: u8,
        ) {
        }
    }

    #[test]
    fn unregistered_handle_stops_resolving() {
        let mut registry = SubmissionRegistry::default();
        let handle = registry.register_alpha(Box::new(Nothing));
        assert_eq!(registry.alpha_len(), 1);
        assert!(registry.unregister_alpha(handle));
        assert!(!registry.unregister_alpha(handle));
        assert!(registry.alpha_get_mut(handle).is_none());
    }

    #[test]
    fn opaque_and_alpha_pools_are_independent() {
        let mut registry = SubmissionRegistry::default();
        let opaque = registry.register_opaque(Box::new(Nothing));
        assert!(!registry.unregister_alpha(opaque));
        assert!(registry.unregister_opaque(opaque));
    }
}
