//! Generation-checked arenas for render targets and other renderer-owned
//! slots. A stale handle (kept across a remove) resolves to `None` instead
//! of aliasing whatever was recycled into the slot.

use std::marker::PhantomData;

use crate::renderer::device::{TargetDesc, TargetId};

// Manual impls so handles stay Copy/Eq regardless of T.
pub struct GenHandle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GenHandle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Handle that resolves to nothing; placeholder for tests and
    /// not-yet-registered entries.
    pub fn dangling() -> Self {
        Self::new(u32::MAX, u32::MAX)
    }
}

impl<T> Copy for GenHandle<T> {}
impl<T> Clone for GenHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for GenHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for GenHandle<T> {}
impl<T> std::hash::Hash for GenHandle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> std::fmt::Debug for GenHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GenHandle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct GenArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for GenArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> GenArena<T> {
    pub fn insert(&mut self, value: T) -> GenHandle<T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            GenHandle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            GenHandle::new(index, 0)
        }
    }

    pub fn get(&self, handle: GenHandle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: GenHandle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Remove the value and bump the slot generation so outstanding
    /// handles to it stop resolving.
    pub fn remove(&mut self, handle: GenHandle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (GenHandle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (GenHandle::new(i as u32, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (GenHandle<T>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_mut()
                .map(|v| (GenHandle::new(i as u32, slot.generation), v))
        })
    }

    pub fn handles(&self) -> Vec<GenHandle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }
}

/// An allocated render target plus the descriptor it was created from,
/// kept for diagnostics and reprovisioning checks.
pub struct TargetEntry {
    pub id: TargetId,
    pub desc: TargetDesc,
}

/// Validated, non-owning reference to an allocated target. Shared
/// depth/stencil attachments are expressed as these instead of raw ids so
/// a resize can never leave a dangling reference behind.
pub type TargetRef = GenHandle<TargetEntry>;

pub type TargetArena = GenArena<TargetEntry>;
