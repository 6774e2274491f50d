//! Registration-ordered storage for sources
//!
//! Sources are addressed by a [`SourceHandle`] (slot index plus generation)
//! so a stale handle held by a removed source's host can never reach the
//! source that later reuses its slot.

use crate::source::Source;

/// Stable reference to a registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    index: u32,
    generation: u32,
}

impl SourceHandle {
    /// Slot index, only meaningful for diagnostics
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl std::fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    source: Option<Source>,
}

/// Registered sources in registration order
#[derive(Debug, Default)]
pub struct SourceRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live handles in registration order
    order: Vec<SourceHandle>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source at the end of the order
    pub fn insert(&mut self, source: Source) -> SourceHandle {
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.source = Some(source);
                SourceHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, source: Some(source) });
                SourceHandle { index, generation: 0 }
            }
        };
        self.order.push(handle);
        handle
    }

    /// Unregister a source, keeping the relative order of the rest
    pub fn remove(&mut self, handle: SourceHandle) -> Option<Source> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let source = slot.source.take()?;
        self.free.push(handle.index);
        self.order.retain(|h| *h != handle);
        Some(source)
    }

    pub fn contains(&self, handle: SourceHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: SourceHandle) -> Option<&Source> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.source.as_ref())
    }

    pub fn get_mut(&mut self, handle: SourceHandle) -> Option<&mut Source> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.source.as_mut())
    }

    /// Handles in registration order
    pub fn handles(&self) -> &[SourceHandle] {
        &self.order
    }

    /// Sources in registration order
    pub fn iter(&self) -> impl Iterator<Item = (SourceHandle, &Source)> + '_ {
        self.order
            .iter()
            .filter_map(move |&handle| self.get(handle).map(|source| (handle, source)))
    }

    /// Visit every source mutably in registration order
    pub fn for_each_mut(&mut self, mut f: impl FnMut(SourceHandle, &mut Source)) {
        for i in 0..self.order.len() {
            let handle = self.order[i];
            if let Some(source) = self.slots[handle.index as usize].source.as_mut() {
                f(handle, source);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Highest source id in use, 0 when empty
    pub fn max_source_id(&self) -> i32 {
        self.iter().map(|(_, source)| source.source_id()).max().unwrap_or(0)
    }
}
