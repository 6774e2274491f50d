//! Change fan-out between the four observers of source state
//!
//! Every write is published by its originator and lands in the pending set of
//! every *other* observer. Each observer drains its own pending set
//! independently, so a change is delivered to each observer exactly once and
//! never echoes back to the observer that made it.

use crate::types::{ChangeSource, DirtyFlags};

/// Per-observer pending change sets
#[derive(Debug, Clone, Default)]
pub struct ChangeNotifier {
    pending: [DirtyFlags; ChangeSource::COUNT],
}

impl ChangeNotifier {
    /// Create a notifier with nothing pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `changes` made by `origin` to every other observer
    pub fn publish(&mut self, origin: ChangeSource, changes: DirtyFlags) {
        for observer in ChangeSource::ALL {
            if observer != origin {
                self.pending[observer.index()].insert(changes);
            }
        }
    }

    /// True if any of `mask` is pending for `observer`, without consuming it
    pub fn peek(&self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.pending[observer.index()].intersects(mask)
    }

    /// Consume `mask` for `observer`, returning whether any of it was pending
    pub fn pop(&mut self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        let slot = &mut self.pending[observer.index()];
        let was_pending = slot.intersects(mask);
        slot.remove(mask);
        was_pending
    }

    /// Consume everything pending for `observer`
    pub fn take(&mut self, observer: ChangeSource) -> DirtyFlags {
        std::mem::take(&mut self.pending[observer.index()])
    }

    /// Everything pending for `observer`, without consuming it
    pub fn pending(&self, observer: ChangeSource) -> DirtyFlags {
        self.pending[observer.index()]
    }
}
