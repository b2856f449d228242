//! Opaque handle registries
//!
//! An engine can only carry plain integers through its opaque slots, so host
//! closures are parked in a table keyed by a random id and looked up again
//! when the engine calls back. Ids are drawn at random (never sequential) and
//! checked for collision under the table's write lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::num::NonZeroUsize;

/// Identifier of a pinned entry. Never zero, so it can travel through a
/// nullable pointer slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(NonZeroUsize);

impl HandleId {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            if let Some(id) = NonZeroUsize::new(rng.gen()) {
                return Self(id);
            }
        }
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Rebuilds an id from a raw integer; zero is not a valid id.
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({:#x})", self.0)
    }
}

/// Thread-safe map from [`HandleId`] to a pinned host value.
pub struct HandleRegistry<T> {
    name: &'static str,
    entries: DashMap<HandleId, T>,
}

impl<T> HandleRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
        }
    }

    /// Stores `value` under a fresh id that is not live in this registry.
    pub fn pin(&self, value: T) -> HandleId {
        loop {
            let id = HandleId::random();
            match self.entries.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(value);
                    tracing::trace!(registry = self.name, ?id, "pinned");
                    return id;
                }
            }
        }
    }

    /// Removes and returns the entry. Returns `None` if it was never pinned
    /// or has already been unpinned.
    pub fn unpin(&self, id: HandleId) -> Option<T> {
        let removed = self.entries.remove(&id).map(|(_, value)| value);
        if removed.is_some() {
            tracing::trace!(registry = self.name, ?id, "unpinned");
        }
        removed
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Clones the entry out so the caller never runs it under the table lock.
    pub fn lookup(&self, id: HandleId) -> Option<T> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }
}

impl<T> fmt::Debug for HandleRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .finish()
    }
}
