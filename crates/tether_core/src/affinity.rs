//! Thread affinity
//!
//! An engine runtime is not thread-safe. Exactly one thread (the owner) may
//! call into it; other threads hand work over instead. The owner starts as
//! the creating thread and moves to whichever thread enters the drive loop,
//! but never while the current owner is still inside the engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::thread::{self, ThreadId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AffinityError {
    #[error("the event loop is already being driven by another caller")]
    AlreadyDriving,

    #[error("the owning thread is still inside the engine")]
    OwnerBusy,

    #[error("the calling thread does not own the runtime")]
    NotOwner,
}

/// Tracks the owning thread of a runtime and whether its loop is running.
#[derive(Debug)]
pub struct ThreadAffinity {
    owner: RwLock<ThreadId>,
    driving: AtomicBool,
    /// Open `EngineGuard`s held by the owner thread.
    active: AtomicUsize,
}

impl ThreadAffinity {
    /// The calling thread becomes the owner.
    pub fn new() -> Self {
        Self {
            owner: RwLock::new(thread::current().id()),
            driving: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        }
    }

    pub fn owner(&self) -> ThreadId {
        *self.owner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_owner(&self) -> bool {
        self.owner() == thread::current().id()
    }

    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::Acquire)
    }

    /// True while the owner holds at least one [`EngineGuard`].
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Marks the calling thread as executing engine code until the guard is
    /// dropped. Only the owner may enter; guards nest.
    pub fn enter(&self) -> Result<EngineGuard<'_>, AffinityError> {
        // The owner check and the increment happen under the read lock so a
        // concurrent `claim` observes either no guard or the old owner.
        let owner = self.owner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *owner != thread::current().id() {
            return Err(AffinityError::NotOwner);
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(EngineGuard { affinity: self })
    }

    /// Marks the calling thread as the driver and owner until the guard is
    /// dropped. Reports whether ownership moved to a new thread.
    ///
    /// Ownership only moves while the previous owner holds no
    /// [`EngineGuard`]; otherwise the claim fails with `OwnerBusy`.
    pub fn claim(&self) -> Result<DriveGuard<'_>, AffinityError> {
        if self
            .driving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AffinityError::AlreadyDriving);
        }

        let current = thread::current().id();
        let mut owner = self.owner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let moved = *owner != current;
        if moved && self.is_active() {
            self.driving.store(false, Ordering::Release);
            return Err(AffinityError::OwnerBusy);
        }
        *owner = current;

        Ok(DriveGuard {
            affinity: self,
            moved,
        })
    }
}

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of a drive loop.
#[derive(Debug)]
pub struct DriveGuard<'a> {
    affinity: &'a ThreadAffinity,
    moved: bool,
}

impl DriveGuard<'_> {
    /// True when the claim changed the owning thread.
    pub fn moved(&self) -> bool {
        self.moved
    }
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.affinity.driving.store(false, Ordering::Release);
    }
}

/// Held by the owner thread while it executes engine code.
#[derive(Debug)]
pub struct EngineGuard<'a> {
    affinity: &'a ThreadAffinity,
}

impl Drop for EngineGuard<'_> {
    fn drop(&mut self) {
        self.affinity.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn creator_is_owner() {
        let affinity = ThreadAffinity::new();
        assert!(affinity.is_owner());
        assert!(!affinity.is_driving());
    }

    #[test]
    fn claim_is_exclusive() {
        let affinity = ThreadAffinity::new();
        let guard = affinity.claim().unwrap();
        assert!(!guard.moved());
        assert!(affinity.is_driving());
        assert_eq!(affinity.claim().unwrap_err(), AffinityError::AlreadyDriving);
        drop(guard);
        assert!(!affinity.is_driving());
        assert!(affinity.claim().is_ok());
    }

    #[test]
    fn claim_from_other_thread_moves_owner() {
        let affinity = Arc::new(ThreadAffinity::new());
        let remote = Arc::clone(&affinity);
        let moved = std::thread::spawn(move || {
            let guard = remote.claim().unwrap();
            assert!(remote.is_owner());
            guard.moved()
        })
        .join()
        .unwrap();

        assert!(moved);
        assert!(!affinity.is_owner());
    }

    #[test]
    fn only_the_owner_enters() {
        let affinity = Arc::new(ThreadAffinity::new());
        let outer = affinity.enter().unwrap();
        let inner = affinity.enter().unwrap();
        assert!(affinity.is_active());
        drop(inner);
        assert!(affinity.is_active());
        drop(outer);
        assert!(!affinity.is_active());

        let remote = Arc::clone(&affinity);
        let err = std::thread::spawn(move || remote.enter().err())
            .join()
            .unwrap();
        assert_eq!(err, Some(AffinityError::NotOwner));
    }

    #[test]
    fn ownership_stays_while_owner_is_inside() {
        let affinity = Arc::new(ThreadAffinity::new());
        let guard = affinity.enter().unwrap();

        let remote = Arc::clone(&affinity);
        let err = std::thread::spawn(move || remote.claim().err())
            .join()
            .unwrap();
        assert_eq!(err, Some(AffinityError::OwnerBusy));
        assert!(affinity.is_owner());
        assert!(!affinity.is_driving());

        // Re-entering the loop from inside the engine keeps the same owner.
        assert!(affinity.claim().is_ok());
        drop(guard);

        let remote = Arc::clone(&affinity);
        assert!(std::thread::spawn(move || remote.claim().map(|g| g.moved()))
            .join()
            .unwrap()
            .unwrap());
    }
}
