//! Deferred release of engine references
//!
//! Wrappers dropped on a thread that does not own the runtime (or while an
//! engine finalizer is running) cannot touch the engine. Their references
//! are queued here and released by the owner in FIFO order, which keeps
//! values ahead of the contexts they belong to.

use crate::sys::{self, qjs, RawAtom, RawContext, RawValue};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::{Mutex, Weak};

use crate::realm::RealmInner;

pub(crate) enum Release {
    Value { ctx: RawContext, raw: RawValue },
    Atom { ctx: RawContext, atom: RawAtom },
    Context(RawContext),
}

// SAFETY: a queued release is only performed by the owning thread.
unsafe impl Send for Release {}

impl Release {
    /// # Safety
    /// Owner thread only, with the runtime still alive.
    pub(crate) unsafe fn perform(self) {
        match self {
            Release::Value { ctx, raw } => sys::free(ctx.as_ptr(), raw),
            Release::Atom { ctx, atom } => qjs::JS_FreeAtom(ctx.as_ptr(), atom),
            Release::Context(ctx) => {
                let ctx = ctx.as_ptr();
                let back = qjs::JS_GetContextOpaque(ctx) as *const RealmInner;
                qjs::JS_SetContextOpaque(ctx, std::ptr::null_mut::<c_void>());
                if !back.is_null() {
                    drop(Weak::from_raw(back));
                }
                qjs::JS_FreeContext(ctx);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ReleaseQueue {
    pending: Mutex<VecDeque<Release>>,
}

impl ReleaseQueue {
    pub(crate) fn push(&self, release: Release) {
        self.lock().push_back(release);
    }

    pub(crate) fn take_all(&self) -> VecDeque<Release> {
        std::mem::take(&mut *self.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Release>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}
