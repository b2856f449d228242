//! Interned property keys

use crate::error::Result;
use crate::realm::Realm;
use crate::release::Release;
use crate::sys::{self, qjs, RawAtom};
use std::ffi::c_char;
use std::fmt;
use std::sync::Arc;

/// A precomputed property key. Same ownership rules as [`crate::Value`].
#[derive(Clone)]
pub struct Atom(Arc<AtomInner>);

struct AtomInner {
    realm: Realm,
    raw: RawAtom,
}

impl Drop for AtomInner {
    fn drop(&mut self) {
        let realm = &self.realm;
        realm.runtime().inner().release(Release::Atom {
            ctx: realm.raw_context(),
            atom: self.raw,
        });
    }
}

impl Atom {
    pub(crate) fn new(realm: &Realm, name: &str) -> Result<Self> {
        let entered = realm.enter()?;
        let ctx = entered.ctx();
        let raw = unsafe { qjs::JS_NewAtomLen(ctx, name.as_ptr() as *const c_char, name.len() as _) };
        if raw == 0 {
            // JS_ATOM_NULL: the engine failed and left an exception behind.
            return Err(realm.take_exception());
        }
        Ok(Self::owned(realm, raw))
    }

    pub(crate) fn owned(realm: &Realm, raw: RawAtom) -> Self {
        Atom(Arc::new(AtomInner {
            realm: realm.clone(),
            raw,
        }))
    }

    pub(crate) fn raw(&self) -> RawAtom {
        self.0.raw
    }

    pub(crate) fn realm(&self) -> &Realm {
        &self.0.realm
    }

    pub fn name(&self) -> Result<String> {
        let realm = &self.0.realm;
        let entered = realm.enter()?;
        let ctx = entered.ctx();
        let text = realm.resolve(unsafe { qjs::JS_AtomToString(ctx, self.0.raw) })?;
        unsafe { sys::to_rust_string(ctx, text.raw()) }.ok_or_else(|| realm.take_exception())
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atom").field(&self.0.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;

    #[test]
    fn names_round_trip() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let atom = realm.new_atom("length").unwrap();
        assert_eq!(atom.name().unwrap(), "length");
        let copy = atom.clone();
        drop(atom);
        assert_eq!(copy.name().unwrap(), "length");
    }
}
