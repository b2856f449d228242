//! Realms (engine contexts)
//!
//! Each realm owns one engine context with its own global object. The
//! context's opaque slot holds a weak pointer back to the realm so engine
//! callbacks can find it; the slot is cleared before the context is freed.

use crate::atom::Atom;
use crate::class;
use crate::convert::IntoJs;
use crate::error::{Error, Result, ScriptError};
use crate::pins::Finalizer;
use crate::release::Release;
use crate::runtime::Runtime;
use crate::sys::{self, qjs, RawContext, RawValue, ThrowKind};
use crate::value::Value;
use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use tether_core::EngineGuard;

#[derive(Clone)]
pub struct Realm(Arc<RealmInner>);

pub(crate) struct RealmInner {
    runtime: Runtime,
    ctx: RawContext,
}

impl Drop for RealmInner {
    fn drop(&mut self) {
        tracing::trace!("realm released");
        self.runtime.inner().release(Release::Context(self.ctx));
    }
}

/// A realm's context pointer, valid for engine calls while this is alive.
pub(crate) struct Entered<'a> {
    ctx: *mut qjs::JSContext,
    _engine: EngineGuard<'a>,
}

impl Entered<'_> {
    pub(crate) fn ctx(&self) -> *mut qjs::JSContext {
        self.ctx
    }
}

/// Configuration step applied to a freshly created realm.
#[derive(Clone)]
pub struct RealmOption(Arc<dyn Fn(&Realm) -> Result<()> + Send + Sync>);

impl RealmOption {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&Realm) -> Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(apply))
    }

    pub(crate) fn apply(&self, realm: &Realm) -> Result<()> {
        (self.0)(realm)
    }
}

impl fmt::Debug for RealmOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RealmOption")
    }
}

impl Realm {
    pub(crate) fn create(runtime: &Runtime) -> Result<Self> {
        let ctx = unsafe { qjs::JS_NewContext(runtime.raw()) };
        let ctx = NonNull::new(ctx).ok_or(Error::Engine("context allocation failed"))?;
        let inner = Arc::new(RealmInner {
            runtime: runtime.clone(),
            ctx: RawContext(ctx),
        });
        let back = Weak::into_raw(Arc::downgrade(&inner));
        unsafe { qjs::JS_SetContextOpaque(ctx.as_ptr(), back as *mut c_void) };
        tracing::trace!("realm created");
        Ok(Realm(inner))
    }

    /// Recovers the realm owning `ctx`, if it is still alive.
    ///
    /// # Safety
    /// `ctx` must be a context created by [`Realm::create`].
    pub(crate) unsafe fn from_raw_context(ctx: *mut qjs::JSContext) -> Option<Realm> {
        let back = qjs::JS_GetContextOpaque(ctx) as *const RealmInner;
        if back.is_null() {
            return None;
        }
        let weak = ManuallyDrop::new(Weak::from_raw(back));
        weak.upgrade().map(Realm)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    pub(crate) fn ctx(&self) -> *mut qjs::JSContext {
        self.0.ctx.as_ptr()
    }

    pub(crate) fn raw_context(&self) -> RawContext {
        self.0.ctx
    }

    /// Enters the engine through this realm's context. Fails off the owner
    /// thread.
    pub(crate) fn enter(&self) -> Result<Entered<'_>> {
        let engine = self.0.runtime.check_owner()?;
        Ok(Entered {
            ctx: self.ctx(),
            _engine: engine,
        })
    }

    pub fn same(&self, other: &Realm) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Engine values may cross realms of one runtime but never runtimes.
    pub(crate) fn check_runtime(&self, value: &Value) -> Result<()> {
        if value.realm().runtime().same(self.runtime()) {
            Ok(())
        } else {
            Err(Error::ForeignRuntime)
        }
    }

    pub(crate) fn check_atom(&self, atom: &Atom) -> Result<()> {
        if atom.realm().runtime().same(self.runtime()) {
            Ok(())
        } else {
            Err(Error::ForeignRuntime)
        }
    }

    // ====================================================================
    // Exceptions
    // ====================================================================

    /// Takes the pending exception off the context.
    pub(crate) fn take_exception(&self) -> Error {
        let raw = unsafe { qjs::JS_GetException(self.ctx()) };
        if sys::tag(raw) == sys::TAG_NULL {
            return Error::Engine("exception signalled without a pending value");
        }
        Error::Script(ScriptError::capture(Value::owned(self, raw)))
    }

    /// Adopts an engine result, turning the exception sentinel into an error.
    pub(crate) fn resolve(&self, raw: RawValue) -> Result<Value> {
        if sys::is_exception(raw) {
            Err(self.take_exception())
        } else {
            Ok(Value::owned(self, raw))
        }
    }

    /// Interprets a `-1 / 0 / 1` status return.
    pub(crate) fn status(&self, code: c_int) -> Result<bool> {
        if code < 0 {
            Err(self.take_exception())
        } else {
            Ok(code != 0)
        }
    }

    /// Throws `err` into the engine and returns the exception sentinel.
    pub(crate) fn throw(&self, err: Error) -> RawValue {
        let ctx = self.ctx();
        unsafe {
            match err {
                Error::Script(e) if e.value().realm().runtime().same(self.runtime()) => {
                    qjs::JS_Throw(ctx, sys::dup(e.value().raw()))
                }
                Error::Syntax(m) => sys::throw_typed(ctx, ThrowKind::Syntax, &m),
                Error::Reference(m) => sys::throw_typed(ctx, ThrowKind::Reference, &m),
                Error::Range(m) => sys::throw_typed(ctx, ThrowKind::Range, &m),
                Error::Internal(m) => sys::throw_typed(ctx, ThrowKind::Internal, &m),
                e if e.is_type_error() => {
                    sys::throw_typed(ctx, ThrowKind::Type, &e.to_string())
                }
                other => match self.new_error_raw(&other.to_string()) {
                    Ok(obj) => qjs::JS_Throw(ctx, obj),
                    Err(_) => sys::throw_typed(ctx, ThrowKind::Internal, &other.to_string()),
                },
            }
        }
    }

    unsafe fn new_error_raw(&self, message: &str) -> Result<RawValue> {
        let ctx = self.ctx();
        let obj = qjs::JS_NewError(ctx);
        if sys::is_exception(obj) {
            return Err(self.take_exception());
        }
        let key = CString::new("message")?;
        let text = sys::new_string(ctx, message);
        if qjs::JS_SetPropertyStr(ctx, obj, key.as_ptr(), text) < 0 {
            sys::free(ctx, obj);
            return Err(self.take_exception());
        }
        Ok(obj)
    }

    // ====================================================================
    // Value construction
    // ====================================================================

    pub fn undefined(&self) -> Value {
        Value::owned(self, sys::UNDEFINED)
    }

    pub fn null(&self) -> Value {
        Value::owned(self, sys::NULL)
    }

    pub fn new_int(&self, n: i32) -> Value {
        Value::owned(self, sys::new_int(n))
    }

    pub fn new_float(&self, d: f64) -> Value {
        Value::owned(self, sys::new_float(d))
    }

    pub fn new_bool(&self, b: bool) -> Value {
        Value::owned(self, sys::new_bool(b))
    }

    pub fn new_string(&self, s: &str) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { sys::new_string(ctx, s) })
    }

    pub fn new_object(&self) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_NewObject(ctx) })
    }

    pub fn new_object_proto(&self, proto: &Value) -> Result<Value> {
        self.check_runtime(proto)?;
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_NewObjectProto(ctx, proto.raw()) })
    }

    pub fn new_array(&self) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_NewArray(ctx) })
    }

    pub fn new_array_buffer(&self, bytes: &[u8]) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_NewArrayBufferCopy(ctx, bytes.as_ptr(), bytes.len() as _) })
    }

    /// Engine `Error` object carrying `message`.
    pub fn new_error(&self, message: &str) -> Result<Value> {
        let _entered = self.enter()?;
        let raw = unsafe { self.new_error_raw(message)? };
        Ok(Value::owned(self, raw))
    }

    /// Plain object whose collection runs `finalizer` exactly once.
    ///
    /// The finalizer runs while the engine is collecting and must not call
    /// back into the engine.
    pub fn new_object_with_finalizer<F>(&self, finalizer: F) -> Result<Value>
    where
        F: FnOnce() + Send + 'static,
    {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let pins = self.runtime().pins();
        let id = pins.finalizers.pin(Finalizer::new(finalizer));
        let obj = unsafe { qjs::JS_NewObjectClass(ctx, class::finalizer_class() as c_int) };
        if sys::is_exception(obj) {
            pins.finalizers.unpin(id);
            return Err(self.take_exception());
        }
        unsafe { qjs::JS_SetOpaque(obj, id.get() as *mut c_void) };
        Ok(Value::owned(self, obj))
    }

    pub fn global_object(&self) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_GetGlobalObject(ctx) })
    }

    pub fn parse_json(&self, text: &str) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let source = CString::new(text)?;
        let name = CString::new("<json>")?;
        self.resolve(unsafe {
            qjs::JS_ParseJSON(ctx, source.as_ptr(), text.len() as _, name.as_ptr())
        })
    }

    /// Deserializes a value produced by [`Value::to_bytes`].
    pub fn load_value(&self, bytes: &[u8]) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe {
            qjs::JS_ReadObject(ctx, bytes.as_ptr(), bytes.len() as _, sys::READ_OBJ_BYTECODE)
        })
    }

    pub fn new_atom(&self, name: &str) -> Result<Atom> {
        Atom::new(self, name)
    }

    pub fn convert<T: IntoJs>(&self, value: T) -> Result<Value> {
        value.into_js(self)
    }

    /// Links `func` and `proto` as constructor and prototype.
    pub fn set_constructor(&self, func: &Value, proto: &Value) -> Result<()> {
        self.check_runtime(func)?;
        self.check_runtime(proto)?;
        let entered = self.enter()?;
        let ctx = entered.ctx();
        unsafe { qjs::JS_SetConstructor(ctx, func.raw(), proto.raw()) };
        Ok(())
    }

    pub fn set_constructor_bit(&self, func: &Value, enabled: bool) -> Result<bool> {
        self.check_runtime(func)?;
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let code = unsafe { qjs::JS_SetConstructorBit(ctx, func.raw(), enabled as _) };
        self.status(code)
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("ctx", &self.0.ctx.as_ptr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn options_apply_in_order() {
        let runtime = Runtime::builder()
            .realm_option(RealmOption::new(|realm| {
                realm.global_object()?.set("order", "default")
            }))
            .build()
            .unwrap();
        let realm = runtime
            .new_realm([RealmOption::new(|realm| {
                let global = realm.global_object()?;
                let prior = global.get("order")?.display()?;
                global.set("order", format!("{prior},custom"))
            })])
            .unwrap();
        let order = realm.eval("order", EvalOptions::default()).unwrap();
        assert_eq!(order.display().unwrap(), "default,custom");
    }

    #[test]
    fn finalizer_runs_once_on_collection() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let obj = realm
            .new_object_with_finalizer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(runtime.pins().finalizer_count(), 1);

        drop(obj);
        runtime.run_gc().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.pins().finalizer_count(), 0);
    }

    #[test]
    fn thrown_host_errors_keep_their_kind() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let raw = realm.throw(Error::range("too far"));
        assert!(sys::is_exception(raw));
        let err = realm.take_exception();
        assert_eq!(err.to_string(), "RangeError: too far");
    }

    #[test]
    fn foreign_exceptions_are_rethrown_by_message() {
        let other = Runtime::new().unwrap().new_realm([]).unwrap();
        let foreign = other
            .eval("throw new TypeError('elsewhere')", EvalOptions::default())
            .unwrap_err();

        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        realm.throw(foreign);
        let err = realm.take_exception();
        assert_eq!(err.to_string(), "Error: TypeError: elsewhere");
        assert!(err.as_script().unwrap().value().realm().same(&realm));
    }

    #[test]
    fn json_parse_errors_are_syntax_errors() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let parsed = realm.parse_json(r#"{"a": [1, 2]}"#).unwrap();
        assert_eq!(parsed.get("a").unwrap().index(1).unwrap().to_int().unwrap(), 2);

        let err = realm.parse_json("{oops").unwrap_err();
        assert!(err.to_string().starts_with("SyntaxError"));
    }
}
