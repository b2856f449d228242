//! Engine value wrapper
//!
//! A [`Value`] holds exactly one engine reference, taken when it is wrapped
//! and released when the last clone is dropped. Cloning only bumps a host
//! reference count, so values may be cloned and moved between threads
//! freely; anything that reads or mutates the engine checks the owner
//! thread first.

use crate::atom::Atom;
use crate::convert::{HostValue, IntoArgs, IntoJs};
use crate::error::{Error, Result};
use crate::property::PropertyDescriptor;
use crate::realm::{Entered, Realm};
use crate::release::Release;
use crate::scheduler::AsyncResult;
use crate::sys::{self, qjs, RawValue};
use crate::tag::Tag;
use std::ffi::{c_int, CString};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct Value(Arc<ValueInner>);

struct ValueInner {
    realm: Realm,
    raw: RawValue,
}

// SAFETY: the engine value is only touched by the owner thread; off-thread
// drops are routed through the runtime's release queue.
unsafe impl Send for ValueInner {}
unsafe impl Sync for ValueInner {}

impl Drop for ValueInner {
    fn drop(&mut self) {
        if sys::has_ref_count(self.raw) {
            // `self.realm` is only dropped after this call returns, which
            // keeps the context alive for the release.
            let realm = &self.realm;
            realm.runtime().inner().release(Release::Value {
                ctx: realm.raw_context(),
                raw: self.raw,
            });
        }
    }
}

impl Value {
    /// Adopts a reference the engine just handed to us.
    pub(crate) fn owned(realm: &Realm, raw: RawValue) -> Self {
        Value(Arc::new(ValueInner {
            realm: realm.clone(),
            raw,
        }))
    }

    /// Wraps a borrowed engine value, taking a reference of our own.
    pub(crate) fn borrowed(realm: &Realm, raw: RawValue) -> Self {
        Self::owned(realm, unsafe { sys::dup(raw) })
    }

    pub(crate) fn raw(&self) -> RawValue {
        self.0.raw
    }

    pub fn realm(&self) -> &Realm {
        &self.0.realm
    }

    fn enter(&self) -> Result<Entered<'_>> {
        self.0.realm.enter()
    }

    fn resolve(&self, raw: RawValue) -> Result<Value> {
        self.0.realm.resolve(raw)
    }

    // ====================================================================
    // Type predicates
    // ====================================================================

    pub fn tag(&self) -> Tag {
        Tag::from_raw(sys::tag(self.0.raw))
    }

    pub fn is_string(&self) -> bool {
        self.tag() == Tag::String
    }

    pub fn is_object(&self) -> bool {
        self.tag() == Tag::Object
    }

    pub fn is_int(&self) -> bool {
        self.tag() == Tag::Int
    }

    pub fn is_float(&self) -> bool {
        self.tag() == Tag::Float64
    }

    pub fn is_number(&self) -> bool {
        self.tag().is_number()
    }

    pub fn is_bool(&self) -> bool {
        self.tag() == Tag::Bool
    }

    pub fn is_null(&self) -> bool {
        self.tag() == Tag::Null
    }

    pub fn is_undefined(&self) -> bool {
        self.tag() == Tag::Undefined
    }

    pub fn is_symbol(&self) -> bool {
        self.tag() == Tag::Symbol
    }

    // The checks below ask the engine; off the owner thread they report
    // false.

    pub fn is_array(&self) -> bool {
        self.predicate("array", self.try_is_array())
    }

    /// Array check that reports an exception raised by the engine (a
    /// revoked proxy) instead of answering false.
    pub fn try_is_array(&self) -> Result<bool> {
        self.query(|ctx, raw| unsafe { qjs::JS_IsArray(ctx, raw) })
    }

    pub fn is_function(&self) -> bool {
        let result = self.query(|ctx, raw| unsafe { qjs::JS_IsFunction(ctx, raw) });
        self.predicate("function", result)
    }

    pub fn is_constructor(&self) -> bool {
        let result = self.query(|ctx, raw| unsafe { qjs::JS_IsConstructor(ctx, raw) });
        self.predicate("constructor", result)
    }

    pub fn is_error(&self) -> bool {
        let result = self.query(|ctx, raw| unsafe { qjs::JS_IsError(ctx, raw) });
        self.predicate("error", result)
    }

    fn query<F, R>(&self, check: F) -> Result<bool>
    where
        F: FnOnce(*mut qjs::JSContext, RawValue) -> R,
        R: Into<i64>,
    {
        let entered = self.enter()?;
        let code = check(entered.ctx(), self.0.raw).into();
        if code < 0 {
            return Err(self.realm().take_exception());
        }
        Ok(code > 0)
    }

    fn predicate(&self, check: &'static str, result: Result<bool>) -> bool {
        match result {
            Ok(answer) => answer,
            Err(Error::ForeignThread) => false,
            Err(err) => {
                tracing::warn!(check, error = %err, "type check raised an exception");
                false
            }
        }
    }

    // ====================================================================
    // Properties
    // ====================================================================

    pub fn get(&self, name: &str) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let key = CString::new(name)?;
        self.resolve(unsafe { qjs::JS_GetPropertyStr(ctx, self.0.raw, key.as_ptr()) })
    }

    pub fn get_atom(&self, atom: &Atom) -> Result<Value> {
        self.realm().check_atom(atom)?;
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_GetProperty(ctx, self.0.raw, atom.raw()) })
    }

    pub fn index(&self, index: u32) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_GetPropertyUint32(ctx, self.0.raw, index) })
    }

    pub fn set<T: IntoJs>(&self, name: &str, value: T) -> Result<()> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let value = value.into_js(self.realm())?;
        let key = CString::new(name)?;
        let code = unsafe {
            qjs::JS_SetPropertyStr(ctx, self.0.raw, key.as_ptr(), sys::dup(value.raw()))
        };
        self.realm().status(code).map(drop)
    }

    pub fn set_atom<T: IntoJs>(&self, atom: &Atom, value: T) -> Result<()> {
        self.realm().check_atom(atom)?;
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let value = value.into_js(self.realm())?;
        let code =
            unsafe { qjs::JS_SetProperty(ctx, self.0.raw, atom.raw(), sys::dup(value.raw())) };
        self.realm().status(code).map(drop)
    }

    pub fn set_index<T: IntoJs>(&self, index: u32, value: T) -> Result<()> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let value = value.into_js(self.realm())?;
        let code = unsafe {
            qjs::JS_SetPropertyUint32(ctx, self.0.raw, index, sys::dup(value.raw()))
        };
        self.realm().status(code).map(drop)
    }

    /// Defines (or redefines) a property. Returns false when the engine
    /// refused and the descriptor did not ask it to throw.
    pub fn define_property(&self, name: &str, descriptor: PropertyDescriptor) -> Result<bool> {
        let atom = self.realm().new_atom(name)?;
        self.define_property_atom(&atom, descriptor)
    }

    pub fn define_property_atom(
        &self,
        atom: &Atom,
        descriptor: PropertyDescriptor,
    ) -> Result<bool> {
        let realm = self.realm();
        realm.check_atom(atom)?;
        for part in [descriptor.value_ref(), descriptor.getter_ref(), descriptor.setter_ref()] {
            if let Some(value) = part {
                realm.check_runtime(value)?;
            }
        }
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let field = |v: &Option<Value>| v.as_ref().map(Value::raw).unwrap_or(sys::UNDEFINED);
        let code = unsafe {
            qjs::JS_DefineProperty(
                ctx,
                self.0.raw,
                atom.raw(),
                field(descriptor.value_ref()),
                field(descriptor.getter_ref()),
                field(descriptor.setter_ref()),
                descriptor.flags(),
            )
        };
        self.realm().status(code)
    }

    /// Own enumerable string keys, in engine order.
    pub fn own_keys(&self) -> Result<Vec<String>> {
        self.own_atoms()?
            .into_iter()
            .map(|atom| atom.name())
            .collect()
    }

    fn own_atoms(&self) -> Result<Vec<Atom>> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let mut table: *mut qjs::JSPropertyEnum = std::ptr::null_mut();
        let mut len: u32 = 0;
        let code = unsafe {
            qjs::JS_GetOwnPropertyNames(
                ctx,
                &mut table,
                &mut len,
                self.0.raw,
                sys::GPN_STRING_MASK | sys::GPN_ENUM_ONLY,
            )
        };
        self.realm().status(code)?;
        let mut atoms = Vec::with_capacity(len as usize);
        unsafe {
            for n in 0..len as usize {
                // Ownership of each atom moves into the wrapper.
                atoms.push(Atom::owned(self.realm(), (*table.add(n)).atom));
            }
            qjs::js_free(ctx, table as *mut _);
        }
        Ok(atoms)
    }

    /// Copies own enumerable properties of `source` onto this object.
    pub fn assign(&self, source: &Value) -> Result<()> {
        for atom in source.own_atoms()? {
            let value = source.get_atom(&atom)?;
            self.set_atom(&atom, value)?;
        }
        Ok(())
    }

    // ====================================================================
    // Calls
    // ====================================================================

    /// Calls this function. On the owner thread the call runs immediately;
    /// from any other thread it is queued for the event loop and this call
    /// blocks until it has run.
    pub fn call<A>(&self, this: Option<&Value>, args: A) -> Result<Value>
    where
        A: IntoArgs + Send + 'static,
    {
        if self.realm().runtime().is_owner_thread() {
            let args = args.into_args(self.realm())?;
            self.call_now(this, &args)
        } else {
            self.call_async(this, args)?.wait()
        }
    }

    /// Queues a call for the event loop. Arguments are converted on the
    /// owner thread right before the call.
    ///
    /// From a non-owner thread this blocks while the task queue is full; on
    /// the owner thread a full queue is reported as [`Error::QueueFull`].
    pub fn call_async<A>(&self, this: Option<&Value>, args: A) -> Result<AsyncResult>
    where
        A: IntoArgs + Send + 'static,
    {
        let func = self.clone();
        let this = this.cloned();
        self.realm().runtime().submit_call(move || {
            let args = args.into_args(func.realm())?;
            func.call_now(this.as_ref(), &args)
        })
    }

    /// Queues a call from async code. Unlike [`Value::call_async`] this
    /// waits for room in a full queue without blocking the executor.
    pub fn queue_call<A>(
        &self,
        this: Option<&Value>,
        args: A,
    ) -> impl Future<Output = Result<Value>> + Send + 'static
    where
        A: IntoArgs + Send + 'static,
    {
        let func = self.clone();
        let this = this.cloned();
        let runtime = self.realm().runtime().clone();
        async move {
            let pending = runtime
                .submit_call_async(move || {
                    let args = args.into_args(func.realm())?;
                    func.call_now(this.as_ref(), &args)
                })
                .await?;
            pending.await
        }
    }

    pub(crate) fn call_now(&self, this: Option<&Value>, args: &[Value]) -> Result<Value> {
        let realm = self.realm();
        for value in this.into_iter().chain(args) {
            realm.check_runtime(value)?;
        }
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let this = this.map(Value::raw).unwrap_or(sys::UNDEFINED);
        let mut argv: Vec<RawValue> = args.iter().map(Value::raw).collect();
        self.resolve(unsafe {
            qjs::JS_Call(ctx, self.0.raw, this, argv.len() as c_int, argv.as_mut_ptr())
        })
    }

    /// `new this(...args)`. Owner thread only.
    pub fn construct<A: IntoArgs>(&self, args: A) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let args = args.into_args(self.realm())?;
        let mut argv: Vec<RawValue> = args.iter().map(Value::raw).collect();
        self.resolve(unsafe {
            qjs::JS_CallConstructor(ctx, self.0.raw, argv.len() as c_int, argv.as_mut_ptr())
        })
    }

    /// Calls the method `name` on this object, with the same threading rules
    /// as [`Value::call`].
    pub fn invoke<A>(&self, name: &str, args: A) -> Result<Value>
    where
        A: IntoArgs + Send + 'static,
    {
        if self.realm().runtime().is_owner_thread() {
            let args = args.into_args(self.realm())?;
            self.invoke_now(name, &args)
        } else {
            self.invoke_async(name, args)?.wait()
        }
    }

    pub fn invoke_async<A>(&self, name: &str, args: A) -> Result<AsyncResult>
    where
        A: IntoArgs + Send + 'static,
    {
        let target = self.clone();
        let name = name.to_string();
        self.realm().runtime().submit_call(move || {
            let args = args.into_args(target.realm())?;
            target.invoke_now(&name, &args)
        })
    }

    fn invoke_now(&self, name: &str, args: &[Value]) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let atom = self.realm().new_atom(name)?;
        let mut argv: Vec<RawValue> = args.iter().map(Value::raw).collect();
        self.resolve(unsafe {
            qjs::JS_Invoke(ctx, self.0.raw, atom.raw(), argv.len() as c_int, argv.as_mut_ptr())
        })
    }

    // ====================================================================
    // Conversions
    // ====================================================================

    /// `String(value)` as an engine string.
    pub fn to_string_value(&self) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        self.resolve(unsafe { qjs::JS_ToString(ctx, self.0.raw) })
    }

    /// `String(value)` as a Rust string.
    pub fn display(&self) -> Result<String> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        unsafe { sys::to_rust_string(ctx, self.0.raw) }
            .ok_or_else(|| self.realm().take_exception())
    }

    pub fn to_int(&self) -> Result<i32> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let mut out = 0i32;
        let code = unsafe { qjs::JS_ToInt32(ctx, &mut out, self.0.raw) };
        self.realm().status(code).map(|_| out)
    }

    pub fn to_int64(&self) -> Result<i64> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let mut out = 0i64;
        let code = unsafe { qjs::JS_ToInt64(ctx, &mut out, self.0.raw) };
        self.realm().status(code).map(|_| out)
    }

    pub fn to_float(&self) -> Result<f64> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let mut out = 0f64;
        let code = unsafe { qjs::JS_ToFloat64(ctx, &mut out, self.0.raw) };
        self.realm().status(code).map(|_| out)
    }

    pub fn to_bool(&self) -> Result<bool> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let code = unsafe { qjs::JS_ToBool(ctx, self.0.raw) };
        self.realm().status(code)
    }

    /// Script truthiness; errors count as false.
    pub fn is_truthy(&self) -> bool {
        self.to_bool().unwrap_or(false)
    }

    /// Primitive host view of the value; objects are rendered as strings.
    pub fn to_host(&self) -> Result<HostValue> {
        Ok(match self.tag() {
            Tag::Undefined | Tag::Null | Tag::Uninitialized => HostValue::Nothing,
            Tag::Bool => HostValue::Bool(self.to_bool()?),
            Tag::Int => HostValue::Int(self.to_int()?),
            Tag::Float64 => HostValue::Float(self.to_float()?),
            _ => HostValue::String(self.display()?),
        })
    }

    /// Round-trips the value through the engine's JSON serializer.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let text = self.resolve(unsafe {
            qjs::JS_JSONStringify(ctx, self.0.raw, sys::UNDEFINED, sys::UNDEFINED)
        })?;
        if text.is_undefined() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text.display()?)?)
    }

    /// Serializes the value (including compiled bytecode) into the engine's
    /// binary object format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let mut len: qjs::size_t = 0;
        let buf = unsafe {
            qjs::JS_WriteObject(ctx, &mut len, self.0.raw, sys::WRITE_OBJ_BYTECODE)
        };
        if buf.is_null() {
            return Err(self.realm().take_exception());
        }
        let bytes = unsafe { std::slice::from_raw_parts(buf, len as usize) }.to_vec();
        unsafe { qjs::js_free(ctx, buf as *mut _) };
        Ok(bytes)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value").field("tag", &self.tag()).finish()
    }
}

/// Uses `String(value)` on the owner thread and the tag name elsewhere.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "[{}]", self.tag()),
        }
    }
}
