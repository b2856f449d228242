//! Engine classes backing host functions and finalizer objects
//!
//! Class ids are process-wide; each runtime registers both classes when it
//! is created. The objects carry a registry id in their opaque slot. The
//! class finalizer is the only place that id is unpinned.

use crate::error::Error;
use crate::realm::Realm;
use crate::runtime::RuntimeInner;
use crate::sys::{self, qjs, RawValue, ThrowKind};
use crate::value::Value;
use once_cell::sync::Lazy;
use std::any::Any;
use std::ffi::{c_int, CString};
use std::panic::{self, AssertUnwindSafe};
use tether_core::HandleId;

static FUNCTION_CLASS: Lazy<qjs::JSClassID> = Lazy::new(new_class_id);
static FINALIZER_CLASS: Lazy<qjs::JSClassID> = Lazy::new(new_class_id);

fn new_class_id() -> qjs::JSClassID {
    let mut id: qjs::JSClassID = 0;
    // SAFETY: the allocator only touches `id` and a global counter; `Lazy`
    // serializes the calls.
    unsafe { qjs::JS_NewClassID(&mut id) };
    id
}

pub(crate) fn function_class() -> qjs::JSClassID {
    *FUNCTION_CLASS
}

pub(crate) fn finalizer_class() -> qjs::JSClassID {
    *FINALIZER_CLASS
}

/// Registers both classes on a fresh runtime. Returns false if the engine
/// refused either registration.
///
/// # Safety
/// `rt` must be a live runtime not yet shared with other threads.
pub(crate) unsafe fn register(rt: *mut qjs::JSRuntime) -> bool {
    let function_name = CString::new("HostFunction").unwrap_or_default();
    let finalizer_name = CString::new("ObjectWithFinalizer").unwrap_or_default();

    let function_def = qjs::JSClassDef {
        class_name: function_name.as_ptr(),
        finalizer: Some(function_finalizer),
        call: Some(call_trap),
        ..std::mem::zeroed()
    };
    let finalizer_def = qjs::JSClassDef {
        class_name: finalizer_name.as_ptr(),
        finalizer: Some(object_finalizer),
        ..std::mem::zeroed()
    };

    qjs::JS_NewClass(rt, function_class(), &function_def) == 0
        && qjs::JS_NewClass(rt, finalizer_class(), &finalizer_def) == 0
}

unsafe fn opaque_id(obj: RawValue, class: qjs::JSClassID) -> Option<HandleId> {
    HandleId::from_raw(qjs::JS_GetOpaque(obj, class) as usize)
}

unsafe extern "C" fn function_finalizer(rt: *mut qjs::JSRuntime, obj: RawValue) {
    let runtime = RuntimeInner::from_raw(rt);
    let _scope = runtime.enter_finalizer();
    if let Some(id) = opaque_id(obj, function_class()) {
        drop(runtime.pins().functions.unpin(id));
    }
}

unsafe extern "C" fn object_finalizer(rt: *mut qjs::JSRuntime, obj: RawValue) {
    let runtime = RuntimeInner::from_raw(rt);
    let _scope = runtime.enter_finalizer();
    let Some(id) = opaque_id(obj, finalizer_class()) else {
        return;
    };
    if let Some(finalizer) = runtime.pins().finalizers.unpin(id) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| finalizer.run())) {
            tracing::error!(panic = %panic_message(&*payload), "finalizer panicked");
        }
    }
}

unsafe extern "C" fn call_trap(
    ctx: *mut qjs::JSContext,
    func_obj: RawValue,
    this_val: RawValue,
    argc: c_int,
    argv: *mut RawValue,
    _flags: c_int,
) -> RawValue {
    let Some(realm) = Realm::from_raw_context(ctx) else {
        return sys::throw_typed(ctx, ThrowKind::Internal, "realm has been released");
    };
    let callable = opaque_id(func_obj, function_class())
        .and_then(|id| realm.runtime().pins().functions.lookup(id));
    let Some(callable) = callable else {
        return sys::throw_typed(ctx, ThrowKind::Internal, "host function is not registered");
    };

    let this = Value::borrowed(&realm, this_val);
    let args: Vec<Value> = (0..argc.max(0) as usize)
        .map(|n| Value::borrowed(&realm, *argv.add(n)))
        .collect();

    match panic::catch_unwind(AssertUnwindSafe(|| callable(&realm, this, &args))) {
        Ok(Ok(result)) => sys::dup(result.raw()),
        Ok(Err(err)) => realm.throw(err),
        Err(payload) => realm.throw(Error::internal(format!(
            "host function panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
