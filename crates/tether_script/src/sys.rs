//! Primitive engine surface
//!
//! Everything that touches the raw QuickJS bindings directly and is not tied
//! to a wrapper type lives here. Callers above this module deal in
//! [`RawValue`]s, raw context pointers and plain Rust types.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr::{self, NonNull};

pub(crate) use rquickjs::qjs;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("tether_script requires a 64-bit target (struct-tagged engine values)");

pub(crate) type RawValue = qjs::JSValue;
pub(crate) type RawAtom = qjs::JSAtom;

// Tag values shared by every QuickJS build.
pub(crate) const TAG_BIG_INT: i32 = qjs::JS_TAG_BIG_INT as i32;
pub(crate) const TAG_SYMBOL: i32 = qjs::JS_TAG_SYMBOL as i32;
pub(crate) const TAG_STRING: i32 = qjs::JS_TAG_STRING as i32;
pub(crate) const TAG_MODULE: i32 = qjs::JS_TAG_MODULE as i32;
pub(crate) const TAG_FUNCTION_BYTECODE: i32 = qjs::JS_TAG_FUNCTION_BYTECODE as i32;
pub(crate) const TAG_OBJECT: i32 = qjs::JS_TAG_OBJECT as i32;
pub(crate) const TAG_INT: i32 = qjs::JS_TAG_INT as i32;
pub(crate) const TAG_BOOL: i32 = qjs::JS_TAG_BOOL as i32;
pub(crate) const TAG_NULL: i32 = qjs::JS_TAG_NULL as i32;
pub(crate) const TAG_UNDEFINED: i32 = qjs::JS_TAG_UNDEFINED as i32;
pub(crate) const TAG_UNINITIALIZED: i32 = qjs::JS_TAG_UNINITIALIZED as i32;
pub(crate) const TAG_CATCH_OFFSET: i32 = qjs::JS_TAG_CATCH_OFFSET as i32;
pub(crate) const TAG_EXCEPTION: i32 = qjs::JS_TAG_EXCEPTION as i32;
pub(crate) const TAG_FLOAT64: i32 = qjs::JS_TAG_FLOAT64 as i32;

pub(crate) const EVAL_TYPE_GLOBAL: c_int = qjs::JS_EVAL_TYPE_GLOBAL as c_int;
pub(crate) const EVAL_TYPE_MODULE: c_int = qjs::JS_EVAL_TYPE_MODULE as c_int;
pub(crate) const EVAL_FLAG_STRICT: c_int = qjs::JS_EVAL_FLAG_STRICT as c_int;
pub(crate) const EVAL_FLAG_STRIP: c_int = qjs::JS_EVAL_FLAG_STRIP as c_int;
pub(crate) const EVAL_FLAG_COMPILE_ONLY: c_int = qjs::JS_EVAL_FLAG_COMPILE_ONLY as c_int;
pub(crate) const EVAL_FLAG_BACKTRACE_BARRIER: c_int =
    qjs::JS_EVAL_FLAG_BACKTRACE_BARRIER as c_int;

pub(crate) const PROP_CONFIGURABLE: c_int = qjs::JS_PROP_CONFIGURABLE as c_int;
pub(crate) const PROP_WRITABLE: c_int = qjs::JS_PROP_WRITABLE as c_int;
pub(crate) const PROP_ENUMERABLE: c_int = qjs::JS_PROP_ENUMERABLE as c_int;
pub(crate) const PROP_HAS_CONFIGURABLE: c_int = qjs::JS_PROP_HAS_CONFIGURABLE as c_int;
pub(crate) const PROP_HAS_WRITABLE: c_int = qjs::JS_PROP_HAS_WRITABLE as c_int;
pub(crate) const PROP_HAS_ENUMERABLE: c_int = qjs::JS_PROP_HAS_ENUMERABLE as c_int;
pub(crate) const PROP_HAS_GET: c_int = qjs::JS_PROP_HAS_GET as c_int;
pub(crate) const PROP_HAS_SET: c_int = qjs::JS_PROP_HAS_SET as c_int;
pub(crate) const PROP_HAS_VALUE: c_int = qjs::JS_PROP_HAS_VALUE as c_int;
pub(crate) const PROP_THROW: c_int = qjs::JS_PROP_THROW as c_int;
pub(crate) const PROP_NO_EXOTIC: c_int = qjs::JS_PROP_NO_EXOTIC as c_int;

pub(crate) const GPN_STRING_MASK: c_int = qjs::JS_GPN_STRING_MASK as c_int;
pub(crate) const GPN_ENUM_ONLY: c_int = qjs::JS_GPN_ENUM_ONLY as c_int;

pub(crate) const WRITE_OBJ_BYTECODE: c_int = qjs::JS_WRITE_OBJ_BYTECODE as c_int;
pub(crate) const READ_OBJ_BYTECODE: c_int = qjs::JS_READ_OBJ_BYTECODE as c_int;

const fn make(tag: i32, int32: i32) -> RawValue {
    qjs::JSValue {
        u: qjs::JSValueUnion { int32 },
        tag: tag as i64,
    }
}

pub(crate) const UNDEFINED: RawValue = make(TAG_UNDEFINED, 0);
pub(crate) const NULL: RawValue = make(TAG_NULL, 0);

pub(crate) fn new_int(n: i32) -> RawValue {
    make(TAG_INT, n)
}

pub(crate) fn new_bool(b: bool) -> RawValue {
    make(TAG_BOOL, b as i32)
}

pub(crate) fn new_float(d: f64) -> RawValue {
    qjs::JSValue {
        u: qjs::JSValueUnion { float64: d },
        tag: TAG_FLOAT64 as i64,
    }
}

pub(crate) fn tag(v: RawValue) -> i32 {
    v.tag as i32
}

pub(crate) fn is_exception(v: RawValue) -> bool {
    tag(v) == TAG_EXCEPTION
}

/// Pointer tags are all negative and carry a reference count header.
pub(crate) fn has_ref_count(v: RawValue) -> bool {
    tag(v) < 0
}

pub(crate) fn ptr(v: RawValue) -> *mut c_void {
    // SAFETY: reading the pointer arm of the union is only meaningful for
    // pointer tags; callers check `has_ref_count` or the exact tag first.
    unsafe { v.u.ptr }
}

/// Takes one more reference to `v`.
///
/// # Safety
/// Must run on the thread that owns the engine runtime of `v`.
pub(crate) unsafe fn dup(v: RawValue) -> RawValue {
    if has_ref_count(v) {
        let header = ptr(v) as *mut qjs::JSRefCountHeader;
        (*header).ref_count += 1;
    }
    v
}

/// Releases one reference to `v`. Module records belong to the runtime's
/// module list and are never freed through a value.
///
/// # Safety
/// Must run on the owner thread with a live context.
pub(crate) unsafe fn free(ctx: *mut qjs::JSContext, v: RawValue) {
    if tag(v) != TAG_MODULE {
        qjs::JS_FreeValue(ctx, v);
    }
}

/// Thin `Send` wrapper around a runtime pointer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawRuntime(pub(crate) NonNull<qjs::JSRuntime>);

// SAFETY: the pointer is only dereferenced by the owning thread, enforced by
// the callers through `ThreadAffinity`.
unsafe impl Send for RawRuntime {}
unsafe impl Sync for RawRuntime {}

impl RawRuntime {
    pub(crate) fn as_ptr(self) -> *mut qjs::JSRuntime {
        self.0.as_ptr()
    }
}

/// Thin `Send` wrapper around a context pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawContext(pub(crate) NonNull<qjs::JSContext>);

// SAFETY: see `RawRuntime`.
unsafe impl Send for RawContext {}
unsafe impl Sync for RawContext {}

impl RawContext {
    pub(crate) fn as_ptr(self) -> *mut qjs::JSContext {
        self.0.as_ptr()
    }
}

/// Copies an engine string out as UTF-8. Returns `None` when the engine
/// raised an exception during the conversion.
///
/// # Safety
/// Owner thread only.
pub(crate) unsafe fn to_rust_string(ctx: *mut qjs::JSContext, v: RawValue) -> Option<String> {
    let mut len: qjs::size_t = 0;
    let cstr = qjs::JS_ToCStringLen2(ctx, &mut len, v, 0);
    if cstr.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(cstr as *const u8, len as usize);
    let out = String::from_utf8_lossy(bytes).into_owned();
    qjs::JS_FreeCString(ctx, cstr);
    Some(out)
}

/// # Safety
/// Owner thread only.
pub(crate) unsafe fn new_string(ctx: *mut qjs::JSContext, s: &str) -> RawValue {
    qjs::JS_NewStringLen(ctx, s.as_ptr() as *const c_char, s.len() as _)
}

/// # Safety
/// Owner thread only; `raw` must be a string returned by the engine.
pub(crate) unsafe fn cstr_arg<'a>(raw: *const c_char) -> &'a str {
    if raw.is_null() {
        return "";
    }
    CStr::from_ptr(raw).to_str().unwrap_or_default()
}

/// Copies a Rust string into engine-owned memory, as expected from module
/// name normalizers.
///
/// # Safety
/// Owner thread only.
pub(crate) unsafe fn engine_strdup(ctx: *mut qjs::JSContext, s: &str) -> *mut c_char {
    let buf = qjs::js_malloc(ctx, (s.len() + 1) as _) as *mut u8;
    if buf.is_null() {
        return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(s.as_ptr(), buf, s.len());
    *buf.add(s.len()) = 0;
    buf as *mut c_char
}

/// Throws `message` through one of the engine's intrinsic error
/// constructors.
///
/// # Safety
/// Owner thread only.
pub(crate) unsafe fn throw_typed(
    ctx: *mut qjs::JSContext,
    kind: ThrowKind,
    message: &str,
) -> RawValue {
    let text = std::ffi::CString::new(message.replace('\0', " ")).unwrap_or_default();
    let fmt = b"%s\0".as_ptr() as *const c_char;
    match kind {
        ThrowKind::Syntax => qjs::JS_ThrowSyntaxError(ctx, fmt, text.as_ptr()),
        ThrowKind::Type => qjs::JS_ThrowTypeError(ctx, fmt, text.as_ptr()),
        ThrowKind::Reference => qjs::JS_ThrowReferenceError(ctx, fmt, text.as_ptr()),
        ThrowKind::Range => qjs::JS_ThrowRangeError(ctx, fmt, text.as_ptr()),
        ThrowKind::Internal => qjs::JS_ThrowInternalError(ctx, fmt, text.as_ptr()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThrowKind {
    Syntax,
    Type,
    Reference,
    Range,
    Internal,
}
