//! Engine allocator hooks
//!
//! Routes engine allocations through the Rust global allocator. A small
//! header in front of each block records its size so `free`/`realloc` can
//! rebuild the layout. The configured memory limit is the only reason an
//! allocation returns null (which the engine reports as out-of-memory); a
//! genuine allocator failure aborts.

use crate::sys::qjs::{self, size_t};
use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr;

const HEADER: usize = 16;
const ALIGN: usize = 16;

pub(crate) static MALLOC_FUNCTIONS: qjs::JSMallocFunctions = qjs::JSMallocFunctions {
    js_malloc: Some(js_malloc),
    js_free: Some(js_free),
    js_realloc: Some(js_realloc),
    js_malloc_usable_size: Some(js_usable_size),
};

fn layout_for(size: usize) -> Layout {
    match Layout::from_size_align(size.saturating_add(HEADER), ALIGN) {
        Ok(layout) => layout,
        Err(_) => alloc::handle_alloc_error(Layout::new::<[u8; HEADER]>()),
    }
}

unsafe fn block_size(user: *const c_void) -> usize {
    *((user as *const u8).sub(HEADER) as *const usize)
}

fn over_limit(state: &qjs::JSMallocState, extra: usize) -> bool {
    (state.malloc_size as usize).saturating_add(extra) > state.malloc_limit as usize
}

unsafe fn raw_alloc(size: usize) -> *mut c_void {
    let layout = layout_for(size);
    let base = alloc::alloc(layout);
    if base.is_null() {
        alloc::handle_alloc_error(layout);
    }
    *(base as *mut usize) = size;
    base.add(HEADER) as *mut c_void
}

unsafe fn raw_free(user: *mut c_void) {
    let size = block_size(user);
    alloc::dealloc((user as *mut u8).sub(HEADER), layout_for(size));
}

unsafe extern "C" fn js_malloc(state: *mut qjs::JSMallocState, size: size_t) -> *mut c_void {
    let size = size as usize;
    let state = &mut *state;
    if over_limit(state, size + HEADER) {
        return ptr::null_mut();
    }
    let block = raw_alloc(size);
    state.malloc_count += 1;
    state.malloc_size += (size + HEADER) as size_t;
    block
}

unsafe extern "C" fn js_free(state: *mut qjs::JSMallocState, block: *mut c_void) {
    if block.is_null() {
        return;
    }
    let state = &mut *state;
    let size = block_size(block);
    state.malloc_count -= 1;
    state.malloc_size -= (size + HEADER) as size_t;
    raw_free(block);
}

unsafe extern "C" fn js_realloc(
    state: *mut qjs::JSMallocState,
    block: *mut c_void,
    size: size_t,
) -> *mut c_void {
    let size = size as usize;
    if block.is_null() {
        if size == 0 {
            return ptr::null_mut();
        }
        return js_malloc(state, size as size_t);
    }
    if size == 0 {
        js_free(state, block);
        return ptr::null_mut();
    }

    let st = &mut *state;
    let old = block_size(block);
    if size > old && over_limit(st, size - old) {
        return ptr::null_mut();
    }

    let base = (block as *mut u8).sub(HEADER);
    let grown = alloc::realloc(base, layout_for(old), size + HEADER);
    if grown.is_null() {
        alloc::handle_alloc_error(layout_for(size));
    }
    *(grown as *mut usize) = size;
    st.malloc_size = st.malloc_size - old as size_t + size as size_t;
    grown.add(HEADER) as *mut c_void
}

unsafe extern "C" fn js_usable_size(block: *const c_void) -> size_t {
    if block.is_null() {
        0
    } else {
        block_size(block) as size_t
    }
}
