//! Companion crate to [`leak_analyzer`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the `malloc` family of the program and redirect it
//! to the `leak_analyzer` tracker.
//!
//! Diagnostics of the analyzer itself are filtered with `LEAK_ANALYZER_LOG`
//! (`env_logger` syntax, `warn` by default).

use leak_analyzer::{EntryPoint, PRELOAD};
use libc::{c_void, size_t};

#[ctor::ctor]
fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("LEAK_ANALYZER_LOG", "warn"),
    )
    .try_init();
    PRELOAD.init();
}

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// catches `malloc` calls performed by the program and records them in the
/// leak registry after invoking the original `libc` malloc.  Recorded stacks
/// start at this function.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    PRELOAD.allocate_at(EntryPoint::new(malloc as usize), size)
}

/// # Safety
///
/// Same contract as `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    PRELOAD.allocate_zeroed_at(EntryPoint::new(calloc as usize), count, size)
}

/// # Safety
///
/// Same contract as `realloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    PRELOAD.reallocate_at(EntryPoint::new(realloc as usize), ptr, size)
}

/// Drops the block's record, if any, and hands the block to the original `free`.
///
/// # Safety
///
/// Same contract as `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    PRELOAD.release(ptr)
}
