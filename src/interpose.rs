//! Access to the allocator that actually hands out memory.
//!
//! Two flavours exist:
//!
//! * [`LibcAllocator`] looks the real `malloc` family up with
//!   `dlsym(RTLD_NEXT, ..)`.  This is what the `LD_PRELOAD` library uses, since
//!   its own `malloc` shadows the one in `libc`.
//! * [`SystemAllocator`] calls `libc` by name.  This is correct whenever nobody
//!   has replaced those symbols, e.g. when the tracker is installed as a Rust
//!   `#[global_allocator]`.

use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use libc::{c_char, c_void, dlsym, size_t, RTLD_DEFAULT, RTLD_NEXT};

use crate::error::LeakError;

/// The `malloc`/`calloc`/`realloc`/`free` contract of the underlying allocator.
pub trait RawAllocator: Sync {
    /// Make sure the allocator is usable for tracking.  An error means memory
    /// can still be served, but allocations must not be tracked.
    fn resolve(&self) -> Result<(), LeakError> {
        Ok(())
    }

    /// # Safety
    ///
    /// Same contract as `malloc(3)`.
    unsafe fn malloc(&self, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as `calloc(3)`.
    unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as `realloc(3)`.
    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as `free(3)`.
    unsafe fn free(&self, ptr: *mut c_void);
}

/// The C library allocator, called directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        libc::malloc(size)
    }

    unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void {
        libc::calloc(count, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        libc::realloc(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        libc::free(ptr)
    }
}

type MallocFunc = unsafe extern "C" fn(size: size_t) -> *mut c_void;
type CallocFunc = unsafe extern "C" fn(count: size_t, size: size_t) -> *mut c_void;
type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;
const FAILED: u8 = 3;

/// The allocator found behind this library in the symbol search order.
///
/// Symbols are resolved on first use.  `dlsym` may itself allocate; those
/// requests (and any made by other threads in the meantime) are served from a
/// small static arena.  If `RTLD_NEXT` has no `malloc`, glibc's internal
/// `__libc_malloc` family keeps the host running, but [`RawAllocator::resolve`]
/// reports the allocator as unavailable so that tracking stays off.
pub struct LibcAllocator {
    state: AtomicU8,
    fallback: AtomicBool,
    malloc: AtomicUsize,
    calloc: AtomicUsize,
    realloc: AtomicUsize,
    free: AtomicUsize,
}

impl LibcAllocator {
    pub const fn new() -> Self {
        LibcAllocator {
            state: AtomicU8::new(UNRESOLVED),
            fallback: AtomicBool::new(false),
            malloc: AtomicUsize::new(0),
            calloc: AtomicUsize::new(0),
            realloc: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> u8 {
        let state = self.state.load(Ordering::Acquire);
        if state != UNRESOLVED {
            return state;
        }
        if self
            .state
            .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let state = unsafe { self.lookup_all() };
            self.state.store(state, Ordering::Release);
            state
        } else {
            self.state.load(Ordering::Acquire)
        }
    }

    unsafe fn lookup_all(&self) -> u8 {
        let next = [
            lookup(RTLD_NEXT, b"malloc\0"),
            lookup(RTLD_NEXT, b"calloc\0"),
            lookup(RTLD_NEXT, b"realloc\0"),
            lookup(RTLD_NEXT, b"free\0"),
        ];
        if self.store(next) {
            return RESOLVED;
        }
        let internal = [
            lookup(RTLD_DEFAULT, b"__libc_malloc\0"),
            lookup(RTLD_DEFAULT, b"__libc_calloc\0"),
            lookup(RTLD_DEFAULT, b"__libc_realloc\0"),
            lookup(RTLD_DEFAULT, b"__libc_free\0"),
        ];
        if self.store(internal) {
            self.fallback.store(true, Ordering::Release);
            return RESOLVED;
        }
        FAILED
    }

    fn store(&self, funcs: [usize; 4]) -> bool {
        if funcs.iter().any(|f| *f == 0) {
            return false;
        }
        self.malloc.store(funcs[0], Ordering::Release);
        self.calloc.store(funcs[1], Ordering::Release);
        self.realloc.store(funcs[2], Ordering::Release);
        self.free.store(funcs[3], Ordering::Release);
        true
    }
}

impl Default for LibcAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn lookup(handle: *mut c_void, name: &[u8]) -> usize {
    dlsym(handle, name.as_ptr() as *const c_char) as usize
}

impl RawAllocator for LibcAllocator {
    fn resolve(&self) -> Result<(), LeakError> {
        match self.state() {
            RESOLVED if !self.fallback.load(Ordering::Acquire) => Ok(()),
            _ => Err(LeakError::AllocatorUnavailable { symbol: "malloc" }),
        }
    }

    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        match self.state() {
            RESOLVED => {
                let real: MallocFunc = std::mem::transmute(self.malloc.load(Ordering::Acquire));
                real(size)
            }
            RESOLVING => BOOTSTRAP.allocate(size),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void {
        match self.state() {
            RESOLVED => {
                let real: CallocFunc = std::mem::transmute(self.calloc.load(Ordering::Acquire));
                real(count, size)
            }
            // The arena starts zeroed and is never reused.
            RESOLVING => match count.checked_mul(size) {
                Some(total) => BOOTSTRAP.allocate(total),
                None => ptr::null_mut(),
            },
            _ => ptr::null_mut(),
        }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        if let Some(old_size) = BOOTSTRAP.size_of(ptr) {
            let new = self.malloc(size);
            if !new.is_null() {
                ptr::copy_nonoverlapping(ptr as *const u8, new as *mut u8, old_size.min(size));
            }
            return new;
        }
        match self.state() {
            RESOLVED => {
                let real: ReallocFunc = std::mem::transmute(self.realloc.load(Ordering::Acquire));
                real(ptr, size)
            }
            _ => ptr::null_mut(),
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() || BOOTSTRAP.owns(ptr) {
            return;
        }
        if self.state() == RESOLVED {
            let real: FreeFunc = std::mem::transmute(self.free.load(Ordering::Acquire));
            real(ptr)
        }
    }
}

const BOOTSTRAP_SIZE: usize = 64 * 1024;
const BOOTSTRAP_ALIGN: usize = 16;

#[repr(C, align(16))]
struct ArenaBytes([u8; BOOTSTRAP_SIZE]);

/// Bump allocator serving requests made while the real allocator is being looked
/// up.  Each block is preceded by a header holding its size; blocks are never
/// reclaimed.
struct BootstrapArena {
    bytes: UnsafeCell<ArenaBytes>,
    next: AtomicUsize,
}

// Blocks are carved out with an atomic bump, so no two callers ever share bytes.
unsafe impl Sync for BootstrapArena {}

static BOOTSTRAP: BootstrapArena = BootstrapArena {
    bytes: UnsafeCell::new(ArenaBytes([0; BOOTSTRAP_SIZE])),
    next: AtomicUsize::new(0),
};

impl BootstrapArena {
    fn base(&self) -> *mut u8 {
        self.bytes.get() as *mut u8
    }

    fn allocate(&self, size: usize) -> *mut c_void {
        let needed = match size
            .checked_add(BOOTSTRAP_ALIGN - 1)
            .map(|s| (s & !(BOOTSTRAP_ALIGN - 1)) + BOOTSTRAP_ALIGN)
        {
            Some(needed) => needed,
            None => return ptr::null_mut(),
        };
        let offset = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(needed).filter(|end| *end <= BOOTSTRAP_SIZE)
            });
        match offset {
            Ok(offset) => unsafe {
                let header = self.base().add(offset);
                (header as *mut usize).write(size);
                header.add(BOOTSTRAP_ALIGN) as *mut c_void
            },
            Err(_) => ptr::null_mut(),
        }
    }

    fn owns(&self, ptr: *mut c_void) -> bool {
        let addr = ptr as usize;
        let base = self.base() as usize;
        addr >= base && addr < base + BOOTSTRAP_SIZE
    }

    fn size_of(&self, ptr: *mut c_void) -> Option<usize> {
        if !self.owns(ptr) {
            return None;
        }
        // SAFETY: pointers inside the arena were produced by `allocate`, which
        // wrote the size one alignment unit before the block.
        Some(unsafe { ((ptr as *mut u8).sub(BOOTSTRAP_ALIGN) as *const usize).read() })
    }
}
