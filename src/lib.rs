//! This leak analyzer finds heap blocks that a program allocates and never releases.
//! It sits between the program and its allocator, keeps a record of every block
//! that is currently live together with the call stack that allocated it, and
//! when the program exits normally prints every block that is still live:
//!
//! ```text
//! 10 bytes at 0x5581c2a3e2a0
//!     minishell::parse_line (in src/parse.rs:42)
//!     minishell::main (in src/main.rs:17)
//!     ...
//!
//! 1 leaks, 10 bytes total
//! ```
//!
//! or `No leaks !!!` when everything was released.  The report goes to `stderr`.
//!
//! `leak_analyzer` can be used with programs in Rust or any other compiled language.
//!
//! ## Enabling `leak_analyzer` in a Rust program
//!
//! To enable `leak_analyzer` in a Rust program, configure it as a global allocator
//! instead of [`std::alloc::System`]:
//!
//! ```
//! use leak_analyzer::LeakTracker;
//!
//! #[global_allocator]
//! static GLOBAL: LeakTracker = LeakTracker;
//!
//! fn main() {}
//! ```
//!
//! Tracking starts with the first heap allocation.
//!
//! ## Using `leak_analyzer` via `LD_PRELOAD`
//!
//! For programs in other languages, including a mix of Rust, C, etc., use the
//! companion `lib_leak_analyzer` crate, which produces a dynamic library that
//! intercepts `malloc`, `calloc`, `realloc` and `free`:
//!
//! ```bash
//! LD_PRELOAD=libleak_analyzer.so ./my_program
//! ```
//!
//! Sending `SIGUSR1` (`SIGINFO` on macOS and the BSDs) to a running program makes
//! it exit, so that the report of a long-running process can be obtained.
//!
//! ## Symbolization
//!
//! By default frames are resolved in-process, from the symbol tables of the loaded
//! images.  Setting `LEAK_ANALYZER_SYMBOLIZER=external` runs an external tool
//! (`addr2line` unless `LEAK_ANALYZER_TOOL` says otherwise) once per frame; see
//! [`config::Config`] for the other knobs.
//!
//! ## Saved reports
//!
//! With `LEAK_ANALYZER_REPORT_DIR` set, the report is also stored as
//! `leak_analyzer.<pid>.yaml` in that directory.  Use the `la_print` tool from this
//! crate to view saved reports:
//!
//! ```bash
//! la_print --dir <report_dir>
//! ```

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cmp, mem, ptr,
};

use libc::c_void;

pub mod callstack;
pub mod config;
pub mod error;
pub mod interpose;
pub mod registry;
pub mod report;
pub mod slide;
pub mod symbolize;
pub mod tracker;

pub use callstack::EntryPoint;
pub use error::LeakError;
pub use interpose::{LibcAllocator, RawAllocator, SystemAllocator};
pub use report::{Leak, LeakReport};
pub use tracker::Tracker;

/// Tracker behind the `LD_PRELOAD` library.  The companion crate routes the
/// program's `malloc` family here and calls [`Tracker::init`] when the library
/// is loaded.
pub static PRELOAD: Tracker<LibcAllocator> = Tracker::new(LibcAllocator::new());

static RUST_HEAP: Tracker<SystemAllocator> = Tracker::new(SystemAllocator);

/// Alignment `malloc` guarantees on every supported target.
const MIN_ALIGN: usize = 2 * mem::size_of::<usize>();

/// Allocator that records every live allocation performed by the program and
/// reports the ones still live at exit.  Use the `global_allocator` attribute to
/// enable this allocator in your program:
///
/// ```
/// use leak_analyzer::LeakTracker;
///
/// #[global_allocator]
/// static GLOBAL: LeakTracker = LeakTracker;
///
/// fn main() {}
/// ```
///
pub struct LeakTracker;

impl LeakTracker {
    /// Allocations made through this allocator that are still live.
    pub fn leaks() -> Vec<Leak> {
        RUST_HEAP.leaks()
    }

    pub fn is_tracked(ptr: *const u8) -> bool {
        RUST_HEAP.is_tracked(ptr as *const c_void)
    }

    fn fits_malloc(layout: &Layout) -> bool {
        layout.align() <= MIN_ALIGN && layout.align() <= layout.size()
    }
}

unsafe impl GlobalAlloc for LeakTracker {
    #[inline(never)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let entry = EntryPoint::new((Self::alloc as unsafe fn(&Self, Layout) -> *mut u8) as usize);
        RUST_HEAP.init();
        if Self::fits_malloc(&layout) {
            RUST_HEAP.allocate_at(entry, layout.size()) as *mut u8
        } else {
            let ptr = System.alloc(layout);
            if !ptr.is_null() {
                RUST_HEAP.track(ptr as *mut c_void, layout.size(), entry);
            }
            ptr
        }
    }

    #[inline(never)]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let entry =
            EntryPoint::new((Self::alloc_zeroed as unsafe fn(&Self, Layout) -> *mut u8) as usize);
        RUST_HEAP.init();
        if Self::fits_malloc(&layout) {
            RUST_HEAP.allocate_zeroed_at(entry, 1, layout.size()) as *mut u8
        } else {
            let ptr = System.alloc_zeroed(layout);
            if !ptr.is_null() {
                RUST_HEAP.track(ptr as *mut c_void, layout.size(), entry);
            }
            ptr
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Over-aligned blocks come from `posix_memalign`, which `free` releases too.
        RUST_HEAP.release(ptr as *mut c_void);
    }

    #[inline(never)]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN && layout.align() <= new_size {
            let entry = EntryPoint::new(
                (Self::realloc as unsafe fn(&Self, *mut u8, Layout, usize) -> *mut u8) as usize,
            );
            return RUST_HEAP.reallocate_at(entry, ptr as *mut c_void, new_size) as *mut u8;
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, cmp::min(layout.size(), new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}
