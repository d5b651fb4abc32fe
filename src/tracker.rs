//! Allocation tracking on top of a [`RawAllocator`].

use std::{
    cell::Cell,
    io::{self, Write},
    mem,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, PoisonError,
    },
};

use libc::{c_int, c_void, size_t};
use once_cell::sync::OnceCell;

use crate::{
    callstack::{CallStack, EntryPoint},
    config,
    error::LeakError,
    interpose::RawAllocator,
    registry::{AllocationRecord, Registry},
    report::{Leak, LeakReport},
    slide, symbolize,
};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const TRACKING: u8 = 2;
const DISABLED: u8 = 3;

thread_local! {
    // Set while this thread runs analyzer code.  Allocations made in that window
    // (backtraces, record storage, logging, reporting) are served untracked.
    static NESTED: Cell<bool> = const { Cell::new(false) };
    // Set while this thread holds a registry lock.
    static LOCKED: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` with the re-entrancy flag set.  Returns `None` if the flag was
/// already set or the thread is being torn down.
fn guarded<R>(f: impl FnOnce() -> R) -> Option<R> {
    let entered = NESTED
        .try_with(|nested| !nested.replace(true))
        .unwrap_or(false);
    if !entered {
        return None;
    }
    let res = f();
    let _ = NESTED.try_with(|nested| nested.set(false));
    exit_if_requested();
    Some(res)
}

/// Run `f` with the re-entrancy flag set, whether or not it already was.
pub(crate) fn shielded<R>(f: impl FnOnce() -> R) -> R {
    let was_nested = NESTED.try_with(|nested| nested.replace(true)).unwrap_or(true);
    let res = f();
    if !was_nested {
        let _ = NESTED.try_with(|nested| nested.set(false));
        exit_if_requested();
    }
    res
}

fn is_nested() -> bool {
    NESTED.try_with(Cell::get).unwrap_or(true)
}

/// Forwards the `malloc` family to a [`RawAllocator`] and keeps a record of
/// every block that is still live.
pub struct Tracker<A> {
    real: A,
    registry: Mutex<Registry>,
    state: AtomicU8,
}

impl<A: RawAllocator> Tracker<A> {
    pub const fn new(real: A) -> Self {
        Tracker {
            real,
            registry: Mutex::new(Registry::new()),
            state: AtomicU8::new(UNINIT),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.state.load(Ordering::Acquire) == TRACKING
    }

    /// Start tracking and arrange for the leak report to run at exit.
    ///
    /// Only the first call has an effect.  If the real allocator cannot be
    /// resolved, tracking stays disabled for the rest of the run and a warning is
    /// logged once.
    pub fn init(&'static self)
    where
        A: 'static,
    {
        if self.state.load(Ordering::Acquire) != UNINIT {
            return;
        }
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let started = guarded(|| match self.start() {
            Ok(()) => {
                install_exit_hooks(self);
                log::debug!("leak_analyzer: tracking allocations");
            }
            Err(e) => log::warn!("leak_analyzer: {}; leak tracking disabled", e),
        });
        // Called from inside the analyzer; try again on the next call.
        if started.is_none() {
            self.state.store(UNINIT, Ordering::Release);
        }
    }

    /// Start tracking without registering exit hooks.
    #[cfg(test)]
    pub(crate) fn enable(&self) -> Result<(), LeakError> {
        self.state.store(INITIALIZING, Ordering::Release);
        self.start()
    }

    fn start(&self) -> Result<(), LeakError> {
        match self.real.resolve() {
            Ok(()) => {
                self.state.store(TRACKING, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.state.store(DISABLED, Ordering::Release);
                Err(e)
            }
        }
    }

    /// `malloc(3)`.
    ///
    /// # Safety
    ///
    /// Same contract as `malloc(3)`.
    #[inline(never)]
    pub unsafe fn allocate(&self, size: size_t) -> *mut c_void {
        let entry = EntryPoint::new((Self::allocate as unsafe fn(&Self, size_t) -> *mut c_void) as usize);
        self.allocate_at(entry, size)
    }

    /// `malloc(3)` on behalf of the interception function `entry`.
    ///
    /// # Safety
    ///
    /// Same contract as `malloc(3)`.
    pub unsafe fn allocate_at(&self, entry: EntryPoint, size: size_t) -> *mut c_void {
        let ptr = shielded(|| self.real.malloc(size));
        if !ptr.is_null() {
            self.track(ptr, size, entry);
        }
        ptr
    }

    /// `calloc(3)`.
    ///
    /// # Safety
    ///
    /// Same contract as `calloc(3)`.
    #[inline(never)]
    pub unsafe fn allocate_zeroed(&self, count: size_t, size: size_t) -> *mut c_void {
        let entry = EntryPoint::new(
            (Self::allocate_zeroed as unsafe fn(&Self, size_t, size_t) -> *mut c_void) as usize,
        );
        self.allocate_zeroed_at(entry, count, size)
    }

    /// # Safety
    ///
    /// Same contract as `calloc(3)`.
    pub unsafe fn allocate_zeroed_at(
        &self,
        entry: EntryPoint,
        count: size_t,
        size: size_t,
    ) -> *mut c_void {
        let ptr = shielded(|| self.real.calloc(count, size));
        if !ptr.is_null() {
            self.track(ptr, count.saturating_mul(size), entry);
        }
        ptr
    }

    /// `realloc(3)`.  The record moves along with the block and gets the
    /// current call stack.
    ///
    /// # Safety
    ///
    /// Same contract as `realloc(3)`.
    #[inline(never)]
    pub unsafe fn reallocate(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        let entry = EntryPoint::new(
            (Self::reallocate as unsafe fn(&Self, *mut c_void, size_t) -> *mut c_void) as usize,
        );
        self.reallocate_at(entry, ptr, size)
    }

    /// # Safety
    ///
    /// Same contract as `realloc(3)`.
    pub unsafe fn reallocate_at(
        &self,
        entry: EntryPoint,
        ptr: *mut c_void,
        size: size_t,
    ) -> *mut c_void {
        if ptr.is_null() {
            return self.allocate_at(entry, size);
        }
        // Detach first: once the real realloc returns, the old address may be
        // handed out to another thread.
        let record = self.detach(ptr);
        let new = shielded(|| self.real.realloc(ptr, size));
        match (record, new.is_null()) {
            (Some(record), false) => self.retrack(record, new, size, entry),
            // Failed realloc; the old block is still live.
            (Some(record), true) if size != 0 => self.relink(record),
            (Some(record), true) => self.discard(record),
            (None, false) => self.track(new, size, entry),
            (None, true) => {}
        }
        new
    }

    /// `free(3)`.  Pointers without a record are still handed to the real
    /// allocator.
    ///
    /// # Safety
    ///
    /// Same contract as `free(3)`.
    pub unsafe fn release(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        if let Some(record) = self.detach(ptr) {
            self.discard(record);
        }
        shielded(|| self.real.free(ptr));
    }

    /// Record an allocation that was served outside of this tracker.
    pub(crate) fn track(&self, ptr: *mut c_void, size: usize, entry: EntryPoint) {
        if !self.is_tracking() {
            return;
        }
        guarded(|| unsafe {
            let stack = CallStack::capture(entry);
            let slot = self.real.malloc(mem::size_of::<AllocationRecord>()) as *mut AllocationRecord;
            // Out of memory for the record: the block simply goes untracked.
            if let Some(slot) = NonNull::new(slot) {
                slot.as_ptr()
                    .write(AllocationRecord::new(ptr as usize, size, stack));
                self.relink(slot);
            }
        });
    }

    fn detach(&self, ptr: *mut c_void) -> Option<NonNull<AllocationRecord>> {
        self.with_registry(|registry| registry.remove(ptr as usize))
            .flatten()
    }

    unsafe fn retrack(
        &self,
        mut record: NonNull<AllocationRecord>,
        ptr: *mut c_void,
        size: usize,
        entry: EntryPoint,
    ) {
        let stack = guarded(|| CallStack::capture(entry)).unwrap_or_else(|| *record.as_ref().stack());
        record.as_mut().reassign(ptr as usize, size, stack);
        self.relink(record);
    }

    unsafe fn relink(&self, record: NonNull<AllocationRecord>) {
        if self
            .with_registry(|registry| registry.insert(record))
            .is_none()
        {
            self.discard(record);
        }
    }

    unsafe fn discard(&self, record: NonNull<AllocationRecord>) {
        shielded(|| self.real.free(record.as_ptr() as *mut c_void));
    }

    /// Run `f` on the registry with the re-entrancy flag set.  Returns `None`
    /// if this thread already holds a registry lock further up its stack.
    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> Option<R> {
        shielded(|| {
            if LOCKED.try_with(|locked| locked.replace(true)).unwrap_or(true) {
                return None;
            }
            let res = {
                let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
                f(&mut registry)
            };
            let _ = LOCKED.try_with(|locked| locked.set(false));
            Some(res)
        })
    }

    /// Number of live records.
    pub fn outstanding(&self) -> usize {
        self.with_registry(|registry| registry.len()).unwrap_or(0)
    }

    pub fn is_tracked(&self, ptr: *const c_void) -> bool {
        self.with_registry(|registry| registry.contains(ptr as usize))
            .unwrap_or(false)
    }

    /// Copy out every live record, most recent first.
    pub fn leaks(&self) -> Vec<Leak> {
        self.with_registry(|registry| {
            let mut leaks = Vec::with_capacity(registry.len());
            leaks.extend(registry.iter().map(Leak::from));
            leaks
        })
        .unwrap_or_default()
    }

    /// Build the report with the configured symbolizer and print it to `out`.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<LeakReport> {
        shielded(|| {
            let leaks = self.leaks();
            let symbolizer = symbolize::from_config(config::current());
            let report = LeakReport::resolve(std::process::id(), &leaks, symbolizer.as_ref());
            write!(out, "{}", report)?;
            out.flush()?;
            Ok(report)
        })
    }

    fn report_leaks(&self) {
        shielded(|| {
            let stderr = io::stderr();
            let report = match self.write_report(&mut stderr.lock()) {
                Ok(report) => report,
                Err(e) => {
                    log::error!("leak_analyzer: failed to write leak report: {}", e);
                    return;
                }
            };
            if let Some(dir) = &config::current().report_dir {
                match report.save(dir) {
                    Ok(path) => log::info!("leak_analyzer: report saved to {}", path.display()),
                    Err(e) => log::error!("leak_analyzer: failed to save leak report: {}", e),
                }
            }
        });
    }
}

trait ExitReport: Sync {
    fn run(&self);
}

impl<A: RawAllocator> ExitReport for Tracker<A> {
    fn run(&self) {
        self.report_leaks();
    }
}

static EXIT_REPORT: OnceCell<&'static dyn ExitReport> = OnceCell::new();

const RUNNING: u8 = 0;
const EXIT_REQUESTED: u8 = 1;
const EXITING: u8 = 2;

static EXIT: AtomicU8 = AtomicU8::new(RUNNING);

/// Honour an exit signal that arrived while this thread was inside the analyzer.
fn exit_if_requested() {
    if EXIT.load(Ordering::Acquire) == EXIT_REQUESTED
        && EXIT
            .compare_exchange(EXIT_REQUESTED, EXITING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        unsafe { libc::exit(1) };
    }
}

extern "C" fn report_at_exit() {
    EXIT.store(EXITING, Ordering::Release);
    if let Some(tracker) = EXIT_REPORT.get() {
        tracker.run();
    }
}

extern "C" fn exit_on_signal(_: c_int) {
    // The interrupted code may hold the registry lock; exit once it is done.
    if is_nested() {
        let _ = EXIT.compare_exchange(RUNNING, EXIT_REQUESTED, Ordering::AcqRel, Ordering::Acquire);
        return;
    }
    if EXIT.swap(EXITING, Ordering::AcqRel) != EXITING {
        unsafe { libc::exit(1) };
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub(crate) const EXIT_SIGNAL: c_int = libc::SIGINFO;
#[cfg(not(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")))]
pub(crate) const EXIT_SIGNAL: c_int = libc::SIGUSR1;

fn install_exit_hooks<A: RawAllocator + 'static>(tracker: &'static Tracker<A>) {
    if EXIT_REPORT.set(tracker).is_err() {
        log::warn!("leak_analyzer: another tracker already reports at exit");
        return;
    }
    unsafe { libc::atexit(report_at_exit) };

    let config = config::current();
    if config.exit_signal {
        let handler: extern "C" fn(c_int) = exit_on_signal;
        unsafe { libc::signal(EXIT_SIGNAL, handler as libc::sighandler_t) };
    }
    if config.symbolizer == config::SymbolizerKind::External {
        match slide::resolve() {
            Ok(image) => log::debug!(
                "leak_analyzer: dynamic base address ({:#x}) = static base address ({:#x}) + image slide ({:#x})",
                image.base(),
                image.link_address,
                image.slide
            ),
            Err(e) => log::warn!("leak_analyzer: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interpose::SystemAllocator,
        symbolize::{InProcessSymbolizer, Symbolizer},
    };
    use std::{ptr, sync::Arc, thread};

    fn tracker() -> Tracker<SystemAllocator> {
        let tracker = Tracker::new(SystemAllocator);
        tracker.enable().unwrap();
        tracker
    }

    /// Serves memory like the system allocator but cannot be resolved.
    struct Unresolvable;

    impl RawAllocator for Unresolvable {
        fn resolve(&self) -> Result<(), LeakError> {
            Err(LeakError::AllocatorUnavailable { symbol: "malloc" })
        }
        unsafe fn malloc(&self, size: size_t) -> *mut c_void {
            SystemAllocator.malloc(size)
        }
        unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void {
            SystemAllocator.calloc(count, size)
        }
        unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
            SystemAllocator.realloc(ptr, size)
        }
        unsafe fn free(&self, ptr: *mut c_void) {
            SystemAllocator.free(ptr)
        }
    }

    /// Always runs out of memory.
    struct Exhausted;

    impl RawAllocator for Exhausted {
        unsafe fn malloc(&self, _: size_t) -> *mut c_void {
            ptr::null_mut()
        }
        unsafe fn calloc(&self, _: size_t, _: size_t) -> *mut c_void {
            ptr::null_mut()
        }
        unsafe fn realloc(&self, _: *mut c_void, _: size_t) -> *mut c_void {
            ptr::null_mut()
        }
        unsafe fn free(&self, _: *mut c_void) {}
    }

    fn report<A: RawAllocator>(tracker: &Tracker<A>) -> LeakReport {
        LeakReport::resolve(0, &tracker.leaks(), &InProcessSymbolizer)
    }

    #[test]
    fn allocation_is_recorded_until_released() {
        let tracker = tracker();
        unsafe {
            let ptr = tracker.allocate(24);
            assert!(tracker.is_tracked(ptr));
            assert_eq!(tracker.outstanding(), 1);
            tracker.release(ptr);
            assert!(!tracker.is_tracked(ptr));
            assert_eq!(tracker.outstanding(), 0);
        }
    }

    #[test]
    fn release_is_idempotent_on_the_tracking_side() {
        let tracker = tracker();
        unsafe {
            let keep = tracker.allocate(8);
            let gone = tracker.allocate(8);
            tracker.release(gone);
            // A second release must not unlink anything.
            assert!(tracker.detach(gone).is_none());
            assert_eq!(tracker.outstanding(), 1);
            assert!(tracker.is_tracked(keep));
            tracker.release(keep);
        }
    }

    #[test]
    fn untracked_release_is_forwarded() {
        let tracker = tracker();
        unsafe {
            let foreign = SystemAllocator.malloc(16);
            let tracked = tracker.allocate(16);
            tracker.release(foreign);
            assert_eq!(tracker.outstanding(), 1);
            tracker.release(tracked);
            tracker.release(ptr::null_mut());
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn unreleased_allocations_are_reported_exactly() {
        let tracker = tracker();
        let sizes = [1usize, 7, 64, 4096];
        let ptrs: Vec<usize> = sizes
            .iter()
            .map(|size| unsafe { tracker.allocate(*size) } as usize)
            .collect();
        let report = report(&tracker);
        assert_eq!(report.leaks.len(), sizes.len());
        let reported: Vec<(usize, usize)> =
            report.leaks.iter().map(|l| (l.ptr, l.size)).collect();
        let expected: Vec<(usize, usize)> =
            ptrs.iter().copied().zip(sizes.iter().copied()).rev().collect();
        assert_eq!(reported, expected);
        for ptr in ptrs {
            unsafe { tracker.release(ptr as *mut c_void) };
        }
    }

    #[test]
    fn balanced_run_reports_no_leaks() {
        let tracker = tracker();
        unsafe {
            let a = tracker.allocate(10);
            let b = tracker.allocate_zeroed(4, 4);
            let b = tracker.reallocate(b, 64);
            tracker.release(a);
            tracker.release(b);
        }
        assert_eq!(report(&tracker).to_string(), "No leaks !!!\n");
    }

    #[test]
    fn single_leak_has_a_backtrace() {
        let tracker = tracker();
        let ptr = unsafe { tracker.allocate(10) };
        let report = report(&tracker);
        let text = report.to_string();
        assert!(text.contains(&format!("10 bytes at {:#x}", ptr as usize)));
        assert!(!report.leaks[0].frames.is_empty());
        unsafe { tracker.release(ptr) };
    }

    #[test]
    fn only_the_later_allocation_leaks() {
        let tracker = tracker();
        unsafe {
            let first = tracker.allocate(10);
            tracker.release(first);
            let second = tracker.allocate(20);
            let report = report(&tracker);
            assert_eq!(report.leaks.len(), 1);
            assert_eq!(report.leaks[0].size, 20);
            assert_eq!(report.leaks[0].ptr, second as usize);
            tracker.release(second);
        }
    }

    #[test]
    fn unavailable_allocator_serves_untracked_memory() {
        let tracker = Tracker::new(Unresolvable);
        assert!(matches!(
            tracker.enable(),
            Err(LeakError::AllocatorUnavailable { .. })
        ));
        assert!(!tracker.is_tracking());
        unsafe {
            let ptr = tracker.allocate(32) as *mut u8;
            assert!(!ptr.is_null());
            ptr.write_bytes(0x5a, 32);
            assert_eq!(*ptr.add(31), 0x5a);
            assert_eq!(tracker.outstanding(), 0);
            assert!(report(&tracker).is_empty());
            tracker.release(ptr as *mut c_void);
        }
    }

    #[test]
    fn nothing_is_tracked_before_init() {
        let tracker = Tracker::new(SystemAllocator);
        unsafe {
            let ptr = tracker.allocate(8);
            assert_eq!(tracker.outstanding(), 0);
            tracker.release(ptr);
        }
    }

    #[test]
    fn allocation_failure_creates_no_record() {
        let tracker = Tracker::new(Exhausted);
        tracker.enable().unwrap();
        unsafe {
            assert!(tracker.allocate(8).is_null());
            assert!(tracker.allocate_zeroed(2, 8).is_null());
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn zero_sized_allocations_are_tracked() {
        let tracker = tracker();
        unsafe {
            let ptr = tracker.allocate(0);
            if !ptr.is_null() {
                assert_eq!(tracker.leaks()[0].size, 0);
                tracker.release(ptr);
            }
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn realloc_moves_the_record() {
        let tracker = tracker();
        unsafe {
            let ptr = tracker.allocate(8);
            let grown = tracker.reallocate(ptr, 1 << 20);
            assert!(!grown.is_null());
            assert_eq!(tracker.outstanding(), 1);
            assert!(tracker.is_tracked(grown));
            assert_eq!(tracker.leaks()[0].size, 1 << 20);

            let fresh = tracker.reallocate(ptr::null_mut(), 5);
            assert_eq!(tracker.outstanding(), 2);
            tracker.release(fresh);
            tracker.release(grown);
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn failed_realloc_keeps_the_old_record() {
        let tracker = tracker();
        unsafe {
            let ptr = tracker.allocate(8);
            assert!(tracker.reallocate(ptr, usize::MAX).is_null());
            assert!(tracker.is_tracked(ptr));
            tracker.release(ptr);
        }
    }

    #[test]
    fn stacks_are_bounded() {
        let tracker = tracker();
        let ptr = unsafe { tracker.allocate(1) };
        assert!(tracker.leaks()[0].stack.len() <= crate::callstack::MAX_FRAMES);
        unsafe { tracker.release(ptr) };
    }

    #[test]
    fn concurrent_allocations_keep_the_registry_consistent() {
        let tracker = Arc::new(tracker());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..500 {
                        let ptr = unsafe { tracker.allocate(i + 1) };
                        if i % 5 == 0 {
                            kept.push(ptr as usize);
                        } else {
                            unsafe { tracker.release(ptr) };
                        }
                    }
                    kept
                })
            })
            .collect();
        let kept: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(tracker.outstanding(), kept.len());
        assert_eq!(tracker.leaks().len(), kept.len());
        for ptr in kept {
            assert!(tracker.is_tracked(ptr as *const c_void));
            unsafe { tracker.release(ptr as *mut c_void) };
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn written_report_lists_the_leak() {
        let tracker = tracker();
        let ptr = unsafe { tracker.allocate(33) };
        let mut out = Vec::new();
        let report = tracker.write_report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(&format!("33 bytes at {:#x}\n", ptr as usize)));
        assert_eq!(report.leaks.len(), 1);
        unsafe { tracker.release(ptr) };
    }

    #[inline(never)]
    fn allocating_site(tracker: &Tracker<SystemAllocator>) -> *mut c_void {
        std::hint::black_box(unsafe { tracker.allocate(10) })
    }

    #[test]
    fn first_reported_frame_is_the_allocating_function() {
        let tracker = tracker();
        let ptr = allocating_site(&tracker);
        let stack = tracker.leaks()[0].stack;
        let entry = InProcessSymbolizer.symbolize(stack.frames()[0]).unwrap();
        assert!(entry.contains("Tracker") && entry.contains("allocate"), "{}", entry);
        let caller = InProcessSymbolizer.symbolize(stack.callers()[0]).unwrap();
        assert!(caller.contains("allocating_site"), "{}", caller);
        unsafe { tracker.release(ptr) };
    }

    #[test]
    fn release_inside_the_analyzer_drops_the_record() {
        let tracker = tracker();
        unsafe {
            let ptr = tracker.allocate(16);
            shielded(|| tracker.release(ptr));
            assert_eq!(tracker.outstanding(), 0);
            let ptr = tracker.allocate(16);
            let moved = shielded(|| tracker.reallocate(ptr, 4096));
            assert!(tracker.is_tracked(moved));
            assert_eq!(tracker.outstanding(), 1);
            tracker.release(moved);
        }
    }

    #[test]
    fn registry_lock_is_not_taken_twice() {
        let tracker = tracker();
        let nested = tracker.with_registry(|_| tracker.with_registry(|registry| registry.len()));
        assert_eq!(nested, Some(None));
        assert_eq!(tracker.with_registry(|registry| registry.len()), Some(0));
    }

    #[test]
    fn guard_is_not_reentrant() {
        assert_eq!(guarded(|| guarded(|| 1)), Some(None));
        assert_eq!(guarded(|| shielded(is_nested)), Some(true));
        assert!(!is_nested());
    }
}
