//! Fixed-size call stack snapshots taken at allocation time.

use std::fmt;

/// Maximal number of return addresses kept per allocation.
pub const MAX_FRAMES: usize = 32;

/// Start address of the function through which the host entered the analyzer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPoint(usize);

impl EntryPoint {
    /// Keep every frame, including the analyzer's own.
    pub const NONE: EntryPoint = EntryPoint(0);

    pub fn new(addr: usize) -> Self {
        EntryPoint(addr)
    }
}

/// Return addresses of the active call chain, innermost first.
///
/// The frames live inline so that capturing a stack never allocates.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallStack {
    frames: [usize; MAX_FRAMES],
    len: usize,
}

impl CallStack {
    pub const fn empty() -> Self {
        CallStack {
            frames: [0; MAX_FRAMES],
            len: 0,
        }
    }

    /// Walk the current thread's stack.  When the walk passes through `entry`,
    /// everything collected so far is dropped, so frame 0 is the interception
    /// layer's entry function and the host's call site follows it.
    #[inline(never)]
    pub fn capture(entry: EntryPoint) -> Self {
        let mut stack = Self::empty();
        backtrace::trace(|frame| {
            if entry.0 != 0 && frame.symbol_address() as usize == entry.0 {
                stack.len = 0;
            }
            stack.frames[stack.len] = frame.ip() as usize;
            stack.len += 1;
            stack.len < MAX_FRAMES
        });
        stack
    }

    /// Build a stack from known addresses; anything past [`MAX_FRAMES`] is dropped.
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut stack = Self::empty();
        let len = frames.len().min(MAX_FRAMES);
        stack.frames[..len].copy_from_slice(&frames[..len]);
        stack.len = len;
        stack
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    /// Frames worth reporting: everything except the interception layer's own frame.
    pub fn callers(&self) -> &[usize] {
        self.frames().get(1..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| format!("{:#x}", ip)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn recurse(depth: usize) -> CallStack {
        if depth == 0 {
            CallStack::capture(EntryPoint::NONE)
        } else {
            let stack = recurse(depth - 1);
            std::hint::black_box(stack)
        }
    }

    #[inline(never)]
    fn outer_entry() -> CallStack {
        std::hint::black_box(inner_capture())
    }

    #[inline(never)]
    fn inner_capture() -> CallStack {
        std::hint::black_box(CallStack::capture(EntryPoint::new(outer_entry as usize)))
    }

    fn enclosing_function(ip: usize) -> Option<usize> {
        let mut addr = None;
        backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
            addr = addr.or(symbol.addr().map(|a| a as usize));
        });
        addr
    }

    #[test]
    fn capture_sees_callers() {
        let stack = CallStack::capture(EntryPoint::NONE);
        assert!(stack.len() > 1);
        assert_eq!(stack.callers().len(), stack.len() - 1);
        assert!(stack.frames().iter().all(|ip| *ip != 0));
    }

    #[test]
    fn capture_starts_at_the_entry_point() {
        let stack = outer_entry();
        assert_eq!(enclosing_function(stack.frames()[0]), Some(outer_entry as usize));
        assert_ne!(enclosing_function(stack.callers()[0]), Some(inner_capture as usize));
    }

    #[test]
    fn capture_is_bounded() {
        let stack = recurse(100);
        assert_eq!(stack.len(), MAX_FRAMES);
    }

    #[test]
    fn from_frames_truncates() {
        let frames: Vec<usize> = (1..=40).collect();
        let stack = CallStack::from_frames(&frames);
        assert_eq!(stack.len(), MAX_FRAMES);
        assert_eq!(stack.frames(), &frames[..MAX_FRAMES]);
        assert_eq!(stack.callers()[0], 2);
    }

    #[test]
    fn empty_stack_has_no_callers() {
        assert!(CallStack::empty().callers().is_empty());
        assert!(CallStack::from_frames(&[0x10]).callers().is_empty());
    }
}
