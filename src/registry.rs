//! Intrusive registry of live allocations.
//!
//! Each record carries its own `prev`/`next` links, so linking and unlinking
//! never allocate.  The registry owns every record reachable from its head;
//! storage for records is provided (and reclaimed) by the caller, which lets the
//! tracker take it straight from the real allocator.

use std::{fmt, marker::PhantomData, ptr::NonNull};

use crate::callstack::CallStack;

/// One outstanding allocation.
pub struct AllocationRecord {
    ptr: usize,
    size: usize,
    stack: CallStack,
    prev: Option<NonNull<AllocationRecord>>,
    next: Option<NonNull<AllocationRecord>>,
}

impl AllocationRecord {
    pub fn new(ptr: usize, size: usize, stack: CallStack) -> Self {
        AllocationRecord {
            ptr,
            size,
            stack,
            prev: None,
            next: None,
        }
    }

    /// Address handed out to the host.
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    /// Re-key a detached record, e.g. after `realloc` moved the block.
    pub(crate) fn reassign(&mut self, ptr: usize, size: usize, stack: CallStack) {
        debug_assert!(self.prev.is_none() && self.next.is_none());
        self.ptr = ptr;
        self.size = size;
        self.stack = stack;
    }
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRecord")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("size", &self.size)
            .field("stack", &self.stack)
            .finish()
    }
}

/// Doubly-linked chain of [`AllocationRecord`]s, most recent first.
pub struct Registry {
    head: Option<NonNull<AllocationRecord>>,
    len: usize,
}

// The registry is only ever touched behind the tracker's mutex.
unsafe impl Send for Registry {}

impl Registry {
    pub const fn new() -> Self {
        Registry { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link `record` at the head.
    ///
    /// # Safety
    ///
    /// `record` must point to a valid, initialized record that is not linked into
    /// any registry, and must stay valid until it is handed back by [`Registry::remove`].
    pub unsafe fn insert(&mut self, mut record: NonNull<AllocationRecord>) {
        debug_assert!(
            !self.contains(record.as_ref().ptr),
            "{:#x} is already registered",
            record.as_ref().ptr
        );
        let rec = record.as_mut();
        rec.prev = None;
        rec.next = self.head;
        if let Some(mut head) = self.head {
            head.as_mut().prev = Some(record);
        }
        self.head = Some(record);
        self.len += 1;
    }

    /// Unlink the record for `ptr` and return it to the caller, who becomes
    /// responsible for its storage.  Returns `None` for pointers that are not
    /// tracked.
    pub fn remove(&mut self, ptr: usize) -> Option<NonNull<AllocationRecord>> {
        let mut record = self.find(ptr)?;
        // SAFETY: every reachable record is valid while linked (see `insert`).
        unsafe {
            let rec = record.as_mut();
            match rec.prev {
                Some(mut prev) => prev.as_mut().next = rec.next,
                None => self.head = rec.next,
            }
            if let Some(mut next) = rec.next {
                next.as_mut().prev = rec.prev;
            }
            rec.prev = None;
            rec.next = None;
        }
        self.len -= 1;
        Some(record)
    }

    pub fn contains(&self, ptr: usize) -> bool {
        self.find(ptr).is_some()
    }

    /// Records from head to tail, i.e. most recently allocated first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _registry: PhantomData,
        }
    }

    fn find(&self, ptr: usize) -> Option<NonNull<AllocationRecord>> {
        let mut cursor = self.head;
        while let Some(record) = cursor {
            // SAFETY: see `insert`.
            let rec = unsafe { record.as_ref() };
            if rec.ptr == ptr {
                return Some(record);
            }
            cursor = rec.next;
        }
        None
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a> {
    next: Option<NonNull<AllocationRecord>>,
    _registry: PhantomData<&'a Registry>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a AllocationRecord;

    fn next(&mut self) -> Option<&'a AllocationRecord> {
        let record = self.next?;
        // SAFETY: the registry is borrowed for 'a, so no record can be unlinked
        // or freed while the iterator is alive.
        let rec = unsafe { record.as_ref() };
        self.next = rec.next;
        Some(rec)
    }
}
