//! Registry of address ranges holding runtime-generated machine code.
//!
//! The registry is consulted from the fault signal handler, on whatever thread
//! faulted and at whatever point it faulted, so the read side
//! ([`CodeRangeRegistry::contains`]) takes no lock and allocates nothing: it
//! is an acquire load of the list head followed by relaxed loads of the
//! `next` links.
//!
//! Writers serialize on a mutex. A removed node keeps its `next` link so that
//! a concurrent walk positioned on it still reaches every remaining node, and
//! the node is only freed after the caller-provided quiescence callback (a
//! safepoint checkpoint of the runtime) guarantees no walk can still hold it.

use crate::membarrier::{membarrier, MembarrierCommand};
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct CodeRange {
    next: AtomicPtr<CodeRange>,
    start: usize,
    size: usize,
}

/// A lock-free readable list of `[start, start + size)` code ranges.
pub struct CodeRangeRegistry {
    head: AtomicPtr<CodeRange>,
    lock: Mutex<()>,
}

impl CodeRangeRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            lock: parking_lot::const_mutex(()),
        }
    }

    /// Registers `[start, start + size)` as generated code.
    ///
    /// After publishing the range this issues a private expedited membarrier,
    /// so that a thread which reaches the new code through a path that does
    /// not synchronize with this call still sees the range before it can
    /// fault inside it.
    pub fn add_range(&self, start: usize, size: usize) {
        let new_range = Box::into_raw(Box::new(CodeRange {
            next: AtomicPtr::new(ptr::null_mut()),
            start,
            size,
        }));
        {
            let _guard = self.lock.lock();
            let old_head = self.head.load(Ordering::Relaxed);
            unsafe { (*new_range).next.store(old_head, Ordering::Relaxed) };
            self.head.store(new_range, Ordering::Release);
        }

        if let Err(err) = membarrier(MembarrierCommand::PrivateExpedited) {
            tracing::trace!(target: "signals", %err, "membarrier after adding code range failed");
        }
    }

    /// Unregisters the range starting at `start`.
    ///
    /// `quiesce` is called after the range is unlinked and before it is freed;
    /// it must not return while a [`contains`](Self::contains) walk that began
    /// before the unlink is still running.
    ///
    /// # Panics
    ///
    /// Panics if no range starts at `start`, or if its size is not `size`:
    /// both mean registrations and removals are mismatched.
    pub fn remove_range<F: FnOnce()>(&self, start: usize, size: usize, quiesce: F) {
        let removed = {
            let _guard = self.lock.lock();
            let mut before: &AtomicPtr<CodeRange> = &self.head;
            let mut range = before.load(Ordering::Relaxed);
            while !range.is_null() && unsafe { (*range).start } != start {
                before = unsafe { &(*range).next };
                range = before.load(Ordering::Relaxed);
            }
            assert!(
                !range.is_null(),
                "attempted to remove unregistered generated code range at {:#x}",
                start
            );
            let found = unsafe { &*range };
            assert_eq!(
                found.size, size,
                "size mismatch removing generated code range at {:#x}",
                start
            );

            let next = found.next.load(Ordering::Relaxed);
            if ptr::eq(before, &self.head) {
                // A relaxed store to the head would not continue the release
                // sequence readers synchronize with.
                before.store(next, Ordering::Release);
            } else {
                // Nothing new is published here. `found.next` stays intact so
                // a concurrent walk standing on `found` still reaches `next`.
                before.store(next, Ordering::Relaxed);
            }
            range
        };

        quiesce();
        drop(unsafe { Box::from_raw(removed) });
    }

    /// Returns `true` if `pc` lies in a registered range.
    ///
    /// Safe to call from a signal handler.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        self.walk(pc, |_, _| {})
    }

    /// The walk behind [`contains`](Self::contains), calling `visit` with the
    /// `(start, size)` of every node it looks at.
    #[doc(hidden)]
    pub fn walk<V: FnMut(usize, usize)>(&self, pc: usize, mut visit: V) -> bool {
        let mut range = self.head.load(Ordering::Acquire);
        while let Some(current) = unsafe { range.as_ref() } {
            visit(current.start, current.size);
            if pc.wrapping_sub(current.start) < current.size {
                return true;
            }
            // A concurrently removed node may or may not be visited depending
            // on when the relaxed `next` stores become visible. Removed nodes
            // keep their `next` link, so every retained node is still reached.
            range = current.next.load(Ordering::Relaxed);
        }
        false
    }

    /// Frees every registered range.
    ///
    /// Only for teardown: no walk may be running concurrently.
    pub fn clear(&self) {
        let mut range = {
            let _guard = self.lock.lock();
            self.head.swap(ptr::null_mut(), Ordering::AcqRel)
        };
        while !range.is_null() {
            let current = unsafe { Box::from_raw(range) };
            range = current.next.load(Ordering::Relaxed);
        }
    }

    /// Number of registered ranges.
    pub fn len(&self) -> usize {
        let _guard = self.lock.lock();
        let mut count = 0;
        let mut range = self.head.load(Ordering::Relaxed);
        while let Some(current) = unsafe { range.as_ref() } {
            count += 1;
            range = current.next.load(Ordering::Relaxed);
        }
        count
    }

    /// Returns `true` if no range is registered.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Default for CodeRangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CodeRangeRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
