//! What the fault manager needs from the managed runtime it is embedded in.
//!
//! Unless stated otherwise the methods of [`ManagedRuntime`] are called from
//! the fault signal handler: they must not block, must not allocate and must
//! tolerate being called on any thread at any point of its execution.

use crate::context::{FaultInfo, SignalContext};
use std::ops::Range;
use std::ptr;

/// An opaque handle to a runtime thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub usize);

/// The cooperative execution state of a runtime thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Running managed code; the thread may touch managed objects.
    Runnable,
    /// Running native code outside of the runtime's control.
    Native,
    /// Blocked waiting on a monitor, a condition or I/O.
    Blocked,
    /// Parked by a suspend request.
    Suspended,
    /// Attaching to or detaching from the runtime.
    Transitioning,
}

/// The width of references stored in managed objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceWidth {
    /// 32-bit references to a heap mapped in the low 4 GiB.
    Compressed,
    /// Pointer-sized references.
    Native,
}

/// The parts of the managed object layout the null-pointer handler reads
/// speculatively.
///
/// Only reads that are safe without read barriers or locks belong here: the
/// declaring class of a method and the class of a class object are never
/// moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Offset of the declaring-class reference inside a method descriptor.
    pub declaring_class_offset: usize,
    /// Offset of the class reference inside every object header.
    pub class_offset: usize,
    /// Width of both references.
    pub reference_width: ReferenceWidth,
    /// Alignment of every managed object.
    pub object_alignment: usize,
}

impl Default for ObjectLayout {
    fn default() -> Self {
        Self {
            declaring_class_offset: 0,
            class_offset: 0,
            reference_width: ReferenceWidth::Compressed,
            object_alignment: 8,
        }
    }
}

impl ObjectLayout {
    /// Reads the reference stored at `base + offset`.
    ///
    /// # Safety
    ///
    /// This dereferences `base + offset` without any check. From the fault
    /// handler a bad address simply faults again, which the dispatcher
    /// tolerates.
    pub unsafe fn read_reference(&self, base: usize, offset: usize) -> usize {
        let address = base.wrapping_add(offset);
        match self.reference_width {
            ReferenceWidth::Compressed => unsafe {
                ptr::read_volatile(address as *const u32) as usize
            },
            ReferenceWidth::Native => unsafe { ptr::read_volatile(address as *const usize) },
        }
    }

    /// Returns `true` if `address` is a valid object alignment.
    pub fn is_object_aligned(&self, address: usize) -> bool {
        address % self.object_alignment == 0
    }
}

/// A managed frame reported while walking a thread's stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagedFrame<'a> {
    /// The method descriptor of the frame.
    pub method: usize,
    /// The logical position inside the method, if known.
    pub dex_pc: Option<u32>,
    /// A printable description of the method.
    pub name: &'a str,
}

/// The runtime services the fault manager and its handlers rely on.
pub trait ManagedRuntime: Send + Sync {
    /// The runtime thread the caller runs on, if it is attached.
    fn current_thread(&self) -> Option<ThreadHandle>;

    /// The execution state of `thread`.
    fn thread_state(&self, thread: ThreadHandle) -> ThreadState;

    /// Returns `true` if `thread` holds the shared (reader) side of the global
    /// execution lock.
    fn holds_shared_execution_lock(&self, thread: ThreadHandle) -> bool;

    /// Returns `true` once the runtime has started and can run checkpoints.
    fn is_started(&self) -> bool;

    /// Makes every runtime thread pass through a safepoint and returns once
    /// they all did.
    ///
    /// Called from ordinary thread context only, never from the fault handler.
    fn run_empty_checkpoint(&self);

    /// The program counter of the faulting instruction.
    fn fault_pc(&self, _info: &FaultInfo, context: &SignalContext) -> usize {
        context.pc()
    }

    /// The stack pointer at the time of the fault.
    fn fault_sp(&self, context: &SignalContext) -> usize {
        context.sp()
    }

    /// The return address the faulting instruction is attributed to when it is
    /// mapped to a logical position.
    ///
    /// On fixed-width instruction sets this is the next instruction. Elsewhere
    /// the default attributes the fault to the faulting instruction itself;
    /// runtimes whose stack maps are keyed differently override it.
    fn return_pc(&self, info: &FaultInfo, context: &SignalContext) -> usize {
        let pc = self.fault_pc(info, context);
        if pc == 0 {
            return 0;
        }
        if cfg!(any(target_arch = "aarch64", target_arch = "riscv64")) {
            pc + 4
        } else {
            pc
        }
    }

    /// The object layout used to validate suspected method descriptors.
    fn object_layout(&self) -> ObjectLayout {
        ObjectLayout::default()
    }

    /// Maps `return_pc` inside `method` (whose frame starts at `sp`) to a
    /// logical position.
    ///
    /// May take runtime-internal locks; only called once the fault is known to
    /// come from generated code.
    fn dex_pc_for_return_pc(&self, method: usize, sp: usize, return_pc: usize) -> Option<u32>;

    /// The page generated code loads from to poll for suspend requests.
    fn suspend_trigger_page(&self, _thread: ThreadHandle) -> Option<usize> {
        None
    }

    /// The guard region at the end of `thread`'s stack.
    fn stack_guard_region(&self, _thread: ThreadHandle) -> Option<Range<usize>> {
        None
    }

    /// Offers a `SIGBUS` to the runtime, for example to a collector that
    /// uses userfaults to populate moved pages. Returns `true` if it was
    /// resolved.
    fn handle_sigbus(&self, _info: &FaultInfo, _context: &mut SignalContext) -> bool {
        false
    }

    /// Records `sp` as the top managed frame of `thread`.
    fn set_top_of_managed_stack(&self, _thread: ThreadHandle, _sp: usize) {}

    /// Walks the managed frames of `thread` from its top, calling `visit` for
    /// each of them.
    fn walk_managed_stack(
        &self,
        _thread: ThreadHandle,
        _visit: &mut dyn FnMut(&ManagedFrame<'_>),
    ) {
    }

    /// Redirects `thread` so that, once the signal handler returns, it throws
    /// a null pointer exception attributed to `return_pc`.
    fn deliver_null_pointer(
        &self,
        thread: ThreadHandle,
        context: &mut SignalContext,
        return_pc: usize,
    );

    /// Redirects `thread` into the runtime's suspend-check slow path.
    fn deliver_suspend_check(&self, thread: ThreadHandle, context: &mut SignalContext);

    /// Redirects `thread` so that it throws a stack overflow error.
    fn deliver_stack_overflow(&self, thread: ThreadHandle, context: &mut SignalContext);
}
