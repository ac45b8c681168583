//! Stack overflow probes in generated code.

use crate::context::{FaultInfo, SignalContext};
use crate::handler::{FaultHandler, HandlerId, HandlerKind};
use crate::manager::FaultManager;
use std::ops::Range;

/// Claims the faults generated code takes when its stack overflow probe hits
/// the protected end of the thread's stack.
#[derive(Clone, Copy, Debug)]
pub struct StackOverflowHandler {
    reserved_bytes: usize,
}

impl StackOverflowHandler {
    /// A handler recognizing probes `reserved_bytes` below the stack pointer.
    pub fn new(reserved_bytes: usize) -> Self {
        Self { reserved_bytes }
    }

    /// Registers a handler in `manager`'s generated-code bucket, using the
    /// manager's reserved byte count.
    pub fn install(manager: &FaultManager) -> HandlerId {
        let handler = Self::new(manager.config().stack_overflow_reserved_bytes);
        manager.add_handler(Box::new(handler), HandlerKind::GeneratedCode)
    }

    /// Returns `true` if a fault at `addr` with stack pointer `sp` is an
    /// overflow: either the implicit probe at `sp - reserved_bytes` or an
    /// access inside the thread's guard region.
    pub fn is_overflow_address(&self, addr: usize, sp: usize, guard: Option<Range<usize>>) -> bool {
        if sp != 0 && addr == sp.wrapping_sub(self.reserved_bytes) {
            return true;
        }
        guard.is_some_and(|guard| guard.contains(&addr))
    }
}

impl FaultHandler for StackOverflowHandler {
    fn action(
        &self,
        manager: &FaultManager,
        signal: libc::c_int,
        info: &FaultInfo,
        context: &mut SignalContext,
    ) -> bool {
        if signal != libc::SIGSEGV {
            return false;
        }
        let runtime = manager.runtime();
        let thread = match runtime.current_thread() {
            Some(thread) => thread,
            None => return false,
        };
        let sp = manager.fault_sp(context);
        if !self.is_overflow_address(info.addr, sp, runtime.stack_guard_region(thread)) {
            return false;
        }

        tracing::trace!(target: "signals", addr = info.addr, sp, "stack overflow found");
        runtime.deliver_stack_overflow(thread, context);
        true
    }

    fn name(&self) -> &'static str {
        "StackOverflowHandler"
    }
}
