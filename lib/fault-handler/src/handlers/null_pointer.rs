//! Implicit null checks.

use crate::context::{FaultInfo, SignalContext};
use crate::handler::{FaultHandler, HandlerId, HandlerKind};
use crate::manager::{FaultFrame, FaultManager};
use crate::runtime::{ManagedRuntime, ObjectLayout};
use std::mem;

/// Turns implicit null checks (a load or store through a null reference that
/// faults in the first page) into null pointer exceptions.
#[derive(Clone, Copy, Debug)]
pub struct NullPointerHandler {
    limit: usize,
}

impl NullPointerHandler {
    /// A handler accepting fault addresses below `limit`.
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Registers a handler in `manager`'s generated-code bucket, using the
    /// manager's implicit null check limit.
    pub fn install(manager: &FaultManager) -> HandlerId {
        let handler = Self::new(manager.config().implicit_null_check_limit);
        manager.add_handler(Box::new(handler), HandlerKind::GeneratedCode)
    }

    /// Returns `true` if the fault address is close enough to null to be an
    /// implicit null check.
    pub fn is_valid_implicit_check(&self, info: &FaultInfo) -> bool {
        info.addr < self.limit
    }

    /// Checks that `method` looks like a method descriptor: its declaring
    /// class must be a class, i.e. its class must be the class of classes,
    /// which is its own class.
    ///
    /// Only fields that never move are read, without read barriers. If
    /// `method` is garbage one of the reads may fault again; the nested fault
    /// is forwarded down the signal chain.
    pub fn is_valid_method(method: usize, layout: &ObjectLayout) -> bool {
        if method == 0 || method % mem::align_of::<usize>() != 0 {
            return false;
        }

        let klass = unsafe { layout.read_reference(method, layout.declaring_class_offset) };
        if klass == 0 || !layout.is_object_aligned(klass) {
            return false;
        }

        let class_class = unsafe { layout.read_reference(klass, layout.class_offset) };
        if class_class == 0 || !layout.is_object_aligned(class_class) {
            return false;
        }

        let class_class_class = unsafe { layout.read_reference(class_class, layout.class_offset) };
        class_class == class_class_class
    }

    /// Returns `true` if the runtime can map the return pc of `frame` to a
    /// position inside its method.
    pub fn is_valid_return_pc(runtime: &dyn ManagedRuntime, frame: &FaultFrame) -> bool {
        runtime
            .dex_pc_for_return_pc(frame.method, frame.sp, frame.return_pc)
            .is_some()
    }
}

impl FaultHandler for NullPointerHandler {
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
        if !self.is_valid_implicit_check(info) {
            return false;
        }

        let frame = match manager.method_and_return_pc(info, context) {
            Some(frame) => frame,
            None => return false,
        };

        let runtime = manager.runtime();
        if !Self::is_valid_method(frame.method, &runtime.object_layout()) {
            return false;
        }
        if !Self::is_valid_return_pc(runtime, &frame) {
            return false;
        }

        let thread = match runtime.current_thread() {
            Some(thread) => thread,
            None => return false,
        };

        tracing::trace!(
            target: "signals",
            addr = info.addr,
            return_pc = frame.return_pc,
            "implicit null check"
        );
        runtime.deliver_null_pointer(thread, context, frame.return_pc);
        true
    }

    fn name(&self) -> &'static str {
        "NullPointerHandler"
    }
}
