//! Diagnostics for crashes inside generated code.

use crate::context::{FaultInfo, SignalContext};
use crate::handler::{FaultHandler, HandlerId, HandlerKind};
use crate::manager::FaultManager;
use crate::runtime::ManagedFrame;

/// Logs the managed stack of a crash in generated code.
///
/// Never claims a fault: the crash still goes down the signal chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManagedStackTraceHandler;

impl ManagedStackTraceHandler {
    /// Registers a handler in `manager`'s other bucket.
    pub fn install(manager: &FaultManager) -> HandlerId {
        manager.add_handler(Box::new(Self), HandlerKind::Other)
    }
}

impl FaultHandler for ManagedStackTraceHandler {
    fn action(
        &self,
        manager: &FaultManager,
        _signal: libc::c_int,
        info: &FaultInfo,
        context: &mut SignalContext,
    ) -> bool {
        if !manager.is_in_generated_code(info, context) {
            return false;
        }
        let runtime = manager.runtime();
        let thread = match runtime.current_thread() {
            Some(thread) => thread,
            None => return false,
        };

        tracing::error!("Dumping managed stack trace for crash in generated code");
        runtime.set_top_of_managed_stack(thread, manager.fault_sp(context));
        let mut depth = 0usize;
        runtime.walk_managed_stack(thread, &mut |frame: &ManagedFrame<'_>| {
            tracing::error!(
                depth,
                method = frame.method,
                dex_pc = ?frame.dex_pc,
                "  at {}",
                frame.name
            );
            depth += 1;
        });
        false
    }

    fn name(&self) -> &'static str {
        "ManagedStackTraceHandler"
    }
}
