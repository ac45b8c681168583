//! Suspend requests made through a protected trigger page.

use crate::context::{FaultInfo, SignalContext};
use crate::handler::{FaultHandler, HandlerId, HandlerKind};
use crate::manager::FaultManager;

/// Claims loads from the suspend trigger page, which the runtime protects to
/// make generated code enter its suspend check.
#[derive(Clone, Copy, Debug, Default)]
pub struct SuspensionHandler;

impl SuspensionHandler {
    /// Registers a handler in `manager`'s generated-code bucket.
    pub fn install(manager: &FaultManager) -> HandlerId {
        manager.add_handler(Box::new(Self), HandlerKind::GeneratedCode)
    }

    /// Returns `true` if `addr` lies in the trigger page starting at `page`.
    pub fn is_trigger_address(addr: usize, page: usize) -> bool {
        addr.wrapping_sub(page) < region::page::size()
    }
}

impl FaultHandler for SuspensionHandler {
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
        match runtime.suspend_trigger_page(thread) {
            Some(page) if Self::is_trigger_address(info.addr, page) => {
                tracing::trace!(target: "signals", "suspend check");
                runtime.deliver_suspend_check(thread, context);
                true
            }
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        "SuspensionHandler"
    }
}
