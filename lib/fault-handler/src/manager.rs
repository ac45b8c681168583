//! The fault manager: lifecycle, handler ownership and fault dispatch.

use crate::code_ranges::CodeRangeRegistry;
use crate::config::FaultManagerConfig;
use crate::context::{FaultInfo, SignalContext};
use crate::error::FaultError;
use crate::handler::{FaultHandler, HandlerChain, HandlerId, HandlerKind};
use crate::membarrier::{membarrier, MembarrierCommand};
use crate::runtime::{ManagedRuntime, ThreadState};
use fault_sigchain::{SigactionChain, SignalChain, SignalMask, SpecialHandler};
use parking_lot::RwLock;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

/// The manager the signal trampoline dispatches to.
static ACTIVE_MANAGER: AtomicPtr<FaultManager> = AtomicPtr::new(ptr::null_mut());

/// Called for every fault no handler claimed, right before the fault is handed
/// to the next handler of the signal chain.
///
/// Set a breakpoint here to be informed when a fault is not handled. It is
/// kept out of line and exported so debuggers find it without inline info.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn fault_handler_unhandled_fault() {
    tracing::debug!(
        target: "signals",
        "Caught unknown fault in fault handler - chaining to next handler."
    );
}

fn fault_trampoline(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) -> bool {
    let manager = ACTIVE_MANAGER.load(Ordering::Acquire);
    match unsafe { manager.as_ref() } {
        Some(manager) => unsafe { manager.handle_raw_fault(signal, info, context) },
        None => false,
    }
}

/// Lifecycle state of a [`FaultManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    /// Constructed, signals not claimed yet.
    Uninitialized = 0,
    /// Signals claimed; faults are dispatched.
    Installed = 1,
    /// Signals temporarily unclaimed; handlers and ranges are kept.
    Released = 2,
    /// Handlers and ranges destroyed; cannot be installed again.
    ShutDown = 3,
}

impl ManagerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Installed,
            2 => Self::Released,
            _ => Self::ShutDown,
        }
    }
}

/// Where a fault happened inside a generated-code frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultFrame {
    /// The suspected method descriptor, read from the top of the stack.
    pub method: usize,
    /// The return address the fault is attributed to.
    pub return_pc: usize,
    /// The stack pointer at the time of the fault.
    pub sp: usize,
}

/// Decides, for every fault signal, whether it is an expected condition of
/// generated code and which handler deals with it.
///
/// A manager is constructed explicitly and installed with
/// [`init`](Self::init); the owning runtime drives the rest of the lifecycle
/// through [`release`](Self::release) and [`shutdown`](Self::shutdown).
/// Only one manager can be installed at a time.
///
/// Handlers are only added and removed while no fault is being dispatched.
/// A handler must not add or remove handlers from its
/// [`action`](FaultHandler::action).
pub struct FaultManager {
    runtime: Arc<dyn ManagedRuntime>,
    chain: Arc<dyn SignalChain>,
    config: FaultManagerConfig,
    handlers: RwLock<HandlerChain>,
    code_ranges: CodeRangeRegistry,
    state: AtomicU8,
}

/// Builds a [`FaultManager`].
pub struct FaultManagerBuilder {
    runtime: Arc<dyn ManagedRuntime>,
    chain: Option<Arc<dyn SignalChain>>,
    config: FaultManagerConfig,
}

impl FaultManagerBuilder {
    /// Replaces the configuration.
    pub fn config(mut self, config: FaultManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Claims signals through `chain` instead of installing them with
    /// `sigaction` directly.
    pub fn signal_chain(mut self, chain: Arc<dyn SignalChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Builds the manager. Nothing is installed yet.
    pub fn build(self) -> FaultManager {
        FaultManager {
            runtime: self.runtime,
            chain: self.chain.unwrap_or_else(|| Arc::new(SigactionChain)),
            config: self.config,
            handlers: RwLock::new(HandlerChain::default()),
            code_ranges: CodeRangeRegistry::new(),
            state: AtomicU8::new(ManagerState::Uninitialized as u8),
        }
    }
}

impl FaultManager {
    /// Creates a manager claiming signals with `sigaction`.
    pub fn new(runtime: Arc<dyn ManagedRuntime>, config: FaultManagerConfig) -> Self {
        Self::builder(runtime).config(config).build()
    }

    /// Starts building a manager.
    pub fn builder(runtime: Arc<dyn ManagedRuntime>) -> FaultManagerBuilder {
        FaultManagerBuilder {
            runtime,
            chain: None,
            config: FaultManagerConfig::default(),
        }
    }

    /// The runtime this manager serves.
    pub fn runtime(&self) -> &dyn ManagedRuntime {
        &*self.runtime
    }

    /// The configuration.
    pub fn config(&self) -> &FaultManagerConfig {
        &self.config
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` while the manager's signals are claimed.
    pub fn is_initialized(&self) -> bool {
        self.state() == ManagerState::Installed
    }

    /// Claims the fault signals and starts dispatching faults to this manager.
    ///
    /// Also registers the process for private expedited membarriers, which
    /// [`add_generated_code_range`](Self::add_generated_code_range) relies
    /// on; a failed registration is logged and otherwise ignored.
    ///
    /// Fails with [`FaultError::AnotherManagerActive`] while another manager
    /// is installed; nothing is claimed in that case.
    ///
    /// # Panics
    ///
    /// Panics if the manager is already installed.
    pub fn init(&'static self) -> Result<(), FaultError> {
        let state = self.state();
        assert_ne!(
            state,
            ManagerState::Installed,
            "fault manager is already installed"
        );
        if state == ManagerState::ShutDown {
            return Err(FaultError::ShutDown);
        }

        // Keep synchronous fault signals deliverable while a handler runs so
        // that a nested fault reaches the next handler of the chain.
        let mask = SignalMask::full()
            .without(libc::SIGABRT)
            .without(libc::SIGBUS)
            .without(libc::SIGFPE)
            .without(libc::SIGILL)
            .without(libc::SIGSEGV);

        // Every manager registers the same trampoline, so only one of them can
        // own the fault signals at a time.
        let this = self as *const FaultManager as *mut FaultManager;
        if ACTIVE_MANAGER
            .compare_exchange(ptr::null_mut(), this, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FaultError::AnotherManagerActive);
        }

        let signals = self.config.signals();
        for (claimed, &signal) in signals.iter().enumerate() {
            let handler = SpecialHandler::new(fault_trampoline, mask);
            if let Err(err) = self.chain.add_special_handler(signal, handler) {
                for &signal in &signals[..claimed] {
                    self.chain.remove_special_handler(signal, fault_trampoline);
                }
                let _ = ACTIVE_MANAGER.compare_exchange(
                    this,
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Err(err.into());
            }
        }

        if let Err(err) = membarrier(MembarrierCommand::RegisterPrivateExpedited) {
            tracing::warn!(
                %err,
                "FaultHandler: MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED failed"
            );
        }

        self.state
            .store(ManagerState::Installed as u8, Ordering::Release);
        tracing::debug!(?signals, "fault manager installed");
        Ok(())
    }

    /// Unclaims the fault signals, keeping handlers and code ranges.
    pub fn release(&self) {
        if !self.is_initialized() {
            return;
        }
        let this = self as *const FaultManager as *mut FaultManager;
        let active = ACTIVE_MANAGER
            .compare_exchange(this, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if active {
            for &signal in self.config.signals() {
                self.chain.remove_special_handler(signal, fault_trampoline);
            }
        } else {
            // The trampoline registrations belong to the active manager.
            tracing::warn!("releasing a fault manager that is not the active one");
        }
        self.state
            .store(ManagerState::Released as u8, Ordering::Release);
        tracing::debug!("fault manager released");
    }

    /// Unclaims the fault signals and destroys every handler and every
    /// remaining code range, including ranges their owner never removed
    /// (code that is never unloaded).
    pub fn shutdown(&self) {
        if self.state() == ManagerState::ShutDown {
            return;
        }
        self.release();
        self.handlers.write().clear();
        self.code_ranges.clear();
        self.state
            .store(ManagerState::ShutDown as u8, Ordering::Release);
        tracing::debug!("fault manager shut down");
    }

    /// Dispatches a fault delivered by the OS.
    ///
    /// # Safety
    ///
    /// `info` and `context` must be the pointers the kernel passed to the
    /// signal handler.
    pub unsafe fn handle_raw_fault(
        &self,
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) -> bool {
        let info = unsafe { FaultInfo::from_raw(info) };
        let mut context = unsafe { SignalContext::from_raw(context) };
        self.handle_fault(signal, &info, &mut context)
    }

    /// Dispatches a fault.
    ///
    /// `SIGSEGV` goes to the generated-code handlers first (only if the fault
    /// pc is in generated code), then to the other handlers. The first handler
    /// that claims the fault wins. `SIGBUS` never reaches the handler buckets:
    /// it is offered to [`ManagedRuntime::handle_sigbus`] only.
    ///
    /// Returns `false` if nobody claimed the fault, in which case the next
    /// handler of the signal chain should get it. Always returns `false` when
    /// the manager is not installed.
    pub fn handle_fault(
        &self,
        signal: libc::c_int,
        info: &FaultInfo,
        context: &mut SignalContext,
    ) -> bool {
        if self.config.log_signal_info {
            tracing::trace!(target: "signals", "Handling fault:\n{}", info);
        }

        #[cfg(feature = "nested-signal-test")]
        unsafe {
            // Simulate a crash in a handler.
            libc::raise(signal);
        }

        if !self.is_initialized() {
            tracing::trace!(target: "signals", "fault manager not installed");
            return false;
        }

        if signal == libc::SIGBUS {
            if self.runtime.handle_sigbus(info, context) {
                tracing::debug!(target: "signals", "SIGBUS handled by the runtime");
                return true;
            }
            fault_handler_unhandled_fault();
            return false;
        }

        let handlers = match self.handlers.try_read_recursive() {
            Some(handlers) => handlers,
            None => {
                tracing::trace!(target: "signals", "handler chain is being modified");
                fault_handler_unhandled_fault();
                return false;
            }
        };

        if self.is_in_generated_code(info, context) {
            tracing::trace!(target: "signals", "in generated code, looking for handler");
            for (id, handler) in handlers.bucket(HandlerKind::GeneratedCode) {
                tracing::trace!(
                    target: "signals",
                    %id,
                    handler = handler.name(),
                    "invoking action on handler"
                );
                if handler.action(self, signal, info, context) {
                    // Time to return from the signal handler to wherever the
                    // handler redirected the thread.
                    tracing::debug!(
                        target: "signals",
                        %id,
                        handler = handler.name(),
                        "fault handled"
                    );
                    return true;
                }
            }
        }

        // A fault we did not handle. Other handlers may still know something
        // about it.
        if self.handle_fault_by_other_handlers(&handlers, signal, info, context) {
            return true;
        }

        fault_handler_unhandled_fault();
        false
    }

    fn handle_fault_by_other_handlers(
        &self,
        handlers: &HandlerChain,
        signal: libc::c_int,
        info: &FaultInfo,
        context: &mut SignalContext,
    ) -> bool {
        for (id, handler) in handlers.bucket(HandlerKind::Other) {
            if handler.action(self, signal, info, context) {
                tracing::debug!(target: "signals", %id, handler = handler.name(), "fault handled");
                return true;
            }
        }
        false
    }

    /// Returns `true` if the fault happened while the current thread was
    /// running generated code.
    ///
    /// Checks, cheapest and safest first: the thread is attached, it is
    /// `Runnable`, it holds the shared execution lock, a fault pc can be read
    /// from the context, and that pc lies in a registered code range.
    pub fn is_in_generated_code(&self, info: &FaultInfo, context: &SignalContext) -> bool {
        tracing::trace!(target: "signals", "Checking for generated code");
        let thread = match self.runtime.current_thread() {
            Some(thread) => thread,
            None => {
                tracing::trace!(target: "signals", "no current thread");
                return false;
            }
        };

        if self.runtime.thread_state(thread) != ThreadState::Runnable {
            tracing::trace!(target: "signals", "not runnable");
            return false;
        }

        if !self.runtime.holds_shared_execution_lock(thread) {
            tracing::trace!(target: "signals", "no lock");
            return false;
        }

        let fault_pc = self.runtime.fault_pc(info, context);
        if fault_pc == 0 {
            tracing::trace!(target: "signals", "no fault PC");
            return false;
        }

        self.code_ranges.contains(fault_pc)
    }

    /// The program counter of the faulting instruction.
    pub fn fault_pc(&self, info: &FaultInfo, context: &SignalContext) -> usize {
        self.runtime.fault_pc(info, context)
    }

    /// The stack pointer at the time of the fault.
    pub fn fault_sp(&self, context: &SignalContext) -> usize {
        self.runtime.fault_sp(context)
    }

    /// Reads the suspected method of the faulting frame from the top of the
    /// stack, along with the return pc and the stack pointer.
    ///
    /// Only meaningful once [`is_in_generated_code`](Self::is_in_generated_code)
    /// holds. The read of the stack slot is not guarded: if the stack pointer is
    /// bogus this faults again, which the dispatcher tolerates.
    pub fn method_and_return_pc(
        &self,
        info: &FaultInfo,
        context: &SignalContext,
    ) -> Option<FaultFrame> {
        let sp = self.runtime.fault_sp(context);
        if sp == 0 {
            return None;
        }
        // In generated code, sp[0] is the method of the current frame.
        let method = unsafe { ptr::read_volatile(sp as *const usize) };
        let return_pc = self.runtime.return_pc(info, context);
        Some(FaultFrame {
            method,
            return_pc,
            sp,
        })
    }

    /// Registers `handler` in the `kind` bucket, after every handler already
    /// there. The manager owns it until it is removed or the manager shuts down.
    pub fn add_handler(&self, handler: Box<dyn FaultHandler>, kind: HandlerKind) -> HandlerId {
        let name = handler.name();
        let id = self.handlers.write().add(handler, kind);
        tracing::debug!(%id, handler = name, ?kind, "added fault handler");
        id
    }

    /// Removes a handler and gives it back.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn remove_handler(&self, id: HandlerId) -> Box<dyn FaultHandler> {
        match self.handlers.write().remove(id) {
            Some(handler) => handler,
            None => panic!("Attempted to remove non existent handler {}", id),
        }
    }

    /// Number of handlers in the `kind` bucket.
    pub fn handler_count(&self, kind: HandlerKind) -> usize {
        self.handlers.read().len(kind)
    }

    /// Registers `[start, start + size)` as generated code.
    pub fn add_generated_code_range(&self, start: usize, size: usize) {
        self.code_ranges.add_range(start, size);
    }

    /// Unregisters the generated code range starting at `start`.
    ///
    /// The range is freed after a runtime checkpoint, so that no fault handler
    /// walking the registry can still reference it. Before the runtime has
    /// started there is nobody to wait for and it is freed right away.
    ///
    /// # Panics
    ///
    /// Panics if no range of `size` bytes starts at `start`.
    pub fn remove_generated_code_range(&self, start: usize, size: usize) {
        let runtime = &*self.runtime;
        self.code_ranges.remove_range(start, size, || {
            if runtime.is_started() {
                runtime.run_empty_checkpoint();
            }
        });
    }

    /// The registered generated code ranges.
    pub fn generated_code_ranges(&self) -> &CodeRangeRegistry {
        &self.code_ranges
    }
}

impl Drop for FaultManager {
    fn drop(&mut self) {
        // Never leave the trampoline pointing at freed memory.
        self.release();
    }
}

impl fmt::Debug for FaultManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FaultManager")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
