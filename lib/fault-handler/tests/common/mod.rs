#![allow(dead_code)]

use fault_handler::runtime::{ManagedFrame, ObjectLayout, ReferenceWidth};
use fault_handler::{
    FaultInfo, FaultManager, FaultManagerConfig, ManagedRuntime, SignalContext, ThreadHandle,
    ThreadState,
};
use fault_sigchain::{SigchainError, SignalChain, SpecialFn, SpecialHandler};
use parking_lot::Mutex;
use std::ops::{Deref, Range};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const THREAD: ThreadHandle = ThreadHandle(1);

pub const SEGV_MAPERR: libc::c_int = 1;

/// A runtime whose answers are set by the test.
///
/// The fault pc and sp come from the test instead of the register context, so
/// faults can be dispatched without raising a signal.
pub struct FakeRuntime {
    pub attached: AtomicBool,
    pub state: Mutex<ThreadState>,
    pub holds_lock: AtomicBool,
    pub started: AtomicBool,
    pub pc: AtomicUsize,
    pub sp: AtomicUsize,
    pub trigger_page: AtomicUsize,
    pub guard: Mutex<Option<Range<usize>>>,
    pub dex_pc_valid: AtomicBool,
    pub frames: Mutex<Vec<(usize, &'static str)>>,

    pub checkpoints: AtomicUsize,
    pub null_pointers: Mutex<Vec<usize>>,
    pub suspend_checks: AtomicUsize,
    pub stack_overflows: AtomicUsize,
    pub top_of_stack: AtomicUsize,
    pub sigbus_faults: AtomicUsize,
    pub resolve_sigbus: AtomicBool,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            attached: AtomicBool::new(true),
            state: Mutex::new(ThreadState::Runnable),
            holds_lock: AtomicBool::new(true),
            started: AtomicBool::new(true),
            pc: AtomicUsize::new(0),
            sp: AtomicUsize::new(0),
            trigger_page: AtomicUsize::new(0),
            guard: Mutex::new(None),
            dex_pc_valid: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
            checkpoints: AtomicUsize::new(0),
            null_pointers: Mutex::new(Vec::new()),
            suspend_checks: AtomicUsize::new(0),
            stack_overflows: AtomicUsize::new(0),
            top_of_stack: AtomicUsize::new(0),
            sigbus_faults: AtomicUsize::new(0),
            resolve_sigbus: AtomicBool::new(false),
        }
    }
}

impl FakeRuntime {
    pub fn detached() -> Self {
        let runtime = Self::default();
        runtime.attached.store(false, Ordering::SeqCst);
        runtime
    }

    pub fn set_pc(&self, pc: usize) {
        self.pc.store(pc, Ordering::SeqCst);
    }

    pub fn set_sp(&self, sp: usize) {
        self.sp.store(sp, Ordering::SeqCst);
    }
}

impl ManagedRuntime for FakeRuntime {
    fn current_thread(&self) -> Option<ThreadHandle> {
        self.attached.load(Ordering::SeqCst).then_some(THREAD)
    }

    fn thread_state(&self, _thread: ThreadHandle) -> ThreadState {
        *self.state.lock()
    }

    fn holds_shared_execution_lock(&self, _thread: ThreadHandle) -> bool {
        self.holds_lock.load(Ordering::SeqCst)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn run_empty_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
    }

    fn fault_pc(&self, _info: &FaultInfo, _context: &SignalContext) -> usize {
        self.pc.load(Ordering::SeqCst)
    }

    fn fault_sp(&self, _context: &SignalContext) -> usize {
        self.sp.load(Ordering::SeqCst)
    }

    fn object_layout(&self) -> ObjectLayout {
        ObjectLayout {
            declaring_class_offset: std::mem::size_of::<usize>(),
            class_offset: 0,
            reference_width: ReferenceWidth::Native,
            object_alignment: 8,
        }
    }

    fn dex_pc_for_return_pc(&self, _method: usize, _sp: usize, return_pc: usize) -> Option<u32> {
        self.dex_pc_valid
            .load(Ordering::SeqCst)
            .then(|| (return_pc & 0xff) as u32)
    }

    fn suspend_trigger_page(&self, _thread: ThreadHandle) -> Option<usize> {
        match self.trigger_page.load(Ordering::SeqCst) {
            0 => None,
            page => Some(page),
        }
    }

    fn stack_guard_region(&self, _thread: ThreadHandle) -> Option<Range<usize>> {
        self.guard.lock().clone()
    }

    fn set_top_of_managed_stack(&self, _thread: ThreadHandle, sp: usize) {
        self.top_of_stack.store(sp, Ordering::SeqCst);
    }

    fn walk_managed_stack(
        &self,
        _thread: ThreadHandle,
        visit: &mut dyn FnMut(&ManagedFrame<'_>),
    ) {
        for &(method, name) in self.frames.lock().iter() {
            visit(&ManagedFrame {
                method,
                dex_pc: None,
                name,
            });
        }
    }

    fn deliver_null_pointer(
        &self,
        _thread: ThreadHandle,
        _context: &mut SignalContext,
        return_pc: usize,
    ) {
        self.null_pointers.lock().push(return_pc);
    }

    fn deliver_suspend_check(&self, _thread: ThreadHandle, _context: &mut SignalContext) {
        self.suspend_checks.fetch_add(1, Ordering::SeqCst);
    }

    fn deliver_stack_overflow(&self, _thread: ThreadHandle, _context: &mut SignalContext) {
        self.stack_overflows.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_sigbus(&self, _info: &FaultInfo, _context: &mut SignalContext) -> bool {
        self.sigbus_faults.fetch_add(1, Ordering::SeqCst);
        self.resolve_sigbus.load(Ordering::SeqCst)
    }
}

/// A signal chain that only records which signals are claimed.
#[derive(Default)]
pub struct RecordingChain {
    pub claimed: Mutex<Vec<libc::c_int>>,
    pub refuse: Mutex<Option<libc::c_int>>,
}

impl SignalChain for RecordingChain {
    fn add_special_handler(
        &self,
        signal: libc::c_int,
        _handler: SpecialHandler,
    ) -> Result<(), SigchainError> {
        if *self.refuse.lock() == Some(signal) {
            return Err(SigchainError::UnsupportedSignal(signal));
        }
        self.claimed.lock().push(signal);
        Ok(())
    }

    fn remove_special_handler(&self, signal: libc::c_int, _action: SpecialFn) {
        self.claimed.lock().retain(|claimed| *claimed != signal);
    }
}

/// A leaked manager that is shut down when the guard goes away, so the next
/// test can install its own.
pub struct ManagerGuard(&'static FaultManager);

impl ManagerGuard {
    pub fn new(manager: FaultManager) -> Self {
        Self(Box::leak(Box::new(manager)))
    }

    pub fn get(&self) -> &'static FaultManager {
        self.0
    }
}

impl Deref for ManagerGuard {
    type Target = FaultManager;

    fn deref(&self) -> &FaultManager {
        self.0
    }
}

impl Drop for ManagerGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// A manager for `runtime` that claims signals from `chain`.
pub fn leaked_manager(
    runtime: &Arc<FakeRuntime>,
    chain: &Arc<RecordingChain>,
    config: FaultManagerConfig,
) -> ManagerGuard {
    let runtime: Arc<dyn ManagedRuntime> = runtime.clone();
    let chain: Arc<dyn SignalChain> = chain.clone();
    ManagerGuard::new(
        FaultManager::builder(runtime)
            .signal_chain(chain)
            .config(config)
            .build(),
    )
}

/// A manager that is installed and ready to dispatch, without touching the
/// process signal dispositions.
pub fn installed_manager(runtime: &Arc<FakeRuntime>) -> ManagerGuard {
    let chain = Arc::new(RecordingChain::default());
    let manager = leaked_manager(runtime, &chain, FaultManagerConfig::default());
    manager.get().init().expect("install fault manager");
    manager
}

pub fn segv(addr: usize) -> FaultInfo {
    FaultInfo::new(libc::SIGSEGV, SEGV_MAPERR, addr)
}

#[repr(C, align(8))]
pub struct FakeObject {
    pub class: usize,
    pub declaring_class: usize,
}

/// A method descriptor whose declaring class is a well-formed class.
pub struct FakeMethod {
    class_class: Box<FakeObject>,
    klass: Box<FakeObject>,
    method: Box<FakeObject>,
}

impl FakeMethod {
    pub fn new() -> Self {
        let mut class_class = Box::new(FakeObject {
            class: 0,
            declaring_class: 0,
        });
        class_class.class = &*class_class as *const FakeObject as usize;
        let klass = Box::new(FakeObject {
            class: &*class_class as *const FakeObject as usize,
            declaring_class: 0,
        });
        let method = Box::new(FakeObject {
            class: 0,
            declaring_class: &*klass as *const FakeObject as usize,
        });
        Self {
            class_class,
            klass,
            method,
        }
    }

    pub fn address(&self) -> usize {
        &*self.method as *const FakeObject as usize
    }
}
