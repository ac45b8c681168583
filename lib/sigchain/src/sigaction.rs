//! A [`SignalChain`] built directly on `sigaction`.

use crate::{SigchainError, SignalChain, SpecialFn, SpecialHandler};
use parking_lot::Mutex;
use std::cell::{Cell, UnsafeCell};
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Signals a [`SigactionChain`] can take over.
pub const CHAINABLE_SIGNALS: [libc::c_int; 4] =
    [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];

const MAX_SPECIAL_HANDLERS: usize = 2;

/// Per-signal chain state.
///
/// `actions` are read from the trampoline without locking; every other field
/// is written under `WRITER` before the action that depends on it is
/// published with a release store.
struct ChainSlot {
    signal: libc::c_int,
    installed: AtomicBool,
    previous: UnsafeCell<MaybeUninit<libc::sigaction>>,
    actions: [AtomicUsize; MAX_SPECIAL_HANDLERS],
    masks: [UnsafeCell<MaybeUninit<libc::sigset_t>>; MAX_SPECIAL_HANDLERS],
    noreturn: [AtomicBool; MAX_SPECIAL_HANDLERS],
}

unsafe impl Sync for ChainSlot {}

impl ChainSlot {
    const fn new(signal: libc::c_int) -> Self {
        Self {
            signal,
            installed: AtomicBool::new(false),
            previous: UnsafeCell::new(MaybeUninit::uninit()),
            actions: [AtomicUsize::new(0), AtomicUsize::new(0)],
            masks: [
                UnsafeCell::new(MaybeUninit::uninit()),
                UnsafeCell::new(MaybeUninit::uninit()),
            ],
            noreturn: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    fn is_empty(&self) -> bool {
        self.actions
            .iter()
            .all(|action| action.load(Ordering::Relaxed) == 0)
    }
}

static SLOTS: [ChainSlot; CHAINABLE_SIGNALS.len()] = [
    ChainSlot::new(CHAINABLE_SIGNALS[0]),
    ChainSlot::new(CHAINABLE_SIGNALS[1]),
    ChainSlot::new(CHAINABLE_SIGNALS[2]),
    ChainSlot::new(CHAINABLE_SIGNALS[3]),
];

/// Serializes registrations; never taken by the trampoline.
static WRITER: Mutex<()> = parking_lot::const_mutex(());

thread_local! {
    /// Set while this thread runs special handlers, so that a fault raised by a
    /// special handler itself goes straight to the previous disposition.
    static HANDLING: Cell<bool> = const { Cell::new(false) };
}

fn slot(signal: libc::c_int) -> Option<&'static ChainSlot> {
    SLOTS.iter().find(|slot| slot.signal == signal)
}

/// Returns `true` if the calling thread is currently running special handlers.
pub fn is_handling_signal() -> bool {
    HANDLING.try_with(Cell::get).unwrap_or(false)
}

/// The process-wide chain for [`CHAINABLE_SIGNALS`], installed with `sigaction`.
///
/// The first registration for a signal saves the current disposition and
/// installs the chain trampoline with `SA_SIGINFO | SA_ONSTACK | SA_NODEFER`.
/// Signals no special handler claims are forwarded to the saved disposition.
/// When the last special handler of a signal is removed and nobody replaced
/// the trampoline in the meantime, the saved disposition is restored.
#[derive(Clone, Copy, Debug, Default)]
pub struct SigactionChain;

impl SignalChain for SigactionChain {
    fn add_special_handler(
        &self,
        signal: libc::c_int,
        handler: SpecialHandler,
    ) -> Result<(), SigchainError> {
        let slot = slot(signal).ok_or(SigchainError::UnsupportedSignal(signal))?;
        let _guard = WRITER.lock();

        let raw = handler.action as usize;
        if slot
            .actions
            .iter()
            .any(|action| action.load(Ordering::Relaxed) == raw)
        {
            return Err(SigchainError::AlreadyClaimed(signal));
        }
        let index = slot
            .actions
            .iter()
            .position(|action| action.load(Ordering::Relaxed) == 0)
            .ok_or(SigchainError::SlotsExhausted(signal))?;

        if !slot.installed.load(Ordering::Relaxed) {
            unsafe { install(slot)? };
        }

        unsafe { (*slot.masks[index].get()).write(*handler.mask.as_raw()) };
        slot.noreturn[index].store(handler.allow_noreturn, Ordering::Relaxed);
        slot.actions[index].store(raw, Ordering::Release);
        tracing::debug!(signal, index, "registered special signal handler");
        Ok(())
    }

    fn remove_special_handler(&self, signal: libc::c_int, action: SpecialFn) {
        let slot = match slot(signal) {
            Some(slot) => slot,
            None => return,
        };
        let _guard = WRITER.lock();

        let raw = action as usize;
        for entry in slot.actions.iter() {
            if entry.load(Ordering::Relaxed) == raw {
                entry.store(0, Ordering::Release);
                tracing::debug!(signal, "removed special signal handler");
            }
        }

        if slot.is_empty() && slot.installed.load(Ordering::Relaxed) {
            unsafe { restore_if_current(slot) };
        }
    }
}

unsafe fn install(slot: &ChainSlot) -> Result<(), SigchainError> {
    unsafe {
        // Save the previous disposition before the trampoline can observe it.
        if libc::sigaction(slot.signal, ptr::null(), (*slot.previous.get()).as_mut_ptr()) != 0 {
            return Err(SigchainError::Install {
                signal: slot.signal,
                source: io::Error::last_os_error(),
            });
        }

        let mut handler: libc::sigaction = mem::zeroed();
        // SA_SIGINFO gives us access to the fault address and the register context.
        //
        // SA_ONSTACK lets the handler run on the alternate signal stack, which is
        // what makes handling a stack overflow possible at all.
        //
        // SA_NODEFER lets a special handler fault again; the nested delivery is
        // routed to the previous disposition by the `HANDLING` flag.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        handler.sa_sigaction = chain_trampoline as usize;
        libc::sigemptyset(&mut handler.sa_mask);
        if libc::sigaction(slot.signal, &handler, ptr::null_mut()) != 0 {
            return Err(SigchainError::Install {
                signal: slot.signal,
                source: io::Error::last_os_error(),
            });
        }
    }
    slot.installed.store(true, Ordering::Release);
    tracing::debug!(signal = slot.signal, "installed signal chain trampoline");
    Ok(())
}

unsafe fn restore_if_current(slot: &ChainSlot) {
    let mut current: libc::sigaction = unsafe { mem::zeroed() };
    if unsafe { libc::sigaction(slot.signal, ptr::null(), &mut current) } != 0 {
        return;
    }
    if current.sa_sigaction != chain_trampoline as usize {
        // Someone installed a handler on top of ours; it may forward to us, so
        // keep forwarding.
        tracing::debug!(
            signal = slot.signal,
            "signal chain trampoline was replaced, keeping it installed"
        );
        return;
    }
    let previous = unsafe { &*(*slot.previous.get()).as_ptr() };
    if unsafe { libc::sigaction(slot.signal, previous, ptr::null_mut()) } == 0 {
        slot.installed.store(false, Ordering::Release);
        tracing::debug!(signal = slot.signal, "restored previous signal disposition");
    }
}

unsafe extern "C" fn chain_trampoline(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let slot = match slot(signum) {
        Some(slot) => slot,
        None => return,
    };

    // A thread whose TLS is already torn down is treated as reentrant.
    let reentered = HANDLING.try_with(|flag| flag.replace(true)).unwrap_or(true);
    if !reentered {
        let handled = unsafe { run_special_handlers(slot, signum, siginfo, context) };
        let _ = HANDLING.try_with(|flag| flag.set(false));
        if handled {
            return;
        }
    }

    unsafe { forward_to_previous(slot, signum, siginfo, context) };
}

unsafe fn run_special_handlers(
    slot: &ChainSlot,
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) -> bool {
    for index in 0..MAX_SPECIAL_HANDLERS {
        let raw = slot.actions[index].load(Ordering::Acquire);
        if raw == 0 {
            continue;
        }
        let action = unsafe { mem::transmute::<usize, SpecialFn>(raw) };

        let mut saved_mask = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::pthread_sigmask(
                libc::SIG_SETMASK,
                (*slot.masks[index].get()).as_ptr(),
                saved_mask.as_mut_ptr(),
            );
        }
        if slot.noreturn[index].load(Ordering::Relaxed) {
            let _ = HANDLING.try_with(|flag| flag.set(false));
        }
        let handled = action(signum, siginfo, context);
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, saved_mask.as_ptr(), ptr::null_mut());
        }

        if handled {
            return true;
        }
    }
    false
}

type SigactionFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);
type SighandlerFn = extern "C" fn(libc::c_int);

/// Hands the signal to the disposition that was installed before the chain.
///
/// Without a previous handler the signal gets its default action, which for
/// every chainable signal terminates the process. A signal sent by another
/// process to an ignoring disposition is dropped. The trampoline stays
/// installed either way.
unsafe fn forward_to_previous(
    slot: &ChainSlot,
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let previous = unsafe { &*(*slot.previous.get()).as_ptr() };
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let action = unsafe { mem::transmute::<usize, SigactionFn>(previous.sa_sigaction) };
        return action(signum, siginfo, context);
    }
    if previous.sa_sigaction == libc::SIG_IGN {
        // The kernel does not let a synchronous fault be ignored.
        let code = if siginfo.is_null() { 0 } else { unsafe { (*siginfo).si_code } };
        if code <= 0 {
            return;
        }
    } else if previous.sa_sigaction != libc::SIG_DFL {
        let action = unsafe { mem::transmute::<usize, SighandlerFn>(previous.sa_sigaction) };
        return action(signum);
    }
    unsafe { die_with_default_action(signum) }
}

/// Re-raises `signum` with its default disposition.
unsafe fn die_with_default_action(signum: libc::c_int) -> ! {
    unsafe {
        let mut default: libc::sigaction = mem::zeroed();
        default.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut default.sa_mask);
        libc::sigaction(signum, &default, ptr::null_mut());

        let mut unblock = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(unblock.as_mut_ptr());
        libc::sigaddset(unblock.as_mut_ptr(), signum);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, unblock.as_ptr(), ptr::null_mut());

        libc::raise(signum);
        libc::abort()
    }
}
