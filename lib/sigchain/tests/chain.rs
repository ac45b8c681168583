use fault_sigchain::{is_handling_signal, SigactionChain, SignalChain, SignalMask, SpecialHandler};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static PREVIOUS_CALLS: AtomicUsize = AtomicUsize::new(0);
static FIRST_CALLS: AtomicUsize = AtomicUsize::new(0);
static SECOND_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn recording_previous(
    _signum: libc::c_int,
    _siginfo: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    PREVIOUS_CALLS.fetch_add(1, Ordering::SeqCst);
}

fn declining(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) -> bool {
    FIRST_CALLS.fetch_add(1, Ordering::SeqCst);
    false
}

fn claiming(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) -> bool {
    FIRST_CALLS.fetch_add(1, Ordering::SeqCst);
    true
}

fn claiming_second(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) -> bool {
    SECOND_CALLS.fetch_add(1, Ordering::SeqCst);
    true
}

fn observing(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) -> bool {
    FIRST_CALLS.fetch_add(1, Ordering::SeqCst);
    if is_handling_signal() {
        SECOND_CALLS.fetch_add(1, Ordering::SeqCst);
    }
    true
}

fn reraising(signum: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) -> bool {
    FIRST_CALLS.fetch_add(1, Ordering::SeqCst);
    if is_handling_signal() {
        SECOND_CALLS.fetch_add(1, Ordering::SeqCst);
    }
    unsafe { libc::raise(signum) };
    true
}

/// Installs `recording_previous` for `signal` and returns the disposition it replaced.
fn install_previous(signal: libc::c_int) -> libc::sigaction {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = recording_previous as usize;
        libc::sigemptyset(&mut action.sa_mask);
        let mut old: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(signal, &action, &mut old), 0);
        old
    }
}

fn set_disposition(signal: libc::c_int, disposition: libc::sighandler_t) -> libc::sigaction {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = disposition;
        libc::sigemptyset(&mut action.sa_mask);
        let mut old: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(signal, &action, &mut old), 0);
        old
    }
}

fn restore(signal: libc::c_int, old: libc::sigaction) {
    unsafe {
        assert_eq!(libc::sigaction(signal, &old, ptr::null_mut()), 0);
    }
}

fn current_handler(signal: libc::c_int) -> usize {
    unsafe {
        let mut current: libc::sigaction = mem::zeroed();
        libc::sigaction(signal, ptr::null(), &mut current);
        current.sa_sigaction
    }
}

fn reset_counters() {
    PREVIOUS_CALLS.store(0, Ordering::SeqCst);
    FIRST_CALLS.store(0, Ordering::SeqCst);
    SECOND_CALLS.store(0, Ordering::SeqCst);
}

#[test]
#[serial]
fn unclaimed_signal_reaches_previous_handler() {
    reset_counters();
    let old = install_previous(libc::SIGILL);

    SigactionChain
        .add_special_handler(libc::SIGILL, SpecialHandler::new(declining, SignalMask::empty()))
        .unwrap();
    unsafe { libc::raise(libc::SIGILL) };

    assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);

    SigactionChain.remove_special_handler(libc::SIGILL, declining);
    assert_eq!(current_handler(libc::SIGILL), recording_previous as usize);
    restore(libc::SIGILL, old);
}

#[test]
#[serial]
fn claimed_signal_stops_the_chain() {
    reset_counters();
    let old = install_previous(libc::SIGFPE);

    SigactionChain
        .add_special_handler(libc::SIGFPE, SpecialHandler::new(claiming, SignalMask::empty()))
        .unwrap();
    SigactionChain
        .add_special_handler(
            libc::SIGFPE,
            SpecialHandler::new(claiming_second, SignalMask::empty()),
        )
        .unwrap();
    unsafe { libc::raise(libc::SIGFPE) };

    assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(SECOND_CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 0);

    SigactionChain.remove_special_handler(libc::SIGFPE, claiming);
    SigactionChain.remove_special_handler(libc::SIGFPE, claiming_second);
    restore(libc::SIGFPE, old);
}

#[test]
#[serial]
fn nested_signal_skips_special_handlers() {
    reset_counters();
    let old = install_previous(libc::SIGILL);

    SigactionChain
        .add_special_handler(libc::SIGILL, SpecialHandler::new(reraising, SignalMask::empty()))
        .unwrap();
    unsafe { libc::raise(libc::SIGILL) };

    assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
    // `SECOND_CALLS` counts how often the handler saw the reentrancy flag set.
    assert_eq!(SECOND_CALLS.load(Ordering::SeqCst), 1);
    assert!(!is_handling_signal());

    SigactionChain.remove_special_handler(libc::SIGILL, reraising);
    restore(libc::SIGILL, old);
}

#[test]
#[serial]
fn duplicate_registration_is_rejected() {
    let old = install_previous(libc::SIGILL);

    SigactionChain
        .add_special_handler(libc::SIGILL, SpecialHandler::new(declining, SignalMask::empty()))
        .unwrap();
    let err = SigactionChain
        .add_special_handler(libc::SIGILL, SpecialHandler::new(declining, SignalMask::empty()))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("special handler already registered for signal {}", libc::SIGILL)
    );

    SigactionChain.remove_special_handler(libc::SIGILL, declining);
    restore(libc::SIGILL, old);
}

#[test]
#[serial]
fn unclaimed_signal_with_default_disposition_terminates() {
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        set_disposition(libc::SIGBUS, libc::SIG_DFL);
        let registered = SigactionChain
            .add_special_handler(libc::SIGBUS, SpecialHandler::new(declining, SignalMask::empty()));
        if registered.is_err() {
            unsafe { libc::_exit(2) };
        }
        unsafe {
            libc::raise(libc::SIGBUS);
            libc::_exit(0)
        }
    }

    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    assert!(libc::WIFSIGNALED(status), "child exited with status {status:#x}");
    assert_eq!(libc::WTERMSIG(status), libc::SIGBUS);
}

#[test]
#[serial]
fn ignored_signal_keeps_the_chain_installed() {
    reset_counters();
    let old = set_disposition(libc::SIGFPE, libc::SIG_IGN);

    SigactionChain
        .add_special_handler(libc::SIGFPE, SpecialHandler::new(declining, SignalMask::empty()))
        .unwrap();
    unsafe {
        libc::raise(libc::SIGFPE);
        libc::raise(libc::SIGFPE);
    }

    assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), 2);
    assert_ne!(current_handler(libc::SIGFPE), libc::SIG_IGN);

    SigactionChain.remove_special_handler(libc::SIGFPE, declining);
    assert_eq!(current_handler(libc::SIGFPE), libc::SIG_IGN);
    restore(libc::SIGFPE, old);
}

#[test]
#[serial]
fn special_handlers_run_with_the_handling_flag() {
    reset_counters();
    let old = install_previous(libc::SIGILL);

    SigactionChain
        .add_special_handler(libc::SIGILL, SpecialHandler::new(observing, SignalMask::empty()))
        .unwrap();
    unsafe { libc::raise(libc::SIGILL) };

    assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(SECOND_CALLS.load(Ordering::SeqCst), 1);

    SigactionChain.remove_special_handler(libc::SIGILL, observing);
    restore(libc::SIGILL, old);
}

#[test]
#[serial]
fn noreturn_handler_runs_without_the_handling_flag() {
    reset_counters();
    let old = install_previous(libc::SIGILL);

    SigactionChain
        .add_special_handler(
            libc::SIGILL,
            SpecialHandler::new(observing, SignalMask::empty()).allow_noreturn(),
        )
        .unwrap();
    unsafe { libc::raise(libc::SIGILL) };

    assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(SECOND_CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 0);
    assert!(!is_handling_signal());

    SigactionChain.remove_special_handler(libc::SIGILL, observing);
    restore(libc::SIGILL, old);
}
