use std::fmt;
use std::mem::MaybeUninit;

/// Highest signal number reported by the `Debug` output.
const MAX_LISTED_SIGNAL: libc::c_int = 64;

/// A set of signals, wrapping `sigset_t`.
#[derive(Clone, Copy)]
pub struct SignalMask(libc::sigset_t);

impl SignalMask {
    /// The set containing no signal.
    pub fn empty() -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            Self(set.assume_init())
        }
    }

    /// The set containing every signal.
    pub fn full() -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::sigfillset(set.as_mut_ptr());
            Self(set.assume_init())
        }
    }

    /// Adds `signal` to the set.
    pub fn with(mut self, signal: libc::c_int) -> Self {
        unsafe { libc::sigaddset(&mut self.0, signal) };
        self
    }

    /// Removes `signal` from the set.
    pub fn without(mut self, signal: libc::c_int) -> Self {
        unsafe { libc::sigdelset(&mut self.0, signal) };
        self
    }

    /// Tests whether `signal` is in the set.
    pub fn contains(&self, signal: libc::c_int) -> bool {
        unsafe { libc::sigismember(&self.0, signal) == 1 }
    }

    /// The underlying `sigset_t`.
    pub fn as_raw(&self) -> &libc::sigset_t {
        &self.0
    }
}

impl Default for SignalMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SignalMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries((1..=MAX_LISTED_SIGNAL).filter(|signal| self.contains(*signal)))
            .finish()
    }
}
