//! Cooperative chaining of process-wide fault signal handlers.
//!
//! Several subsystems of a process may want to look at the same synchronous
//! fault signal (`SIGSEGV`, `SIGBUS`, ...). Rather than each of them calling
//! `sigaction` and hoping to be the last one installed, they register
//! *special handlers* with a [`SignalChain`]. On delivery the special handlers
//! are asked in registration order whether they claim the signal; if none of
//! them does, the signal is forwarded to whatever disposition was in place
//! before the chain took over.
//!
//! [`SigactionChain`] is the implementation that talks to the OS directly.
//! Runtimes embedding their own chaining facility implement [`SignalChain`]
//! on top of it instead.
//!
//! # Example
//! ```ignore
//! use fault_sigchain::{SigactionChain, SignalChain, SignalMask, SpecialHandler};
//!
//! fn on_segv(_sig: libc::c_int, _info: *mut libc::siginfo_t, _cx: *mut libc::c_void) -> bool {
//!     false
//! }
//!
//! SigactionChain.add_special_handler(
//!     libc::SIGSEGV,
//!     SpecialHandler::new(on_segv, SignalMask::empty()),
//! )?;
//! ```

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod error;
mod mask;
mod sigaction;

pub use crate::error::SigchainError;
pub use crate::mask::SignalMask;
pub use crate::sigaction::{is_handling_signal, SigactionChain, CHAINABLE_SIGNALS};

/// Signature of a special handler.
///
/// Returns `true` when the handler consumed the signal, in which case the
/// chain returns from the OS signal handler and the interrupted context is
/// resumed (possibly after the handler modified it).
pub type SpecialFn = fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) -> bool;

/// A special handler registration.
#[derive(Clone, Copy, Debug)]
pub struct SpecialHandler {
    /// The function asked whether it claims the signal.
    pub action: SpecialFn,
    /// Signals blocked while `action` runs.
    pub mask: SignalMask,
    /// The handler may not return (for example because it unwinds or jumps
    /// out of the signal frame). The per-thread reentrancy flag is cleared
    /// before calling it.
    pub allow_noreturn: bool,
}

impl SpecialHandler {
    /// Creates a registration for `action` running with `mask` blocked.
    pub fn new(action: SpecialFn, mask: SignalMask) -> Self {
        Self {
            action,
            mask,
            allow_noreturn: false,
        }
    }

    /// Marks the handler as possibly not returning.
    pub fn allow_noreturn(mut self) -> Self {
        self.allow_noreturn = true;
        self
    }
}

/// An ordered, cooperative chain of special signal handlers.
pub trait SignalChain: Send + Sync {
    /// Registers `handler` for `signal`, after any handler already registered
    /// for it.
    fn add_special_handler(
        &self,
        signal: libc::c_int,
        handler: SpecialHandler,
    ) -> Result<(), SigchainError>;

    /// Unregisters the special handler whose function is `action`.
    ///
    /// Unknown registrations are ignored.
    fn remove_special_handler(&self, signal: libc::c_int, action: SpecialFn);
}

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
