use std::io;
use thiserror::Error;

/// Errors raised while registering special handlers.
#[derive(Debug, Error)]
pub enum SigchainError {
    /// The OS refused to install the chain trampoline.
    #[error("unable to install signal handler for signal {signal}: {source}")]
    Install {
        /// The signal being claimed.
        signal: libc::c_int,
        /// The error reported by `sigaction`.
        #[source]
        source: io::Error,
    },

    /// The signal is not one of the synchronous fault signals the chain manages.
    #[error("signal {0} cannot be chained")]
    UnsupportedSignal(libc::c_int),

    /// The same special handler function is already registered for the signal.
    #[error("special handler already registered for signal {0}")]
    AlreadyClaimed(libc::c_int),

    /// Every special handler slot of the signal is taken.
    #[error("no free special handler slot for signal {0}")]
    SlotsExhausted(libc::c_int),
}
