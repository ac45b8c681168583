use fault_sigchain::SigchainError;
use thiserror::Error;

/// Errors reported by the fault manager lifecycle.
#[derive(Debug, Error)]
pub enum FaultError {
    /// Claiming a fault signal failed.
    #[error(transparent)]
    Sigchain(#[from] SigchainError),

    /// Another manager owns the fault signals.
    #[error("another fault manager is already installed")]
    AnotherManagerActive,

    /// The manager was shut down and cannot be installed again.
    #[error("fault manager has been shut down")]
    ShutDown,
}
