//! In-process fault handling for runtimes that generate machine code.
//!
//! Generated code uses faults as a cheap way to check for rare conditions:
//! a load through a null reference instead of an explicit null check, a load
//! from a page the runtime protects to request a suspend, a probe below the
//! stack pointer that hits the guard page on stack overflow. The
//! [`FaultManager`] claims `SIGSEGV` (and optionally `SIGBUS`) through a
//! [`SignalChain`](fault_sigchain::SignalChain), decides whether a fault came
//! from generated code, and hands it to the [`FaultHandler`]s that recognize
//! those shapes. Everything else continues down the signal chain.
//!
//! Deciding "is this pc in generated code" happens inside the signal handler,
//! so the [`CodeRangeRegistry`] is readable without locks or allocation while
//! code is being added and removed by other threads.
//!
//! # Example
//! ```ignore
//! use fault_handler::{FaultManager, FaultManagerConfig, NullPointerHandler};
//!
//! let manager: &'static FaultManager =
//!     Box::leak(Box::new(FaultManager::new(runtime, FaultManagerConfig::default())));
//! manager.init()?;
//! NullPointerHandler::install(manager);
//! manager.add_generated_code_range(code.as_ptr() as usize, code.len());
//! ```

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod code_ranges;
mod config;
mod context;
mod error;
mod handler;
pub mod handlers;
mod manager;
pub mod membarrier;
pub mod runtime;

pub use crate::code_ranges::CodeRangeRegistry;
pub use crate::config::{FaultManagerConfig, DEFAULT_STACK_OVERFLOW_RESERVED_BYTES};
pub use crate::context::{
    FaultInfo, SignalContext, SEGV_ACCERR, SEGV_MAPERR, SEGV_MTEAERR, SEGV_MTESERR,
};
pub use crate::error::FaultError;
pub use crate::handler::{FaultHandler, HandlerId, HandlerKind};
pub use crate::handlers::{
    ManagedStackTraceHandler, NullPointerHandler, StackOverflowHandler, SuspensionHandler,
};
pub use crate::manager::{
    fault_handler_unhandled_fault, FaultFrame, FaultManager, FaultManagerBuilder, ManagerState,
};
pub use crate::runtime::{ManagedRuntime, ThreadHandle, ThreadState};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
