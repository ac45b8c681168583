//! Handlers for the fault shapes generated code produces on purpose.
//!
//! Each handler registers itself with [`install`](NullPointerHandler::install)
//! and is owned by the manager from then on.

mod null_pointer;
mod stack_overflow;
mod stack_trace;
mod suspension;

pub use self::null_pointer::NullPointerHandler;
pub use self::stack_overflow::StackOverflowHandler;
pub use self::stack_trace::ManagedStackTraceHandler;
pub use self::suspension::SuspensionHandler;
