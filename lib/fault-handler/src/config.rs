/// Default number of bytes reserved below the stack limit for the implicit
/// stack overflow probe.
pub const DEFAULT_STACK_OVERFLOW_RESERVED_BYTES: usize = 8 * 1024;

/// Tunables of a [`FaultManager`](crate::FaultManager).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultManagerConfig {
    /// Also claim `SIGBUS` (guard pages are reported as `SIGBUS` on some
    /// platforms, and userfault-based collectors use it).
    pub handle_sigbus: bool,
    /// Fault addresses below this limit are candidate implicit null checks.
    /// Compilers restrict implicit null checks to offsets inside one page.
    pub implicit_null_check_limit: usize,
    /// Distance between the stack pointer and the address generated code
    /// probes to detect a stack overflow.
    pub stack_overflow_reserved_bytes: usize,
    /// Log the raw signal payload of every fault at trace level.
    pub log_signal_info: bool,
}

impl Default for FaultManagerConfig {
    fn default() -> Self {
        Self {
            handle_sigbus: false,
            implicit_null_check_limit: region::page::size(),
            stack_overflow_reserved_bytes: DEFAULT_STACK_OVERFLOW_RESERVED_BYTES,
            log_signal_info: true,
        }
    }
}

impl FaultManagerConfig {
    /// Sets [`handle_sigbus`](Self::handle_sigbus).
    pub fn handle_sigbus(mut self, enable: bool) -> Self {
        self.handle_sigbus = enable;
        self
    }

    /// Sets [`implicit_null_check_limit`](Self::implicit_null_check_limit).
    pub fn implicit_null_check_limit(mut self, limit: usize) -> Self {
        self.implicit_null_check_limit = limit;
        self
    }

    /// Sets [`stack_overflow_reserved_bytes`](Self::stack_overflow_reserved_bytes).
    pub fn stack_overflow_reserved_bytes(mut self, bytes: usize) -> Self {
        self.stack_overflow_reserved_bytes = bytes;
        self
    }

    /// Sets [`log_signal_info`](Self::log_signal_info).
    pub fn log_signal_info(mut self, enable: bool) -> Self {
        self.log_signal_info = enable;
        self
    }

    /// The signals a manager with this configuration claims.
    pub fn signals(&self) -> &'static [libc::c_int] {
        if self.handle_sigbus {
            &[libc::SIGSEGV, libc::SIGBUS]
        } else {
            &[libc::SIGSEGV]
        }
    }
}
