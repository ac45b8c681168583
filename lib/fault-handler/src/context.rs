//! The payload a fault signal arrives with: `siginfo_t` and the interrupted
//! register context.

use std::ffi::CStr;
use std::fmt;
use std::ptr;

/// Address not mapped to an object.
pub const SEGV_MAPERR: libc::c_int = 1;
/// Invalid permissions for a mapped object.
pub const SEGV_ACCERR: libc::c_int = 2;
/// Asynchronous memory tagging error.
pub const SEGV_MTEAERR: libc::c_int = 8;
/// Synchronous memory tagging error.
pub const SEGV_MTESERR: libc::c_int = 9;

/// Fault metadata extracted from `siginfo_t`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    /// The signal number.
    pub signal: libc::c_int,
    /// The platform fault reason (`si_code`).
    pub code: libc::c_int,
    /// The faulting data address (`si_addr`).
    pub addr: usize,
}

impl FaultInfo {
    /// Creates fault metadata from its parts.
    pub fn new(signal: libc::c_int, code: libc::c_int, addr: usize) -> Self {
        Self { signal, code, addr }
    }

    /// Reads the fault metadata out of a `siginfo_t`.
    ///
    /// # Safety
    ///
    /// `info` must point to the `siginfo_t` the kernel passed to the signal
    /// handler.
    pub unsafe fn from_raw(info: *const libc::siginfo_t) -> Self {
        let info = unsafe { &*info };
        Self {
            signal: info.si_signo,
            code: info.si_code,
            addr: unsafe { info.si_addr() } as usize,
        }
    }

    /// The symbolic name of [`code`](Self::code) for `SIGSEGV`.
    pub fn code_name(&self) -> &'static str {
        if self.signal != libc::SIGSEGV {
            return "UNKNOWN";
        }
        match self.code {
            SEGV_MAPERR => "SEGV_MAPERR",
            SEGV_ACCERR => "SEGV_ACCERR",
            SEGV_MTEAERR => "SEGV_MTEAERR",
            SEGV_MTESERR => "SEGV_MTESERR",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = unsafe {
            let name = libc::strsignal(self.signal);
            if name.is_null() {
                "unknown signal"
            } else {
                CStr::from_ptr(name).to_str().unwrap_or("unknown signal")
            }
        };
        writeln!(f, "  si_signo: {} ({})", self.signal, name)?;
        write!(f, "  si_code: {} ({})", self.code, self.code_name())?;
        if self.signal == libc::SIGSEGV {
            write!(f, "\n  si_addr: {:#x}", self.addr)?;
        }
        Ok(())
    }
}

/// The register context of the interrupted thread (`ucontext_t`).
///
/// A *detached* context has no registers behind it; its accessors report `0`.
/// Runtimes that supply their own register accessors (and tests) use it.
#[derive(Debug)]
pub struct SignalContext {
    raw: *mut libc::c_void,
}

impl SignalContext {
    /// Wraps the context pointer the kernel passed to the signal handler.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to a `ucontext_t` that stays valid for as
    /// long as the returned value is used.
    pub unsafe fn from_raw(raw: *mut libc::c_void) -> Self {
        Self { raw }
    }

    /// A context without registers.
    pub fn detached() -> Self {
        Self {
            raw: ptr::null_mut(),
        }
    }

    /// Returns `true` for a context without registers.
    pub fn is_detached(&self) -> bool {
        self.raw.is_null()
    }

    /// The raw `ucontext_t` pointer, for platform code that needs to redirect
    /// the interrupted thread.
    pub fn as_ptr(&self) -> *mut libc::c_void {
        self.raw
    }

    /// The program counter of the interrupted thread, or `0` if it cannot be
    /// read on this platform.
    pub fn pc(&self) -> usize {
        if self.raw.is_null() {
            return 0;
        }
        unsafe { platform_pc(self.raw) }
    }

    /// The stack pointer of the interrupted thread, or `0` if it cannot be
    /// read on this platform.
    pub fn sp(&self) -> usize {
        if self.raw.is_null() {
            return 0;
        }
        unsafe { platform_sp(self.raw) }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))] {
        unsafe fn platform_pc(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
        }

        unsafe fn platform_sp(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.gregs[libc::REG_RSP as usize] as usize
        }
    } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86"))] {
        unsafe fn platform_pc(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.gregs[libc::REG_EIP as usize] as usize
        }

        unsafe fn platform_sp(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.gregs[libc::REG_ESP as usize] as usize
        }
    } else if #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        target_arch = "aarch64"
    ))] {
        unsafe fn platform_pc(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.pc as usize
        }

        unsafe fn platform_sp(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.sp as usize
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        unsafe fn platform_pc(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            unsafe { (*cx.uc_mcontext).__ss.__rip as usize }
        }

        unsafe fn platform_sp(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            unsafe { (*cx.uc_mcontext).__ss.__rsp as usize }
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        unsafe fn platform_pc(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            unsafe { (*cx.uc_mcontext).__ss.__pc as usize }
        }

        unsafe fn platform_sp(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            unsafe { (*cx.uc_mcontext).__ss.__sp as usize }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "x86_64"))] {
        unsafe fn platform_pc(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.mc_rip as usize
        }

        unsafe fn platform_sp(cx: *mut libc::c_void) -> usize {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            cx.uc_mcontext.mc_rsp as usize
        }
    } else {
        // No register accessors: faults are never attributed to generated code.
        unsafe fn platform_pc(_cx: *mut libc::c_void) -> usize {
            0
        }

        unsafe fn platform_sp(_cx: *mut libc::c_void) -> usize {
            0
        }
    }
}
