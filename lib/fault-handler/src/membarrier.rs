//! Process-wide memory barriers through `membarrier(2)`.

use std::io;

/// Commands understood by `membarrier(2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MembarrierCommand {
    /// Query the set of supported commands.
    Query = 0,
    /// Barrier on every running thread of every process.
    Global = 1 << 0,
    /// Expedited barrier on every process registered for it.
    GlobalExpedited = 1 << 1,
    /// Register the process for `GlobalExpedited`.
    RegisterGlobalExpedited = 1 << 2,
    /// Expedited barrier on every running thread of this process.
    PrivateExpedited = 1 << 3,
    /// Register the process for `PrivateExpedited`.
    RegisterPrivateExpedited = 1 << 4,
    /// `PrivateExpedited`, also serializing instruction streams.
    PrivateExpeditedSyncCore = 1 << 5,
    /// Register the process for `PrivateExpeditedSyncCore`.
    RegisterPrivateExpeditedSyncCore = 1 << 6,
}

/// Issues `command`.
///
/// `PrivateExpedited` fails with `EPERM` until the process registered with
/// `RegisterPrivateExpedited`. Platforms without `membarrier` report
/// [`io::ErrorKind::Unsupported`].
pub fn membarrier(command: MembarrierCommand) -> io::Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            let flags: libc::c_uint = 0;
            let command = command as libc::c_int;
            let result = unsafe { libc::syscall(libc::SYS_membarrier, command, flags) };
            if result < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        } else {
            let _ = command;
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn private_expedited_after_registration() {
        // Kernels without membarrier (or sandboxes filtering it) reject the query.
        if membarrier(MembarrierCommand::Query).is_err() {
            return;
        }
        if membarrier(MembarrierCommand::RegisterPrivateExpedited).is_ok() {
            membarrier(MembarrierCommand::PrivateExpedited).unwrap();
        }
    }

    #[test]
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn unsupported_elsewhere() {
        let err = membarrier(MembarrierCommand::Query).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
