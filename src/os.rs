//! Real-OS implementations of the pipeline's collaborator traits.

use crate::error::Result;
use crate::hook::SyscallInvoker;

/// Invokes the hijacked syscall through the real `syscall(2)` trap.
#[derive(Debug, Default)]
pub struct RawSyscall;

impl SyscallInvoker for RawSyscall {
    fn invoke(&mut self, code: u32, func: u64, args: [u64; 6]) -> Result<u64> {
        let ret = unsafe {
            nix::libc::syscall(
                code as nix::libc::c_long,
                func,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
            )
        };
        Ok(ret as u64)
    }
}

#[cfg(target_os = "macos")]
pub use self::macos::SysctlQuery;

#[cfg(target_os = "macos")]
mod macos {
    use std::ffi::CStr;

    use crate::error::{Error, Result};
    use crate::slide::{SystemQuery, BOOT_UUID_LEN};

    /// The sysctl node whose value doubles as a slide-validation
    /// fingerprint: the kernel keeps the same string in
    /// `_bootsessionuuid_string`.
    const KERN_BOOTSESSIONUUID: &CStr = cstr::cstr!(b"kern.bootsessionuuid");

    /// `SystemQuery` backed by `sysctlbyname(2)`.
    #[derive(Debug, Default)]
    pub struct SysctlQuery;

    impl SystemQuery for SysctlQuery {
        fn boot_session_uuid(&self) -> Result<[u8; BOOT_UUID_LEN]> {
            let mut uuid = [0u8; BOOT_UUID_LEN];
            let mut size = uuid.len();
            let err = unsafe {
                nix::libc::sysctlbyname(
                    KERN_BOOTSESSIONUUID.as_ptr(),
                    uuid.as_mut_ptr().cast(),
                    &mut size,
                    std::ptr::null_mut(),
                    0,
                )
            };
            if err != 0 {
                return Err(Error::SystemQueryFailed(
                    KERN_BOOTSESSIONUUID.to_string_lossy().into_owned(),
                ));
            }
            Ok(uuid)
        }
    }
}
