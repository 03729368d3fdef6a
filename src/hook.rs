//! The syscall-table hijack.
//!
//! One historically-unimplemented sysent slot is repointed at a function
//! whose first bytes we overwrite with a precompiled dispatcher, turning
//! that syscall number into "call an arbitrary kernel function and hand back
//! its 64-bit result". The write primitive makes this trivial; the only real
//! work is ordering the writes so an interruption partway through never
//! leaves the table pointing at half-written code.

use crate::error::{Error, Result};
use crate::image::{ImageContext, KernelImage};
use crate::mem::{self, KernelMemory, WORD_SIZE};
use crate::sysent::{Sysent, RET_INT, RET_NONE, RET_SSIZE, RET_UINT64, SYSENT_SIZE, SYSENT_WORDS};

/// The reserved syscall number we hijack: an old, unimplemented slot whose
/// entry is the `nosys` stub on every supported kernel.
pub const HOOK_SYSCALL_CODE: u32 = 8;

/// The kernel function whose first bytes get replaced by the dispatcher.
/// `_bsd_init` runs once at boot and is never called again.
const TARGET_FUNCTION: &str = "_bsd_init";

enum State {
    Absent,
    Located {
        sysent: u64,
        nosys: u64,
    },
    Installed {
        sysent: u64,
        nosys: u64,
        function: u64,
        original: Vec<u64>,
    },
}

/// The syscall hook state machine: Absent -> Located -> Installed -> Absent.
///
/// The hijacked slot must hold the `nosys` stub both before `install` and
/// after `remove`; that is the externally observable contract of the whole
/// protocol.
pub struct SyscallHook {
    code: u32,
    state: State,
}

/// The seam over the actual trap into the hijacked syscall.
pub trait SyscallInvoker {
    /// Invoke syscall `code`, passing the target kernel function address and
    /// six argument words; returns the syscall's 64-bit result.
    fn invoke(&mut self, code: u32, func: u64, args: [u64; 6]) -> Result<u64>;
}

impl SyscallHook {
    pub fn new(code: u32) -> SyscallHook {
        SyscallHook {
            code,
            state: State::Absent,
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn is_installed(&self) -> bool {
        matches!(self.state, State::Installed { .. })
    }

    /// The unslid table fingerprint: the first five sysent entries with
    /// their munge helpers and metadata, exactly as they appear in the
    /// on-disk image.
    fn fingerprint<I: KernelImage>(image: &ImageContext<I>) -> Result<Vec<Sysent>> {
        let unslid = |name: &str| -> Result<u64> {
            Ok(image.resolve_symbol(name)? - image.slide())
        };
        let nosys = unslid("_nosys")?;
        let exit = unslid("_exit")?;
        let fork = unslid("_fork")?;
        let read = unslid("_read")?;
        let write = unslid("_write")?;
        let munge_w = unslid("_munge_w")?;
        let munge_www = unslid("_munge_www")?;
        Ok(vec![
            Sysent::nosys(nosys),
            Sysent {
                call: exit,
                munge: munge_w,
                return_type: RET_NONE,
                narg: 1,
                arg_bytes: 4,
            },
            Sysent {
                call: fork,
                munge: 0,
                return_type: RET_INT,
                narg: 0,
                arg_bytes: 0,
            },
            Sysent {
                call: read,
                munge: munge_www,
                return_type: RET_SSIZE,
                narg: 3,
                arg_bytes: 12,
            },
            Sysent {
                call: write,
                munge: munge_www,
                return_type: RET_SSIZE,
                narg: 3,
                arg_bytes: 12,
            },
        ])
    }

    /// Find the system call table.
    ///
    /// Searches the image for the unslid fingerprint, then re-reads every
    /// word the fingerprint spans from the live kernel and compares it
    /// against the slid expectation, so a coincidental match elsewhere in
    /// the image cannot survive. Idempotent once located.
    pub fn locate<M, I>(&mut self, mem: &mut M, image: &ImageContext<I>) -> Result<()>
    where
        M: KernelMemory + ?Sized,
        I: KernelImage,
    {
        if !matches!(self.state, State::Absent) {
            return Ok(());
        }
        let entries = Self::fingerprint(image)?;
        let mut signature = Vec::with_capacity(entries.len() * SYSENT_SIZE);
        for entry in &entries {
            entry.write_bytes(&mut signature);
        }
        let sysent = image.resolve_signature(&signature)?;
        // What the live table must hold at that address.
        let slide = image.slide();
        let mut expected = Vec::with_capacity(entries.len() * SYSENT_WORDS);
        for entry in &entries {
            let mut slid = *entry;
            slid.call += slide;
            if slid.munge != 0 {
                slid.munge += slide;
            }
            expected.extend_from_slice(&slid.pack());
        }
        let live = mem::read_words(mem, sysent, expected.len())?;
        if live != expected {
            return Err(Error::SysentMismatch);
        }
        let nosys = image.resolve_symbol("_nosys")?;
        log::debug!("Located sysent at {:#x}", sysent);
        self.state = State::Located { sysent, nosys };
        Ok(())
    }

    /// Install the hook: copy the dispatcher blob over the target function,
    /// then repoint the hijacked slot at it.
    pub fn install<M, I>(
        &mut self,
        mem: &mut M,
        image: &ImageContext<I>,
        hook_code: &[u8],
    ) -> Result<()>
    where
        M: KernelMemory + ?Sized,
        I: KernelImage,
    {
        if self.is_installed() {
            return Err(Error::AlreadyHooked);
        }
        self.locate(mem, image)?;
        let (sysent, nosys) = match self.state {
            State::Located { sysent, nosys } => (sysent, nosys),
            _ => unreachable!(),
        };
        let function = image.resolve_symbol(TARGET_FUNCTION)?;
        let target = sysent + self.code as u64 * SYSENT_SIZE as u64;
        // The slot must still hold the empty-syscall stub.
        let sy_call = mem.read(target, WORD_SIZE)?;
        if sy_call != nosys {
            return Err(Error::AlreadyHooked);
        }
        // Save the function words we are about to overwrite.
        let count = mem::words_for(hook_code.len());
        let mut original = reserve_words(count)?;
        for i in 0..count {
            original.push(mem.read(function + (i * WORD_SIZE) as u64, WORD_SIZE)?);
        }
        // Word-pack the dispatcher, keeping the saved bytes in the tail of
        // the final word so nothing past the blob changes.
        let mut code_words = original.clone();
        for (i, word) in code_words.iter_mut().enumerate() {
            let mut bytes = word.to_le_bytes();
            let off = i * WORD_SIZE;
            let n = (hook_code.len() - off).min(WORD_SIZE);
            bytes[..n].copy_from_slice(&hook_code[off..off + n]);
            *word = u64::from_le_bytes(bytes);
        }
        // Overwrite the target function first. Until the table is touched,
        // the syscall still dispatches to unmodified code, so an
        // interruption here cannot make a half-written dispatcher reachable.
        mem::write_words(mem, function, &code_words)?;
        // Now repoint the slot, last field first: an interruption mid-entry
        // leaves the earlier fields in their prior form.
        let hook_entry = Sysent {
            call: function,
            munge: 0,
            return_type: RET_UINT64,
            narg: 6,
            arg_bytes: 48,
        };
        let words = hook_entry.pack();
        for i in (0..SYSENT_WORDS).rev() {
            mem.write(target + (i * WORD_SIZE) as u64, words[i], WORD_SIZE)?;
        }
        log::debug!("Hooked syscall {} -> {:#x}", self.code, function);
        self.state = State::Installed {
            sysent,
            nosys,
            function,
            original,
        };
        Ok(())
    }

    /// Remove the hook, reversing the install order: put the empty-syscall
    /// stub back in the slot, then restore the saved function words. No-op
    /// unless installed.
    pub fn remove<M>(&mut self, mem: &mut M) -> Result<()>
    where
        M: KernelMemory + ?Sized,
    {
        let State::Installed {
            sysent,
            nosys,
            function,
            original,
        } = &self.state
        else {
            return Ok(());
        };
        let target = sysent + self.code as u64 * SYSENT_SIZE as u64;
        mem::write_words(mem, target, &Sysent::nosys(*nosys).pack())?;
        mem::write_words(mem, *function, original)?;
        log::debug!("Unhooked syscall {}", self.code);
        self.state = State::Absent;
        Ok(())
    }

    /// Call an arbitrary kernel function with up to six arguments through
    /// the hijacked syscall.
    pub fn kernel_call<S>(&self, invoker: &mut S, func: u64, args: &[u64]) -> Result<u64>
    where
        S: SyscallInvoker + ?Sized,
    {
        debug_assert!(args.len() <= 6, "at most six kernel call arguments");
        debug_assert!(self.is_installed(), "kernel call without an installed hook");
        let mut padded = [0u64; 6];
        let n = args.len().min(padded.len());
        padded[..n].copy_from_slice(&args[..n]);
        invoker.invoke(self.code, func, padded)
    }
}

/// Reserve the buffer for the saved function words without aborting on an
/// impossible size.
fn reserve_words(count: usize) -> Result<Vec<u64>> {
    let mut words = Vec::new();
    words
        .try_reserve_exact(count)
        .map_err(|_| Error::AllocationFailed)?;
    Ok(words)
}
