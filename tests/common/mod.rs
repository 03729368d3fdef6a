//! A simulated kernel for end-to-end pipeline runs: a word-addressed memory
//! image with a planted slide variable, boot session uuid, sysent table and
//! hijackable slot, plus an invoker that emulates the hooked syscall.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use kmint::all::*;

pub const SLIDE: u64 = 23 * SLIDE_INCREMENT;

// Static (link-time) addresses of the planted symbols.
pub const VM_KERNEL_SLIDE: u64 = 0xffff_ff80_0090_0000;
pub const BOOTSESSIONUUID: u64 = 0xffff_ff80_00a0_0000;
pub const NOSYS: u64 = 0xffff_ff80_0030_0000;
pub const EXIT: u64 = 0xffff_ff80_0030_1000;
pub const FORK: u64 = 0xffff_ff80_0030_2000;
pub const READ: u64 = 0xffff_ff80_0030_3000;
pub const WRITE: u64 = 0xffff_ff80_0030_4000;
pub const MUNGE_W: u64 = 0xffff_ff80_0031_0000;
pub const MUNGE_WWW: u64 = 0xffff_ff80_0031_1000;
pub const BSD_INIT: u64 = 0xffff_ff80_0040_0000;
pub const SYSENT_BASE: u64 = 0xffff_ff80_0050_0000;
pub const KERNEL_TASK: u64 = 0xffff_ff80_0060_0000;
pub const CURRENT_TASK_FN: u64 = 0xffff_ff80_0061_0000;
pub const GET_TASK_IPCSPACE: u64 = 0xffff_ff80_0062_0000;
pub const TASK_REFERENCE: u64 = 0xffff_ff80_0063_0000;
pub const CONVERT_TASK_TO_PORT: u64 = 0xffff_ff80_0064_0000;
pub const IPC_PORT_COPYOUT_SEND: u64 = 0xffff_ff80_0065_0000;

// Planted kernel object sentinels.
pub const KERNEL_TASK_PTR: u64 = 0xffff_ff80_dead_0000;
pub const OUR_TASK: u64 = 0xffff_ff80_beef_0000;
pub const IPC_SPACE: u64 = 0xffff_ff80_cafe_0000;
pub const KERNEL_PORT: u64 = 0xffff_ff80_f00d_0000;
pub const PORT_NAME: u64 = 0x1203;

pub fn dispatcher() -> Vec<u8> {
    // 28 opaque bytes standing in for the real trampoline.
    (0..28u8).map(|b| b.wrapping_add(0xc0)).collect()
}

pub fn uuid_bytes() -> [u8; BOOT_UUID_LEN] {
    let mut buf = [0u8; BOOT_UUID_LEN];
    buf[..36].copy_from_slice(b"D1E4C9A0-5F7B-4E26-9C81-3A60F2B4D7E0");
    buf
}

pub struct SimState {
    pub words: BTreeMap<u64, u64>,
    pub static_table: Vec<u8>,
    /// Error to plant in the primitive's own setup.
    pub init_error: Option<Error>,
    pub inited: bool,
    pub deinits: u32,
    pub kernel_task_refs: u32,
    pub copyout_returns_null: bool,
}

#[derive(Clone)]
pub struct SimKernel(pub Rc<RefCell<SimState>>);

impl SimKernel {
    pub fn set_words(&self, kaddr: u64, words: &[u64]) {
        let mut state = self.0.borrow_mut();
        for (i, &word) in words.iter().enumerate() {
            state.words.insert(kaddr + (i * WORD_SIZE) as u64, word);
        }
    }
}

impl KernelMemory for SimKernel {
    fn init(&mut self) -> Result<()> {
        let mut state = self.0.borrow_mut();
        if let Some(err) = state.init_error.take() {
            return Err(err);
        }
        state.inited = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.0.borrow_mut().deinits += 1;
    }

    fn read(&mut self, kaddr: u64, width: usize) -> Result<u64> {
        assert_eq!(width, WORD_SIZE);
        assert!(self.0.borrow().inited);
        Ok(self.0.borrow().words.get(&kaddr).copied().unwrap_or(0))
    }

    fn write(&mut self, kaddr: u64, value: u64, width: usize) -> Result<()> {
        assert_eq!(width, WORD_SIZE);
        assert!(self.0.borrow().inited);
        self.0.borrow_mut().words.insert(kaddr, value);
        Ok(())
    }
}

pub struct SimImage {
    pub shared: SimKernel,
    /// A symbol to pretend is missing, for fatal-path injection.
    pub hide: Option<&'static str>,
}

impl KernelImage for SimImage {
    fn symbol(&self, name: &str) -> Result<u64> {
        if self.hide == Some(name) {
            return Err(Error::SymbolNotFound(name.into()));
        }
        match name {
            "_vm_kernel_slide" => Ok(VM_KERNEL_SLIDE),
            "_bootsessionuuid_string" => Ok(BOOTSESSIONUUID),
            "_nosys" => Ok(NOSYS),
            "_exit" => Ok(EXIT),
            "_fork" => Ok(FORK),
            "_read" => Ok(READ),
            "_write" => Ok(WRITE),
            "_munge_w" => Ok(MUNGE_W),
            "_munge_www" => Ok(MUNGE_WWW),
            "_bsd_init" => Ok(BSD_INIT),
            "_kernel_task" => Ok(KERNEL_TASK),
            "_current_task" => Ok(CURRENT_TASK_FN),
            "_get_task_ipcspace" => Ok(GET_TASK_IPCSPACE),
            "_task_reference" => Ok(TASK_REFERENCE),
            "_convert_task_to_port" => Ok(CONVERT_TASK_TO_PORT),
            "_ipc_port_copyout_send" => Ok(IPC_PORT_COPYOUT_SEND),
            _ => Err(Error::SymbolNotFound(name.into())),
        }
    }

    fn search(&self, bytes: &[u8]) -> Result<u64> {
        let state = self.shared.0.borrow();
        state
            .static_table
            .windows(bytes.len().max(1))
            .position(|window| window == bytes)
            .map(|pos| SYSENT_BASE + pos as u64)
            .ok_or(Error::PatternNotFound)
    }
}

pub struct SimQuery {
    pub fail: bool,
}

impl SystemQuery for SimQuery {
    fn boot_session_uuid(&self) -> Result<[u8; BOOT_UUID_LEN]> {
        if self.fail {
            return Err(Error::SystemQueryFailed("kern.bootsessionuuid".into()));
        }
        Ok(uuid_bytes())
    }
}

pub struct SimInvoker {
    pub shared: SimKernel,
}

impl SyscallInvoker for SimInvoker {
    fn invoke(&mut self, code: u32, func: u64, args: [u64; 6]) -> Result<u64> {
        assert_eq!(code, HOOK_SYSCALL_CODE);
        let mut state = self.shared.0.borrow_mut();
        // The hooked slot must be live before any call arrives: pointing at
        // the target function, tagged uint64 with six arguments, and the
        // dispatcher bytes must actually be in place.
        let target = SYSENT_BASE + SLIDE + code as u64 * SYSENT_SIZE as u64;
        let entry = Sysent::unpack([
            state.words[&target],
            state.words[&(target + WORD_SIZE as u64)],
            state.words[&(target + 2 * WORD_SIZE as u64)],
        ]);
        assert_eq!(entry.call, BSD_INIT + SLIDE);
        assert_eq!(entry.return_type, RET_UINT64);
        assert_eq!(entry.narg, 6);
        assert_eq!(entry.arg_bytes, 48);
        let first_code_word = u64::from_le_bytes(dispatcher()[..8].try_into().unwrap());
        assert_eq!(state.words[&(BSD_INIT + SLIDE)], first_code_word);

        if func == CURRENT_TASK_FN + SLIDE {
            Ok(OUR_TASK)
        } else if func == GET_TASK_IPCSPACE + SLIDE {
            assert_eq!(args[0], OUR_TASK);
            Ok(IPC_SPACE)
        } else if func == TASK_REFERENCE + SLIDE {
            assert_eq!(args[0], KERNEL_TASK_PTR);
            state.kernel_task_refs += 1;
            Ok(0)
        } else if func == CONVERT_TASK_TO_PORT + SLIDE {
            assert_eq!(args[0], KERNEL_TASK_PTR);
            Ok(KERNEL_PORT)
        } else if func == IPC_PORT_COPYOUT_SEND + SLIDE {
            assert_eq!(args[0], KERNEL_PORT);
            assert_eq!(args[1], IPC_SPACE);
            if state.copyout_returns_null {
                Ok(0)
            } else {
                Ok(PORT_NAME)
            }
        } else {
            Ok(0)
        }
    }
}

fn table_entries(slide: u64) -> Vec<Sysent> {
    let munge = |addr: u64| if addr == 0 { 0 } else { addr + slide };
    let mut entries = vec![
        Sysent::nosys(NOSYS + slide),
        Sysent {
            call: EXIT + slide,
            munge: munge(MUNGE_W),
            return_type: RET_NONE,
            narg: 1,
            arg_bytes: 4,
        },
        Sysent {
            call: FORK + slide,
            munge: 0,
            return_type: RET_INT,
            narg: 0,
            arg_bytes: 0,
        },
        Sysent {
            call: READ + slide,
            munge: munge(MUNGE_WWW),
            return_type: RET_SSIZE,
            narg: 3,
            arg_bytes: 12,
        },
        Sysent {
            call: WRITE + slide,
            munge: munge(MUNGE_WWW),
            return_type: RET_SSIZE,
            narg: 3,
            arg_bytes: 12,
        },
    ];
    // Slots 5 through 8 are unimplemented; 8 is the hijack target.
    for _ in 5..=8 {
        entries.push(Sysent::nosys(NOSYS + slide));
    }
    entries
}

pub struct Sim {
    pub kernel: SimKernel,
    pub hide_symbol: Option<&'static str>,
    pub query_fails: bool,
}

impl Sim {
    pub fn new() -> Sim {
        let kernel = SimKernel(Rc::new(RefCell::new(SimState {
            words: BTreeMap::new(),
            static_table: Vec::new(),
            init_error: None,
            inited: false,
            deinits: 0,
            kernel_task_refs: 0,
            copyout_returns_null: false,
        })));

        // The on-disk (unslid) table image that signature search runs over.
        let mut static_table = Vec::new();
        for entry in table_entries(0) {
            entry.write_bytes(&mut static_table);
        }
        kernel.0.borrow_mut().static_table = static_table;

        // Live kernel contents, at slid addresses.
        kernel.set_words(VM_KERNEL_SLIDE + SLIDE, &[SLIDE]);
        let uuid = uuid_bytes();
        let mut padded = [0u8; 40];
        padded[..BOOT_UUID_LEN].copy_from_slice(&uuid);
        let uuid_words: Vec<u64> = padded
            .chunks_exact(WORD_SIZE)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        kernel.set_words(BOOTSESSIONUUID + SLIDE, &uuid_words);
        for (i, entry) in table_entries(SLIDE).iter().enumerate() {
            kernel.set_words(SYSENT_BASE + SLIDE + (i * SYSENT_SIZE) as u64, &entry.pack());
        }
        // The first words of _bsd_init, soon to be overwritten.
        kernel.set_words(
            BSD_INIT + SLIDE,
            &[
                0x9090_9090_9090_9090,
                0x1bad_b002_1bad_b002,
                0x5555_5555_5555_5555,
                0x0123_4567_89ab_cdef,
            ],
        );
        kernel.set_words(KERNEL_TASK + SLIDE, &[KERNEL_TASK_PTR]);

        Sim {
            kernel,
            hide_symbol: None,
            query_fails: false,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        self.kernel.0.borrow().words.clone()
    }

    pub fn bootstrap(&self) -> Bootstrap<SimKernel, SimImage, SimQuery, SimInvoker> {
        Bootstrap::new(
            self.kernel.clone(),
            SimImage {
                shared: self.kernel.clone(),
                hide: self.hide_symbol,
            },
            SimQuery {
                fail: self.query_fails,
            },
            SimInvoker {
                shared: self.kernel.clone(),
            },
            dispatcher(),
        )
    }
}
