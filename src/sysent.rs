use crate::mem::WORD_SIZE;

/// Return-type tags used by the syscall dispatcher.
pub const RET_NONE: i32 = 0;
pub const RET_INT: i32 = 1;
pub const RET_SSIZE: i32 = 6;
pub const RET_UINT64: i32 = 7;

/// Size of a table entry in kernel words.
pub const SYSENT_WORDS: usize = 3;

/// Size of a table entry in bytes.
pub const SYSENT_SIZE: usize = SYSENT_WORDS * WORD_SIZE;

/// An entry in the system call table.
///
/// The in-kernel layout is fixed: two pointer-sized fields followed by a
/// packed `i32`/`i16`/`u16` metadata word, little-endian. All conversions go
/// through `pack`/`unpack` so the exact field order and width are in one
/// place rather than scattered through casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sysent {
    /// Handler function address.
    pub call: u64,
    /// Argument-munging helper address, 0 if none.
    pub munge: u64,
    pub return_type: i32,
    pub narg: i16,
    pub arg_bytes: u16,
}

impl Sysent {
    /// The "empty syscall" stub descriptor occupying unimplemented slots.
    pub fn nosys(nosys: u64) -> Sysent {
        Sysent {
            call: nosys,
            munge: 0,
            return_type: RET_INT,
            narg: 0,
            arg_bytes: 0,
        }
    }

    pub fn pack(&self) -> [u64; SYSENT_WORDS] {
        let meta = (self.return_type as u32 as u64)
            | ((self.narg as u16 as u64) << 32)
            | ((self.arg_bytes as u64) << 48);
        [self.call, self.munge, meta]
    }

    pub fn unpack(words: [u64; SYSENT_WORDS]) -> Sysent {
        Sysent {
            call: words[0],
            munge: words[1],
            return_type: words[2] as u32 as i32,
            narg: (words[2] >> 32) as u16 as i16,
            arg_bytes: (words[2] >> 48) as u16,
        }
    }

    /// Append this entry's in-kernel bytes to `out`.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        for word in self.pack() {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
}
