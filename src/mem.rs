use crate::error::Result;

/// Width of a kernel word in bytes. Addresses and words are `u64`.
pub const WORD_SIZE: usize = 8;

/// The externally supplied read/write primitive over kernel virtual memory.
///
/// The implementation is whatever exploit got us here; this crate only
/// assumes synchronous, word-at-a-time access. Reads and writes outside the
/// kernel image have undefined accuracy. There is no atomicity across
/// multi-word spans: the kernel keeps running between any two operations.
pub trait KernelMemory {
    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self);

    /// Read the `width`-byte integer at the given kernel address.
    fn read(&mut self, kaddr: u64, width: usize) -> Result<u64>;

    /// Write `value` as a `width`-byte integer to the given kernel address.
    fn write(&mut self, kaddr: u64, value: u64, width: usize) -> Result<()>;
}

/// Read `count` consecutive kernel words starting at `kaddr`.
pub fn read_words<M>(mem: &mut M, kaddr: u64, count: usize) -> Result<Vec<u64>>
where
    M: KernelMemory + ?Sized,
{
    let mut words = Vec::with_capacity(count);
    for i in 0..count {
        words.push(mem.read(kaddr + (i * WORD_SIZE) as u64, WORD_SIZE)?);
    }
    Ok(words)
}

/// Write the given words to consecutive kernel addresses, in increasing
/// address order.
pub fn write_words<M>(mem: &mut M, kaddr: u64, words: &[u64]) -> Result<()>
where
    M: KernelMemory + ?Sized,
{
    for (i, &word) in words.iter().enumerate() {
        mem.write(kaddr + (i * WORD_SIZE) as u64, word, WORD_SIZE)?;
    }
    Ok(())
}

/// Round a byte length up to a whole number of kernel words.
pub fn words_for(len: usize) -> usize {
    (len + WORD_SIZE - 1) / WORD_SIZE
}

/// Fill `buf` from kernel memory starting at `kaddr`.
///
/// Every transfer is a whole word. When the span is not a word multiple,
/// the final read steps backward so it is a word ending at the last byte of
/// the span, overlapping bytes already transferred. A span shorter than one
/// word reads the single word starting at `kaddr` and keeps its leading
/// bytes.
pub fn read_span<M>(mem: &mut M, kaddr: u64, buf: &mut [u8]) -> Result<()>
where
    M: KernelMemory + ?Sized,
{
    let len = buf.len();
    let mut off = 0usize;
    while off < len {
        if len - off < WORD_SIZE {
            off = len.saturating_sub(WORD_SIZE);
        }
        let word = mem.read(kaddr + off as u64, WORD_SIZE)?;
        let n = WORD_SIZE.min(len - off);
        buf[off..off + n].copy_from_slice(&word.to_le_bytes()[..n]);
        off += n;
    }
    Ok(())
}

/// Write `buf` to kernel memory starting at `kaddr`, in increasing address
/// order.
///
/// The tail is handled like `read_span`: a non-word-multiple span ends with
/// a backward-stepped whole-word write sourced entirely from `buf`. A span
/// shorter than one word reads the current word first and merges, so the
/// bytes past the span keep their values.
pub fn write_span<M>(mem: &mut M, kaddr: u64, buf: &[u8]) -> Result<()>
where
    M: KernelMemory + ?Sized,
{
    let len = buf.len();
    let mut off = 0usize;
    while off < len {
        if len - off < WORD_SIZE {
            off = len.saturating_sub(WORD_SIZE);
        }
        let n = WORD_SIZE.min(len - off);
        let mut bytes = [0u8; WORD_SIZE];
        if n < WORD_SIZE {
            bytes = mem.read(kaddr + off as u64, WORD_SIZE)?.to_le_bytes();
        }
        bytes[..n].copy_from_slice(&buf[off..off + n]);
        mem.write(kaddr + off as u64, u64::from_le_bytes(bytes), WORD_SIZE)?;
        off += n;
    }
    Ok(())
}
