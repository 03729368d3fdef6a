//! Kernel slide discovery.
//!
//! We use the kernel read primitive to test each possible slide until we
//! find the right one. Technically every read before the correct slide is
//! to an arbitrary location and any of them could panic the kernel, but in
//! extensive testing that has never happened.

use crate::error::{Error, Result};
use crate::image::{ImageContext, KernelImage};
use crate::mem::{KernelMemory, WORD_SIZE};

/// Granularity of the kernel's load-address randomization.
pub const SLIDE_INCREMENT: u64 = 0x200000;

/// Exclusive upper bound on candidate slides.
pub const MAX_SLIDE: u64 = (SLIDE_INCREMENT / 2) * 0x400;

/// Length of the boot session uuid string, including the NUL.
pub const BOOT_UUID_LEN: usize = 37;

/// OS identification query used only as a slide-validation fingerprint.
pub trait SystemQuery {
    fn boot_session_uuid(&self) -> Result<[u8; BOOT_UUID_LEN]>;
}

/// Brute-force the kernel slide.
///
/// `image` must still be unslid: the probe compares the word at
/// `_vm_kernel_slide`'s static address plus each candidate against the
/// candidate itself, and accepts the first match. Candidates are tried in
/// strictly increasing order; the search space is small enough (1024
/// candidates at most) that this completes in well under a second.
pub fn probe_kernel_slide<M, I, Q>(mem: &mut M, image: &ImageContext<I>, query: &Q) -> Result<u64>
where
    M: KernelMemory + ?Sized,
    I: KernelImage,
    Q: SystemQuery + ?Sized,
{
    let vm_kernel_slide = image.resolve_symbol("_vm_kernel_slide")?;
    let uuid_string = image.resolve_symbol("_bootsessionuuid_string")?;
    // Fetch the reference uuid once, up front.
    let uuid = query.boot_session_uuid()?;
    let uuid_words: Vec<u64> = uuid
        .chunks_exact(WORD_SIZE)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect();

    let mut slide = SLIDE_INCREMENT;
    while slide < MAX_SLIDE {
        let value = mem.read(vm_kernel_slide + slide, WORD_SIZE)?;
        if value == slide {
            // Cross-check against the boot session uuid. The self-referential
            // probe above is the authoritative test; a mismatch here is only
            // flagged, it does not reject the candidate.
            let base = uuid_string + slide;
            for (i, &expected) in uuid_words.iter().enumerate() {
                let word = mem.read(base + (i * WORD_SIZE) as u64, WORD_SIZE)?;
                if word != expected {
                    log::warn!(
                        "Boot session uuid word {} mismatch at slide {:#x}",
                        i,
                        slide
                    );
                }
            }
            log::debug!("Found kernel slide {:#x}", slide);
            return Ok(slide);
        }
        slide += SLIDE_INCREMENT;
    }
    Err(Error::SlideNotFound)
}
