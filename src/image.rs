use crate::error::Result;

/// Resolution against the kernel image's static (link-time) layout.
///
/// The backing implementation (symbol table parsing, text/data search) is
/// external; this crate only asks it two questions.
pub trait KernelImage {
    /// Static address of a named symbol.
    fn symbol(&self, name: &str) -> Result<u64>;

    /// Static address of an exact byte sequence within the image.
    fn search(&self, bytes: &[u8]) -> Result<u64>;
}

/// A kernel image plus the slide applied to every resolution.
///
/// Created unslid so bootstrap lookups return static addresses; once the
/// slide is known, `set_slide` reloads the context and every subsequent
/// resolution transparently returns the runtime address. The slide is set
/// exactly once.
pub struct ImageContext<I> {
    image: I,
    slide: u64,
}

impl<I: KernelImage> ImageContext<I> {
    pub fn new(image: I) -> ImageContext<I> {
        ImageContext { image, slide: 0 }
    }

    pub fn slide(&self) -> u64 {
        self.slide
    }

    pub fn set_slide(&mut self, slide: u64) {
        debug_assert_eq!(self.slide, 0, "kernel slide set twice");
        log::debug!("Kernel slide = {:#x}", slide);
        self.slide = slide;
    }

    /// Resolve a symbol, applying the current slide.
    pub fn resolve_symbol(&self, name: &str) -> Result<u64> {
        Ok(self.image.symbol(name)? + self.slide)
    }

    /// Resolve a byte signature, applying the current slide.
    pub fn resolve_signature(&self, bytes: &[u8]) -> Result<u64> {
        Ok(self.image.search(bytes)? + self.slide)
    }
}
