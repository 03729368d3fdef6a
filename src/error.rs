use std::fmt;

/// Everything that can go wrong while minting the kernel task capability.
///
/// None of these are recoverable in-process; callers either propagate them
/// to `Bootstrap::run_or_exit` or handle termination themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A symbol is missing from the kernel image's symbol table.
    SymbolNotFound(String),
    /// A byte signature could not be located in the kernel image.
    PatternNotFound,
    /// No candidate slide passed the self-referential probe.
    SlideNotFound,
    /// The live sysent words do not match the fingerprint we matched on.
    SysentMismatch,
    /// The target syscall slot is occupied, or the hook is already in.
    AlreadyHooked,
    /// The kernel returned a null send right for the kernel task.
    CapabilityMintFailed,
    /// An OS query (e.g. a sysctl) failed.
    SystemQueryFailed(String),
    /// Could not allocate the buffer for the saved function words.
    AllocationFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SymbolNotFound(name) => {
                write!(f, "could not resolve kernel symbol {}", name)
            }
            Error::PatternNotFound => write!(f, "could not find byte pattern in kernel image"),
            Error::SlideNotFound => write!(f, "could not find kernel slide"),
            Error::SysentMismatch => write!(f, "kernel sysent data mismatch"),
            Error::AlreadyHooked => write!(f, "target syscall slot is not empty"),
            Error::CapabilityMintFailed => {
                write!(f, "could not get send right to kernel task")
            }
            Error::SystemQueryFailed(what) => write!(f, "system query {} failed", what),
            Error::AllocationFailed => write!(f, "could not allocate saved-bytes buffer"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
