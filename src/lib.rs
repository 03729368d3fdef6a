pub mod bootstrap;
pub mod error;
pub mod hook;
pub mod image;
pub mod mem;
pub mod os;
pub mod slide;
pub mod sysent;

pub mod all {
    pub use crate::bootstrap::*;
    pub use crate::error::*;
    pub use crate::hook::*;
    pub use crate::image::*;
    pub use crate::mem::*;
    pub use crate::os::*;
    pub use crate::slide::*;
    pub use crate::sysent::*;
}
