//! x64 backend modules.
pub mod assembler;
pub mod encoder;
pub mod registers;

pub use assembler::{Assembled, Assembler, Inst, PatchSite};
pub use registers::{Gpr, Mem, Win64, Xmm};
