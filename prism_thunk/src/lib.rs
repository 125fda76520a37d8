//! Native closure trampolines for Prism.
//!
//! Binds an (instance, method) pair to a freshly generated plain function
//! pointer, so object state can be handed to C-style callback APIs that only
//! accept a bare function address:
//! - Executable memory arena with per-region W^X transitions
//! - Trampoline layouts for the Win64 register window, any arity
//! - Typed and untyped closure handles
//! - Instruction cache synchronization
#![deny(unsafe_op_in_unsafe_fn)]
pub mod arena;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod icache;
pub mod layout;
pub mod signature;
pub mod thunk;

pub use arena::{ArenaStats, ExecArena, ExecRegion};
pub use config::ArenaConfig;
pub use context::ThunkContext;
pub use error::{SignatureError, ThunkError, ThunkResult};
pub use icache::flush_instruction_cache;
pub use layout::{LayoutCache, TrampolineLayout};
pub use signature::{ArgClass, Callback, NativeArg, NativeRet, RetClass, Shape, Signature};
pub use thunk::{RawThunk, Thunk};
