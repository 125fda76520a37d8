//! Code generation backends for trampoline emission.
//!
//! Only the x64 encoder exists. Layout bytes can be produced on any host;
//! running them requires an x86-64 processor.

pub mod x64;
