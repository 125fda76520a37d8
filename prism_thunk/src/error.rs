//! Error types for closure construction.

use std::fmt;

/// Why a signature cannot be turned into a trampoline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// An argument is an aggregate passed by value.
    AggregateArgument { index: usize, size: usize },
    /// An argument is a vector type, which the register-window model does not carry.
    VectorArgument { index: usize },
    /// The return value is an aggregate, which would need a hidden pointer argument.
    AggregateReturn { size: usize },
    /// The argument count does not fit the stack-copy encoding.
    TooManyArguments(usize),
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::AggregateArgument { index, size } => {
                write!(f, "argument {} is a {}-byte aggregate passed by value", index, size)
            }
            SignatureError::VectorArgument { index } => {
                write!(f, "argument {} is a vector type", index)
            }
            SignatureError::AggregateReturn { size } => {
                write!(f, "returns a {}-byte aggregate by value", size)
            }
            SignatureError::TooManyArguments(count) => {
                write!(f, "{} arguments exceed the trampoline frame limit", count)
            }
        }
    }
}

impl std::error::Error for SignatureError {}

/// Errors produced while constructing a closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThunkError {
    /// The signature cannot be encoded; no code was generated.
    UnsupportedSignature(SignatureError),
    /// The host processor cannot execute the generated code.
    UnsupportedTarget(&'static str),
    /// The arena could not provide a region of the requested size.
    ArenaExhausted { requested: usize },
    /// Changing page protection failed.
    Protection(String),
}

impl fmt::Display for ThunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThunkError::UnsupportedSignature(err) => write!(f, "unsupported signature: {}", err),
            ThunkError::UnsupportedTarget(arch) => {
                write!(f, "closure trampolines cannot run on {}", arch)
            }
            ThunkError::ArenaExhausted { requested } => {
                write!(f, "executable arena exhausted ({} bytes requested)", requested)
            }
            ThunkError::Protection(msg) => write!(f, "page protection change failed: {}", msg),
        }
    }
}

impl std::error::Error for ThunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ThunkError::UnsupportedSignature(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SignatureError> for ThunkError {
    fn from(err: SignatureError) -> Self {
        ThunkError::UnsupportedSignature(err)
    }
}

/// Result alias for closure operations.
pub type ThunkResult<T> = Result<T, ThunkError>;
