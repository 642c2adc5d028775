//! Runtime error types and thread status codes.

use crate::state::GlobalState;
use crate::value::TValue;
use thiserror::Error;

/// Status of a thread, also used as the result code of protected calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadStatus {
    #[default]
    Ok,
    Yield,
    ErrRun,
    ErrMem,
    ErrGcMm,
    ErrErr,
}

impl ThreadStatus {
    pub fn is_error(self) -> bool {
        !matches!(self, ThreadStatus::Ok | ThreadStatus::Yield)
    }
}

/// A runtime error.
#[derive(Debug, Clone, Error)]
pub enum LuaError {
    /// Allocation failed even after an emergency collection.
    #[error("not enough memory")]
    Memory,
    #[error("table index is nil")]
    NilIndex,
    #[error("table index is NaN")]
    NanIndex,
    #[error("table overflow")]
    TableOverflow,
    #[error("invalid key to 'next'")]
    InvalidNextKey,
    #[error("stack overflow")]
    StackOverflow,
    #[error("C stack overflow")]
    CStackOverflow,
    /// Raised when the stack overflows again while an overflow is being handled.
    #[error("error in error handling")]
    ErrorInHandler,
    /// General runtime error with message.
    #[error("{0}")]
    Runtime(String),
    /// An arbitrary value raised as an error object.
    #[error("(error object is a {} value)", .0.type_name())]
    Value(TValue),
    #[error("error in __gc metamethod ({0})")]
    GcMetamethod(String),
    #[error("attempt to yield from outside a coroutine")]
    YieldOutsideCoroutine,
    #[error("attempt to yield across a C-call boundary")]
    YieldAcrossBoundary,
    #[error("cannot resume non-suspended coroutine")]
    ResumeNonSuspended,
    #[error("cannot resume dead coroutine")]
    ResumeDead,
    /// Unwinding marker used by yields; caught by `resume`.
    #[error("coroutine yield")]
    Yield,
}

impl LuaError {
    pub fn status(&self) -> ThreadStatus {
        match self {
            LuaError::Memory => ThreadStatus::ErrMem,
            LuaError::GcMetamethod(_) => ThreadStatus::ErrGcMm,
            LuaError::ErrorInHandler => ThreadStatus::ErrErr,
            LuaError::Yield => ThreadStatus::Yield,
            _ => ThreadStatus::ErrRun,
        }
    }

    /// Convert this error into the value left on the stack at a protected boundary.
    ///
    /// Memory errors reuse the preallocated message so reporting them never allocates.
    pub fn to_value(&self, g: &mut GlobalState) -> TValue {
        match self {
            LuaError::Value(v) => *v,
            LuaError::Memory => TValue::Str(g.mem_err_msg),
            other => {
                let msg = other.to_string();
                match g.new_string(msg.as_bytes()) {
                    Ok(id) => TValue::Str(id),
                    Err(_) => TValue::Str(g.mem_err_msg),
                }
            }
        }
    }
}
