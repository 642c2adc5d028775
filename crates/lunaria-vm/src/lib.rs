//! Lunaria embedding surface: the index-based stack API, calls and
//! protected calls, coroutines and collector control.

pub mod call;
pub mod coroutine;
pub mod gc;
pub mod vm;

pub use coroutine::CoStatus;
pub use gc::GcCommand;
pub use lunaria_core::config::RuntimeConfig;
pub use lunaria_core::error::{LuaError, ThreadStatus};
pub use lunaria_core::value::TValue;
pub use vm::{upvalue_index, Executor, KFunction, NativeFn, Vm, REGISTRY_INDEX};
