//! WASI execution host for WebAssembly command modules.
//!
//! Given a compiled binary, the host works out which WASI ABI generation
//! and execution strategy it needs, wires its imports to stream-backed
//! standard I/O, runs it, and hands back a pending exit code. Binaries
//! carrying the Asyncify stack-switching transformation get real blocking
//! reads: the host drives their unwind/rewind exports so that an empty
//! stdin suspends the guest instead of failing it.
//!
//! The engine itself is `wasmtime`; component-model binaries are delegated
//! to `wasmtime-wasi`. What lives here is everything in between: binary
//! introspection, the hand-wired Preview-1 import surface, the suspension
//! trampoline, and the loader that ties them together.

mod asyncify;
pub mod clocks;
mod ctx;
mod error;
mod introspect;
mod loader;
pub mod random;
pub mod runtime;
mod stdio;
mod string_array;

mod preview1;
mod preview2;

pub use ctx::HostCtx;
pub use error::Errno;
pub use introspect::{
    classify_abi, detect_asyncify, detect_memory_import, AsyncifySupport, MemoryLimits, WasiAbi,
};
pub use loader::{Execution, Host, LoadedModule, PlainModule};
pub use stdio::{OrderedWriter, Stdio, StdinQueue};
pub use string_array::{StringArray, StringArrayError};
