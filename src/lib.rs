//! Crate root: wires together the cinder toolchain.
//!
//! The stages are small and composable:
//! - `lexer` turns source text into a spanned token stream.
//! - `bytecode::compile` parses and lowers in a single pass, producing
//!   a binary `Module` plus a `DebugInfo` sidecar.
//! - `bytecode::module` owns the external module format.
//! - `runtime::vm` executes a module to completion or to a fault.

pub mod bytecode;
pub mod lexer;
pub mod runtime;
pub mod symbols;
pub mod token;

pub use bytecode::compile::{Compiled, compile_file, compile_source};
pub use bytecode::compile_error::CompileError;
pub use bytecode::disasm::disassemble;
pub use bytecode::module::{DebugInfo, Module, ModuleError};
pub use runtime::fault::Fault;
pub use runtime::vm::{Vm, VmConfig};
