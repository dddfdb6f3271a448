//! x86-64 System V JIT backend.
//!
//! The pipeline is: decode each function's bytecode into typed instructions,
//! propagate abstract stack shapes over them (`analysis`), then emit machine
//! code with the top of the value stack pinned into registers (`codegen`).
//! Emitted code calls back into `runtime` for printing, slow-path
//! comparators, and the per-function closure frame table.

pub mod analysis;
pub mod asm;
pub mod codegen;
pub mod memory;
pub mod runtime;

use thiserror::Error;

pub use analysis::{annotate, AnnotatedBytecode, InstrArg, InstrWithArgs};
pub use codegen::{build_native_proxy, build_program, JitProgram};
pub use memory::ExecutableMemory;
pub use runtime::RuntimeEnvironment;

/// Fatal errors while building machine code.
#[derive(Debug, Error)]
pub enum JitError {
    /// An opcode with no emission rule.
    #[error("unsupported insn={0}")]
    UnsupportedInstruction(String),
    /// The bytecode stream failed to decode.
    #[error("bad bytecode: {0}")]
    BadBytecode(String),
    /// A referenced assembler label was never bound.
    #[error("unbound assembler label")]
    UnboundLabel,
    /// Mapping or protecting executable pages failed.
    #[error("executable mapping failed: {0}")]
    MapFailed(String),
}
