//! MathVM Language Engine
//!
//! This crate provides the complete MathVM language implementation:
//! - **Parser**: Lexer, parser, and AST printer (`parser` module)
//! - **Compiler**: Function analysis, type annotation, and bytecode
//!   translation (`compiler` module)
//! - **VM**: Stack-machine interpreter (`vm` module)
//! - **JIT**: x86-64 System V code generator (`jit` module, `jit` feature)
//!
//! # Example
//!
//! ```rust,ignore
//! use mathvm_engine::compile;
//! use mathvm_engine::vm::StackMachine;
//!
//! let code = compile("int x; x = 2 + 3 * 4; print(x);")?;
//! let mut out = Vec::new();
//! StackMachine::new(&mut out).execute(&code)?;
//! assert_eq!(out, b"14");
//! ```

#![warn(rust_2018_idioms)]

/// Parser module: lexer, AST, recursive-descent parser, and source printer
pub mod parser;

/// Compiler module: bytecode, function analysis, type annotation, translation
pub mod compiler;

/// VM module: value representation and the stack-machine interpreter
pub mod vm;

/// JIT compilation module (x86-64 System V, behind the "jit" feature)
#[cfg(feature = "jit")]
pub mod jit;

pub use parser::{Ast, LexError, ParseError, Parser, Type};

pub use compiler::{
    compile, Bytecode, BytecodeFunction, Code, CompileError, Label, Opcode, TranslateError,
};

pub use vm::{StackMachine, Value, VmError};
