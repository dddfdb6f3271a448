//! MathVM compiler: function analysis, type annotation, and bytecode
//! translation.
//!
//! The pipeline is `AST → analysis → type annotation → lowering → Code`.
//! [`compile`] runs the whole thing from source text.

pub mod analysis;
pub mod bytecode;
pub mod lower;
pub mod typecheck;

use thiserror::Error;

pub use analysis::{FunctionAnalysis, FunctionInfo};
pub use bytecode::{
    disassemble, disassemble_function, Bytecode, BytecodeFunction, Code, Label, NativeFunction,
    Opcode,
};
pub use typecheck::{TypeErrors, TypeMap};

use crate::parser::{ParseError, Parser};
use crate::parser::lexer::LexError;

/// Fatal errors during bytecode translation proper.
///
/// These indicate a broken internal invariant or an unsatisfiable program
/// rather than a user-level type mistake.
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    /// A branch needed an offset outside the signed 16-bit range.
    #[error("branch offset {offset} exceeds the signed 16-bit range")]
    BranchOffsetOverflow {
        /// The offset that did not fit.
        offset: i64,
    },
    /// A symbol survived analysis without a definition.
    #[error("undefined symbol '{0}'")]
    UndefinedSymbol(String),
    /// A `native` declaration named a symbol the dynamic linker cannot find.
    #[error("native '{0}' not found")]
    NativeNotFound(String),
    /// Native declarations need the JIT-built call proxies.
    #[error("native functions require the jit feature")]
    NativesUnsupported,
    /// More locals than slot ids.
    #[error("too many locals in function '{0}'")]
    TooManyLocals(String),
    /// Building the packed-argument trampoline for a native failed.
    #[error("failed to build native proxy: {0}")]
    NativeProxy(String),
    /// A pipeline invariant did not hold.
    #[error("internal translation error: {0}")]
    Internal(&'static str),
}

/// Any error the source-to-bytecode pipeline can produce.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// Scanner error.
    #[error("{0}")]
    Lex(#[from] LexError),
    /// Parser error.
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// Accumulated type errors, reported as one comma-joined list.
    #[error("{0}")]
    Type(#[from] TypeErrors),
    /// Fatal translation error.
    #[error("{0}")]
    Translate(#[from] TranslateError),
}

impl CompileError {
    /// Byte position of the error, when one is known.
    pub fn pos(&self) -> Option<u32> {
        match self {
            CompileError::Lex(e) => Some(e.pos()),
            CompileError::Parse(e) => Some(e.pos),
            CompileError::Type(e) => e.first_pos(),
            CompileError::Translate(_) => None,
        }
    }
}

/// Compile source text all the way to a [`Code`] registry.
pub fn compile(source: &str) -> Result<Code, CompileError> {
    let ast = Parser::new(source)?.parse()?;
    let types = typecheck::annotate(&ast)?;
    let mut code = Code::new();
    let analysis = analysis::analyze(&ast, &mut code)?;
    lower::translate(&ast, &types, &analysis, &mut code)?;
    Ok(code)
}
