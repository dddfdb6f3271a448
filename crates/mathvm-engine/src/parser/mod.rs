//! MathVM front end: lexer, AST, recursive-descent parser, and source printer.
//!
//! The source language is a small statically-typed imperative language with
//! `int`, `double` and `string` scalars, nested named functions, and `native`
//! function declarations. The parser resolves variable references against
//! lexical scopes while parsing, so the AST it produces carries stable
//! variable and function indices rather than names.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod token;

pub use ast::{
    Ast, AstFunction, AstVar, BinOp, Block, FuncId, Node, NodeId, ScopeId, Signature, StoreOp,
    Type, UnaryOp, VarId,
};
pub use lexer::{tokenize, LexError};
pub use parser::{Parser, ParseError};
pub use printer::print_ast;
pub use token::Token;
