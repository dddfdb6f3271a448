//! MathVM runtime: value representation and the stack-machine interpreter.

pub mod interpreter;
pub mod value;

pub use interpreter::{StackMachine, VmError, DEFAULT_STACK_BYTES};
pub use value::Value;
