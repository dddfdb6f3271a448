//! Stack-machine interpreter.
//!
//! Executes bytecode over three preallocated arenas: a value stack of 64-bit
//! slots, a return-address stack, and a frame-start stack. Closure access
//! goes through a per-function "frame start of the last live call" table:
//! entering a function records its new frame base under its id, returning
//! restores the value saved at call time, and `LOADCTX`/`STORECTX` index an
//! enclosing function's live frame through that table.

use std::io::Write;

use thiserror::Error;

use crate::compiler::bytecode::{Bytecode, Code, Opcode};
use crate::parser::Type;
use crate::vm::value::Value;

/// Default arena budget: 512 MiB of 8-byte slots.
pub const DEFAULT_STACK_BYTES: usize = 512 * 1024 * 1024;

/// Sentinel for "no live frame" in the last-call table.
const NO_FRAME: usize = usize::MAX;

/// Fatal interpreter errors.
#[derive(Debug, Error)]
pub enum VmError {
    /// An opcode the interpreter does not implement.
    #[error("unsupported insn={0}")]
    UnsupportedInstruction(String),
    /// The preallocated value or return stack is exhausted.
    #[error("stack overflow")]
    StackOverflow,
    /// A closure access named a function with no live frame.
    #[error("no live frame for closure access into function {0}")]
    DeadClosureFrame(u16),
    /// Integer division or modulo by zero.
    #[error("integer division by zero")]
    DivisionByZero,
    /// The output stream failed.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Saved caller state for one active call.
#[derive(Debug, Clone, Copy)]
struct ReturnAddress {
    function: u16,
    location: u32,
    /// The callee's previous last-call frame start, restored on return.
    previous_frame_of_callee: usize,
}

/// The interpreter. One instance executes one program run.
pub struct StackMachine<'a> {
    out: &'a mut dyn Write,
    max_slots: usize,
}

impl<'a> StackMachine<'a> {
    /// Machine with the default 512 MiB arena budget.
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self::with_stack_bytes(out, DEFAULT_STACK_BYTES)
    }

    /// Machine with an explicit arena budget in bytes.
    pub fn with_stack_bytes(out: &'a mut dyn Write, bytes: usize) -> Self {
        Self {
            out,
            max_slots: bytes / std::mem::size_of::<Value>(),
        }
    }

    /// Run the program from function id 0 (the top level).
    pub fn execute(&mut self, code: &Code) -> Result<(), VmError> {
        let mut machine = Machine {
            code,
            out: self.out,
            stack: vec![Value::ZERO; self.max_slots],
            top: 0,
            frame_starts: Vec::new(),
            returns: Vec::new(),
            last_frame: vec![NO_FRAME; code.functions_count()],
            current: 0,
            location: 0,
            frame_start: 0,
        };
        machine.enter_function(0)?;
        machine.run()
    }
}

struct Machine<'a, 'o> {
    code: &'a Code,
    out: &'o mut dyn Write,
    stack: Vec<Value>,
    top: usize,
    frame_starts: Vec<usize>,
    returns: Vec<ReturnAddress>,
    /// Frame start of the last live call, per function id.
    last_frame: Vec<usize>,
    current: u16,
    location: u32,
    frame_start: usize,
}

/// libc-style comparator result.
fn cmp_int(a: i64, b: i64) -> i64 {
    if a == b {
        0
    } else if a > b {
        1
    } else {
        -1
    }
}

fn cmp_double(a: f64, b: f64) -> i64 {
    if a == b {
        0
    } else if a > b {
        1
    } else {
        -1
    }
}

impl Machine<'_, '_> {
    fn bytecode(&self) -> &Bytecode {
        &self.code.function_by_id(self.current).bytecode
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.top == self.stack.len() {
            return Err(VmError::StackOverflow);
        }
        self.stack[self.top] = value;
        self.top += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.top -= 1;
        self.stack[self.top]
    }

    fn read_u16(&mut self) -> u16 {
        let value = self.bytecode().get_u16(self.location);
        self.location += 2;
        value
    }

    /// Branch target relative to the offset slot itself.
    fn read_branch_target(&mut self) -> u32 {
        let offset = self.bytecode().get_i16(self.location);
        let target = (self.location as i64 + offset as i64) as u32;
        self.location += 2;
        target
    }

    fn enter_function(&mut self, id: u16) -> Result<(), VmError> {
        let callee = self.code.function_by_id(id);
        let params = callee.parameters_number() as usize;
        let locals = callee.locals_number() as usize;

        let frame_start = self.top - params;
        if self.top + locals > self.stack.len() || self.returns.len() >= self.stack.len() {
            return Err(VmError::StackOverflow);
        }

        self.frame_start = frame_start;
        self.frame_starts.push(frame_start);
        self.top += locals;
        self.last_frame[id as usize] = frame_start;

        self.current = id;
        self.location = 0;
        Ok(())
    }

    fn process_call(&mut self, id: u16) -> Result<(), VmError> {
        self.returns.push(ReturnAddress {
            function: self.current,
            location: self.location,
            previous_frame_of_callee: self.last_frame[id as usize],
        });
        self.enter_function(id)
    }

    /// Returns `true` when the top level itself returned.
    fn process_return(&mut self) -> bool {
        let Some(ra) = self.returns.pop() else {
            return true;
        };

        let mut new_top = self.frame_starts.pop().expect("frame for active call");
        self.frame_start = *self.frame_starts.last().expect("caller frame");

        if self.code.function_by_id(self.current).return_type() != Type::Void {
            self.top -= 1;
            self.stack[new_top] = self.stack[self.top];
            new_top += 1;
        }
        self.top = new_top;

        self.last_frame[self.current as usize] = ra.previous_frame_of_callee;
        self.current = ra.function;
        self.location = ra.location;
        false
    }

    fn process_native_call(&mut self, id: u16) -> Result<(), VmError> {
        let native = self.code.native_by_id(id);
        let signature = native.signature();
        let params = signature.params.len();

        // The proxy indexes arguments from 1, so it gets a pointer one slot
        // below the argument region; that anchor slot is never read.
        let args_start = self.top - params;
        let args_ptr = self.stack[args_start..].as_ptr().wrapping_sub(1);

        let result = unsafe {
            match signature.ret {
                Type::Double => {
                    let f: extern "C" fn(*const Value) -> f64 =
                        std::mem::transmute(native.proxy());
                    Value::double(f(args_ptr))
                }
                _ => {
                    let f: extern "C" fn(*const Value) -> i64 =
                        std::mem::transmute(native.proxy());
                    Value::int(f(args_ptr))
                }
            }
        };

        self.top -= params;
        if signature.ret != Type::Void {
            self.push(result)?;
        }
        Ok(())
    }

    fn load_local(&mut self, slot: u16) -> Result<(), VmError> {
        let value = self.stack[self.frame_start + slot as usize];
        self.push(value)
    }

    fn store_local(&mut self, slot: u16) {
        let value = self.pop();
        self.stack[self.frame_start + slot as usize] = value;
    }

    fn ctx_slot(&mut self) -> Result<usize, VmError> {
        let function = self.read_u16();
        let slot = self.read_u16();
        let base = self.last_frame[function as usize];
        if base == NO_FRAME {
            return Err(VmError::DeadClosureFrame(function));
        }
        Ok(base + slot as usize)
    }

    fn satisfied(condition: Opcode, value: i64) -> bool {
        match condition {
            Opcode::IfIcmpE => value == 0,
            Opcode::IfIcmpNe => value != 0,
            Opcode::IfIcmpL => value < 0,
            Opcode::IfIcmpLe => value <= 0,
            Opcode::IfIcmpG => value > 0,
            Opcode::IfIcmpGe => value >= 0,
            _ => unreachable!("non-conditional opcode"),
        }
    }

    fn run(&mut self) -> Result<(), VmError> {
        loop {
            let byte = self.bytecode().get(self.location);
            self.location += 1;
            let insn = Opcode::from_u8(byte)
                .ok_or_else(|| VmError::UnsupportedInstruction(format!("{:#04x}", byte)))?;

            match insn {
                Opcode::Dload => {
                    let value = self.bytecode().get_f64(self.location);
                    self.location += 8;
                    self.push(Value::double(value))?;
                }
                Opcode::Dload0 => self.push(Value::double(0.0))?,
                Opcode::Dload1 => self.push(Value::double(1.0))?,
                Opcode::DloadM1 => self.push(Value::double(-1.0))?,
                Opcode::Iload => {
                    let value = self.bytecode().get_i64(self.location);
                    self.location += 8;
                    self.push(Value::int(value))?;
                }
                Opcode::Iload0 => self.push(Value::int(0))?,
                Opcode::Iload1 => self.push(Value::int(1))?,
                Opcode::IloadM1 => self.push(Value::int(-1))?,
                Opcode::Sload => {
                    let id = self.read_u16();
                    self.push(Value::string(self.code.constant_ptr(id)))?;
                }
                Opcode::Sload0 => self.push(Value::string(self.code.constant_ptr(0)))?,

                Opcode::Dadd => self.double_binary(|a, b| a + b)?,
                Opcode::Dsub => self.double_binary(|a, b| a - b)?,
                Opcode::Dmul => self.double_binary(|a, b| a * b)?,
                Opcode::Ddiv => self.double_binary(|a, b| a / b)?,
                Opcode::Iadd => self.int_binary(|a, b| a.wrapping_add(b))?,
                Opcode::Isub => self.int_binary(|a, b| a.wrapping_sub(b))?,
                Opcode::Imul => self.int_binary(|a, b| a.wrapping_mul(b))?,
                Opcode::Idiv => {
                    let a = self.pop().as_int();
                    let b = self.pop().as_int();
                    if b == 0 {
                        return Err(VmError::DivisionByZero);
                    }
                    self.push(Value::int(a.wrapping_div(b)))?;
                }
                Opcode::Imod => {
                    let a = self.pop().as_int();
                    let b = self.pop().as_int();
                    if b == 0 {
                        return Err(VmError::DivisionByZero);
                    }
                    self.push(Value::int(a.wrapping_rem(b)))?;
                }
                Opcode::Iaor => self.int_binary(|a, b| a | b)?,
                Opcode::Iaand => self.int_binary(|a, b| a & b)?,
                Opcode::Iaxor => self.int_binary(|a, b| a ^ b)?,

                Opcode::Dcmp => {
                    let a = self.pop().as_double();
                    let b = self.pop().as_double();
                    self.push(Value::int(cmp_double(a, b)))?;
                }
                Opcode::Icmp => {
                    let a = self.pop().as_int();
                    let b = self.pop().as_int();
                    self.push(Value::int(cmp_int(a, b)))?;
                }
                Opcode::Dneg => {
                    let v = self.pop().as_double();
                    self.push(Value::double(-v))?;
                }
                Opcode::Ineg => {
                    let v = self.pop().as_int();
                    self.push(Value::int(v.wrapping_neg()))?;
                }

                Opcode::Iprint => {
                    let v = self.pop().as_int();
                    write!(self.out, "{}", v)?;
                    self.out.flush()?;
                }
                Opcode::Dprint => {
                    let v = self.pop().as_double();
                    write!(self.out, "{}", v)?;
                    self.out.flush()?;
                }
                Opcode::Sprint => {
                    let ptr = self.pop().as_string();
                    if !ptr.is_null() {
                        let bytes = unsafe { std::ffi::CStr::from_ptr(ptr.cast()) }.to_bytes();
                        self.out.write_all(bytes)?;
                    }
                    self.out.flush()?;
                }

                Opcode::I2d => {
                    let v = self.pop().as_int();
                    self.push(Value::double(v as f64))?;
                }
                Opcode::D2i => {
                    let v = self.pop().as_double();
                    self.push(Value::int(v as i64))?;
                }
                Opcode::S2i => {
                    let v = self.pop();
                    self.push(Value::int(v.as_int()))?;
                }
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::LoadDvar0 | Opcode::LoadIvar0 | Opcode::LoadSvar0 => self.load_local(0)?,
                Opcode::LoadDvar1 | Opcode::LoadIvar1 | Opcode::LoadSvar1 => self.load_local(1)?,
                Opcode::LoadDvar2 | Opcode::LoadIvar2 | Opcode::LoadSvar2 => self.load_local(2)?,
                Opcode::LoadDvar3 | Opcode::LoadIvar3 | Opcode::LoadSvar3 => self.load_local(3)?,
                Opcode::LoadDvar | Opcode::LoadIvar | Opcode::LoadSvar => {
                    let slot = self.read_u16();
                    self.load_local(slot)?;
                }
                Opcode::StoreDvar0 | Opcode::StoreIvar0 | Opcode::StoreSvar0 => {
                    self.store_local(0)
                }
                Opcode::StoreDvar1 | Opcode::StoreIvar1 | Opcode::StoreSvar1 => {
                    self.store_local(1)
                }
                Opcode::StoreDvar2 | Opcode::StoreIvar2 | Opcode::StoreSvar2 => {
                    self.store_local(2)
                }
                Opcode::StoreDvar3 | Opcode::StoreIvar3 | Opcode::StoreSvar3 => {
                    self.store_local(3)
                }
                Opcode::StoreDvar | Opcode::StoreIvar | Opcode::StoreSvar => {
                    let slot = self.read_u16();
                    self.store_local(slot);
                }

                Opcode::LoadCtxDvar | Opcode::LoadCtxIvar | Opcode::LoadCtxSvar => {
                    let slot = self.ctx_slot()?;
                    let value = self.stack[slot];
                    self.push(value)?;
                }
                Opcode::StoreCtxDvar | Opcode::StoreCtxIvar | Opcode::StoreCtxSvar => {
                    let slot = self.ctx_slot()?;
                    let value = self.pop();
                    self.stack[slot] = value;
                }

                Opcode::Ja => {
                    self.location = self.read_branch_target();
                }
                Opcode::IfIcmpE
                | Opcode::IfIcmpNe
                | Opcode::IfIcmpL
                | Opcode::IfIcmpLe
                | Opcode::IfIcmpG
                | Opcode::IfIcmpGe => {
                    let target = self.read_branch_target();
                    let a = self.pop().as_int();
                    let b = self.pop().as_int();
                    if Self::satisfied(insn, cmp_int(a, b)) {
                        self.location = target;
                    }
                }

                Opcode::Call => {
                    let id = self.read_u16();
                    self.process_call(id)?;
                }
                Opcode::CallNative => {
                    let id = self.read_u16();
                    self.process_native_call(id)?;
                }
                Opcode::Return => {
                    if self.process_return() {
                        return Ok(());
                    }
                }

                _ => {
                    return Err(VmError::UnsupportedInstruction(insn.name().to_string()));
                }
            }
        }
    }

    fn int_binary(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<(), VmError> {
        let a = self.pop().as_int();
        let b = self.pop().as_int();
        self.push(Value::int(f(a, b)))
    }

    fn double_binary(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let a = self.pop().as_double();
        let b = self.pop().as_double();
        self.push(Value::double(f(a, b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn run(source: &str) -> String {
        let code = compile(source).unwrap();
        let mut out = Vec::new();
        StackMachine::new(&mut out).execute(&code).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("int x; x = 2 + 3 * 4; print(x);"), "14");
    }

    #[test]
    fn test_double_coercion() {
        assert_eq!(run("double a; a = 2; a = a + 0.5; print(a);"), "2.5");
    }

    #[test]
    fn test_print_variadic() {
        assert_eq!(run("print(1, ' ', 2.5, ' ', 'str');"), "1 2.5 str");
    }

    #[test]
    fn test_for_loop_inclusive() {
        assert_eq!(run("int i; for (i in 0..3) { print(i, ' '); }"), "0 1 2 3 ");
    }

    #[test]
    fn test_while_loop() {
        assert_eq!(
            run("int i; i = 0; int s; s = 0; while (i < 5) { s += i; i += 1; } print(s);"),
            "10"
        );
    }

    #[test]
    fn test_if_else() {
        assert_eq!(
            run("int x; x = 3; if (x > 2) { print('big'); } else { print('small'); }"),
            "big"
        );
    }

    #[test]
    fn test_recursive_factorial() {
        assert_eq!(
            run("function int fact(int n) { if (n < 2) { return 1; } return n * fact(n - 1); } \
                 print(fact(6));"),
            "720"
        );
    }

    #[test]
    fn test_inlined_call() {
        assert_eq!(
            run("function int twice(int n) { return n * 2; } print(twice(21));"),
            "42"
        );
    }

    #[test]
    fn test_closure_read() {
        assert_eq!(
            run("function int outer() { \
                   int x; x = 41; \
                   function int inner() { return x + 1; } \
                   return inner(); \
                 } \
                 print(outer());"),
            "42"
        );
    }

    #[test]
    fn test_closure_write() {
        assert_eq!(
            run("function int counter() { \
                   int n; n = 0; \
                   function void inc() { n += 1; return; } \
                   inc(); inc(); inc(); \
                   return n; \
                 } \
                 print(counter());"),
            "3"
        );
    }

    #[test]
    fn test_logical_short_circuit() {
        // The right operand would divide by zero; && must not evaluate it.
        assert_eq!(run("int x; x = 0; print(x != 0 && 1 / x > 0);"), "0");
        assert_eq!(run("print(1 || 0);"), "1");
    }

    #[test]
    fn test_not_operator() {
        assert_eq!(run("print(!0, ' ', !5);"), "1 0");
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            run("print(1 < 2, ' ', 2 <= 2, ' ', 3 > 4, ' ', 1 == 1, ' ', 1 != 1);"),
            "1 1 0 1 0"
        );
        assert_eq!(run("print(1.5 < 2.5, ' ', 2.5 > 2.5);"), "1 0");
    }

    #[test]
    fn test_string_s2i_identity() {
        // S2I reinterprets the interned pointer; round-tripping it through an
        // int variable must preserve the pointer.
        assert_eq!(run("string s; s = 'ok'; int p; p = s; print(p != 0);"), "1");
    }

    #[test]
    fn test_division_by_zero() {
        let code = compile("int z; z = 0; print(1 / z);").unwrap();
        let mut out = Vec::new();
        let result = StackMachine::new(&mut out).execute(&code);
        assert!(matches!(result, Err(VmError::DivisionByZero)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_deep_recursion_overflows() {
        let code =
            compile("function int f(int n) { return f(n + 1); } print(f(0));").unwrap();
        let mut out = Vec::new();
        let result = StackMachine::with_stack_bytes(&mut out, 64 * 1024).execute(&code);
        assert!(matches!(result, Err(VmError::StackOverflow)));
    }

    #[test]
    fn test_mutual_recursion() {
        assert_eq!(
            run("function int is_even(int n) { if (n == 0) { return 1; } return is_odd(n - 1); } \
                 function int is_odd(int n) { if (n == 0) { return 0; } return is_even(n - 1); } \
                 print(is_even(10), ' ', is_odd(10));"),
            "1 0"
        );
    }

    #[test]
    fn test_modulo_and_bitwise() {
        assert_eq!(run("print(17 % 5, ' ', 12 | 3, ' ', 12 & 10, ' ', 12 ^ 10);"), "2 15 8 6");
    }

    #[test]
    fn test_nested_scopes_slots() {
        assert_eq!(
            run("int a; a = 1; { int b; b = 2; { int c; c = 3; print(a + b + c); } }"),
            "6"
        );
    }
}
