//! x86-64 code generation over annotated bytecode.
//!
//! The top of the abstract value stack is pinned into registers: integer
//! slots take `rdi rsi r10 rcx r8 r9 rbx` in that priority, double slots
//! take `xmm0..xmm13`; deeper slots live in the frame at `[rsp + slot*8]`.
//! Scratch registers are `rax`, `r11`, `r13`, `xmm14`, `xmm15`. A function's
//! frame is `(max_stack + locals + 2) * 8` bytes; the two extra slots hold
//! the caller's `rbx` and, when the function's frame is reachable through
//! closures, the previous value of its runtime-table slot.
//!
//! Three peephole idioms replace the translator's branchy sequences: the
//! comparator-to-branch fusion, the comparator-to-bool `SETcc` form, and the
//! arithmetic NOT pattern.

use crate::compiler::bytecode::{BytecodeFunction, Code, Opcode};
use crate::jit::analysis::{analyze_closure_usage, annotate, AnnotatedBytecode, InstrArg};
use crate::jit::asm::{Assembler, Cond, GpBin, Label, Operand, Reg, SseBin, Xmm};
use crate::jit::memory::ExecutableMemory;
use crate::jit::runtime::{self, RuntimeEnvironment};
use crate::jit::JitError;
use crate::parser::ast::Signature;
use crate::parser::Type;

/// Pinned top-of-stack registers for integer-typed slots, in priority order.
const GP_STACK_REGS: [Reg; 7] = [
    Reg::Rdi,
    Reg::Rsi,
    Reg::R10,
    Reg::Rcx,
    Reg::R8,
    Reg::R9,
    Reg::Rbx,
];

/// Pinned top-of-stack registers for double-typed slots.
const XMM_STACK_REGS: [Xmm; 14] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
    Xmm::Xmm8,
    Xmm::Xmm9,
    Xmm::Xmm10,
    Xmm::Xmm11,
    Xmm::Xmm12,
    Xmm::Xmm13,
];

/// System V integer argument registers.
const GP_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// System V floating-point argument registers.
const XMM_ARG_REGS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// Sign bit mask for `DNEG` via `xorpd`.
const SIGN_MASK: u64 = 0x8000_0000_0000_0000;

/// A finished JIT compilation: the code pages plus the runtime state the
/// code points into.
#[derive(Debug)]
pub struct JitProgram {
    memory: ExecutableMemory,
    environment: RuntimeEnvironment,
    entry_offset: usize,
}

impl JitProgram {
    /// Entry point: a thunk that saves the host's `r13` (generated code uses
    /// it as closure-frame scratch without preserving it) and tail-calls the
    /// top-level function.
    pub fn entry(&self) -> *const u8 {
        unsafe { self.memory.as_ptr().add(self.entry_offset) }
    }

    /// The frame table generated code works against.
    pub fn environment(&self) -> &RuntimeEnvironment {
        &self.environment
    }

    /// Run the program's top level to completion.
    ///
    /// Correctness of the generated code rests on the translator's stack
    /// invariants; a program that divides by zero traps the process.
    pub fn run(&self) {
        let f: extern "C" fn() = unsafe { std::mem::transmute(self.entry()) };
        f();
    }
}

/// Where a call lands: another generated function, or a fixed address.
#[derive(Clone, Copy)]
enum CallTarget {
    Label(Label),
    Addr(*const u8),
}

/// Either a plain ALU op or `imul`, which needs a register destination.
#[derive(Clone, Copy, PartialEq, Eq)]
enum GpArith {
    Alu(GpBin),
    Imul,
}

/// Compile every function in `code` into one executable mapping.
///
/// Function 0 (the top level) is emitted first, so the mapping's base is the
/// program entry.
pub fn build_program(code: &Code) -> Result<JitProgram, JitError> {
    let environment = RuntimeEnvironment::new(code.functions_count());
    let mut asm = Assembler::new();

    let function_labels: Vec<Label> = code.functions().map(|_| asm.new_label()).collect();

    let mut annotated: Vec<AnnotatedBytecode> = Vec::with_capacity(code.functions_count());
    for function in code.functions() {
        annotated.push(annotate(function, code)?);
    }
    analyze_closure_usage(&mut annotated);

    for function in code.functions() {
        let id = function.id();
        asm.bind(function_labels[id as usize]);
        FunctionEmitter {
            asm: &mut asm,
            code,
            environment: &environment,
            function_labels: &function_labels,
            ab: &annotated[id as usize],
            function,
            insn_labels: Vec::new(),
            index: 0,
            frame_size: 0,
            is_rsp_odd: false,
        }
        .emit()?;
    }

    let entry_offset = asm.offset();
    asm.push(Reg::R13);
    asm.call(function_labels[0]);
    asm.pop(Reg::R13);
    asm.ret();

    let memory = ExecutableMemory::new(&asm.finalize()?)?;
    Ok(JitProgram {
        memory,
        environment,
        entry_offset,
    })
}

/// Build the packed-argument trampoline for a native function.
///
/// The proxy takes a single pointer to consecutive 8-byte argument slots
/// (the natural layout of the interpreter's value stack), unpacks them into
/// System V registers, and tail-adjusts into the real native address. Both
/// engines call natives through these semantics: the interpreter via the
/// proxy, the JIT by marshalling from its own frame.
pub fn build_native_proxy(
    signature: &Signature,
    address: *const u8,
) -> Result<(*const u8, ExecutableMemory), JitError> {
    let mut asm = Assembler::new();
    // The packed-argument pointer arrives in rdi and must survive marshalling.
    asm.gp_op(GpBin::Mov, Operand::Gp(Reg::R11), Operand::Gp(Reg::Rdi));
    let params: Vec<Type> = signature.params.iter().map(|p| p.ty).collect();
    emit_sysv_call(
        &mut asm,
        &params,
        CallTarget::Addr(address),
        Reg::R11,
        0,
        false,
    );
    asm.ret();

    let memory = ExecutableMemory::new(&asm.finalize()?)?;
    Ok((memory.as_ptr(), memory))
}

/// Marshal arguments from `[start + (offset + 1 + i) * 8]` into System V
/// registers (overflow onto the native stack, 16-byte aligned) and call.
fn emit_sysv_call(
    asm: &mut Assembler,
    params: &[Type],
    target: CallTarget,
    start: Reg,
    offset: i32,
    is_rsp_odd: bool,
) {
    let mut gp_args: Vec<i32> = Vec::new();
    let mut double_args: Vec<i32> = Vec::new();
    let mut stack_args: Vec<i32> = Vec::new();

    for (i, ty) in params.iter().enumerate() {
        let slot = offset + 1 + i as i32;
        match ty {
            Type::Double => {
                if double_args.len() < XMM_ARG_REGS.len() {
                    double_args.push(slot);
                } else {
                    stack_args.push(slot);
                }
            }
            _ => {
                if gp_args.len() < GP_ARG_REGS.len() {
                    gp_args.push(slot);
                } else {
                    stack_args.push(slot);
                }
            }
        }
    }

    // Keep rsp 16-byte aligned at the call instruction.
    let pad = 1 - ((stack_args.len() + is_rsp_odd as usize) & 1);
    let stack_delta = ((stack_args.len() + pad) * 8) as i32;

    for (i, &slot) in gp_args.iter().enumerate() {
        asm.gp_op(
            GpBin::Mov,
            Operand::Gp(GP_ARG_REGS[i]),
            Operand::Mem(start, slot * 8),
        );
    }
    for (i, &slot) in double_args.iter().enumerate() {
        asm.sse_op(SseBin::Movsd, XMM_ARG_REGS[i], Operand::Mem(start, slot * 8));
    }
    for (i, &slot) in stack_args.iter().enumerate() {
        asm.gp_op(
            GpBin::Mov,
            Operand::Gp(Reg::Rax),
            Operand::Mem(start, slot * 8),
        );
        asm.gp_op(
            GpBin::Mov,
            Operand::Mem(Reg::Rsp, i as i32 * 8 - stack_delta),
            Operand::Gp(Reg::Rax),
        );
    }

    asm.gp_op_imm32(GpBin::Sub, Operand::Gp(Reg::Rsp), stack_delta);
    emit_call_target(asm, target);
    asm.gp_op_imm32(GpBin::Add, Operand::Gp(Reg::Rsp), stack_delta);
}

fn emit_call_target(asm: &mut Assembler, target: CallTarget) {
    match target {
        CallTarget::Label(label) => asm.call(label),
        CallTarget::Addr(address) => {
            asm.mov_ri(Reg::Rax, address as i64);
            asm.call_reg(Reg::Rax);
        }
    }
}

fn is_commutative(insn: Opcode) -> bool {
    matches!(
        insn,
        Opcode::Iadd | Opcode::Dmul | Opcode::Dadd | Opcode::Imul | Opcode::Iaor
            | Opcode::Iaand
            | Opcode::Iaxor
    )
}

/// Condition code for a conditional jump opcode; doubles compare through
/// `ucomisd`, whose flags want the unsigned codes.
fn jump_cond(insn: Opcode, is_xmm: bool) -> Result<Cond, JitError> {
    Ok(match insn {
        Opcode::IfIcmpE => Cond::E,
        Opcode::IfIcmpNe => Cond::Ne,
        Opcode::IfIcmpL => {
            if is_xmm {
                Cond::B
            } else {
                Cond::L
            }
        }
        Opcode::IfIcmpLe => {
            if is_xmm {
                Cond::Be
            } else {
                Cond::Le
            }
        }
        Opcode::IfIcmpG => {
            if is_xmm {
                Cond::A
            } else {
                Cond::G
            }
        }
        Opcode::IfIcmpGe => {
            if is_xmm {
                Cond::Ae
            } else {
                Cond::Ge
            }
        }
        _ => return Err(JitError::UnsupportedInstruction(insn.name().to_string())),
    })
}

struct FunctionEmitter<'a> {
    asm: &'a mut Assembler,
    code: &'a Code,
    environment: &'a RuntimeEnvironment,
    function_labels: &'a [Label],
    ab: &'a AnnotatedBytecode,
    function: &'a BytecodeFunction,
    insn_labels: Vec<Label>,
    index: usize,
    frame_size: i32,
    is_rsp_odd: bool,
}

impl FunctionEmitter<'_> {
    fn emit(mut self) -> Result<(), JitError> {
        self.insn_labels = (0..self.ab.len()).map(|_| self.asm.new_label()).collect();

        self.frame_size =
            (self.ab.max_stack() as i32 + self.ab.locals_number() as i32 + 2) * 8;
        self.is_rsp_odd = self.frame_size % 16 != 0;

        self.emit_prologue();

        while self.index < self.ab.len() {
            // Dead code has no stack shape; nothing branches into it either.
            if !self.ab.reachable(self.index) {
                self.index += 1;
                continue;
            }
            if self.ab.used_as_label(self.index) {
                self.asm.bind(self.insn_labels[self.index]);
            }
            self.emit_insn()?;
            self.index += 1;
        }
        Ok(())
    }

    fn emit_prologue(&mut self) {
        // Caller's rbx goes below the red-line before the frame is claimed.
        self.asm.gp_op(
            GpBin::Mov,
            Operand::Mem(Reg::Rsp, -8),
            Operand::Gp(Reg::Rbx),
        );

        if self.ab.uses_closure() {
            let slot = self.environment.bsp_slot_ptr(self.function.id());
            self.asm.mov_ri(Reg::Rax, slot as i64);
            self.asm.gp_op(
                GpBin::Mov,
                Operand::Gp(Reg::R11),
                Operand::Mem(Reg::Rax, 0),
            );
            self.asm.gp_op(
                GpBin::Mov,
                Operand::Mem(Reg::Rsp, -16),
                Operand::Gp(Reg::R11),
            );
        }

        self.asm
            .gp_op_imm32(GpBin::Sub, Operand::Gp(Reg::Rsp), self.frame_size);

        if self.ab.uses_closure() {
            // Publish this frame's local-area base into the runtime table;
            // rax still holds the slot address.
            self.asm
                .gp_op(GpBin::Mov, Operand::Gp(Reg::R11), Operand::Gp(Reg::Rsp));
            self.asm.gp_op_imm32(
                GpBin::Add,
                Operand::Gp(Reg::R11),
                self.ab.max_stack() as i32 * 8,
            );
            self.asm.gp_op(
                GpBin::Mov,
                Operand::Mem(Reg::Rax, 0),
                Operand::Gp(Reg::R11),
            );
        }

        self.spill_arguments();
    }

    /// Spill incoming System V arguments into their local slots.
    fn spill_arguments(&mut self) {
        let params: Vec<Type> = self
            .function
            .signature()
            .params
            .iter()
            .map(|p| p.ty)
            .collect();
        let mut gp = 0usize;
        let mut xmm = 0usize;
        let mut stack = 0i32;

        for (i, ty) in params.iter().enumerate() {
            let local = self.var_location(i as u16);
            match ty {
                Type::Double if xmm < XMM_ARG_REGS.len() => {
                    self.asm.movsd_store(local, XMM_ARG_REGS[xmm]);
                    xmm += 1;
                }
                Type::Double => {
                    self.load_stack_argument(local, stack);
                    stack += 1;
                }
                _ if gp < GP_ARG_REGS.len() => {
                    self.asm
                        .gp_op(GpBin::Mov, local, Operand::Gp(GP_ARG_REGS[gp]));
                    gp += 1;
                }
                _ => {
                    self.load_stack_argument(local, stack);
                    stack += 1;
                }
            }
        }
    }

    /// Stack-passed arguments sit above the return address of this frame.
    fn load_stack_argument(&mut self, local: Operand, index: i32) {
        self.asm.gp_op(
            GpBin::Mov,
            Operand::Gp(Reg::Rax),
            Operand::Mem(Reg::Rsp, self.frame_size + 8 + index * 8),
        );
        self.asm.gp_op(GpBin::Mov, local, Operand::Gp(Reg::Rax));
    }

    // ===== Operand locations =====

    fn mem_slot(&self, slot: u16) -> Operand {
        Operand::Mem(Reg::Rsp, slot as i32 * 8)
    }

    fn var_location(&self, index: u16) -> Operand {
        Operand::Mem(Reg::Rsp, (self.ab.max_stack() + index) as i32 * 8)
    }

    /// Resolve a context variable's home through the owner's runtime slot.
    fn ctx_var_location(&mut self, ctx: u16, slot: u16) -> Operand {
        let table = self.environment.bsp_slot_ptr(ctx);
        self.asm.mov_ri(Reg::R11, table as i64);
        self.asm.gp_op(
            GpBin::Mov,
            Operand::Gp(Reg::R13),
            Operand::Mem(Reg::R11, 0),
        );
        Operand::Mem(Reg::R13, slot as i32 * 8)
    }

    fn stack_slot_location(&self, insn: usize, slot: u16) -> Operand {
        match self.ab.stack_type_at(insn, slot) {
            Type::Double => {
                let x = self.ab.xmm_slots_before(insn, slot) as usize;
                if x < XMM_STACK_REGS.len() {
                    Operand::Xmm(XMM_STACK_REGS[x])
                } else {
                    self.mem_slot(slot)
                }
            }
            _ => {
                let g = self.ab.gp_slots_before(insn, slot) as usize;
                if g < GP_STACK_REGS.len() {
                    Operand::Gp(GP_STACK_REGS[g])
                } else {
                    self.mem_slot(slot)
                }
            }
        }
    }

    /// Slot location counted from the top of the abstract stack.
    ///
    /// Offset 0 names the slot this instruction is about to push, so it (and
    /// any explicit `next`) resolves against the successor's shape.
    fn location_from_tos(&self, offset: u16, next: bool) -> Operand {
        let insn = self.index + (next || offset == 0) as usize;
        let slot = self.ab.stack_size_at(insn) - offset.max(1);
        self.stack_slot_location(insn, slot)
    }

    /// Memory home of a slot counted from the current top.
    fn mem_from_tos(&self, offset: u16) -> Operand {
        self.mem_slot(self.ab.stack_size_at(self.index) - offset)
    }

    // ===== Moves =====

    /// Move between any two slot locations; memory-to-memory goes through
    /// rax, SSE registers through `movsd`.
    fn mov_from_to(&mut self, src: Operand, dst: Operand) {
        let mut src = src;
        if !src.is_reg() && !dst.is_reg() {
            self.asm.gp_op(GpBin::Mov, Operand::Gp(Reg::Rax), src);
            src = Operand::Gp(Reg::Rax);
        }
        match (dst, src) {
            (Operand::Xmm(d), s) => self.asm.sse_op(SseBin::Movsd, d, s),
            (d, Operand::Xmm(s)) => self.asm.movsd_store(d, s),
            (d, s) => self.asm.gp_op(GpBin::Mov, d, s),
        }
    }

    fn mov_to_stack(&mut self, offset: u16, src: Operand, next: bool) {
        let dst = self.location_from_tos(offset, next);
        self.mov_from_to(src, dst);
    }

    fn mov_from_stack(&mut self, offset: u16, dst: Operand) {
        let src = self.location_from_tos(offset, false);
        self.mov_from_to(src, dst);
    }

    fn mov_imm_to_stack(&mut self, imm: i32) {
        let dst = self.location_from_tos(0, false);
        self.asm.mov_imm32(dst, imm);
    }

    // ===== Instruction dispatch =====

    fn emit_insn(&mut self) -> Result<(), JitError> {
        let instr = self.ab.insn_with_args(self.index);
        match instr.insn {
            Opcode::Dload => {
                let InstrArg::Double(value) = instr.arg else {
                    return Err(JitError::BadBytecode("DLOAD operand".to_string()));
                };
                self.emit_double_constant(value);
            }
            Opcode::Dload0 => self.emit_double_constant(0.0),
            Opcode::Dload1 => self.emit_double_constant(1.0),
            Opcode::DloadM1 => self.emit_double_constant(-1.0),
            Opcode::Iload => {
                let InstrArg::Int(value) = instr.arg else {
                    return Err(JitError::BadBytecode("ILOAD operand".to_string()));
                };
                self.asm.mov_ri(Reg::Rax, value);
                self.mov_to_stack(0, Operand::Gp(Reg::Rax), false);
            }
            Opcode::Iload0 => {
                if !self.try_emit_not_pattern() {
                    self.mov_imm_to_stack(0);
                }
            }
            Opcode::Iload1 => self.mov_imm_to_stack(1),
            Opcode::IloadM1 => self.mov_imm_to_stack(-1),
            Opcode::Sload => {
                let InstrArg::Index(id) = instr.arg else {
                    return Err(JitError::BadBytecode("SLOAD operand".to_string()));
                };
                self.asm.mov_ri(Reg::Rax, self.code.constant_ptr(id) as i64);
                self.mov_to_stack(0, Operand::Gp(Reg::Rax), false);
            }
            Opcode::Sload0 => {
                self.asm.mov_ri(Reg::Rax, self.code.constant_ptr(0) as i64);
                self.mov_to_stack(0, Operand::Gp(Reg::Rax), false);
            }

            Opcode::Dadd | Opcode::Dsub | Opcode::Dmul | Opcode::Ddiv => {
                self.emit_double_operation(instr.insn)?;
            }
            Opcode::Dcmp | Opcode::Icmp => self.generate_cmp_insn()?,
            Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Iaor
            | Opcode::Iaand
            | Opcode::Iaxor => self.emit_integer_operation(instr.insn)?,

            Opcode::Dneg => {
                let mut operand = self.location_from_tos(1, false);
                if !operand.is_reg() {
                    self.mov_from_to(operand, Operand::Xmm(Xmm::Xmm15));
                    operand = Operand::Xmm(Xmm::Xmm15);
                }
                let magic = self.asm.float_const(SIGN_MASK);
                self.asm
                    .sse_op(SseBin::Movsd, Xmm::Xmm14, Operand::Rip(magic));
                let Operand::Xmm(x) = operand else {
                    return Err(JitError::BadBytecode("DNEG on an int slot".to_string()));
                };
                self.asm.sse_op(SseBin::Xorpd, x, Operand::Xmm(Xmm::Xmm14));
                if x == Xmm::Xmm15 {
                    self.mov_to_stack(1, Operand::Xmm(Xmm::Xmm15), false);
                }
            }
            Opcode::Ineg => {
                self.mov_from_stack(1, Operand::Gp(Reg::Rax));
                self.asm.neg(Operand::Gp(Reg::Rax));
                self.mov_to_stack(1, Operand::Gp(Reg::Rax), false);
            }

            Opcode::Iprint => {
                self.emit_function_call(
                    Type::Void,
                    &[Type::Int],
                    CallTarget::Addr(runtime::print_int as *const u8),
                )?;
            }
            Opcode::Dprint => {
                self.emit_function_call(
                    Type::Void,
                    &[Type::Double],
                    CallTarget::Addr(runtime::print_double as *const u8),
                )?;
            }
            Opcode::Sprint => {
                self.emit_function_call(
                    Type::Void,
                    &[Type::Int],
                    CallTarget::Addr(runtime::print_str as *const u8),
                )?;
            }

            Opcode::I2d => {
                self.mov_from_stack(1, Operand::Gp(Reg::Rax));
                self.asm.cvtsi2sd(Xmm::Xmm15, Operand::Gp(Reg::Rax));
                self.mov_to_stack(1, Operand::Xmm(Xmm::Xmm15), true);
            }
            Opcode::D2i => {
                self.mov_from_stack(1, Operand::Xmm(Xmm::Xmm14));
                self.asm.cvttsd2si(Reg::Rax, Operand::Xmm(Xmm::Xmm14));
                self.mov_to_stack(1, Operand::Gp(Reg::Rax), true);
            }
            Opcode::S2i | Opcode::Pop => {}

            Opcode::LoadDvar0 | Opcode::LoadIvar0 | Opcode::LoadSvar0 => self.load_variable(0),
            Opcode::LoadDvar1 | Opcode::LoadIvar1 | Opcode::LoadSvar1 => self.load_variable(1),
            Opcode::LoadDvar2 | Opcode::LoadIvar2 | Opcode::LoadSvar2 => self.load_variable(2),
            Opcode::LoadDvar3 | Opcode::LoadIvar3 | Opcode::LoadSvar3 => self.load_variable(3),
            Opcode::LoadDvar | Opcode::LoadIvar | Opcode::LoadSvar => {
                let InstrArg::Index(slot) = instr.arg else {
                    return Err(JitError::BadBytecode("LOADVAR operand".to_string()));
                };
                self.load_variable(slot);
            }
            Opcode::StoreDvar0 | Opcode::StoreIvar0 | Opcode::StoreSvar0 => {
                self.store_variable(0)
            }
            Opcode::StoreDvar1 | Opcode::StoreIvar1 | Opcode::StoreSvar1 => {
                self.store_variable(1)
            }
            Opcode::StoreDvar2 | Opcode::StoreIvar2 | Opcode::StoreSvar2 => {
                self.store_variable(2)
            }
            Opcode::StoreDvar3 | Opcode::StoreIvar3 | Opcode::StoreSvar3 => {
                self.store_variable(3)
            }
            Opcode::StoreDvar | Opcode::StoreIvar | Opcode::StoreSvar => {
                let InstrArg::Index(slot) = instr.arg else {
                    return Err(JitError::BadBytecode("STOREVAR operand".to_string()));
                };
                self.store_variable(slot);
            }

            Opcode::LoadCtxDvar | Opcode::LoadCtxIvar | Opcode::LoadCtxSvar => {
                let InstrArg::CtxVar { ctx, slot } = instr.arg else {
                    return Err(JitError::BadBytecode("LOADCTX operand".to_string()));
                };
                let location = self.ctx_var_location(ctx, slot);
                let top = self.location_from_tos(0, false);
                self.mov_from_to(location, top);
            }
            Opcode::StoreCtxDvar | Opcode::StoreCtxIvar | Opcode::StoreCtxSvar => {
                let InstrArg::CtxVar { ctx, slot } = instr.arg else {
                    return Err(JitError::BadBytecode("STORECTX operand".to_string()));
                };
                let location = self.ctx_var_location(ctx, slot);
                let top = self.location_from_tos(1, false);
                self.mov_from_to(top, location);
            }

            Opcode::Ja => {
                let InstrArg::Target(target) = instr.arg else {
                    return Err(JitError::BadBytecode("JA target".to_string()));
                };
                if target != self.index + 1 {
                    self.asm.jmp(self.insn_labels[target]);
                }
            }
            Opcode::IfIcmpE
            | Opcode::IfIcmpNe
            | Opcode::IfIcmpL
            | Opcode::IfIcmpLe
            | Opcode::IfIcmpG
            | Opcode::IfIcmpGe => {
                self.emit_binary_operation_gp(GpArith::Alu(GpBin::Cmp), false);
                self.emit_conditional_jump(false)?;
            }

            Opcode::Call => {
                let InstrArg::Index(id) = instr.arg else {
                    return Err(JitError::BadBytecode("CALL operand".to_string()));
                };
                let signature = self.code.function_by_id(id).signature();
                let params: Vec<Type> = signature.params.iter().map(|p| p.ty).collect();
                let ret = signature.ret;
                self.emit_function_call(
                    ret,
                    &params,
                    CallTarget::Label(self.function_labels[id as usize]),
                )?;
            }
            Opcode::CallNative => {
                let InstrArg::Index(id) = instr.arg else {
                    return Err(JitError::BadBytecode("CALLNATIVE operand".to_string()));
                };
                let native = self.code.native_by_id(id);
                let params: Vec<Type> = native.signature().params.iter().map(|p| p.ty).collect();
                let ret = native.signature().ret;
                let source = native.source();
                self.emit_function_call(ret, &params, CallTarget::Addr(source))?;
            }

            Opcode::Return => {
                match self.function.return_type() {
                    Type::Double => self.mov_from_stack(1, Operand::Xmm(Xmm::Xmm0)),
                    Type::Int | Type::String => self.mov_from_stack(1, Operand::Gp(Reg::Rax)),
                    Type::Void => {}
                }

                self.asm
                    .gp_op_imm32(GpBin::Add, Operand::Gp(Reg::Rsp), self.frame_size);
                self.asm.gp_op(
                    GpBin::Mov,
                    Operand::Gp(Reg::Rbx),
                    Operand::Mem(Reg::Rsp, -8),
                );
                if self.ab.uses_closure() {
                    self.asm.gp_op(
                        GpBin::Mov,
                        Operand::Gp(Reg::R11),
                        Operand::Mem(Reg::Rsp, -16),
                    );
                    let slot = self.environment.bsp_slot_ptr(self.function.id());
                    self.asm.mov_ri(Reg::Rcx, slot as i64);
                    self.asm.gp_op(
                        GpBin::Mov,
                        Operand::Mem(Reg::Rcx, 0),
                        Operand::Gp(Reg::R11),
                    );
                }
                self.asm.ret();
            }

            _ => {
                return Err(JitError::UnsupportedInstruction(
                    instr.insn.name().to_string(),
                ))
            }
        }
        Ok(())
    }

    // ===== Constants and variables =====

    fn emit_double_constant(&mut self, value: f64) {
        let label = self.asm.float_const(value.to_bits());
        self.mov_to_stack(0, Operand::Rip(label), false);
    }

    fn load_variable(&mut self, slot: u16) {
        let location = self.var_location(slot);
        let top = self.location_from_tos(0, false);
        self.mov_from_to(location, top);
    }

    fn store_variable(&mut self, slot: u16) {
        let location = self.var_location(slot);
        let top = self.location_from_tos(1, false);
        self.mov_from_to(top, location);
    }

    // ===== Binary operations =====

    fn emit_double_operation(&mut self, insn: Opcode) -> Result<(), JitError> {
        let op = match insn {
            Opcode::Dadd => SseBin::Addsd,
            Opcode::Dsub => SseBin::Subsd,
            Opcode::Dmul => SseBin::Mulsd,
            Opcode::Ddiv => SseBin::Divsd,
            _ => return Err(JitError::UnsupportedInstruction(insn.name().to_string())),
        };
        self.emit_binary_operation_xmm(op);
        Ok(())
    }

    fn emit_integer_operation(&mut self, insn: Opcode) -> Result<(), JitError> {
        if insn == Opcode::Idiv || insn == Opcode::Imod {
            let first = self.location_from_tos(1, false);
            let second = self.location_from_tos(2, false);

            self.mov_from_to(first, Operand::Gp(Reg::Rax));
            self.asm.cqo();
            self.asm.idiv(second);

            let result = if insn == Opcode::Imod {
                Operand::Gp(Reg::Rdx)
            } else {
                Operand::Gp(Reg::Rax)
            };
            self.mov_from_to(result, second);
            return Ok(());
        }

        let op = match insn {
            Opcode::Iadd => GpArith::Alu(GpBin::Add),
            Opcode::Isub => GpArith::Alu(GpBin::Sub),
            Opcode::Imul => GpArith::Imul,
            Opcode::Iaor => GpArith::Alu(GpBin::Or),
            Opcode::Iaand => GpArith::Alu(GpBin::And),
            Opcode::Iaxor => GpArith::Alu(GpBin::Xor),
            _ => return Err(JitError::UnsupportedInstruction(insn.name().to_string())),
        };
        self.emit_binary_operation_gp(op, true);
        Ok(())
    }

    fn emit_gp(&mut self, op: GpArith, dst: Operand, src: Operand) {
        match op {
            GpArith::Alu(alu) => self.asm.gp_op(alu, dst, src),
            GpArith::Imul => {
                let Operand::Gp(d) = dst else {
                    unreachable!("imul destination must be a register");
                };
                self.asm.imul(d, src);
            }
        }
    }

    /// The two-operand scheme both classes share: upper operand first,
    /// result into the lower (deeper) operand's slot. A commutative op with
    /// the deeper operand in a register runs reversed to keep the register
    /// on the left.
    fn emit_binary_operation_gp(&mut self, op: GpArith, need_store: bool) {
        let commutative = is_commutative(self.ab.insn(self.index));
        let mut first = self.location_from_tos(1, false);
        let second = self.location_from_tos(2, false);

        if !first.is_reg() && !second.is_reg() {
            self.mov_from_to(first, Operand::Gp(Reg::Rax));
            first = Operand::Gp(Reg::Rax);
        }

        if commutative && second.is_reg() {
            self.emit_gp(op, second, first);
        } else {
            self.emit_gp(op, first, second);
            if need_store {
                self.mov_from_to(first, second);
            }
        }
    }

    fn emit_binary_operation_xmm(&mut self, op: SseBin) {
        let commutative = is_commutative(self.ab.insn(self.index));
        let mut first = self.location_from_tos(1, false);
        let second = self.location_from_tos(2, false);

        if commutative && second.is_reg() {
            let Operand::Xmm(d) = second else {
                unreachable!("double slot in a GP register");
            };
            self.asm.sse_op(op, d, first);
            return;
        }

        if !first.is_reg() {
            self.mov_from_to(first, Operand::Xmm(Xmm::Xmm15));
            first = Operand::Xmm(Xmm::Xmm15);
        }
        let Operand::Xmm(d) = first else {
            unreachable!("double slot in a GP register");
        };
        self.asm.sse_op(op, d, second);
        self.mov_from_to(first, second);
    }

    // ===== Comparisons =====

    /// `CMP`/`UCOMISD` over the two source slots, left operand first.
    fn emit_cmp_insn_by_opcode(&mut self, is_xmm: bool) {
        let mut first = self.location_from_tos(2, false);
        if !first.is_reg() {
            let tmp = if is_xmm {
                Operand::Xmm(Xmm::Xmm15)
            } else {
                Operand::Gp(Reg::Rax)
            };
            self.mov_from_stack(2, tmp);
            first = tmp;
        }
        let second = self.location_from_tos(1, false);
        if is_xmm {
            let Operand::Xmm(d) = first else {
                unreachable!("double slot in a GP register");
            };
            self.asm.sse_op(SseBin::Ucomisd, d, second);
        } else {
            self.asm.gp_op(GpBin::Cmp, first, second);
        }
    }

    /// `ICMP`/`DCMP`: fuse with a following `ILOAD0; IFICMP*` when present,
    /// otherwise fall back to the runtime comparator.
    fn generate_cmp_insn(&mut self) -> Result<(), JitError> {
        let fusable = self.index + 2 < self.ab.len()
            && self.ab.insn(self.index + 1) == Opcode::Iload0
            && self.ab.insn(self.index + 2).is_conditional_jump();

        if fusable {
            let is_xmm = self.ab.insn(self.index) == Opcode::Dcmp;
            self.emit_cmp_insn_by_opcode(is_xmm);
            self.index += 2;
            return self.emit_conditional_jump(is_xmm);
        }

        if self.ab.insn(self.index) == Opcode::Dcmp {
            self.emit_function_call(
                Type::Int,
                &[Type::Double, Type::Double],
                CallTarget::Addr(runtime::cmp_double as *const u8),
            )
        } else {
            self.emit_function_call(
                Type::Int,
                &[Type::Int, Type::Int],
                CallTarget::Addr(runtime::cmp_int as *const u8),
            )
        }
    }

    fn emit_conditional_jump(&mut self, is_xmm: bool) -> Result<(), JitError> {
        if self.try_emit_comparison_pattern(is_xmm)? {
            return Ok(());
        }
        let instr = self.ab.insn_with_args(self.index);
        let InstrArg::Target(target) = instr.arg else {
            return Err(JitError::BadBytecode("conditional without target".to_string()));
        };
        let cond = jump_cond(instr.insn, is_xmm)?;
        self.asm.jcc(cond, self.insn_labels[target]);
        Ok(())
    }

    /// `IFICMP*; ILOAD0; JA +1; ILOAD1` — the translator's boolean
    /// materialisation — becomes a branchless `SETcc; MOVZX`.
    fn try_emit_comparison_pattern(&mut self, is_xmm: bool) -> Result<bool, JitError> {
        let i = self.index;
        let matches_pattern = self.ab.len() > i + 3
            && self.ab.insn(i + 1) == Opcode::Iload0
            && self.ab.insn(i + 2) == Opcode::Ja
            && self.ab.insn_with_args(i + 2).arg == InstrArg::Target(i + 4)
            && self.ab.insn(i + 3) == Opcode::Iload1;
        if !matches_pattern {
            return Ok(false);
        }

        let cond = jump_cond(self.ab.insn(i), is_xmm)?;
        self.asm.setcc(cond);
        self.asm.movzx_rax_al();
        self.index += 3;
        self.mov_to_stack(0, Operand::Gp(Reg::Rax), false);
        Ok(true)
    }

    /// The translator's arithmetic NOT (`ILOAD0; ICMP; ILOAD -1; IAXOR;
    /// ILOAD1; IAAND`) becomes `CMP op, 0; SETE; MOVZX`.
    fn try_emit_not_pattern(&mut self) -> bool {
        let i = self.index;
        let matches_pattern = i + 5 < self.ab.len()
            && self.ab.insn(i + 1) == Opcode::Icmp
            && self.ab.insn(i + 2) == Opcode::Iload
            && self.ab.insn_with_args(i + 2).arg == InstrArg::Int(-1)
            && self.ab.insn(i + 3) == Opcode::Iaxor
            && self.ab.insn(i + 4) == Opcode::Iload1
            && self.ab.insn(i + 5) == Opcode::Iaand;
        if !matches_pattern {
            return false;
        }

        let operand = self.location_from_tos(1, false);
        self.asm.gp_op_imm32(GpBin::Cmp, operand, 0);
        self.asm.setcc(Cond::E);
        self.index += 5;
        self.asm.movzx_rax_al();
        self.mov_to_stack(0, Operand::Gp(Reg::Rax), false);
        true
    }

    // ===== Calls =====

    /// Whether the pinned registers already are the System V argument
    /// registers for this call: every current slot is an argument, and none
    /// overflowed its register class.
    fn registers_ready_for_call(&self, is_not_void: bool) -> bool {
        let tos = self.ab.stack_size_at(self.index);
        if tos == 0 {
            return true;
        }
        if self.index + 1 >= self.ab.len() {
            return false;
        }
        (self.ab.gp_slots_before(self.index, tos) as usize) < GP_ARG_REGS.len()
            && (self.ab.xmm_slots_before(self.index, tos) as usize) < XMM_ARG_REGS.len()
            && self.ab.stack_size_at(self.index + 1) == is_not_void as u16
    }

    fn emit_fast_call(&mut self, target: CallTarget) {
        if !self.is_rsp_odd {
            self.asm.gp_op_imm32(GpBin::Sub, Operand::Gp(Reg::Rsp), 8);
        }
        // The pinned stack order differs from the System V order only in the
        // third slot: r10 vs rdx.
        let tos = self.ab.stack_size_at(self.index);
        if self.ab.gp_slots_before(self.index, tos) > 2 {
            self.asm
                .gp_op(GpBin::Mov, Operand::Gp(Reg::Rdx), Operand::Gp(Reg::R10));
        }
        emit_call_target(self.asm, target);
        if !self.is_rsp_odd {
            self.asm.gp_op_imm32(GpBin::Add, Operand::Gp(Reg::Rsp), 8);
        }
    }

    fn emit_function_call(
        &mut self,
        ret: Type,
        params: &[Type],
        target: CallTarget,
    ) -> Result<(), JitError> {
        let offset = self.ab.stack_size_at(self.index) as i32 - (params.len() as i32 + 1);

        if self.registers_ready_for_call(ret != Type::Void) {
            self.spill_or_restore(true, true);
            self.emit_fast_call(target);
        } else {
            self.spill_or_restore(false, true);
            emit_sysv_call(self.asm, params, target, Reg::Rsp, offset, self.is_rsp_odd);
        }

        match ret {
            Type::Double => {
                let home = self.mem_from_tos(params.len() as u16);
                self.asm.movsd_store(home, Xmm::Xmm0);
            }
            Type::Int | Type::String => {
                let home = self.mem_from_tos(params.len() as u16);
                self.asm.gp_op(GpBin::Mov, home, Operand::Gp(Reg::Rax));
            }
            Type::Void => {}
        }

        self.spill_or_restore(true, false);
        Ok(())
    }

    /// Flush register-pinned slots to their memory homes (spill) or reload
    /// them (restore), against the shape of this or the next instruction.
    fn spill_or_restore(&mut self, next: bool, spill: bool) {
        let insn = self.index + next as usize;
        if insn >= self.ab.len() {
            return;
        }
        for slot in 0..self.ab.stack_size_at(insn) {
            let location = self.stack_slot_location(insn, slot);
            if location.is_reg() {
                if spill {
                    self.mov_from_to(location, self.mem_slot(slot));
                } else {
                    self.mov_from_to(self.mem_slot(slot), location);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn test_build_program_produces_code() {
        let code = compile("print(1 + 2);").unwrap();
        let program = build_program(&code).unwrap();
        assert!(!program.memory.is_empty());
        assert!(!program.entry().is_null());
    }

    #[test]
    fn test_build_program_all_constructs() {
        // Smoke-test emission over every opcode family the translator
        // produces: constants, arithmetic, comparisons, logic, loops,
        // closures, recursion, coercions, and printing.
        let code = compile(
            "function int fact(int n) { if (n < 2) { return 1; } return n * fact(n - 1); } \
             function int outer() { \
               int x; x = 41; \
               function int inner() { return x + 1; } \
               return inner(); \
             } \
             double d; d = 2; d = d + 0.5; d = -d; \
             int i; \
             for (i in 0..3) { \
               while (i % 2 == 0) { i += 1; } \
             } \
             print(fact(6), ' ', outer(), ' ', d, ' ', !0, ' ', 'done', '\\n');",
        )
        .unwrap();
        let program = build_program(&code).unwrap();
        assert!(program.memory.len() > 64);
    }

    #[test]
    fn test_native_proxy_marshalling() {
        extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
            a + b + c
        }
        let signature = Signature {
            ret: Type::Int,
            params: vec![
                crate::parser::ast::Param { name: "a".into(), ty: Type::Int },
                crate::parser::ast::Param { name: "b".into(), ty: Type::Int },
                crate::parser::ast::Param { name: "c".into(), ty: Type::Int },
            ],
        };
        let (proxy, _page) = build_native_proxy(&signature, add3 as *const u8).unwrap();

        // Slot 0 is the below-arguments anchor; arguments start at slot 1.
        let packed: [u64; 4] = [0, 10, 20, 12];
        let f: extern "C" fn(*const u64) -> i64 = unsafe { std::mem::transmute(proxy) };
        assert_eq!(f(packed.as_ptr()), 42);
    }

    #[test]
    fn test_native_proxy_mixed_types() {
        extern "C" fn scale(factor: f64, value: i64) -> f64 {
            factor * value as f64
        }
        let signature = Signature {
            ret: Type::Double,
            params: vec![
                crate::parser::ast::Param { name: "factor".into(), ty: Type::Double },
                crate::parser::ast::Param { name: "value".into(), ty: Type::Int },
            ],
        };
        let (proxy, _page) = build_native_proxy(&signature, scale as *const u8).unwrap();

        let packed: [u64; 3] = [0, 2.5f64.to_bits(), 4];
        let f: extern "C" fn(*const u64) -> f64 = unsafe { std::mem::transmute(proxy) };
        assert_eq!(f(packed.as_ptr()), 10.0);
    }
}
