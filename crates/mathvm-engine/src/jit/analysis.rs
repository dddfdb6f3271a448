//! Annotated bytecode: typed decoding plus abstract-stack propagation.
//!
//! Pass 1 decodes a function's byte stream into an array of instructions
//! with parsed operands; branch operands become target instruction indices.
//! Pass 2 walks the successor graph breadth-first from instruction 0,
//! propagating the ordered list of operand types on the virtual stack. The
//! result gives the code generator, per instruction, the entry stack shape,
//! whether the instruction is a jump target, and the function's maximum
//! stack depth.
//!
//! Arithmetic opcodes "pop 1" here even though they consume two operands:
//! the upper operand is popped and the lower rewritten in place, keeping
//! exactly one result value. Strings are integers on this stack.

use crate::compiler::bytecode::{BytecodeFunction, Code, Opcode};
use crate::jit::JitError;
use crate::parser::Type;

/// Decoded operand of one instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstrArg {
    /// No operand.
    None,
    /// Constant id, variable slot, or function id.
    Index(u16),
    /// Context function id plus variable slot.
    CtxVar {
        /// Function whose live frame holds the variable.
        ctx: u16,
        /// Slot within that frame.
        slot: u16,
    },
    /// Inline 64-bit integer.
    Int(i64),
    /// Inline double.
    Double(f64),
    /// Branch target as an instruction index.
    Target(usize),
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct InstrWithArgs {
    /// The opcode.
    pub insn: Opcode,
    /// Its decoded operand.
    pub arg: InstrArg,
}

/// A function's instructions plus the abstract-stack annotation.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedBytecode {
    insns: Vec<InstrWithArgs>,
    /// Entry stack shape per instruction.
    stacks: Vec<Vec<Type>>,
    used_as_label: Vec<bool>,
    /// Instructions the forward walk reached; dead code has no shape and is
    /// not emitted.
    reachable: Vec<bool>,
    max_stack: u16,
    locals: u16,
    uses_closure: bool,
}

impl AnnotatedBytecode {
    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Whether the function has no instructions.
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Opcode at an instruction index.
    pub fn insn(&self, index: usize) -> Opcode {
        self.insns[index].insn
    }

    /// Full decoded instruction at an index.
    pub fn insn_with_args(&self, index: usize) -> InstrWithArgs {
        self.insns[index]
    }

    /// Entry stack depth of an instruction.
    pub fn stack_size_at(&self, index: usize) -> u16 {
        self.stacks[index].len() as u16
    }

    /// Type of an entry-stack slot of an instruction.
    pub fn stack_type_at(&self, index: usize, slot: u16) -> Type {
        self.stacks[index][slot as usize]
    }

    /// How many integer-typed slots precede `slot` in the entry shape.
    pub fn gp_slots_before(&self, index: usize, slot: u16) -> u16 {
        self.stacks[index][..slot as usize]
            .iter()
            .filter(|&&t| t == Type::Int)
            .count() as u16
    }

    /// How many double-typed slots precede `slot` in the entry shape.
    pub fn xmm_slots_before(&self, index: usize, slot: u16) -> u16 {
        self.stacks[index][..slot as usize]
            .iter()
            .filter(|&&t| t == Type::Double)
            .count() as u16
    }

    /// Whether some branch targets this instruction.
    pub fn used_as_label(&self, index: usize) -> bool {
        self.used_as_label[index]
    }

    /// Whether control flow can reach this instruction.
    pub fn reachable(&self, index: usize) -> bool {
        self.reachable[index]
    }

    /// Maximum abstract stack depth across the function.
    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    /// The function's locals count, as translated.
    pub fn locals_number(&self) -> u16 {
        self.locals
    }

    /// Whether some function accesses this one's frame through the closure
    /// table, so its prologue and epilogue must maintain the table.
    pub fn uses_closure(&self) -> bool {
        self.uses_closure
    }
}

/// Mark, across all functions, which functions' frames are accessed through
/// context references.
pub fn analyze_closure_usage(bytecodes: &mut [AnnotatedBytecode]) {
    let mut used: Vec<u16> = Vec::new();
    for ab in bytecodes.iter() {
        for instr in &ab.insns {
            if let InstrArg::CtxVar { ctx, .. } = instr.arg {
                used.push(ctx);
            }
        }
    }
    for ctx in used {
        bytecodes[ctx as usize].uses_closure = true;
    }
}

/// Decode and annotate one function.
pub fn annotate(function: &BytecodeFunction, code: &Code) -> Result<AnnotatedBytecode, JitError> {
    let insns = decode(function)?;
    let len = insns.len();
    let mut result = AnnotatedBytecode {
        insns,
        stacks: vec![Vec::new(); len],
        used_as_label: vec![false; len],
        reachable: vec![false; len],
        max_stack: 0,
        locals: function.locals_number(),
        uses_closure: false,
    };
    propagate(&mut result, code)?;
    Ok(result)
}

/// Pass 1: linear decode with branch-target resolution.
fn decode(function: &BytecodeFunction) -> Result<Vec<InstrWithArgs>, JitError> {
    let bc = &function.bytecode;
    let mut insns = Vec::new();
    // (instruction index, absolute byte target)
    let mut unresolved: Vec<(usize, u32)> = Vec::new();
    let mut index_by_offset = vec![usize::MAX; bc.len() as usize];

    let mut offset = 0u32;
    while offset < bc.len() {
        let index = insns.len();
        index_by_offset[offset as usize] = index;

        let byte = bc.get(offset);
        let insn = Opcode::from_u8(byte)
            .ok_or_else(|| JitError::BadBytecode(format!("opcode {:#04x}", byte)))?;
        offset += 1;

        let arg = match insn {
            Opcode::Dload => {
                let v = bc.get_f64(offset);
                offset += 8;
                InstrArg::Double(v)
            }
            Opcode::Iload => {
                let v = bc.get_i64(offset);
                offset += 8;
                InstrArg::Int(v)
            }
            Opcode::Sload
            | Opcode::LoadDvar
            | Opcode::LoadIvar
            | Opcode::LoadSvar
            | Opcode::StoreDvar
            | Opcode::StoreIvar
            | Opcode::StoreSvar
            | Opcode::Call
            | Opcode::CallNative => {
                let v = bc.get_u16(offset);
                offset += 2;
                InstrArg::Index(v)
            }
            Opcode::LoadCtxDvar
            | Opcode::LoadCtxIvar
            | Opcode::LoadCtxSvar
            | Opcode::StoreCtxDvar
            | Opcode::StoreCtxIvar
            | Opcode::StoreCtxSvar => {
                let ctx = bc.get_u16(offset);
                let slot = bc.get_u16(offset + 2);
                offset += 4;
                InstrArg::CtxVar { ctx, slot }
            }
            _ if insn.is_branch() => {
                let target = (offset as i64 + bc.get_i16(offset) as i64) as u32;
                unresolved.push((index, target));
                offset += 2;
                InstrArg::None
            }
            Opcode::Dload0
            | Opcode::Dload1
            | Opcode::DloadM1
            | Opcode::Iload0
            | Opcode::Iload1
            | Opcode::IloadM1
            | Opcode::Sload0
            | Opcode::Dadd
            | Opcode::Dsub
            | Opcode::Dmul
            | Opcode::Ddiv
            | Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Iaor
            | Opcode::Iaand
            | Opcode::Iaxor
            | Opcode::Icmp
            | Opcode::Dcmp
            | Opcode::Dneg
            | Opcode::Ineg
            | Opcode::Dprint
            | Opcode::Iprint
            | Opcode::Sprint
            | Opcode::I2d
            | Opcode::S2i
            | Opcode::D2i
            | Opcode::Pop
            | Opcode::LoadDvar0
            | Opcode::LoadDvar1
            | Opcode::LoadDvar2
            | Opcode::LoadDvar3
            | Opcode::LoadIvar0
            | Opcode::LoadIvar1
            | Opcode::LoadIvar2
            | Opcode::LoadIvar3
            | Opcode::LoadSvar0
            | Opcode::LoadSvar1
            | Opcode::LoadSvar2
            | Opcode::LoadSvar3
            | Opcode::StoreDvar0
            | Opcode::StoreDvar1
            | Opcode::StoreDvar2
            | Opcode::StoreDvar3
            | Opcode::StoreIvar0
            | Opcode::StoreIvar1
            | Opcode::StoreIvar2
            | Opcode::StoreIvar3
            | Opcode::StoreSvar0
            | Opcode::StoreSvar1
            | Opcode::StoreSvar2
            | Opcode::StoreSvar3
            | Opcode::Return => InstrArg::None,
            _ => {
                return Err(JitError::UnsupportedInstruction(insn.name().to_string()));
            }
        };

        insns.push(InstrWithArgs { insn, arg });
    }

    for (index, byte_target) in unresolved {
        let target = index_by_offset
            .get(byte_target as usize)
            .copied()
            .filter(|&t| t != usize::MAX)
            .ok_or_else(|| {
                JitError::BadBytecode("branch into the middle of an instruction".to_string())
            })?;
        insns[index].arg = InstrArg::Target(target);
    }

    Ok(insns)
}

/// Pass 2: BFS forward propagation of stack shapes.
fn propagate(ab: &mut AnnotatedBytecode, code: &Code) -> Result<(), JitError> {
    if ab.is_empty() {
        return Ok(());
    }

    let mut queue = std::collections::VecDeque::new();
    ab.reachable[0] = true;
    queue.push_back(0usize);

    while let Some(index) = queue.pop_front() {
        let instr = ab.insns[index];

        let mut successors: Vec<usize> = Vec::new();
        if instr.insn != Opcode::Ja && index + 1 < ab.len() {
            successors.push(index + 1);
        }

        let mut popped = 0usize;
        let mut pushed: Vec<Type> = Vec::new();

        match instr.insn {
            Opcode::Dload | Opcode::Dload0 | Opcode::Dload1 | Opcode::DloadM1 => {
                pushed.push(Type::Double);
            }
            Opcode::Iload
            | Opcode::Iload0
            | Opcode::Iload1
            | Opcode::IloadM1
            | Opcode::Sload
            | Opcode::Sload0 => {
                pushed.push(Type::Int);
            }
            Opcode::Dadd
            | Opcode::Dsub
            | Opcode::Dmul
            | Opcode::Ddiv
            | Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Iaor
            | Opcode::Iaand
            | Opcode::Iaxor
            | Opcode::Icmp => {
                popped = 1;
            }
            Opcode::Dcmp => {
                popped = 2;
                pushed.push(Type::Int);
            }
            Opcode::Dneg | Opcode::Ineg | Opcode::S2i => {}
            Opcode::Dprint | Opcode::Iprint | Opcode::Sprint | Opcode::Pop => {
                popped = 1;
            }
            Opcode::I2d => {
                popped = 1;
                pushed.push(Type::Double);
            }
            Opcode::D2i => {
                popped = 1;
                pushed.push(Type::Int);
            }
            Opcode::LoadDvar0
            | Opcode::LoadDvar1
            | Opcode::LoadDvar2
            | Opcode::LoadDvar3
            | Opcode::LoadDvar
            | Opcode::LoadCtxDvar => {
                pushed.push(Type::Double);
            }
            Opcode::LoadIvar0
            | Opcode::LoadIvar1
            | Opcode::LoadIvar2
            | Opcode::LoadIvar3
            | Opcode::LoadSvar0
            | Opcode::LoadSvar1
            | Opcode::LoadSvar2
            | Opcode::LoadSvar3
            | Opcode::LoadIvar
            | Opcode::LoadSvar
            | Opcode::LoadCtxIvar
            | Opcode::LoadCtxSvar => {
                pushed.push(Type::Int);
            }
            Opcode::StoreDvar0
            | Opcode::StoreDvar1
            | Opcode::StoreDvar2
            | Opcode::StoreDvar3
            | Opcode::StoreIvar0
            | Opcode::StoreIvar1
            | Opcode::StoreIvar2
            | Opcode::StoreIvar3
            | Opcode::StoreSvar0
            | Opcode::StoreSvar1
            | Opcode::StoreSvar2
            | Opcode::StoreSvar3
            | Opcode::StoreDvar
            | Opcode::StoreIvar
            | Opcode::StoreSvar
            | Opcode::StoreCtxDvar
            | Opcode::StoreCtxIvar
            | Opcode::StoreCtxSvar => {
                popped = 1;
            }
            Opcode::Ja => {
                let InstrArg::Target(target) = instr.arg else {
                    return Err(JitError::BadBytecode("JA without a target".to_string()));
                };
                successors.push(target);
                ab.used_as_label[target] = true;
            }
            Opcode::IfIcmpE
            | Opcode::IfIcmpNe
            | Opcode::IfIcmpL
            | Opcode::IfIcmpLe
            | Opcode::IfIcmpG
            | Opcode::IfIcmpGe => {
                let InstrArg::Target(target) = instr.arg else {
                    return Err(JitError::BadBytecode("branch without a target".to_string()));
                };
                successors.push(target);
                ab.used_as_label[target] = true;
                popped = 2;
            }
            Opcode::Call => {
                let InstrArg::Index(id) = instr.arg else {
                    return Err(JitError::BadBytecode("CALL without an id".to_string()));
                };
                let signature = code.function_by_id(id).signature();
                if signature.ret != Type::Void {
                    pushed.push(abstract_type(signature.ret));
                }
                popped = signature.params.len();
            }
            Opcode::CallNative => {
                let InstrArg::Index(id) = instr.arg else {
                    return Err(JitError::BadBytecode("CALLNATIVE without an id".to_string()));
                };
                let signature = code.native_by_id(id).signature();
                if signature.ret != Type::Void {
                    pushed.push(abstract_type(signature.ret));
                }
                popped = signature.params.len();
            }
            Opcode::Return => {
                successors.clear();
            }
            _ => {
                return Err(JitError::UnsupportedInstruction(instr.insn.name().to_string()));
            }
        }

        for next in successors {
            if !ab.reachable[next] {
                ab.reachable[next] = true;
                let mut shape = ab.stacks[index].clone();
                shape.truncate(shape.len().saturating_sub(popped));
                shape.extend_from_slice(&pushed);
                ab.max_stack = ab.max_stack.max(shape.len() as u16);
                ab.stacks[next] = shape;
                queue.push_back(next);
            }
        }
    }

    Ok(())
}

/// Strings are pointer-sized integers on the abstract stack.
fn abstract_type(ty: Type) -> Type {
    if ty == Type::String {
        Type::Int
    } else {
        ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn annotate_top(source: &str) -> AnnotatedBytecode {
        let code = compile(source).unwrap();
        annotate(code.function_by_id(0), &code).unwrap()
    }

    #[test]
    fn test_linear_decode() {
        let ab = annotate_top("print(1 + 2);");
        // ILOAD 2, ILOAD1, IADD, IPRINT, RETURN
        assert_eq!(ab.len(), 5);
        assert_eq!(ab.insn(0), Opcode::Iload);
        assert!(matches!(ab.insn_with_args(0).arg, InstrArg::Int(2)));
        assert_eq!(ab.insn(1), Opcode::Iload1);
        assert_eq!(ab.insn(2), Opcode::Iadd);
        assert_eq!(ab.insn(3), Opcode::Iprint);
        assert_eq!(ab.insn(4), Opcode::Return);
    }

    #[test]
    fn test_stack_shapes_in_place_arithmetic() {
        let ab = annotate_top("print(1 + 2);");
        assert_eq!(ab.stack_size_at(0), 0);
        assert_eq!(ab.stack_size_at(1), 1);
        assert_eq!(ab.stack_size_at(2), 2);
        // IADD keeps one value in place.
        assert_eq!(ab.stack_size_at(3), 1);
        assert_eq!(ab.stack_size_at(4), 0);
        assert_eq!(ab.max_stack(), 2);
    }

    #[test]
    fn test_double_shape() {
        let ab = annotate_top("print(1.5 + 0.25);");
        assert_eq!(ab.stack_type_at(2, 0), Type::Double);
        assert_eq!(ab.stack_type_at(2, 1), Type::Double);
        assert_eq!(ab.xmm_slots_before(2, 1), 1);
        assert_eq!(ab.gp_slots_before(2, 1), 0);
    }

    #[test]
    fn test_branch_targets_marked() {
        let ab = annotate_top("int x; x = 1; if (x > 0) { print(1); } else { print(2); }");
        let mut labelled = 0;
        let mut branches = 0;
        for i in 0..ab.len() {
            if ab.used_as_label(i) {
                labelled += 1;
            }
            if matches!(ab.insn_with_args(i).arg, InstrArg::Target(_)) {
                branches += 1;
            }
        }
        assert!(labelled >= 2);
        // comparison lowering (2 branches) + if lowering (2 branches)
        assert!(branches >= 4);
    }

    #[test]
    fn test_shapes_agree_on_join_points() {
        // Both arms of the comparison diamond leave exactly one int.
        let ab = annotate_top("print(1 < 2);");
        for i in 0..ab.len() {
            if ab.insn(i) == Opcode::Iprint {
                assert_eq!(ab.stack_size_at(i), 1);
                assert_eq!(ab.stack_type_at(i, 0), Type::Int);
            }
        }
    }

    #[test]
    fn test_annotation_idempotent() {
        let code = compile("int i; for (i in 0..3) { print(i); }").unwrap();
        let a = annotate(code.function_by_id(0), &code).unwrap();
        let b = annotate(code.function_by_id(0), &code).unwrap();
        assert_eq!(a.len(), b.len());
        for i in 0..a.len() {
            assert_eq!(a.stack_size_at(i), b.stack_size_at(i));
            assert_eq!(a.used_as_label(i), b.used_as_label(i));
        }
        assert_eq!(a.max_stack(), b.max_stack());
    }

    #[test]
    fn test_closure_usage_flags_owner() {
        let code = compile(
            "function int outer() { \
               int x; x = 41; \
               function int inner() { return x + 1; } \
               return inner(); \
             } \
             print(outer());",
        )
        .unwrap();
        let mut all: Vec<AnnotatedBytecode> = code
            .functions()
            .map(|f| annotate(f, &code).unwrap())
            .collect();
        analyze_closure_usage(&mut all);
        // outer (id 1) owns the captured frame; inner (id 2) only reads it.
        assert!(all[1].uses_closure());
        assert!(!all[2].uses_closure());
        assert!(!all[0].uses_closure());
    }

    #[test]
    fn test_call_shape() {
        let code = compile(
            "function int fact(int n) { if (n < 2) { return 1; } return n * fact(n - 1); } \
             print(fact(6));",
        )
        .unwrap();
        let top = annotate(code.function_by_id(0), &code).unwrap();
        for i in 0..top.len() {
            if top.insn(i) == Opcode::Call {
                assert_eq!(top.stack_size_at(i), 1);
                // After the call: just the int result.
                assert_eq!(top.stack_size_at(i + 1), 1);
            }
        }
    }
}
