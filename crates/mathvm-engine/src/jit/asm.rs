//! Minimal x86-64 instruction encoder.
//!
//! Covers exactly the instruction forms the code generator and the native
//! trampolines need: 64-bit ALU ops in reg/mem forms, scalar-double SSE2,
//! the division idiom, flag materialisation, and rel32 control flow with
//! deferred label fix-ups. Double literals live in a pool appended after the
//! code and are addressed RIP-relative.

use rustc_hash::FxHashMap;

use crate::jit::JitError;

/// General-purpose registers with their hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// SSE registers with their hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

/// An instruction operand as the code generator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A general-purpose register.
    Gp(Reg),
    /// An SSE register.
    Xmm(Xmm),
    /// `[base + disp]`.
    Mem(Reg, i32),
    /// `[rip + label]`, for pool constants.
    Rip(Label),
}

impl Operand {
    /// Whether this operand is any kind of register.
    pub fn is_reg(self) -> bool {
        matches!(self, Operand::Gp(_) | Operand::Xmm(_))
    }

    /// Whether this operand is an SSE register.
    pub fn is_xmm(self) -> bool {
        matches!(self, Operand::Xmm(_))
    }
}

/// Condition codes (the low nibble of `Jcc`/`SETcc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Cond {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// Two-operand 64-bit ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpBin {
    /// `add`
    Add,
    /// `or`
    Or,
    /// `and`
    And,
    /// `sub`
    Sub,
    /// `xor`
    Xor,
    /// `cmp`
    Cmp,
    /// `mov`
    Mov,
}

impl GpBin {
    /// `(store form r/m ← r, load form r ← r/m)` opcodes.
    fn opcodes(self) -> (u8, u8) {
        match self {
            GpBin::Add => (0x01, 0x03),
            GpBin::Or => (0x09, 0x0B),
            GpBin::And => (0x21, 0x23),
            GpBin::Sub => (0x29, 0x2B),
            GpBin::Xor => (0x31, 0x33),
            GpBin::Cmp => (0x39, 0x3B),
            GpBin::Mov => (0x89, 0x8B),
        }
    }

    /// `/digit` for the `0x81 /n imm32` form.
    fn imm_ext(self) -> u8 {
        match self {
            GpBin::Add => 0,
            GpBin::Or => 1,
            GpBin::And => 4,
            GpBin::Sub => 5,
            GpBin::Xor => 6,
            GpBin::Cmp => 7,
            GpBin::Mov => unreachable!("mov imm uses its own form"),
        }
    }
}

/// Scalar-double SSE operations with an XMM destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseBin {
    /// `movsd xmm, r/m`
    Movsd,
    /// `addsd`
    Addsd,
    /// `subsd`
    Subsd,
    /// `mulsd`
    Mulsd,
    /// `divsd`
    Divsd,
    /// `ucomisd`
    Ucomisd,
    /// `xorpd`
    Xorpd,
}

impl SseBin {
    /// `(mandatory prefix, second opcode byte)`.
    fn encoding(self) -> (u8, u8) {
        match self {
            SseBin::Movsd => (0xF2, 0x10),
            SseBin::Addsd => (0xF2, 0x58),
            SseBin::Subsd => (0xF2, 0x5C),
            SseBin::Mulsd => (0xF2, 0x59),
            SseBin::Divsd => (0xF2, 0x5E),
            SseBin::Ucomisd => (0x66, 0x2E),
            SseBin::Xorpd => (0x66, 0x57),
        }
    }
}

/// A code or pool position, bound at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// The `r/m` half of a ModRM encoding.
#[derive(Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(Reg, i32),
    Rip(Label),
}

/// Append-only machine-code buffer with labels and a literal pool.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// `(position of rel32, target)`; patched at finalize.
    fixups: Vec<(usize, Label)>,
    pool: Vec<(Label, u64)>,
    pool_index: FxHashMap<u64, Label>,
}

impl Assembler {
    /// Fresh empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// A new unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.buf.len());
    }

    /// Label of an 8-byte literal in the trailing pool, deduplicated by bit
    /// pattern.
    pub fn float_const(&mut self, bits: u64) -> Label {
        if let Some(&label) = self.pool_index.get(&bits) {
            return label;
        }
        let label = self.new_label();
        self.pool.push((label, bits));
        self.pool_index.insert(bits, label);
        label
    }

    /// Emit the pool, resolve every fix-up, and return the finished bytes.
    pub fn finalize(mut self) -> Result<Vec<u8>, JitError> {
        for (label, bits) in std::mem::take(&mut self.pool) {
            self.labels[label.0] = Some(self.buf.len());
            self.buf.extend_from_slice(&bits.to_le_bytes());
        }
        for (pos, label) in &self.fixups {
            let target = self.labels[label.0].ok_or(JitError::UnboundLabel)?;
            let rel = target as i64 - (*pos as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| JitError::UnboundLabel)?;
            self.buf[*pos..*pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(self.buf)
    }

    // ===== Encoding plumbing =====

    fn emit(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Legacy prefix, REX, opcode bytes, ModRM, SIB, displacement.
    fn encode(&mut self, prefix: Option<u8>, rex_w: bool, opcode: &[u8], reg: u8, rm: Rm) {
        if let Some(p) = prefix {
            self.emit(p);
        }

        let rex_r = reg >> 3;
        let rex_b = match rm {
            Rm::Reg(r) => r >> 3,
            Rm::Mem(base, _) => (base as u8) >> 3,
            Rm::Rip(_) => 0,
        };
        let rex = 0x40 | ((rex_w as u8) << 3) | (rex_r << 2) | rex_b;
        if rex != 0x40 || rex_w {
            self.emit(rex);
        }

        self.buf.extend_from_slice(opcode);

        let reg_bits = (reg & 7) << 3;
        match rm {
            Rm::Reg(r) => self.emit(0xC0 | reg_bits | (r & 7)),
            Rm::Rip(label) => {
                self.emit(reg_bits | 0x05);
                self.fixups.push((self.buf.len(), label));
                self.buf.extend_from_slice(&[0; 4]);
            }
            Rm::Mem(base, disp) => {
                let base_enc = base as u8 & 7;
                let need_sib = base_enc == 4;
                let (modbits, disp_len) = if disp == 0 && base_enc != 5 {
                    (0x00u8, 0)
                } else if (-128..=127).contains(&disp) {
                    (0x40, 1)
                } else {
                    (0x80, 4)
                };
                self.emit(modbits | reg_bits | if need_sib { 4 } else { base_enc });
                if need_sib {
                    self.emit(0x24);
                }
                match disp_len {
                    1 => self.emit(disp as i8 as u8),
                    4 => self.buf.extend_from_slice(&disp.to_le_bytes()),
                    _ => {}
                }
            }
        }
    }

    fn rm_of(op: Operand) -> Rm {
        match op {
            Operand::Gp(r) => Rm::Reg(r as u8),
            Operand::Xmm(x) => Rm::Reg(x as u8),
            Operand::Mem(base, disp) => Rm::Mem(base, disp),
            Operand::Rip(label) => Rm::Rip(label),
        }
    }

    // ===== Data movement =====

    /// `movabs reg, imm64`
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        let d = dst as u8;
        let rex = 0x48 | (d >> 3);
        self.emit(rex);
        self.emit(0xB8 | (d & 7));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov r/m64, imm32` (sign-extended)
    pub fn mov_imm32(&mut self, dst: Operand, imm: i32) {
        debug_assert!(!dst.is_xmm());
        self.encode(None, true, &[0xC7], 0, Self::rm_of(dst));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    // ===== 64-bit ALU =====

    /// `op dst, src` over any register/memory pairing except mem-mem.
    pub fn gp_op(&mut self, op: GpBin, dst: Operand, src: Operand) {
        let (store, load) = op.opcodes();
        match (dst, src) {
            (Operand::Gp(d), Operand::Gp(s)) => {
                self.encode(None, true, &[store], s as u8, Rm::Reg(d as u8));
            }
            (Operand::Gp(d), src) if !src.is_reg() => {
                self.encode(None, true, &[load], d as u8, Self::rm_of(src));
            }
            (dst, Operand::Gp(s)) if !dst.is_reg() => {
                self.encode(None, true, &[store], s as u8, Self::rm_of(dst));
            }
            _ => unreachable!("unsupported ALU operand pairing"),
        }
    }

    /// `op r/m64, imm32`
    pub fn gp_op_imm32(&mut self, op: GpBin, dst: Operand, imm: i32) {
        debug_assert!(!dst.is_xmm());
        self.encode(None, true, &[0x81], op.imm_ext(), Self::rm_of(dst));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `imul dst, r/m64` (destination must be a register)
    pub fn imul(&mut self, dst: Reg, src: Operand) {
        self.encode(None, true, &[0x0F, 0xAF], dst as u8, Self::rm_of(src));
    }

    /// `neg r/m64`
    pub fn neg(&mut self, op: Operand) {
        self.encode(None, true, &[0xF7], 3, Self::rm_of(op));
    }

    /// `cqo`
    pub fn cqo(&mut self) {
        self.buf.extend_from_slice(&[0x48, 0x99]);
    }

    /// `idiv r/m64`
    pub fn idiv(&mut self, op: Operand) {
        self.encode(None, true, &[0xF7], 7, Self::rm_of(op));
    }

    // ===== Scalar double =====

    /// `op xmm, xmm/m64`
    pub fn sse_op(&mut self, op: SseBin, dst: Xmm, src: Operand) {
        let (prefix, opcode) = op.encoding();
        self.encode(Some(prefix), false, &[0x0F, opcode], dst as u8, Self::rm_of(src));
    }

    /// `movsd m64, xmm`
    pub fn movsd_store(&mut self, dst: Operand, src: Xmm) {
        debug_assert!(!dst.is_reg());
        self.encode(Some(0xF2), false, &[0x0F, 0x11], src as u8, Self::rm_of(dst));
    }

    /// `cvtsi2sd xmm, r/m64`
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Operand) {
        debug_assert!(!src.is_xmm());
        self.encode(Some(0xF2), true, &[0x0F, 0x2A], dst as u8, Self::rm_of(src));
    }

    /// `cvttsd2si r64, xmm/m64`
    pub fn cvttsd2si(&mut self, dst: Reg, src: Operand) {
        self.encode(Some(0xF2), true, &[0x0F, 0x2C], dst as u8, Self::rm_of(src));
    }

    // ===== Flags =====

    /// `setcc al`
    pub fn setcc(&mut self, cond: Cond) {
        self.buf
            .extend_from_slice(&[0x0F, 0x90 | cond as u8, 0xC0]);
    }

    /// `movzx rax, al`
    pub fn movzx_rax_al(&mut self) {
        self.buf.extend_from_slice(&[0x48, 0x0F, 0xB6, 0xC0]);
    }

    // ===== Control flow =====

    /// `jmp rel32`
    pub fn jmp(&mut self, label: Label) {
        self.emit(0xE9);
        self.fixups.push((self.buf.len(), label));
        self.buf.extend_from_slice(&[0; 4]);
    }

    /// `jcc rel32`
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.emit(0x0F);
        self.emit(0x80 | cond as u8);
        self.fixups.push((self.buf.len(), label));
        self.buf.extend_from_slice(&[0; 4]);
    }

    /// `call rel32`
    pub fn call(&mut self, label: Label) {
        self.emit(0xE8);
        self.fixups.push((self.buf.len(), label));
        self.buf.extend_from_slice(&[0; 4]);
    }

    /// `call reg`
    pub fn call_reg(&mut self, reg: Reg) {
        let r = reg as u8;
        if r >= 8 {
            self.emit(0x41);
        }
        self.emit(0xFF);
        self.emit(0xD0 | (r & 7));
    }

    /// `push reg`
    pub fn push(&mut self, reg: Reg) {
        let r = reg as u8;
        if r >= 8 {
            self.emit(0x41);
        }
        self.emit(0x50 | (r & 7));
    }

    /// `pop reg`
    pub fn pop(&mut self, reg: Reg) {
        let r = reg as u8;
        if r >= 8 {
            self.emit(0x41);
        }
        self.emit(0x58 | (r & 7));
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.finalize().unwrap()
    }

    #[test]
    fn test_mov_ri() {
        assert_eq!(
            bytes(|a| a.mov_ri(Reg::Rax, 42)),
            [0x48, 0xB8, 42, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            bytes(|a| a.mov_ri(Reg::R11, -1)),
            [0x49, 0xBB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_mov_reg_reg() {
        // mov rdi, rsi
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Mov, Operand::Gp(Reg::Rdi), Operand::Gp(Reg::Rsi))),
            [0x48, 0x89, 0xF7]
        );
    }

    #[test]
    fn test_mov_reg_mem_rsp() {
        // mov rax, [rsp+8]
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Mov, Operand::Gp(Reg::Rax), Operand::Mem(Reg::Rsp, 8))),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // mov [rsp], rbx  (zero disp, SIB, mod 00)
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Mov, Operand::Mem(Reg::Rsp, 0), Operand::Gp(Reg::Rbx))),
            [0x48, 0x89, 0x1C, 0x24]
        );
    }

    #[test]
    fn test_r13_base_needs_disp() {
        // mov rax, [r13+0] must use the disp8 form
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Mov, Operand::Gp(Reg::Rax), Operand::Mem(Reg::R13, 0))),
            [0x49, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_large_disp() {
        // mov rax, [rsp+0x1000]
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Mov, Operand::Gp(Reg::Rax), Operand::Mem(Reg::Rsp, 0x1000))),
            [0x48, 0x8B, 0x84, 0x24, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_alu_forms() {
        // add rdi, rsi
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Add, Operand::Gp(Reg::Rdi), Operand::Gp(Reg::Rsi))),
            [0x48, 0x01, 0xF7]
        );
        // cmp [rsp+8], rdi
        assert_eq!(
            bytes(|a| a.gp_op(GpBin::Cmp, Operand::Mem(Reg::Rsp, 8), Operand::Gp(Reg::Rdi))),
            [0x48, 0x39, 0x7C, 0x24, 0x08]
        );
        // sub rsp, 0x20
        assert_eq!(
            bytes(|a| a.gp_op_imm32(GpBin::Sub, Operand::Gp(Reg::Rsp), 0x20)),
            [0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_imul() {
        // imul rdi, [rsp+8]
        assert_eq!(
            bytes(|a| a.imul(Reg::Rdi, Operand::Mem(Reg::Rsp, 8))),
            [0x48, 0x0F, 0xAF, 0x7C, 0x24, 0x08]
        );
    }

    #[test]
    fn test_division_idiom() {
        assert_eq!(bytes(|a| a.cqo()), [0x48, 0x99]);
        assert_eq!(
            bytes(|a| a.idiv(Operand::Gp(Reg::Rbx))),
            [0x48, 0xF7, 0xFB]
        );
        assert_eq!(bytes(|a| a.neg(Operand::Gp(Reg::Rax))), [0x48, 0xF7, 0xD8]);
    }

    #[test]
    fn test_sse() {
        // movsd xmm0, [rsp+16]
        assert_eq!(
            bytes(|a| a.sse_op(SseBin::Movsd, Xmm::Xmm0, Operand::Mem(Reg::Rsp, 16))),
            [0xF2, 0x0F, 0x10, 0x44, 0x24, 0x10]
        );
        // movsd [rsp+8], xmm14
        assert_eq!(
            bytes(|a| a.movsd_store(Operand::Mem(Reg::Rsp, 8), Xmm::Xmm14)),
            [0xF2, 0x44, 0x0F, 0x11, 0x74, 0x24, 0x08]
        );
        // addsd xmm1, xmm2
        assert_eq!(
            bytes(|a| a.sse_op(SseBin::Addsd, Xmm::Xmm1, Operand::Xmm(Xmm::Xmm2))),
            [0xF2, 0x0F, 0x58, 0xCA]
        );
        // ucomisd xmm15, xmm1
        assert_eq!(
            bytes(|a| a.sse_op(SseBin::Ucomisd, Xmm::Xmm15, Operand::Xmm(Xmm::Xmm1))),
            [0x66, 0x44, 0x0F, 0x2E, 0xF9]
        );
        // xorpd xmm0, xmm14
        assert_eq!(
            bytes(|a| a.sse_op(SseBin::Xorpd, Xmm::Xmm0, Operand::Xmm(Xmm::Xmm14))),
            [0x66, 0x41, 0x0F, 0x57, 0xC6]
        );
    }

    #[test]
    fn test_conversions() {
        // cvtsi2sd xmm15, rax
        assert_eq!(
            bytes(|a| a.cvtsi2sd(Xmm::Xmm15, Operand::Gp(Reg::Rax))),
            [0xF2, 0x4C, 0x0F, 0x2A, 0xF8]
        );
        // cvttsd2si rax, xmm14
        assert_eq!(
            bytes(|a| a.cvttsd2si(Reg::Rax, Operand::Xmm(Xmm::Xmm14))),
            [0xF2, 0x49, 0x0F, 0x2C, 0xC6]
        );
    }

    #[test]
    fn test_setcc_movzx() {
        assert_eq!(bytes(|a| a.setcc(Cond::E)), [0x0F, 0x94, 0xC0]);
        assert_eq!(bytes(|a| a.movzx_rax_al()), [0x48, 0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_labels_and_jumps() {
        // jmp over one byte of padding; backward jcc to start.
        let mut asm = Assembler::new();
        let start = asm.new_label();
        asm.bind(start);
        let fwd = asm.new_label();
        asm.jmp(fwd);
        asm.ret();
        asm.bind(fwd);
        asm.jcc(Cond::Ne, start);
        let code = asm.finalize().unwrap();
        // jmp rel32 = +1 (skip the ret)
        assert_eq!(&code[0..5], &[0xE9, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(code[5], 0xC3);
        // jne rel32 back to offset 0 from offset 12
        assert_eq!(&code[6..12], &[0x0F, 0x85, 0xF4, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_float_pool_dedup() {
        let mut asm = Assembler::new();
        let a = asm.float_const(2.5f64.to_bits());
        let b = asm.float_const(2.5f64.to_bits());
        assert_eq!(a, b);
        asm.sse_op(SseBin::Movsd, Xmm::Xmm0, Operand::Rip(a));
        let code = asm.finalize().unwrap();
        // movsd xmm0, [rip+rel]; pool follows immediately, so rel == 0.
        assert_eq!(&code[0..8], &[0xF2, 0x0F, 0x10, 0x05, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&code[8..16], &2.5f64.to_bits().to_le_bytes());
    }

    #[test]
    fn test_call_reg_and_executes() {
        // Assemble `mov rax, 7; add rax, rax; ret` and run it.
        let mut asm = Assembler::new();
        asm.mov_ri(Reg::Rax, 7);
        asm.gp_op(GpBin::Add, Operand::Gp(Reg::Rax), Operand::Gp(Reg::Rax));
        asm.ret();
        let code = asm.finalize().unwrap();
        let memory = crate::jit::memory::ExecutableMemory::new(&code).unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(memory.as_ptr()) };
        assert_eq!(f(), 14);
    }
}
