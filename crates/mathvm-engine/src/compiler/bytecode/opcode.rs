//! Bytecode opcodes for the MathVM stack machine.
//!
//! All opcodes are single-byte instructions; operands follow the opcode byte
//! in the stream, little-endian and unaligned. The numbering is part of the
//! wire format: short-form local variable opcodes for slots 1..3 are derived
//! from the slot-0 opcode by addition, and conditional jumps form the
//! contiguous range [`Opcode::IfIcmpNe`]..=[`Opcode::IfIcmpLe`].

/// Bytecode opcode enumeration.
///
/// Stack comments use "upper" for the most recently pushed value and "lower"
/// for the one beneath it; binary arithmetic computes `upper op lower`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Invalid instruction.
    Invalid = 0x00,

    // ===== Constants =====
    /// Push a double; operand: f64 immediate.
    Dload = 0x01,
    /// Push an int; operand: i64 immediate.
    Iload = 0x02,
    /// Push a string reference; operand: u16 constant id.
    Sload = 0x03,
    /// Push 0.0.
    Dload0 = 0x04,
    /// Push 0.
    Iload0 = 0x05,
    /// Push the empty string (constant id 0).
    Sload0 = 0x06,
    /// Push 1.0.
    Dload1 = 0x07,
    /// Push 1.
    Iload1 = 0x08,
    /// Push -1.0.
    DloadM1 = 0x09,
    /// Push -1.
    IloadM1 = 0x0A,

    // ===== Arithmetic =====
    /// Pop two doubles, push their sum.
    Dadd = 0x0B,
    /// Pop two ints, push their sum.
    Iadd = 0x0C,
    /// Pop two doubles, push upper - lower.
    Dsub = 0x0D,
    /// Pop two ints, push upper - lower.
    Isub = 0x0E,
    /// Pop two doubles, push their product.
    Dmul = 0x0F,
    /// Pop two ints, push their product.
    Imul = 0x10,
    /// Pop two doubles, push upper / lower.
    Ddiv = 0x11,
    /// Pop two ints, push upper / lower.
    Idiv = 0x12,
    /// Pop two ints, push upper % lower.
    Imod = 0x13,
    /// Negate the double on top.
    Dneg = 0x14,
    /// Negate the int on top.
    Ineg = 0x15,
    /// Pop two ints, push their bitwise OR.
    Iaor = 0x16,
    /// Pop two ints, push their bitwise AND.
    Iaand = 0x17,
    /// Pop two ints, push their bitwise XOR.
    Iaxor = 0x18,

    // ===== I/O and coercion =====
    /// Pop and print an int.
    Iprint = 0x19,
    /// Pop and print a double.
    Dprint = 0x1A,
    /// Pop and print a string.
    Sprint = 0x1B,
    /// Convert the int on top to a double.
    I2d = 0x1C,
    /// Convert the double on top to an int (truncating).
    D2i = 0x1D,
    /// Reinterpret the string pointer on top as an int.
    S2i = 0x1E,

    // ===== Stack =====
    /// Swap the two topmost values.
    Swap = 0x1F,
    /// Remove the topmost value.
    Pop = 0x20,

    // ===== Local variables, short forms for slots 0..3 =====
    /// Push the double in slot 0.
    LoadDvar0 = 0x21,
    /// Push the double in slot 1.
    LoadDvar1 = 0x22,
    /// Push the double in slot 2.
    LoadDvar2 = 0x23,
    /// Push the double in slot 3.
    LoadDvar3 = 0x24,
    /// Push the int in slot 0.
    LoadIvar0 = 0x25,
    /// Push the int in slot 1.
    LoadIvar1 = 0x26,
    /// Push the int in slot 2.
    LoadIvar2 = 0x27,
    /// Push the int in slot 3.
    LoadIvar3 = 0x28,
    /// Push the string in slot 0.
    LoadSvar0 = 0x29,
    /// Push the string in slot 1.
    LoadSvar1 = 0x2A,
    /// Push the string in slot 2.
    LoadSvar2 = 0x2B,
    /// Push the string in slot 3.
    LoadSvar3 = 0x2C,
    /// Pop a double into slot 0.
    StoreDvar0 = 0x2D,
    /// Pop a double into slot 1.
    StoreDvar1 = 0x2E,
    /// Pop a double into slot 2.
    StoreDvar2 = 0x2F,
    /// Pop a double into slot 3.
    StoreDvar3 = 0x30,
    /// Pop an int into slot 0.
    StoreIvar0 = 0x31,
    /// Pop an int into slot 1.
    StoreIvar1 = 0x32,
    /// Pop an int into slot 2.
    StoreIvar2 = 0x33,
    /// Pop an int into slot 3.
    StoreIvar3 = 0x34,
    /// Pop a string into slot 0.
    StoreSvar0 = 0x35,
    /// Pop a string into slot 1.
    StoreSvar1 = 0x36,
    /// Pop a string into slot 2.
    StoreSvar2 = 0x37,
    /// Pop a string into slot 3.
    StoreSvar3 = 0x38,

    // ===== Local variables, long forms; operand: u16 slot id =====
    /// Push the double in the given slot.
    LoadDvar = 0x39,
    /// Push the int in the given slot.
    LoadIvar = 0x3A,
    /// Push the string in the given slot.
    LoadSvar = 0x3B,
    /// Pop a double into the given slot.
    StoreDvar = 0x3C,
    /// Pop an int into the given slot.
    StoreIvar = 0x3D,
    /// Pop a string into the given slot.
    StoreSvar = 0x3E,

    // ===== Closure variables; operands: u16 context function id, u16 slot =====
    /// Push a double from an enclosing function's live frame.
    LoadCtxDvar = 0x3F,
    /// Push an int from an enclosing function's live frame.
    LoadCtxIvar = 0x40,
    /// Push a string from an enclosing function's live frame.
    LoadCtxSvar = 0x41,
    /// Pop a double into an enclosing function's live frame.
    StoreCtxDvar = 0x42,
    /// Pop an int into an enclosing function's live frame.
    StoreCtxIvar = 0x43,
    /// Pop a string into an enclosing function's live frame.
    StoreCtxSvar = 0x44,

    // ===== Comparison =====
    /// Pop two doubles, push cmp(upper, lower) as -1/0/+1.
    Dcmp = 0x45,
    /// Pop two ints, push cmp(upper, lower) as -1/0/+1.
    Icmp = 0x46,

    // ===== Control flow; operand: i16 offset from the byte after the opcode =====
    /// Jump always.
    Ja = 0x47,
    /// Pop two ints, jump when upper != lower.
    IfIcmpNe = 0x48,
    /// Pop two ints, jump when upper == lower.
    IfIcmpE = 0x49,
    /// Pop two ints, jump when upper > lower.
    IfIcmpG = 0x4A,
    /// Pop two ints, jump when upper >= lower.
    IfIcmpGe = 0x4B,
    /// Pop two ints, jump when upper < lower.
    IfIcmpL = 0x4C,
    /// Pop two ints, jump when upper <= lower.
    IfIcmpLe = 0x4D,

    // ===== Debug =====
    /// Print the top value without removing it.
    Dump = 0x4E,
    /// Stop execution.
    Stop = 0x4F,

    // ===== Calls =====
    /// Call a translated function; operand: u16 function id.
    Call = 0x50,
    /// Call a native function; operand: u16 native id.
    CallNative = 0x51,
    /// Return to the call site.
    Return = 0x52,
    /// Debugger breakpoint.
    Break = 0x53,
}

/// Number of opcodes (one past the largest discriminant).
pub const OPCODE_COUNT: u8 = Opcode::Break as u8 + 1;

impl Opcode {
    /// Decode a raw byte, if it names an opcode.
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        if byte < OPCODE_COUNT {
            // Discriminants are dense from 0, so the transmute is total.
            Some(unsafe { std::mem::transmute::<u8, Opcode>(byte) })
        } else {
            None
        }
    }

    /// Total encoded length in bytes, operands included.
    pub fn len(self) -> usize {
        match self {
            Opcode::Dload | Opcode::Iload => 9,
            Opcode::Sload
            | Opcode::LoadDvar
            | Opcode::LoadIvar
            | Opcode::LoadSvar
            | Opcode::StoreDvar
            | Opcode::StoreIvar
            | Opcode::StoreSvar
            | Opcode::Ja
            | Opcode::IfIcmpNe
            | Opcode::IfIcmpE
            | Opcode::IfIcmpG
            | Opcode::IfIcmpGe
            | Opcode::IfIcmpL
            | Opcode::IfIcmpLe
            | Opcode::Call
            | Opcode::CallNative => 3,
            Opcode::LoadCtxDvar
            | Opcode::LoadCtxIvar
            | Opcode::LoadCtxSvar
            | Opcode::StoreCtxDvar
            | Opcode::StoreCtxIvar
            | Opcode::StoreCtxSvar => 5,
            _ => 1,
        }
    }

    /// Whether this is one of the conditional `IFICMP` jumps.
    pub fn is_conditional_jump(self) -> bool {
        (self as u8) >= (Opcode::IfIcmpNe as u8) && (self as u8) <= (Opcode::IfIcmpLe as u8)
    }

    /// Whether this is any branch instruction.
    pub fn is_branch(self) -> bool {
        self == Opcode::Ja || self.is_conditional_jump()
    }

    /// Classic mnemonic, as used by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Invalid => "INVALID",
            Opcode::Dload => "DLOAD",
            Opcode::Iload => "ILOAD",
            Opcode::Sload => "SLOAD",
            Opcode::Dload0 => "DLOAD0",
            Opcode::Iload0 => "ILOAD0",
            Opcode::Sload0 => "SLOAD0",
            Opcode::Dload1 => "DLOAD1",
            Opcode::Iload1 => "ILOAD1",
            Opcode::DloadM1 => "DLOADM1",
            Opcode::IloadM1 => "ILOADM1",
            Opcode::Dadd => "DADD",
            Opcode::Iadd => "IADD",
            Opcode::Dsub => "DSUB",
            Opcode::Isub => "ISUB",
            Opcode::Dmul => "DMUL",
            Opcode::Imul => "IMUL",
            Opcode::Ddiv => "DDIV",
            Opcode::Idiv => "IDIV",
            Opcode::Imod => "IMOD",
            Opcode::Dneg => "DNEG",
            Opcode::Ineg => "INEG",
            Opcode::Iaor => "IAOR",
            Opcode::Iaand => "IAAND",
            Opcode::Iaxor => "IAXOR",
            Opcode::Iprint => "IPRINT",
            Opcode::Dprint => "DPRINT",
            Opcode::Sprint => "SPRINT",
            Opcode::I2d => "I2D",
            Opcode::D2i => "D2I",
            Opcode::S2i => "S2I",
            Opcode::Swap => "SWAP",
            Opcode::Pop => "POP",
            Opcode::LoadDvar0 => "LOADDVAR0",
            Opcode::LoadDvar1 => "LOADDVAR1",
            Opcode::LoadDvar2 => "LOADDVAR2",
            Opcode::LoadDvar3 => "LOADDVAR3",
            Opcode::LoadIvar0 => "LOADIVAR0",
            Opcode::LoadIvar1 => "LOADIVAR1",
            Opcode::LoadIvar2 => "LOADIVAR2",
            Opcode::LoadIvar3 => "LOADIVAR3",
            Opcode::LoadSvar0 => "LOADSVAR0",
            Opcode::LoadSvar1 => "LOADSVAR1",
            Opcode::LoadSvar2 => "LOADSVAR2",
            Opcode::LoadSvar3 => "LOADSVAR3",
            Opcode::StoreDvar0 => "STOREDVAR0",
            Opcode::StoreDvar1 => "STOREDVAR1",
            Opcode::StoreDvar2 => "STOREDVAR2",
            Opcode::StoreDvar3 => "STOREDVAR3",
            Opcode::StoreIvar0 => "STOREIVAR0",
            Opcode::StoreIvar1 => "STOREIVAR1",
            Opcode::StoreIvar2 => "STOREIVAR2",
            Opcode::StoreIvar3 => "STOREIVAR3",
            Opcode::StoreSvar0 => "STORESVAR0",
            Opcode::StoreSvar1 => "STORESVAR1",
            Opcode::StoreSvar2 => "STORESVAR2",
            Opcode::StoreSvar3 => "STORESVAR3",
            Opcode::LoadDvar => "LOADDVAR",
            Opcode::LoadIvar => "LOADIVAR",
            Opcode::LoadSvar => "LOADSVAR",
            Opcode::StoreDvar => "STOREDVAR",
            Opcode::StoreIvar => "STOREIVAR",
            Opcode::StoreSvar => "STORESVAR",
            Opcode::LoadCtxDvar => "LOADCTXDVAR",
            Opcode::LoadCtxIvar => "LOADCTXIVAR",
            Opcode::LoadCtxSvar => "LOADCTXSVAR",
            Opcode::StoreCtxDvar => "STORECTXDVAR",
            Opcode::StoreCtxIvar => "STORECTXIVAR",
            Opcode::StoreCtxSvar => "STORECTXSVAR",
            Opcode::Dcmp => "DCMP",
            Opcode::Icmp => "ICMP",
            Opcode::Ja => "JA",
            Opcode::IfIcmpNe => "IFICMPNE",
            Opcode::IfIcmpE => "IFICMPE",
            Opcode::IfIcmpG => "IFICMPG",
            Opcode::IfIcmpGe => "IFICMPGE",
            Opcode::IfIcmpL => "IFICMPL",
            Opcode::IfIcmpLe => "IFICMPLE",
            Opcode::Dump => "DUMP",
            Opcode::Stop => "STOP",
            Opcode::Call => "CALL",
            Opcode::CallNative => "CALLNATIVE",
            Opcode::Return => "RETURN",
            Opcode::Break => "BREAK",
        }
    }

    /// The short form of a load/store opcode for slots 0..3, derived from the
    /// slot-0 opcode by the wire-format numbering.
    pub fn with_slot(self, slot: u16) -> Opcode {
        debug_assert!(slot < 4);
        Opcode::from_u8(self as u8 + slot as u8).expect("short-form opcode range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_roundtrip() {
        for byte in 0..OPCODE_COUNT {
            let opcode = Opcode::from_u8(byte).unwrap();
            assert_eq!(opcode as u8, byte);
        }
        assert!(Opcode::from_u8(OPCODE_COUNT).is_none());
        assert!(Opcode::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_short_form_numbering() {
        assert_eq!(Opcode::LoadIvar0.with_slot(3), Opcode::LoadIvar3);
        assert_eq!(Opcode::StoreDvar0.with_slot(1), Opcode::StoreDvar1);
        assert_eq!(Opcode::LoadSvar0.with_slot(0), Opcode::LoadSvar0);
    }

    #[test]
    fn test_conditional_jump_range() {
        assert!(Opcode::IfIcmpNe.is_conditional_jump());
        assert!(Opcode::IfIcmpLe.is_conditional_jump());
        assert!(!Opcode::Ja.is_conditional_jump());
        assert!(Opcode::Ja.is_branch());
        assert!(!Opcode::Icmp.is_branch());
    }

    #[test]
    fn test_lengths() {
        assert_eq!(Opcode::Iload.len(), 9);
        assert_eq!(Opcode::Dload.len(), 9);
        assert_eq!(Opcode::Sload.len(), 3);
        assert_eq!(Opcode::LoadCtxIvar.len(), 5);
        assert_eq!(Opcode::Ja.len(), 3);
        assert_eq!(Opcode::Iadd.len(), 1);
    }
}
