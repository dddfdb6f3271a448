//! Bytecode disassembler for the CLI's translate-only mode.

use std::io::{self, Write};

use super::code::{BytecodeFunction, Code};
use super::opcode::Opcode;

/// Disassemble every function in `code`.
pub fn disassemble(code: &Code, out: &mut dyn Write) -> io::Result<()> {
    for function in code.functions() {
        let signature = function.signature();
        write!(
            out,
            "function [{}] {} {}(",
            function.id(),
            signature.ret,
            function.name()
        )?;
        for (i, param) in signature.params.iter().enumerate() {
            if i > 0 {
                write!(out, ", ")?;
            }
            write!(out, "{}", param.ty)?;
        }
        writeln!(out, ")")?;
        writeln!(out, "locals: {}", function.locals_number())?;
        disassemble_function(function, code, out)?;
    }
    Ok(())
}

/// Disassemble a single function's byte stream.
pub fn disassemble_function(
    function: &BytecodeFunction,
    code: &Code,
    out: &mut dyn Write,
) -> io::Result<()> {
    let bc = &function.bytecode;
    let mut bci = 0u32;
    while bci < bc.len() {
        let Some(insn) = Opcode::from_u8(bc.get(bci)) else {
            writeln!(out, "{}: <bad opcode {:#04x}>", bci, bc.get(bci))?;
            bci += 1;
            continue;
        };
        write!(out, "{}: {}", bci, insn.name())?;
        match insn {
            Opcode::Dload => write!(out, " {}", bc.get_f64(bci + 1))?,
            Opcode::Iload => write!(out, " {}", bc.get_i64(bci + 1))?,
            Opcode::Sload => write!(
                out,
                " @{} '{}'",
                bc.get_u16(bci + 1),
                code.constant_by_id(bc.get_u16(bci + 1)).escape_default()
            )?,
            Opcode::Call | Opcode::CallNative => write!(out, " *{}", bc.get_u16(bci + 1))?,
            Opcode::LoadDvar
            | Opcode::LoadIvar
            | Opcode::LoadSvar
            | Opcode::StoreDvar
            | Opcode::StoreIvar
            | Opcode::StoreSvar => write!(out, " @{}", bc.get_u16(bci + 1))?,
            Opcode::LoadCtxDvar
            | Opcode::LoadCtxIvar
            | Opcode::LoadCtxSvar
            | Opcode::StoreCtxDvar
            | Opcode::StoreCtxIvar
            | Opcode::StoreCtxSvar => write!(
                out,
                " @{}:{}",
                bc.get_u16(bci + 1),
                bc.get_u16(bci + 3)
            )?,
            _ if insn.is_branch() => {
                // Offsets are relative to the slot after the opcode; show the
                // absolute target.
                let target = bci as i64 + 1 + bc.get_i16(bci + 1) as i64;
                write!(out, " {}", target)?;
            }
            _ => {}
        }
        writeln!(out)?;
        bci += insn.len() as u32;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::Signature;
    use crate::parser::Type;

    #[test]
    fn test_disassemble_simple_stream() {
        let mut code = Code::new();
        let id = code.add_function(
            "<top>",
            Signature {
                ret: Type::Void,
                params: Vec::new(),
            },
        );
        {
            let bc = &mut code.function_by_id_mut(id).bytecode;
            bc.add_insn(Opcode::Iload);
            bc.add_i64(14);
            bc.add_insn(Opcode::StoreIvar0);
            bc.add_insn(Opcode::LoadIvar0);
            bc.add_insn(Opcode::Iprint);
            bc.add_insn(Opcode::Return);
        }

        let mut out = Vec::new();
        disassemble(&code, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("function [0] void <top>()"));
        assert!(text.contains("0: ILOAD 14"));
        assert!(text.contains("9: STOREIVAR0"));
        assert!(text.contains("11: IPRINT"));
    }

    #[test]
    fn test_disassemble_branch_target() {
        let mut code = Code::new();
        let id = code.add_function(
            "<top>",
            Signature {
                ret: Type::Void,
                params: Vec::new(),
            },
        );
        {
            let bc = &mut code.function_by_id_mut(id).bytecode;
            let mut end = crate::compiler::Label::new();
            bc.add_insn(Opcode::Iload0);
            bc.add_insn(Opcode::Iload0);
            bc.add_branch(Opcode::IfIcmpE, &mut end).unwrap();
            bc.add_insn(Opcode::Iload1);
            bc.bind(&mut end).unwrap();
            bc.add_insn(Opcode::Return);
        }

        let mut out = Vec::new();
        disassemble(&code, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        // The IFICMPE at offset 2 targets offset 6.
        assert!(text.contains("2: IFICMPE 6"));
    }
}
