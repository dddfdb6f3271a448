//! Expression lowering: literals, variable access, operators, and calls.

use super::Translator;
use crate::compiler::bytecode::{Label, Opcode};
use crate::compiler::TranslateError;
use crate::parser::ast::{BinOp, Node, StoreOp, UnaryOp};
use crate::parser::Type;

impl Translator<'_> {
    pub(super) fn gen_int_literal(&mut self, value: i64) -> Result<Type, TranslateError> {
        match value {
            -1 => self.emit(Opcode::IloadM1),
            0 => self.emit(Opcode::Iload0),
            1 => self.emit(Opcode::Iload1),
            _ => {
                self.emit(Opcode::Iload);
                self.bc().add_i64(value);
            }
        }
        Ok(Type::Int)
    }

    pub(super) fn gen_double_literal(&mut self, value: f64) -> Result<Type, TranslateError> {
        if value == -1.0 {
            self.emit(Opcode::DloadM1);
        } else if value == 0.0 {
            self.emit(Opcode::Dload0);
        } else if value == 1.0 {
            self.emit(Opcode::Dload1);
        } else {
            self.emit(Opcode::Dload);
            self.bc().add_f64(value);
        }
        Ok(Type::Double)
    }

    pub(super) fn gen_string_literal(&mut self, value: &str) -> Result<Type, TranslateError> {
        if value.is_empty() {
            self.emit(Opcode::Sload0);
        } else {
            let id = self.code.intern_string(value);
            self.emit(Opcode::Sload);
            self.bc().add_u16(id);
        }
        Ok(Type::String)
    }

    pub(super) fn gen_expr(&mut self, node: &Node) -> Result<(), TranslateError> {
        match node {
            Node::Load { var, .. } => self.emit_var_access(*var, true),
            Node::Store { var, op, value, .. } => {
                let var_type = self.ast.var(*var).ty;
                if *op == StoreOp::Assign {
                    self.gen(value, var_type)?;
                } else {
                    // value below, current variable value on top; SUB takes
                    // upper minus lower, so this computes var - value.
                    self.gen(value, var_type)?;
                    self.emit_var_access(*var, true)?;
                    let insn = match op {
                        StoreOp::IncrSet => {
                            self.choose_insn(var_type, Opcode::Iadd, Opcode::Dadd)?
                        }
                        _ => self.choose_insn(var_type, Opcode::Isub, Opcode::Dsub)?,
                    };
                    self.emit(insn);
                }
                self.emit_var_access(*var, false)
            }
            Node::Unary { op, operand, .. } => {
                let ty = self.types.of(node.id());
                self.gen(operand, ty)?;
                match op {
                    UnaryOp::Not => {
                        // Lowered arithmetically: (cmp(x, 0) ^ -1) & 1.
                        self.emit(Opcode::Iload0);
                        self.emit(Opcode::Icmp);
                        self.emit(Opcode::Iload);
                        self.bc().add_i64(!0);
                        self.emit(Opcode::Iaxor);
                        self.emit(Opcode::Iload1);
                        self.emit(Opcode::Iaand);
                    }
                    UnaryOp::Neg => {
                        let insn = self.choose_insn(ty, Opcode::Ineg, Opcode::Dneg)?;
                        self.emit(insn);
                    }
                }
                Ok(())
            }
            Node::Binary {
                op, left, right, ..
            } => {
                if op.is_comparison() {
                    return self.gen_comparison(*op, left, right);
                }
                if matches!(op, BinOp::Or | BinOp::And) {
                    return self.gen_logical(*op, left, right, self.types.of(node.id()));
                }

                let result_type = self.types.of(node.id());
                // Right first, so the upper stack value is the left operand.
                self.gen(right, result_type)?;
                self.gen(left, result_type)?;

                let insn = match op {
                    BinOp::Mul => self.choose_insn(result_type, Opcode::Imul, Opcode::Dmul)?,
                    BinOp::Add => self.choose_insn(result_type, Opcode::Iadd, Opcode::Dadd)?,
                    BinOp::Sub => self.choose_insn(result_type, Opcode::Isub, Opcode::Dsub)?,
                    BinOp::Div => self.choose_insn(result_type, Opcode::Idiv, Opcode::Ddiv)?,
                    BinOp::Aor => Opcode::Iaor,
                    BinOp::Aand => Opcode::Iaand,
                    BinOp::Axor => Opcode::Iaxor,
                    BinOp::Mod => Opcode::Imod,
                    _ => return Err(TranslateError::Internal("unexpected binary operator")),
                };
                self.emit(insn);
                Ok(())
            }
            _ => Err(TranslateError::Internal("unexpected expression node")),
        }
    }

    /// `A ⊙ B` compiles to a comparator push and a conditional over it.
    ///
    /// The comparator sees the left operand as the upper stack value and the
    /// emitted `IFICMP` compares `cmp(upper, lower)` against 0, so the
    /// predicate is inverted: `<` becomes `IFICMPG`, and so on.
    fn gen_comparison(
        &mut self,
        op: BinOp,
        left: &Node,
        right: &Node,
    ) -> Result<(), TranslateError> {
        let lub = if self.types.of(left.id()) == Type::Double
            || self.types.of(right.id()) == Type::Double
        {
            Type::Double
        } else {
            Type::Int
        };

        self.gen(right, lub)?;
        self.gen(left, lub)?;
        self.emit(if lub == Type::Double {
            Opcode::Dcmp
        } else {
            Opcode::Icmp
        });
        self.emit(Opcode::Iload0);

        let insn = match op {
            BinOp::Eq => Opcode::IfIcmpE,
            BinOp::Neq => Opcode::IfIcmpNe,
            BinOp::Gt => Opcode::IfIcmpL,
            BinOp::Lt => Opcode::IfIcmpG,
            BinOp::Ge => Opcode::IfIcmpLe,
            BinOp::Le => Opcode::IfIcmpGe,
            _ => return Err(TranslateError::Internal("unexpected comparison operator")),
        };

        let mut success = Label::new();
        let mut after = Label::new();
        self.emit_branch(insn, &mut success)?;
        self.emit(Opcode::Iload0);
        self.emit_branch(Opcode::Ja, &mut after)?;
        self.bind(&mut success)?;
        self.emit(Opcode::Iload1);
        self.bind(&mut after)
    }

    /// Short-circuit `||` / `&&`.
    fn gen_logical(
        &mut self,
        op: BinOp,
        left: &Node,
        right: &Node,
        result_type: Type,
    ) -> Result<(), TranslateError> {
        self.gen(left, result_type)?;
        self.emit(Opcode::Iload0);

        let cmp_insn = if op == BinOp::Or {
            Opcode::IfIcmpNe
        } else {
            Opcode::IfIcmpE
        };
        let mut short_circuit = Label::new();
        self.emit_branch(cmp_insn, &mut short_circuit)?;

        self.gen(right, result_type)?;
        let mut after = Label::new();
        self.emit_branch(Opcode::Ja, &mut after)?;

        self.bind(&mut short_circuit)?;
        self.emit(if op == BinOp::Or {
            Opcode::Iload1
        } else {
            Opcode::Iload0
        });
        self.bind(&mut after)
    }

    pub(super) fn gen_call(&mut self, node: &Node) -> Result<(), TranslateError> {
        let Node::Call { id, args, name, .. } = node else {
            return Err(TranslateError::Internal("gen_call on a non-call node"));
        };
        let callee = self
            .analysis
            .call_target(*id)
            .ok_or_else(|| TranslateError::UndefinedSymbol(name.clone()))?;
        let signature = self.ast.function(callee).signature.clone();

        for (arg, param) in args.iter().zip(&signature.params) {
            self.gen(arg, param.ty)?;
        }

        if self.ast.function(callee).is_native() {
            let native = self.native_id(callee)?;
            self.emit(Opcode::CallNative);
            self.bc().add_u16(native);
        } else if !self.analysis.can_inline(callee) {
            let function = self.analysis.bytecode_id(callee);
            self.emit(Opcode::Call);
            self.bc().add_u16(function);
        } else {
            self.inline_call(callee)?;
        }
        Ok(())
    }

    /// Splice a non-recursive, closure-free callee into the caller.
    ///
    /// Parameters become fresh caller locals, filled from the stack in
    /// reverse order; `return` inside the body jumps to the end label.
    fn inline_call(
        &mut self,
        callee: crate::parser::ast::FuncId,
    ) -> Result<(), TranslateError> {
        let data = self.ast.function(callee);
        let param_vars = data.param_vars.clone();
        let ret = data.signature.ret;

        self.push_inline_context(ret);

        for &param in &param_vars {
            self.push_var(param)?;
        }
        for &param in param_vars.iter().rev() {
            self.emit_var_access(param, false)?;
        }

        let body = &self.ast.function(callee).body;
        self.visit_block(body)?;

        for &param in &param_vars {
            self.pop_var(param);
        }

        self.finish_inline_context()
    }
}
