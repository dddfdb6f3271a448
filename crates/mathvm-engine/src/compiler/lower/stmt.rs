//! Statement lowering: blocks, control flow, `return`, and `print`.

use super::Translator;
use crate::compiler::bytecode::{Label, Opcode};
use crate::compiler::TranslateError;
use crate::parser::ast::{BinOp, Block, Node};
use crate::parser::Type;

impl Translator<'_> {
    pub(super) fn visit_block(&mut self, block: &Block) -> Result<(), TranslateError> {
        self.push_scope(block.scope)?;

        let funcs = self.ast.scope(block.scope).funcs.clone();
        for func in funcs {
            if func != self.ast.top {
                self.process_function(func)?;
            }
        }

        for node in &block.nodes {
            self.gen(node, Type::Void)?;
        }

        self.pop_scope(block.scope);
        Ok(())
    }

    pub(super) fn gen_stmt(&mut self, node: &Node) -> Result<(), TranslateError> {
        match node {
            Node::BlockStmt(block) => self.visit_block(block),
            Node::If {
                cond,
                then_block,
                else_block,
                ..
            } => self.gen_if(cond, then_block, else_block.as_ref()),
            Node::While { cond, body, .. } => self.gen_while(cond, body),
            Node::For {
                var, in_expr, body, ..
            } => self.gen_for(*var, in_expr, body),
            Node::Return { value, .. } => self.gen_return(value.as_deref()),
            Node::Print { operands, .. } => self.gen_print(operands),
            _ => Err(TranslateError::Internal("unexpected statement node")),
        }
    }

    fn gen_if(
        &mut self,
        cond: &Node,
        then_block: &Block,
        else_block: Option<&Block>,
    ) -> Result<(), TranslateError> {
        let mut unless = Label::new();

        self.gen(cond, Type::Int)?;
        self.emit(Opcode::Iload0);
        self.emit_branch(Opcode::IfIcmpE, &mut unless)?;

        self.visit_block(then_block)?;

        match else_block {
            Some(else_block) => {
                let mut after_else = Label::new();
                self.emit_branch(Opcode::Ja, &mut after_else)?;
                self.bind(&mut unless)?;
                self.visit_block(else_block)?;
                self.bind(&mut after_else)
            }
            None => self.bind(&mut unless),
        }
    }

    fn gen_while(&mut self, cond: &Node, body: &Block) -> Result<(), TranslateError> {
        let mut begin = self.bc().current_label();
        let mut end = Label::new();

        self.gen(cond, Type::Int)?;
        self.emit(Opcode::Iload0);
        self.emit_branch(Opcode::IfIcmpE, &mut end)?;

        self.visit_block(body)?;

        self.emit_branch(Opcode::Ja, &mut begin)?;
        self.bind(&mut end)
    }

    /// Desugars to `var := lo; temp := hi; loop: if var > temp goto end;
    /// body; var += 1; goto loop; end:` — the upper bound is inclusive.
    fn gen_for(
        &mut self,
        var: Option<crate::parser::ast::VarId>,
        in_expr: &Node,
        body: &Block,
    ) -> Result<(), TranslateError> {
        let var = var.ok_or(TranslateError::Internal("unresolved for variable"))?;
        let Node::Binary {
            op: BinOp::Range,
            left: lo,
            right: hi,
            ..
        } = in_expr
        else {
            return Err(TranslateError::Internal("for over a non-range"));
        };
        let var_type = self.ast.var(var).ty;

        self.gen(lo, var_type)?;
        self.emit_var_access(var, false)?;

        // Synthetic loop-bound temporary; lives until the frame ends.
        let temp = self.alloc_slot()?;
        self.gen(hi, Type::Int)?;
        self.emit_local_slot(Type::Int, temp, false)?;

        let mut begin = self.bc().current_label();
        let mut end = Label::new();

        self.emit_local_slot(Type::Int, temp, true)?;
        self.emit_var_access(var, true)?;
        self.emit_branch(Opcode::IfIcmpG, &mut end)?;

        self.visit_block(body)?;

        // var += 1
        self.emit(Opcode::Iload1);
        self.emit_var_access(var, true)?;
        self.emit(Opcode::Iadd);
        self.emit_var_access(var, false)?;

        self.emit_branch(Opcode::Ja, &mut begin)?;
        self.bind(&mut end)
    }

    fn gen_return(&mut self, value: Option<&Node>) -> Result<(), TranslateError> {
        let ret = self.return_type();
        if let Some(value) = value {
            self.gen(value, ret)?;
        }
        if self.in_inlining() {
            self.emit_inline_return()
        } else {
            self.emit(Opcode::Return);
            Ok(())
        }
    }

    fn gen_print(&mut self, operands: &[Node]) -> Result<(), TranslateError> {
        for operand in operands {
            let ty = self.gen_node(operand)?;
            let insn = match ty {
                Type::Int => Opcode::Iprint,
                Type::Double => Opcode::Dprint,
                Type::String => Opcode::Sprint,
                Type::Void => return Err(TranslateError::Internal("printing void")),
            };
            self.emit(insn);
        }
        Ok(())
    }
}
