//! Source printer: regenerates MathVM source text from an [`Ast`].
//!
//! Output is canonical rather than faithful to the input layout: scope
//! variables are listed at the top of their block, every binary and unary
//! expression is parenthesized, and indentation uses tabs.

use std::fmt::Write;

use crate::parser::ast::{Ast, AstFunction, Block, Node, StoreOp, UnaryOp};

/// Render the whole program as source text.
pub fn print_ast(ast: &Ast) -> String {
    let mut printer = AstPrinter {
        ast,
        out: String::new(),
        tabs: 0,
    };
    let top = ast.function(ast.top);
    printer.print_block_contents(&top.body);
    printer.out
}

struct AstPrinter<'a> {
    ast: &'a Ast,
    out: String,
    tabs: usize,
}

impl AstPrinter<'_> {
    fn append_tabs(&mut self) {
        for _ in 0..self.tabs {
            self.out.push('\t');
        }
    }

    fn print_block(&mut self, block: &Block) {
        self.out.push_str(" {\n");
        self.tabs += 1;
        self.print_block_contents(block);
        self.tabs -= 1;
        self.append_tabs();
        self.out.push('}');
    }

    fn print_block_contents(&mut self, block: &Block) {
        let scope = self.ast.scope(block.scope);
        for &var_id in &scope.vars {
            let var = self.ast.var(var_id);
            self.append_tabs();
            let _ = writeln!(self.out, "{} {};", var.ty, var.name);
        }
        for &func_id in &scope.funcs {
            if func_id != self.ast.top {
                self.print_function(self.ast.function(func_id));
            }
        }
        for node in &block.nodes {
            self.append_tabs();
            self.print_node(node);
            if matches!(node, Node::Call { .. }) {
                self.out.push(';');
            }
            self.out.push('\n');
        }
    }

    fn print_function(&mut self, func: &AstFunction) {
        self.append_tabs();
        let _ = write!(self.out, "function {} {}(", func.signature.ret, func.name);
        for (i, param) in func.signature.params.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            let _ = write!(self.out, "{} {}", param.ty, param.name);
        }
        self.out.push(')');

        if let Some(symbol) = &func.native {
            let _ = writeln!(self.out, " native '{}';", symbol);
        } else {
            self.print_block(&func.body);
            self.out.push('\n');
        }
    }

    fn print_node(&mut self, node: &Node) {
        match node {
            Node::IntLit { value, .. } => {
                let _ = write!(self.out, "{}", value);
            }
            Node::DoubleLit { value, .. } => {
                // Keep a decimal point so the literal re-parses as a double.
                if value.fract() == 0.0 && value.is_finite() {
                    let _ = write!(self.out, "{:.1}", value);
                } else {
                    let _ = write!(self.out, "{}", value);
                }
            }
            Node::StringLit { value, .. } => {
                let _ = write!(self.out, "'{}'", escape_string(value));
            }
            Node::Load { var, .. } => {
                self.out.push_str(&self.ast.var(*var).name.clone());
            }
            Node::Store { var, op, value, .. } => {
                let op = match op {
                    StoreOp::Assign => "=",
                    StoreOp::IncrSet => "+=",
                    StoreOp::DecrSet => "-=",
                };
                let _ = write!(self.out, "{} {} ", self.ast.var(*var).name, op);
                self.print_node(value);
                self.out.push(';');
            }
            Node::Unary { op, operand, .. } => {
                self.out.push('(');
                self.out.push_str(match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                });
                self.print_node(operand);
                self.out.push(')');
            }
            Node::Binary { op, left, right, .. } => {
                self.out.push('(');
                self.print_node(left);
                self.out.push_str(op.symbol());
                self.print_node(right);
                self.out.push(')');
            }
            Node::BlockStmt(block) => {
                self.print_block(block);
            }
            Node::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.out.push_str("if (");
                self.print_node(cond);
                self.out.push(')');
                self.print_block(then_block);
                if let Some(else_block) = else_block {
                    self.out.push_str(" else");
                    self.print_block(else_block);
                }
            }
            Node::While { cond, body, .. } => {
                self.out.push_str("while (");
                self.print_node(cond);
                self.out.push(')');
                self.print_block(body);
            }
            Node::For {
                var,
                in_expr,
                body,
                ..
            } => {
                let name = var
                    .map(|v| self.ast.var(v).name.clone())
                    .unwrap_or_else(|| "<undeclared>".to_string());
                let _ = write!(self.out, "for ({} in ", name);
                self.print_node(in_expr);
                self.out.push(')');
                self.print_block(body);
            }
            Node::Return { value, .. } => {
                if let Some(value) = value {
                    self.out.push_str("return ");
                    self.print_node(value);
                    self.out.push(';');
                } else {
                    self.out.push_str("return;");
                }
            }
            Node::Call { name, args, .. } => {
                let _ = write!(self.out, "{}(", name);
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.print_node(arg);
                }
                self.out.push(')');
            }
            Node::Print { operands, .. } => {
                self.out.push_str("print(");
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.print_node(operand);
                }
                self.out.push_str(");");
            }
        }
    }
}

fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\r' => result.push_str("\\r"),
            '\\' => result.push_str("\\\\"),
            '\'' => result.push_str("\\'"),
            _ => result.push(ch),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parser::Parser;

    fn roundtrip(source: &str) -> String {
        let ast = Parser::new(source).unwrap().parse().unwrap();
        print_ast(&ast)
    }

    #[test]
    fn test_print_reparses() {
        let printed = roundtrip(
            "int x; x = 2 + 3 * 4; if (x > 10) { print(x, '\\n'); } else { print('small'); }",
        );
        // The printed text must itself be a valid program.
        let ast = Parser::new(&printed).unwrap().parse().unwrap();
        assert_eq!(print_ast(&ast), printed);
    }

    #[test]
    fn test_print_function_and_native() {
        let printed = roundtrip(
            "function double half(double d) { return d / 2.0; } \
             function double sqrt(double x) native 'sqrt'; \
             print(half(3.0));",
        );
        assert!(printed.contains("function double half(double d)"));
        assert!(printed.contains("native 'sqrt';"));
        assert!(printed.contains("(d/2.0)"));
    }

    #[test]
    fn test_string_escapes_roundtrip() {
        let printed = roundtrip("print('a\\n\\'b\\\\');");
        assert!(printed.contains("'a\\n\\'b\\\\'"));
    }
}
