//! Type-annotation pass.
//!
//! Bottom-up over the AST: literals adopt their literal type, every other
//! node derives its result type from its children, and statements are
//! `void`. Errors are accumulated, not thrown; translation only proceeds on
//! a clean run. The pass also resolves `native` declarations against the
//! host's dynamic symbols, since a missing symbol is a program error of the
//! same kind as a type mismatch.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::parser::ast::{Ast, BinOp, Block, FuncId, Node, NodeId, ScopeId, StoreOp, UnaryOp};
use crate::parser::Type;

/// A single accumulated type error.
#[derive(Debug, Clone)]
pub struct TypeError {
    /// Byte offset of the offending node.
    pub pos: u32,
    /// Human-readable description.
    pub message: String,
}

/// All type errors of a run, reported as one comma-joined list.
#[derive(Debug, Clone)]
pub struct TypeErrors {
    /// The errors in discovery order; never empty.
    pub errors: Vec<TypeError>,
}

impl fmt::Display for TypeErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(&err.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for TypeErrors {}

impl TypeErrors {
    /// Position of the first error.
    pub fn first_pos(&self) -> Option<u32> {
        self.errors.first().map(|e| e.pos)
    }
}

/// Result of annotation: per-node types plus resolved native addresses.
#[derive(Debug, Default)]
pub struct TypeMap {
    types: Vec<Type>,
    /// Resolved `dlsym` addresses for native declarations.
    pub natives: FxHashMap<FuncId, usize>,
}

impl TypeMap {
    /// The annotated result type of a node.
    pub fn of(&self, node: NodeId) -> Type {
        self.types[node as usize]
    }
}

/// Annotate the whole program.
pub fn annotate(ast: &Ast) -> Result<TypeMap, TypeErrors> {
    let mut checker = Checker {
        ast,
        types: vec![Type::Void; ast.node_count as usize],
        natives: FxHashMap::default(),
        return_types: Vec::new(),
        errors: Vec::new(),
    };

    checker.visit_block(&ast.function(ast.top).body);

    if checker.errors.is_empty() {
        Ok(TypeMap {
            types: checker.types,
            natives: checker.natives,
        })
    } else {
        Err(TypeErrors {
            errors: checker.errors,
        })
    }
}

struct Checker<'a> {
    ast: &'a Ast,
    types: Vec<Type>,
    natives: FxHashMap<FuncId, usize>,
    return_types: Vec<Type>,
    errors: Vec<TypeError>,
}

impl Checker<'_> {
    fn error(&mut self, pos: u32, message: String) {
        self.errors.push(TypeError { pos, message });
    }

    fn mark(&mut self, node: NodeId, ty: Type) -> Type {
        self.types[node as usize] = ty;
        ty
    }

    fn visit_block(&mut self, block: &Block) {
        let scope = self.ast.scope(block.scope);
        for &func_id in &scope.funcs {
            if func_id == self.ast.top {
                continue;
            }
            let func = self.ast.function(func_id);
            if let Some(symbol) = &func.native {
                self.resolve_native(func_id, symbol, func.pos);
            } else {
                self.return_types.push(func.signature.ret);
                self.visit_block(&func.body);
                self.return_types.pop();
            }
        }
        for node in &block.nodes {
            self.visit_node(node, block.scope);
        }
    }

    fn visit_node(&mut self, node: &Node, scope: ScopeId) -> Type {
        match node {
            Node::IntLit { id, .. } => self.mark(*id, Type::Int),
            Node::DoubleLit { id, .. } => self.mark(*id, Type::Double),
            Node::StringLit { id, .. } => self.mark(*id, Type::String),
            Node::Load { id, var, .. } => self.mark(*id, self.ast.var(*var).ty),
            Node::Store {
                id,
                pos,
                var,
                op,
                value,
            } => {
                let value_type = self.visit_node(value, scope);
                let var_type = self.ast.var(*var).ty;
                self.check_assignable(value_type, var_type, *pos);
                if *op != StoreOp::Assign && var_type == Type::String {
                    self.error(*pos, "decr/incr on string".to_string());
                }
                self.mark(*id, Type::Void)
            }
            Node::Unary {
                id, op, operand, ..
            } => {
                let operand_type = self.visit_node(operand, scope);
                let result = match op {
                    UnaryOp::Not => Type::Int,
                    UnaryOp::Neg => self.lub(operand_type, Type::Int, node.pos()),
                };
                self.mark(*id, result)
            }
            Node::Binary {
                id,
                pos,
                op,
                left,
                right,
            } => {
                if *op == BinOp::Range {
                    self.error(*pos, "range operator outside a for loop".to_string());
                    self.visit_node(left, scope);
                    self.visit_node(right, scope);
                    return self.mark(*id, Type::Int);
                }

                let a = self.visit_node(left, scope);
                let b = self.visit_node(right, scope);
                let mut lub = self.lub(a, b, *pos);
                if lub == Type::String {
                    self.error(*pos, "bin op for string".to_string());
                }

                if op.is_comparison() || *op == BinOp::Mod {
                    lub = Type::Int;
                } else if matches!(
                    op,
                    BinOp::Or | BinOp::And | BinOp::Aor | BinOp::Aand | BinOp::Axor
                ) && lub != Type::Int
                {
                    self.error(*pos, format!("logic operation for {}", lub));
                }

                self.mark(*id, lub)
            }
            Node::BlockStmt(block) => {
                self.visit_block(block);
                self.mark(block.id, Type::Void)
            }
            Node::If {
                id,
                pos,
                cond,
                then_block,
                else_block,
            } => {
                let cond_type = self.visit_node(cond, scope);
                self.check_assignable(cond_type, Type::Int, *pos);
                self.visit_block(then_block);
                if let Some(else_block) = else_block {
                    self.visit_block(else_block);
                }
                self.mark(*id, Type::Void)
            }
            Node::While {
                id,
                pos,
                cond,
                body,
            } => {
                let cond_type = self.visit_node(cond, scope);
                self.check_assignable(cond_type, Type::Int, *pos);
                self.visit_block(body);
                self.mark(*id, Type::Void)
            }
            Node::For {
                id,
                pos,
                var,
                in_expr,
                body,
            } => {
                match var {
                    None => self.error(*pos, "undeclared var in for".to_string()),
                    Some(var) => {
                        if self.ast.var(*var).ty != Type::Int {
                            self.error(*pos, "type of iterable should be int".to_string());
                        }
                    }
                }
                match in_expr.as_ref() {
                    Node::Binary {
                        op: BinOp::Range,
                        left,
                        right,
                        ..
                    } => {
                        // The range node itself is never typed; its endpoints
                        // must fit an int.
                        let lo = self.visit_node(left, scope);
                        let hi = self.visit_node(right, scope);
                        self.check_assignable(lo, Type::Int, *pos);
                        self.check_assignable(hi, Type::Int, *pos);
                    }
                    _ => self.error(*pos, "in expression should be a range".to_string()),
                }
                self.visit_block(body);
                self.mark(*id, Type::Void)
            }
            Node::Return { id, pos, value } => {
                let value_type = match value {
                    Some(value) => self.visit_node(value, scope),
                    None => Type::Void,
                };
                // Return at top level is permitted and implicit.
                if let Some(&expected) = self.return_types.last() {
                    self.check_assignable(value_type, expected, *pos);
                }
                self.mark(*id, Type::Void)
            }
            Node::Call {
                id,
                pos,
                name,
                args,
            } => {
                let arg_types: Vec<Type> =
                    args.iter().map(|arg| self.visit_node(arg, scope)).collect();

                let Some(callee) = self.ast.lookup_function(scope, name) else {
                    self.error(*pos, format!("undefined function {}", name));
                    return self.mark(*id, Type::Int);
                };
                let signature = self.ast.function(callee).signature.clone();

                if args.len() != signature.params.len() {
                    self.error(*pos, format!("wrong args number for {}", name));
                } else {
                    for (arg_type, param) in arg_types.iter().zip(&signature.params) {
                        self.check_assignable(*arg_type, param.ty, *pos);
                    }
                }
                self.mark(*id, signature.ret)
            }
            Node::Print { id, pos, operands } => {
                for operand in operands {
                    let ty = self.visit_node(operand, scope);
                    if ty == Type::Void {
                        self.error(*pos, "printing void".to_string());
                    }
                }
                self.mark(*id, Type::Void)
            }
        }
    }

    /// Pairwise least upper bound: `T ⊔ T = T`, `Int ⊔ Double = Double`.
    fn lub(&mut self, a: Type, b: Type, pos: u32) -> Type {
        if a == b {
            return a;
        }
        if a == Type::Void || b == Type::Void {
            self.error(pos, format!("no common type for {} and {}", a, b));
            return Type::Int;
        }
        if a == Type::Double || b == Type::Double {
            return Type::Double;
        }
        Type::Int
    }

    /// Identical types, anything into void (dropped), numeric widen/narrow;
    /// nothing converts to string, and void converts to nothing.
    fn check_assignable(&mut self, from: Type, to: Type, pos: u32) {
        if from == to || to == Type::Void {
            return;
        }
        if to == Type::String || from == Type::Void {
            self.error(pos, format!("no conversion from {} to {}", from, to));
        }
    }

    #[cfg(unix)]
    fn resolve_native(&mut self, func: FuncId, symbol: &str, pos: u32) {
        let Ok(cname) = std::ffi::CString::new(symbol) else {
            self.error(pos, format!("native {} not found", symbol));
            return;
        };
        let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        if address.is_null() {
            self.error(pos, format!("native {} not found", symbol));
        } else {
            self.natives.insert(func, address as usize);
        }
    }

    #[cfg(not(unix))]
    fn resolve_native(&mut self, _func: FuncId, symbol: &str, pos: u32) {
        self.error(pos, format!("native {} not supported on this host", symbol));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn annotate_source(source: &str) -> Result<(Ast, TypeMap), TypeErrors> {
        let ast = Parser::new(source).unwrap().parse().unwrap();
        annotate(&ast).map(|types| (ast, types))
    }

    fn first_error(source: &str) -> String {
        annotate_source(source).unwrap_err().errors[0].message.clone()
    }

    #[test]
    fn test_literals_and_lub() {
        let (ast, types) = annotate_source("double a; a = 2 + 0.5;").unwrap();
        let top = ast.function(ast.top);
        let Node::Store { value, .. } = &top.body.nodes[0] else {
            panic!("expected store");
        };
        assert_eq!(types.of(value.id()), Type::Double);
    }

    #[test]
    fn test_comparison_is_int() {
        let (ast, types) = annotate_source("int x; x = 1.5 < 2.5;").unwrap();
        let top = ast.function(ast.top);
        let Node::Store { value, .. } = &top.body.nodes[0] else {
            panic!("expected store");
        };
        assert_eq!(types.of(value.id()), Type::Int);
    }

    #[test]
    fn test_string_arithmetic_rejected() {
        assert_eq!(first_error("string s; s = 'a'; print(s + 'b');"), "bin op for string");
    }

    #[test]
    fn test_logical_requires_int() {
        assert!(first_error("print(1.5 && 1);").contains("logic operation"));
    }

    #[test]
    fn test_no_conversion_to_string() {
        assert!(first_error("string s; s = 1;").contains("no conversion"));
    }

    #[test]
    fn test_printing_void() {
        assert_eq!(
            first_error("function void f() { return; } print(f());"),
            "printing void"
        );
    }

    #[test]
    fn test_for_variable_must_be_int() {
        assert_eq!(
            first_error("double d; for (d in 0..3) { print(1); }"),
            "type of iterable should be int"
        );
    }

    #[test]
    fn test_range_outside_for() {
        assert!(first_error("print(0..3);").contains("range operator"));
    }

    #[test]
    fn test_errors_accumulate() {
        let errors = annotate_source("string s; s = 1; print(0..1);").unwrap_err();
        assert!(errors.errors.len() >= 2);
        let joined = errors.to_string();
        assert!(joined.contains(','));
    }

    #[test]
    fn test_return_type_checked() {
        // String narrows to int via S2I, so that direction is fine; nothing
        // converts to string.
        annotate_source("function int f() { string s; s = 'x'; return s; } print(f());").unwrap();
        assert!(first_error("function string f() { return 1; } print(f());")
            .contains("no conversion"));
    }

    #[test]
    fn test_wrong_arg_count() {
        assert!(first_error("function int f(int a) { return a; } print(f(1, 2));")
            .contains("wrong args number"));
    }

    #[cfg(unix)]
    #[test]
    fn test_native_missing_symbol() {
        assert!(first_error("function double f(double x) native 'definitely_not_a_symbol_42';")
            .contains("not found"));
    }
}
