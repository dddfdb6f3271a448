//! Function-analysis pass.
//!
//! A pre-pass over the AST that registers a [`BytecodeFunction`] shell for
//! every non-native function (ids assigned in lexical walk order, the top
//! level first), resolves every call site, builds the call graph, and
//! computes per-function recursion by self-reachability.
//!
//! It also computes two closure facts that gate inlining: whether a function
//! reads variables owned by an enclosing function, and whether any nested
//! function reads variables this one owns. Inlining such a callee would
//! bypass the frame-of-last-call bookkeeping both engines rely on for
//! closure access, so those calls stay real calls.
//!
//! [`BytecodeFunction`]: crate::compiler::bytecode::BytecodeFunction

use rustc_hash::FxHashMap;

use crate::compiler::bytecode::Code;
use crate::compiler::TranslateError;
use crate::parser::ast::{Ast, Block, FuncId, Node, NodeId, ScopeId, VarId, TOP_NAME};

/// Per-function facts the translator consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionInfo {
    /// Assigned bytecode function id (non-native functions only).
    pub id: u16,
    /// Takes part in a call cycle, directly or indirectly.
    pub is_recursive: bool,
    /// Reads or writes variables owned by an enclosing function.
    pub reads_outer: bool,
    /// Some nested function reads or writes variables this function owns.
    pub locals_captured: bool,
}

/// Output of [`analyze`].
#[derive(Debug, Default)]
pub struct FunctionAnalysis {
    infos: Vec<Option<FunctionInfo>>,
    call_targets: FxHashMap<NodeId, FuncId>,
}

impl FunctionAnalysis {
    /// Facts for a non-native function.
    pub fn info(&self, func: FuncId) -> &FunctionInfo {
        self.infos[func.0 as usize]
            .as_ref()
            .expect("native functions have no analysis info")
    }

    /// The bytecode id assigned to a non-native function.
    pub fn bytecode_id(&self, func: FuncId) -> u16 {
        self.info(func).id
    }

    /// Whether a call to `func` may be inlined into its caller.
    pub fn can_inline(&self, func: FuncId) -> bool {
        let info = self.info(func);
        !info.is_recursive && !info.reads_outer && !info.locals_captured
    }

    /// The function a call node resolved to.
    pub fn call_target(&self, node: NodeId) -> Option<FuncId> {
        self.call_targets.get(&node).copied()
    }
}

/// Run the pass, registering function shells into `code`.
pub fn analyze(ast: &Ast, code: &mut Code) -> Result<FunctionAnalysis, TranslateError> {
    let mut analyzer = Analyzer {
        ast,
        code,
        infos: vec![None; ast.functions.len()],
        var_owner: vec![None; ast.vars.len()],
        calls: Vec::new(),
        call_targets: FxHashMap::default(),
        stack: Vec::new(),
    };

    analyzer.add_function(ast.top, TOP_NAME);
    analyzer.process_function(ast.top)?;

    let recursive = find_recursive(&analyzer.calls);
    let mut infos = analyzer.infos;
    for info in infos.iter_mut().flatten() {
        info.is_recursive = recursive[info.id as usize];
    }

    Ok(FunctionAnalysis {
        infos,
        call_targets: analyzer.call_targets,
    })
}

struct Analyzer<'a> {
    ast: &'a Ast,
    code: &'a mut Code,
    infos: Vec<Option<FunctionInfo>>,
    var_owner: Vec<Option<FuncId>>,
    /// Adjacency list over bytecode ids.
    calls: Vec<Vec<u16>>,
    call_targets: FxHashMap<NodeId, FuncId>,
    stack: Vec<FuncId>,
}

impl Analyzer<'_> {
    fn add_function(&mut self, func: FuncId, name: &str) {
        let signature = self.ast.function(func).signature.clone();
        let id = self.code.add_function(name, signature);
        self.infos[func.0 as usize] = Some(FunctionInfo {
            id,
            ..FunctionInfo::default()
        });
        if self.calls.len() <= id as usize {
            self.calls.resize(id as usize + 1, Vec::new());
        }
    }

    fn process_function(&mut self, func: FuncId) -> Result<(), TranslateError> {
        let data = self.ast.function(func);
        if data.is_native() {
            return Ok(());
        }

        self.stack.push(func);
        for &param in &data.param_vars {
            self.var_owner[param.0 as usize] = Some(func);
        }
        self.visit_block(&data.body)?;
        self.stack.pop();
        Ok(())
    }

    fn visit_block(&mut self, block: &Block) -> Result<(), TranslateError> {
        let current = *self.stack.last().expect("function stack");
        let scope = self.ast.scope(block.scope);

        for &var in &scope.vars {
            self.var_owner[var.0 as usize] = Some(current);
        }
        // Shells for every function of this scope are registered before any
        // of their bodies are walked, so sibling ids come out in declaration
        // order.
        for &func in &scope.funcs {
            if func != self.ast.top && !self.ast.function(func).is_native() {
                let name = self.ast.function(func).name.clone();
                self.add_function(func, &name);
            }
        }
        for &func in &scope.funcs {
            if func != self.ast.top {
                self.process_function(func)?;
            }
        }

        for node in &block.nodes {
            self.visit_node(node, block.scope)?;
        }
        Ok(())
    }

    fn visit_node(&mut self, node: &Node, scope: ScopeId) -> Result<(), TranslateError> {
        match node {
            Node::IntLit { .. } | Node::DoubleLit { .. } | Node::StringLit { .. } => {}
            Node::Load { var, .. } => self.note_var_use(*var),
            Node::Store { var, value, .. } => {
                self.note_var_use(*var);
                self.visit_node(value, scope)?;
            }
            Node::Unary { operand, .. } => self.visit_node(operand, scope)?,
            Node::Binary { left, right, .. } => {
                self.visit_node(left, scope)?;
                self.visit_node(right, scope)?;
            }
            Node::BlockStmt(block) => self.visit_block(block)?,
            Node::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.visit_node(cond, scope)?;
                self.visit_block(then_block)?;
                if let Some(else_block) = else_block {
                    self.visit_block(else_block)?;
                }
            }
            Node::While { cond, body, .. } => {
                self.visit_node(cond, scope)?;
                self.visit_block(body)?;
            }
            Node::For {
                var,
                in_expr,
                body,
                ..
            } => {
                if let Some(var) = var {
                    self.note_var_use(*var);
                }
                self.visit_node(in_expr, scope)?;
                self.visit_block(body)?;
            }
            Node::Return { value, .. } => {
                if let Some(value) = value {
                    self.visit_node(value, scope)?;
                }
            }
            Node::Call { id, name, args, .. } => {
                let callee = self
                    .ast
                    .lookup_function(scope, name)
                    .ok_or_else(|| TranslateError::UndefinedSymbol(name.clone()))?;
                self.call_targets.insert(*id, callee);

                if !self.ast.function(callee).is_native() {
                    let caller_id = self
                        .infos[self.stack.last().expect("function stack").0 as usize]
                        .expect("caller registered")
                        .id;
                    let callee_id = self.infos[callee.0 as usize]
                        .ok_or_else(|| TranslateError::UndefinedSymbol(name.clone()))?
                        .id;
                    self.calls[caller_id as usize].push(callee_id);
                }

                for arg in args {
                    self.visit_node(arg, scope)?;
                }
            }
            Node::Print { operands, .. } => {
                for operand in operands {
                    self.visit_node(operand, scope)?;
                }
            }
        }
        Ok(())
    }

    fn note_var_use(&mut self, var: VarId) {
        let current = *self.stack.last().expect("function stack");
        let Some(owner) = self.var_owner[var.0 as usize] else {
            return;
        };
        if owner != current {
            if let Some(info) = self.infos[current.0 as usize].as_mut() {
                info.reads_outer = true;
            }
            if let Some(info) = self.infos[owner.0 as usize].as_mut() {
                info.locals_captured = true;
            }
        }
    }
}

/// A function is recursive when its bytecode id can reach itself on the call
/// graph.
fn find_recursive(calls: &[Vec<u16>]) -> Vec<bool> {
    let mut recursive = vec![false; calls.len()];
    for start in 0..calls.len() {
        let mut visited = vec![false; calls.len()];
        let mut stack: Vec<u16> = calls[start].clone();
        while let Some(next) = stack.pop() {
            if next as usize == start {
                recursive[start] = true;
                break;
            }
            if !visited[next as usize] {
                visited[next as usize] = true;
                stack.extend_from_slice(&calls[next as usize]);
            }
        }
    }
    recursive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn analyze_source(source: &str) -> (Ast, Code, FunctionAnalysis) {
        let ast = Parser::new(source).unwrap().parse().unwrap();
        let mut code = Code::new();
        let analysis = analyze(&ast, &mut code).unwrap();
        (ast, code, analysis)
    }

    fn func_named(ast: &Ast, name: &str) -> FuncId {
        FuncId(
            ast.functions
                .iter()
                .position(|f| f.name == name)
                .unwrap() as u32,
        )
    }

    #[test]
    fn test_top_level_gets_id_zero() {
        let (ast, code, analysis) = analyze_source("print(1);");
        assert_eq!(analysis.bytecode_id(ast.top), 0);
        assert_eq!(code.functions_count(), 1);
    }

    #[test]
    fn test_direct_recursion() {
        let (ast, _, analysis) = analyze_source(
            "function int fact(int n) { if (n < 2) { return 1; } return n * fact(n - 1); } \
             print(fact(6));",
        );
        let fact = func_named(&ast, "fact");
        assert!(analysis.info(fact).is_recursive);
        assert!(!analysis.can_inline(fact));
    }

    #[test]
    fn test_indirect_recursion() {
        let (ast, _, analysis) = analyze_source(
            "function int even(int n) { if (n == 0) { return 1; } return odd(n - 1); } \
             function int odd(int n) { if (n == 0) { return 0; } return even(n - 1); } \
             print(even(4));",
        );
        // `even` calls `odd` before `odd` is declared in the same scope.
        let even = func_named(&ast, "even");
        let odd = func_named(&ast, "odd");
        assert!(analysis.info(even).is_recursive);
        assert!(analysis.info(odd).is_recursive);
    }

    #[test]
    fn test_non_recursive_is_inlinable() {
        let (ast, _, analysis) = analyze_source(
            "function int twice(int n) { return n * 2; } print(twice(21));",
        );
        let twice = func_named(&ast, "twice");
        assert!(!analysis.info(twice).is_recursive);
        assert!(analysis.can_inline(twice));
    }

    #[test]
    fn test_closure_flags() {
        let (ast, _, analysis) = analyze_source(
            "function int outer() { \
               int x; x = 41; \
               function int inner() { return x + 1; } \
               return inner(); \
             } \
             print(outer());",
        );
        let outer = func_named(&ast, "outer");
        let inner = func_named(&ast, "inner");
        assert!(analysis.info(inner).reads_outer);
        assert!(analysis.info(outer).locals_captured);
        assert!(!analysis.can_inline(inner));
        assert!(!analysis.can_inline(outer));
    }

    #[test]
    fn test_id_assignment_order() {
        let (ast, code, analysis) = analyze_source(
            "function int a() { function int c() { return 3; } return c(); } \
             function int b() { return 2; } \
             print(a() + b());",
        );
        // Siblings a and b get ids before a's nested c.
        assert_eq!(analysis.bytecode_id(func_named(&ast, "a")), 1);
        assert_eq!(analysis.bytecode_id(func_named(&ast, "b")), 2);
        assert_eq!(analysis.bytecode_id(func_named(&ast, "c")), 3);
        assert_eq!(code.functions_count(), 4);
    }

    #[test]
    fn test_undefined_function_call() {
        let ast = Parser::new("ghost();").unwrap().parse().unwrap();
        let mut code = Code::new();
        assert!(matches!(
            analyze(&ast, &mut code),
            Err(TranslateError::UndefinedSymbol(_))
        ));
    }
}
