//! Bytecode translator: lowers the annotated AST into per-function byte
//! streams.
//!
//! Traversal follows the function-analysis walk. Each non-native function is
//! translated exactly once; calls to inlinable callees additionally splice
//! the callee's body into the caller with `return` rewritten as a jump to a
//! post-call label. Variable slots are assigned lexically: entering a scope
//! hands out incrementing slot numbers in the current function, leaving it
//! gives them back, and the high-water mark becomes the function's locals
//! count. A reference to a variable owned by an enclosing function compiles
//! to the context form carrying the owner's function id.

mod expr;
mod stmt;

use rustc_hash::FxHashMap;

use crate::compiler::analysis::FunctionAnalysis;
use crate::compiler::bytecode::{Bytecode, Code, Label, Opcode};
use crate::compiler::typecheck::TypeMap;
use crate::compiler::TranslateError;
use crate::parser::ast::{Ast, FuncId, Node, ScopeId, VarId};
use crate::parser::Type;

/// Translate the whole program into `code`.
///
/// `code` must already hold the function shells registered by the analysis
/// pass; their byte streams are filled in here.
pub fn translate(
    ast: &Ast,
    types: &TypeMap,
    analysis: &FunctionAnalysis,
    code: &mut Code,
) -> Result<(), TranslateError> {
    let mut translator = Translator {
        ast,
        types,
        analysis,
        code,
        fn_stack: Vec::new(),
        vars_count: Vec::new(),
        var_locations: FxHashMap::default(),
        native_ids: FxHashMap::default(),
        inlining: Vec::new(),
    };

    translator.process_function(ast.top)?;

    // The top level runs as a function too; give it its final return.
    let top_id = analysis.bytecode_id(ast.top);
    translator
        .code
        .function_by_id_mut(top_id)
        .bytecode
        .add_insn(Opcode::Return);
    Ok(())
}

/// An active inlining frame: where `return` jumps to and what it coerces to.
struct InlineContext {
    end: Label,
    ret: Type,
}

pub(super) struct Translator<'a> {
    pub(super) ast: &'a Ast,
    pub(super) types: &'a TypeMap,
    pub(super) analysis: &'a FunctionAnalysis,
    pub(super) code: &'a mut Code,
    /// Bytecode ids of the functions being emitted, innermost last.
    fn_stack: Vec<u16>,
    /// Slot watermark per entry of `fn_stack`.
    vars_count: Vec<u16>,
    /// Variable to `(owner function id, slot)`, innermost binding last.
    var_locations: FxHashMap<VarId, Vec<(u16, u16)>>,
    /// Native ids for native declarations already registered.
    native_ids: FxHashMap<FuncId, u16>,
    inlining: Vec<InlineContext>,
}

impl Translator<'_> {
    // ===== Function traversal =====

    pub(super) fn process_function(&mut self, func: FuncId) -> Result<(), TranslateError> {
        let data = self.ast.function(func);
        // Definitions encountered while splicing an inlined body were already
        // translated on the normal walk.
        if data.is_native() || !self.inlining.is_empty() {
            return Ok(());
        }

        let id = self.analysis.bytecode_id(func);
        self.fn_stack.push(id);
        self.vars_count.push(0);

        for &param in &data.param_vars {
            self.push_var(param)?;
        }
        self.visit_block(&data.body)?;
        for &param in &data.param_vars {
            self.pop_var(param);
        }

        self.vars_count.pop();
        self.fn_stack.pop();
        Ok(())
    }

    // ===== Scope and slot management =====

    pub(super) fn push_scope(&mut self, scope: ScopeId) -> Result<(), TranslateError> {
        let funcs = self.ast.scope(scope).funcs.clone();
        for func in funcs {
            if self.ast.function(func).is_native() && !self.native_ids.contains_key(&func) {
                self.register_native(func)?;
            }
        }
        let vars = self.ast.scope(scope).vars.clone();
        for var in vars {
            self.push_var(var)?;
        }
        Ok(())
    }

    pub(super) fn pop_scope(&mut self, scope: ScopeId) {
        for &var in &self.ast.scope(scope).vars {
            self.pop_var(var);
        }
    }

    #[cfg(feature = "jit")]
    fn register_native(&mut self, func: FuncId) -> Result<(), TranslateError> {
        let data = self.ast.function(func);
        let address = *self
            .types
            .natives
            .get(&func)
            .ok_or_else(|| TranslateError::NativeNotFound(data.name.clone()))?
            as *const u8;

        let (proxy, page) = crate::jit::build_native_proxy(&data.signature, address)
            .map_err(|e| TranslateError::NativeProxy(e.to_string()))?;
        let id = self
            .code
            .add_native(&data.name, data.signature.clone(), proxy, address);
        self.code.adopt_proxy_page(page);
        self.native_ids.insert(func, id);
        Ok(())
    }

    #[cfg(not(feature = "jit"))]
    fn register_native(&mut self, _func: FuncId) -> Result<(), TranslateError> {
        Err(TranslateError::NativesUnsupported)
    }

    pub(super) fn native_id(&self, func: FuncId) -> Result<u16, TranslateError> {
        self.native_ids
            .get(&func)
            .copied()
            .ok_or_else(|| TranslateError::UndefinedSymbol(self.ast.function(func).name.clone()))
    }

    pub(super) fn push_var(&mut self, var: VarId) -> Result<(), TranslateError> {
        let slot = self.alloc_slot()?;
        let owner = self.current_fn();
        self.var_locations.entry(var).or_default().push((owner, slot));
        Ok(())
    }

    pub(super) fn pop_var(&mut self, var: VarId) {
        if let Some(stack) = self.var_locations.get_mut(&var) {
            stack.pop();
        }
        if let Some(count) = self.vars_count.last_mut() {
            *count -= 1;
        }
    }

    /// Claim the next slot in the current frame and raise the locals
    /// watermark. Loop temporaries use this directly and are never released.
    pub(super) fn alloc_slot(&mut self) -> Result<u16, TranslateError> {
        let id = self.current_fn();
        let count = self.vars_count.last_mut().expect("inside a function");
        if *count == u16::MAX {
            return Err(TranslateError::TooManyLocals(
                self.code.function_by_id(id).name().to_string(),
            ));
        }
        let slot = *count;
        *count += 1;

        let function = self.code.function_by_id_mut(id);
        if *count > function.locals_number() {
            function.set_locals_number(*count);
        }
        Ok(slot)
    }

    pub(super) fn current_fn(&self) -> u16 {
        *self.fn_stack.last().expect("inside a function")
    }

    pub(super) fn return_type(&self) -> Type {
        match self.inlining.last() {
            Some(ctx) => ctx.ret,
            None => self.code.function_by_id(self.current_fn()).return_type(),
        }
    }

    pub(super) fn in_inlining(&self) -> bool {
        !self.inlining.is_empty()
    }

    pub(super) fn push_inline_context(&mut self, ret: Type) {
        self.inlining.push(InlineContext {
            end: Label::new(),
            ret,
        });
    }

    /// Bind the inline end label at the current offset and drop the context.
    pub(super) fn finish_inline_context(&mut self) -> Result<(), TranslateError> {
        let mut ctx = self.inlining.pop().expect("inline context");
        let id = self.current_fn();
        self.code
            .function_by_id_mut(id)
            .bytecode
            .bind(&mut ctx.end)
    }

    /// `return` inside an inlined body jumps to the post-call label.
    pub(super) fn emit_inline_return(&mut self) -> Result<(), TranslateError> {
        let id = self.current_fn();
        let ctx = self.inlining.last_mut().expect("inline context");
        self.code
            .function_by_id_mut(id)
            .bytecode
            .add_branch(Opcode::Ja, &mut ctx.end)
    }

    // ===== Emission =====

    pub(super) fn bc(&mut self) -> &mut Bytecode {
        let id = self.current_fn();
        &mut self.code.function_by_id_mut(id).bytecode
    }

    pub(super) fn emit(&mut self, insn: Opcode) {
        self.bc().add_insn(insn);
    }

    pub(super) fn emit_branch(
        &mut self,
        insn: Opcode,
        label: &mut Label,
    ) -> Result<(), TranslateError> {
        self.bc().add_branch(insn, label)
    }

    pub(super) fn bind(&mut self, label: &mut Label) -> Result<(), TranslateError> {
        self.bc().bind(label)
    }

    /// Emit a load or store for a resolved variable, choosing between the
    /// context form, the short form for slots 0..3, and the long form.
    pub(super) fn emit_var_access(
        &mut self,
        var: VarId,
        is_load: bool,
    ) -> Result<(), TranslateError> {
        let &(owner, slot) = self
            .var_locations
            .get(&var)
            .and_then(|stack| stack.last())
            .ok_or_else(|| {
                TranslateError::UndefinedSymbol(self.ast.var(var).name.clone())
            })?;
        let ty = self.ast.var(var).ty;

        if owner != self.current_fn() {
            let insn = ctx_var_insn(ty, is_load)?;
            self.emit(insn);
            self.bc().add_u16(owner);
            self.bc().add_u16(slot);
        } else {
            self.emit_local_slot(ty, slot, is_load)?;
        }
        Ok(())
    }

    /// Emit a load or store for a slot in the current frame.
    pub(super) fn emit_local_slot(
        &mut self,
        ty: Type,
        slot: u16,
        is_load: bool,
    ) -> Result<(), TranslateError> {
        if slot < 4 {
            let insn = short_var_insn(ty, is_load)?.with_slot(slot);
            self.emit(insn);
        } else {
            let insn = local_var_insn(ty, is_load)?;
            self.emit(insn);
            self.bc().add_u16(slot);
        }
        Ok(())
    }

    pub(super) fn choose_insn(
        &self,
        ty: Type,
        int_insn: Opcode,
        double_insn: Opcode,
    ) -> Result<Opcode, TranslateError> {
        match ty {
            Type::Int => Ok(int_insn),
            Type::Double => Ok(double_insn),
            _ => Err(TranslateError::Internal("unexpected operand type")),
        }
    }

    // ===== Generation entry points =====

    /// Emit `node` and coerce its result to `required`.
    pub(super) fn gen(&mut self, node: &Node, required: Type) -> Result<(), TranslateError> {
        let actual = self.gen_node(node)?;
        self.coerce(actual, required);
        Ok(())
    }

    /// Emit `node`, returning its annotated result type.
    pub(super) fn gen_node(&mut self, node: &Node) -> Result<Type, TranslateError> {
        match node {
            Node::IntLit { value, .. } => self.gen_int_literal(*value),
            Node::DoubleLit { value, .. } => self.gen_double_literal(*value),
            Node::StringLit { value, .. } => self.gen_string_literal(value),
            Node::Load { .. } | Node::Store { .. } | Node::Unary { .. } | Node::Binary { .. } => {
                self.gen_expr(node)?;
                Ok(self.types.of(node.id()))
            }
            Node::Call { .. } => {
                self.gen_call(node)?;
                Ok(self.types.of(node.id()))
            }
            Node::BlockStmt { .. }
            | Node::If { .. }
            | Node::While { .. }
            | Node::For { .. }
            | Node::Return { .. }
            | Node::Print { .. } => {
                self.gen_stmt(node)?;
                Ok(Type::Void)
            }
        }
    }

    /// Insert a conversion so a value of type `from` reads as `to`.
    fn coerce(&mut self, from: Type, to: Type) {
        if from == to {
            return;
        }
        if to == Type::Void {
            self.emit(Opcode::Pop);
            return;
        }
        debug_assert!(to != Type::String, "nothing converts to string");

        if from == Type::Double && to == Type::Int {
            self.emit(Opcode::D2i);
            return;
        }
        let mut from = from;
        if from == Type::String {
            self.emit(Opcode::S2i);
            from = Type::Int;
        }
        if from == Type::Int && to == Type::Double {
            self.emit(Opcode::I2d);
        }
    }
}

fn short_var_insn(ty: Type, is_load: bool) -> Result<Opcode, TranslateError> {
    match (ty, is_load) {
        (Type::Double, true) => Ok(Opcode::LoadDvar0),
        (Type::Int, true) => Ok(Opcode::LoadIvar0),
        (Type::String, true) => Ok(Opcode::LoadSvar0),
        (Type::Double, false) => Ok(Opcode::StoreDvar0),
        (Type::Int, false) => Ok(Opcode::StoreIvar0),
        (Type::String, false) => Ok(Opcode::StoreSvar0),
        (Type::Void, _) => Err(TranslateError::Internal("void variable access")),
    }
}

fn local_var_insn(ty: Type, is_load: bool) -> Result<Opcode, TranslateError> {
    match (ty, is_load) {
        (Type::Double, true) => Ok(Opcode::LoadDvar),
        (Type::Int, true) => Ok(Opcode::LoadIvar),
        (Type::String, true) => Ok(Opcode::LoadSvar),
        (Type::Double, false) => Ok(Opcode::StoreDvar),
        (Type::Int, false) => Ok(Opcode::StoreIvar),
        (Type::String, false) => Ok(Opcode::StoreSvar),
        (Type::Void, _) => Err(TranslateError::Internal("void variable access")),
    }
}

fn ctx_var_insn(ty: Type, is_load: bool) -> Result<Opcode, TranslateError> {
    match (ty, is_load) {
        (Type::Double, true) => Ok(Opcode::LoadCtxDvar),
        (Type::Int, true) => Ok(Opcode::LoadCtxIvar),
        (Type::String, true) => Ok(Opcode::LoadCtxSvar),
        (Type::Double, false) => Ok(Opcode::StoreCtxDvar),
        (Type::Int, false) => Ok(Opcode::StoreCtxIvar),
        (Type::String, false) => Ok(Opcode::StoreCtxSvar),
        (Type::Void, _) => Err(TranslateError::Internal("void variable access")),
    }
}
