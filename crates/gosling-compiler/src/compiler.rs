use std::rc::Rc;

use gosling_bytecode::{make, Instructions, OpCode};
use gosling_lexer::{LineIndex, Span};
use gosling_object::{
    convert_with, default_of_elem, default_of_tag, CompiledFunction, ForLoopTemplate, FreeRef,
    FuncSig, RangeLoopTemplate, TypeTag, Value,
};
use gosling_parser::ast::*;
use thiserror::Error;

use crate::program::{default_of_type_expr, lower_func_sig, Program};
use crate::symbol_table::{Symbol, SymbolScope, SymbolTable};

/// Compilation errors. `Undefined` is matched structurally by the
/// top-level driver's forward-reference retry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("undefined: {0}")]
    Undefined(String),
    #[error("{line}:{column} {message}")]
    At {
        line: u32,
        column: u32,
        message: String,
    },
    #[error("{0}")]
    Message(String),
}

/// The compiled artefact handed to the VM.
pub struct Bytecode {
    pub constants: Vec<Value>,
    pub instructions: Instructions,
    pub symbol_table: SymbolTable,
    pub global_decls: usize,
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: OpCode,
    position: usize,
}

#[derive(Default)]
struct CompilationScope {
    instructions: Instructions,
    last: Option<EmittedInstruction>,
    previous: Option<EmittedInstruction>,
}

/// An assignment target: a plain identifier or an indexed container.
enum Variable<'a> {
    Ident(&'a Ident),
    Indexed { name: &'a Ident, index: &'a Expr },
}

/// The gosling bytecode compiler.
pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
    scope_index: usize,
    global_decls: usize,
    line_index: LineIndex,
    line_offset: u32,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        let mut global = SymbolTable::new();
        for (i, builtin) in gosling_object::BUILTINS.iter().enumerate() {
            global.define_builtin(i, builtin.name);
        }

        Self {
            constants: Vec::new(),
            symbol_table: global,
            scopes: vec![CompilationScope::default()],
            scope_index: 0,
            global_decls: 0,
            line_index: LineIndex::default(),
            line_offset: 0,
        }
    }

    /// Consume the compiler, producing the bytecode artefact.
    pub fn bytecode(mut self) -> Bytecode {
        let instructions = std::mem::take(&mut self.scopes[self.scope_index].instructions);
        Bytecode {
            constants: self.constants,
            instructions,
            symbol_table: self.symbol_table,
            global_decls: self.global_decls,
        }
    }

    /// Compile a whole program: sibling top-level functions first (with
    /// the reserve-compile-retry scheme for forward references), then the
    /// statements of `main` into the root scope.
    pub fn compile_program(&mut self, prog: &Program) -> Result<(), CompileError> {
        self.line_index = prog.line_index.clone();
        self.line_offset = prog.line_offset;

        for func in &prog.functions {
            if self.symbol_table.is_defined_here(&func.name) {
                continue;
            }
            loop {
                let slot = self.constants.len();
                match self.compile_named_function(&func.name, &func.lit, slot) {
                    Ok(()) => break,
                    Err(CompileError::Undefined(peer)) => {
                        self.symbol_table.delete(&func.name);
                        self.constants.truncate(slot);

                        let found = prog
                            .functions
                            .iter()
                            .find(|f| f.name == peer && f.name != func.name);
                        let Some(peer_func) = found else {
                            return Err(CompileError::Undefined(peer));
                        };
                        let peer_slot = self.constants.len();
                        self.compile_named_function(&peer_func.name, &peer_func.lit, peer_slot)?;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.global_decls = prog.global_decls;

        let count = prog.statements.len();
        for (i, stmt) in prog.statements.iter().enumerate() {
            self.compile_stmt(stmt, None)?;
            match stmt {
                Stmt::Decl(_) | Stmt::Assign(_) => {}
                _ => {
                    if i + 1 == count {
                        self.emit(OpCode::Pop, &[]);
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_named_function(
        &mut self,
        name: &str,
        lit: &FuncLit,
        slot: usize,
    ) -> Result<(), CompileError> {
        let sig = lower_func_sig(&lit.ty);
        let fn_ty = Value::Function(Rc::new(sig.clone()));
        self.symbol_table.define_with_type(name, Some(fn_ty));
        self.constants.push(Value::Null);

        let compiled = self.compile_function(&sig, &lit.body, name)?;
        self.constants[slot] = Value::CompiledFunction(Rc::new(compiled));
        Ok(())
    }

    // ---
    // Emission helpers
    // ---

    fn current_instructions(&self) -> &Instructions {
        &self.scopes[self.scope_index].instructions
    }

    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn emit(&mut self, op: OpCode, operands: &[usize]) -> usize {
        let ins = make(op, operands);
        let position = self.current_instructions().len();
        self.scopes[self.scope_index].instructions.extend(ins);

        let scope = &mut self.scopes[self.scope_index];
        scope.previous = scope.last;
        scope.last = Some(EmittedInstruction {
            opcode: op,
            position,
        });
        position
    }

    fn last_instruction_is(&self, op: OpCode) -> bool {
        self.scopes[self.scope_index]
            .last
            .map_or(false, |last| last.opcode == op)
    }

    /// Re-encode the operand of a previously emitted jump.
    fn change_operand(&mut self, position: usize, operand: usize) {
        let op = OpCode::try_from(self.current_instructions()[position])
            .expect("patching an undefined opcode");
        let replacement = make(op, &[operand]);
        let ins = &mut self.scopes[self.scope_index].instructions;
        ins[position..position + replacement.len()].copy_from_slice(&replacement);
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.scope_index += 1;
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().expect("leaving the root scope");
        self.scope_index -= 1;
        let outer = self
            .symbol_table
            .outer
            .take()
            .expect("symbol table has no outer scope");
        self.symbol_table = *outer;
        scope.instructions
    }

    /// Take the current scope's instruction buffer and reset it, keeping
    /// the scope open. Loop compilation rotates each sub-stream out this
    /// way.
    fn rotate_scope(&mut self) -> Instructions {
        let scope = &mut self.scopes[self.scope_index];
        scope.last = None;
        scope.previous = None;
        std::mem::take(&mut scope.instructions)
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(OpCode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(OpCode::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(OpCode::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(OpCode::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(OpCode::CurrentClosure, &[]),
        };
    }

    fn store_symbol(&mut self, symbol: &Symbol) {
        if symbol.is_blank() {
            self.emit(OpCode::SetNil, &[]);
            return;
        }
        match symbol.scope {
            SymbolScope::Global => self.emit(OpCode::SetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(OpCode::SetLocal, &[symbol.index]),
            SymbolScope::Free => self.emit(OpCode::SetFree, &[symbol.index]),
            SymbolScope::Builtin | SymbolScope::Function => {
                unreachable!("cannot store into scope {:?}", symbol.scope)
            }
        };
    }

    fn err_at(&self, span: Span, message: impl Into<String>) -> CompileError {
        let pos = self.line_index.position(span.start);
        CompileError::At {
            line: pos.line.saturating_sub(self.line_offset),
            column: pos.column,
            message: message.into(),
        }
    }

    // ---
    // Statements
    // ---

    fn compile_stmt(&mut self, stmt: &Stmt, default: Option<&Value>) -> Result<(), CompileError> {
        match stmt {
            Stmt::Decl(decl) => self.compile_gen_decl(decl),
            Stmt::Expr(expr) => self.compile_expr(expr, default),
            Stmt::Assign(assign) => self.compile_assign(assign, false),
            Stmt::IncDec(incdec) => self.compile_inc_dec(incdec),
            Stmt::Return(ret) => self.compile_return(ret),
            Stmt::Block(block) => self.compile_block(block, default),
            Stmt::If(stmt) => self.compile_if(stmt),
            Stmt::For(stmt) => self.compile_for(stmt),
            Stmt::Range(stmt) => self.compile_range(stmt),
            Stmt::Branch(branch) => {
                match branch.kind {
                    BranchKind::Continue => self.emit(OpCode::Continue, &[]),
                    BranchKind::Break => self.emit(OpCode::Break, &[]),
                };
                Ok(())
            }
        }
    }

    fn compile_block(&mut self, block: &Block, default: Option<&Value>) -> Result<(), CompileError> {
        for stmt in &block.stmts {
            self.compile_stmt(stmt, default)?;
        }
        Ok(())
    }

    fn compile_gen_decl(&mut self, decl: &GenDecl) -> Result<(), CompileError> {
        match decl.kind {
            DeclKind::Const => Err(self.err_at(decl.span, "not support const")),
            DeclKind::Var => {
                for spec in &decl.specs {
                    self.compile_value_spec(spec)?;
                }
                Ok(())
            }
        }
    }

    fn compile_value_spec(&mut self, spec: &ValueSpec) -> Result<(), CompileError> {
        let default_obj: Option<Value> = spec.ty.as_ref().map(default_of_type_expr);

        if spec.values.is_empty() {
            let Some(default_value) = default_obj else {
                return Err(self.err_at(spec.span, "missing type or initializer"));
            };
            let idx = self.add_constant(default_value.clone());
            for name in &spec.names {
                self.emit(OpCode::Const, &[idx]);
                let symbol = self
                    .symbol_table
                    .define_with_type(&name.name, Some(default_value.clone()));
                self.store_symbol(&symbol);
            }
            return Ok(());
        }

        let mut n = 0usize;
        for value in &spec.values {
            match value {
                Expr::BasicLit(lit) => {
                    let obj = self.compile_basic_lit(lit, default_obj.as_ref())?;
                    let name = self.spec_name(spec, n)?;
                    let symbol = self.symbol_table.define_with_type(&name, Some(obj));
                    self.store_symbol(&symbol);
                    n += 1;
                }
                Expr::Ident(_) => {
                    let symbol = self.compile_expr_symbol(value)?;
                    let name = self.spec_name(spec, n)?;
                    let defined = self.symbol_table.define_with_type(&name, symbol.ty);
                    self.store_symbol(&defined);
                    n += 1;
                }
                Expr::Call(call) => {
                    let produced = self.compile_call_for_targets(call)?;
                    for ty in produced {
                        let name = self.spec_name(spec, n)?;
                        let symbol = self.symbol_table.define_with_type(&name, ty);
                        self.store_symbol(&symbol);
                        n += 1;
                    }
                }
                Expr::Index(index) => {
                    let container = self.compile_index_expr(index)?;
                    match &container {
                        Some(Value::Hash(_)) => {
                            let value_default = hash_value_default(&container);
                            let name = self.spec_name(spec, n)?;
                            let symbol =
                                self.symbol_table.define_with_type(&name, value_default);
                            self.store_symbol(&symbol);
                            n += 1;

                            // The map-exist wrapper always carries a second
                            // value; bind it or drop it.
                            if spec.names.len() > n && spec.values.len() == 1 {
                                let name = self.spec_name(spec, n)?;
                                let symbol = self
                                    .symbol_table
                                    .define_with_type(&name, Some(Value::Bool(false)));
                                self.store_symbol(&symbol);
                                n += 1;
                            } else {
                                self.emit(OpCode::SetNil, &[]);
                            }
                        }
                        _ => {
                            let elem_default = array_elem_default(&container);
                            let name = self.spec_name(spec, n)?;
                            let symbol = self.symbol_table.define_with_type(&name, elem_default);
                            self.store_symbol(&symbol);
                            n += 1;
                        }
                    }
                }
                Expr::FuncLit(lit) => {
                    let symbol = self.compile_func_lit(lit)?;
                    let name = self.spec_name(spec, n)?;
                    let defined = self.symbol_table.define_with_type(&name, symbol.ty);
                    self.store_symbol(&defined);
                    n += 1;
                }
                Expr::Composite(lit) => {
                    let ty = self.compile_composite(lit, default_obj.as_ref())?;
                    let name = self.spec_name(spec, n)?;
                    let symbol = self.symbol_table.define_with_type(&name, ty);
                    self.store_symbol(&symbol);
                    n += 1;
                }
                other => {
                    self.compile_expr(other, default_obj.as_ref())?;
                    let name = self.spec_name(spec, n)?;
                    let symbol = self.symbol_table.define_with_type(&name, None);
                    self.store_symbol(&symbol);
                    n += 1;
                }
            }
        }

        if n < spec.names.len() {
            let name = &spec.names[n];
            return Err(self.err_at(
                name.span,
                format!("missing init expr for '{}'", name.name),
            ));
        }
        Ok(())
    }

    fn spec_name(&self, spec: &ValueSpec, n: usize) -> Result<String, CompileError> {
        match spec.names.get(n) {
            Some(ident) => Ok(ident.name.clone()),
            None => Err(self.err_at(spec.span, "assignment mismatch: too many init values")),
        }
    }

    fn compile_assign(
        &mut self,
        node: &AssignStmt,
        allow_existing_targets: bool,
    ) -> Result<(), CompileError> {
        if let Some(op) = node.op.binary_op() {
            // Rewrite `x op= y` to `x = x op y`.
            let rewritten = AssignStmt {
                lhs: node.lhs.clone(),
                op: AssignOp::Assign,
                rhs: vec![Expr::Binary(BinaryExpr {
                    x: Box::new(node.lhs[0].clone()),
                    op,
                    y: Box::new(node.rhs[0].clone()),
                    span: node.span,
                })],
                span: node.span,
            };
            return self.compile_assign(&rewritten, allow_existing_targets);
        }

        let mut vars = Vec::with_capacity(node.lhs.len());
        for target in &node.lhs {
            match target {
                Expr::Ident(ident) => vars.push(Variable::Ident(ident)),
                Expr::Index(index) => {
                    let Expr::Ident(name) = index.x.as_ref() else {
                        return Err(
                            self.err_at(index.span, "indexed assignment target is not a variable")
                        );
                    };
                    vars.push(Variable::Indexed {
                        name,
                        index: &index.index,
                    });
                }
                other => {
                    return Err(self.err_at(other.span(), "cannot assign to this expression"))
                }
            }
        }

        let mut n = 0usize;
        let mut defined_new = false;
        for value in &node.rhs {
            match value {
                Expr::BasicLit(lit) => {
                    let obj = self.compile_basic_lit(lit, None)?;
                    defined_new |= self.assign_target(&vars, &mut n, Some(obj), node.span)?;
                }
                Expr::Ident(_) => {
                    let symbol = self.compile_expr_symbol(value)?;
                    defined_new |= self.assign_target(&vars, &mut n, symbol.ty, node.span)?;
                }
                Expr::Call(call) => {
                    let produced = self.compile_call_for_targets(call)?;
                    for ty in produced {
                        defined_new |= self.assign_target(&vars, &mut n, ty, node.span)?;
                    }
                }
                Expr::Index(index) => {
                    let container = self.compile_index_expr(index)?;
                    match &container {
                        Some(Value::Hash(_)) => {
                            let value_default = hash_value_default(&container);
                            defined_new |=
                                self.assign_target(&vars, &mut n, value_default, node.span)?;
                            if n < vars.len() {
                                defined_new |= self.assign_target(
                                    &vars,
                                    &mut n,
                                    Some(Value::Bool(false)),
                                    node.span,
                                )?;
                            } else {
                                self.emit(OpCode::SetNil, &[]);
                            }
                        }
                        _ => {
                            let elem_default = array_elem_default(&container);
                            defined_new |=
                                self.assign_target(&vars, &mut n, elem_default, node.span)?;
                        }
                    }
                }
                Expr::FuncLit(lit) => {
                    let symbol = self.compile_func_lit(lit)?;
                    defined_new |= self.assign_target(&vars, &mut n, symbol.ty, node.span)?;
                }
                Expr::Composite(lit) => {
                    let ty = self.compile_composite(lit, None)?;
                    defined_new |= self.assign_target(&vars, &mut n, ty, node.span)?;
                }
                other => {
                    self.compile_expr(other, None)?;
                    defined_new |= self.assign_target(&vars, &mut n, None, node.span)?;
                }
            }
        }

        if n < vars.len() {
            return Err(self.err_at(
                node.span,
                format!(
                    "assignment mismatch: {} variables but {} values",
                    vars.len(),
                    n
                ),
            ));
        }
        if node.op == AssignOp::Define && !defined_new && !allow_existing_targets {
            return Err(self.err_at(node.span, "no new variables on left side of :="));
        }
        Ok(())
    }

    fn assign_target(
        &mut self,
        vars: &[Variable<'_>],
        n: &mut usize,
        ty: Option<Value>,
        span: Span,
    ) -> Result<bool, CompileError> {
        let Some(var) = vars.get(*n) else {
            return Err(self.err_at(span, "assignment mismatch: too many values"));
        };
        *n += 1;
        self.assign_value(var, ty)
    }

    /// Store the value on top of the stack into a target, defining the
    /// target when it does not resolve. Returns whether a new (non-blank)
    /// symbol was introduced.
    fn assign_value(
        &mut self,
        var: &Variable<'_>,
        ty: Option<Value>,
    ) -> Result<bool, CompileError> {
        match var {
            Variable::Ident(ident) => match self.symbol_table.resolve(&ident.name) {
                Some(symbol) => {
                    self.store_symbol(&symbol);
                    Ok(false)
                }
                None => {
                    let symbol = match ty {
                        Some(ty) => self.symbol_table.define_with_type(&ident.name, Some(ty)),
                        None => self.symbol_table.define(&ident.name),
                    };
                    let new = !symbol.is_blank();
                    self.store_symbol(&symbol);
                    Ok(new)
                }
            },
            Variable::Indexed { name, index } => {
                let Some(symbol) = self.symbol_table.resolve(&name.name) else {
                    return Err(CompileError::Undefined(name.name.clone()));
                };
                self.load_symbol(&symbol);
                self.compile_expr(index, None)?;
                match symbol.scope {
                    SymbolScope::Global => {
                        self.emit(OpCode::SetGlobalIndex, &[symbol.index]);
                    }
                    SymbolScope::Local | SymbolScope::Free => {
                        self.emit(OpCode::SetLocalIndex, &[symbol.index]);
                    }
                    _ => {
                        return Err(self.err_at(name.span, "cannot assign through this index"));
                    }
                }
                Ok(false)
            }
        }
    }

    fn compile_inc_dec(&mut self, node: &IncDecStmt) -> Result<(), CompileError> {
        self.compile_expr(&node.x, None)?;
        if node.inc {
            self.emit(OpCode::Inc, &[]);
        } else {
            self.emit(OpCode::Dec, &[]);
        }
        if let Expr::Ident(ident) = &node.x {
            let Some(symbol) = self.symbol_table.resolve(&ident.name) else {
                return Err(CompileError::Undefined(ident.name.clone()));
            };
            self.store_symbol(&symbol);
        }
        Ok(())
    }

    fn compile_return(&mut self, node: &ReturnStmt) -> Result<(), CompileError> {
        if node.results.is_empty() {
            self.emit(OpCode::Return, &[]);
            return Ok(());
        }
        for result in &node.results {
            self.compile_expr(result, None)?;
        }
        self.emit(OpCode::ReturnValue, &[node.results.len()]);
        Ok(())
    }

    fn compile_if(&mut self, node: &IfStmt) -> Result<(), CompileError> {
        // Symbols an `if` initializer shadows are saved on the stack,
        // removed from the table for the duration of the statement, and
        // restored afterwards.
        let mut shadowed: Vec<Symbol> = Vec::new();
        let mut introduced: Vec<String> = Vec::new();
        if let Some(init) = &node.init {
            if let Stmt::Assign(assign) = init.as_ref() {
                if assign.op == AssignOp::Define {
                    for target in &assign.lhs {
                        let Expr::Ident(ident) = target else {
                            return Err(self
                                .err_at(target.span(), "if initializer target is not an identifier"));
                        };
                        if ident.name == "_" {
                            continue;
                        }
                        match self.symbol_table.resolve(&ident.name) {
                            Some(symbol) => shadowed.push(symbol),
                            None => introduced.push(ident.name.clone()),
                        }
                    }
                }
            }
            for symbol in &shadowed {
                self.load_symbol(symbol);
            }
            for symbol in &shadowed {
                self.symbol_table.delete(&symbol.name);
            }
            self.compile_stmt(init, None)?;
        }

        self.compile_expr(&node.cond, None)?;
        let jump_not_truthy = self.emit(OpCode::JumpNotTruthy, &[0]);
        self.compile_block(&node.body, None)?;
        let jump_over_else = self.emit(OpCode::Jump, &[0]);

        let after_body = self.current_instructions().len();
        self.change_operand(jump_not_truthy, after_body);

        if let Some(else_branch) = &node.else_branch {
            self.compile_stmt(else_branch, None)?;
        }
        let after_else = self.current_instructions().len();
        self.change_operand(jump_over_else, after_else);

        for name in &introduced {
            self.symbol_table.delete(name);
        }
        for symbol in &shadowed {
            self.symbol_table.delete(&symbol.name);
        }
        for symbol in &shadowed {
            self.symbol_table.reset(symbol.clone());
        }
        for symbol in shadowed.iter().rev() {
            self.store_symbol(symbol);
        }
        Ok(())
    }

    fn compile_for(&mut self, node: &ForStmt) -> Result<(), CompileError> {
        self.enter_scope();
        let streams = self.compile_for_streams(node);
        let num_locals = self.symbol_table.num_definitions;
        let free_symbols = self.symbol_table.free_symbols.clone();
        self.leave_scope();
        let (init, cond, body, post) = streams?;

        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }
        let frees = free_refs(&free_symbols);
        let free_count = frees.len();
        let template = Value::ForLoop(Rc::new(ForLoopTemplate {
            init,
            cond,
            body,
            post,
            num_locals,
            frees,
        }));
        let idx = self.add_constant(template);
        self.emit(OpCode::Closure, &[idx, free_count]);
        self.emit(OpCode::ForLoop, &[]);
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn compile_for_streams(
        &mut self,
        node: &ForStmt,
    ) -> Result<(Instructions, Instructions, Instructions, Instructions), CompileError> {
        if let Some(init) = &node.init {
            if let Stmt::Assign(assign) = init.as_ref() {
                if assign.op == AssignOp::Define {
                    for target in &assign.lhs {
                        let Expr::Ident(ident) = target else {
                            return Err(self
                                .err_at(target.span(), "for initializer target is not an identifier"));
                        };
                        self.symbol_table.define(&ident.name);
                    }
                }
                self.compile_assign(assign, true)?;
            } else {
                self.compile_stmt(init, None)?;
            }
        }
        let init_ins = self.rotate_scope();

        match &node.cond {
            Some(cond) => self.compile_expr(cond, None)?,
            None => {
                self.emit(OpCode::True, &[]);
            }
        }
        let cond_ins = self.rotate_scope();

        self.compile_block(&node.body, None)?;
        let body_ins = self.rotate_scope();

        if let Some(post) = &node.post {
            self.compile_stmt(post, None)?;
        }
        let post_ins = self.rotate_scope();

        Ok((init_ins, cond_ins, body_ins, post_ins))
    }

    fn compile_range(&mut self, node: &RangeStmt) -> Result<(), CompileError> {
        self.enter_scope();
        let streams = self.compile_range_streams(node);
        let num_locals = self.symbol_table.num_definitions;
        let free_symbols = self.symbol_table.free_symbols.clone();
        self.leave_scope();
        let (x, body, is_anonymous) = streams?;

        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }
        let frees = free_refs(&free_symbols);
        let free_count = frees.len();
        let template = Value::RangeLoop(Rc::new(RangeLoopTemplate {
            x,
            body,
            is_anonymous,
            num_locals,
            frees,
        }));
        let idx = self.add_constant(template);
        self.emit(OpCode::Closure, &[idx, free_count]);
        self.emit(OpCode::RangeLoop, &[]);
        Ok(())
    }

    fn compile_range_streams(
        &mut self,
        node: &RangeStmt,
    ) -> Result<(Instructions, Instructions, bool), CompileError> {
        // Range over an identifier uses it directly; any other rangee is
        // spilled into a synthetic local first.
        let (rangee, is_anonymous) = match &node.x {
            Expr::Ident(ident) => (ident.name.clone(), false),
            other => {
                self.compile_expr(other, None)?;
                let symbol = self.symbol_table.define("loop_x");
                self.store_symbol(&symbol);
                ("loop_x".to_string(), true)
            }
        };
        let Some(x_symbol) = self.symbol_table.resolve(&rangee) else {
            return Err(CompileError::Undefined(rangee));
        };
        self.load_symbol(&x_symbol);
        let x_ins = self.rotate_scope();

        // The iteration slots the VM writes each key/value pair into.
        self.symbol_table.define("loop_K");
        self.symbol_table.define("loop_V");

        if let Some(key) = &node.key {
            if key.name != "_" {
                let slot = self.symbol_table.resolve("loop_K").expect("loop_K defined");
                self.load_symbol(&slot);
                let symbol = self.symbol_table.define(&key.name);
                self.store_symbol(&symbol);
            }
        }
        if let Some(value) = &node.value {
            if value.name != "_" {
                let slot = self.symbol_table.resolve("loop_V").expect("loop_V defined");
                self.load_symbol(&slot);
                let symbol = self.symbol_table.define(&value.name);
                self.store_symbol(&symbol);
            }
        }
        self.compile_block(&node.body, None)?;
        let body_ins = self.rotate_scope();

        Ok((x_ins, body_ins, is_anonymous))
    }

    // ---
    // Expressions
    // ---

    fn compile_expr(&mut self, expr: &Expr, default: Option<&Value>) -> Result<(), CompileError> {
        match expr {
            Expr::BasicLit(lit) => {
                self.compile_basic_lit(lit, default)?;
                Ok(())
            }
            Expr::Ident(_) => {
                self.compile_expr_symbol(expr)?;
                Ok(())
            }
            Expr::Binary(binary) => self.compile_binary(binary),
            Expr::Unary(unary) => self.compile_unary(unary),
            Expr::Paren(paren) => self.compile_expr(&paren.x, default),
            Expr::Index(index) => {
                self.compile_index_expr(index)?;
                Ok(())
            }
            Expr::Call(call) => {
                self.compile_call_for_targets(call)?;
                Ok(())
            }
            Expr::FuncLit(lit) => {
                self.compile_func_lit(lit)?;
                Ok(())
            }
            Expr::Composite(lit) => {
                self.compile_composite(lit, default)?;
                Ok(())
            }
        }
    }

    /// Compile an identifier expression, returning its symbol.
    fn compile_expr_symbol(&mut self, expr: &Expr) -> Result<Symbol, CompileError> {
        let Expr::Ident(ident) = expr else {
            unreachable!("compile_expr_symbol expects an identifier");
        };
        self.compile_ident(ident)
    }

    fn compile_ident(&mut self, ident: &Ident) -> Result<Symbol, CompileError> {
        if ident.name == "true" || ident.name == "false" {
            if ident.name == "true" {
                self.emit(OpCode::True, &[]);
            } else {
                self.emit(OpCode::False, &[]);
            }
            return Ok(Symbol {
                name: ident.name.clone(),
                scope: SymbolScope::Global,
                index: 0,
                ty: Some(Value::Bool(false)),
            });
        }

        match self.symbol_table.resolve(&ident.name) {
            Some(symbol) => {
                self.load_symbol(&symbol);
                Ok(symbol)
            }
            None => Err(CompileError::Undefined(ident.name.clone())),
        }
    }

    fn compile_binary(&mut self, node: &BinaryExpr) -> Result<(), CompileError> {
        self.compile_expr(&node.x, None)?;
        self.compile_expr(&node.y, None)?;
        let op = match node.op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Quo => OpCode::Quo,
            BinaryOp::Rem => OpCode::Rem,
            BinaryOp::And => OpCode::And,
            BinaryOp::Or => OpCode::Or,
            BinaryOp::Xor => OpCode::Xor,
            BinaryOp::Shl => OpCode::Shl,
            BinaryOp::Shr => OpCode::Shr,
            BinaryOp::AndNot => OpCode::AndNot,
            BinaryOp::Eql => OpCode::Eql,
            BinaryOp::Neq => OpCode::Neq,
            BinaryOp::Lss => OpCode::Lss,
            BinaryOp::Leq => OpCode::Leq,
            BinaryOp::Gtr => OpCode::Gtr,
            BinaryOp::Geq => OpCode::Geq,
            BinaryOp::LAnd => OpCode::LAnd,
            BinaryOp::LOr => OpCode::LOr,
        };
        self.emit(op, &[]);
        Ok(())
    }

    fn compile_unary(&mut self, node: &UnaryExpr) -> Result<(), CompileError> {
        self.compile_expr(&node.x, None)?;
        match node.op {
            UnaryOp::Not => {
                self.emit(OpCode::Not, &[]);
            }
            UnaryOp::Neg => {
                self.emit(OpCode::PrefixSub, &[]);
            }
            UnaryOp::Pos => {}
        }
        Ok(())
    }

    fn compile_basic_lit(
        &mut self,
        lit: &BasicLit,
        default: Option<&Value>,
    ) -> Result<Value, CompileError> {
        let mut value = match lit.kind {
            LitKind::Int => match gosling_lexer::parse_int(&lit.value) {
                Ok(v) => Value::Int(v),
                Err(_) => {
                    return Err(self.err_at(
                        lit.span,
                        format!("{} cannot be represented by the type int", lit.value),
                    ))
                }
            },
            LitKind::Float => match gosling_lexer::parse_float(&lit.value) {
                Ok(v) => Value::Float64(v),
                Err(_) => {
                    return Err(self.err_at(
                        lit.span,
                        format!("{} cannot be represented by the type float64", lit.value),
                    ))
                }
            },
            LitKind::String => Value::Str(Rc::from(gosling_lexer::parse_string(&lit.value))),
            LitKind::Char => match gosling_lexer::parse_char(&lit.value) {
                Some(v) => Value::Uint8(v),
                None => return Err(self.err_at(lit.span, "invalid character literal")),
            },
        };

        if let Some(default) = default {
            let target = default.type_tag();
            if target != TypeTag::Null && value.type_tag() != target {
                let converted = convert_with(&value, default);
                if let Value::Error(message) = &converted {
                    return Err(self.err_at(lit.span, message.to_string()));
                }
                value = converted;
            }
        }

        let idx = self.add_constant(value.clone());
        self.emit(OpCode::Const, &[idx]);
        Ok(value)
    }

    /// Compile an index expression; returns the static type of the
    /// container, when known.
    fn compile_index_expr(&mut self, node: &IndexExpr) -> Result<Option<Value>, CompileError> {
        let container = match node.x.as_ref() {
            Expr::Ident(ident) => {
                let Some(symbol) = self.symbol_table.resolve(&ident.name) else {
                    return Err(CompileError::Undefined(ident.name.clone()));
                };
                self.load_symbol(&symbol);
                symbol.ty
            }
            Expr::Index(inner) => {
                self.compile_index_expr(inner)?;
                None
            }
            Expr::Composite(lit) => self.compile_composite(lit, None)?,
            other => {
                return Err(self.err_at(other.span(), "cannot index this expression"));
            }
        };
        self.compile_expr(&node.index, None)?;
        self.emit(OpCode::Index, &[]);
        Ok(container)
    }

    fn compile_func_lit(&mut self, lit: &FuncLit) -> Result<Symbol, CompileError> {
        let sig = lower_func_sig(&lit.ty);
        let compiled = self.compile_function(&sig, &lit.body, "")?;
        let free_count = compiled.free_count;
        let idx = self.add_constant(Value::CompiledFunction(Rc::new(compiled)));
        self.emit(OpCode::Closure, &[idx, free_count]);
        Ok(Symbol {
            name: String::new(),
            scope: SymbolScope::Global,
            index: 0,
            ty: Some(Value::Function(Rc::new(sig))),
        })
    }

    fn compile_function(
        &mut self,
        sig: &FuncSig,
        body: &Block,
        name: &str,
    ) -> Result<CompiledFunction, CompileError> {
        self.enter_scope();
        let result = self.compile_function_body(sig, body, name);
        let num_locals = self.symbol_table.num_definitions;
        let free_symbols = self.symbol_table.free_symbols.clone();
        let instructions = self.leave_scope();
        result?;

        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }

        let num_results = sig.results.iter().filter(|r| r.name.is_some()).count();
        Ok(CompiledFunction {
            name: name.to_string(),
            instructions,
            num_locals,
            num_params: sig.params.len(),
            num_results,
            free_count: free_symbols.len(),
        })
    }

    fn compile_function_body(
        &mut self,
        sig: &FuncSig,
        body: &Block,
        name: &str,
    ) -> Result<(), CompileError> {
        if !name.is_empty() {
            let ty = self.symbol_table.resolve(name).and_then(|s| s.ty);
            self.symbol_table.define_function_name(name, ty);
        }
        for param in &sig.params {
            let default = default_of_elem(&param.elem);
            self.symbol_table
                .define_with_type(&param.name, Some(default));
        }
        for result in &sig.results {
            if let Some(result_name) = &result.name {
                let default = default_of_elem(&result.elem);
                self.symbol_table
                    .define_with_type(result_name, Some(default));
            }
        }

        self.compile_block(body, None)?;
        if !(self.last_instruction_is(OpCode::ReturnValue)
            || self.last_instruction_is(OpCode::Return))
        {
            self.emit(OpCode::Return, &[]);
        }
        Ok(())
    }

    /// Compile a call expression, returning the static types of the values
    /// it leaves behind (one entry per produced value).
    fn compile_call_for_targets(
        &mut self,
        node: &CallExpr,
    ) -> Result<Vec<Option<Value>>, CompileError> {
        match node.fun.as_ref() {
            Expr::Ident(ident) => {
                let Some(symbol) = self.symbol_table.resolve(&ident.name) else {
                    return Err(CompileError::Undefined(ident.name.clone()));
                };
                self.load_symbol(&symbol);

                match &symbol.ty {
                    Some(Value::Function(sig)) => {
                        let sig = sig.clone();
                        self.compile_call_of(&sig, &node.args)
                    }
                    Some(Value::Builtin(idx)) => {
                        let result_count = gosling_object::BUILTINS[*idx].result_count;
                        for arg in &node.args {
                            self.compile_expr(arg, None)?;
                        }
                        self.emit(OpCode::Call, &[node.args.len()]);
                        Ok(vec![None; result_count])
                    }
                    _ => {
                        for arg in &node.args {
                            self.compile_expr(arg, None)?;
                        }
                        self.emit(OpCode::Call, &[node.args.len()]);
                        Ok(vec![None])
                    }
                }
            }
            Expr::FuncLit(lit) => {
                let symbol = self.compile_func_lit(lit)?;
                let Some(Value::Function(sig)) = symbol.ty else {
                    unreachable!("function literal has a signature");
                };
                self.compile_call_of(&sig, &node.args)
            }
            Expr::Call(inner) => {
                self.compile_call_for_targets(inner)?;
                for arg in &node.args {
                    self.compile_expr(arg, None)?;
                }
                self.emit(OpCode::Call, &[node.args.len()]);
                Ok(vec![None])
            }
            other => Err(self.err_at(other.span(), "cannot call this expression")),
        }
    }

    /// Emit arguments, named-result padding, and the call itself for a
    /// callee with a known signature.
    fn compile_call_of(
        &mut self,
        sig: &FuncSig,
        args: &[Expr],
    ) -> Result<Vec<Option<Value>>, CompileError> {
        for arg in args {
            self.compile_expr(arg, None)?;
        }
        let mut padded = 0;
        for result in &sig.results {
            if result.name.is_some() {
                let default = default_of_elem(&result.elem);
                let idx = self.add_constant(default);
                self.emit(OpCode::Const, &[idx]);
                padded += 1;
            }
        }
        self.emit(OpCode::Call, &[args.len() + padded]);

        match sig.results.first() {
            Some(first) if first.func.is_some() => {
                let nested = first.func.clone().unwrap();
                Ok(vec![Some(Value::Function(Rc::new(*nested)))])
            }
            Some(_) => Ok(sig
                .results
                .iter()
                .map(|r| Some(default_of_elem(&r.elem)))
                .collect()),
            None => Ok(vec![None]),
        }
    }

    fn compile_composite(
        &mut self,
        node: &CompositeLit,
        default: Option<&Value>,
    ) -> Result<Option<Value>, CompileError> {
        match &node.ty {
            Some(TypeExpr::Array { elem, .. }) => {
                let elem_template = default_of_type_expr(elem);
                for elt in &node.elts {
                    let CompositeElt::Value(value) = elt else {
                        return Err(
                            self.err_at(node.span, "keyed elements are not allowed in arrays")
                        );
                    };
                    self.compile_expr(value, Some(&elem_template))?;
                }
                self.emit(OpCode::Array, &[node.elts.len()]);
                let ty = crate::program::lower_type_expr(node.ty.as_ref().unwrap());
                Ok(Some(default_of_elem(&ty)))
            }
            Some(TypeExpr::Map { key, value, .. }) => {
                let key_template = default_of_type_expr(key);
                let value_template = default_of_type_expr(value);
                if !key_template.type_tag().is_hashable() {
                    return Err(self.err_at(key.span(), "key not a HashKey type"));
                }
                for elt in &node.elts {
                    let CompositeElt::KeyValue { key, value } = elt else {
                        return Err(self.err_at(node.span, "map literal requires key:value pairs"));
                    };
                    self.compile_expr(key, Some(&key_template))?;
                    self.compile_expr(value, Some(&value_template))?;
                }
                self.emit(OpCode::Hash, &[node.elts.len() * 2]);
                let ty = crate::program::lower_type_expr(node.ty.as_ref().unwrap());
                Ok(Some(default_of_elem(&ty)))
            }
            Some(other) => Err(self.err_at(other.span(), "unsupported composite literal type")),
            None => {
                // Untyped form: the context supplies the type.
                let is_keyed = matches!(node.elts.first(), Some(CompositeElt::KeyValue { .. }));
                match default {
                    Some(Value::Hash(template)) if is_keyed || node.elts.is_empty() => {
                        let (key_template, value_template) = {
                            let t = template.borrow();
                            (
                                gosling_object::default_of_tag(
                                    t.key_type.unwrap_or(TypeTag::Null),
                                ),
                                gosling_object::default_of_tag(
                                    t.value_type.unwrap_or(TypeTag::Null),
                                ),
                            )
                        };
                        for elt in &node.elts {
                            let CompositeElt::KeyValue { key, value } = elt else {
                                return Err(
                                    self.err_at(node.span, "map literal requires key:value pairs")
                                );
                            };
                            self.compile_expr(key, Some(&key_template))?;
                            self.compile_expr(value, Some(&value_template))?;
                        }
                        self.emit(OpCode::Hash, &[node.elts.len() * 2]);
                        Ok(None)
                    }
                    Some(Value::Array(template)) => {
                        let elem_template =
                            gosling_object::default_of_tag(template.borrow().elem_type);
                        for elt in &node.elts {
                            let CompositeElt::Value(value) = elt else {
                                return Err(self.err_at(
                                    node.span,
                                    "keyed elements are not allowed in arrays",
                                ));
                            };
                            self.compile_expr(value, Some(&elem_template))?;
                        }
                        self.emit(OpCode::Array, &[node.elts.len()]);
                        Ok(None)
                    }
                    _ => Err(self.err_at(
                        node.span,
                        "cannot determine the type of this composite literal",
                    )),
                }
            }
        }
    }
}

fn free_refs(symbols: &[Symbol]) -> Vec<FreeRef> {
    symbols
        .iter()
        .map(|s| match s.scope {
            SymbolScope::Free => FreeRef::Free(s.index),
            _ => FreeRef::Local(s.index),
        })
        .collect()
}

/// The zero value a missing hash key produces, from the container's
/// static value type.
fn hash_value_default(container: &Option<Value>) -> Option<Value> {
    match container {
        Some(Value::Hash(hash)) => {
            let value_type = hash.borrow().value_type?;
            Some(default_of_tag(value_type))
        }
        _ => None,
    }
}

/// The zero value of an array element, from the container's static type.
fn array_elem_default(container: &Option<Value>) -> Option<Value> {
    match container {
        Some(Value::Array(arr)) => Some(default_of_tag(arr.borrow().elem_type)),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
