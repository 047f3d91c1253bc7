//! Resolver (`spec.md` §4.3): scope binding, const folding, and async
//! propagation over the untyped AST, producing the side tables the
//! bytecode emitter consumes.
//!
//! Grounded on the teacher's name-resolution pass that turns Python's
//! dynamic scoping into slot-indexed locals before bytecode emission;
//! generalized here to also propagate "this function may suspend" status
//! transitively through the call graph, since Jactl callers must be
//! compiled to tolerate a callee suspending underneath them (`spec.md`
//! §3.6).

use std::collections::{HashMap, HashSet};

use crate::{
    ast::{Block, Expression, FuncDecl, Literal, Param, Pattern, Program, Statement},
    class::ClassRegistry,
    error::{CompileError, CompileErrors},
    intern::StringId,
    value::Value,
};

pub type FunctionId = u32;

/// Resolved location of a local or captured variable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local(u32),
    /// Index into the enclosing closure's capture list.
    Capture(u32),
    Global(u32),
    /// Unresolved name read/written against the host-supplied globals map
    /// (`spec.md` §3.8) rather than against any lexical scope.
    HostGlobal(StringId),
}

#[derive(Debug, Default)]
pub struct ResolvedFunction {
    pub name: Option<StringId>,
    pub param_count: usize,
    pub local_count: u32,
    pub is_async: bool,
    pub captures: Vec<StringId>,
}

/// Per-program resolution output, keyed by each AST node's byte offset
/// (offsets are unique per node within one parse since the lexer only
/// advances, matching how the teacher keys its own side tables).
#[derive(Debug, Default)]
pub struct ResolvedProgram {
    pub bindings: HashMap<u32, Binding>,
    pub functions: Vec<ResolvedFunction>,
    pub function_ids: HashMap<StringId, FunctionId>,
    pub const_values: HashMap<u32, Value>,
    pub switch_is_exhaustive: HashMap<u32, bool>,
    /// Slot count for the top-level script body, one shared scope across
    /// every top-level statement (so `def x = 1;` in one statement stays
    /// visible to the next, mirroring a function body's single `FunctionCtx`).
    pub script_local_count: u32,
    /// Closure-literal byte offset → the `FunctionId` assigned to its body
    /// in `functions`. Assigned only after every named function/method has
    /// its own id, so closures never shift a named function's position.
    pub closure_function_ids: HashMap<u32, FunctionId>,
    /// Closure-literal byte offset → where each of its captured names
    /// resolves in the *enclosing* function's own scope, in the same order
    /// as the closure's own `captures` list.
    pub closure_captures: HashMap<u32, Vec<Binding>>,
}

struct Scope {
    vars: HashMap<StringId, u32>,
}

struct FunctionCtx {
    scopes: Vec<Scope>,
    next_local: u32,
    captures: Vec<StringId>,
    capture_index: HashMap<StringId, u32>,
    calls: HashSet<StringId>,
    is_async_name_call: bool,
    /// True only for a closure body (`resolve_closure`). A named
    /// function/method body or the top-level script has no enclosing
    /// lexical scope to capture from, so an unresolved identifier there
    /// must be a host global, never a capture.
    is_closure: bool,
}

impl FunctionCtx {
    fn new() -> Self {
        Self { scopes: vec![Scope { vars: HashMap::new() }], next_local: 0, captures: Vec::new(), capture_index: HashMap::new(), calls: HashSet::new(), is_async_name_call: false, is_closure: false }
    }

    fn new_closure() -> Self {
        let mut ctx = Self::new();
        ctx.is_closure = true;
        ctx
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope { vars: HashMap::new() });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: StringId) -> u32 {
        let slot = self.next_local;
        self.next_local += 1;
        self.scopes.last_mut().unwrap().vars.insert(name, slot);
        slot
    }

    fn lookup_local(&self, name: StringId) -> Option<u32> {
        for scope in self.scopes.iter().rev() {
            if let Some(&slot) = scope.vars.get(&name) {
                return Some(slot);
            }
        }
        None
    }
}

pub struct Resolver<'a> {
    classes: &'a ClassRegistry,
    errors: Vec<CompileError>,
    source_name: String,
    out: ResolvedProgram,
    global_functions: HashMap<StringId, FunctionId>,
    builtin_async_names: HashSet<String>,
    /// Interned `"this"`, declared as local 0 ahead of every instance
    /// method's own parameters (`spec.md` §3.5).
    this_id: StringId,
    /// Interned `"it"`, declared as local 0 in a closure whose parameter
    /// list is empty (`spec.md` §3.6, trailing-closure shorthand).
    it_id: StringId,
    /// Closures discovered mid-resolution, staged here and only appended
    /// to `out.functions` once every named function/method has been
    /// resolved, so `global_functions`' pre-assigned ids keep matching
    /// their final position.
    pending_closures: Vec<(u32, ResolvedFunction)>,
}

impl<'a> Resolver<'a> {
    pub fn new(classes: &'a ClassRegistry, source_name: impl Into<String>, builtin_async_names: HashSet<String>, this_id: StringId, it_id: StringId) -> Self {
        Self {
            classes,
            errors: Vec::new(),
            source_name: source_name.into(),
            out: ResolvedProgram::default(),
            global_functions: HashMap::new(),
            builtin_async_names,
            this_id,
            it_id,
            pending_closures: Vec::new(),
        }
    }

    pub fn resolve(mut self, program: &Program, interns: &crate::intern::Interns) -> Result<ResolvedProgram, CompileErrors> {
        for (idx, f) in program.functions.iter().enumerate() {
            self.global_functions.insert(f.name, idx as FunctionId);
        }
        for class in &program.classes {
            for m in class.methods.iter().chain(class.static_methods.iter()) {
                let idx = self.out.functions.len() as FunctionId;
                self.global_functions.insert(m.name, idx);
                self.out.functions.push(ResolvedFunction::default());
            }
        }
        self.out.functions.clear();
        self.out.function_ids = self.global_functions.clone();

        let mut pending_async_names: HashSet<StringId> = HashSet::new();
        let mut call_graph: HashMap<StringId, HashSet<StringId>> = HashMap::new();
        for f in &program.functions {
            let (resolved, calls) = self.resolve_function(f, false);
            if calls.iter().any(|c| self.builtin_async_names.contains(interns.get(*c))) {
                pending_async_names.insert(f.name);
            }
            call_graph.insert(f.name, calls);
            self.out.functions.push(resolved);
        }
        for class in &program.classes {
            for m in &class.methods {
                let (resolved, calls) = self.resolve_function(m, true);
                if calls.iter().any(|c| self.builtin_async_names.contains(interns.get(*c))) {
                    pending_async_names.insert(m.name);
                }
                call_graph.insert(m.name, calls);
                self.out.functions.push(resolved);
            }
            for m in &class.static_methods {
                let (resolved, calls) = self.resolve_function(m, false);
                if calls.iter().any(|c| self.builtin_async_names.contains(interns.get(*c))) {
                    pending_async_names.insert(m.name);
                }
                call_graph.insert(m.name, calls);
                self.out.functions.push(resolved);
            }
        }

        self.propagate_async(&call_graph, interns, &pending_async_names);

        let mut fctx = FunctionCtx::new();
        for stmt in &program.statements {
            self.resolve_statement(stmt, &mut fctx);
        }
        self.out.script_local_count = fctx.next_local;

        let base = self.out.functions.len() as FunctionId;
        for (i, (offset, rf)) in std::mem::take(&mut self.pending_closures).into_iter().enumerate() {
            self.out.closure_function_ids.insert(offset, base + i as FunctionId);
            self.out.functions.push(rf);
        }

        if self.errors.is_empty() {
            Ok(self.out)
        } else {
            Err(CompileErrors(self.errors))
        }
    }

    /// Fixed-point closure over the call graph: a function is async if it
    /// calls a known async builtin, or calls another function already
    /// known to be async (`spec.md` §3.6, "async transparency").
    fn propagate_async(&mut self, call_graph: &HashMap<StringId, HashSet<StringId>>, interns: &crate::intern::Interns, seed: &HashSet<StringId>) {
        let mut async_set: HashSet<StringId> = seed.clone();
        loop {
            let mut changed = false;
            for (name, calls) in call_graph {
                if async_set.contains(name) {
                    continue;
                }
                let calls_async_builtin = calls.iter().any(|c| self.builtin_async_names.contains(interns.get(*c)));
                let calls_async_fn = calls.iter().any(|c| async_set.contains(c));
                if calls_async_builtin || calls_async_fn {
                    async_set.insert(*name);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for (name, &id) in &self.global_functions {
            if let Some(rf) = self.out.functions.get_mut(id as usize) {
                rf.is_async = async_set.contains(name);
            }
        }
    }

    fn resolve_function(&mut self, f: &FuncDecl, is_method: bool) -> (ResolvedFunction, HashSet<StringId>) {
        let mut fctx = FunctionCtx::new();
        if is_method {
            fctx.declare(self.this_id);
        }
        for p in &f.params {
            fctx.declare(p.name);
        }
        self.resolve_block(&f.body, &mut fctx);
        let mut calls = HashSet::new();
        collect_calls(&f.body, &mut calls);
        (
            ResolvedFunction {
                name: Some(f.name),
                param_count: f.params.len() + usize::from(is_method),
                local_count: fctx.next_local,
                is_async: false,
                captures: fctx.captures,
            },
            calls,
        )
    }

    fn resolve_block(&mut self, block: &Block, fctx: &mut FunctionCtx) {
        fctx.push_scope();
        for stmt in block {
            self.resolve_statement(stmt, fctx);
        }
        fctx.pop_scope();
    }

    fn resolve_statement(&mut self, stmt: &Statement, fctx: &mut FunctionCtx) {
        match stmt {
            Statement::VarDecl { name, init, offset, .. } => {
                if let Some(e) = init {
                    self.resolve_expr(e, fctx);
                }
                let slot = fctx.declare(*name);
                self.out.bindings.insert(*offset, Binding::Local(slot));
            }
            Statement::ConstDecl { name, init, offset } => {
                self.resolve_expr(init, fctx);
                if let Some(v) = const_fold(init) {
                    self.out.const_values.insert(*offset, v);
                }
                let slot = fctx.declare(*name);
                self.out.bindings.insert(*offset, Binding::Local(slot));
            }
            Statement::FuncDecl(_) | Statement::ClassDecl(_) | Statement::Import(_) | Statement::Package(_) => {}
            Statement::Block(b) => self.resolve_block(b, fctx),
            Statement::If { cond, then_branch, else_branch, .. } => {
                self.resolve_expr(cond, fctx);
                self.resolve_block(then_branch, fctx);
                if let Some(e) = else_branch {
                    self.resolve_block(e, fctx);
                }
            }
            Statement::For { init, cond, update, body, .. } => {
                fctx.push_scope();
                if let Some(s) = init {
                    self.resolve_statement(s, fctx);
                }
                if let Some(c) = cond {
                    self.resolve_expr(c, fctx);
                }
                if let Some(s) = update {
                    self.resolve_statement(s, fctx);
                }
                self.resolve_block(body, fctx);
                fctx.pop_scope();
            }
            Statement::While { cond, body, .. } => {
                self.resolve_expr(cond, fctx);
                self.resolve_block(body, fctx);
            }
            Statement::DoUntil { body, cond, .. } => {
                self.resolve_block(body, fctx);
                self.resolve_expr(cond, fctx);
            }
            Statement::Return { value, .. } => {
                if let Some(v) = value {
                    self.resolve_expr(v, fctx);
                }
            }
            Statement::Break { .. } | Statement::Continue { .. } => {}
            Statement::Die { value, .. } => self.resolve_expr(value, fctx),
            Statement::ExprStmt(e) => self.resolve_expr(e, fctx),
            Statement::Switch { subject, arms, offset } => {
                self.resolve_expr(subject, fctx);
                let exhaustive = arms.iter().any(|a| matches!(a.pattern, Pattern::Wildcard | Pattern::Any));
                self.out.switch_is_exhaustive.insert(*offset, exhaustive);
                for arm in arms {
                    fctx.push_scope();
                    self.bind_pattern(&arm.pattern, fctx);
                    if let Some(g) = &arm.guard {
                        self.resolve_expr(g, fctx);
                    }
                    self.resolve_expr(&arm.body, fctx);
                    fctx.pop_scope();
                }
            }
        }
    }

    fn bind_pattern(&mut self, pattern: &Pattern, fctx: &mut FunctionCtx) {
        match pattern {
            Pattern::Binding(name, offset) => {
                let slot = fctx.declare(*name);
                self.out.bindings.insert(*offset, Binding::Local(slot));
            }
            Pattern::List(items) => items.iter().for_each(|p| self.bind_pattern(p, fctx)),
            Pattern::Map(entries) => entries.iter().for_each(|(_, p)| self.bind_pattern(p, fctx)),
            // Evaluated after any sibling bindings declared earlier in the
            // same pattern, so it can reference them (`[a,${a+2}]`).
            Pattern::Computed(expr) => self.resolve_expr(expr, fctx),
            _ => {}
        }
    }

    fn resolve_expr(&mut self, expr: &Expression, fctx: &mut FunctionCtx) {
        match expr {
            Expression::Literal { .. } => {}
            Expression::Identifier { name, offset } => {
                if let Some(slot) = fctx.lookup_local(*name) {
                    self.out.bindings.insert(*offset, Binding::Local(slot));
                } else if let Some(&id) = self.global_functions.get(name) {
                    self.out.bindings.insert(*offset, Binding::Global(id));
                } else if fctx.is_closure {
                    let idx = fctx.capture_index.len() as u32;
                    let idx = *fctx.capture_index.entry(*name).or_insert_with(|| {
                        fctx.captures.push(*name);
                        idx
                    });
                    self.out.bindings.insert(*offset, Binding::Capture(idx));
                } else {
                    self.out.bindings.insert(*offset, Binding::HostGlobal(*name));
                }
            }
            Expression::Binop { lhs, rhs, .. } => {
                self.resolve_expr(lhs, fctx);
                self.resolve_expr(rhs, fctx);
            }
            Expression::Unop { operand, .. } => self.resolve_expr(operand, fctx),
            Expression::Assign { target, value, .. } => {
                self.resolve_expr(target, fctx);
                self.resolve_expr(value, fctx);
            }
            Expression::Ternary { cond, then_expr, else_expr, .. } => {
                self.resolve_expr(cond, fctx);
                self.resolve_expr(then_expr, fctx);
                self.resolve_expr(else_expr, fctx);
            }
            Expression::Elvis { lhs, rhs, .. } => {
                self.resolve_expr(lhs, fctx);
                self.resolve_expr(rhs, fctx);
            }
            Expression::Call { callee, args, trailing_closure, .. } => {
                self.resolve_expr(callee, fctx);
                args.iter().for_each(|a| self.resolve_expr(a, fctx));
                if let Some(c) = trailing_closure {
                    self.resolve_expr(c, fctx);
                }
            }
            Expression::MethodCall { receiver, args, trailing_closure, .. } => {
                self.resolve_expr(receiver, fctx);
                args.iter().for_each(|a| self.resolve_expr(a, fctx));
                if let Some(c) = trailing_closure {
                    self.resolve_expr(c, fctx);
                }
            }
            Expression::FieldAccess { receiver, .. } => self.resolve_expr(receiver, fctx),
            Expression::Index { receiver, index, .. } => {
                self.resolve_expr(receiver, fctx);
                self.resolve_expr(index, fctx);
            }
            Expression::NewInstance { positional, named, .. } => {
                positional.iter().for_each(|a| self.resolve_expr(a, fctx));
                named.iter().for_each(|(_, a)| self.resolve_expr(a, fctx));
            }
            Expression::ListLit { elements, .. } => elements.iter().for_each(|e| self.resolve_expr(e, fctx)),
            Expression::MapLit { entries, .. } => entries.iter().for_each(|(k, v)| {
                self.resolve_expr(k, fctx);
                self.resolve_expr(v, fctx);
            }),
            Expression::ClosureLit { params, body, offset } => {
                self.resolve_closure(params, body, *offset, fctx);
            }
            Expression::RegexMatch { subject, .. } => self.resolve_expr(subject, fctx),
            Expression::RegexSubst { subject, .. } => self.resolve_expr(subject, fctx),
            Expression::StringInterp { parts, .. } => {
                for part in parts {
                    if let crate::ast::InterpPart::Expr(e) = part {
                        self.resolve_expr(e, fctx);
                    }
                }
            }
            Expression::Switch { subject, arms, offset } => {
                self.resolve_expr(subject, fctx);
                let exhaustive = arms.iter().any(|a| matches!(a.pattern, Pattern::Wildcard | Pattern::Any));
                self.out.switch_is_exhaustive.insert(*offset, exhaustive);
                for arm in arms {
                    fctx.push_scope();
                    self.bind_pattern(&arm.pattern, fctx);
                    if let Some(g) = &arm.guard {
                        self.resolve_expr(g, fctx);
                    }
                    self.resolve_expr(&arm.body, fctx);
                    fctx.pop_scope();
                }
            }
            Expression::InstanceOf { value, .. } | Expression::As { value, .. } | Expression::Cast { value, .. } => {
                self.resolve_expr(value, fctx);
            }
            Expression::In { value, collection, .. } => {
                self.resolve_expr(value, fctx);
                self.resolve_expr(collection, fctx);
            }
            Expression::MultiAssign { targets, value, .. } => {
                targets.iter().for_each(|t| self.resolve_expr(t, fctx));
                self.resolve_expr(value, fctx);
            }
            Expression::Do { body, .. } => self.resolve_block(body, fctx),
            Expression::Checkpoint { commit, recover, .. } => {
                self.resolve_expr(commit, fctx);
                self.resolve_expr(recover, fctx);
            }
            Expression::MatchGroup { .. } => {}
        }
    }

    /// Resolves a closure body in its own fresh scope, then records how
    /// each name it couldn't find locally resolves in `outer` — recursing
    /// the same capture-or-local decision `outer` itself would make for a
    /// plain identifier, so nested closures chain captures transitively.
    fn resolve_closure(&mut self, params: &[Param], body: &Block, offset: u32, outer: &mut FunctionCtx) {
        let mut inner = FunctionCtx::new_closure();
        if params.is_empty() {
            inner.declare(self.it_id);
        }
        for p in params {
            inner.declare(p.name);
        }
        for stmt in body {
            self.resolve_statement(stmt, &mut inner);
        }
        let rf = ResolvedFunction {
            name: None,
            param_count: if params.is_empty() { 1 } else { params.len() },
            local_count: inner.next_local,
            is_async: false,
            captures: inner.captures.clone(),
        };
        let mut capture_bindings = Vec::with_capacity(inner.captures.len());
        for name in &inner.captures {
            let binding = if let Some(slot) = outer.lookup_local(*name) {
                Binding::Local(slot)
            } else {
                let idx = *outer.capture_index.entry(*name).or_insert_with(|| {
                    let idx = outer.captures.len() as u32;
                    outer.captures.push(*name);
                    idx
                });
                Binding::Capture(idx)
            };
            capture_bindings.push(binding);
        }
        self.out.closure_captures.insert(offset, capture_bindings);
        self.pending_closures.push((offset, rf));
    }
}

fn collect_calls(block: &Block, out: &mut HashSet<StringId>) {
    for stmt in block {
        collect_calls_stmt(stmt, out);
    }
}

fn collect_calls_stmt(stmt: &Statement, out: &mut HashSet<StringId>) {
    match stmt {
        Statement::VarDecl { init: Some(e), .. } | Statement::Die { value: e, .. } => collect_calls_expr(e, out),
        Statement::ConstDecl { init, .. } => collect_calls_expr(init, out),
        Statement::Block(b) => collect_calls(b, out),
        Statement::If { cond, then_branch, else_branch, .. } => {
            collect_calls_expr(cond, out);
            collect_calls(then_branch, out);
            if let Some(e) = else_branch {
                collect_calls(e, out);
            }
        }
        Statement::For { cond, body, .. } => {
            if let Some(c) = cond {
                collect_calls_expr(c, out);
            }
            collect_calls(body, out);
        }
        Statement::While { cond, body, .. } => {
            collect_calls_expr(cond, out);
            collect_calls(body, out);
        }
        Statement::DoUntil { body, cond, .. } => {
            collect_calls(body, out);
            collect_calls_expr(cond, out);
        }
        Statement::Return { value: Some(v), .. } => collect_calls_expr(v, out),
        Statement::ExprStmt(e) => collect_calls_expr(e, out),
        Statement::Switch { subject, arms, .. } => {
            collect_calls_expr(subject, out);
            for arm in arms {
                collect_calls_expr(&arm.body, out);
            }
        }
        _ => {}
    }
}

fn collect_calls_expr(expr: &Expression, out: &mut HashSet<StringId>) {
    match expr {
        Expression::Call { callee, args, .. } => {
            if let Expression::Identifier { name, .. } = callee.as_ref() {
                out.insert(*name);
            }
            args.iter().for_each(|a| collect_calls_expr(a, out));
        }
        Expression::MethodCall { receiver, method, args, .. } => {
            out.insert(*method);
            collect_calls_expr(receiver, out);
            args.iter().for_each(|a| collect_calls_expr(a, out));
        }
        Expression::Binop { lhs, rhs, .. } => {
            collect_calls_expr(lhs, out);
            collect_calls_expr(rhs, out);
        }
        Expression::Unop { operand, .. } => collect_calls_expr(operand, out),
        Expression::Assign { target, value, .. } => {
            collect_calls_expr(target, out);
            collect_calls_expr(value, out);
        }
        Expression::Ternary { cond, then_expr, else_expr, .. } => {
            collect_calls_expr(cond, out);
            collect_calls_expr(then_expr, out);
            collect_calls_expr(else_expr, out);
        }
        Expression::Elvis { lhs, rhs, .. } => {
            collect_calls_expr(lhs, out);
            collect_calls_expr(rhs, out);
        }
        Expression::FieldAccess { receiver, .. } => collect_calls_expr(receiver, out),
        Expression::Index { receiver, index, .. } => {
            collect_calls_expr(receiver, out);
            collect_calls_expr(index, out);
        }
        Expression::ListLit { elements, .. } => elements.iter().for_each(|e| collect_calls_expr(e, out)),
        Expression::MapLit { entries, .. } => entries.iter().for_each(|(k, v)| {
            collect_calls_expr(k, out);
            collect_calls_expr(v, out);
        }),
        Expression::Do { body, .. } => collect_calls(body, out),
        _ => {}
    }
}

/// Folds a small family of compile-time-constant expressions (used for
/// `const` field/variable declarations, `spec.md` §3.5).
pub fn const_fold(expr: &Expression) -> Option<Value> {
    match expr {
        Expression::Literal { value, .. } => literal_to_value(value),
        _ => None,
    }
}

pub fn literal_to_value(lit: &Literal) -> Option<Value> {
    match lit {
        Literal::Null => Some(Value::Null),
        Literal::Bool(b) => Some(Value::Boolean(*b)),
        Literal::Byte(b) => Some(Value::Byte(*b)),
        Literal::Int(i) => Some(Value::Int(*i)),
        Literal::Long(l) => Some(Value::Long(*l)),
        Literal::Double(d) => Some(Value::Double(*d)),
        Literal::Decimal(s) => s.parse().ok().map(|d| Value::Decimal(std::rc::Rc::new(d))),
        Literal::Str(s) => Some(Value::Str(std::rc::Rc::from(s.as_str()))),
    }
}
