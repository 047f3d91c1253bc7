//! AST → bytecode emitter (`spec.md` §4.4), consuming the `Resolver`'s
//! binding table. One `CodeBuilder` per Jactl function/closure/method;
//! the top-level script body compiles to its own `Code` ("script_main").

use std::cell::RefCell;
use std::collections::HashMap;

use crate::{
    ast::{BinOp, Block, ClassDecl, Expression, FuncDecl, InterpPart, Literal, Pattern, Program, Statement, UnOp},
    bytecode::{
        builder::{CodeBuilder, Label},
        code::{Code, ConstValue},
        op::{CaptureSource, Opcode},
    },
    intern::StringId,
    resolver::{Binding, ResolvedProgram},
};

pub struct CompiledUnit {
    pub script_main: Code,
    pub functions: Vec<Code>,
}

struct LoopLabels {
    continue_label: Label,
    break_label: Label,
}

/// Container kind to materialize for a missing link in an auto-vivifying
/// assignment chain (`spec.md` §3.4).
#[derive(Clone, Copy)]
enum VivKind {
    List,
    Map,
}

/// Interned names of the three method calls the compiler recognizes for
/// `.map{...}.limit(n)`/`.filter{...}.limit(n)` fusion (`spec.md` §4.5:
/// `limit` must short-circuit the upstream collection walk rather than let
/// it materialize in full first).
#[derive(Clone, Copy)]
pub struct FusionIds {
    pub map: StringId,
    pub filter: StringId,
    pub limit: StringId,
}

pub struct Compiler<'a> {
    resolved: &'a ResolvedProgram,
    builder: CodeBuilder,
    loop_stack: Vec<LoopLabels>,
    async_builtin_ids: &'a HashMap<StringId, u32>,
    /// Host-registered synchronous functions (`spec.md` §6), checked as a
    /// second fallback after `async_builtin_ids` for a bare `name(...)`
    /// call with no matching local/global binding.
    sync_function_ids: &'a HashMap<StringId, u32>,
    fusion_ids: FusionIds,
    /// Every named function/method and every closure writes its compiled
    /// `Code` into this shared table at its own resolver-assigned index,
    /// so a closure nested arbitrarily deep can compile itself on the fly
    /// (via a fresh `Compiler` borrowing the same table) with no ordering
    /// dependency on how the top-level traversal visits declarations.
    functions_out: &'a RefCell<Vec<Option<Code>>>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        resolved: &'a ResolvedProgram,
        async_builtin_ids: &'a HashMap<StringId, u32>,
        sync_function_ids: &'a HashMap<StringId, u32>,
        fusion_ids: FusionIds,
        param_count: u32,
        functions_out: &'a RefCell<Vec<Option<Code>>>,
    ) -> Self {
        Self { resolved, builder: CodeBuilder::new(param_count), loop_stack: Vec::new(), async_builtin_ids, sync_function_ids, fusion_ids, functions_out }
    }

    pub fn compile_program(program: &Program, resolved: &ResolvedProgram, async_builtin_ids: &HashMap<StringId, u32>, sync_function_ids: &HashMap<StringId, u32>, fusion_ids: FusionIds) -> CompiledUnit {
        let functions_out = RefCell::new((0..resolved.functions.len()).map(|_| None).collect());

        let mut main = Compiler::new(resolved, async_builtin_ids, sync_function_ids, fusion_ids, 0, &functions_out);
        main.builder.local_count = resolved.script_local_count;
        // The script's own value is its last top-level expression statement,
        // same rule as a `do { ... }` block (`spec.md` §9's S1-S6 scenarios
        // all rely on this: none of them end in an explicit `return`).
        match program.statements.split_last() {
            None => main.builder.emit(Opcode::PushNull, 0),
            Some((last, init)) => {
                for stmt in init {
                    main.compile_statement(stmt);
                }
                match last {
                    Statement::ExprStmt(e) => main.compile_expr(e),
                    other => {
                        main.compile_statement(other);
                        main.builder.emit(Opcode::PushNull, 0);
                    }
                }
            }
        }
        main.builder.emit(Opcode::Return, 0);
        let script_main = main.builder.finish();

        for f in &program.functions {
            let id = resolved.function_ids[&f.name];
            let code = Self::compile_function(f, resolved, async_builtin_ids, sync_function_ids, fusion_ids, false, &functions_out);
            functions_out.borrow_mut()[id as usize] = Some(code);
        }
        for class in &program.classes {
            for m in &class.methods {
                let id = resolved.function_ids[&m.name];
                let code = Self::compile_function(m, resolved, async_builtin_ids, sync_function_ids, fusion_ids, true, &functions_out);
                functions_out.borrow_mut()[id as usize] = Some(code);
            }
            for m in &class.static_methods {
                let id = resolved.function_ids[&m.name];
                let code = Self::compile_function(m, resolved, async_builtin_ids, sync_function_ids, fusion_ids, false, &functions_out);
                functions_out.borrow_mut()[id as usize] = Some(code);
            }
        }
        let functions = functions_out.into_inner().into_iter().map(|c| c.expect("every resolved function/closure is compiled")).collect();
        CompiledUnit { script_main, functions }
    }

    fn compile_function(
        f: &FuncDecl,
        resolved: &ResolvedProgram,
        async_builtin_ids: &HashMap<StringId, u32>,
        sync_function_ids: &HashMap<StringId, u32>,
        fusion_ids: FusionIds,
        is_method: bool,
        functions_out: &RefCell<Vec<Option<Code>>>,
    ) -> Code {
        let param_count = f.params.len() as u32 + u32::from(is_method);
        let mut c = Compiler::new(resolved, async_builtin_ids, sync_function_ids, fusion_ids, param_count, functions_out);
        let rf = resolved.function_ids.get(&f.name).and_then(|&id| resolved.functions.get(id as usize));
        c.builder.is_async = rf.is_some_and(|rf| rf.is_async);
        c.builder.local_count = rf.map_or(param_count, |rf| rf.local_count.max(param_count));
        for stmt in &f.body {
            c.compile_statement(stmt);
        }
        c.builder.emit(Opcode::PushNull, f.offset);
        c.builder.emit(Opcode::Return, f.offset);
        c.builder.finish()
    }

    fn binding_of(&self, offset: u32) -> Option<Binding> {
        self.resolved.bindings.get(&offset).copied()
    }

    fn compile_statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::VarDecl { init, offset, .. } => {
                if let Some(e) = init {
                    self.compile_expr(e);
                } else {
                    self.builder.emit(Opcode::PushNull, *offset);
                }
                if let Some(Binding::Local(slot)) = self.binding_of(*offset) {
                    self.builder.emit(Opcode::StoreLocal(slot), *offset);
                }
                self.builder.emit(Opcode::Pop, *offset);
            }
            Statement::ConstDecl { init, offset, .. } => {
                self.compile_expr(init);
                if let Some(Binding::Local(slot)) = self.binding_of(*offset) {
                    self.builder.emit(Opcode::StoreLocal(slot), *offset);
                }
                self.builder.emit(Opcode::Pop, *offset);
            }
            Statement::FuncDecl(_) | Statement::ClassDecl(_) | Statement::Import(_) | Statement::Package(_) => {}
            Statement::Block(b) => self.compile_block(b),
            Statement::If { cond, then_branch, else_branch, offset } => {
                let else_label = self.builder.new_label();
                let end_label = self.builder.new_label();
                self.compile_expr(cond);
                self.builder.emit_jump_if_false(else_label, *offset);
                self.compile_block(then_branch);
                self.builder.emit_jump(end_label, *offset);
                self.builder.bind_label(else_label);
                if let Some(e) = else_branch {
                    self.compile_block(e);
                }
                self.builder.bind_label(end_label);
            }
            Statement::For { init, cond, update, body, offset } => {
                if let Some(s) = init {
                    self.compile_statement(s);
                }
                let top = self.builder.new_label();
                let continue_label = self.builder.new_label();
                let end_label = self.builder.new_label();
                self.builder.bind_label(top);
                if let Some(c) = cond {
                    self.compile_expr(c);
                    self.builder.emit_jump_if_false(end_label, *offset);
                }
                self.loop_stack.push(LoopLabels { continue_label, break_label: end_label });
                self.compile_block(body);
                self.loop_stack.pop();
                self.builder.bind_label(continue_label);
                if let Some(s) = update {
                    self.compile_statement(s);
                }
                self.builder.emit_jump(top, *offset);
                self.builder.bind_label(end_label);
            }
            Statement::While { cond, body, offset } => {
                let top = self.builder.new_label();
                let end_label = self.builder.new_label();
                self.builder.bind_label(top);
                self.compile_expr(cond);
                self.builder.emit_jump_if_false(end_label, *offset);
                self.loop_stack.push(LoopLabels { continue_label: top, break_label: end_label });
                self.compile_block(body);
                self.loop_stack.pop();
                self.builder.emit_jump(top, *offset);
                self.builder.bind_label(end_label);
            }
            Statement::DoUntil { body, cond, offset } => {
                let top = self.builder.new_label();
                let continue_label = self.builder.new_label();
                let end_label = self.builder.new_label();
                self.builder.bind_label(top);
                self.loop_stack.push(LoopLabels { continue_label, break_label: end_label });
                self.compile_block(body);
                self.loop_stack.pop();
                self.builder.bind_label(continue_label);
                self.compile_expr(cond);
                self.builder.emit_jump_if_false(top, *offset);
                self.builder.bind_label(end_label);
            }
            Statement::Return { value, offset } => {
                if let Some(v) = value {
                    self.compile_expr(v);
                } else {
                    self.builder.emit(Opcode::PushNull, *offset);
                }
                self.builder.emit(Opcode::Return, *offset);
            }
            Statement::Break { offset } => {
                let label = self.loop_stack.last().expect("break outside loop").break_label;
                self.builder.emit_jump(label, *offset);
            }
            Statement::Continue { offset } => {
                let label = self.loop_stack.last().expect("continue outside loop").continue_label;
                self.builder.emit_jump(label, *offset);
            }
            Statement::Die { value, offset } => {
                self.compile_expr(value);
                self.builder.emit(Opcode::Die, *offset);
            }
            Statement::ExprStmt(e) => {
                self.compile_expr(e);
                self.builder.emit(Opcode::Pop, e.offset());
            }
            Statement::Switch { subject, arms, offset } => {
                self.compile_switch(subject, arms, *offset);
                self.builder.emit(Opcode::Pop, *offset);
            }
        }
    }

    fn compile_block(&mut self, block: &Block) {
        for stmt in block {
            self.compile_statement(stmt);
        }
    }

    /// Compiles `do { ... }` as a value-producing block: every statement
    /// but the last compiles as a plain statement (its value, if any,
    /// discarded), and the last becomes the block's own value — an
    /// expression statement leaves its value on the stack instead of
    /// popping it; anything else (e.g. an empty block) yields `null`.
    fn compile_do_block(&mut self, body: &Block, offset: u32) {
        match body.split_last() {
            None => self.builder.emit(Opcode::PushNull, offset),
            Some((last, init)) => {
                for stmt in init {
                    self.compile_statement(stmt);
                }
                match last {
                    Statement::ExprStmt(e) => self.compile_expr(e),
                    other => {
                        self.compile_statement(other);
                        self.builder.emit(Opcode::PushNull, offset);
                    }
                }
            }
        }
    }

    fn compile_expr(&mut self, expr: &Expression) {
        let offset = expr.offset();
        match expr {
            Expression::Literal { value, .. } => self.compile_literal(value, offset),
            Expression::Identifier { offset, .. } => match self.binding_of(*offset) {
                Some(Binding::Local(slot)) => self.builder.emit(Opcode::LoadLocal(slot), *offset),
                Some(Binding::Capture(idx)) => self.builder.emit(Opcode::LoadCapture(idx), *offset),
                Some(Binding::Global(id)) => self.builder.emit(Opcode::LoadGlobalFn(id), *offset),
                Some(Binding::HostGlobal(name)) => self.builder.emit(Opcode::LoadGlobal(name.raw()), *offset),
                None => self.builder.emit(Opcode::PushNull, *offset),
            },
            Expression::Binop { op, lhs, rhs, offset } => {
                if matches!(op, BinOp::And) {
                    let false_label = self.builder.new_label();
                    let end_label = self.builder.new_label();
                    self.compile_expr(lhs);
                    self.builder.emit(Opcode::Dup, *offset);
                    self.builder.emit_jump_if_false(false_label, *offset);
                    self.builder.emit(Opcode::Pop, *offset);
                    self.compile_expr(rhs);
                    self.builder.emit_jump(end_label, *offset);
                    self.builder.bind_label(false_label);
                    self.builder.bind_label(end_label);
                    return;
                }
                if matches!(op, BinOp::Or) {
                    let true_label = self.builder.new_label();
                    let end_label = self.builder.new_label();
                    self.compile_expr(lhs);
                    self.builder.emit(Opcode::Dup, *offset);
                    self.builder.emit_jump_if_true(true_label, *offset);
                    self.builder.emit(Opcode::Pop, *offset);
                    self.compile_expr(rhs);
                    self.builder.emit_jump(end_label, *offset);
                    self.builder.bind_label(true_label);
                    self.builder.bind_label(end_label);
                    return;
                }
                self.compile_expr(lhs);
                self.compile_expr(rhs);
                self.builder.emit(binop_to_opcode(*op), *offset);
            }
            Expression::Unop { op, operand, offset } => {
                self.compile_expr(operand);
                let opc = match op {
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Not => Opcode::Not,
                    UnOp::BitNot => Opcode::BitNot,
                };
                self.builder.emit(opc, *offset);
            }
            Expression::Assign { target, op, value, offset } => self.compile_assign(target, *op, value, *offset),
            Expression::Ternary { cond, then_expr, else_expr, offset } => {
                let else_label = self.builder.new_label();
                let end_label = self.builder.new_label();
                self.compile_expr(cond);
                self.builder.emit_jump_if_false(else_label, *offset);
                self.compile_expr(then_expr);
                self.builder.emit_jump(end_label, *offset);
                self.builder.bind_label(else_label);
                self.compile_expr(else_expr);
                self.builder.bind_label(end_label);
            }
            Expression::Elvis { lhs, rhs, offset } => {
                let end_label = self.builder.new_label();
                self.compile_expr(lhs);
                self.builder.emit_elvis_jump(end_label, *offset);
                self.builder.emit(Opcode::Pop, *offset);
                self.compile_expr(rhs);
                self.builder.bind_label(end_label);
            }
            Expression::Call { callee, args, trailing_closure, offset } => {
                // A bare call to a name that is a known async builtin (e.g.
                // `sleep(ms)`) has no receiver to carry a `CallMethod`, so it
                // is recognized directly from the callee's name rather than
                // going through a resolved `Binding` — mirroring how
                // `MethodCall` below special-cases async builtin names.
                if let Expression::Identifier { name, offset: id_offset } = callee.as_ref() {
                    if self.binding_of(*id_offset).is_none() {
                        if let Some(&builtin_id) = self.async_builtin_ids.get(name) {
                            let mut n = args.len() as u32;
                            for a in args {
                                self.compile_expr(a);
                            }
                            if let Some(c) = trailing_closure {
                                self.compile_expr(c);
                                n += 1;
                            }
                            let save_id = self.builder.reserve_save_point();
                            self.builder.emit(Opcode::SavePoint(save_id), *offset);
                            self.builder.emit(Opcode::CallBuiltin { id: builtin_id, arg_count: n }, *offset);
                            self.builder.mark_save_point_resume(save_id);
                            return;
                        }
                        // Host-registered synchronous function (`spec.md`
                        // §6) — never suspends, so no `SavePoint` is needed.
                        if let Some(&builtin_id) = self.sync_function_ids.get(name) {
                            let mut n = args.len() as u32;
                            for a in args {
                                self.compile_expr(a);
                            }
                            if let Some(c) = trailing_closure {
                                self.compile_expr(c);
                                n += 1;
                            }
                            self.builder.emit(Opcode::CallBuiltin { id: builtin_id, arg_count: n }, *offset);
                            return;
                        }
                    }
                }
                self.compile_expr(callee);
                let mut n = args.len() as u32;
                for a in args {
                    self.compile_expr(a);
                }
                if let Some(c) = trailing_closure {
                    self.compile_expr(c);
                    n += 1;
                }
                self.builder.emit(Opcode::Call(n), *offset);
            }
            Expression::MethodCall { receiver, method, args, trailing_closure, offset, .. } => {
                // `X.map{...}.limit(n)` / `X.filter{...}.limit(n)`: fuse
                // into a single native-iter call carrying the limit so the
                // VM can stop pulling from `X` once `n` results are
                // produced instead of materializing the whole map/filter
                // result first (`spec.md` §4.5, "limit short-circuits the
                // upstream walk"). Recognized only in this exact shape —
                // a `limit` called on anything else still just walks the
                // already-materialized collection.
                if *method == self.fusion_ids.limit && trailing_closure.is_none() && args.len() == 1 {
                    if let Expression::MethodCall { receiver: inner_recv, method: inner_method, args: inner_args, trailing_closure: Some(inner_closure), offset: inner_offset, .. } = receiver.as_ref() {
                        if inner_args.is_empty() && (*inner_method == self.fusion_ids.map || *inner_method == self.fusion_ids.filter) {
                            self.compile_expr(inner_recv);
                            self.compile_expr(&args[0]);
                            self.compile_expr(inner_closure);
                            self.builder.emit(Opcode::CallMethod { method: inner_method.raw(), arg_count: 2 }, *inner_offset);
                            return;
                        }
                    }
                }
                // Every method call, builtin or host-registered, dispatches
                // dynamically through `CallMethod`'s runtime lookup — no
                // method (stdlib or host) ever suspends the compiler's
                // SavePoint path the way a bare async function call does,
                // so there is no receiver-stranding hazard here.
                self.compile_expr(receiver);
                let mut n = args.len() as u32;
                for a in args {
                    self.compile_expr(a);
                }
                if let Some(c) = trailing_closure {
                    self.compile_expr(c);
                    n += 1;
                }
                self.builder.emit(Opcode::CallMethod { method: method.raw(), arg_count: n }, *offset);
            }
            Expression::FieldAccess { receiver, field, offset, .. } => {
                self.compile_expr(receiver);
                self.builder.emit(Opcode::GetField(field.raw()), *offset);
            }
            Expression::Index { receiver, index, offset } => {
                self.compile_expr(receiver);
                self.compile_expr(index);
                self.builder.emit(Opcode::Index, *offset);
            }
            Expression::NewInstance { class_name, positional, named, offset } => {
                for a in positional {
                    self.compile_expr(a);
                }
                for (name, a) in named {
                    // Field name travels as its raw `StringId`, not text: the
                    // compiler has no `Interns` handle to render it, and the
                    // VM only ever needs the id back to re-key into
                    // `ClassDef::field_index` (same convention as `GetField`/
                    // `SetField`'s operands).
                    self.builder.emit(Opcode::PushConst(self.const_int(name.raw() as i32)), *offset);
                    self.compile_expr(a);
                }
                let name_const = self.const_str(class_name.clone());
                self.builder.emit(
                    Opcode::NewInstance { class_name_const: name_const, positional_count: positional.len() as u32, named_count: named.len() as u32 },
                    *offset,
                );
            }
            Expression::ListLit { elements, offset } => {
                for e in elements {
                    self.compile_expr(e);
                }
                self.builder.emit(Opcode::MakeList(elements.len() as u32), *offset);
            }
            Expression::MapLit { entries, offset } => {
                for (k, v) in entries {
                    self.compile_expr(k);
                    self.compile_expr(v);
                }
                self.builder.emit(Opcode::MakeMap(entries.len() as u32), *offset);
            }
            Expression::ClosureLit { body, offset, .. } => {
                let function_id = *self.resolved.closure_function_ids.get(offset).expect("resolver assigns every closure an id");
                let rf = &self.resolved.functions[function_id as usize];
                let param_count = rf.param_count as u32;
                let mut inner = Compiler::new(self.resolved, self.async_builtin_ids, self.sync_function_ids, self.fusion_ids, param_count, self.functions_out);
                inner.builder.is_async = rf.is_async;
                inner.builder.local_count = rf.local_count.max(param_count);
                for stmt in body {
                    inner.compile_statement(stmt);
                }
                inner.builder.emit(Opcode::PushNull, *offset);
                inner.builder.emit(Opcode::Return, *offset);
                let code = inner.builder.finish();
                self.functions_out.borrow_mut()[function_id as usize] = Some(code);

                let capture_slots = self
                    .resolved
                    .closure_captures
                    .get(offset)
                    .map(|bindings| {
                        bindings
                            .iter()
                            .map(|b| match b {
                                Binding::Local(slot) => CaptureSource::Local(*slot),
                                Binding::Capture(idx) => CaptureSource::Capture(*idx),
                                Binding::Global(_) => unreachable!("global function refs aren't captured"),
                                Binding::HostGlobal(_) => unreachable!("host globals aren't captured, they're read fresh"),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.builder.emit(Opcode::MakeClosure { function_id, capture_slots }, *offset);
            }
            Expression::RegexMatch { pattern, modifiers, subject, offset } => {
                self.compile_expr(subject);
                let p = self.const_str(pattern.clone());
                let m = self.const_str(modifiers.clone());
                self.builder.emit(Opcode::RegexMatch { pattern: p, modifiers: m }, *offset);
            }
            Expression::RegexSubst { subject, pattern, replacement, modifiers, offset } => {
                self.compile_expr(subject);
                let p = self.const_str(pattern.clone());
                let r = self.const_str(replacement.clone());
                let m = self.const_str(modifiers.clone());
                self.builder.emit(Opcode::RegexSubst { pattern: p, replacement: r, modifiers: m }, *offset);
            }
            Expression::StringInterp { parts, offset } => {
                for part in parts {
                    match part {
                        InterpPart::Literal(s) => {
                            let c = self.const_str(s.clone());
                            self.builder.emit(Opcode::PushConst(c), *offset);
                        }
                        InterpPart::Expr(e) => self.compile_expr(e),
                    }
                }
                self.builder.emit(Opcode::StringConcat(parts.len() as u32), *offset);
            }
            Expression::Switch { subject, arms, offset } => self.compile_switch(subject, arms, *offset),
            Expression::InstanceOf { value, type_name, offset } => {
                self.compile_expr(value);
                let c = self.const_str(type_name.clone());
                self.builder.emit(Opcode::InstanceOf(c), *offset);
            }
            Expression::In { value, collection, negate, offset } => {
                self.compile_expr(value);
                self.compile_expr(collection);
                self.builder.emit(Opcode::Contains, *offset);
                if *negate {
                    self.builder.emit(Opcode::Not, *offset);
                }
            }
            Expression::As { value, type_name, offset } | Expression::Cast { value, type_name, offset } => {
                self.compile_expr(value);
                let c = self.const_str(type_name.clone());
                self.builder.emit(Opcode::CastTo(c), *offset);
            }
            Expression::MultiAssign { targets, value, offset } => {
                self.compile_expr(value);
                for (i, target) in targets.iter().enumerate() {
                    self.builder.emit(Opcode::Dup, *offset);
                    self.builder.emit(Opcode::PushConst(self.const_int(i as i32)), *offset);
                    self.builder.emit(Opcode::Index, *offset);
                    self.compile_store(target, *offset);
                    self.builder.emit(Opcode::Pop, *offset);
                }
            }
            Expression::Do { body, .. } => self.compile_do_block(body, offset),
            Expression::Checkpoint { commit, recover, offset } => {
                let recover_label = self.builder.new_label();
                let end_label = self.builder.new_label();
                self.builder.emit(Opcode::Checkpoint, *offset);
                self.builder.emit_jump_if_true(recover_label, *offset);
                self.compile_expr(commit);
                self.builder.emit_jump(end_label, *offset);
                self.builder.bind_label(recover_label);
                self.compile_expr(recover);
                self.builder.bind_label(end_label);
            }
            Expression::MatchGroup { index, offset } => {
                self.builder.emit(Opcode::LoadMatchGroup(*index), *offset);
            }
        }
    }

    fn compile_literal(&mut self, lit: &Literal, offset: u32) {
        match lit {
            Literal::Null => self.builder.emit(Opcode::PushNull, offset),
            Literal::Bool(true) => self.builder.emit(Opcode::PushTrue, offset),
            Literal::Bool(false) => self.builder.emit(Opcode::PushFalse, offset),
            Literal::Byte(b) => self.builder.emit(Opcode::PushConst(self.builder.add_const(ConstValue::Byte(*b))), offset),
            Literal::Int(i) => self.builder.emit(Opcode::PushConst(self.const_int(*i)), offset),
            Literal::Long(l) => self.builder.emit(Opcode::PushConst(self.builder.add_const(ConstValue::Long(*l))), offset),
            Literal::Double(d) => self.builder.emit(Opcode::PushConst(self.builder.add_const(ConstValue::Double(*d))), offset),
            Literal::Decimal(s) => self.builder.emit(Opcode::PushConst(self.builder.add_const(ConstValue::Decimal(s.clone()))), offset),
            Literal::Str(s) => self.builder.emit(Opcode::PushConst(self.const_str(s.clone())), offset),
        };
    }

    fn const_int(&mut self, v: i32) -> u32 {
        self.builder.add_const(ConstValue::Int(v))
    }

    fn const_str(&mut self, s: String) -> u32 {
        self.builder.add_const(ConstValue::Str(s))
    }

    fn compile_assign(&mut self, target: &Expression, op: crate::ast::AssignOp, value: &Expression, offset: u32) {
        use crate::ast::AssignOp;
        if matches!(op, AssignOp::Assign) {
            self.compile_expr(value);
            self.compile_store(target, offset);
            return;
        }
        if matches!(op, AssignOp::ElvisAssign) {
            // `a ?= b`: assign only when `a` is currently null, same
            // short-circuit shape as the `?:` expression but feeding the
            // chosen value into `compile_store` instead of leaving it bare.
            let store_label = self.builder.new_label();
            self.compile_expr(target);
            self.builder.emit_elvis_jump(store_label, offset);
            self.builder.emit(Opcode::Pop, offset);
            self.compile_expr(value);
            self.builder.bind_label(store_label);
            self.compile_store(target, offset);
            return;
        }
        self.compile_expr(target);
        self.compile_expr(value);
        let opc = match op {
            AssignOp::AddAssign => Opcode::Add,
            AssignOp::SubAssign => Opcode::Sub,
            AssignOp::MulAssign => Opcode::Mul,
            AssignOp::DivAssign => Opcode::Div,
            AssignOp::ModAssign => Opcode::Mod,
            AssignOp::ElvisAssign | AssignOp::Assign => unreachable!(),
        };
        self.builder.emit(opc, offset);
        self.compile_store(target, offset);
    }

    /// Compiles an assignment target. Every opcode reached here is required
    /// to leave exactly the assigned value on the stack (`StoreLocal`,
    /// `SetField`, `IndexSet` all store-then-push), matching every call
    /// site's assumption that an assignment is itself an expression with
    /// one residual value — an enclosing `Pop` (statement context) or
    /// further use (nested assignment, `MultiAssign`) consumes it.
    fn compile_store(&mut self, target: &Expression, offset: u32) {
        match target {
            Expression::Identifier { offset: id_offset, .. } => match self.binding_of(*id_offset) {
                Some(Binding::Local(slot)) => {
                    self.builder.emit(Opcode::StoreLocal(slot), offset);
                }
                Some(Binding::HostGlobal(name)) => {
                    self.builder.emit(Opcode::StoreGlobal(name.raw()), offset);
                }
                // Assigning to a capture or a global function name is not
                // supported (captures are read-only snapshots); the value
                // already on the stack stands in as the residual.
                _ => {}
            },
            Expression::FieldAccess { receiver, field, offset: fo, .. } => {
                self.compile_autoviv(receiver, VivKind::Map);
                self.builder.emit(Opcode::SetField(field.raw()), *fo);
            }
            Expression::Index { receiver, index, offset: io } => {
                self.compile_autoviv(receiver, Self::index_viv_kind(index));
                self.compile_expr(index);
                self.builder.emit(Opcode::IndexSet, *io);
            }
            _ => {}
        }
    }

    fn index_viv_kind(index: &Expression) -> VivKind {
        match index {
            Expression::Literal { value: Literal::Str(_), .. } => VivKind::Map,
            _ => VivKind::List,
        }
    }

    /// Compiles `expr` in auto-vivifying receiver position (`spec.md` §3.4):
    /// evaluates `expr`, and if any `FieldAccess`/`Index` link along the way
    /// is currently null, materializes an empty List/Map there instead of
    /// failing, so the `SetField`/`IndexSet` at the top of the chain has
    /// somewhere real to write. `needed_kind` is the container this
    /// expression itself should become if found null — decided by whatever
    /// access the caller is about to perform on the result.
    fn compile_autoviv(&mut self, expr: &Expression, needed_kind: VivKind) {
        match expr {
            Expression::FieldAccess { receiver, field, offset: fo, .. } => {
                self.compile_autoviv(receiver, VivKind::Map);
                self.builder.emit(Opcode::GetFieldAutoViv { field: field.raw(), as_list: matches!(needed_kind, VivKind::List) }, *fo);
            }
            Expression::Index { receiver, index, offset: io } => {
                self.compile_autoviv(receiver, Self::index_viv_kind(index));
                self.compile_expr(index);
                self.builder.emit(Opcode::IndexAutoViv { as_list: matches!(needed_kind, VivKind::List) }, *io);
            }
            _ => self.compile_expr(expr),
        }
    }

    /// Compiles a `switch` as a sequential chain of pattern tests (one of
    /// the dispatch strategies named in `spec.md` §4.6; jump-table/binary
    /// -search strategies are a VM-side optimization over the same
    /// semantics and are not required for correctness).
    fn compile_switch(&mut self, subject: &Expression, arms: &[crate::ast::SwitchArm], offset: u32) {
        self.compile_expr(subject);
        let subject_slot = self.builder.reserve_local();
        self.builder.emit(Opcode::StoreLocal(subject_slot), offset);
        let end_label = self.builder.new_label();
        let mut next_label = self.builder.new_label();
        for (i, arm) in arms.iter().enumerate() {
            self.builder.bind_label(next_label);
            next_label = self.builder.new_label();
            let is_last = i + 1 == arms.len();
            let skip_label = if is_last { end_label } else { next_label };
            self.compile_pattern_test(&arm.pattern, subject_slot, skip_label, arm.offset);
            if let Some(guard) = &arm.guard {
                self.compile_expr(guard);
                self.builder.emit_jump_if_false(skip_label, arm.offset);
            }
            self.compile_expr(&arm.body);
            self.builder.emit_jump(end_label, arm.offset);
        }
        self.builder.bind_label(next_label);
        self.builder.emit(Opcode::PushNull, offset);
        self.builder.bind_label(end_label);
    }

    fn compile_pattern_test(&mut self, pattern: &Pattern, subject_slot: u32, fail_label: Label, offset: u32) {
        match pattern {
            Pattern::Wildcard | Pattern::Any => {}
            Pattern::Binding(_, bind_offset) => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                if let Some(Binding::Local(slot)) = self.binding_of(*bind_offset) {
                    self.builder.emit(Opcode::StoreLocal(slot), offset);
                }
                self.builder.emit(Opcode::Pop, offset);
            }
            Pattern::Computed(expr) => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                self.compile_expr(expr);
                self.builder.emit(Opcode::Eq, offset);
                self.builder.emit_jump_if_false(fail_label, offset);
            }
            Pattern::Literal(lit_expr) => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                self.compile_expr(lit_expr);
                self.builder.emit(Opcode::Eq, offset);
                self.builder.emit_jump_if_false(fail_label, offset);
            }
            Pattern::LiteralList(alts) => {
                let pass_label = self.builder.new_label();
                for (i, alt) in alts.iter().enumerate() {
                    self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                    self.compile_expr(alt);
                    self.builder.emit(Opcode::Eq, offset);
                    if i + 1 == alts.len() {
                        self.builder.emit_jump_if_false(fail_label, offset);
                    } else {
                        self.builder.emit_jump_if_true(pass_label, offset);
                    }
                }
                self.builder.bind_label(pass_label);
            }
            Pattern::TypeName(name) => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                let c = self.const_str(name.clone());
                self.builder.emit(Opcode::InstanceOf(c), offset);
                self.builder.emit_jump_if_false(fail_label, offset);
            }
            Pattern::Regex { pattern, modifiers } => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                let p = self.const_str(pattern.clone());
                let m = self.const_str(modifiers.clone());
                self.builder.emit(Opcode::RegexMatch { pattern: p, modifiers: m }, offset);
                self.builder.emit_jump_if_false(fail_label, offset);
            }
            Pattern::List(items) => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                let list_ty = self.const_str("List".into());
                self.builder.emit(Opcode::InstanceOf(list_ty), offset);
                self.builder.emit_jump_if_false(fail_label, offset);

                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                self.builder.emit(Opcode::Size, offset);
                let len_const = self.const_int(items.len() as i32);
                self.builder.emit(Opcode::PushConst(len_const), offset);
                self.builder.emit(Opcode::Eq, offset);
                self.builder.emit_jump_if_false(fail_label, offset);

                for (i, item) in items.iter().enumerate() {
                    self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                    let idx_const = self.const_int(i as i32);
                    self.builder.emit(Opcode::PushConst(idx_const), offset);
                    self.builder.emit(Opcode::Index, offset);
                    let elem_slot = self.builder.reserve_local();
                    self.builder.emit(Opcode::StoreLocal(elem_slot), offset);
                    self.builder.emit(Opcode::Pop, offset);
                    self.compile_pattern_test(item, elem_slot, fail_label, offset);
                }
            }
            Pattern::Map(entries) => {
                self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                let map_ty = self.const_str("Map".into());
                self.builder.emit(Opcode::InstanceOf(map_ty), offset);
                self.builder.emit_jump_if_false(fail_label, offset);

                for (key, sub) in entries {
                    let key_const = self.const_str(key.clone());
                    self.builder.emit(Opcode::PushConst(key_const), offset);
                    self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                    self.builder.emit(Opcode::Contains, offset);
                    self.builder.emit_jump_if_false(fail_label, offset);

                    self.builder.emit(Opcode::LoadLocal(subject_slot), offset);
                    let key_const = self.const_str(key.clone());
                    self.builder.emit(Opcode::PushConst(key_const), offset);
                    self.builder.emit(Opcode::Index, offset);
                    let elem_slot = self.builder.reserve_local();
                    self.builder.emit(Opcode::StoreLocal(elem_slot), offset);
                    self.builder.emit(Opcode::Pop, offset);
                    self.compile_pattern_test(sub, elem_slot, fail_label, offset);
                }
            }
        }
    }
}

fn binop_to_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::TrueMod => Opcode::TrueMod,
        BinOp::Eq => Opcode::Eq,
        BinOp::Ne => Opcode::Ne,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Ge,
        BinOp::Cmp => Opcode::Cmp,
        BinOp::IdentEq => Opcode::IdentEq,
        BinOp::IdentNe => Opcode::IdentNe,
        BinOp::And | BinOp::Or => unreachable!("short-circuit ops compiled separately"),
        BinOp::BitAnd => Opcode::BitAnd,
        BinOp::BitOr => Opcode::BitOr,
        BinOp::BitXor => Opcode::BitXor,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
        BinOp::UShr => Opcode::UShr,
    }
}
