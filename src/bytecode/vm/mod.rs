//! Stack-based bytecode interpreter (`spec.md` §4.4/§5).
//!
//! The call stack is `Vm::frames`, an explicit `Vec<Frame>` rather than
//! Rust's own call stack: every `Call`/`CallMethod` pushes a `Frame` and
//! every `Return` pops one, so the *entire* state of a running script is
//! reachable as plain data at any instruction boundary. That is what makes
//! suspending on a host async call (`spec.md` §5.2) and later resuming from
//! a deserialized checkpoint (`spec.md` §5.3) possible: the continuation
//! engine only ever has to walk and rebuild this `Vec`, never a Rust stack
//! trace. A `CallBuiltin` against an async builtin does not execute it —
//! it hands the caller a `SuspendedCall` and leaves every frame exactly as
//! it was, pc already parked at the matching `SavePoint`'s resume offset.

pub mod arithmetic;
pub mod call;
pub mod compare;
pub mod iterator;
pub mod regex_ops;

use std::collections::HashMap;
use std::rc::Rc;

use crate::{
    builtins::BuiltinId,
    bytecode::{code::Code, op::Opcode},
    class::ClassRegistry,
    context::CompiledWorld,
    error::{RunResult, RuntimeError, RuntimeErrorKind},
    intern::StringId,
    regex_bridge::RegexCache,
    value::{Cell, ClosureValue, MapKey, Value},
};

/// Which `Code` a frame is executing: the script's top-level body, one of
/// the separately compiled functions/methods, or a native `map`/`filter`/
/// `each` loop whose "bytecode" is really just `advance_native_iter`
/// stepping through `locals` (see `start_native_iter`). The native-iter
/// variant lets a suspension inside the invoked closure (e.g. `sleep()`
/// inside `.map{}`) propagate through the ordinary frame-stack/continuation
/// machinery instead of a separate synchronous call path that can't suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRef {
    Main,
    Function(u32),
    NativeIter(NativeIterKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeIterKind {
    Map,
    Filter,
    Each,
}

impl NativeIterKind {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            NativeIterKind::Map => 0,
            NativeIterKind::Filter => 1,
            NativeIterKind::Each => 2,
        }
    }

    #[must_use]
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => NativeIterKind::Map,
            1 => NativeIterKind::Filter,
            2 => NativeIterKind::Each,
            _ => return None,
        })
    }
}

/// One activation record. `locals`/`captures` hold `Cell`s (not bare
/// `Value`s) so a closure created inside this frame can capture them by
/// reference, matching `Value::Closure`'s own `Vec<Cell>` captures.
#[derive(Debug)]
pub struct Frame {
    pub code_ref: CodeRef,
    pub pc: u32,
    pub locals: Vec<Cell>,
    pub captures: Vec<Cell>,
    pub stack: Vec<Value>,
}

impl Frame {
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("bytecode stack underflow")
    }
}

/// A suspending call the host must schedule (`spec.md` §5.2). `Vm::frames`
/// is left exactly as it was when this was produced — the caller (usually
/// `ScriptInstance`) is expected to snapshot it into a continuation before
/// handing `args` off to the `Environment`.
#[derive(Debug)]
pub struct SuspendedCall {
    pub builtin: BuiltinId,
    pub args: Vec<Value>,
}

#[derive(Debug)]
pub enum ExecOutcome {
    Completed(Value),
    Suspended(SuspendedCall),
}

enum Step {
    Continue,
    Completed(Value),
    Suspended(SuspendedCall),
}

pub struct Vm<'a> {
    main: &'a Code,
    functions: &'a [Code],
    world: &'a CompiledWorld,
    regex_cache: RegexCache,
    min_scale: u32,
    source_name: String,
    frames: Vec<Frame>,
    /// Host-supplied globals (`spec.md` §3.8): owned by the `ScriptInstance`
    /// across suspend/resume boundaries, borrowed for the duration of one
    /// `Vm` run. Keyed by name rather than a resolver slot since the set of
    /// globals a script may touch is open-ended and host-controlled.
    globals: &'a mut HashMap<String, Value>,
    /// Groups from the most recent `=~` match, read by `$N` (`LoadMatchGroup`).
    /// Transient like the regex `g`-scan cursor (`regex_bridge.rs`): it does
    /// not survive a suspend/resume boundary, since a fresh `Vm` is built on
    /// every `resume`/`restore` and this is never captured into a
    /// `ContinuationNode`.
    last_match_groups: Vec<Value>,
}

impl<'a> Vm<'a> {
    #[must_use]
    pub fn new(main: &'a Code, functions: &'a [Code], world: &'a CompiledWorld, source_name: impl Into<String>, globals: &'a mut HashMap<String, Value>) -> Self {
        Self {
            main,
            functions,
            world,
            regex_cache: RegexCache::new(),
            min_scale: world.context.min_scale,
            source_name: source_name.into(),
            frames: Vec::new(),
            globals,
            last_match_groups: Vec::new(),
        }
    }

    /// Starts a fresh top-level run of the script body.
    pub fn start_script(&mut self) -> RunResult<ExecOutcome> {
        self.frames.push(Frame { code_ref: CodeRef::Main, pc: 0, locals: Vec::new(), captures: Vec::new(), stack: Vec::new() });
        self.run()
    }

    /// Resumes execution from a previously captured frame chain (the
    /// continuation engine's job; `vm::mod` only needs to know how to keep
    /// going once handed one). `resumed_value` is pushed onto the top
    /// frame's stack before execution continues at its current `pc`, which
    /// the continuation engine must have already set to the `SavePoint`'s
    /// resume offset — for a suspended `checkpoint()`, the caller passes
    /// `Value::Boolean(true)` when resuming from a restored checkpoint and
    /// `Value::Boolean(false)` when resuming immediately after the save
    /// pass completes (`spec.md` §5.3, "commit vs. recover").
    pub fn resume(&mut self, frames: Vec<Frame>, resumed_value: Value) -> RunResult<ExecOutcome> {
        self.frames = frames;
        if let Some(top) = self.frames.last_mut() {
            top.stack.push(resumed_value);
        }
        self.run()
    }

    /// Hands the frame chain back to the caller for checkpointing; only
    /// meaningful immediately after `start_script`/`resume` returns
    /// `Suspended`.
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    fn code_for(&self, code_ref: CodeRef) -> &'a Code {
        match code_ref {
            CodeRef::Main => self.main,
            CodeRef::Function(id) => &self.functions[id as usize],
            CodeRef::NativeIter(_) => unreachable!("native-iter frames never fetch bytecode"),
        }
    }

    fn classes(&self) -> &ClassRegistry {
        &self.world.classes
    }

    fn err(&self, kind: RuntimeErrorKind, message: impl Into<String>, offset: u32) -> RuntimeError {
        RuntimeError::new(kind, message, self.source_name.clone(), offset)
    }

    pub fn run(&mut self) -> RunResult<ExecOutcome> {
        loop {
            match self.step()? {
                Step::Continue => {}
                Step::Completed(v) => return Ok(ExecOutcome::Completed(v)),
                Step::Suspended(s) => return Ok(ExecOutcome::Suspended(s)),
            }
        }
    }

    fn build_call_frame(&self, closure: &ClosureValue, args: Vec<Value>, offset: u32) -> RunResult<Frame> {
        let code = &self.functions[closure.function_id as usize];
        if args.len() as u32 != code.param_count {
            return Err(self.err(
                RuntimeErrorKind::ArityError,
                format!("expected {} argument(s), got {}", code.param_count, args.len()),
                offset,
            ));
        }
        let mut locals: Vec<Cell> = args.into_iter().map(|v| Rc::new(std::cell::RefCell::new(v))).collect();
        locals.resize_with(code.local_count as usize, || Rc::new(std::cell::RefCell::new(Value::Null)));
        Ok(Frame { code_ref: CodeRef::Function(closure.function_id), pc: 0, locals, captures: closure.captures.clone(), stack: Vec::new() })
    }

    /// Builds the frame for an instance method call: the receiver occupies
    /// local slot 0 (`spec.md` §3.5, "implicit `this`"), declared
    /// parameters follow.
    fn build_method_frame(&self, function_id: u32, receiver: Value, args: Vec<Value>, offset: u32) -> RunResult<Frame> {
        let code = &self.functions[function_id as usize];
        if args.len() as u32 + 1 != code.param_count {
            return Err(self.err(
                RuntimeErrorKind::ArityError,
                format!("expected {} argument(s), got {}", code.param_count.saturating_sub(1), args.len()),
                offset,
            ));
        }
        let mut locals: Vec<Cell> = Vec::with_capacity(code.local_count as usize);
        locals.push(Rc::new(std::cell::RefCell::new(receiver)));
        locals.extend(args.into_iter().map(|v| Rc::new(std::cell::RefCell::new(v))));
        locals.resize_with(code.local_count as usize, || Rc::new(std::cell::RefCell::new(Value::Null)));
        Ok(Frame { code_ref: CodeRef::Function(function_id), pc: 0, locals, captures: Vec::new(), stack: Vec::new() })
    }

    fn step(&mut self) -> RunResult<Step> {
        let idx = self.frames.len() - 1;
        if matches!(self.frames[idx].code_ref, CodeRef::NativeIter(_)) {
            return self.advance_native_iter(idx);
        }
        let (op, offset) = {
            let frame = &self.frames[idx];
            let code = self.code_for(frame.code_ref);
            (code.opcodes[frame.pc as usize].clone(), code.offsets[frame.pc as usize])
        };
        self.frames[idx].pc += 1;

        match op {
            Opcode::PushConst(i) => {
                let v = self.code_for(self.frames[idx].code_ref).consts[i as usize].to_value();
                self.frames[idx].stack.push(v);
            }
            Opcode::PushNull => self.frames[idx].stack.push(Value::Null),
            Opcode::PushTrue => self.frames[idx].stack.push(Value::Boolean(true)),
            Opcode::PushFalse => self.frames[idx].stack.push(Value::Boolean(false)),
            Opcode::Pop => {
                self.frames[idx].pop();
            }
            Opcode::Dup => {
                let v = self.frames[idx].stack.last().expect("dup on empty stack").clone();
                self.frames[idx].stack.push(v);
            }
            Opcode::LoadLocal(slot) => {
                let v = self.frames[idx].locals[slot as usize].borrow().clone();
                self.frames[idx].stack.push(v);
            }
            Opcode::StoreLocal(slot) => {
                let v = self.frames[idx].pop();
                *self.frames[idx].locals[slot as usize].borrow_mut() = v.clone();
                self.frames[idx].stack.push(v);
            }
            Opcode::LoadCapture(i) => {
                let v = self.frames[idx].captures[i as usize].borrow().clone();
                self.frames[idx].stack.push(v);
            }
            Opcode::LoadGlobalFn(id) => {
                self.frames[idx].stack.push(Value::Closure(Rc::new(ClosureValue { function_id: id, captures: Vec::new() })));
            }
            Opcode::LoadGlobal(name_id) => {
                let name = self.world.interns.get(StringId::from_raw(name_id));
                let v = self.globals.get(name).cloned().unwrap_or(Value::Null);
                self.frames[idx].stack.push(v);
            }
            Opcode::StoreGlobal(name_id) => {
                let v = self.frames[idx].pop();
                let name = self.world.interns.get(StringId::from_raw(name_id)).to_string();
                self.globals.insert(name, v.clone());
                self.frames[idx].stack.push(v);
            }
            Opcode::LoadMatchGroup(i) => {
                let v = self.last_match_groups.get(i as usize).cloned().unwrap_or(Value::Null);
                self.frames[idx].stack.push(v);
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let r = match op {
                    Opcode::Add => arithmetic::add(&a, &b),
                    Opcode::Sub => arithmetic::sub(&a, &b),
                    Opcode::Mul => arithmetic::mul(&a, &b),
                    _ => unreachable!(),
                }
                .map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.frames[idx].stack.push(r);
            }
            Opcode::Div => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let r = arithmetic::div(&a, &b, self.min_scale).map_err(|e| self.arith_err(e, offset))?;
                self.frames[idx].stack.push(r);
            }
            Opcode::Mod => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let r = arithmetic::modulus(&a, &b).map_err(|e| self.arith_err(e, offset))?;
                self.frames[idx].stack.push(r);
            }
            Opcode::TrueMod => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let r = arithmetic::true_modulus(&a, &b).map_err(|e| self.arith_err(e, offset))?;
                self.frames[idx].stack.push(r);
            }
            Opcode::Neg => {
                let a = self.frames[idx].pop();
                let r = arithmetic::neg(&a).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.frames[idx].stack.push(r);
            }
            Opcode::BitNot => {
                let a = self.frames[idx].pop();
                let r = match a {
                    Value::Int(i) => Value::Int(!i),
                    Value::Long(l) => Value::Long(!l),
                    Value::Byte(b) => Value::Byte(!b),
                    _ => return Err(self.err(RuntimeErrorKind::TypeError, "expected an integer", offset)),
                };
                self.frames[idx].stack.push(r);
            }
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Shr | Opcode::UShr => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let f: fn(i64, i64) -> i64 = match op {
                    Opcode::BitAnd => |x, y| x & y,
                    Opcode::BitOr => |x, y| x | y,
                    Opcode::BitXor => |x, y| x ^ y,
                    Opcode::Shl => |x, y| x.wrapping_shl(y as u32),
                    Opcode::Shr => |x, y| x.wrapping_shr(y as u32),
                    Opcode::UShr => |x, y| ((x as u64) >> (y as u32 & 63)) as i64,
                    _ => unreachable!(),
                };
                let r = arithmetic::bitop(&a, &b, f).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.frames[idx].stack.push(r);
            }

            Opcode::Eq => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                self.frames[idx].stack.push(Value::Boolean(compare::eq(&a, &b)));
            }
            Opcode::Ne => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                self.frames[idx].stack.push(Value::Boolean(!compare::eq(&a, &b)));
            }
            Opcode::IdentEq => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                self.frames[idx].stack.push(Value::Boolean(compare::ident_eq(&a, &b)));
            }
            Opcode::IdentNe => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                self.frames[idx].stack.push(Value::Boolean(!compare::ident_eq(&a, &b)));
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let f = match op {
                    Opcode::Lt => compare::lt,
                    Opcode::Le => compare::le,
                    Opcode::Gt => compare::gt,
                    Opcode::Ge => compare::ge,
                    _ => unreachable!(),
                };
                let r = f(&a, &b).ok_or_else(|| self.err(RuntimeErrorKind::TypeError, "values are not comparable", offset))?;
                self.frames[idx].stack.push(Value::Boolean(r));
            }
            Opcode::Cmp => {
                let b = self.frames[idx].pop();
                let a = self.frames[idx].pop();
                let r = compare::cmp3(&a, &b).ok_or_else(|| self.err(RuntimeErrorKind::TypeError, "values are not comparable", offset))?;
                self.frames[idx].stack.push(Value::Int(r));
            }
            Opcode::Not => {
                let a = self.frames[idx].pop();
                self.frames[idx].stack.push(Value::Boolean(!a.truthy()));
            }

            Opcode::JumpIfFalse(rel) => {
                let v = self.frames[idx].pop();
                if !v.truthy() {
                    self.jump(idx, rel);
                }
            }
            Opcode::JumpIfTrue(rel) => {
                let v = self.frames[idx].pop();
                if v.truthy() {
                    self.jump(idx, rel);
                }
            }
            Opcode::Jump(rel) => self.jump(idx, rel),
            Opcode::ElvisJump(rel) => {
                let truthy = self.frames[idx].stack.last().expect("elvis jump on empty stack").truthy();
                if truthy {
                    self.jump(idx, rel);
                }
            }

            Opcode::MakeList(n) => {
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(self.frames[idx].pop());
                }
                items.reverse();
                self.frames[idx].stack.push(Value::List(Rc::new(std::cell::RefCell::new(items))));
            }
            Opcode::MakeMap(n) => {
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let v = self.frames[idx].pop();
                    let k = self.frames[idx].pop();
                    entries.push((k, v));
                }
                entries.reverse();
                let mut map = indexmap::IndexMap::new();
                for (k, v) in entries {
                    map.insert(MapKey(k), v);
                }
                self.frames[idx].stack.push(Value::Map(Rc::new(std::cell::RefCell::new(map))));
            }
            Opcode::MakeClosure { function_id, capture_slots } => {
                let mut captures = Vec::with_capacity(capture_slots.len());
                for src in &capture_slots {
                    let cell = match src {
                        crate::bytecode::op::CaptureSource::Local(slot) => Rc::clone(&self.frames[idx].locals[*slot as usize]),
                        crate::bytecode::op::CaptureSource::Capture(i) => Rc::clone(&self.frames[idx].captures[*i as usize]),
                    };
                    captures.push(cell);
                }
                self.frames[idx].stack.push(Value::Closure(Rc::new(ClosureValue { function_id, captures })));
            }

            Opcode::NewInstance { class_name_const, positional_count, named_count } => {
                let result = self.exec_new_instance(idx, class_name_const, positional_count, named_count, offset)?;
                self.frames[idx].stack.push(result);
            }
            Opcode::GetField(field) => {
                let receiver = self.frames[idx].pop();
                let v = self.get_field(&receiver, field, offset)?;
                self.frames[idx].stack.push(v);
            }
            Opcode::SetField(field) => {
                let receiver = self.frames[idx].pop();
                let value = self.frames[idx].pop();
                self.set_field(&receiver, field, value.clone(), offset)?;
                self.frames[idx].stack.push(value);
            }
            Opcode::GetFieldAutoViv { field, as_list } => {
                let receiver = self.frames[idx].pop();
                let v = self.get_field_autoviv(&receiver, field, as_list, offset)?;
                self.frames[idx].stack.push(v);
            }

            Opcode::Index => {
                let index = self.frames[idx].pop();
                let receiver = self.frames[idx].pop();
                let v = self.index_get(&receiver, &index, offset)?;
                self.frames[idx].stack.push(v);
            }
            Opcode::IndexSet => {
                let index = self.frames[idx].pop();
                let receiver = self.frames[idx].pop();
                let value = self.frames[idx].pop();
                self.index_set(&receiver, &index, value.clone(), offset)?;
                self.frames[idx].stack.push(value);
            }
            Opcode::Size => {
                let v = self.frames[idx].pop();
                let n = iterator::size(&v).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.frames[idx].stack.push(n);
            }
            Opcode::IndexAutoViv { as_list } => {
                let index = self.frames[idx].pop();
                let receiver = self.frames[idx].pop();
                let v = self.index_get_autoviv(&receiver, &index, as_list, offset)?;
                self.frames[idx].stack.push(v);
            }

            Opcode::Call(n) => {
                let mut args = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    args.push(self.frames[idx].pop());
                }
                args.reverse();
                let callee = self.frames[idx].pop();
                let Value::Closure(c) = callee else {
                    return Err(self.err(RuntimeErrorKind::TypeError, "call target is not a function", offset));
                };
                let frame = self.build_call_frame(&c, args, offset)?;
                self.frames.push(frame);
            }
            Opcode::CallMethod { method, arg_count } => {
                let mut args = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    args.push(self.frames[idx].pop());
                }
                args.reverse();
                let receiver = self.frames[idx].pop();
                return self.exec_call_method(receiver, StringId::from_raw(method), args, offset);
            }
            Opcode::CallBuiltin { id, arg_count } => {
                let mut args = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    args.push(self.frames[idx].pop());
                }
                args.reverse();
                let builtin = BuiltinId::from_u32(id).ok_or_else(|| self.err(RuntimeErrorKind::Custom, "unknown builtin", offset))?;
                match builtin {
                    // `sleep` is the one builtin that suspends.
                    BuiltinId::Sleep => return Ok(Step::Suspended(SuspendedCall { builtin, args })),
                    // A host-registered function (`spec.md` §6) runs
                    // synchronously in-line, regardless of the
                    // `async_instance` flag it was registered with (see
                    // `DESIGN.md`).
                    BuiltinId::Host(host_idx) => {
                        let result = {
                            let callable = self.world.builtins.host_callable(host_idx);
                            (callable.impl_ref)(&args).map_err(|e| self.err(RuntimeErrorKind::Custom, e, offset))?
                        };
                        self.frames[idx].stack.push(result);
                    }
                    _ => return Err(self.err(RuntimeErrorKind::Custom, "builtin is not callable as a bare function", offset)),
                }
            }

            Opcode::RegexMatch { pattern, modifiers } => {
                let subject = self.frames[idx].pop();
                let (p, m) = self.str_consts(idx, pattern, modifiers);
                let (r, groups) = regex_ops::regex_match(&self.regex_cache, &subject, &p, &m).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.last_match_groups = groups;
                self.frames[idx].stack.push(r);
            }
            Opcode::RegexSubst { pattern, replacement, modifiers } => {
                let subject = self.frames[idx].pop();
                let p = self.str_const(idx, pattern);
                let r = self.str_const(idx, replacement);
                let m = self.str_const(idx, modifiers);
                let v = regex_ops::regex_subst(&self.regex_cache, &subject, &p, &r, &m).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.frames[idx].stack.push(v);
            }

            Opcode::StringConcat(n) => {
                let mut parts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    parts.push(self.frames[idx].pop());
                }
                parts.reverse();
                let mut s = String::new();
                for p in parts {
                    s.push_str(&p.to_string());
                }
                self.frames[idx].stack.push(Value::Str(Rc::from(s.as_str())));
            }

            Opcode::InstanceOf(name_const) => {
                let v = self.frames[idx].pop();
                let name = self.str_const(idx, name_const);
                self.frames[idx].stack.push(Value::Boolean(self.instance_of(&v, &name)));
            }
            Opcode::CastTo(name_const) => {
                let v = self.frames[idx].pop();
                let name = self.str_const(idx, name_const);
                let r = self.cast_to(&v, &name, offset)?;
                self.frames[idx].stack.push(r);
            }

            Opcode::Contains => {
                let collection = self.frames[idx].pop();
                let value = self.frames[idx].pop();
                let r = iterator::contains(&value, &collection).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
                self.frames[idx].stack.push(Value::Boolean(r));
            }

            Opcode::Return => {
                let value = self.frames[idx].pop();
                self.frames.pop();
                if self.frames.is_empty() {
                    return Ok(Step::Completed(value));
                }
                let new_top = self.frames.len() - 1;
                if matches!(self.frames[new_top].code_ref, CodeRef::NativeIter(_)) {
                    return self.deliver_native_iter_result(new_top, value);
                }
                self.frames[new_top].stack.push(value);
            }
            Opcode::Die => {
                let v = self.frames[idx].pop();
                return Err(self.err(RuntimeErrorKind::UserDie, v.to_string(), offset));
            }

            Opcode::SavePoint(_) => {
                // Marks a resume point for the continuation engine; no
                // runtime effect of its own.
            }
            Opcode::RestoreFromCont => {
                // Never emitted: continuations are restored by handing a
                // rebuilt `Vec<Frame>` to `Vm::resume`, not by executing an
                // opcode inside the stream.
                return Err(self.err(RuntimeErrorKind::RestoreError, "RestoreFromCont is not emitted by this compiler", offset));
            }
            Opcode::Checkpoint => {
                // `pc` already advanced past this opcode, same convention as
                // `CallBuiltin`: the host resumes with whichever boolean
                // belongs on the far side of the `JumpIfTrue` that follows
                // (`spec.md` §4.5/§4.6).
                return Ok(Step::Suspended(SuspendedCall { builtin: BuiltinId::Checkpoint, args: Vec::new() }));
            }

            Opcode::Nop => {}
        }
        Ok(Step::Continue)
    }

    fn jump(&mut self, idx: usize, rel: i32) {
        let pc = self.frames[idx].pc as i64 + i64::from(rel);
        self.frames[idx].pc = pc as u32;
    }

    fn arith_err(&self, e: arithmetic::ArithError, offset: u32) -> RuntimeError {
        match e {
            arithmetic::ArithError::DivByZero => self.err(RuntimeErrorKind::DivByZero, "division by zero", offset),
            arithmetic::ArithError::TypeError(msg) => self.err(RuntimeErrorKind::TypeError, msg, offset),
        }
    }

    fn str_const(&self, idx: usize, const_id: u32) -> String {
        match &self.code_for(self.frames[idx].code_ref).consts[const_id as usize] {
            crate::bytecode::code::ConstValue::Str(s) => s.clone(),
            other => other.to_value().to_string(),
        }
    }

    fn str_consts(&self, idx: usize, a: u32, b: u32) -> (String, String) {
        (self.str_const(idx, a), self.str_const(idx, b))
    }

    fn exec_new_instance(&mut self, idx: usize, class_name_const: u32, positional_count: u32, named_count: u32, offset: u32) -> RunResult<Value> {
        let mut named = Vec::with_capacity(named_count as usize);
        for _ in 0..named_count {
            let value = self.frames[idx].pop();
            let raw = match self.frames[idx].pop() {
                Value::Int(i) => i as u32,
                _ => return Err(self.err(RuntimeErrorKind::Custom, "malformed named-argument operand", offset)),
            };
            named.push((StringId::from_raw(raw), value));
        }
        named.reverse();
        let mut positional = Vec::with_capacity(positional_count as usize);
        for _ in 0..positional_count {
            positional.push(self.frames[idx].pop());
        }
        positional.reverse();

        let class_name = self.str_const(idx, class_name_const);
        let class = self
            .classes()
            .get_by_name(&class_name)
            .ok_or_else(|| self.err(RuntimeErrorKind::TypeError, format!("unknown class '{class_name}'"), offset))?;
        let instance = call::construct(class, self.classes(), positional, named).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
        Ok(Value::Instance(instance))
    }

    fn get_field(&self, receiver: &Value, field: u32, offset: u32) -> RunResult<Value> {
        let Value::Instance(inst) = receiver else {
            return match receiver {
                // `.field` is also dot-access sugar for a Map entry
                // (`spec.md` §3.4's auto-vivification chains rely on it).
                Value::Map(m) => {
                    let key = MapKey(Value::Str(Rc::from(self.world.interns.get(StringId::from_raw(field)))));
                    Ok(m.borrow().get(&key).cloned().unwrap_or(Value::Null))
                }
                Value::Null => Err(self.err(RuntimeErrorKind::NullDeref, "cannot read a field of null", offset)),
                _ => Err(self.err(RuntimeErrorKind::TypeError, "not an object", offset)),
            };
        };
        let class = self.classes().get(inst.class).expect("instance references a registered class");
        let name = StringId::from_raw(field);
        let i = class.field_index(name, self.classes()).ok_or_else(|| self.err(RuntimeErrorKind::UnknownField, "no such field", offset))?;
        Ok(inst.fields.borrow()[i].clone())
    }

    fn set_field(&self, receiver: &Value, field: u32, value: Value, offset: u32) -> RunResult<()> {
        let Value::Instance(inst) = receiver else {
            return match receiver {
                Value::Map(m) => {
                    let key = MapKey(Value::Str(Rc::from(self.world.interns.get(StringId::from_raw(field)))));
                    m.borrow_mut().insert(key, value);
                    Ok(())
                }
                Value::Null => Err(self.err(RuntimeErrorKind::NullDeref, "cannot set a field of null", offset)),
                _ => Err(self.err(RuntimeErrorKind::TypeError, "not an object", offset)),
            };
        };
        let class = self.classes().get(inst.class).expect("instance references a registered class");
        let name = StringId::from_raw(field);
        let i = class.field_index(name, self.classes()).ok_or_else(|| self.err(RuntimeErrorKind::UnknownField, "no such field", offset))?;
        let all_fields = class.all_fields(self.classes());
        if all_fields[i].is_const {
            return Err(self.err(RuntimeErrorKind::ImmutableField, "cannot assign to a const field", offset));
        }
        inst.fields.borrow_mut()[i] = value;
        Ok(())
    }

    /// `.field` read for an auto-vivifying assignment chain: a `Map`
    /// receiver gets a missing/null entry materialized as an empty
    /// List/Map; a class instance falls back to a plain field read (its
    /// fields already exist from construction, nothing to vivify).
    fn get_field_autoviv(&self, receiver: &Value, field: u32, as_list: bool, offset: u32) -> RunResult<Value> {
        let Value::Map(m) = receiver else {
            return match receiver {
                Value::Instance(_) => self.get_field(receiver, field, offset),
                Value::Null => Err(self.err(RuntimeErrorKind::NullDeref, "cannot auto-vivify a field of null", offset)),
                _ => Err(self.err(RuntimeErrorKind::TypeError, "not an object", offset)),
            };
        };
        let key = MapKey(Value::Str(Rc::from(self.world.interns.get(StringId::from_raw(field)))));
        if let Some(existing) = m.borrow().get(&key) {
            if !matches!(existing, Value::Null) {
                return Ok(existing.clone());
            }
        }
        let fresh = if as_list { Value::List(Rc::new(std::cell::RefCell::new(Vec::new()))) } else { Value::Map(Rc::new(std::cell::RefCell::new(indexmap::IndexMap::new()))) };
        m.borrow_mut().insert(key, fresh.clone());
        Ok(fresh)
    }

    /// `[index]` read for an auto-vivifying assignment chain: a `List`
    /// receiver grows (padding with `null`) to materialize a missing slot
    /// as an empty List/Map; a `Map` receiver behaves like
    /// `get_field_autoviv` keyed by the index value instead of a field name.
    fn index_get_autoviv(&self, receiver: &Value, index: &Value, as_list: bool, offset: u32) -> RunResult<Value> {
        let fresh = || if as_list { Value::List(Rc::new(std::cell::RefCell::new(Vec::new()))) } else { Value::Map(Rc::new(std::cell::RefCell::new(indexmap::IndexMap::new()))) };
        match receiver {
            Value::List(l) => {
                let i = as_i64(index);
                let i = if i < 0 { i + l.borrow().len() as i64 } else { i };
                if i < 0 {
                    return Err(self.err(RuntimeErrorKind::IndexOutOfBounds, "list index out of bounds", offset));
                }
                let i = i as usize;
                {
                    let mut list = l.borrow_mut();
                    while list.len() <= i {
                        list.push(Value::Null);
                    }
                }
                let existing = l.borrow()[i].clone();
                if !matches!(existing, Value::Null) {
                    return Ok(existing);
                }
                let v = fresh();
                l.borrow_mut()[i] = v.clone();
                Ok(v)
            }
            Value::Map(m) => {
                let key = MapKey(index.clone());
                if let Some(existing) = m.borrow().get(&key) {
                    if !matches!(existing, Value::Null) {
                        return Ok(existing.clone());
                    }
                }
                let v = fresh();
                m.borrow_mut().insert(key, v.clone());
                Ok(v)
            }
            Value::Null => Err(self.err(RuntimeErrorKind::NullDeref, "cannot auto-vivify an index of null", offset)),
            _ => Err(self.err(RuntimeErrorKind::TypeError, "value is not indexable", offset)),
        }
    }

    fn index_get(&self, receiver: &Value, index: &Value, offset: u32) -> RunResult<Value> {
        match receiver {
            Value::List(l) => {
                let list = l.borrow();
                let i = list_index(list.len(), index, offset, &self.source_name)?;
                Ok(list[i].clone())
            }
            Value::Map(m) => Ok(m.borrow().get(&MapKey(index.clone())).cloned().unwrap_or(Value::Null)),
            Value::Str(s) => {
                let Value::Long(_) | Value::Int(_) = index else {
                    return Err(self.err(RuntimeErrorKind::TypeError, "string index must be an integer", offset));
                };
                let i = as_i64(index);
                Value::str_char_at(s, i)
                    .map(|c| Value::Str(Rc::from(c.to_string().as_str())))
                    .ok_or_else(|| self.err(RuntimeErrorKind::IndexOutOfBounds, "string index out of bounds", offset))
            }
            Value::Null => Err(self.err(RuntimeErrorKind::NullDeref, "cannot index null", offset)),
            _ => Err(self.err(RuntimeErrorKind::TypeError, "value is not indexable", offset)),
        }
    }

    fn index_set(&self, receiver: &Value, index: &Value, value: Value, offset: u32) -> RunResult<()> {
        match receiver {
            Value::List(l) => {
                let mut list = l.borrow_mut();
                let i = as_i64(index);
                let i = if i < 0 { i + list.len() as i64 } else { i };
                if i < 0 {
                    return Err(self.err(RuntimeErrorKind::IndexOutOfBounds, "list index out of bounds", offset));
                }
                let i = i as usize;
                if i == list.len() {
                    list.push(value);
                } else if i < list.len() {
                    list[i] = value;
                } else {
                    return Err(self.err(RuntimeErrorKind::IndexOutOfBounds, "list index out of bounds", offset));
                }
                Ok(())
            }
            Value::Map(m) => {
                m.borrow_mut().insert(MapKey(index.clone()), value);
                Ok(())
            }
            Value::Null => Err(self.err(RuntimeErrorKind::NullDeref, "cannot index-assign null", offset)),
            _ => Err(self.err(RuntimeErrorKind::TypeError, "value does not support index assignment", offset)),
        }
    }

    fn instance_of(&self, v: &Value, type_name: &str) -> bool {
        match type_name {
            "boolean" => matches!(v, Value::Boolean(_)),
            "byte" => matches!(v, Value::Byte(_)),
            "int" => matches!(v, Value::Int(_)),
            "long" => matches!(v, Value::Long(_)),
            "double" => matches!(v, Value::Double(_)),
            "Decimal" => matches!(v, Value::Decimal(_)),
            "String" => matches!(v, Value::Str(_)),
            "List" => matches!(v, Value::List(_)),
            "Map" => matches!(v, Value::Map(_)),
            _ => match (v, self.classes().get_by_name(type_name)) {
                (Value::Instance(inst), Some(target)) => self.classes().get(inst.class).is_some_and(|c| c.is_subclass_of(target.id, self.classes())),
                _ => false,
            },
        }
    }

    fn cast_to(&self, v: &Value, type_name: &str, offset: u32) -> RunResult<Value> {
        let fail = || self.err(RuntimeErrorKind::TypeError, format!("cannot cast to {type_name}"), offset);
        Ok(match type_name {
            "String" => Value::Str(Rc::from(v.to_string().as_str())),
            "int" => Value::Int(v.as_f64().ok_or_else(fail)? as i32),
            "long" => Value::Long(v.as_f64().ok_or_else(fail)? as i64),
            "double" => Value::Double(v.as_f64().ok_or_else(fail)?),
            "boolean" => Value::Boolean(v.truthy()),
            _ if self.instance_of(v, type_name) => v.clone(),
            _ => return Err(fail()),
        })
    }

    fn exec_call_method(&mut self, receiver: Value, method: StringId, args: Vec<Value>, offset: u32) -> RunResult<Step> {
        if let Value::Instance(inst) = &receiver {
            let class = self.classes().get(inst.class).expect("instance references a registered class");
            if let Some(function_id) = class.resolve_method(method, self.classes()) {
                let frame = self.build_method_frame(function_id, receiver, args, offset)?;
                self.frames.push(frame);
                return Ok(Step::Continue);
            }
        }
        let Some(def) = self.world.builtins.lookup(method) else {
            return Err(self.err(RuntimeErrorKind::UnknownField, "no such method", offset));
        };
        match def.id {
            BuiltinId::Map => self.start_native_iter(NativeIterKind::Map, &receiver, args, offset),
            BuiltinId::Filter => self.start_native_iter(NativeIterKind::Filter, &receiver, args, offset),
            BuiltinId::Each => self.start_native_iter(NativeIterKind::Each, &receiver, args, offset),
            _ => {
                let result = self.dispatch_collection_builtin(def.id, &receiver, args, offset)?;
                self.frames.last_mut().unwrap().stack.push(result);
                Ok(Step::Continue)
            }
        }
    }

    fn dispatch_collection_builtin(&mut self, id: BuiltinId, receiver: &Value, mut args: Vec<Value>, offset: u32) -> RunResult<Value> {
        let source_name = self.source_name.clone();
        let to_err = move |e: String| RuntimeError::new(RuntimeErrorKind::TypeError, e, source_name, offset);
        match id {
            BuiltinId::Collect => iterator::collect(receiver).map_err(to_err),
            BuiltinId::CollectEntries => iterator::collect_entries(receiver).map_err(to_err),
            BuiltinId::Sum => iterator::sum(receiver).map_err(to_err),
            BuiltinId::Size => iterator::size(receiver).map_err(to_err),
            BuiltinId::Limit => {
                let n = args.pop().ok_or_else(|| self.err(RuntimeErrorKind::ArityError, "limit() expects a count", offset))?;
                iterator::limit(receiver, &n).map_err(to_err)
            }
            BuiltinId::Host(host_idx) => {
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(receiver.clone());
                call_args.extend(args);
                let callable = self.world.builtins.host_callable(host_idx);
                (callable.impl_ref)(&call_args).map_err(|e| to_err(e))
            }
            BuiltinId::Map | BuiltinId::Filter | BuiltinId::Each => {
                unreachable!("Map/Filter/Each are routed through start_native_iter, never dispatch_collection_builtin")
            }
            BuiltinId::Sleep => unreachable!("sleep is always routed through CallBuiltin, never CallMethod"),
            BuiltinId::Checkpoint => unreachable!("checkpoint() has no receiver, never reaches CallMethod"),
        }
    }

    /// Pushes a native-iterator frame for `map`/`filter`/`each` (`spec.md`
    /// §3.9) onto the real call stack instead of running the closure via a
    /// separate synchronous recursion: this is what lets a suspension
    /// inside the closure (`sleep()`, `checkpoint()`) propagate through the
    /// ordinary frame-stack/continuation machinery. The frame's `locals`
    /// double as its loop state (see field layout below); `pc` doubles as
    /// the next index into the materialized item list.
    ///
    /// locals[0] = items (`Value::List`)
    /// locals[1] = accumulator (`Value::List` for Map/Filter, `Value::Null` for Each)
    /// locals[2] = closure
    /// locals[3] = fused `limit` count (`Value::Int`), or `Value::Null` when
    ///             this call wasn't fused with a trailing `.limit(n)`
    /// locals[4] = original call offset, for error messages (`Value::Long`)
    /// locals[5] = current item passed to the closure this iteration
    fn start_native_iter(&mut self, kind: NativeIterKind, receiver: &Value, mut args: Vec<Value>, offset: u32) -> RunResult<Step> {
        let name = match kind {
            NativeIterKind::Map => "map()",
            NativeIterKind::Filter => "filter()",
            NativeIterKind::Each => "each()",
        };
        let closure = args.pop().ok_or_else(|| self.err(RuntimeErrorKind::ArityError, format!("{name} expects a closure"), offset))?;
        if !matches!(closure, Value::Closure(_)) {
            return Err(self.err(RuntimeErrorKind::TypeError, "expected a closure", offset));
        }
        // A fused `.limit(n)` call (see the compiler's `MethodCall` arm)
        // pushes the limit ahead of the closure; anything left in `args`
        // after popping the closure is that count.
        let limit = match args.pop() {
            None => Value::Null,
            Some(Value::Int(n)) => Value::Int(n),
            Some(Value::Long(n)) => Value::Int(n as i32),
            Some(_) => return Err(self.err(RuntimeErrorKind::TypeError, "limit() expects an int argument", offset)),
        };
        let items = iterator::as_list(receiver).map_err(|e| self.err(RuntimeErrorKind::TypeError, e, offset))?;
        let accumulator = match kind {
            NativeIterKind::Each => Value::Null,
            NativeIterKind::Map | NativeIterKind::Filter => Value::List(Rc::new(std::cell::RefCell::new(Vec::new()))),
        };
        let cell = |v: Value| Rc::new(std::cell::RefCell::new(v));
        let locals = vec![
            cell(Value::List(Rc::new(std::cell::RefCell::new(items)))),
            cell(accumulator),
            cell(closure),
            cell(limit),
            cell(Value::Long(i64::from(offset))),
            cell(Value::Null),
        ];
        self.frames.push(Frame { code_ref: CodeRef::NativeIter(kind), pc: 0, locals, captures: Vec::new(), stack: Vec::new() });
        Ok(Step::Continue)
    }

    /// The fused limit count for this frame, if `.limit(n)` was chained
    /// directly onto this `map`/`filter` call.
    fn native_iter_limit(&self, idx: usize) -> Option<usize> {
        match &*self.frames[idx].locals[3].borrow() {
            Value::Int(n) => Some((*n).max(0) as usize),
            Value::Null => None,
            _ => unreachable!("native-iter limit slot is always an Int or Null"),
        }
    }

    fn native_iter_kind(&self, idx: usize) -> NativeIterKind {
        match self.frames[idx].code_ref {
            CodeRef::NativeIter(k) => k,
            _ => unreachable!("native_iter_kind called on a non-native-iter frame"),
        }
    }

    fn native_iter_items(&self, idx: usize) -> Rc<std::cell::RefCell<Vec<Value>>> {
        match &*self.frames[idx].locals[0].borrow() {
            Value::List(l) => Rc::clone(l),
            _ => unreachable!("native-iter items slot is always a List"),
        }
    }

    fn native_iter_accumulator(&self, idx: usize) -> Option<Rc<std::cell::RefCell<Vec<Value>>>> {
        match &*self.frames[idx].locals[1].borrow() {
            Value::List(l) => Some(Rc::clone(l)),
            Value::Null => None,
            _ => unreachable!("native-iter accumulator slot is always a List or Null"),
        }
    }

    fn advance_native_iter(&mut self, idx: usize) -> RunResult<Step> {
        let items = self.native_iter_items(idx);
        let next_index = self.frames[idx].pc as usize;
        let len = items.borrow().len();
        if next_index >= len {
            return self.finish_native_iter(idx);
        }
        let item = items.borrow()[next_index].clone();
        self.frames[idx].pc = next_index as u32 + 1;
        *self.frames[idx].locals[5].borrow_mut() = item.clone();
        let closure = self.frames[idx].locals[2].borrow().clone();
        let offset = match &*self.frames[idx].locals[4].borrow() {
            Value::Long(o) => *o as u32,
            _ => 0,
        };
        let Value::Closure(c) = closure else {
            return Err(self.err(RuntimeErrorKind::TypeError, "expected a closure", offset));
        };
        let frame = self.build_call_frame(&c, vec![item], offset)?;
        self.frames.push(frame);
        Ok(Step::Continue)
    }

    fn deliver_native_iter_result(&mut self, idx: usize, value: Value) -> RunResult<Step> {
        match self.native_iter_kind(idx) {
            NativeIterKind::Map => {
                if let Some(acc) = self.native_iter_accumulator(idx) {
                    acc.borrow_mut().push(value);
                }
            }
            NativeIterKind::Filter => {
                if value.truthy() {
                    let item = self.frames[idx].locals[5].borrow().clone();
                    if let Some(acc) = self.native_iter_accumulator(idx) {
                        acc.borrow_mut().push(item);
                    }
                }
            }
            NativeIterKind::Each => {}
        }
        // A fused `.limit(n)` stops pulling further items from upstream the
        // moment `n` results exist, rather than walking the rest of the
        // input just to truncate it afterward (`spec.md` §4.5).
        if let Some(limit) = self.native_iter_limit(idx) {
            let produced = self.native_iter_accumulator(idx).map_or(0, |acc| acc.borrow().len());
            if produced >= limit {
                return self.finish_native_iter(idx);
            }
        }
        self.advance_native_iter(idx)
    }

    fn finish_native_iter(&mut self, idx: usize) -> RunResult<Step> {
        let result = match self.native_iter_kind(idx) {
            NativeIterKind::Each => Value::Null,
            NativeIterKind::Map | NativeIterKind::Filter => self.frames[idx].locals[1].borrow().clone(),
        };
        self.frames.pop();
        if self.frames.is_empty() {
            return Ok(Step::Completed(result));
        }
        let new_top = self.frames.len() - 1;
        if matches!(self.frames[new_top].code_ref, CodeRef::NativeIter(_)) {
            return self.deliver_native_iter_result(new_top, result);
        }
        self.frames[new_top].stack.push(result);
        Ok(Step::Continue)
    }
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Int(i) => i64::from(*i),
        Value::Long(l) => *l,
        Value::Byte(b) => i64::from(*b),
        _ => 0,
    }
}

fn list_index(len: usize, index: &Value, offset: u32, source_name: &str) -> RunResult<usize> {
    let i = as_i64(index);
    let i = if i < 0 { i + len as i64 } else { i };
    if i < 0 || i as usize >= len {
        return Err(RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds, "list index out of bounds", source_name, offset));
    }
    Ok(i as usize)
}
