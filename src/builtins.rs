//! Host-visible builtin functions/methods (`spec.md` §3.9, "standard
//! library", and §6, "host registers safe customization hooks"). Grounded
//! on the teacher's builtin-function registry pattern: a flat, name-indexed
//! table built once at compile time and consulted both by the resolver (to
//! decide async propagation) and the VM (to dispatch `CallBuiltin`/unresolved
//! `CallMethod`).
//!
//! Only `sleep` actually suspends the VM (it is the one host-async primitive
//! the test scenarios require); the collection builtins and any
//! host-registered function/method run to completion synchronously and
//! share this table so user code can shadow none of them and the resolver
//! can reason about the whole callable surface uniformly.

use std::{collections::HashMap, sync::Arc};

use crate::intern::{Interns, StringId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinId {
    Map,
    Filter,
    Each,
    Collect,
    CollectEntries,
    Sum,
    Size,
    Limit,
    Sleep,
    /// Not dispatched through `by_name` lookup at all — `Opcode::Checkpoint`
    /// carries no name, so the VM constructs this id directly when it
    /// suspends on a `checkpoint()` expression (`spec.md` §4.5/§4.6).
    Checkpoint,
    /// Index into `BuiltinRegistry::host_callables`. Shared by both
    /// `register_function` and `register_method` entries; `BuiltinDef::kind`
    /// tells the compiler/VM which calling convention applies.
    Host(u32),
}

impl BuiltinId {
    const HOST_BASE: u32 = 1000;

    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            BuiltinId::Map => 0,
            BuiltinId::Filter => 1,
            BuiltinId::Each => 2,
            BuiltinId::Collect => 3,
            BuiltinId::CollectEntries => 4,
            BuiltinId::Sum => 5,
            BuiltinId::Size => 6,
            BuiltinId::Limit => 7,
            BuiltinId::Sleep => 8,
            BuiltinId::Checkpoint => 9,
            BuiltinId::Host(i) => Self::HOST_BASE + i,
        }
    }

    #[must_use]
    pub fn from_u32(id: u32) -> Option<Self> {
        Some(match id {
            0 => BuiltinId::Map,
            1 => BuiltinId::Filter,
            2 => BuiltinId::Each,
            3 => BuiltinId::Collect,
            4 => BuiltinId::CollectEntries,
            5 => BuiltinId::Sum,
            6 => BuiltinId::Size,
            7 => BuiltinId::Limit,
            8 => BuiltinId::Sleep,
            9 => BuiltinId::Checkpoint,
            n if n >= Self::HOST_BASE => BuiltinId::Host(n - Self::HOST_BASE),
            _ => return None,
        })
    }
}

/// Which calling convention a builtin name was registered under:
/// `Function` names are only ever recognized as a bare `name(...)` call
/// with no receiver; `Method` names are only ever recognized through
/// `receiver.name(...)`. Mirrors the `register_function`/`register_method`
/// split spec.md §6 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Function,
    Method,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinDef {
    pub id: BuiltinId,
    pub is_async: bool,
    pub kind: BuiltinKind,
}

/// One parameter's host-visible shape (`spec.md` §6). `async_param` and
/// `default` are stored for introspection/validation at registration time;
/// this port evaluates every call argument eagerly before dispatch (like
/// the stdlib builtins above), so neither flag changes how a call actually
/// runs — see `DESIGN.md` for the scope decision.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub async_param: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), async_param: false, default: None }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn async_param(mut self, flag: bool) -> Self {
        self.async_param = flag;
        self
    }
}

/// A host-supplied implementation reachable from script code. Functions are
/// invoked with exactly the call's explicit arguments; methods are invoked
/// with the receiver prepended as `args[0]` (`spec.md` §3.5's implicit
/// receiver convention, extended to host methods).
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, String>>;

#[derive(Clone)]
pub struct HostCallable {
    pub param_specs: Vec<ParamSpec>,
    /// Accepted for signature fidelity with `spec.md` §6's
    /// `register_function`/`register_method`; does not change dispatch in
    /// this port (see `ParamSpec` doc comment).
    pub async_instance: bool,
    pub impl_ref: HostFn,
}

#[derive(Default)]
pub struct BuiltinRegistry {
    by_name: HashMap<StringId, BuiltinDef>,
    host_callables: Vec<HostCallable>,
}

impl BuiltinRegistry {
    pub fn standard(interns: &mut Interns) -> Self {
        let mut reg = Self::default();
        reg.register_stdlib(interns, "map", BuiltinId::Map, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "filter", BuiltinId::Filter, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "each", BuiltinId::Each, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "collect", BuiltinId::Collect, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "collectEntries", BuiltinId::CollectEntries, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "sum", BuiltinId::Sum, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "size", BuiltinId::Size, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "limit", BuiltinId::Limit, BuiltinKind::Method, false);
        reg.register_stdlib(interns, "sleep", BuiltinId::Sleep, BuiltinKind::Function, true);
        reg
    }

    fn register_stdlib(&mut self, interns: &mut Interns, name: &str, id: BuiltinId, kind: BuiltinKind, is_async: bool) {
        let sid = interns.intern(name);
        self.by_name.insert(sid, BuiltinDef { id, is_async, kind });
    }

    /// Registers a host function callable by bare name, e.g. `lookup(key)`
    /// (`spec.md` §6). Fails if `name` already names a builtin or another
    /// host registration, since silently shadowing either would change the
    /// meaning of existing scripts compiled against this workspace.
    pub fn register_function(&mut self, interns: &mut Interns, name: &str, param_specs: Vec<ParamSpec>, async_instance: bool, impl_ref: HostFn) -> Result<(), String> {
        self.register(interns, name, BuiltinKind::Function, param_specs, async_instance, impl_ref)
    }

    /// Registers a host method callable as `receiver.name(...)` on any
    /// receiver type (`spec.md` §6). The `type` a host names at
    /// registration is not enforced at dispatch — matching how the stdlib
    /// collection methods above are already resolved by name alone, with no
    /// receiver-type check beyond what each `impl_ref` chooses to validate.
    pub fn register_method(&mut self, interns: &mut Interns, _type_name: Option<&str>, name: &str, param_specs: Vec<ParamSpec>, async_instance: bool, impl_ref: HostFn) -> Result<(), String> {
        self.register(interns, name, BuiltinKind::Method, param_specs, async_instance, impl_ref)
    }

    fn register(&mut self, interns: &mut Interns, name: &str, kind: BuiltinKind, param_specs: Vec<ParamSpec>, async_instance: bool, impl_ref: HostFn) -> Result<(), String> {
        let sid = interns.intern(name);
        if self.by_name.contains_key(&sid) {
            return Err(format!("'{name}' is already registered"));
        }
        let idx = self.host_callables.len() as u32;
        self.host_callables.push(HostCallable { param_specs, async_instance, impl_ref });
        self.by_name.insert(sid, BuiltinDef { id: BuiltinId::Host(idx), is_async: false, kind });
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: StringId) -> Option<BuiltinDef> {
        self.by_name.get(&name).copied()
    }

    #[must_use]
    pub fn host_callable(&self, idx: u32) -> &HostCallable {
        &self.host_callables[idx as usize]
    }

    /// Builds the `StringId → opcode operand` map the compiler consults to
    /// decide whether a bare call needs a `SavePoint` ahead of it — every
    /// registered name that actually suspends (only `sleep` today).
    #[must_use]
    pub fn async_ids(&self) -> HashMap<StringId, u32> {
        self.by_name.iter().filter(|(_, def)| def.is_async).map(|(&name, def)| (name, def.id.to_u32())).collect()
    }

    /// Every `Function`-kind name that dispatches synchronously through
    /// `CallBuiltin` — the stdlib has none (`sleep` is the only `Function`
    /// and it's async, already covered by `async_ids`), so in practice this
    /// is exactly the set of host-registered synchronous functions.
    #[must_use]
    pub fn function_ids(&self) -> HashMap<StringId, u32> {
        self.by_name.iter().filter(|(_, def)| def.kind == BuiltinKind::Function && !def.is_async).map(|(&name, def)| (name, def.id.to_u32())).collect()
    }
}
