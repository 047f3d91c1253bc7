//! Opcode set (`spec.md` §4.4). Stack-based, single accumulator-free design
//! matching the shape of the teacher's `bytecode::Opcode` (`bytecode/mod.rs`):
//! every instruction either pushes, pops, or both, and control flow is
//! expressed as relative jumps patched by the builder.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Opcode {
    PushConst(u32),
    PushNull,
    PushTrue,
    PushFalse,
    Pop,
    Dup,

    LoadLocal(u32),
    StoreLocal(u32),
    LoadCapture(u32),
    LoadGlobalFn(u32),
    /// Reads/writes an entry in the host-supplied globals map (`spec.md`
    /// §3.8); the operand is the binding name's `StringId`, not a slot.
    LoadGlobal(u32),
    StoreGlobal(u32),

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    TrueMod,
    Neg,
    BitNot,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Cmp,
    IdentEq,
    IdentNe,
    Not,

    JumpIfFalse(i32),
    JumpIfTrue(i32),
    Jump(i32),
    /// Elvis (`?:`) short-circuit test: peeks (does not pop) the top of
    /// stack and jumps when it is truthy, leaving it as the expression's
    /// result; falling through (value is null/falsy) leaves it for the
    /// caller to `Pop` before computing the right-hand side.
    ElvisJump(i32),

    MakeList(u32),
    MakeMap(u32),
    MakeClosure { function_id: u32, capture_slots: Vec<CaptureSource> },

    NewInstance { class_name_const: u32, positional_count: u32, named_count: u32 },
    GetField(u32),
    SetField(u32),
    /// Reads a field for an auto-vivifying assignment chain (`spec.md` §3.4,
    /// `x.a.b[2].c = 7`): if the receiver is a `Map` and the field is
    /// missing/null, materializes an empty List (`as_list`) or Map there
    /// before returning it, so the next link in the chain has somewhere
    /// real to write. Receivers that are class instances fall back to a
    /// plain field read — instance fields are never auto-vivified.
    GetFieldAutoViv { field: u32, as_list: bool },

    Index,
    IndexSet,
    /// Pops a List/Map/String and pushes its element/entry/char count;
    /// used for switch destructuring's arity check ahead of `collect`/
    /// `size()` being reachable as ordinary method calls.
    Size,
    /// Indexes into an auto-vivifying assignment chain's receiver,
    /// materializing an empty List (`as_list`) or Map there first if it is
    /// currently null/out of bounds, inferred at compile time from the
    /// next link's access kind (`spec.md` §3.4).
    IndexAutoViv { as_list: bool },

    Call(u32),
    CallMethod { method: u32, arg_count: u32 },
    /// Call into a host-registered builtin by table index.
    CallBuiltin { id: u32, arg_count: u32 },

    RegexMatch { pattern: u32, modifiers: u32 },
    RegexSubst { pattern: u32, replacement: u32, modifiers: u32 },
    /// `$N`: the Nth group (0 = whole match) of the most recent `=~` match
    /// executed by this `Vm`, `spec.md` §3.4's "capture variable".
    LoadMatchGroup(u32),

    StringConcat(u32),

    InstanceOf(u32),
    CastTo(u32),

    /// `in`: membership test, `spec.md` §4.5 ("collection membership").
    Contains,

    Return,
    Die,

    /// Marks a point from which execution can be resumed after suspending
    /// on a host async call; the emitter places one immediately before
    /// every `CallBuiltin`/`CallMethod` flagged async (`spec.md` §5.2).
    SavePoint(u32),
    /// Restores VM state from a `ContinuationNode` and resumes at the
    /// instruction following the matching `SavePoint`.
    RestoreFromCont,

    Checkpoint,

    Nop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum CaptureSource {
    Local(u32),
    Capture(u32),
}
