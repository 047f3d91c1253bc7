//! Continuation engine (`spec.md` §4.6): captures a suspended script's
//! entire frame chain as plain data and later rebuilds it for `Vm::resume`.
//!
//! Grounded on the teacher's suspension model: a suspending call produces
//! an opaque waitable handle the host schedules and later hands back to
//! resume execution, and the frame-capture mechanism that snapshots
//! everything needed to pick a paused task back up without re-running it.
//! The difference from a thrown-exception-style suspend is deliberate
//! (`spec.md` §9): the frame stack is ordinary data here, not something
//! recovered by unwinding a Rust call stack.

use std::{cell::Cell as OnceFlag, rc::Rc};

use crate::{
    bytecode::vm::{CodeRef, Frame, SuspendedCall},
    error::{RunResult, RuntimeError, RuntimeErrorKind},
    value::Value,
};

/// One captured frame, outer-most-to-inner order matching `Vm::frames`.
/// Locals/captures are snapshotted to plain `Value`s rather than the live
/// `Rc<RefCell<Value>>` cells a running `Frame` holds — this is what makes
/// a node representable in a checkpoint's `frames[]` TLV entries (`spec.md`
/// §4.7), at the cost of a documented simplification: a closure elsewhere
/// that captured one of these cells by reference is no longer entangled
/// with the restored frame's copy once a round trip through a
/// `ContinuationNode` has happened. In-process suspend/resume (the common
/// case — no process restart in between) never loses this aliasing, since
/// `Vm::frames` itself is untouched until `restore_frames` is called.
#[derive(Debug, Clone)]
pub struct ContinuationNode {
    pub code_ref: CodeRef,
    /// `method_location`: the opcode index execution resumes at, i.e. the
    /// `SavePoint`'s recorded resume offset.
    pub method_location: u32,
    pub locals: Vec<Value>,
    pub captures: Vec<Value>,
    pub operand_stack: Vec<Value>,
}

/// Rebuilds a frame chain straight from decoded checkpoint nodes, bypassing
/// `Continuation`'s at-most-once guard: a checkpoint restore always starts
/// a brand new `ScriptInstance` (typically after the original process
/// crashed), so there is no live continuation to double-resume.
#[must_use]
pub fn rebuild_frames(nodes: &[ContinuationNode]) -> Vec<Frame> {
    nodes.iter().map(ContinuationNode::restore).collect()
}

impl ContinuationNode {
    fn capture(frame: &Frame) -> Self {
        Self {
            code_ref: frame.code_ref,
            method_location: frame.pc,
            locals: frame.locals.iter().map(|c| c.borrow().clone()).collect(),
            captures: frame.captures.iter().map(|c| c.borrow().clone()).collect(),
            operand_stack: frame.stack.clone(),
        }
    }

    fn restore(&self) -> Frame {
        Frame {
            code_ref: self.code_ref,
            pc: self.method_location,
            locals: self.locals.iter().cloned().map(|v| Rc::new(std::cell::RefCell::new(v))).collect(),
            captures: self.captures.iter().cloned().map(|v| Rc::new(std::cell::RefCell::new(v))).collect(),
            stack: self.operand_stack.clone(),
        }
    }
}

/// A script run suspended mid-execution: the whole frame chain plus the
/// async call the host still needs to schedule. Owned by a `ScriptInstance`
/// between `Suspended` and the matching `resume` call.
#[derive(Debug)]
pub struct Continuation {
    /// Outer-most frame first, matching `spec.md` §4.7's `frames[]` order.
    chain: Vec<ContinuationNode>,
    pub pending: SuspendedCall,
    resumed: OnceFlag<bool>,
}

impl Continuation {
    #[must_use]
    pub fn capture(frames: &[Frame], pending: SuspendedCall) -> Self {
        Self { chain: frames.iter().map(ContinuationNode::capture).collect(), pending, resumed: OnceFlag::new(false) }
    }

    #[must_use]
    pub fn chain(&self) -> &[ContinuationNode] {
        &self.chain
    }

    /// Rebuilds the frame chain `Vm::resume` needs to continue execution.
    /// Enforces at-most-once resume (`spec.md` §4.6): a second call — the
    /// host firing a stale `resumer` a second time, or a duplicate event —
    /// surfaces `RuntimeErrorKind::Custom` rather than silently re-running
    /// frames that already handed their state off once.
    pub fn restore_frames(&self, source_name: &str) -> RunResult<Vec<Frame>> {
        if self.resumed.replace(true) {
            return Err(RuntimeError::new(RuntimeErrorKind::Custom, "continuation has already been resumed", source_name, 0));
        }
        Ok(self.chain.iter().map(ContinuationNode::restore).collect())
    }
}
