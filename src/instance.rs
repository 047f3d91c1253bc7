//! Running script state (`spec.md` §3.8): a UUID-identified handle that
//! owns a run's continuation chain, checkpoint-sequence counter, and the
//! host-supplied globals mapping for the life of the instance.
//!
//! Grounded on the teacher's per-session state struct in
//! `session_manager.rs`: a UUID-keyed handle the host holds onto across
//! suspend/resume boundaries, generalized from a Python session's full
//! interpreter state to just the pieces that outlive one `Vm` run.

use std::{collections::HashMap, sync::Arc};

use uuid::Uuid;

use crate::{
    builtins::BuiltinId,
    bytecode::{
        code::Code,
        vm::{ExecOutcome, Frame, SuspendedCall, Vm},
    },
    checkpoint,
    context::CompiledWorld,
    continuation::{self, Continuation},
    environment::{Environment, EventId},
    error::{RunResult, RuntimeError, RuntimeErrorKind},
    value::Value,
};

/// A single script's compiled bytecode, shared (via `Arc`) across every
/// `ScriptInstance` created from it.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub(crate) world: CompiledWorld,
    pub(crate) script_main: Arc<Code>,
    pub(crate) functions: Arc<Vec<Code>>,
    pub(crate) source_name: String,
    pub(crate) class_version_digest: u32,
}

impl CompiledScript {
    /// Runs to completion with no continuation-persistence affordance — a
    /// convenience for embeddings that know up front their script never
    /// calls an async builtin or `checkpoint()`. Suspending here is a hard
    /// error rather than a silent block, since this crate's `Environment`
    /// is callback-based and has no synchronous "wait for it" primitive.
    /// `globals` is the host-supplied global mapping (`spec.md` §3.8);
    /// the script reads/writes it in place for the duration of the run.
    pub fn run_sync(&self, globals: &mut HashMap<String, Value>) -> RunResult<Value> {
        let script_main = Arc::clone(&self.script_main);
        let functions = Arc::clone(&self.functions);
        let world = self.world.clone();
        let mut vm = Vm::new(&script_main, &functions, &world, self.source_name.clone(), globals);
        match vm.start_script()? {
            ExecOutcome::Completed(v) => Ok(v),
            ExecOutcome::Suspended(_) => {
                Err(RuntimeError::new(RuntimeErrorKind::Custom, "run_sync cannot await an async suspension; use run_async", self.source_name.clone(), 0))
            }
        }
    }

    /// Starts a fresh `ScriptInstance` seeded with `globals` and drives it
    /// until completion or the first suspension, scheduling whatever the
    /// suspension needs via `env`. Returns the instance so the host can
    /// `resume` it later.
    pub fn run_async(&self, env: &mut dyn Environment, globals: HashMap<String, Value>) -> RunResult<(ScriptInstance, Option<Value>)> {
        let mut instance = ScriptInstance::new(self.clone(), globals);
        let outcome = instance.run(env)?;
        Ok((instance, outcome))
    }
}

/// What a `Vm` run produced, with any suspended frame chain already pulled
/// out of the `Vm` — keeping this free of a borrow on `Vm`'s lifetime lets
/// `run`/`resume`/`restore` hand it to a `&mut self` method right after.
enum Outcome {
    Completed(Value),
    Suspended(SuspendedCall, Vec<Frame>),
}

/// The UUID-identified handle a host keeps between a suspension and the
/// matching `resume` call. Exactly one continuation is ever pending at a
/// time (`spec.md`'s single-threaded-per-instance cooperative model), so
/// `resume` doesn't need an event id threaded back — only that the one
/// outstanding wait is over.
pub struct ScriptInstance {
    pub id: Uuid,
    script: CompiledScript,
    pending: Option<Continuation>,
    next_checkpoint_id: u32,
    next_event_id: EventId,
    /// Host-supplied globals (`spec.md` §3.8/§6), owned for the instance's
    /// whole lifetime and threaded into every `Vm` this instance builds.
    globals: HashMap<String, Value>,
    /// Opaque host-assigned id stamped into every checkpoint this instance
    /// produces (`spec.md` §4.7's `context_id` TLV field). Zero unless the
    /// host calls `set_context_id`.
    context_id: u32,
}

impl ScriptInstance {
    fn new(script: CompiledScript, globals: HashMap<String, Value>) -> Self {
        Self { id: Uuid::new_v4(), script, pending: None, next_checkpoint_id: 0, next_event_id: 0, globals, context_id: 0 }
    }

    /// Sets the opaque id the host wants stamped into this instance's
    /// checkpoints (`spec.md` §4.7). Defaults to `0`.
    pub fn set_context_id(&mut self, context_id: u32) {
        self.context_id = context_id;
    }

    #[must_use]
    pub fn globals(&self) -> &HashMap<String, Value> {
        &self.globals
    }

    /// The builtin and arguments the instance is currently suspended on, if
    /// any — lets a host driver decide generically what value to resume
    /// with (e.g. `sleep(ms, v)` must resume with `v`) without having to
    /// separately track what it last scheduled.
    #[must_use]
    pub fn pending_call(&self) -> Option<(BuiltinId, &[Value])> {
        self.pending.as_ref().map(|c| (c.pending.builtin, c.pending.args.as_slice()))
    }

    fn run(&mut self, env: &mut dyn Environment) -> RunResult<Option<Value>> {
        let script_main = Arc::clone(&self.script.script_main);
        let functions = Arc::clone(&self.script.functions);
        let world = self.script.world.clone();
        let outcome = {
            let mut vm = Vm::new(&script_main, &functions, &world, self.script.source_name.clone(), &mut self.globals);
            match vm.start_script()? {
                ExecOutcome::Completed(v) => Outcome::Completed(v),
                ExecOutcome::Suspended(s) => Outcome::Suspended(s, vm.into_frames()),
            }
        };
        self.drive(outcome, env)
    }

    /// Resumes the one pending continuation with `value` (the async
    /// builtin's result, or the checkpoint-recovery boolean, supplied by
    /// the host once it's ready) and drives the VM until the next
    /// completion or suspension.
    pub fn resume(&mut self, value: Value, env: &mut dyn Environment) -> RunResult<Option<Value>> {
        let Some(cont) = self.pending.take() else {
            return Err(RuntimeError::new(RuntimeErrorKind::Custom, "no suspended continuation to resume", self.script.source_name.clone(), 0));
        };
        let frames = cont.restore_frames(&self.script.source_name)?;
        let script_main = Arc::clone(&self.script.script_main);
        let functions = Arc::clone(&self.script.functions);
        let world = self.script.world.clone();
        let outcome = {
            let mut vm = Vm::new(&script_main, &functions, &world, self.script.source_name.clone(), &mut self.globals);
            match vm.resume(frames, value)? {
                ExecOutcome::Completed(v) => Outcome::Completed(v),
                ExecOutcome::Suspended(s) => Outcome::Suspended(s, vm.into_frames()),
            }
        };
        self.drive(outcome, env)
    }

    fn drive(&mut self, outcome: Outcome, env: &mut dyn Environment) -> RunResult<Option<Value>> {
        match outcome {
            Outcome::Completed(v) => Ok(Some(v)),
            Outcome::Suspended(suspended, frames) => {
                let event_id = self.next_event_id;
                self.next_event_id += 1;
                let builtin = suspended.builtin;
                let args = suspended.args.clone();
                self.pending = Some(Continuation::capture(&frames, suspended));
                self.schedule(env, event_id, builtin, &args)?;
                Ok(None)
            }
        }
    }

    /// Hands a suspended builtin off to the host (`spec.md` §4.6/§4.8).
    /// `checkpoint()` is handled entirely here rather than bounced back to
    /// the host as an opaque event: the continuation is already captured
    /// in `self.pending` by the time this runs, so the bytes can be built
    /// and persisted immediately; the host still calls `resume` once
    /// `save_checkpoint` durably completes, same as any other suspension.
    fn schedule(&mut self, env: &mut dyn Environment, event_id: EventId, builtin: BuiltinId, args: &[Value]) -> RunResult<()> {
        match builtin {
            BuiltinId::Sleep => {
                let ms = args.first().and_then(Value::as_f64).unwrap_or(0.0).max(0.0) as u64;
                env.schedule_event_after(event_id, ms);
                Ok(())
            }
            BuiltinId::Checkpoint => {
                self.next_checkpoint_id += 1;
                let cont = self.pending.as_ref().expect("checkpoint suspension always captures a continuation first");
                let bytes = checkpoint::encode(self.id, self.next_checkpoint_id, self.context_id, self.script.class_version_digest, &self.globals, cont.chain())?;
                env.save_checkpoint(self.id, u64::from(self.next_checkpoint_id), bytes);
                Ok(())
            }
            other => Err(RuntimeError::new(
                RuntimeErrorKind::Custom,
                format!("builtin {other:?} does not suspend and should never reach ScriptInstance::schedule"),
                self.script.source_name.clone(),
                0,
            )),
        }
    }

    /// Encodes the instance's currently-suspended state as a checkpoint
    /// (`spec.md` §4.7) on the host's demand, independent of a `checkpoint()`
    /// call in the script itself. Returns `None` if nothing is suspended
    /// right now — a checkpoint only has a meaningful frame chain to
    /// capture between a suspension and its matching `resume`.
    pub fn checkpoint(&mut self) -> RunResult<Option<Vec<u8>>> {
        let Some(cont) = &self.pending else { return Ok(None) };
        self.next_checkpoint_id += 1;
        let bytes = checkpoint::encode(self.id, self.next_checkpoint_id, self.context_id, self.script.class_version_digest, &self.globals, cont.chain())?;
        Ok(Some(bytes))
    }

    /// Restores an instance from a previously persisted checkpoint and
    /// resumes it with `resumed_value` (`spec.md` §4.7/§5.3) — `true` when
    /// the host is simulating/performing real recovery after a restart,
    /// `false` to continue as if the checkpoint's save had just completed
    /// locally (`spec.md`'s S5 scenario exercises both). Unlike an
    /// in-process `resume`, this never goes through `Continuation`'s
    /// at-most-once guard — a restored checkpoint starts a brand new
    /// instance with no live continuation of its own to double-resume.
    pub fn restore(script: CompiledScript, bytes: &[u8], resumed_value: Value, env: &mut dyn Environment) -> RunResult<(Self, Option<Value>)> {
        let decoded = checkpoint::decode(bytes, script.class_version_digest)?;
        let mut instance = Self::new(script, decoded.globals);
        instance.id = decoded.instance_id;
        instance.next_checkpoint_id = decoded.checkpoint_id;
        instance.context_id = decoded.context_id;

        let script_main = Arc::clone(&instance.script.script_main);
        let functions = Arc::clone(&instance.script.functions);
        let world = instance.script.world.clone();
        let frames = continuation::rebuild_frames(&decoded.frames);
        let outcome = {
            let mut vm = Vm::new(&script_main, &functions, &world, instance.script.source_name.clone(), &mut instance.globals);
            match vm.resume(frames, resumed_value)? {
                ExecOutcome::Completed(v) => Outcome::Completed(v),
                ExecOutcome::Suspended(s) => Outcome::Suspended(s, vm.into_frames()),
            }
        };
        let run_result = instance.drive(outcome, env)?;
        Ok((instance, run_result))
    }
}
