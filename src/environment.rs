//! Host embedding interface (`spec.md` §5/§7, "Scheduler/Environment").
//!
//! The VM never spawns a thread, never touches a wall clock, and never
//! writes to storage itself — every one of those is a host decision. A
//! suspending builtin call hands the host an `EventId` and waits; the host
//! calls back into `ScriptInstance::resume` with that same id once whatever
//! it was waiting for (a timer, a blocking task, an external event) is
//! ready. Grounded on the teacher's scheduler-facing trait boundary in
//! `resource.rs`: the interpreter core asks its caller to schedule, it
//! never schedules itself.

use uuid::Uuid;

use crate::value::Value;

pub type EventId = u64;

/// Host-specific context visible to the VM for the duration of a single
/// `run`/`resume` call (a tracing span id, tenant, deadline hint, ...).
/// Left minimal: hosts that need more can widen it without touching the
/// VM, since the VM only ever round-trips this value back to the host.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    pub label: Option<String>,
}

/// Everything a `ScriptInstance` needs from its host to suspend and later
/// resume across an async builtin call (`spec.md` §3.6).
pub trait Environment {
    fn thread_context(&self) -> ThreadContext {
        ThreadContext::default()
    }

    /// Schedules `event_id` to fire as soon as the host's event loop gets
    /// to it — used for async calls with no inherent delay.
    fn schedule_event(&mut self, event_id: EventId);

    /// Schedules `event_id` to fire no sooner than `delay_ms` from now;
    /// backs the `sleep` builtin.
    fn schedule_event_after(&mut self, event_id: EventId, delay_ms: u64);

    /// Runs `work` somewhere that tolerates blocking (a thread pool,
    /// typically) and resumes the instance with its result via `event_id`.
    fn schedule_blocking(&mut self, event_id: EventId, work: Box<dyn FnOnce() -> Value + Send>);

    /// Persists an encoded checkpoint for `instance_id`. The host is free
    /// to key storage however it likes; `checkpoint_id` disambiguates
    /// successive checkpoints taken by the same instance.
    fn save_checkpoint(&mut self, instance_id: Uuid, checkpoint_id: u64, bytes: Vec<u8>);

    /// Removes a previously saved checkpoint once superseded or resolved
    /// (`spec.md` §5.3, "at-most-once resume").
    fn delete_checkpoint(&mut self, instance_id: Uuid, checkpoint_id: u64);
}
