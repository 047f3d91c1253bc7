//! Shared test fixtures: `TestEnv` and a synchronous `compile+run` helper.

use std::collections::HashMap;

use jactl::value::Value;
use jactl::{ContextBuilder, Environment, EventId, ThreadContext, Workspace};
use uuid::Uuid;

/// An `Environment` that never actually waits: every scheduled event is
/// just remembered, and checkpoints land in an in-memory map keyed by
/// `(instance_id, checkpoint_id)`. Good enough to drive a suspend/resume
/// round trip deterministically inside a test.
#[derive(Default)]
pub struct TestEnv {
    pub checkpoints: HashMap<(Uuid, u64), Vec<u8>>,
    pub scheduled: Vec<EventId>,
}

impl Environment for TestEnv {
    fn thread_context(&self) -> ThreadContext {
        ThreadContext::default()
    }

    fn schedule_event(&mut self, event_id: EventId) {
        self.scheduled.push(event_id);
    }

    fn schedule_event_after(&mut self, event_id: EventId, _delay_ms: u64) {
        self.scheduled.push(event_id);
    }

    fn schedule_blocking(&mut self, event_id: EventId, work: Box<dyn FnOnce() -> Value + Send>) {
        self.scheduled.push(event_id);
        work();
    }

    fn save_checkpoint(&mut self, instance_id: Uuid, checkpoint_id: u64, bytes: Vec<u8>) {
        self.checkpoints.insert((instance_id, checkpoint_id), bytes);
    }

    fn delete_checkpoint(&mut self, instance_id: Uuid, checkpoint_id: u64) {
        self.checkpoints.remove(&(instance_id, checkpoint_id));
    }
}

pub fn workspace() -> Workspace {
    Workspace::new(ContextBuilder::new().build())
}

pub fn run_sync(src: &str) -> Value {
    let mut ws = workspace();
    let script = ws.compile_script(src, "test").expect("compiles");
    let mut globals = HashMap::new();
    script.run_sync(&mut globals).expect("runs")
}

pub fn as_list(v: &Value) -> Vec<Value> {
    match v {
        Value::List(l) => l.borrow().clone(),
        other => panic!("expected a list, got {other:?}"),
    }
}

pub fn run_sync_with(ws: &mut Workspace, src: &str) -> Value {
    let script = ws.compile_script(src, "host").expect("compiles");
    let mut globals = HashMap::new();
    script.run_sync(&mut globals).expect("runs")
}

pub fn as_str(v: &Value) -> String {
    match v {
        Value::Str(s) => s.to_string(),
        other => panic!("expected a string, got {other:?}"),
    }
}
