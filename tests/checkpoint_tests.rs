//! Integration tests for `spec.md` §8's S5 (checkpoint/resume) and the
//! round-trip-checkpoint testable property (§8.2): a script whose only
//! suspension point is `checkpoint()` saves and resumes, and a
//! checkpoint decoded into a fresh instance recovers with the branch
//! the host asks for.

mod common;

use std::collections::HashMap;

use common::{as_str, workspace, TestEnv};
use jactl::builtins::BuiltinId;
use jactl::instance::ScriptInstance;
use jactl::value::Value;

const CHECKPOINT_SCRIPT: &str = "def r = checkpoint(commit:{false}, recover:{true}); r ? 'r' : 's'";

#[test]
fn s5_continuing_locally_after_save_resumes_as_commit_value() {
    let mut ws = workspace();
    let script = ws.compile_script(CHECKPOINT_SCRIPT, "s5-commit").expect("compiles");
    let mut env = TestEnv::default();

    let (mut instance, mut result) = script.run_async(&mut env, HashMap::new()).expect("run_async");
    assert!(result.is_none(), "checkpoint() must suspend the run");
    assert!(!env.checkpoints.is_empty(), "the suspension must have saved a checkpoint");

    let (builtin, _) = instance.pending_call().expect("suspended on checkpoint()");
    assert_eq!(builtin, BuiltinId::Checkpoint);
    result = instance.resume(Value::Boolean(false), &mut env).expect("resume");

    assert_eq!(as_str(&result.expect("completed")), "s");
}

#[test]
fn s5_restoring_and_resuming_true_recovers() {
    let mut ws = workspace();
    let script = ws.compile_script(CHECKPOINT_SCRIPT, "s5-recover").expect("compiles");
    let mut env = TestEnv::default();

    let (instance, _) = script.run_async(&mut env, HashMap::new()).expect("run_async");
    let (instance_id, bytes) = env.checkpoints.iter().next().map(|((id, _), v)| (*id, v.clone())).expect("checkpoint was saved");
    assert_eq!(instance_id, instance.id);

    let mut recover_env = TestEnv::default();
    let (restored, result) = ScriptInstance::restore(script.clone(), &bytes, Value::Boolean(true), &mut recover_env).expect("restore");

    assert_eq!(restored.id, instance_id);
    assert_eq!(as_str(&result.expect("completes immediately, no further suspension")), "r");
}

#[test]
fn round_trip_checkpoint_matches_single_run() {
    // spec.md §8 testable property 2: a run that checkpoints, saves, and
    // resumes locally must equal a single uninterrupted run of the same
    // source under the same globals.
    let single_run = common::run_sync("[1,2,3].sum()");

    let mut ws = workspace();
    let script = ws.compile_script("def r = checkpoint(commit:{[1,2,3].sum()}, recover:{-1}); r", "rt").expect("compiles");
    let mut env = TestEnv::default();
    let (mut instance, mut result) = script.run_async(&mut env, HashMap::new()).expect("run_async");
    while result.is_none() {
        result = instance.resume(Value::Boolean(false), &mut env).expect("resume");
    }

    assert!(matches!((single_run, result.unwrap()), (Value::Int(a), Value::Int(b)) if a == b));
}
