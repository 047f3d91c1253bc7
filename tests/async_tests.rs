//! Integration test for `spec.md` §8's S4 (async transparency): a
//! suspending host call (`sleep`) reached from inside a `map`/`filter`
//! callback must suspend the whole run and resume it seamlessly, with
//! no different script-visible behavior than a synchronous host
//! function returning the same value (testable property 3).

mod common;

use std::collections::HashMap;

use common::{workspace, TestEnv};
use jactl::builtins::BuiltinId;
use jactl::value::Value;

#[test]
fn s4_async_transparency_through_map_filter_sum() {
    let mut ws = workspace();
    let script = ws.compile_script("[1,2,3].map{ sleep(1, it*it) }.filter{ it != 4 }.sum()", "s4").expect("compiles");
    let mut env = TestEnv::default();

    let (mut instance, mut result) = script.run_async(&mut env, HashMap::new()).expect("run_async");
    let mut suspensions = 0;
    while result.is_none() {
        let (builtin, args) = instance.pending_call().expect("suspended instance has a pending call");
        assert_eq!(builtin, BuiltinId::Sleep, "only sleep should suspend in this script");
        let resume_value = args[1].clone();
        suspensions += 1;
        result = instance.resume(resume_value, &mut env).expect("resume");
    }

    assert_eq!(suspensions, 3, "map{} should suspend once per input element");
    assert!(matches!(result, Some(Value::Int(10)) | Some(Value::Long(10))), "expected 10, got {result:?}");
}
