//! Integration tests for the host-customization surface `spec.md` §6
//! describes: `Workspace::register_function`/`register_method`, and the
//! host-supplied globals map (§3.8).

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{as_str, run_sync_with, workspace};
use jactl::builtins::ParamSpec;
use jactl::value::Value;

#[test]
fn host_globals_are_readable_and_writable_from_script() {
    let mut ws = workspace();
    let script = ws.compile_script("tenant = tenant + '!'; tenant", "globals").expect("compiles");
    let mut globals = HashMap::new();
    globals.insert("tenant".to_string(), Value::Str("acme".into()));
    let result = script.run_sync(&mut globals).expect("runs");
    assert_eq!(as_str(&result), "acme!");
    assert_eq!(as_str(globals.get("tenant").unwrap()), "acme!");
}

#[test]
fn host_registered_function_is_callable_from_script() {
    let mut ws = workspace();
    ws.register_function(
        "double",
        vec![ParamSpec::new("x")],
        false,
        Arc::new(|args: &[Value]| match &args[0] {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            other => Err(format!("double() expects an int, got {other:?}")),
        }),
    )
    .expect("registers");
    let result = run_sync_with(&mut ws, "double(21)");
    assert!(matches!(result, Value::Int(42)), "expected 42, got {result:?}");
}

#[test]
fn host_registered_method_is_callable_on_any_receiver() {
    let mut ws = workspace();
    ws.register_method(
        None,
        "shout",
        Vec::new(),
        false,
        Arc::new(|args: &[Value]| match &args[0] {
            Value::Str(s) => Ok(Value::Str(format!("{}!", s.to_uppercase()).into())),
            other => Err(format!("shout() expects a string receiver, got {other:?}")),
        }),
    )
    .expect("registers");
    let result = run_sync_with(&mut ws, "'hi'.shout()");
    assert_eq!(as_str(&result), "HI!");
}

#[test]
fn registering_a_name_twice_is_rejected() {
    let mut ws = workspace();
    let noop: jactl::builtins::HostFn = Arc::new(|_args: &[Value]| Ok(Value::Null));
    ws.register_function("double", Vec::new(), false, Arc::clone(&noop)).expect("first registration succeeds");
    let err = ws.register_function("double", Vec::new(), false, noop).unwrap_err();
    assert!(err.contains("already registered"), "unexpected error: {err}");
}
