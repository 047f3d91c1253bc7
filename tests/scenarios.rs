//! Integration tests for `spec.md` §8's literal scenarios that never
//! suspend (S1, S2, S3, S6) — each seeds one test from the spec's exact
//! input/expected-output pair. S4 and S5 suspend and live in
//! `async_tests.rs`/`checkpoint_tests.rs`.

mod common;

use common::{as_list, as_str, run_sync};
use jactl::value::Value;

#[test]
fn s1_fibonacci_typed() {
    let result = run_sync("def int fib(int x){ x<=2?1:fib(x-1)+fib(x-2) } fib(10)");
    assert!(matches!(result, Value::Int(55) | Value::Long(55)), "expected 55, got {result:?}");
}

#[test]
fn s2_regex_capture_with_n_modifier() {
    let result = run_sync("'rate=-1234' =~ /(\\w+)=([\\d-]+)/n; [$1,$2,$2 instanceof long]");
    let items = as_list(&result);
    assert_eq!(as_str(&items[0]), "rate");
    assert!(matches!(items[1], Value::Long(-1234)), "expected -1234, got {:?}", items[1]);
    assert!(matches!(items[2], Value::Boolean(true)));
}

#[test]
fn s3_switch_destructuring() {
    let result = run_sync("def x=[1,[2,3]]; switch(x){ [a,[b,${a+2}]] -> a+b; default -> 0 }");
    assert!(matches!(result, Value::Int(3) | Value::Long(3)), "expected 3, got {result:?}");
}

#[test]
fn s6_modulus_semantics() {
    let result = run_sync("[-2 % 5, -2 %% 5]");
    let items = as_list(&result);
    assert!(matches!(items[0], Value::Int(3) | Value::Long(3)), "expected 3, got {:?}", items[0]);
    assert!(matches!(items[1], Value::Int(-2) | Value::Long(-2)), "expected -2, got {:?}", items[1]);
}

#[test]
fn switch_type_strictness_property() {
    // spec.md §8 testable property 6: `1L` never matches a bare `1` case.
    let result = run_sync("switch (1L) { 1 -> 'a'; default -> 'b' }");
    assert_eq!(as_str(&result), "b");
}
