//! Comparison operators (`spec.md` §3.4/§4.5): `==`/`!=` structural,
//! `===`/`!==` identity, `<=>` three-way, `<`/`<=`/`>`/`>=` numeric/string.

use std::cmp::Ordering;

use crate::value::Value;

pub fn eq(a: &Value, b: &Value) -> bool {
    a.structural_eq(b)
}

pub fn ident_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Map(x), Value::Map(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Instance(x), Value::Instance(y)) => std::rc::Rc::ptr_eq(&x.fields, &y.fields) && x.class == y.class,
        (Value::Closure(x), Value::Closure(y)) => std::rc::Rc::ptr_eq(x, y),
        _ => a.structural_eq(b),
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_numeric() && b.is_numeric() {
        return a.numeric_cmp(b);
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn lt(a: &Value, b: &Value) -> Option<bool> {
    ordering(a, b).map(|o| o == Ordering::Less)
}
pub fn le(a: &Value, b: &Value) -> Option<bool> {
    ordering(a, b).map(|o| o != Ordering::Greater)
}
pub fn gt(a: &Value, b: &Value) -> Option<bool> {
    ordering(a, b).map(|o| o == Ordering::Greater)
}
pub fn ge(a: &Value, b: &Value) -> Option<bool> {
    ordering(a, b).map(|o| o != Ordering::Less)
}

/// `<=>`: returns -1/0/1 as an `Int`, matching Jactl's three-way comparator
/// convention used by sort callbacks.
pub fn cmp3(a: &Value, b: &Value) -> Option<i32> {
    ordering(a, b).map(|o| match o {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}
