//! Collection builtins (`collect`/`collectEntries`/`sum`/`size`/`limit`)
//! — `spec.md` §3.9. `map`/`filter`/`each` are not here: they run as
//! native-iterator `Vm` frames (see `mod.rs`'s `start_native_iter`) so a
//! `sleep` inside the callback can suspend the whole run, rather than as
//! a synchronous helper in this file. The remaining builtins are eager
//! over `List`/`Map`, which is observably identical to a lazy chain for
//! these operations since none of them can be applied to an infinite
//! generator in this crate's surface (`spec.md`'s Non-goals exclude
//! infinite/generator sources).

use std::{cell::RefCell, rc::Rc};

use crate::value::{JMap, MapKey, Value};

pub(crate) fn as_list(v: &Value) -> Result<Vec<Value>, String> {
    match v {
        Value::List(l) => Ok(l.borrow().clone()),
        Value::Map(m) => Ok(m.borrow().iter().map(|(k, v)| Value::List(Rc::new(RefCell::new(vec![k.0.clone(), v.clone()])))).collect()),
        _ => Err("expected a List or Map".into()),
    }
}

pub fn collect(receiver: &Value) -> Result<Value, String> {
    Ok(Value::List(Rc::new(RefCell::new(as_list(receiver)?))))
}

pub fn collect_entries(receiver: &Value) -> Result<Value, String> {
    let items = as_list(receiver)?;
    let mut entries = indexmap::IndexMap::new();
    for item in items {
        let Value::List(pair) = item else {
            return Err("collectEntries expects [key, value] pairs".into());
        };
        let pair = pair.borrow();
        if pair.len() != 2 {
            return Err("collectEntries expects [key, value] pairs".into());
        }
        entries.insert(MapKey(pair[0].clone()), pair[1].clone());
    }
    let map: JMap = Rc::new(RefCell::new(entries));
    Ok(Value::Map(map))
}

pub fn sum(receiver: &Value) -> Result<Value, String> {
    let items = as_list(receiver)?;
    let mut acc = Value::Int(0);
    for item in items {
        acc = super::arithmetic::add(&acc, &item)?;
    }
    Ok(acc)
}

pub fn size(receiver: &Value) -> Result<Value, String> {
    let n = match receiver {
        Value::List(l) => l.borrow().len(),
        Value::Map(m) => m.borrow().len(),
        Value::Str(s) => s.chars().count(),
        _ => return Err("size() expects a List, Map, or String".into()),
    };
    Ok(Value::Int(n as i32))
}

pub fn limit(receiver: &Value, n: &Value) -> Result<Value, String> {
    let items = as_list(receiver)?;
    let Value::Int(count) = n else {
        return Err("limit() expects an int argument".into());
    };
    Ok(Value::List(Rc::new(RefCell::new(items.into_iter().take((*count).max(0) as usize).collect()))))
}

pub fn contains(value: &Value, collection: &Value) -> Result<bool, String> {
    match collection {
        Value::List(l) => Ok(l.borrow().iter().any(|v| v.structural_eq(value))),
        Value::Map(m) => Ok(m.borrow().contains_key(&MapKey(value.clone()))),
        Value::Str(s) => match value {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            _ => Err("in on a String requires a String operand".into()),
        },
        _ => Err("in requires a List, Map, or String".into()),
    }
}
