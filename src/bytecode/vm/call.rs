//! Instance construction (`spec.md` §3.5): binds positional and named
//! constructor arguments onto a fresh field vector, applying declared
//! defaults (including const-folded defaults) for anything left unset.

use std::{cell::RefCell, rc::Rc};

use crate::{
    class::{ClassDef, ClassRegistry},
    intern::StringId,
    value::{Instance, Value},
};

pub fn construct(class: &ClassDef, registry: &ClassRegistry, positional: Vec<Value>, named: Vec<(StringId, Value)>) -> Result<Instance, String> {
    let fields = class.all_fields(registry);
    let mut values: Vec<Option<Value>> = vec![None; fields.len()];

    for (i, v) in positional.into_iter().enumerate() {
        if i >= values.len() {
            return Err("too many positional arguments".into());
        }
        values[i] = Some(v);
    }
    for (name, v) in named {
        let idx = fields.iter().position(|f| f.name == name).ok_or("unknown named constructor argument")?;
        values[idx] = Some(v);
    }
    let mut out = Vec::with_capacity(values.len());
    for (field, slot) in fields.iter().zip(values.into_iter()) {
        out.push(match slot {
            Some(v) => v,
            None => field.const_value.clone().unwrap_or(Value::Null),
        });
    }
    Ok(Instance { class: class.id, fields: Rc::new(RefCell::new(out)) })
}
