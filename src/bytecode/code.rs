//! Compiled function body (`spec.md` §4.4): constants, opcodes, source
//! offsets (one per opcode, for diagnostics), and the state-save map used by
//! the continuation engine to locate a `SavePoint` by its numeric id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ast::Offset, bytecode::op::Opcode, value::Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Code {
    pub opcodes: Vec<Opcode>,
    pub offsets: Vec<Offset>,
    pub consts: Vec<ConstValue>,
    pub local_count: u32,
    pub param_count: u32,
    pub is_async: bool,
    /// Maps a `SavePoint` id to the opcode index immediately following it,
    /// i.e. where execution resumes after a successful restore.
    pub state_save_map: HashMap<u32, u32>,
}

/// Compile-time literal pool entry. Kept distinct from the runtime `Value`
/// so constant pools serialize independent of heap identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConstValue {
    Null,
    Boolean(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(String),
    Str(String),
}

impl ConstValue {
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            ConstValue::Null => Value::Null,
            ConstValue::Boolean(b) => Value::Boolean(*b),
            ConstValue::Byte(b) => Value::Byte(*b),
            ConstValue::Int(i) => Value::Int(*i),
            ConstValue::Long(l) => Value::Long(*l),
            ConstValue::Double(d) => Value::Double(*d),
            ConstValue::Decimal(s) => Value::Decimal(std::rc::Rc::new(s.parse().unwrap_or_default())),
            ConstValue::Str(s) => Value::Str(std::rc::Rc::from(s.as_str())),
        }
    }
}

impl Default for crate::decimal::Decimal {
    fn default() -> Self {
        crate::decimal::Decimal::zero()
    }
}
