//! Runtime value model (`spec.md` §3.4).
//!
//! Containers (`List`, `Map`, class `Instance`s) are reference-counted and
//! interior-mutable (`Rc<RefCell<_>>`) rather than arena-indexed: a script
//! instance never shares its heap with another instance or another thread
//! (`spec.md` §3.8, "Ownership"), so there is no cross-instance GC problem
//! to solve and a plain `Rc` is the idiomatic fit. Capture-by-reference
//! closures (`spec.md` §9) hold the same `Rc<RefCell<Value>>` cell as the
//! enclosing scope's binding.

use std::{cell::RefCell, cmp::Ordering, collections::hash_map::DefaultHasher, fmt, hash::{Hash, Hasher}, rc::Rc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{class::ClassId, decimal::Decimal, intern::StringId};

pub type Cell = Rc<RefCell<Value>>;

/// Keys in a Jactl `Map` are arbitrary values compared structurally; we wrap
/// them so they can live in an `IndexMap` (insertion order preserved, per
/// `spec.md` §3.4).
#[derive(Debug, Clone)]
pub struct MapKey(pub Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.structural_eq(&other.0)
    }
}
impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.structural_hash(state);
    }
}

pub type JList = Rc<RefCell<Vec<Value>>>;
pub type JMap = Rc<RefCell<IndexMap<MapKey, Value>>>;

#[derive(Debug, Clone)]
pub struct Instance {
    pub class: ClassId,
    pub fields: Rc<RefCell<Vec<Value>>>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Rc<Decimal>),
    Str(Rc<str>),
    List(JList),
    Map(JMap),
    Instance(Instance),
    /// A captured closure: function id plus its free-variable cells.
    Closure(Rc<ClosureValue>),
}

#[derive(Debug)]
pub struct ClosureValue {
    pub function_id: u32,
    pub captures: Vec<Cell>,
}

impl Value {
    /// Truthiness table from `spec.md` §4.5.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Byte(b) => *b != 0,
            Value::Int(i) => *i != 0,
            Value::Long(l) => *l != 0,
            Value::Double(d) => *d != 0.0,
            Value::Decimal(d) => !d.is_zero(),
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Map(m) => !m.borrow().is_empty(),
            Value::Instance(_) | Value::Closure(_) => true,
        }
    }

    /// `==`: structural equality, recursive through containers and class
    /// instances. `spec.md` §9 resolves the Open Question on field order:
    /// map/instance equality is key-set equality, order-insensitive.
    #[must_use]
    pub fn structural_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.structural_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| bv.structural_eq(v)))
            }
            (Value::Instance(a), Value::Instance(b)) => {
                a.class == b.class
                    && a.fields.borrow().iter().zip(b.fields.borrow().iter()).all(|(x, y)| x.structural_eq(y))
            }
            _ if self.is_numeric() && other.is_numeric() => self.numeric_cmp(other) == Some(Ordering::Equal),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Byte(_) | Value::Int(_) | Value::Long(_) | Value::Double(_) | Value::Decimal(_))
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Byte(b) => Some(f64::from(*b)),
            Value::Int(i) => Some(f64::from(*i)),
            Value::Long(l) => Some(*l as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Numeric comparison used by `<=>` and by structural equality over
    /// numeric values. `Decimal` only compares against other `Decimal`s
    /// here (mixed-numeric comparisons are widened by the VM before this
    /// is reached).
    #[must_use]
    pub fn numeric_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp_value(b)),
            (Value::Long(a), Value::Long(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Byte(a), Value::Byte(b)) => a.partial_cmp(b),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    fn structural_hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Byte(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Long(l) => l.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Decimal(d) => d.to_string().hash(state),
            Value::Str(s) => s.hash(state),
            Value::List(l) => {
                for v in l.borrow().iter() {
                    v.structural_hash(state);
                }
            }
            Value::Map(m) => {
                // Order-insensitive: fold each entry's hash with XOR so
                // insertion order never affects the map's own hash.
                let mut acc: u64 = 0;
                for (k, v) in m.borrow().iter() {
                    let mut h = DefaultHasher::new();
                    k.0.structural_hash(&mut h);
                    v.structural_hash(&mut h);
                    acc ^= h.finish();
                }
                acc.hash(state);
            }
            Value::Instance(inst) => {
                for f in inst.fields.borrow().iter() {
                    f.structural_hash(state);
                }
            }
            Value::Closure(c) => Rc::as_ptr(c).hash(state),
        }
    }

    /// String negative-offset indexing (`spec.md` §3.4): offset `-1` is the
    /// last code point.
    #[must_use]
    pub fn str_char_at(s: &str, offset: i64) -> Option<char> {
        let len = s.chars().count() as i64;
        let idx = if offset < 0 { offset + len } else { offset };
        if idx < 0 || idx >= len {
            return None;
        }
        s.chars().nth(idx as usize)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Byte(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {v}", k.0)?;
                }
                write!(f, "}}")
            }
            Value::Instance(inst) => write!(f, "<instance of class {:?}>", inst.class),
            Value::Closure(_) => write!(f, "<closure>"),
        }
    }
}

#[must_use]
pub fn field_name_key(name: StringId) -> MapKey {
    MapKey(Value::Long(i64::from(name.raw())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_spec_table() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(1).truthy());
        assert!(!Value::Str(Rc::from("")).truthy());
        assert!(Value::Str(Rc::from("x")).truthy());
    }

    #[test]
    fn map_equality_is_order_insensitive() {
        let mut a = IndexMap::new();
        a.insert(MapKey(Value::Str(Rc::from("x"))), Value::Int(1));
        a.insert(MapKey(Value::Str(Rc::from("y"))), Value::Int(2));
        let mut b = IndexMap::new();
        b.insert(MapKey(Value::Str(Rc::from("y"))), Value::Int(2));
        b.insert(MapKey(Value::Str(Rc::from("x"))), Value::Int(1));
        let va = Value::Map(Rc::new(RefCell::new(a)));
        let vb = Value::Map(Rc::new(RefCell::new(b)));
        assert!(va.structural_eq(&vb));
    }

    #[test]
    fn negative_string_index() {
        assert_eq!(Value::str_char_at("hello", -1), Some('o'));
        assert_eq!(Value::str_char_at("hello", 0), Some('h'));
        assert_eq!(Value::str_char_at("hello", 5), None);
    }
}
