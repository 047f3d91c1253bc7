//! Static type tags (`spec.md` §3.3).
//!
//! Jactl's type system is a flat discriminated tag, not a structural type
//! lattice: `ANY` absorbs everything (it is the declared type of a `def`
//! binding), `NUMBER` matches any numeric kind, and `ITERATOR` matches
//! anything the VM knows how to pull elements from.

use serde::{Deserialize, Serialize};

use crate::class::ClassId;

/// Default scale added to the larger operand's scale on `Decimal` division,
/// per `spec.md` §3.3.
pub const DEFAULT_MIN_SCALE: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Boolean,
    Byte,
    Int,
    Long,
    Double,
    Decimal,
    String,
    List,
    Map,
    Iterator,
    Instance(ClassId),
    Array(Box<Type>),
    Function,
    Any,
    Number,
    Void,
    Unknown,
}

impl Type {
    /// Does a value statically typed `self` satisfy a parameter/field typed
    /// `target`? This is the "matches" relation of §3.3, not an equality
    /// check: `ANY` matches everything, `NUMBER`/`ITERATOR` match families.
    #[must_use]
    pub fn matches(&self, target: &Type) -> bool {
        match target {
            Type::Any => true,
            Type::Number => self.is_numeric(),
            Type::Iterator => self.is_iterable(),
            _ => self == target,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Byte | Type::Int | Type::Long | Type::Double | Type::Decimal | Type::Number)
    }

    #[must_use]
    pub fn is_iterable(&self) -> bool {
        matches!(self, Type::List | Type::Map | Type::String | Type::Number | Type::Iterator | Type::Instance(_))
    }

    /// Numeric widening order used when inferring the static result type of
    /// a binary arithmetic expression. `Decimal` and `Double` are
    /// deliberately incomparable (neither widens to the other); the
    /// resolver rejects mixing them without an explicit cast.
    #[must_use]
    pub fn widen(&self, other: &Type) -> Option<Type> {
        use Type::{Byte, Decimal, Double, Int, Long};
        if self == other {
            return Some(self.clone());
        }
        let rank = |t: &Type| match t {
            Byte => Some(0),
            Int => Some(1),
            Long => Some(2),
            _ => None,
        };
        match (self, other) {
            (Decimal, Double) | (Double, Decimal) => None,
            (Decimal, _) if rank(other).is_some() => Some(Decimal),
            (_, Decimal) if rank(self).is_some() => Some(Decimal),
            (Double, _) if rank(other).is_some() => Some(Double),
            (_, Double) if rank(self).is_some() => Some(Double),
            _ => match (rank(self), rank(other)) {
                (Some(a), Some(b)) => Some(if a >= b { self.clone() } else { other.clone() }),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_everything() {
        assert!(Type::Int.matches(&Type::Any));
        assert!(Type::Map.matches(&Type::Any));
    }

    #[test]
    fn number_matches_numeric_kinds_only() {
        assert!(Type::Int.matches(&Type::Number));
        assert!(Type::Decimal.matches(&Type::Number));
        assert!(!Type::String.matches(&Type::Number));
    }

    #[test]
    fn widen_int_long() {
        assert_eq!(Type::Int.widen(&Type::Long), Some(Type::Long));
        assert_eq!(Type::Long.widen(&Type::Int), Some(Type::Long));
    }

    #[test]
    fn decimal_and_double_do_not_widen() {
        assert_eq!(Type::Decimal.widen(&Type::Double), None);
    }
}
