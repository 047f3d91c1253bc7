//! String interning.
//!
//! Identifiers, field names, and method names flow through the lexer,
//! resolver symbol tables, and the VM's field/method lookup many times over
//! a script's lifetime. Interning them once keeps every later comparison a
//! cheap integer compare instead of a `String` compare, and keeps the
//! bytecode's constant pool free of duplicate strings.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// A handle into an `Interns` table. Stable for the lifetime of the
/// `CompilationContext` that created it; never reused across contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs a `StringId` from an opcode operand. Opcodes only carry
    /// the raw `u32` (keeping `bytecode::op` free of an `Interns` borrow);
    /// the VM turns it back into a `StringId` to index `BuiltinRegistry`/
    /// `ClassRegistry` lookups.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        StringId(raw)
    }
}

/// Append-only interning table. A `CompilationContext` owns one; it is
/// frozen (no more insertions) once the context is built, matching the
/// "built-in registry append-only at build time, frozen thereafter" rule
/// in `spec.md` §5.
#[derive(Debug, Default, Clone)]
pub struct Interns {
    strings: Vec<Box<str>>,
    lookup: AHashMap<Box<str>, StringId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(self.strings.len() as u32);
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.lookup.insert(boxed, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_string_returns_same_id() {
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("foo");
        assert_eq!(a, b);
        assert_eq!(interns.get(a), "foo");
    }

    #[test]
    fn interning_distinct_strings_returns_distinct_ids() {
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("bar");
        assert_ne!(a, b);
    }
}
