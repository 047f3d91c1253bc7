//! Class model (`spec.md` §3.5).
//!
//! Classes are created exclusively by the compiler from a `ClassDecl`; there
//! are no user-written constructors. Dispatch is by `ClassId` + parent
//! chain (tag+id dispatch), not a host-language vtable — see the
//! re-architecture note in `spec.md` §9 ("Inheritance").

use serde::{Deserialize, Serialize};

use crate::{intern::StringId, types::Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: StringId,
    pub ty: Type,
    pub is_const: bool,
    /// `const` fields fold at call sites; only primitive/string consts are
    /// permitted (`spec.md` §3.5/§4.3).
    pub const_value: Option<crate::value::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: StringId,
    pub function_id: u32,
    pub is_static: bool,
}

/// The two implicit constructors every class receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constructors {
    /// One parameter per mandatory (non-defaulted) field, in declaration order.
    pub positional: Vec<StringId>,
    /// All fields addressable by keyword.
    pub named: Vec<StringId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    pub id: ClassId,
    pub package: Option<String>,
    pub name: StringId,
    pub parent: Option<ClassId>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub static_methods: Vec<MethodDef>,
    pub constructors: Constructors,
}

impl ClassDef {
    /// Walks the flat field list including inherited fields, parent-first,
    /// used by the auto-derived structural `hashCode`/`equals`/`toJson`.
    pub fn all_fields<'a>(&'a self, registry: &'a ClassRegistry) -> Vec<&'a FieldDef> {
        let mut out = Vec::new();
        if let Some(parent_id) = self.parent {
            if let Some(parent) = registry.get(parent_id) {
                out.extend(parent.all_fields(registry));
            }
        }
        out.extend(self.fields.iter());
        out
    }

    /// Index into the flattened `all_fields` list for a given field name,
    /// used by `GetField`/`SetField` opcode execution.
    pub fn field_index(&self, name: StringId, registry: &ClassRegistry) -> Option<usize> {
        self.all_fields(registry).iter().position(|f| f.name == name)
    }

    /// Resolves an instance method by name, most-derived definition wins:
    /// checks `self.methods` first, then walks the parent chain. Used by
    /// `CallMethod` dispatch.
    pub fn resolve_method(&self, name: StringId, registry: &ClassRegistry) -> Option<u32> {
        if let Some(m) = self.methods.iter().find(|m| m.name == name) {
            return Some(m.function_id);
        }
        self.parent.and_then(|id| registry.get(id)).and_then(|p| p.resolve_method(name, registry))
    }

    /// True if `self` is `other` or a descendant of `other`, walking the
    /// parent chain — the basis of `instanceof` and method lookup fallback.
    pub fn is_subclass_of(&self, other: ClassId, registry: &ClassRegistry) -> bool {
        if self.id == other {
            return true;
        }
        let mut current = self.parent;
        while let Some(id) = current {
            if id == other {
                return true;
            }
            current = registry.get(id).and_then(|c| c.parent);
        }
        false
    }
}

/// Process-wide (well: `CompilationContext`-wide) registry of user classes.
/// Append-only until the owning context is built, then frozen — classes are
/// shared immutably across every script instance of that context.
#[derive(Debug, Default, Clone)]
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
    by_name: std::collections::HashMap<String, ClassId>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut def: ClassDef, name: &str) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        def.id = id;
        self.classes.push(def);
        self.by_name.insert(name.to_string(), id);
        id
    }

    #[must_use]
    pub fn get(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get(id.0 as usize)
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&ClassDef> {
        self.by_name.get(name).and_then(|&id| self.get(id))
    }

    pub fn get_mut(&mut self, id: ClassId) -> Option<&mut ClassDef> {
        self.classes.get_mut(id.0 as usize)
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    #[test]
    fn subclass_walks_parent_chain() {
        let mut interns = Interns::new();
        let mut reg = ClassRegistry::new();
        let base_name = interns.intern("Base");
        let base = reg.register(
            ClassDef {
                id: ClassId(0),
                package: None,
                name: base_name,
                parent: None,
                fields: vec![],
                methods: vec![],
                static_methods: vec![],
                constructors: Constructors { positional: vec![], named: vec![] },
            },
            "Base",
        );
        let child_name = interns.intern("Child");
        let child = reg.register(
            ClassDef {
                id: ClassId(0),
                package: None,
                name: child_name,
                parent: Some(base),
                fields: vec![],
                methods: vec![],
                static_methods: vec![],
                constructors: Constructors { positional: vec![], named: vec![] },
            },
            "Child",
        );
        let child_def = reg.get(child).unwrap();
        assert!(child_def.is_subclass_of(base, &reg));
        assert!(!reg.get(base).unwrap().is_subclass_of(child, &reg));
    }
}
