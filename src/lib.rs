//! Jactl: an embeddable, sandboxed scripting language (`spec.md` §1).
//!
//! This crate compiles Jactl source through a lexer/parser/resolver/
//! bytecode pipeline and executes it on a stack-based VM whose entire
//! call stack is a `Vec<Frame>` rather than Rust's own — the same
//! property that lets the teacher's sandboxed interpreter snapshot a
//! running session mid-flight (`crates/ouros/src/session_manager.rs`) is
//! what lets a suspended Jactl script be captured as a `Continuation` and
//! later persisted as a binary checkpoint.
//!
//! The public surface is deliberately small: compile a script or a class
//! against a shared `CompilationContext`, then run it synchronously or
//! asynchronously against a host-supplied `Environment`.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod checkpoint;
pub mod class;
pub mod context;
pub mod continuation;
pub mod decimal;
pub mod environment;
pub mod error;
pub mod instance;
pub mod intern;
pub mod lexer;
pub mod parser;
pub mod regex_bridge;
pub mod resolver;
pub mod types;
pub mod value;

use std::{collections::HashSet, sync::Arc};

use builtins::{HostFn, ParamSpec};
use class::{ClassDef, ClassId, ClassRegistry, Constructors, FieldDef, MethodDef};
use context::{CompilationContext, CompiledWorld};
use error::{CompileError, CompileErrors};
use instance::CompiledScript;
use intern::Interns;

pub use builtins::BuiltinRegistry;
pub use context::ContextBuilder;
pub use environment::{Environment, EventId, ThreadContext};
pub use error::{RunResult, RuntimeError, RuntimeErrorKind};
pub use instance::ScriptInstance;
pub use value::Value;

/// Everything built once for a `CompilationContext` and then frozen: the
/// interned strings, the class registry, and the builtin tables. One
/// `Workspace` backs every `compile_script`/`compile_class` call made
/// against the same context, so classes declared via `compile_class`
/// are visible to scripts compiled afterwards.
pub struct Workspace {
    context: CompilationContext,
    interns: Interns,
    classes: ClassRegistry,
    builtins: Arc<BuiltinRegistry>,
    this_id: intern::StringId,
    it_id: intern::StringId,
    /// Bumped on every class (re)definition; stamped into every checkpoint
    /// this workspace produces so a restore against a workspace with
    /// incompatible class shapes fails loudly instead of silently
    /// mis-reading fields (`spec.md` §4.7).
    class_version_digest: u32,
}

impl Workspace {
    #[must_use]
    pub fn new(context: CompilationContext) -> Self {
        let mut interns = Interns::new();
        let builtins = Arc::new(BuiltinRegistry::standard(&mut interns));
        let this_id = interns.intern("this");
        let it_id = interns.intern("it");
        Self { context, interns, classes: ClassRegistry::new(), builtins, this_id, it_id, class_version_digest: 0 }
    }

    fn builtin_async_names(&self) -> HashSet<String> {
        self.builtins.async_ids().keys().map(|&id| self.interns.get(id).to_string()).collect()
    }

    /// Registers a host function reachable from script code as a bare
    /// `name(...)` call (`spec.md` §6). Must be called before the first
    /// `compile_script`/`compile_class` on this workspace — once a script
    /// has been compiled, `self.builtins` has been cloned into that
    /// script's `CompiledWorld` and mutating the shared table out from
    /// under it would silently desync the two.
    pub fn register_function(&mut self, name: &str, param_specs: Vec<ParamSpec>, async_instance: bool, impl_ref: HostFn) -> Result<(), String> {
        let interns = &mut self.interns;
        Arc::get_mut(&mut self.builtins).expect("register_function must be called before any script is compiled against this Workspace").register_function(interns, name, param_specs, async_instance, impl_ref)
    }

    /// Registers a host method reachable from script code as
    /// `receiver.name(...)` (`spec.md` §6). Same before-first-compile
    /// requirement as `register_function`.
    pub fn register_method(&mut self, type_name: Option<&str>, name: &str, param_specs: Vec<ParamSpec>, async_instance: bool, impl_ref: HostFn) -> Result<(), String> {
        let interns = &mut self.interns;
        Arc::get_mut(&mut self.builtins).expect("register_method must be called before any script is compiled against this Workspace").register_method(interns, type_name, name, param_specs, async_instance, impl_ref)
    }

    /// Parses, resolves, and compiles `source`, registering any classes it
    /// declares into this workspace's shared `ClassRegistry`. A script that
    /// only ever references classes declared in the same source, or in an
    /// earlier call on this same `Workspace`, compiles cleanly.
    pub fn compile_script(&mut self, source: &str, source_name: impl Into<String>) -> Result<CompiledScript, CompileErrors> {
        let source_name = source_name.into();
        let program = parser::Parser::new(source, &mut self.interns, source_name.clone()).parse_program()?;

        self.register_classes(&program.classes, &source_name)?;

        let async_names = self.builtin_async_names();
        let resolved = resolver::Resolver::new(&self.classes, source_name.clone(), async_names, self.this_id, self.it_id).resolve(&program, &self.interns)?;

        self.patch_classes(&program.classes, &resolved, &source_name)?;

        let async_ids = self.builtins.async_ids();
        let sync_function_ids = self.builtins.function_ids();
        let fusion_ids = bytecode::compiler::FusionIds {
            map: self.interns.intern("map"),
            filter: self.interns.intern("filter"),
            limit: self.interns.intern("limit"),
        };
        let compiled = bytecode::compiler::Compiler::compile_program(&program, &resolved, &async_ids, &sync_function_ids, fusion_ids);

        let world = CompiledWorld {
            context: self.context.clone(),
            interns: Arc::new(self.interns.clone()),
            classes: Arc::new(self.classes.clone()),
            builtins: Arc::clone(&self.builtins),
        };

        Ok(CompiledScript {
            world,
            script_main: Arc::new(compiled.script_main),
            functions: Arc::new(compiled.functions),
            source_name,
            class_version_digest: self.class_version_digest,
        })
    }

    /// Registers the classes declared in `source` without compiling any
    /// script body — an embedding that wants to predeclare shared classes
    /// before compiling the scripts that use them (`spec.md` §6 names this
    /// surface as illustrative; a host that keeps all classes and script
    /// code in one source via `compile_script` never needs this at all).
    pub fn compile_class(&mut self, source: &str, source_name: impl Into<String>) -> Result<(), CompileErrors> {
        let source_name = source_name.into();
        let program = parser::Parser::new(source, &mut self.interns, source_name.clone()).parse_program()?;
        if !program.functions.is_empty() || !program.statements.is_empty() {
            return Err(CompileErrors(vec![CompileError::new("compile_class only accepts class declarations", source_name, 0, 0, 0)]));
        }
        self.register_classes(&program.classes, &source_name)?;
        let async_names = self.builtin_async_names();
        let resolved = resolver::Resolver::new(&self.classes, source_name.clone(), async_names, self.this_id, self.it_id).resolve(&program, &self.interns)?;
        self.patch_classes(&program.classes, &resolved, &source_name)?;
        Ok(())
    }

    /// First pass: stub-register every class in `source` to obtain a
    /// stable `ClassId` before anything about its fields or methods is
    /// known. Resolution doesn't actually consult `self.classes` today
    /// (see `resolver.rs`'s notes), but the compiler and the VM both need
    /// a populated registry at `NewInstance`/`CallMethod` time, so the ids
    /// must exist before `patch_classes` can look up a same-source parent
    /// declared later in the file.
    fn register_classes(&mut self, classes: &[ast::ClassDecl], source_name: &str) -> Result<(), CompileErrors> {
        let mut errors = Vec::new();
        for decl in classes {
            let name = self.interns.get(decl.name).to_string();
            if self.classes.get_by_name(&name).is_some() {
                errors.push(CompileError::new(format!("class '{name}' is already defined"), source_name, 0, 0, decl.offset));
                continue;
            }
            let stub = ClassDef {
                id: ClassId(0),
                package: None,
                name: decl.name,
                parent: None,
                fields: Vec::new(),
                methods: Vec::new(),
                static_methods: Vec::new(),
                constructors: Constructors { positional: Vec::new(), named: Vec::new() },
            };
            self.classes.register(stub, &name);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompileErrors(errors))
        }
    }

    /// Second pass: fills in each class's real parent, fields, and
    /// methods now that every class in `source` has a stable id and the
    /// resolver has assigned `function_id`s to every method.
    fn patch_classes(&mut self, classes: &[ast::ClassDecl], resolved: &resolver::ResolvedProgram, source_name: &str) -> Result<(), CompileErrors> {
        let mut errors = Vec::new();
        for decl in classes {
            let name = self.interns.get(decl.name).to_string();
            let Some(id) = self.classes.get_by_name(&name).map(|c| c.id) else { continue };

            let parent = match &decl.parent {
                Some(parent_name) => match self.classes.get_by_name(parent_name) {
                    Some(p) => Some(p.id),
                    None => {
                        errors.push(CompileError::new(format!("unknown parent class '{parent_name}'"), source_name, 0, 0, decl.offset));
                        None
                    }
                },
                None => None,
            };

            let fields: Vec<FieldDef> = decl
                .fields
                .iter()
                .map(|f| FieldDef {
                    name: f.name,
                    ty: type_from_name(f.type_name.as_deref(), &self.classes),
                    is_const: f.is_const,
                    const_value: f.default.as_ref().and_then(resolver::const_fold),
                })
                .collect();

            let methods: Vec<MethodDef> = decl
                .methods
                .iter()
                .map(|m| MethodDef { name: m.name, function_id: resolved.function_ids.get(&m.name).copied().unwrap_or(0), is_static: false })
                .collect();
            let static_methods: Vec<MethodDef> = decl
                .static_methods
                .iter()
                .map(|m| MethodDef { name: m.name, function_id: resolved.function_ids.get(&m.name).copied().unwrap_or(0), is_static: true })
                .collect();

            // Mandatory positional params are the non-const fields with no
            // default, in declaration order; every non-const field is also
            // reachable by name. `const` fields are never constructor
            // parameters — their value is fixed at the class declaration.
            let positional = fields.iter().filter(|f| !f.is_const && f.const_value.is_none()).map(|f| f.name).collect();
            let named = fields.iter().filter(|f| !f.is_const).map(|f| f.name).collect();

            if let Some(def) = self.classes.get_mut(id) {
                def.parent = parent;
                def.fields = fields;
                def.methods = methods;
                def.static_methods = static_methods;
                def.constructors = Constructors { positional, named };
            }
            self.class_version_digest = self.class_version_digest.wrapping_add(1);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompileErrors(errors))
        }
    }
}

/// Maps a surface type name to the static `Type` tag (`spec.md` §3.3).
/// Unrecognized names fall back to a registered class, then to `Any` for
/// an undeclared/forward-referenced type rather than failing compilation
/// outright — Jactl's `def` bindings are the common case and are untyped.
fn type_from_name(name: Option<&str>, classes: &ClassRegistry) -> types::Type {
    use types::Type;
    match name {
        None => Type::Any,
        Some("boolean") => Type::Boolean,
        Some("byte") => Type::Byte,
        Some("int") => Type::Int,
        Some("long") => Type::Long,
        Some("double") => Type::Double,
        Some("Decimal") => Type::Decimal,
        Some("String") => Type::String,
        Some("List") => Type::List,
        Some("Map") => Type::Map,
        Some("def") | Some("Object") => Type::Any,
        Some(other) => classes.get_by_name(other).map_or(Type::Any, |c| Type::Instance(c.id)),
    }
}
