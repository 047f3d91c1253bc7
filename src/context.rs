//! Compilation/runtime configuration (`spec.md` §3.7).
//!
//! Builder pattern modeled on the teacher's `ResourceLimits` builder in
//! `resource.rs`: a `CompilationContext` is built once, then shared
//! immutably by every script instance compiled against it.

use std::sync::Arc;

use crate::{builtins::BuiltinRegistry, class::ClassRegistry, intern::Interns};

#[derive(Debug, Clone)]
pub struct CompilationContext {
    pub min_scale: u32,
    pub max_loop_iterations: Option<u64>,
    pub max_execution_time_ms: Option<u64>,
    pub debug_level: u8,
    pub date_time_enabled: bool,
    pub date_time_auto_import: bool,
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self {
            min_scale: crate::types::DEFAULT_MIN_SCALE,
            max_loop_iterations: None,
            max_execution_time_ms: None,
            debug_level: 0,
            date_time_enabled: false,
            date_time_auto_import: false,
        }
    }
}

/// Builder for `CompilationContext`, mirroring the teacher's
/// `ResourceLimits::builder()` fluent style.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    ctx: CompilationContext,
}

impl ContextBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { ctx: CompilationContext::default() }
    }

    #[must_use]
    pub fn min_scale(mut self, scale: u32) -> Self {
        self.ctx.min_scale = scale;
        self
    }

    #[must_use]
    pub fn max_loop_iterations(mut self, max: u64) -> Self {
        self.ctx.max_loop_iterations = Some(max);
        self
    }

    #[must_use]
    pub fn max_execution_time_ms(mut self, max: u64) -> Self {
        self.ctx.max_execution_time_ms = Some(max);
        self
    }

    #[must_use]
    pub fn debug_level(mut self, level: u8) -> Self {
        self.ctx.debug_level = level;
        self
    }

    #[must_use]
    pub fn date_time_enabled(mut self, enabled: bool) -> Self {
        self.ctx.date_time_enabled = enabled;
        self
    }

    #[must_use]
    pub fn date_time_auto_import(mut self, enabled: bool) -> Self {
        self.ctx.date_time_auto_import = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> CompilationContext {
        self.ctx
    }
}

/// Shared, frozen state produced once all scripts/classes for a given
/// `CompilationContext` have been compiled: interned strings, the class
/// registry, and the builtin function/method tables. Cloned cheaply (`Arc`)
/// into every `ScriptInstance`.
#[derive(Debug, Clone)]
pub struct CompiledWorld {
    pub context: CompilationContext,
    pub interns: Arc<Interns>,
    pub classes: Arc<ClassRegistry>,
    pub builtins: Arc<BuiltinRegistry>,
}
