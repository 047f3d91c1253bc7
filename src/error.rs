//! Error taxonomy surfaced to the embedding host.
//!
//! Two independent error families exist: failures discovered while turning
//! source text into bytecode (`CompileError`) and failures discovered while
//! executing that bytecode (`RuntimeError`). Both carry enough position
//! information for a host to point a user at the offending source.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single compile-time diagnostic (lexical, syntactic, or semantic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub message: String,
    pub source_name: String,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl CompileError {
    #[must_use]
    pub fn new(message: impl Into<String>, source_name: impl Into<String>, line: u32, column: u32, offset: u32) -> Self {
        Self { message: message.into(), source_name: source_name.into(), line, column, offset }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.source_name, self.line, self.column, self.message)
    }
}

impl std::error::Error for CompileError {}

/// A collection of compile errors gathered across an entire compile (the
/// resolver and parser both keep going after the first failure, up to a
/// bounded limit, so the host can report many problems in one pass).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, err: CompileError) {
        self.0.push(err);
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

/// Classification of a runtime failure. Mirrors `spec.md` §6 exactly; the
/// VM never invents a new kind at a call site, it picks one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum RuntimeErrorKind {
    NullDeref,
    TypeError,
    ArityError,
    DivByZero,
    IndexOutOfBounds,
    UnknownField,
    ImmutableField,
    IteratorExhausted,
    Timeout,
    Cancelled,
    CheckpointError,
    RestoreError,
    UserDie,
    Custom,
}

/// A runtime error, carrying the frame chain's outer-most source location at
/// the point of the failure and an optional wrapped cause (e.g. a host error
/// that arrived through a `resumer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub source_name: String,
    pub offset: u32,
    pub cause: Option<Box<RuntimeError>>,
}

impl RuntimeError {
    #[must_use]
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>, source_name: impl Into<String>, offset: u32) -> Self {
        Self { kind, message: message.into(), source_name: source_name.into(), offset, cause: None }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: RuntimeError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn custom(message: impl Into<String>, source_name: impl Into<String>, offset: u32) -> Self {
        Self::new(RuntimeErrorKind::Custom, message, source_name, offset)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}: {}", self.kind, self.source_name, self.offset, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

pub type RunResult<T> = Result<T, RuntimeError>;
