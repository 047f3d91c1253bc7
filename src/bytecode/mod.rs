//! Bytecode compiler and representation (`spec.md` §4.4).

pub mod builder;
pub mod code;
pub mod compiler;
pub mod op;
pub mod vm;

pub use code::Code;
pub use op::Opcode;
