//! x86-64 architecture-specific components.
//!
//! - Instruction encoding using iced-x86
//! - System V code generation into relocatable ELF objects
//! - Call-through stubs for lazily compiled functions

pub mod backend;
pub mod encoder;
pub mod stubs;

pub use backend::{compile_function, CompiledFunction, X64CodeGenerator, ARG_REGS};
pub use encoder::{AsmReg, EncodingError, JumpCondition, X64Encoder};
pub use stubs::{emit_stub_block, StubBlock, StubRequest};
