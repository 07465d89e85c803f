//! lazyjit - a layered, lazily-materializing in-process JIT.
//!
//! Modules in a small SSA IR are admitted at run time, compiled to x86-64
//! on demand and linked into the running process. Functions can be deferred
//! individually behind indirection stubs that compile their body on the
//! first call and then jump straight to it.
//!
//! # Primary Usage
//!
//! ```ignore
//! use lazyjit::{ir::Module, LazyJit};
//!
//! let jit = LazyJit::builder().num_threads(4).build()?;
//! jit.add_module(Module::parse("arith", source)?)?;
//! let mul = jit.lookup("mul")?;
//! let mul: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(mul.0 as usize) };
//! assert_eq!(mul(3, 7), 21);
//! ```
//!
//! # Architecture
//!
//! - [`orc`] - Execution session, namespaces, trackers and dispatch
//! - [`layers`] - Transform, compile, link and compile-on-demand layers
//! - [`ir`] - Module format and text parser
//! - [`x64`] - x86-64 encoder, code generator and lazy stubs
//! - [`core`] - Errors, symbols, target and statistics
//! - [`frontend`] - Source translation into modules

pub mod core;
pub mod frontend;
pub mod ir;
pub mod jit;
pub mod layers;
pub mod memory;
pub mod orc;
pub mod x64;

pub use crate::core::{JitAddress, JitError, JitResult, JitStats, SymbolFlags, SymbolName, TargetDescriptor};
pub use crate::jit::{JitBuilder, LazyJit, MAIN_NAMESPACE};
pub use crate::orc::{ExecutionSession, LookupFlags, Namespace, ResourceTracker};
