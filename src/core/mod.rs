// This module holds the infrastructure shared by every other part of the JIT: the error
// taxonomy and result alias, interned symbol names with their flags and addresses, the
// symbol mangler that turns source-level names into linkage names, the description of the
// host target handed to code generators, and the counters the layers bump as modules flow
// through the pipeline.

//! Core JIT infrastructure.
//!
//! ## Errors (`error`)
//! - One `JitError` enum for every stage, cloneable so a failure can be
//!   delivered to every waiting thread
//!
//! ## Symbols (`symbol`)
//! - Interned linkage names compared by identity
//! - Mangling with the target's global prefix
//!
//! ## Target (`target`)
//! - Host architecture, OS and symbol conventions
//!
//! ## Statistics (`stats`)
//! - Compile, link and lazy-stub counters

pub mod error;
pub mod stats;
pub mod symbol;
pub mod target;

pub use error::{JitError, JitResult};
pub use stats::{JitStats, StatsCounters};
pub use symbol::{
    JitAddress, MangleAndInterner, SymbolAddressMap, SymbolFlags, SymbolFlagsMap, SymbolName,
    SymbolStringPool,
};
pub use target::TargetDescriptor;
