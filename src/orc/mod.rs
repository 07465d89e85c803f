//! Symbol-table machinery shared by all layers.
//!
//! - [`session`]: the [`ExecutionSession`] owning every namespace
//! - [`namespace`]: named symbol tables with link order and generators
//! - [`materialization`]: deferred units and the responsibility to define them
//! - [`tracker`]: resource trackers and the managers that free per-tracker state
//! - [`dispatch`]: in-place and thread-pool task execution
//! - [`generator`]: fallback symbol sources

pub mod dispatch;
pub mod generator;
pub mod materialization;
pub mod namespace;
pub mod session;
pub mod tracker;

pub use dispatch::{InPlaceDispatcher, Task, TaskDispatcher, ThreadPoolDispatcher};
pub use generator::{AbsoluteSymbolsGenerator, DefinitionGenerator, ProcessSymbolsGenerator};
pub use materialization::{
    AbsoluteSymbolsUnit, MaterializationResponsibility, MaterializationUnit, MrId, UnitId,
};
pub use namespace::{LookupFlags, Namespace, NamespaceId, SymbolStatus};
pub use session::{Definition, ExecutionSession, WeakSession};
pub use tracker::{ResourceManager, ResourceTracker, TrackerKey};
