//! Namespaces (JIT dylibs): named symbol tables with a link order and
//! fallback generators.

use super::generator::DefinitionGenerator;
use super::materialization::{MaterializationUnit, MrId, UnitId};
use super::session::ExecutionSession;
use super::tracker::{ResourceTracker, TrackerKey};
use crate::core::error::{JitError, JitResult};
use crate::core::symbol::{JitAddress, SymbolFlags, SymbolName};
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(pub u32);

/// Which symbols of a namespace a search may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupFlags {
    /// Exported symbols only.
    ExportedOnly,
    /// Hidden symbols too.
    All,
}

impl LookupFlags {
    pub fn admits(self, flags: SymbolFlags) -> bool {
        match self {
            LookupFlags::ExportedOnly => flags.exported,
            LookupFlags::All => true,
        }
    }
}

/// Materialization state of one symbol.
#[derive(Debug, Clone)]
pub(crate) enum SymbolState {
    Pending(UnitId),
    Materializing(MrId),
    Ready(JitAddress),
    Failed(JitError),
}

#[derive(Debug, Clone)]
pub(crate) struct SymbolEntry {
    pub flags: SymbolFlags,
    pub tracker: TrackerKey,
    pub state: SymbolState,
}

/// Publicly observable symbol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolStatus {
    Pending,
    Materializing,
    Ready(JitAddress),
    Failed(JitError),
}

impl From<&SymbolState> for SymbolStatus {
    fn from(state: &SymbolState) -> Self {
        match state {
            SymbolState::Pending(_) => SymbolStatus::Pending,
            SymbolState::Materializing(_) => SymbolStatus::Materializing,
            SymbolState::Ready(addr) => SymbolStatus::Ready(*addr),
            SymbolState::Failed(err) => SymbolStatus::Failed(err.clone()),
        }
    }
}

/// Session-internal state of a namespace.
pub(crate) struct NamespaceState {
    pub name: String,
    pub symbols: HashMap<SymbolName, SymbolEntry>,
    pub link_order: Vec<(NamespaceId, LookupFlags)>,
    pub generators: Vec<Arc<dyn DefinitionGenerator>>,
    pub default_tracker: TrackerKey,
}

impl NamespaceState {
    pub fn new(name: String, default_tracker: TrackerKey) -> Self {
        Self {
            name,
            symbols: HashMap::new(),
            link_order: Vec::new(),
            generators: Vec::new(),
            default_tracker,
        }
    }
}

/// Handle to a namespace owned by an [`ExecutionSession`].
#[derive(Clone)]
pub struct Namespace {
    id: NamespaceId,
    name: Arc<str>,
    session: ExecutionSession,
}

impl Namespace {
    pub(crate) fn new(id: NamespaceId, name: &str, session: ExecutionSession) -> Self {
        Self {
            id,
            name: Arc::from(name),
            session,
        }
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    /// Define `unit` under the namespace's default tracker.
    pub fn define(&self, unit: Box<dyn MaterializationUnit>) -> JitResult<()> {
        let tracker = self.default_tracker()?;
        self.define_with(&tracker, unit)
    }

    pub fn define_with(&self, tracker: &ResourceTracker, unit: Box<dyn MaterializationUnit>) -> JitResult<()> {
        self.session.define(self, tracker, unit)
    }

    pub fn default_tracker(&self) -> JitResult<ResourceTracker> {
        self.session.default_tracker(self)
    }

    pub fn create_tracker(&self) -> JitResult<ResourceTracker> {
        self.session.create_tracker(self)
    }

    pub fn add_generator(&self, generator: Arc<dyn DefinitionGenerator>) -> JitResult<()> {
        self.session.add_generator(self, generator)
    }

    /// Namespaces searched after this one when resolving its references.
    pub fn set_link_order(&self, order: &[(&Namespace, LookupFlags)]) -> JitResult<()> {
        let order = order.iter().map(|(ns, flags)| (ns.id(), *flags)).collect();
        self.session.set_link_order(self, order)
    }

    pub fn link_order(&self) -> JitResult<Vec<(NamespaceId, LookupFlags)>> {
        self.session.link_order_of(self.id)
    }

    /// Look up an exported symbol by source-level name.
    pub fn lookup(&self, name: &str) -> JitResult<JitAddress> {
        let name = self.session.mangle(name);
        self.session.lookup(&[(self.id, LookupFlags::ExportedOnly)], &name)
    }

    /// State of a source-level name without triggering materialization.
    pub fn status(&self, name: &str) -> Option<SymbolStatus> {
        let name = self.session.mangle(name);
        self.session.symbol_status(self.id, &name)
    }

    pub fn remove(&self) -> JitResult<()> {
        self.session.remove_namespace(self)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.session.ptr_eq(&other.session)
    }
}

impl Eq for Namespace {}
