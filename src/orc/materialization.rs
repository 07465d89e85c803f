//! Materialization units and responsibilities.
//!
//! A [`MaterializationUnit`] is a deferred promise to define a set of
//! symbols. The session keeps it until one of its symbols is looked up, then
//! hands it a [`MaterializationResponsibility`] for exactly those symbols.
//! The responsibility must end in [`publish`](MaterializationResponsibility::publish)
//! or [`fail`](MaterializationResponsibility::fail); dropping it unfinished
//! fails every symbol it covers.

use super::namespace::{LookupFlags, NamespaceId};
use super::session::ExecutionSession;
use super::tracker::TrackerKey;
use crate::core::error::{JitError, JitResult};
use crate::core::symbol::{JitAddress, SymbolAddressMap, SymbolFlags, SymbolFlagsMap, SymbolName};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrId(pub u64);

impl fmt::Display for MrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mr#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(pub u64);

/// A deferred definition of a fixed set of symbols.
pub trait MaterializationUnit: Send {
    fn name(&self) -> &str;

    /// Symbols this unit defines, with their flags.
    fn symbols(&self) -> &SymbolFlagsMap;

    /// Produce the symbols and publish (or fail) through `r`.
    fn materialize(self: Box<Self>, r: MaterializationResponsibility);
}

/// The obligation to produce the symbols of one unit.
pub struct MaterializationResponsibility {
    session: ExecutionSession,
    id: MrId,
    namespace: NamespaceId,
    tracker: TrackerKey,
    symbols: SymbolFlagsMap,
    unit_name: String,
    finished: bool,
}

impl MaterializationResponsibility {
    pub(crate) fn new(
        session: ExecutionSession,
        id: MrId,
        namespace: NamespaceId,
        tracker: TrackerKey,
        symbols: SymbolFlagsMap,
        unit_name: String,
    ) -> Self {
        Self {
            session,
            id,
            namespace,
            tracker,
            symbols,
            unit_name,
            finished: false,
        }
    }

    pub fn id(&self) -> MrId {
        self.id
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    /// Namespace the symbols are being defined in.
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn tracker(&self) -> TrackerKey {
        self.tracker
    }

    pub fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Search order for resolving references from this unit: the link
    /// order of its namespace, which starts with the namespace itself unless
    /// it was replaced with [`ExecutionSession::set_search_order`].
    pub fn search_order(&self) -> JitResult<Vec<(NamespaceId, LookupFlags)>> {
        self.session.link_order_of(self.namespace)
    }

    /// Resolve a linkage name on behalf of this unit. Materializes the
    /// target inline if it is still pending, and reports
    /// `CircularDependency` instead of waiting on itself.
    pub fn lookup(&self, order: &[(NamespaceId, LookupFlags)], name: &str) -> JitResult<JitAddress> {
        let name = self.session.intern(name);
        self.session.lookup_for(order, &name, Some(self.id))
    }

    /// Announce where this responsibility's symbols will live before the
    /// code is emitted. Units that this one is waiting on may then link
    /// against those addresses; entries for other symbols are ignored.
    pub fn notify_resolved(&self, addresses: &SymbolAddressMap) {
        let resolved: Vec<(SymbolName, JitAddress)> = self
            .symbols
            .keys()
            .filter_map(|name| addresses.get(name).map(|addr| (name.clone(), *addr)))
            .collect();
        if !resolved.is_empty() {
            self.session.resolve_responsibility(self.id, resolved);
        }
    }

    /// Publish addresses for every symbol of this responsibility at once.
    ///
    /// If it linked against early addresses of responsibilities that are
    /// still in flight, its symbols become ready when those publish, and it
    /// fails if one of them fails.
    ///
    /// A missing address fails the whole responsibility with a link error.
    /// Extra entries (local symbols of the object) are ignored.
    pub fn publish(mut self, addresses: SymbolAddressMap) -> JitResult<()> {
        self.finished = true;
        let missing: Vec<&SymbolName> = self
            .symbols
            .keys()
            .filter(|name| !addresses.contains_key(*name))
            .collect();

        if let Some(first) = missing.first() {
            let err = JitError::link(
                self.unit_name.clone(),
                format!("no definition produced for `{first}`"),
            );
            self.session.fail_responsibility(self.id, err.clone());
            return Err(err);
        }

        let resolved: Vec<(SymbolName, JitAddress)> = self
            .symbols
            .keys()
            .map(|name| (name.clone(), addresses[name]))
            .collect();
        self.session.publish_responsibility(self.id, resolved)
    }

    /// Fail every symbol of this responsibility with `err`.
    pub fn fail(mut self, err: JitError) {
        self.finished = true;
        self.session.fail_responsibility(self.id, err);
    }
}

impl Drop for MaterializationResponsibility {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("{} for `{}` dropped without publishing", self.id, self.unit_name);
            self.session.fail_responsibility(
                self.id,
                JitError::link(self.unit_name.clone(), "materialization abandoned"),
            );
        }
    }
}

impl fmt::Debug for MaterializationResponsibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializationResponsibility")
            .field("id", &self.id)
            .field("unit", &self.unit_name)
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

/// Defines symbols at fixed addresses.
pub struct AbsoluteSymbolsUnit {
    symbols: SymbolFlagsMap,
    addresses: SymbolAddressMap,
}

impl AbsoluteSymbolsUnit {
    pub fn new(entries: impl IntoIterator<Item = (SymbolName, SymbolFlags, JitAddress)>) -> Self {
        let mut symbols = SymbolFlagsMap::new();
        let mut addresses = SymbolAddressMap::new();
        for (name, flags, addr) in entries {
            symbols.insert(name.clone(), flags);
            addresses.insert(name, addr);
        }
        Self { symbols, addresses }
    }
}

impl MaterializationUnit for AbsoluteSymbolsUnit {
    fn name(&self) -> &str {
        "<absolute symbols>"
    }

    fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    fn materialize(self: Box<Self>, r: MaterializationResponsibility) {
        if let Err(e) = r.publish(self.addresses) {
            log::error!("publishing absolute symbols failed: {}", e);
        }
    }
}
