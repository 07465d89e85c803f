// The execution session is the single authority over symbol tables. All namespace state
// (definitions, materialization states, trackers, pending units, in-flight responsibilities)
// lives behind one mutex and every mutation goes through it, which gives atomic definition
// of unit batches and atomic publication of a responsibility's symbols. Waiting happens on a
// single condition variable that is notified whenever a responsibility publishes or fails.
//
// Lookups walk an ordered list of namespaces. A pending symbol has its unit taken out of the
// table and turned into a responsibility: top-level lookups dispatch it to the task
// dispatcher and wait, nested lookups (made by a responsibility while linking) run it inline
// on the current thread, as do lookups made on a pool worker. A lookup that finds its target
// still queued takes the work back and runs it itself, so a busy pool cannot starve a thread
// that is waiting on queued work.
//
// A responsibility may record the addresses of its symbols before it has emitted them. A
// nested lookup of such a symbol gets that address at once, and the requester then depends
// on the target: when it publishes, its symbols only become ready together with everything
// it depends on. This lets modules that call each other link in any order. Each in-flight
// responsibility records which responsibility it is currently waiting on; a nested lookup
// whose target chain leads back to the requester, with no early address to hand out, fails
// with CircularDependency instead of blocking forever.

//! Execution session: namespaces, definition, lookup, removal and shutdown.

use super::dispatch::{InPlaceDispatcher, Task, TaskDispatcher, ThreadPoolDispatcher};
use super::generator::DefinitionGenerator;
use super::materialization::{MaterializationResponsibility, MaterializationUnit, MrId, UnitId};
use super::namespace::{
    LookupFlags, Namespace, NamespaceId, NamespaceState, SymbolEntry, SymbolState, SymbolStatus,
};
use super::tracker::{ResourceManager, ResourceTracker, TrackerKey};
use crate::core::error::{JitError, JitResult};
use crate::core::stats::{JitStats, StatsCounters};
use crate::core::symbol::{
    JitAddress, MangleAndInterner, SymbolFlags, SymbolFlagsMap, SymbolName, SymbolStringPool,
};
use crate::core::target::TargetDescriptor;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// Shutdown requested; in-flight work may still finish.
    Draining,
    Closed,
}

struct PendingUnit {
    unit: Box<dyn MaterializationUnit>,
    namespace: NamespaceId,
    tracker: TrackerKey,
    symbols: SymbolFlagsMap,
}

type QueuedWork = Arc<Mutex<Option<(Box<dyn MaterializationUnit>, MaterializationResponsibility)>>>;

struct InFlight {
    namespace: NamespaceId,
    tracker: TrackerKey,
    symbol_count: usize,
    waiting_on: Option<MrId>,
    queued: Option<QueuedWork>,
    /// Addresses assigned before the code is emitted.
    resolved: HashMap<SymbolName, JitAddress>,
    /// In-flight responsibilities whose early addresses this one used.
    depends_on: HashSet<MrId>,
    dependents: Vec<MrId>,
    /// Final addresses, held back until every dependency has published.
    emitted: Option<Vec<(SymbolName, JitAddress)>>,
    dependency_failed: Option<JitError>,
}

impl InFlight {
    fn new(namespace: NamespaceId, tracker: TrackerKey, symbol_count: usize) -> Self {
        Self {
            namespace,
            tracker,
            symbol_count,
            waiting_on: None,
            queued: None,
            resolved: HashMap::new(),
            depends_on: HashSet::new(),
            dependents: Vec::new(),
            emitted: None,
            dependency_failed: None,
        }
    }
}

struct TrackerState {
    namespace: NamespaceId,
    symbols: Vec<(NamespaceId, SymbolName)>,
}

struct SessionState {
    phase: Phase,
    next_id: u64,
    namespaces: HashMap<NamespaceId, NamespaceState>,
    names: HashMap<String, NamespaceId>,
    trackers: HashMap<TrackerKey, TrackerState>,
    units: HashMap<UnitId, PendingUnit>,
    in_flight: HashMap<MrId, InFlight>,
}

impl SessionState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn new_tracker(&mut self, namespace: NamespaceId) -> TrackerKey {
        let key = TrackerKey(self.next_id());
        self.trackers.insert(
            key,
            TrackerState {
                namespace,
                symbols: Vec::new(),
            },
        );
        key
    }

    fn namespace(&self, id: NamespaceId) -> JitResult<&NamespaceState> {
        self.namespaces.get(&id).ok_or_else(|| unknown_namespace(id))
    }

    fn namespace_mut(&mut self, id: NamespaceId) -> JitResult<&mut NamespaceState> {
        self.namespaces.get_mut(&id).ok_or_else(|| unknown_namespace(id))
    }

    fn ensure_open(&self) -> JitResult<()> {
        match self.phase {
            Phase::Open => Ok(()),
            Phase::Draining | Phase::Closed => Err(JitError::SessionClosed),
        }
    }

    /// First visible definition of `name` along `order`.
    fn find(&self, order: &[(NamespaceId, LookupFlags)], name: &SymbolName) -> JitResult<Option<SymbolState>> {
        for (id, flags) in order {
            let ns = self.namespace(*id)?;
            if let Some(entry) = ns.symbols.get(name) {
                if flags.admits(entry.flags) {
                    return Ok(Some(entry.state.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Symbols of `trackers` that are currently materializing.
    fn busy_symbols(&self, trackers: &[TrackerKey], namespace: Option<NamespaceId>) -> usize {
        self.in_flight
            .values()
            .filter(|f| trackers.contains(&f.tracker) || Some(f.namespace) == namespace)
            .map(|f| f.symbol_count)
            .sum()
    }

    /// Whether `target` is, directly or transitively, waiting on `requester`.
    fn leads_to(&self, target: MrId, requester: MrId) -> bool {
        let mut current = Some(target);
        let mut steps = 0;
        while let Some(id) = current {
            if id == requester {
                return true;
            }
            steps += 1;
            if steps > self.in_flight.len() {
                break;
            }
            current = self.in_flight.get(&id).and_then(|f| f.waiting_on);
        }
        false
    }

    /// Address `target` already assigned to `name`, recording that
    /// `requester` now depends on `target` being emitted.
    fn early_address(&mut self, target: MrId, requester: MrId, name: &SymbolName) -> Option<JitAddress> {
        let addr = *self.in_flight.get(&target)?.resolved.get(name)?;
        if target != requester {
            if let Some(flight) = self.in_flight.get_mut(&requester) {
                flight.depends_on.insert(target);
            }
            if let Some(flight) = self.in_flight.get_mut(&target) {
                flight.dependents.push(requester);
            }
        }
        Some(addr)
    }

    /// Publish `start` together with the in-flight responsibilities it
    /// depends on, once every one of them has emitted. Returns how many
    /// responsibilities became ready.
    fn finalize_ready(&mut self, start: MrId) -> usize {
        let mut group = vec![start];
        let mut seen: HashSet<MrId> = HashSet::new();
        seen.insert(start);
        let mut i = 0;
        while i < group.len() {
            if let Some(flight) = self.in_flight.get(&group[i]) {
                if flight.emitted.is_none() {
                    return 0;
                }
                for dep in &flight.depends_on {
                    if self.in_flight.contains_key(dep) && seen.insert(*dep) {
                        group.push(*dep);
                    }
                }
            }
            i += 1;
        }

        let mut dependents = Vec::new();
        let mut published = 0;
        for id in &group {
            let Some(flight) = self.in_flight.remove(id) else {
                continue;
            };
            if let Some(ns) = self.namespaces.get_mut(&flight.namespace) {
                for (name, addr) in flight.emitted.unwrap_or_default() {
                    log::trace!("`{}` ready at {}", name, addr);
                    if let Some(entry) = ns.symbols.get_mut(&name) {
                        entry.state = SymbolState::Ready(addr);
                    }
                }
            }
            log::debug!("{} published", id);
            published += 1;
            dependents.extend(flight.dependents);
        }
        for dependent in dependents {
            if self.in_flight.contains_key(&dependent) {
                published += self.finalize_ready(dependent);
            }
        }
        published
    }

    /// Fail `id` and every emitted responsibility that used its addresses.
    /// Dependents still running fail when they publish. Returns how many
    /// responsibilities failed.
    fn fail_flight(&mut self, id: MrId, err: JitError) -> usize {
        let mut failed = 0;
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(flight) = self.in_flight.remove(&id) else {
                continue;
            };
            if let Some(ns) = self.namespaces.get_mut(&flight.namespace) {
                for entry in ns.symbols.values_mut() {
                    if matches!(entry.state, SymbolState::Materializing(m) if m == id) {
                        entry.state = SymbolState::Failed(err.clone());
                    }
                }
            }
            log::error!("{} failed: {}", id, err);
            failed += 1;
            for dependent in flight.dependents {
                if let Some(d) = self.in_flight.get_mut(&dependent) {
                    if d.emitted.is_some() {
                        work.push(dependent);
                    } else {
                        d.dependency_failed.get_or_insert_with(|| err.clone());
                    }
                }
            }
        }
        failed
    }

    fn set_waiting(&mut self, requester: Option<MrId>, target: Option<MrId>) {
        if let Some(req) = requester {
            if let Some(flight) = self.in_flight.get_mut(&req) {
                flight.waiting_on = target;
            }
        }
    }
}

fn unknown_namespace(id: NamespaceId) -> JitError {
    JitError::UnknownNamespace {
        name: format!("#{}", id.0),
    }
}

struct SessionInner {
    state: Mutex<SessionState>,
    cond: Condvar,
    dispatcher: Box<dyn TaskDispatcher>,
    mangler: MangleAndInterner,
    target: TargetDescriptor,
    managers: RwLock<Vec<Arc<dyn ResourceManager>>>,
    stats: StatsCounters,
}

/// A unit to define, paired with where and under which tracker.
pub struct Definition {
    namespace: NamespaceId,
    tracker: TrackerKey,
    unit: Box<dyn MaterializationUnit>,
}

impl Definition {
    pub fn new(namespace: &Namespace, tracker: &ResourceTracker, unit: Box<dyn MaterializationUnit>) -> Self {
        Self {
            namespace: namespace.id(),
            tracker: tracker.key(),
            unit,
        }
    }
}

/// Owned handle to the session. Cloning shares the same session.
#[derive(Clone)]
pub struct ExecutionSession {
    inner: Arc<SessionInner>,
}

/// Non-owning handle, used by objects the session itself keeps alive.
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<ExecutionSession> {
        self.0.upgrade().map(|inner| ExecutionSession { inner })
    }
}

impl ExecutionSession {
    pub fn new(target: TargetDescriptor, dispatcher: Box<dyn TaskDispatcher>) -> Self {
        let mangler = MangleAndInterner::new(Arc::new(SymbolStringPool::new()), target.global_prefix);
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState {
                    phase: Phase::Open,
                    next_id: 0,
                    namespaces: HashMap::new(),
                    names: HashMap::new(),
                    trackers: HashMap::new(),
                    units: HashMap::new(),
                    in_flight: HashMap::new(),
                }),
                cond: Condvar::new(),
                dispatcher,
                mangler,
                target,
                managers: RwLock::new(Vec::new()),
                stats: StatsCounters::new(),
            }),
        }
    }

    /// Session with a pool of `num_threads` workers, or in-place dispatch for zero.
    pub fn with_threads(target: TargetDescriptor, num_threads: usize) -> Self {
        let dispatcher: Box<dyn TaskDispatcher> = if num_threads == 0 {
            Box::new(InPlaceDispatcher)
        } else {
            Box::new(ThreadPoolDispatcher::new(num_threads))
        };
        Self::new(target, dispatcher)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub(crate) fn ptr_eq(&self, other: &ExecutionSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.inner.target
    }

    pub fn mangler(&self) -> &MangleAndInterner {
        &self.inner.mangler
    }

    /// Linkage name for a source-level name.
    pub fn mangle(&self, name: &str) -> SymbolName {
        self.inner.mangler.mangle(name)
    }

    /// Intern a name that is already a linkage name.
    pub fn intern(&self, name: &str) -> SymbolName {
        self.inner.mangler.pool().intern(name)
    }

    pub fn stats(&self) -> JitStats {
        self.inner.stats.snapshot()
    }

    pub fn counters(&self) -> &StatsCounters {
        &self.inner.stats
    }

    pub fn register_resource_manager(&self, manager: Arc<dyn ResourceManager>) {
        self.inner.managers.write().push(manager);
    }

    /// Submit work to the configured dispatcher.
    pub fn dispatch(&self, task: Task) {
        self.inner.dispatcher.dispatch(task);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase != Phase::Open
    }

    pub fn create_namespace(&self, name: &str) -> JitResult<Namespace> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        if state.names.contains_key(name) {
            return Err(JitError::DuplicateNamespace { name: name.to_string() });
        }

        let id = NamespaceId(state.next_id() as u32);
        let tracker = state.new_tracker(id);
        let mut ns = NamespaceState::new(name.to_string(), tracker);
        ns.link_order.push((id, LookupFlags::All));
        state.namespaces.insert(id, ns);
        state.names.insert(name.to_string(), id);

        log::debug!("created namespace `{}` ({:?})", name, id);
        Ok(Namespace::new(id, name, self.clone()))
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        let state = self.inner.state.lock();
        state
            .names
            .get(name)
            .map(|&id| Namespace::new(id, name, self.clone()))
    }

    pub fn create_tracker(&self, namespace: &Namespace) -> JitResult<ResourceTracker> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        state.namespace(namespace.id())?;
        let key = state.new_tracker(namespace.id());
        Ok(ResourceTracker::new(key, namespace.id(), self.clone()))
    }

    pub fn default_tracker(&self, namespace: &Namespace) -> JitResult<ResourceTracker> {
        let state = self.inner.state.lock();
        state.ensure_open()?;
        let key = state.namespace(namespace.id())?.default_tracker;
        Ok(ResourceTracker::new(key, namespace.id(), self.clone()))
    }

    pub(crate) fn tracker_exists(&self, key: TrackerKey) -> bool {
        self.inner.state.lock().trackers.contains_key(&key)
    }

    pub fn add_generator(&self, namespace: &Namespace, generator: Arc<dyn DefinitionGenerator>) -> JitResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        log::debug!("adding {} generator to `{}`", generator.describe(), namespace.name());
        state.namespace_mut(namespace.id())?.generators.push(generator);
        Ok(())
    }

    /// Search `namespace` itself first, then `order`.
    pub fn set_link_order(&self, namespace: &Namespace, order: Vec<(NamespaceId, LookupFlags)>) -> JitResult<()> {
        let mut full = vec![(namespace.id(), LookupFlags::All)];
        for entry in order {
            if !full.iter().any(|(id, _)| *id == entry.0) {
                full.push(entry);
            }
        }
        self.set_search_order(namespace, full)
    }

    /// Replace the complete search order used for `namespace`'s references.
    pub fn set_search_order(&self, namespace: &Namespace, order: Vec<(NamespaceId, LookupFlags)>) -> JitResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        for (id, _) in &order {
            state.namespace(*id)?;
        }
        state.namespace_mut(namespace.id())?.link_order = order;
        Ok(())
    }

    pub fn link_order_of(&self, namespace: NamespaceId) -> JitResult<Vec<(NamespaceId, LookupFlags)>> {
        let state = self.inner.state.lock();
        if state.phase == Phase::Closed {
            return Err(JitError::SessionClosed);
        }
        Ok(state.namespace(namespace)?.link_order.clone())
    }

    pub fn define(
        &self,
        namespace: &Namespace,
        tracker: &ResourceTracker,
        unit: Box<dyn MaterializationUnit>,
    ) -> JitResult<()> {
        self.define_all(vec![Definition::new(namespace, tracker, unit)])
    }

    /// Define several units atomically: either every unit is added or none.
    pub fn define_all(&self, definitions: Vec<Definition>) -> JitResult<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        let mut claimed: HashSet<(NamespaceId, SymbolName)> = HashSet::new();
        for def in &definitions {
            if !state.trackers.contains_key(&def.tracker) {
                return Err(JitError::TrackerClosed);
            }
            let ns = state.namespace(def.namespace)?;
            for name in def.unit.symbols().keys() {
                if ns.symbols.contains_key(name) || !claimed.insert((def.namespace, name.clone())) {
                    return Err(JitError::DuplicateSymbol {
                        name: name.to_string(),
                        namespace: ns.name.clone(),
                    });
                }
            }
        }

        for def in definitions {
            let uid = UnitId(state.next_id());
            let symbols = def.unit.symbols().clone();
            let ns = state.namespace_mut(def.namespace)?;
            for (name, flags) in &symbols {
                ns.symbols.insert(
                    name.clone(),
                    SymbolEntry {
                        flags: *flags,
                        tracker: def.tracker,
                        state: SymbolState::Pending(uid),
                    },
                );
            }
            log::debug!(
                "defined `{}` ({} symbol(s)) in `{}` under {}",
                def.unit.name(),
                symbols.len(),
                ns.name,
                def.tracker
            );
            if let Some(tracker) = state.trackers.get_mut(&def.tracker) {
                tracker
                    .symbols
                    .extend(symbols.keys().map(|name| (def.namespace, name.clone())));
            }
            state.units.insert(
                uid,
                PendingUnit {
                    unit: def.unit,
                    namespace: def.namespace,
                    tracker: def.tracker,
                    symbols,
                },
            );
        }
        Ok(())
    }

    /// Resolve `name` along `order`, materializing it if needed.
    pub fn lookup(&self, order: &[(NamespaceId, LookupFlags)], name: &SymbolName) -> JitResult<JitAddress> {
        self.lookup_for(order, name, None)
    }

    pub(crate) fn lookup_for(
        &self,
        order: &[(NamespaceId, LookupFlags)],
        name: &SymbolName,
        requester: Option<MrId>,
    ) -> JitResult<JitAddress> {
        let mut generators_tried = false;
        let mut state = self.inner.state.lock();
        loop {
            match state.phase {
                Phase::Closed => return Err(JitError::SessionClosed),
                Phase::Draining if requester.is_none() => return Err(JitError::SessionClosed),
                _ => {}
            }

            match state.find(order, name)? {
                Some(SymbolState::Ready(addr)) => return Ok(addr),
                Some(SymbolState::Failed(err)) => return Err(err),
                Some(SymbolState::Pending(uid)) => {
                    let (unit, r) = self.begin_materialization(&mut state, uid, requester)?;
                    let id = r.id();
                    if requester.is_some() || self.inner.dispatcher.is_worker_thread() {
                        drop(state);
                        unit.materialize(r);
                        state = self.inner.state.lock();
                        state.set_waiting(requester, None);
                    } else {
                        let queued: QueuedWork = Arc::new(Mutex::new(Some((unit, r))));
                        if let Some(flight) = state.in_flight.get_mut(&id) {
                            flight.queued = Some(queued.clone());
                        }
                        drop(state);
                        self.inner.dispatcher.dispatch(Task::new(format!("materialize {name}"), move || {
                            let work = queued.lock().take();
                            if let Some((unit, r)) = work {
                                unit.materialize(r);
                            }
                        }));
                        state = self.inner.state.lock();
                    }
                }
                Some(SymbolState::Materializing(target)) => {
                    if let Some(req) = requester {
                        if let Some(addr) = state.early_address(target, req, name) {
                            log::trace!("{} uses early address of `{}` from {}", req, name, target);
                            return Ok(addr);
                        }
                        if state.leads_to(target, req) {
                            log::warn!("{} waits on itself through `{}`", req, name);
                            return Err(JitError::CircularDependency { name: name.to_string() });
                        }
                    }
                    let stolen = state
                        .in_flight
                        .get(&target)
                        .and_then(|f| f.queued.as_ref())
                        .and_then(|q| q.lock().take());
                    state.set_waiting(requester, Some(target));
                    match stolen {
                        Some((unit, r)) => {
                            log::trace!("running queued {} inline for `{}`", target, name);
                            drop(state);
                            unit.materialize(r);
                            state = self.inner.state.lock();
                        }
                        None => self.inner.cond.wait(&mut state),
                    }
                    state.set_waiting(requester, None);
                }
                None => {
                    if generators_tried {
                        return Err(JitError::SymbolNotFound { name: name.to_string() });
                    }
                    generators_tried = true;

                    let candidates: Vec<(NamespaceId, Vec<Arc<dyn DefinitionGenerator>>)> = order
                        .iter()
                        .filter_map(|(id, _)| {
                            state
                                .namespaces
                                .get(id)
                                .filter(|ns| !ns.generators.is_empty())
                                .map(|ns| (*id, ns.generators.clone()))
                        })
                        .collect();
                    if candidates.is_empty() {
                        return Err(JitError::SymbolNotFound { name: name.to_string() });
                    }

                    drop(state);
                    let generated = Self::run_generators(&candidates, name)?;
                    state = self.inner.state.lock();

                    let Some((ns_id, addr)) = generated else {
                        return Err(JitError::SymbolNotFound { name: name.to_string() });
                    };
                    let guard = &mut *state;
                    if let Some(ns) = guard.namespaces.get_mut(&ns_id) {
                        if !ns.symbols.contains_key(name) {
                            let tracker = ns.default_tracker;
                            ns.symbols.insert(
                                name.clone(),
                                SymbolEntry {
                                    flags: SymbolFlags::EXPORTED_FUNCTION,
                                    tracker,
                                    state: SymbolState::Ready(addr),
                                },
                            );
                            if let Some(t) = guard.trackers.get_mut(&tracker) {
                                t.symbols.push((ns_id, name.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    fn run_generators(
        candidates: &[(NamespaceId, Vec<Arc<dyn DefinitionGenerator>>)],
        name: &SymbolName,
    ) -> JitResult<Option<(NamespaceId, JitAddress)>> {
        for (ns, generators) in candidates {
            for generator in generators {
                if let Some(addr) = generator.resolve(name)? {
                    return Ok(Some((*ns, addr)));
                }
            }
        }
        Ok(None)
    }

    fn begin_materialization(
        &self,
        state: &mut SessionState,
        uid: UnitId,
        requester: Option<MrId>,
    ) -> JitResult<(Box<dyn MaterializationUnit>, MaterializationResponsibility)> {
        let pending = state.units.remove(&uid).ok_or_else(|| {
            JitError::link("<unknown>", "pending unit disappeared before materialization")
        })?;
        let id = MrId(state.next_id());

        let ns = state.namespace_mut(pending.namespace)?;
        for name in pending.symbols.keys() {
            if let Some(entry) = ns.symbols.get_mut(name) {
                entry.state = SymbolState::Materializing(id);
            }
        }
        log::debug!(
            "materializing `{}` in `{}` as {}",
            pending.unit.name(),
            ns.name,
            id
        );

        state.in_flight.insert(
            id,
            InFlight::new(pending.namespace, pending.tracker, pending.symbols.len()),
        );
        state.set_waiting(requester, Some(id));

        let r = MaterializationResponsibility::new(
            self.clone(),
            id,
            pending.namespace,
            pending.tracker,
            pending.symbols,
            pending.unit.name().to_string(),
        );
        Ok((pending.unit, r))
    }

    /// Record addresses of `id`'s symbols before its code is emitted, so
    /// that responsibilities it is waiting on can refer to them.
    pub(crate) fn resolve_responsibility(&self, id: MrId, resolved: Vec<(SymbolName, JitAddress)>) {
        let mut state = self.inner.state.lock();
        if let Some(flight) = state.in_flight.get_mut(&id) {
            flight.resolved.extend(resolved);
            self.inner.cond.notify_all();
        }
    }

    /// Mark `id`'s symbols ready. If it used early addresses of
    /// responsibilities that are still in flight, they become ready together.
    pub(crate) fn publish_responsibility(&self, id: MrId, resolved: Vec<(SymbolName, JitAddress)>) -> JitResult<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(flight) = state.in_flight.get_mut(&id) else {
            log::warn!("publish for unknown {}", id);
            return Err(JitError::link("<unknown>", format!("{id} is no longer in flight")));
        };
        if let Some(err) = flight.dependency_failed.take() {
            let failed = state.fail_flight(id, err.clone());
            self.inner.stats.record_failed_materializations(failed);
            self.inner.cond.notify_all();
            return Err(err);
        }

        flight.resolved.extend(resolved.iter().cloned());
        flight.emitted = Some(resolved);
        if state.finalize_ready(id) == 0 {
            log::debug!("{} emitted, waiting for its dependencies", id);
        }
        self.inner.cond.notify_all();
        Ok(())
    }

    pub(crate) fn fail_responsibility(&self, id: MrId, err: JitError) {
        let mut state = self.inner.state.lock();
        let failed = state.fail_flight(id, err);
        self.inner.stats.record_failed_materializations(failed);
        self.inner.cond.notify_all();
    }

    /// State of a linkage name in `namespace`, without materializing it.
    pub fn symbol_status(&self, namespace: NamespaceId, name: &SymbolName) -> Option<SymbolStatus> {
        let state = self.inner.state.lock();
        state
            .namespaces
            .get(&namespace)
            .and_then(|ns| ns.symbols.get(name))
            .map(|entry| SymbolStatus::from(&entry.state))
    }

    /// Unpublish everything owned by `key` and release its resources.
    ///
    /// Fails with `ResourceBusy` while any owned symbol is materializing.
    pub fn remove_tracker(&self, key: TrackerKey) -> JitResult<()> {
        let dropped = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.phase == Phase::Closed {
                return Err(JitError::SessionClosed);
            }
            if !state.trackers.contains_key(&key) {
                return Err(JitError::TrackerClosed);
            }
            let pending = state.busy_symbols(&[key], None) + self.busy_resources(&[key]);
            if pending > 0 {
                return Err(JitError::ResourceBusy { pending });
            }
            self.detach_tracker(state, key, true)
        };
        drop(dropped);
        Ok(())
    }

    fn busy_resources(&self, keys: &[TrackerKey]) -> usize {
        let managers = self.inner.managers.read();
        keys.iter()
            .map(|key| managers.iter().map(|m| m.busy(*key)).sum::<usize>())
            .sum()
    }

    fn detach_tracker(
        &self,
        state: &mut SessionState,
        key: TrackerKey,
        reinstall_default: bool,
    ) -> Vec<Box<dyn MaterializationUnit>> {
        let mut dropped = Vec::new();
        let Some(tracker) = state.trackers.remove(&key) else {
            return dropped;
        };

        let symbol_count = tracker.symbols.len();
        for (ns_id, name) in tracker.symbols {
            let Some(ns) = state.namespaces.get_mut(&ns_id) else {
                continue;
            };
            ns.symbols.remove(&name);
        }

        let unit_ids: Vec<UnitId> = state
            .units
            .iter()
            .filter(|(_, u)| u.tracker == key)
            .map(|(id, _)| *id)
            .collect();
        for id in unit_ids {
            if let Some(unit) = state.units.remove(&id) {
                dropped.push(unit.unit);
            }
        }

        if reinstall_default {
            let is_default = state
                .namespaces
                .get(&tracker.namespace)
                .is_some_and(|ns| ns.default_tracker == key);
            if is_default {
                let fresh = state.new_tracker(tracker.namespace);
                if let Some(ns) = state.namespaces.get_mut(&tracker.namespace) {
                    ns.default_tracker = fresh;
                }
            }
        }

        for manager in self.inner.managers.read().iter() {
            manager.release(key);
        }
        self.inner.stats.record_tracker_removed();
        log::info!(
            "removed {}: {} symbol(s), {} unmaterialized unit(s)",
            key,
            symbol_count,
            dropped.len()
        );
        dropped
    }

    /// Tear down a namespace and every tracker it owns.
    pub fn remove_namespace(&self, namespace: &Namespace) -> JitResult<()> {
        let mut dropped = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.phase == Phase::Closed {
                return Err(JitError::SessionClosed);
            }
            let id = namespace.id();
            state.namespace(id)?;

            let owned: Vec<TrackerKey> = state
                .trackers
                .iter()
                .filter(|(_, t)| t.namespace == id)
                .map(|(k, _)| *k)
                .collect();
            let pending = state.busy_symbols(&owned, Some(id)) + self.busy_resources(&owned);
            if pending > 0 {
                return Err(JitError::ResourceBusy { pending });
            }

            for key in owned {
                dropped.extend(self.detach_tracker(state, key, false));
            }

            // Definitions other namespaces' trackers made here.
            if let Some(ns) = state.namespaces.remove(&id) {
                state.names.remove(&ns.name);
                for tracker in state.trackers.values_mut() {
                    tracker.symbols.retain(|(ns_id, _)| *ns_id != id);
                }
                log::info!("removed namespace `{}`", ns.name);
            }
            let unit_ids: Vec<UnitId> = state
                .units
                .iter()
                .filter(|(_, u)| u.namespace == id)
                .map(|(uid, _)| *uid)
                .collect();
            for uid in unit_ids {
                if let Some(unit) = state.units.remove(&uid) {
                    dropped.push(unit.unit);
                }
            }
            for ns in state.namespaces.values_mut() {
                ns.link_order.retain(|(ns_id, _)| *ns_id != id);
            }
        }
        drop(dropped);
        Ok(())
    }

    /// Wait for in-flight work, drop every namespace, release all resources
    /// and stop the dispatcher. A second call returns `SessionClosed`.
    pub fn shutdown(&self) -> JitResult<()> {
        let (namespaces, units) = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Open {
                return Err(JitError::SessionClosed);
            }
            state.phase = Phase::Draining;
            log::debug!("draining {} in-flight responsibility(ies)", state.in_flight.len());
            if self.inner.dispatcher.is_worker_thread() {
                log::warn!("session shut down from a worker thread, not waiting for in-flight work");
            } else {
                while !state.in_flight.is_empty() {
                    self.inner.cond.wait(&mut state);
                }
            }
            state.phase = Phase::Closed;
            state.names.clear();
            state.trackers.clear();
            (
                std::mem::take(&mut state.namespaces),
                std::mem::take(&mut state.units),
            )
        };
        self.inner.cond.notify_all();

        for manager in self.inner.managers.read().iter() {
            manager.release_all();
        }
        log::info!(
            "session closed: dropped {} namespace(s) and {} unmaterialized unit(s)",
            namespaces.len(),
            units.len()
        );
        drop(units);
        drop(namespaces);
        self.inner.dispatcher.shutdown();
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("target", &self.inner.target)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symbol::SymbolAddressMap;
    use crate::orc::generator::AbsoluteSymbolsGenerator;
    use crate::orc::materialization::AbsoluteSymbolsUnit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> ExecutionSession {
        ExecutionSession::with_threads(TargetDescriptor::host(), 0)
    }

    /// Publishes fixed addresses and counts materializations.
    struct CountingUnit {
        symbols: SymbolFlagsMap,
        addr: u64,
        runs: Arc<AtomicUsize>,
    }

    impl MaterializationUnit for CountingUnit {
        fn name(&self) -> &str {
            "counting"
        }

        fn symbols(&self) -> &SymbolFlagsMap {
            &self.symbols
        }

        fn materialize(self: Box<Self>, r: MaterializationResponsibility) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let addresses = self
                .symbols
                .keys()
                .map(|name| (name.clone(), JitAddress(self.addr)))
                .collect();
            r.publish(addresses).unwrap();
        }
    }

    fn counting(es: &ExecutionSession, names: &[&str], addr: u64, runs: &Arc<AtomicUsize>) -> Box<CountingUnit> {
        let symbols = names
            .iter()
            .map(|n| (es.mangle(n), SymbolFlags::EXPORTED_FUNCTION))
            .collect();
        Box::new(CountingUnit {
            symbols,
            addr,
            runs: runs.clone(),
        })
    }

    /// Looks up `deps` in order from inside its own materialization. With
    /// `announce` set, its own address is assigned before the lookups, the
    /// way the linker does before applying relocations.
    struct DependentUnit {
        symbols: SymbolFlagsMap,
        deps: Vec<String>,
        announce: Option<u64>,
    }

    fn dependent(es: &ExecutionSession, name: &str, deps: &[&str], announce: Option<u64>) -> Box<DependentUnit> {
        Box::new(DependentUnit {
            symbols: [(es.mangle(name), SymbolFlags::EXPORTED_FUNCTION)].into_iter().collect(),
            deps: deps.iter().map(|d| es.mangle(d).to_string()).collect(),
            announce,
        })
    }

    impl MaterializationUnit for DependentUnit {
        fn name(&self) -> &str {
            "dependent"
        }

        fn symbols(&self) -> &SymbolFlagsMap {
            &self.symbols
        }

        fn materialize(self: Box<Self>, r: MaterializationResponsibility) {
            let own = |addr: u64| -> SymbolAddressMap {
                self.symbols
                    .keys()
                    .map(|name| (name.clone(), JitAddress(addr)))
                    .collect()
            };
            if let Some(addr) = self.announce {
                r.notify_resolved(&own(addr));
            }
            let order = r.search_order().unwrap();
            let mut first = None;
            for dep in &self.deps {
                match r.lookup(&order, dep) {
                    Ok(addr) => {
                        first.get_or_insert(addr.0 + 1);
                    }
                    Err(e) => return r.fail(e),
                }
            }
            let addr = self.announce.or(first).unwrap_or_default();
            let _ = r.publish(own(addr));
        }
    }

    #[test]
    fn test_lookup_materializes_once() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        ns.define(counting(&es, &["a", "b"], 0x1000, &runs)).unwrap();

        assert_eq!(ns.status("a"), Some(SymbolStatus::Pending));
        assert_eq!(ns.lookup("a").unwrap(), JitAddress(0x1000));
        assert_eq!(ns.lookup("b").unwrap(), JitAddress(0x1000));
        assert_eq!(ns.lookup("a").unwrap(), JitAddress(0x1000));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_definition_rejected_atomically() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        ns.define(counting(&es, &["a"], 1, &runs)).unwrap();

        let err = ns.define(counting(&es, &["b", "a"], 2, &runs)).unwrap_err();
        assert!(matches!(err, JitError::DuplicateSymbol { .. }));
        assert_eq!(ns.status("b"), None);
    }

    #[test]
    fn test_hidden_symbols_need_all_flags() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        let hidden = es.mangle("secret");
        ns.define(Box::new(AbsoluteSymbolsUnit::new([(
            hidden.clone(),
            SymbolFlags::HIDDEN_DATA,
            JitAddress(0x42),
        )])))
        .unwrap();

        assert!(matches!(ns.lookup("secret"), Err(JitError::SymbolNotFound { .. })));
        assert_eq!(
            es.lookup(&[(ns.id(), LookupFlags::All)], &hidden).unwrap(),
            JitAddress(0x42)
        );
    }

    #[test]
    fn test_generator_fallback() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        let name = es.mangle("host_fn").to_string();
        ns.add_generator(Arc::new(
            AbsoluteSymbolsGenerator::new().with_symbol(name, JitAddress(0x77)),
        ))
        .unwrap();

        assert_eq!(ns.lookup("host_fn").unwrap(), JitAddress(0x77));
        assert_eq!(ns.status("host_fn"), Some(SymbolStatus::Ready(JitAddress(0x77))));
        assert!(matches!(ns.lookup("missing"), Err(JitError::SymbolNotFound { .. })));
    }

    #[test]
    fn test_nested_lookup_through_link_order() {
        let es = session();
        let lib = es.create_namespace("lib").unwrap();
        let app = es.create_namespace("app").unwrap();
        app.set_link_order(&[(&lib, LookupFlags::ExportedOnly)]).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        lib.define(counting(&es, &["dep"], 0x100, &runs)).unwrap();
        app.define(dependent(&es, "user", &["dep"], None)).unwrap();

        assert_eq!(app.lookup("user").unwrap(), JitAddress(0x101));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_circular_dependency_detected() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        ns.define(dependent(&es, "ping", &["pong"], None)).unwrap();
        ns.define(dependent(&es, "pong", &["ping"], None)).unwrap();

        let err = ns.lookup("ping").unwrap_err();
        assert!(matches!(err, JitError::CircularDependency { .. }), "{err}");
        assert!(matches!(
            ns.status("ping"),
            Some(SymbolStatus::Failed(JitError::CircularDependency { .. }))
        ));
        assert!(matches!(ns.status("pong"), Some(SymbolStatus::Failed(_))));
    }

    #[test]
    fn test_mutual_dependency_resolves_through_early_addresses() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        ns.define(dependent(&es, "ping", &["pong"], Some(0x100))).unwrap();
        ns.define(dependent(&es, "pong", &["ping"], Some(0x200))).unwrap();

        assert_eq!(ns.lookup("ping").unwrap(), JitAddress(0x100));
        // Both publish together once the second one has emitted.
        assert_eq!(ns.status("pong"), Some(SymbolStatus::Ready(JitAddress(0x200))));
        assert_eq!(ns.lookup("pong").unwrap(), JitAddress(0x200));
        assert_eq!(es.stats().failed_materializations, 0);
    }

    #[test]
    fn test_failed_dependency_fails_its_emitted_dependent() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        // pong emits against ping's early address, then ping fails on a
        // symbol nobody defines.
        ns.define(dependent(&es, "ping", &["pong", "missing"], Some(0x100))).unwrap();
        ns.define(dependent(&es, "pong", &["ping"], Some(0x200))).unwrap();

        assert!(matches!(ns.lookup("ping"), Err(JitError::SymbolNotFound { .. })));
        assert!(matches!(
            ns.status("pong"),
            Some(SymbolStatus::Failed(JitError::SymbolNotFound { .. }))
        ));
        assert_eq!(es.stats().failed_materializations, 2);
    }

    #[test]
    fn test_remove_tracker_and_default_reinstalled() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let rt = ns.create_tracker().unwrap();
        ns.define_with(&rt, counting(&es, &["a"], 1, &runs)).unwrap();
        ns.lookup("a").unwrap();

        rt.remove().unwrap();
        assert!(rt.is_removed());
        assert!(matches!(ns.lookup("a"), Err(JitError::SymbolNotFound { .. })));
        assert_eq!(rt.remove(), Err(JitError::TrackerClosed));
        assert_eq!(
            ns.define_with(&rt, counting(&es, &["a"], 1, &runs)).unwrap_err(),
            JitError::TrackerClosed
        );

        let default = ns.default_tracker().unwrap();
        default.remove().unwrap();
        let fresh = ns.default_tracker().unwrap();
        assert_ne!(fresh.key(), default.key());
        ns.define(counting(&es, &["a"], 2, &runs)).unwrap();
        assert_eq!(ns.lookup("a").unwrap(), JitAddress(2));
        assert_eq!(es.stats().trackers_removed, 2);
    }

    #[test]
    fn test_unmaterialized_units_are_dropped_on_removal() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let rt = ns.create_tracker().unwrap();
        ns.define_with(&rt, counting(&es, &["lazy"], 1, &runs)).unwrap();

        rt.remove().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(ns.status("lazy"), None);
    }

    #[test]
    fn test_duplicate_namespace() {
        let es = session();
        es.create_namespace("main").unwrap();
        assert_eq!(
            es.create_namespace("main").unwrap_err(),
            JitError::DuplicateNamespace { name: "main".into() }
        );
    }

    #[test]
    fn test_remove_namespace_unlinks_it() {
        let es = session();
        let lib = es.create_namespace("lib").unwrap();
        let app = es.create_namespace("app").unwrap();
        app.set_link_order(&[(&lib, LookupFlags::ExportedOnly)]).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        lib.define(counting(&es, &["f"], 1, &runs)).unwrap();

        lib.remove().unwrap();
        assert!(es.namespace("lib").is_none());
        assert_eq!(app.link_order().unwrap(), vec![(app.id(), LookupFlags::All)]);
        assert!(matches!(lib.lookup("f"), Err(JitError::UnknownNamespace { .. })));
    }

    #[test]
    fn test_shutdown_closes_session() {
        let es = session();
        let ns = es.create_namespace("main").unwrap();
        es.shutdown().unwrap();

        assert!(es.is_closed());
        assert_eq!(es.shutdown(), Err(JitError::SessionClosed));
        assert_eq!(ns.lookup("x"), Err(JitError::SessionClosed));
        assert_eq!(es.create_namespace("other").unwrap_err(), JitError::SessionClosed);
    }
}
