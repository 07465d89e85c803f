// Compile-on-demand. Adding a module to this layer splits it: every function becomes its own
// module defined in a companion implementation namespace ("<target>.impl"), globals stay
// together in a data module defined in the target namespace, and the target receives one
// lazy reexports unit declaring every function. All of these definitions are made in one
// atomic step under the caller's tracker, so duplicates reject the whole module and removing
// the tracker revokes bodies, data and stubs together.
//
// Looking up a function in the target materializes the reexports unit, which emits one
// indirection stub per function and publishes the stub addresses. A stub jumps through a
// slot that initially points at its reentry thunk; the thunk calls lazy_reentry, which drives
// the body through the base layer by looking it up in the implementation namespace, stores
// the body address into the slot and continues at the body. Each stub is guarded by a
// LazyEntry state machine (unresolved, resolving, resolved or failed): the first caller
// compiles, concurrent callers wait on a condition variable, and a failure is final. The
// implementation namespace resolves references through the target first, so calls between
// lazy functions always go through the stable stub addresses.

//! Lazy per-function compilation behind indirection stubs.

use super::{symbol_flags, IrLayer, IrModuleUnit};
use crate::core::error::{JitError, JitResult};
use crate::core::symbol::{JitAddress, SymbolAddressMap, SymbolFlagsMap, SymbolName};
use crate::ir::Module;
use crate::memory::JitMemory;
use crate::orc::{
    Definition, ExecutionSession, LookupFlags, MaterializationResponsibility, MaterializationUnit,
    Namespace, NamespaceId, ResourceManager, ResourceTracker, TrackerKey, WeakSession,
};
use crate::x64::{emit_stub_block, StubRequest};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Called with the error before the process aborts on a failed lazy call.
pub type FatalHandler = Arc<dyn Fn(&JitError) + Send + Sync>;

/// Logs the failure to the error log and to stderr.
pub fn report_lazy_failure() -> FatalHandler {
    Arc::new(|err: &JitError| {
        log::error!("{}", err);
        eprintln!("lazyjit: fatal: {err}");
    })
}

#[derive(Debug, Clone)]
enum EntryState {
    Unresolved,
    Resolving,
    Resolved(JitAddress),
    Failed(JitError),
}

/// Call-through state of one lazily compiled function.
pub struct LazyEntry {
    /// Jump target of the stub: the reentry thunk, then the body.
    slot: AtomicU64,
    symbol: SymbolName,
    body_order: Vec<(NamespaceId, LookupFlags)>,
    session: WeakSession,
    fatal: FatalHandler,
    state: Mutex<EntryState>,
    resolved: Condvar,
}

impl LazyEntry {
    fn new(
        symbol: SymbolName,
        body_order: Vec<(NamespaceId, LookupFlags)>,
        session: WeakSession,
        fatal: FatalHandler,
    ) -> Self {
        Self {
            slot: AtomicU64::new(0),
            symbol,
            body_order,
            session,
            fatal,
            state: Mutex::new(EntryState::Unresolved),
            resolved: Condvar::new(),
        }
    }

    pub fn symbol(&self) -> &SymbolName {
        &self.symbol
    }

    /// Current jump target of the stub.
    pub fn slot_value(&self) -> u64 {
        self.slot.load(Ordering::Acquire)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Resolved(_))
    }

    /// Whether a caller is compiling the body right now.
    pub fn is_resolving(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Resolving)
    }

    fn slot_address(&self) -> u64 {
        &self.slot as *const AtomicU64 as usize as u64
    }

    /// Compile the body if nobody has yet, and return its address.
    ///
    /// Exactly one caller drives compilation; the others wait for it.
    pub fn resolve(&self) -> JitResult<JitAddress> {
        {
            let mut state = self.state.lock();
            loop {
                match &*state {
                    EntryState::Resolved(addr) => return Ok(*addr),
                    EntryState::Failed(err) => return Err(err.clone()),
                    EntryState::Resolving => self.resolved.wait(&mut state),
                    EntryState::Unresolved => {
                        *state = EntryState::Resolving;
                        break;
                    }
                }
            }
        }

        log::debug!("first call of `{}`, compiling body", self.symbol);
        let result = self.compile_body();

        let mut state = self.state.lock();
        match &result {
            Ok(addr) => {
                self.slot.store(addr.0, Ordering::Release);
                *state = EntryState::Resolved(*addr);
                if let Some(session) = self.session.upgrade() {
                    session.counters().record_stub_resolved();
                }
                log::debug!("stub for `{}` now jumps to {}", self.symbol, addr);
            }
            Err(err) => *state = EntryState::Failed(err.clone()),
        }
        self.resolved.notify_all();
        result
    }

    fn compile_body(&self) -> JitResult<JitAddress> {
        let wrap = |source: JitError| JitError::LazyCompileFailure {
            symbol: self.symbol.to_string(),
            source: Box::new(source),
        };
        let session = self.session.upgrade().ok_or_else(|| wrap(JitError::SessionClosed))?;
        session.lookup(&self.body_order, &self.symbol).map_err(wrap)
    }
}

impl fmt::Debug for LazyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyEntry")
            .field("symbol", &self.symbol)
            .field("slot", &format_args!("{:#x}", self.slot_value()))
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Entered from a reentry thunk with the entry of the called stub.
extern "C" fn lazy_reentry(entry: *const LazyEntry) -> u64 {
    // SAFETY: thunks are only emitted for entries owned by an Arc in the
    // StubManager while the stub memory is mapped, so the pointer is live
    // when the thunk runs. Taking our own reference keeps it live until the
    // call returns even if the tracker is removed meanwhile.
    let entry = unsafe {
        Arc::increment_strong_count(entry);
        Arc::from_raw(entry)
    };
    match entry.resolve() {
        Ok(addr) => addr.0,
        Err(err) => {
            (entry.fatal)(&err);
            std::process::abort()
        }
    }
}

struct StubAllocation {
    _memory: JitMemory,
    entries: Vec<(NamespaceId, SymbolName)>,
}

/// Owns stub memory and lazy entries per resource tracker.
#[derive(Default)]
pub struct StubManager {
    allocations: Mutex<HashMap<TrackerKey, Vec<StubAllocation>>>,
    entries: Mutex<HashMap<(NamespaceId, SymbolName), Arc<LazyEntry>>>,
}

impl StubManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit stubs for `entries` and return each symbol's stub address.
    fn create_stubs(
        &self,
        session: &ExecutionSession,
        key: TrackerKey,
        namespace: NamespaceId,
        entries: Vec<Arc<LazyEntry>>,
    ) -> JitResult<SymbolAddressMap> {
        let requests: Vec<StubRequest> = entries
            .iter()
            .map(|entry| StubRequest {
                slot: entry.slot_address(),
                context: Arc::as_ptr(entry) as usize as u64,
            })
            .collect();
        let handler: extern "C" fn(*const LazyEntry) -> u64 = lazy_reentry;
        let block = emit_stub_block(&requests, handler as usize as u64)
            .map_err(|e| JitError::compile("<lazy stubs>", e.to_string()))?;

        let mut memory = JitMemory::allocate(block.code.len())?;
        memory.write(0, &block.code)?;
        let base = memory.base();
        for (entry, thunk) in entries.iter().zip(&block.thunk_offsets) {
            entry.slot.store(base + *thunk as u64, Ordering::Release);
        }
        memory.make_executable(block.code.len())?;

        let mut addresses = SymbolAddressMap::new();
        for (entry, stub) in entries.iter().zip(&block.stub_offsets) {
            addresses.insert(entry.symbol.clone(), JitAddress(base + *stub as u64));
        }

        let names: Vec<(NamespaceId, SymbolName)> = entries
            .iter()
            .map(|entry| (namespace, entry.symbol.clone()))
            .collect();
        {
            let mut index = self.entries.lock();
            for entry in &entries {
                index.insert((namespace, entry.symbol.clone()), entry.clone());
            }
        }
        self.allocations.lock().entry(key).or_default().push(StubAllocation {
            _memory: memory,
            entries: names,
        });

        session.counters().record_stubs_created(entries.len());
        log::debug!("created {} stub(s) at {:#x} for {}", entries.len(), base, key);
        Ok(addresses)
    }

    /// The entry behind the stub for `symbol` in `namespace`.
    pub fn entry(&self, namespace: NamespaceId, symbol: &SymbolName) -> Option<Arc<LazyEntry>> {
        self.entries.lock().get(&(namespace, symbol.clone())).cloned()
    }

    pub fn stub_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn resolving(&self, key: TrackerKey) -> usize {
        let allocations = self.allocations.lock();
        let Some(list) = allocations.get(&key) else {
            return 0;
        };
        let index = self.entries.lock();
        list.iter()
            .flat_map(|allocation| &allocation.entries)
            .filter_map(|name| index.get(name))
            .filter(|entry| entry.is_resolving())
            .count()
    }

    fn forget(&self, allocations: &[StubAllocation]) {
        let mut index = self.entries.lock();
        for allocation in allocations {
            for name in &allocation.entries {
                index.remove(name);
            }
        }
    }
}

impl ResourceManager for StubManager {
    fn release(&self, key: TrackerKey) {
        let released = self.allocations.lock().remove(&key);
        if let Some(allocations) = released {
            self.forget(&allocations);
            log::debug!("releasing {} stub block(s) for {}", allocations.len(), key);
        }
    }

    fn release_all(&self) {
        let all: Vec<StubAllocation> = self
            .allocations
            .lock()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        self.forget(&all);
    }

    fn busy(&self, key: TrackerKey) -> usize {
        self.resolving(key)
    }
}

/// Declares a module's functions in the target namespace and publishes
/// stubs for them when first looked up.
pub struct LazyReexportsUnit {
    name: String,
    symbols: SymbolFlagsMap,
    body_order: Vec<(NamespaceId, LookupFlags)>,
    stubs: Arc<StubManager>,
    fatal: FatalHandler,
}

impl LazyReexportsUnit {
    pub fn new(
        name: String,
        symbols: SymbolFlagsMap,
        body_order: Vec<(NamespaceId, LookupFlags)>,
        stubs: Arc<StubManager>,
        fatal: FatalHandler,
    ) -> Self {
        Self {
            name,
            symbols,
            body_order,
            stubs,
            fatal,
        }
    }
}

impl MaterializationUnit for LazyReexportsUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    fn materialize(self: Box<Self>, r: MaterializationResponsibility) {
        let session = r.session().clone();
        if !session.target().is_sysv_x86_64() {
            r.fail(JitError::compile(
                self.name.clone(),
                format!("lazy stubs are not supported on {}", session.target()),
            ));
            return;
        }

        let weak = session.downgrade();
        let entries: Vec<Arc<LazyEntry>> = self
            .symbols
            .keys()
            .map(|symbol| {
                Arc::new(LazyEntry::new(
                    symbol.clone(),
                    self.body_order.clone(),
                    weak.clone(),
                    self.fatal.clone(),
                ))
            })
            .collect();

        match self.stubs.create_stubs(&session, r.tracker(), r.namespace(), entries) {
            Ok(addresses) => {
                if let Err(e) = r.publish(addresses) {
                    log::error!("publishing stubs of `{}` failed: {}", self.name, e);
                }
            }
            Err(e) => r.fail(e),
        }
    }
}

/// Splits modules per function and compiles each body on its first call.
pub struct CompileOnDemandLayer {
    base: Arc<dyn IrLayer>,
    stubs: Arc<StubManager>,
    fatal: FatalHandler,
    impls: Mutex<HashMap<NamespaceId, Namespace>>,
}

impl CompileOnDemandLayer {
    pub fn new(session: &ExecutionSession, base: Arc<dyn IrLayer>) -> Self {
        let stubs = Arc::new(StubManager::new());
        session.register_resource_manager(stubs.clone());
        Self {
            base,
            stubs,
            fatal: report_lazy_failure(),
            impls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal = handler;
        self
    }

    pub fn stubs(&self) -> &Arc<StubManager> {
        &self.stubs
    }

    /// Companion namespace holding the bodies of `target`'s lazy functions.
    ///
    /// Its search order is refreshed from `target`'s link order on every call.
    pub fn impl_namespace(&self, target: &Namespace) -> JitResult<Namespace> {
        let session = target.session();
        let impl_ns = {
            let mut impls = self.impls.lock();
            match impls.get(&target.id()) {
                Some(ns) => ns.clone(),
                None => {
                    let ns = session.create_namespace(&format!("{}.impl", target.name()))?;
                    impls.insert(target.id(), ns.clone());
                    ns
                }
            }
        };

        let mut order = target.link_order()?;
        if !order.iter().any(|(id, _)| *id == impl_ns.id()) {
            order.push((impl_ns.id(), LookupFlags::All));
        }
        session.set_search_order(&impl_ns, order)?;
        Ok(impl_ns)
    }

    /// Admit `module` into `target` with every function compiled lazily.
    pub fn add_module(&self, target: &Namespace, tracker: &ResourceTracker, module: Module) -> JitResult<()> {
        module.verify()?;
        let session = target.session();
        let impl_ns = self.impl_namespace(target)?;
        let mangler = session.mangler();
        let name = module.name().to_string();

        let (data, parts) = module.split_per_function();
        let mut definitions = Vec::with_capacity(parts.len() + 2);
        let mut reexports = SymbolFlagsMap::new();
        for part in parts {
            for symbol in part.defined_symbols() {
                reexports.insert(mangler.mangle(&symbol.name), symbol_flags(symbol.linkage, symbol.kind));
            }
            let unit = IrModuleUnit::new(self.base.clone(), part, mangler);
            definitions.push(Definition::new(&impl_ns, tracker, Box::new(unit)));
        }
        if let Some(data) = data {
            let unit = IrModuleUnit::new(self.base.clone(), data, mangler);
            definitions.push(Definition::new(target, tracker, Box::new(unit)));
        }

        let function_count = reexports.len();
        if !reexports.is_empty() {
            let unit = LazyReexportsUnit::new(
                format!("{name}.stubs"),
                reexports,
                vec![(impl_ns.id(), LookupFlags::All)],
                self.stubs.clone(),
                self.fatal.clone(),
            );
            definitions.push(Definition::new(target, tracker, Box::new(unit)));
        }

        session.define_all(definitions)?;
        log::info!(
            "added `{}` to `{}` with {} lazy function(s)",
            name,
            target.name(),
            function_count
        );
        Ok(())
    }

    /// Compile the body behind a lazy function without calling it.
    ///
    /// Follows the same path as the first call through the stub, but
    /// returns a failure instead of aborting.
    pub fn materialize_body(&self, target: &Namespace, name: &str) -> JitResult<JitAddress> {
        let session = target.session();
        let symbol = session.mangle(name);
        session.lookup(&[(target.id(), LookupFlags::All)], &symbol)?;
        let entry = self
            .stubs
            .entry(target.id(), &symbol)
            .ok_or_else(|| JitError::SymbolNotFound {
                name: symbol.to_string(),
            })?;
        entry.resolve()
    }
}
