// LazyJit is the top-level facade. It owns one execution session, a main namespace with the
// host process's symbols available through a generator, and the layer chain: transform
// (the optimizer) on top of compile (the code generator) on top of object linking. In lazy
// mode a compile-on-demand layer splits admitted modules so each function body is compiled
// on its first call; in eager mode modules go straight to the transform layer and are
// compiled as a whole when one of their symbols is first looked up. JitBuilder collects the
// configuration: worker threads, eager or lazy, optimizer, code generator, target, process
// symbol resolution and the handler run before a failed lazy call aborts.

//! Top-level JIT facade and its builder.

use crate::core::error::{JitError, JitResult};
use crate::core::stats::JitStats;
use crate::core::symbol::{JitAddress, SymbolFlags};
use crate::core::target::TargetDescriptor;
use crate::ir::Module;
use crate::layers::lazy::report_lazy_failure;
use crate::layers::{
    add_ir_module, CodeGenerator, CompileOnDemandLayer, FatalHandler, IrCompileLayer, IrLayer,
    IrTransformLayer, ModuleTransform, ObjectLinkingLayer, PassPipeline,
};
use crate::orc::{
    AbsoluteSymbolsUnit, ExecutionSession, LookupFlags, Namespace, ProcessSymbolsGenerator,
    ResourceTracker,
};
use crate::x64::X64CodeGenerator;
use std::sync::Arc;

/// Name of the namespace modules are added to by default.
pub const MAIN_NAMESPACE: &str = "<main>";

/// Configuration for a [`LazyJit`].
pub struct JitBuilder {
    num_threads: usize,
    lazy: bool,
    optimizer: Arc<dyn ModuleTransform>,
    generator: Arc<dyn CodeGenerator>,
    target: TargetDescriptor,
    process_symbols: bool,
    fatal_handler: FatalHandler,
}

impl Default for JitBuilder {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            lazy: true,
            optimizer: Arc::new(PassPipeline::default()),
            generator: Arc::new(X64CodeGenerator::new()),
            target: TargetDescriptor::host(),
            process_symbols: true,
            fatal_handler: report_lazy_failure(),
        }
    }
}

impl JitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile worker threads; zero compiles on the looking-up thread.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Compile each function on first call (default) or whole modules on first lookup.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn optimizer(mut self, optimizer: Arc<dyn ModuleTransform>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn code_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn target(mut self, target: TargetDescriptor) -> Self {
        self.target = target;
        self
    }

    /// Resolve unknown names against the symbols of the host process.
    pub fn process_symbols(mut self, enabled: bool) -> Self {
        self.process_symbols = enabled;
        self
    }

    pub fn fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    pub fn build(self) -> JitResult<LazyJit> {
        let global_prefix = self.target.global_prefix;
        log::info!(
            "starting {} JIT for {} with {} compile thread(s)",
            if self.lazy { "lazy" } else { "eager" },
            self.target,
            self.num_threads
        );
        let session = ExecutionSession::with_threads(self.target, self.num_threads);
        let main = session.create_namespace(MAIN_NAMESPACE)?;
        if self.process_symbols {
            main.add_generator(Arc::new(ProcessSymbolsGenerator::new(global_prefix)))?;
        }

        let linking = ObjectLinkingLayer::new(&session);
        let compile: Arc<dyn IrLayer> = Arc::new(IrCompileLayer::new(self.generator, linking.clone()));
        let transform: Arc<dyn IrLayer> = Arc::new(IrTransformLayer::new(self.optimizer, compile));
        let lazy = self.lazy.then(|| {
            CompileOnDemandLayer::new(&session, transform.clone()).with_fatal_handler(self.fatal_handler)
        });

        Ok(LazyJit {
            session,
            main,
            linking,
            transform,
            lazy,
        })
    }
}

/// An in-process JIT with a main namespace and a layered pipeline.
pub struct LazyJit {
    session: ExecutionSession,
    main: Namespace,
    linking: Arc<ObjectLinkingLayer>,
    transform: Arc<dyn IrLayer>,
    lazy: Option<CompileOnDemandLayer>,
}

impl LazyJit {
    pub fn builder() -> JitBuilder {
        JitBuilder::new()
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    pub fn main_namespace(&self) -> &Namespace {
        &self.main
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy.is_some()
    }

    pub fn linking_layer(&self) -> &Arc<ObjectLinkingLayer> {
        &self.linking
    }

    pub fn lazy_layer(&self) -> Option<&CompileOnDemandLayer> {
        self.lazy.as_ref()
    }

    /// A new namespace that resolves its references through the main one.
    pub fn create_namespace(&self, name: &str) -> JitResult<Namespace> {
        let ns = self.session.create_namespace(name)?;
        ns.set_link_order(&[(&self.main, LookupFlags::ExportedOnly)])?;
        Ok(ns)
    }

    pub fn create_tracker(&self) -> JitResult<ResourceTracker> {
        self.main.create_tracker()
    }

    pub fn remove_tracker(&self, tracker: &ResourceTracker) -> JitResult<()> {
        tracker.remove()
    }

    /// Add `module` to the main namespace under its default tracker.
    pub fn add_module(&self, module: Module) -> JitResult<()> {
        let tracker = self.main.default_tracker()?;
        self.add_module_to(&self.main, &tracker, module)
    }

    pub fn add_module_with(&self, tracker: &ResourceTracker, module: Module) -> JitResult<()> {
        self.add_module_to(&self.main, tracker, module)
    }

    pub fn add_module_to(&self, namespace: &Namespace, tracker: &ResourceTracker, module: Module) -> JitResult<()> {
        if tracker.namespace_id() != namespace.id() {
            return Err(JitError::InvalidModule {
                module: module.name().to_string(),
                reason: format!("tracker does not belong to namespace `{}`", namespace.name()),
            });
        }
        match &self.lazy {
            Some(cod) => cod.add_module(namespace, tracker, module),
            None => add_ir_module(self.transform.clone(), namespace, tracker, module),
        }
    }

    /// Address of an exported symbol of the main namespace.
    pub fn lookup(&self, name: &str) -> JitResult<JitAddress> {
        self.main.lookup(name)
    }

    pub fn lookup_in(&self, namespace: &Namespace, name: &str) -> JitResult<JitAddress> {
        namespace.lookup(name)
    }

    /// Make a host function or object visible to JIT'd code under `name`.
    pub fn define_absolute(&self, name: &str, address: JitAddress) -> JitResult<()> {
        let symbol = self.session.mangle(name);
        self.main.define(Box::new(AbsoluteSymbolsUnit::new([(
            symbol,
            SymbolFlags::EXPORTED_FUNCTION,
            address,
        )])))
    }

    /// Compile a lazy function's body now. In eager mode this is a lookup.
    pub fn compile_now(&self, name: &str) -> JitResult<JitAddress> {
        match &self.lazy {
            Some(cod) => cod.materialize_body(&self.main, name),
            None => self.lookup(name),
        }
    }

    pub fn stats(&self) -> JitStats {
        self.session.stats()
    }

    pub fn shutdown(&self) -> JitResult<()> {
        self.session.shutdown()
    }
}

impl Drop for LazyJit {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            if let Err(e) = self.session.shutdown() {
                log::warn!("shutdown on drop failed: {}", e);
            }
        }
    }
}
