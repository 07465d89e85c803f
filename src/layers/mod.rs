// The layer chain turns an admitted IR module into published addresses. Each IR layer
// receives a module together with the materialization responsibility for its symbols and
// either forwards a transformed module to the next layer or fails the responsibility. The
// transform layer applies the swappable optimizer, the compile layer invokes the code
// generator, and the object linking layer maps the object into memory and publishes. The
// compile-on-demand layer sits on top and splits a module so that each function body is
// only pushed down the chain when its indirection stub is first called.
//
// IrModuleUnit is the materialization unit that binds a module to a layer: defining it in a
// namespace declares the module's symbols, and materializing it calls the layer's emit.

//! Layered module pipeline: transform, compile, link and compile-on-demand.

pub mod compile;
pub mod lazy;
pub mod linking;
pub mod transform;

use crate::core::error::JitResult;
use crate::core::symbol::{MangleAndInterner, SymbolFlags, SymbolFlagsMap};
use crate::ir::{Linkage, Module, SymbolKind};
use crate::orc::{MaterializationResponsibility, MaterializationUnit, Namespace, ResourceTracker};
use std::sync::Arc;

pub use compile::{CodeGenerator, IrCompileLayer, ObjectBuffer};
pub use lazy::{CompileOnDemandLayer, FatalHandler, LazyReexportsUnit};
pub use linking::ObjectLinkingLayer;
pub use transform::{IdentityTransform, IrTransformLayer, ModuleTransform, PassPipeline};

/// A pipeline stage that consumes IR modules.
pub trait IrLayer: Send + Sync {
    /// Take `module` the rest of the way and resolve `r`.
    fn emit(&self, r: MaterializationResponsibility, module: Module);
}

/// Flags for a symbol defined by an IR module.
pub fn symbol_flags(linkage: Linkage, kind: SymbolKind) -> SymbolFlags {
    SymbolFlags {
        exported: linkage == Linkage::Exported,
        callable: kind == SymbolKind::Function,
    }
}

/// Materialization unit wrapping one IR module bound for a layer.
pub struct IrModuleUnit {
    name: String,
    module: Module,
    symbols: SymbolFlagsMap,
    layer: Arc<dyn IrLayer>,
}

impl IrModuleUnit {
    pub fn new(layer: Arc<dyn IrLayer>, module: Module, mangler: &MangleAndInterner) -> Self {
        let symbols = module
            .defined_symbols()
            .into_iter()
            .map(|s| (mangler.mangle(&s.name), symbol_flags(s.linkage, s.kind)))
            .collect();
        Self {
            name: module.name().to_string(),
            module,
            symbols,
            layer,
        }
    }
}

impl MaterializationUnit for IrModuleUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    fn materialize(self: Box<Self>, r: MaterializationResponsibility) {
        let IrModuleUnit { module, layer, .. } = *self;
        layer.emit(r, module);
    }
}

/// Verify `module` and define it in `namespace` under `tracker`, bound for `layer`.
pub fn add_ir_module(
    layer: Arc<dyn IrLayer>,
    namespace: &Namespace,
    tracker: &ResourceTracker,
    module: Module,
) -> JitResult<()> {
    module.verify()?;
    log::info!(
        "adding module `{}` to `{}` ({} symbol(s))",
        module.name(),
        namespace.name(),
        module.defined_symbols().len()
    );
    let unit = IrModuleUnit::new(layer, module, namespace.session().mangler());
    namespace.define_with(tracker, Box::new(unit))
}
