//! Compile layer: IR module to relocatable object.
//!
//! The [`CodeGenerator`] is the only pipeline stage that runs concurrently
//! across modules; it must be reentrant for distinct modules. Symbol
//! publication is left to the linking layer.

use super::linking::ObjectLinkingLayer;
use super::IrLayer;
use crate::core::error::JitResult;
use crate::core::target::TargetDescriptor;
use crate::ir::Module;
use crate::orc::MaterializationResponsibility;
use std::sync::Arc;

/// A relocatable object produced by a code generator.
#[derive(Debug, Clone)]
pub struct ObjectBuffer {
    /// Name of the module the object was compiled from.
    pub name: String,
    pub bytes: Vec<u8>,
    pub function_count: usize,
    /// Bytes of machine code in the object.
    pub code_size: usize,
}

/// Backend contract: compile one module for one target.
pub trait CodeGenerator: Send + Sync {
    fn compile(&self, module: &Module, target: &TargetDescriptor) -> JitResult<ObjectBuffer>;

    fn name(&self) -> &str {
        "codegen"
    }
}

pub struct IrCompileLayer {
    generator: Arc<dyn CodeGenerator>,
    next: Arc<ObjectLinkingLayer>,
}

impl IrCompileLayer {
    pub fn new(generator: Arc<dyn CodeGenerator>, next: Arc<ObjectLinkingLayer>) -> Self {
        Self { generator, next }
    }

    pub fn linking_layer(&self) -> &Arc<ObjectLinkingLayer> {
        &self.next
    }
}

impl IrLayer for IrCompileLayer {
    fn emit(&self, r: MaterializationResponsibility, module: Module) {
        let target = r.session().target().clone();
        let object = match self.generator.compile(&module, &target) {
            Ok(object) => object,
            Err(e) => {
                r.fail(e);
                return;
            }
        };
        drop(module);

        log::debug!(
            "{} compiled `{}`: {} function(s), {} code bytes",
            self.generator.name(),
            object.name,
            object.function_count,
            object.code_size
        );
        r.session()
            .counters()
            .record_module_compiled(object.function_count, object.code_size);
        self.next.emit(r, object);
    }
}
