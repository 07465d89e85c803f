// The object linking layer maps a relocatable object into the process. Executable sections
// are laid out first and data sections start on the next page boundary, so the code prefix
// can be flipped to read/execute while data stays writable. Symbols defined by the object
// resolve to their mapped address directly; every other relocation target is looked up
// through the responsibility's search order, which may materialize the target on the current
// thread. All relocations are applied before anything becomes visible: a single failure
// discards the mapping and fails the whole responsibility, and on success the mapping is
// handed to the memory manager under the responsibility's tracker before the addresses are
// published in one step.

//! Object linking: executable memory, relocation and publication.

use super::compile::ObjectBuffer;
use crate::core::error::{JitError, JitResult};
use crate::core::symbol::{JitAddress, SymbolAddressMap, SymbolFlags, SymbolFlagsMap};
use crate::memory::{align_to_page, JitMemory, MemoryManager};
use crate::orc::{
    ExecutionSession, MaterializationResponsibility, MaterializationUnit, Namespace, ResourceTracker,
};
use hashbrown::HashMap;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget, SectionIndex,
    SectionKind, SymbolIndex, SymbolScope,
};
use std::sync::Arc;

fn align_up(value: usize, align: usize) -> usize {
    let align = align.max(1);
    value.div_ceil(align) * align
}

pub struct ObjectLinkingLayer {
    memory: Arc<MemoryManager>,
}

impl ObjectLinkingLayer {
    /// Create the layer and register its memory with `session`.
    pub fn new(session: &ExecutionSession) -> Arc<Self> {
        let memory = Arc::new(MemoryManager::new());
        session.register_resource_manager(memory.clone());
        Arc::new(Self { memory })
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Link `object` and resolve `r` with its symbols.
    pub fn emit(&self, r: MaterializationResponsibility, object: ObjectBuffer) {
        let (memory, addresses) = match self.link(&r, &object) {
            Ok(linked) => linked,
            Err(e) => {
                r.fail(e);
                return;
            }
        };

        let key = r.tracker();
        let mapped = memory.len();
        let base = self.memory.record(key, memory);
        log::debug!(
            "linked `{}` at {:#x} ({} bytes, {} symbol(s))",
            object.name,
            base,
            mapped,
            addresses.len()
        );

        let session = r.session().clone();
        match r.publish(addresses) {
            Ok(()) => session.counters().record_object_linked(),
            Err(_) => self.memory.discard(key, base),
        }
    }

    fn link(
        &self,
        r: &MaterializationResponsibility,
        object: &ObjectBuffer,
    ) -> JitResult<(JitMemory, SymbolAddressMap)> {
        let name = object.name.as_str();
        let link_err = |reason: String| JitError::link(name, reason);

        let file = object::File::parse(&*object.bytes)
            .map_err(|e| link_err(format!("malformed object: {e}")))?;

        let mut code_sections = Vec::new();
        let mut data_sections = Vec::new();
        for section in file.sections() {
            match section.kind() {
                SectionKind::Text => code_sections.push(section),
                SectionKind::Data
                | SectionKind::ReadOnlyData
                | SectionKind::ReadOnlyString
                | SectionKind::UninitializedData => data_sections.push(section),
                _ => {}
            }
        }

        let mut offsets: HashMap<SectionIndex, usize> = HashMap::new();
        let mut cursor = 0usize;
        for section in &code_sections {
            cursor = align_up(cursor, section.align() as usize);
            offsets.insert(section.index(), cursor);
            cursor += section.size() as usize;
        }
        let code_len = cursor;
        cursor = align_to_page(cursor);
        for section in &data_sections {
            cursor = align_up(cursor, section.align() as usize);
            offsets.insert(section.index(), cursor);
            cursor += section.size() as usize;
        }

        let mut memory = JitMemory::allocate(cursor)?;
        let base = memory.base();
        for section in code_sections.iter().chain(&data_sections) {
            if section.kind() == SectionKind::UninitializedData {
                continue;
            }
            let bytes = section
                .data()
                .map_err(|e| link_err(format!("unreadable section: {e}")))?;
            memory
                .write(offsets[&section.index()], bytes)
                .map_err(|e| link_err(e.to_string()))?;
        }

        let mut local: HashMap<SymbolIndex, u64> = HashMap::new();
        let mut addresses = SymbolAddressMap::new();
        let session = r.session();
        for symbol in file.symbols() {
            let Some(offset) = symbol.section_index().and_then(|idx| offsets.get(&idx)) else {
                continue;
            };
            let addr = base + *offset as u64 + symbol.address();
            local.insert(symbol.index(), addr);
            let symbol_name = symbol.name().unwrap_or_default();
            if symbol.is_global() && !symbol_name.is_empty() {
                addresses.insert(session.intern(symbol_name), JitAddress(addr));
            }
        }

        r.notify_resolved(&addresses);

        let order = r.search_order()?;
        for section in code_sections.iter().chain(&data_sections) {
            let section_offset = offsets[&section.index()];
            for (offset, reloc) in section.relocations() {
                let target = match reloc.target() {
                    RelocationTarget::Symbol(idx) => match local.get(&idx) {
                        Some(addr) => *addr,
                        None => {
                            let symbol = file
                                .symbol_by_index(idx)
                                .map_err(|e| link_err(format!("bad relocation symbol: {e}")))?;
                            let target_name = symbol
                                .name()
                                .map_err(|e| link_err(format!("bad symbol name: {e}")))?;
                            let addr = r.lookup(&order, target_name).map_err(|e| match e {
                                JitError::CircularDependency { .. } | JitError::SessionClosed => e,
                                e => link_err(format!("unresolved reference to `{target_name}`: {e}")),
                            })?;
                            log::trace!("`{}` -> {} for `{}`", target_name, addr, name);
                            addr.0
                        }
                    },
                    RelocationTarget::Section(idx) => offsets
                        .get(&idx)
                        .map(|off| base + *off as u64)
                        .ok_or_else(|| link_err("relocation against an unmapped section".into()))?,
                    other => return Err(link_err(format!("unsupported relocation target {other:?}"))),
                };

                let at = section_offset + offset as usize;
                let value = target.wrapping_add(reloc.addend() as u64);
                match (reloc.kind(), reloc.size()) {
                    (RelocationKind::Absolute, 64) => memory
                        .write(at, &value.to_le_bytes())
                        .map_err(|e| link_err(e.to_string()))?,
                    (RelocationKind::Relative | RelocationKind::PltRelative, 32) => {
                        let place = base + at as u64;
                        let delta = value.wrapping_sub(place) as i64;
                        let delta = i32::try_from(delta)
                            .map_err(|_| link_err(format!("pc-relative displacement {delta:#x} out of range")))?;
                        memory
                            .write(at, &delta.to_le_bytes())
                            .map_err(|e| link_err(e.to_string()))?;
                    }
                    (kind, size) => {
                        return Err(link_err(format!("unsupported relocation {kind:?}/{size}")));
                    }
                }
            }
        }

        if code_len > 0 {
            memory.make_executable(code_len)?;
        }
        Ok((memory, addresses))
    }

    /// Define the global symbols of an already compiled object in `namespace`.
    pub fn add_object(
        self: &Arc<Self>,
        namespace: &Namespace,
        tracker: &ResourceTracker,
        object: ObjectBuffer,
    ) -> JitResult<()> {
        let unit = ObjectUnit::new(self.clone(), namespace.session(), object)?;
        namespace.define_with(tracker, Box::new(unit))
    }
}

/// Materialization unit for a precompiled object.
struct ObjectUnit {
    layer: Arc<ObjectLinkingLayer>,
    object: ObjectBuffer,
    symbols: SymbolFlagsMap,
}

impl ObjectUnit {
    fn new(layer: Arc<ObjectLinkingLayer>, session: &ExecutionSession, object: ObjectBuffer) -> JitResult<Self> {
        let file = object::File::parse(&*object.bytes)
            .map_err(|e| JitError::link(&object.name, format!("malformed object: {e}")))?;
        let mut symbols = SymbolFlagsMap::new();
        for symbol in file.symbols() {
            if !symbol.is_definition() || !symbol.is_global() {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            symbols.insert(
                session.intern(name),
                SymbolFlags {
                    exported: symbol.scope() == SymbolScope::Dynamic,
                    callable: symbol.kind() == object::SymbolKind::Text,
                },
            );
        }
        Ok(Self {
            layer,
            object,
            symbols,
        })
    }
}

impl MaterializationUnit for ObjectUnit {
    fn name(&self) -> &str {
        &self.object.name
    }

    fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    fn materialize(self: Box<Self>, r: MaterializationResponsibility) {
        self.layer.emit(r, self.object);
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::core::target::TargetDescriptor;
    use crate::ir::Module;
    use crate::layers::compile::CodeGenerator;
    use crate::orc::SymbolStatus;
    use crate::x64::X64CodeGenerator;

    fn compile(text: &str) -> ObjectBuffer {
        let module = Module::parse("test", text).unwrap();
        X64CodeGenerator::new()
            .compile(&module, &TargetDescriptor::host())
            .unwrap()
    }

    #[test]
    fn test_linked_object_is_callable() {
        let es = ExecutionSession::with_threads(TargetDescriptor::host(), 0);
        let ns = es.create_namespace("main").unwrap();
        let layer = ObjectLinkingLayer::new(&es);
        let object = compile("define mul(%a, %b) {\nentry:\n  %r = mul %a, %b\n  ret %r\n}\n");
        layer
            .add_object(&ns, &ns.default_tracker().unwrap(), object)
            .unwrap();

        let addr = ns.lookup("mul").unwrap();
        let mul: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(addr.0 as usize) };
        assert_eq!(mul(6, 7), 42);
        assert_eq!(es.stats().objects_linked, 1);
        assert!(layer.memory().total_bytes() > 0);
    }

    #[test]
    fn test_unresolved_reference_fails_link() {
        let es = ExecutionSession::with_threads(TargetDescriptor::host(), 0);
        let ns = es.create_namespace("main").unwrap();
        let layer = ObjectLinkingLayer::new(&es);
        let object = compile(
            "extern nowhere_to_be_found\ndefine f() {\nentry:\n  %r = call @nowhere_to_be_found()\n  ret %r\n}\n",
        );
        layer
            .add_object(&ns, &ns.default_tracker().unwrap(), object)
            .unwrap();

        let err = ns.lookup("f").unwrap_err();
        assert!(matches!(err, JitError::Link { .. }), "{err}");
        assert!(matches!(ns.status("f"), Some(SymbolStatus::Failed(_))));
        assert_eq!(layer.memory().total_bytes(), 0);
    }

    #[test]
    fn test_relocation_past_section_end_is_link_error() {
        use object::write::{Object, Relocation, Symbol, SymbolSection};
        use object::{Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags};

        let es = ExecutionSession::with_threads(TargetDescriptor::host(), 0);
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xC3; 4096], 16);
        let edge = obj.add_symbol(Symbol {
            name: es.mangle("edge").as_bytes().to_vec(),
            value: 0,
            size: 4096,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            Relocation {
                offset: 4092,
                symbol: edge,
                addend: 0,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::Absolute,
                    encoding: RelocationEncoding::Generic,
                    size: 64,
                },
            },
        )
        .unwrap();
        let object = ObjectBuffer {
            name: "edge".to_string(),
            bytes: obj.write().unwrap(),
            function_count: 1,
            code_size: 4096,
        };

        let ns = es.create_namespace("main").unwrap();
        let layer = ObjectLinkingLayer::new(&es);
        layer
            .add_object(&ns, &ns.default_tracker().unwrap(), object)
            .unwrap();

        match ns.lookup("edge") {
            Err(JitError::Link { module, .. }) => assert_eq!(module, "edge"),
            other => panic!("expected a link error, got {other:?}"),
        }
        assert_eq!(layer.memory().total_bytes(), 0);
    }
}
