// x86-64 System V code generator. Every IR value lives in its own 8-byte stack slot below
// the frame pointer, so instruction selection is a direct load-operate-store sequence on
// RAX/RCX/RDX and needs no register allocator. Parameters arrive in RDI, RSI, RDX, RCX, R8
// and R9 and are spilled to their slots in the prologue; calls load arguments into the same
// registers and go through RAX. Phi nodes are resolved on control-flow edges: the incoming
// values of every phi in the successor are pushed, then popped into the phi slots in reverse,
// which makes the copies behave as one parallel assignment.
//
// Every reference to a symbol (callee, global, address-of) is a MOV r64, imm64 carrying an
// absolute 64-bit relocation against that symbol, so the object can be mapped anywhere and
// calls between separately linked modules need no PLT. The finished functions and globals
// are written into a relocatable ELF object with the object crate; the linking layer reads
// the same object back.

//! x86-64 backend producing relocatable ELF objects.

use super::encoder::{AsmReg, EncodingError, JumpCondition, X64Encoder};
use crate::core::error::{JitError, JitResult};
use crate::core::symbol::MangleAndInterner;
use crate::core::target::TargetDescriptor;
use crate::ir::{BinaryOp, BlockId, Function, InstKind, IntPredicate, Linkage, Module, Operand, ValueId};
use crate::layers::compile::{CodeGenerator, ObjectBuffer};
use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::HashMap;
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags as ObjectSymbolFlags, SymbolKind, SymbolScope,
};

/// Integer argument registers of the System V AMD64 ABI.
pub const ARG_REGS: [AsmReg; 6] = [
    AsmReg::RDI,
    AsmReg::RSI,
    AsmReg::RDX,
    AsmReg::RCX,
    AsmReg::R8,
    AsmReg::R9,
];

/// Offset of the imm64 inside a REX.W MOV r64, imm64.
const IMM64_OFFSET: usize = 2;

/// Machine code for one function plus the symbols it references.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: String,
    pub linkage: Linkage,
    pub code: Vec<u8>,
    /// (offset into `code`, referenced IR name), one absolute 64-bit patch each.
    pub relocations: Vec<(usize, String)>,
}

fn slot_offset(value: ValueId) -> i32 {
    -8 * (value.0 as i32 + 1)
}

fn frame_size(function: &Function) -> u32 {
    let bytes = 8 * function.value_count() as u32;
    (bytes + 15) & !15
}

fn condition(pred: IntPredicate) -> JumpCondition {
    match pred {
        IntPredicate::Eq => JumpCondition::Equal,
        IntPredicate::Ne => JumpCondition::NotEqual,
        IntPredicate::Slt => JumpCondition::Less,
        IntPredicate::Sle => JumpCondition::LessEqual,
        IntPredicate::Sgt => JumpCondition::Greater,
        IntPredicate::Sge => JumpCondition::GreaterEqual,
    }
}

/// Per-function code generation state.
struct FunctionCodegen<'a> {
    module: &'a Module,
    function: &'a Function,
    encoder: X64Encoder,
    frame_size: u32,
    /// (instruction index, symbol) pairs awaiting final offsets.
    symbol_refs: BumpVec<'a, (usize, &'a str)>,
}

impl<'a> FunctionCodegen<'a> {
    fn new(arena: &'a Bump, module: &'a Module, function: &'a Function) -> Result<Self, EncodingError> {
        Ok(Self {
            module,
            function,
            encoder: X64Encoder::new()?,
            frame_size: frame_size(function),
            symbol_refs: BumpVec::new_in(arena),
        })
    }

    fn load_operand(&mut self, dst: AsmReg, op: Operand) -> Result<(), EncodingError> {
        match op {
            Operand::Value(v) => self.encoder.mov_reg_mem(dst, AsmReg::RBP, slot_offset(v)),
            Operand::Const(c) => self.encoder.mov_reg_imm(dst, self.module.constant(c)),
        }
    }

    fn store_result(&mut self, result: Option<ValueId>, src: AsmReg) -> Result<(), EncodingError> {
        match result {
            Some(v) => self.encoder.mov_mem_reg(AsmReg::RBP, slot_offset(v), src),
            None => Ok(()),
        }
    }

    /// MOVABS `dst`, &symbol with a pending relocation.
    fn load_symbol_address(&mut self, dst: AsmReg, symbol: &'a str) -> Result<(), EncodingError> {
        let index = self.encoder.mov_reg_imm64(dst, 0)?;
        self.symbol_refs.push((index, symbol));
        Ok(())
    }

    /// Parallel copy of the phi inputs `from` feeds into `to`.
    fn emit_edge_copies(&mut self, from: BlockId, to: BlockId) -> Result<(), EncodingError> {
        let function = self.function;
        let mut copies: Vec<(ValueId, Operand)> = Vec::new();
        for phi in function.block(to).phis() {
            let InstKind::Phi { incoming } = &phi.kind else {
                continue;
            };
            let Some(dst) = phi.result else {
                continue;
            };
            if let Some((op, _)) = incoming.iter().find(|(_, pred)| *pred == from) {
                copies.push((dst, *op));
            }
        }

        for (_, src) in &copies {
            self.load_operand(AsmReg::RAX, *src)?;
            self.encoder.push_reg(AsmReg::RAX)?;
        }
        for (dst, _) in copies.iter().rev() {
            self.encoder.pop_reg(AsmReg::RAX)?;
            self.encoder.mov_mem_reg(AsmReg::RBP, slot_offset(*dst), AsmReg::RAX)?;
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand) -> Result<(), EncodingError> {
        self.load_operand(AsmReg::RAX, lhs)?;
        self.load_operand(AsmReg::RCX, rhs)?;
        match op {
            BinaryOp::Add => self.encoder.add_reg_reg(AsmReg::RAX, AsmReg::RCX),
            BinaryOp::Sub => self.encoder.sub_reg_reg(AsmReg::RAX, AsmReg::RCX),
            BinaryOp::Mul => self.encoder.imul_reg_reg(AsmReg::RAX, AsmReg::RCX),
            BinaryOp::And => self.encoder.and_reg_reg(AsmReg::RAX, AsmReg::RCX),
            BinaryOp::Or => self.encoder.or_reg_reg(AsmReg::RAX, AsmReg::RCX),
            BinaryOp::Xor => self.encoder.xor_reg_reg(AsmReg::RAX, AsmReg::RCX),
            BinaryOp::Shl => self.encoder.shl_reg_cl(AsmReg::RAX),
            BinaryOp::AShr => self.encoder.sar_reg_cl(AsmReg::RAX),
            BinaryOp::SDiv => {
                self.encoder.cqo()?;
                self.encoder.idiv_reg(AsmReg::RCX)
            }
            BinaryOp::SRem => {
                self.encoder.cqo()?;
                self.encoder.idiv_reg(AsmReg::RCX)?;
                self.encoder.mov_reg_reg(AsmReg::RAX, AsmReg::RDX)
            }
        }
    }

    fn compile_block(&mut self, id: BlockId) -> Result<(), EncodingError> {
        let function = self.function;
        self.encoder.place_label_for_block(id.0 as usize)?;

        for inst in &function.block(id).insts {
            log::trace!("  {:?}", inst.kind);
            match &inst.kind {
                InstKind::Binary { op, lhs, rhs } => {
                    self.compile_binary(*op, *lhs, *rhs)?;
                    self.store_result(inst.result, AsmReg::RAX)?;
                }
                InstKind::Icmp { pred, lhs, rhs } => {
                    self.load_operand(AsmReg::RAX, *lhs)?;
                    self.load_operand(AsmReg::RCX, *rhs)?;
                    self.encoder.cmp_reg_reg(AsmReg::RAX, AsmReg::RCX)?;
                    self.encoder.setcc_reg(condition(*pred), AsmReg::RAX)?;
                    self.encoder.movzx_reg8_to_reg64(AsmReg::RAX, AsmReg::RAX)?;
                    self.store_result(inst.result, AsmReg::RAX)?;
                }
                InstKind::Copy(src) => {
                    self.load_operand(AsmReg::RAX, *src)?;
                    self.store_result(inst.result, AsmReg::RAX)?;
                }
                InstKind::Call { callee, args } => {
                    for (reg, arg) in ARG_REGS.iter().zip(args) {
                        self.load_operand(*reg, *arg)?;
                    }
                    self.load_symbol_address(AsmReg::RAX, callee)?;
                    self.encoder.call_reg(AsmReg::RAX)?;
                    self.store_result(inst.result, AsmReg::RAX)?;
                }
                InstKind::Load { global } => {
                    self.load_symbol_address(AsmReg::RAX, global)?;
                    self.encoder.mov_reg_mem(AsmReg::RAX, AsmReg::RAX, 0)?;
                    self.store_result(inst.result, AsmReg::RAX)?;
                }
                InstKind::Store { global, value } => {
                    self.load_symbol_address(AsmReg::RAX, global)?;
                    self.load_operand(AsmReg::RCX, *value)?;
                    self.encoder.mov_mem_reg(AsmReg::RAX, 0, AsmReg::RCX)?;
                }
                InstKind::AddrOf { symbol } => {
                    self.load_symbol_address(AsmReg::RAX, symbol)?;
                    self.store_result(inst.result, AsmReg::RAX)?;
                }
                // Resolved on the incoming edges.
                InstKind::Phi { .. } => {}
                InstKind::Ret(value) => {
                    match value {
                        Some(v) => self.load_operand(AsmReg::RAX, *v)?,
                        None => self.encoder.xor_reg_reg(AsmReg::RAX, AsmReg::RAX)?,
                    }
                    self.encoder.emit_epilogue(self.frame_size)?;
                }
                InstKind::Br(target) => {
                    self.emit_edge_copies(id, *target)?;
                    self.encoder.jmp_to_block(target.0 as usize)?;
                }
                InstKind::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    self.load_operand(AsmReg::RAX, *cond)?;
                    self.encoder.test_reg_reg(AsmReg::RAX, AsmReg::RAX)?;
                    let mut else_edge = self.encoder.create_label();
                    self.encoder.jcc(JumpCondition::Equal, else_edge)?;
                    self.emit_edge_copies(id, *then_block)?;
                    self.encoder.jmp_to_block(then_block.0 as usize)?;
                    self.encoder.place_label(&mut else_edge)?;
                    self.emit_edge_copies(id, *else_block)?;
                    self.encoder.jmp_to_block(else_block.0 as usize)?;
                }
            }
        }
        Ok(())
    }

    fn compile(mut self) -> Result<CompiledFunction, EncodingError> {
        let function = self.function;
        self.encoder.emit_prologue(self.frame_size)?;
        for (param, reg) in function.params.iter().zip(ARG_REGS.iter()) {
            self.encoder.mov_mem_reg(AsmReg::RBP, slot_offset(*param), *reg)?;
        }
        for index in 0..function.blocks.len() {
            self.compile_block(BlockId(index as u32))?;
        }

        let FunctionCodegen {
            encoder, symbol_refs, ..
        } = self;
        let encoded = encoder.finalize()?;
        let mut relocations = Vec::with_capacity(symbol_refs.len());
        for (index, symbol) in symbol_refs.iter() {
            let offset = encoded.offset_of(*index).ok_or_else(|| {
                EncodingError::AssemblyError(format!("no offset recorded for instruction {index}"))
            })?;
            relocations.push((offset + IMM64_OFFSET, symbol.to_string()));
        }

        Ok(CompiledFunction {
            name: function.name.clone(),
            linkage: function.linkage,
            code: encoded.code,
            relocations,
        })
    }
}

/// Generate machine code for one function.
pub fn compile_function(module: &Module, function: &Function) -> JitResult<CompiledFunction> {
    let arena = Bump::new();
    FunctionCodegen::new(&arena, module, function)
        .and_then(FunctionCodegen::compile)
        .map_err(|e| JitError::compile(module.name(), format!("function `{}`: {}", function.name, e)))
}

fn scope(linkage: Linkage) -> SymbolScope {
    match linkage {
        Linkage::Exported => SymbolScope::Dynamic,
        Linkage::Hidden => SymbolScope::Linkage,
    }
}

/// Code generator for the System V x86-64 ABI.
#[derive(Debug, Clone, Default)]
pub struct X64CodeGenerator;

impl X64CodeGenerator {
    pub fn new() -> Self {
        Self
    }

    fn write_object(
        module: &Module,
        functions: &[CompiledFunction],
        mangler: &MangleAndInterner,
    ) -> Result<Vec<u8>, object::write::Error> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        let mut symbols: HashMap<String, SymbolId> = HashMap::new();
        let mut text_offsets = Vec::with_capacity(functions.len());

        for function in functions {
            let offset = obj.append_section_data(text, &function.code, 16);
            text_offsets.push(offset);
            let id = obj.add_symbol(Symbol {
                name: mangler.mangle(&function.name).as_bytes().to_vec(),
                value: offset,
                size: function.code.len() as u64,
                kind: SymbolKind::Text,
                scope: scope(function.linkage),
                weak: false,
                section: SymbolSection::Section(text),
                flags: ObjectSymbolFlags::None,
            });
            symbols.insert(function.name.clone(), id);
        }

        if !module.globals().is_empty() {
            let data = obj.section_id(StandardSection::Data);
            for global in module.globals() {
                let offset = obj.append_section_data(data, &global.init.to_le_bytes(), 8);
                let id = obj.add_symbol(Symbol {
                    name: mangler.mangle(&global.name).as_bytes().to_vec(),
                    value: offset,
                    size: 8,
                    kind: SymbolKind::Data,
                    scope: scope(global.linkage),
                    weak: false,
                    section: SymbolSection::Section(data),
                    flags: ObjectSymbolFlags::None,
                });
                symbols.insert(global.name.clone(), id);
            }
        }

        for (function, base) in functions.iter().zip(text_offsets) {
            for (offset, target) in &function.relocations {
                let symbol = match symbols.get(target) {
                    Some(id) => *id,
                    None => {
                        let id = obj.add_symbol(Symbol {
                            name: mangler.mangle(target).as_bytes().to_vec(),
                            value: 0,
                            size: 0,
                            kind: SymbolKind::Unknown,
                            scope: SymbolScope::Dynamic,
                            weak: false,
                            section: SymbolSection::Undefined,
                            flags: ObjectSymbolFlags::None,
                        });
                        symbols.insert(target.clone(), id);
                        id
                    }
                };
                obj.add_relocation(
                    text,
                    Relocation {
                        offset: base + *offset as u64,
                        symbol,
                        addend: 0,
                        flags: RelocationFlags::Generic {
                            kind: RelocationKind::Absolute,
                            encoding: RelocationEncoding::Generic,
                            size: 64,
                        },
                    },
                )?;
            }
        }

        obj.write()
    }
}

impl CodeGenerator for X64CodeGenerator {
    fn compile(&self, module: &Module, target: &TargetDescriptor) -> JitResult<ObjectBuffer> {
        if !target.is_sysv_x86_64() {
            return Err(JitError::compile(
                module.name(),
                format!("no code generator for target {target}"),
            ));
        }

        let functions = module
            .functions()
            .iter()
            .map(|function| {
                log::trace!("compiling `{}`", function.name);
                compile_function(module, function)
            })
            .collect::<JitResult<Vec<_>>>()?;
        let code_size = functions.iter().map(|f| f.code.len()).sum();

        let mangler = MangleAndInterner::new(Default::default(), target.global_prefix);
        let bytes = Self::write_object(module, &functions, &mangler)
            .map_err(|e| JitError::compile(module.name(), format!("object emission failed: {e}")))?;

        Ok(ObjectBuffer {
            name: module.name().to_string(),
            bytes,
            function_count: functions.len(),
            code_size,
        })
    }

    fn name(&self) -> &str {
        "x86-64 SysV"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::{Architecture as TargetArch, OperatingSystem};
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn linux_x64() -> TargetDescriptor {
        TargetDescriptor {
            arch: TargetArch::X86_64,
            os: OperatingSystem::Linux,
            pointer_width: 64,
            global_prefix: None,
        }
    }

    #[test]
    fn test_simple_function_code() {
        let module = Module::parse(
            "m",
            "define add(%a, %b) {\nentry:\n  %r = add %a, %b\n  ret %r\n}\n",
        )
        .unwrap();
        let compiled = compile_function(&module, &module.functions()[0]).unwrap();

        // push rbp; mov rbp, rsp
        assert_eq!(&compiled.code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(*compiled.code.last().unwrap(), 0xC3);
        assert!(compiled.relocations.is_empty());
    }

    #[test]
    fn test_call_gets_absolute_relocation() {
        let module = Module::parse(
            "m",
            "extern helper\ndefine f(%x) {\nentry:\n  %r = call @helper(%x)\n  ret %r\n}\n",
        )
        .unwrap();
        let compiled = compile_function(&module, &module.functions()[0]).unwrap();

        assert_eq!(compiled.relocations.len(), 1);
        let (offset, name) = &compiled.relocations[0];
        assert_eq!(name, "helper");
        // REX.W B8 precedes the patched immediate.
        assert_eq!(&compiled.code[offset - 2..*offset], &[0x48, 0xB8]);
    }

    #[test]
    fn test_object_symbols_and_relocations() {
        let module = Module::parse(
            "m",
            "global counter = 5\nextern helper\n\
             define bump() {\nentry:\n  %v = load @counter\n  %n = add %v, 1\n  store @counter, %n\n  %r = call @helper(%n)\n  ret %r\n}\n",
        )
        .unwrap();
        let buffer = X64CodeGenerator::new().compile(&module, &linux_x64()).unwrap();
        assert_eq!(buffer.function_count, 1);

        let file = object::File::parse(&*buffer.bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.relocations().count(), 3);
        assert_eq!(text.size() as usize, buffer.code_size);

        let bump = file.symbol_by_name("bump").unwrap();
        assert!(bump.is_definition());
        assert!(file.symbol_by_name("helper").unwrap().is_undefined());

        let data = file.section_by_name(".data").unwrap();
        assert_eq!(data.data().unwrap(), &5i64.to_le_bytes());
    }

    #[test]
    fn test_foreign_target_rejected() {
        let module = Module::parse("m", "define f() {\nentry:\n  ret 0\n}\n").unwrap();
        let target = TargetDescriptor {
            arch: TargetArch::Aarch64,
            ..linux_x64()
        };
        let err = X64CodeGenerator::new().compile(&module, &target).unwrap_err();
        assert!(matches!(err, JitError::Compile { .. }));
    }
}
