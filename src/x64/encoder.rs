// This module wraps the iced-x86 CodeAssembler with the small instruction vocabulary the JIT
// needs: 64-bit moves between registers, immediates and stack slots, integer arithmetic and
// shifts, signed division, comparisons with SETcc materialization, push/pop, direct and
// indirect calls and jumps, and block labels for control flow. Registers are named with the
// AsmReg wrapper (bank + id) and translated to iced registers at emission time. Instructions
// that later receive a relocated absolute address are always encoded as MOV r64, imm64 so the
// patch site has a fixed 8-byte immediate two bytes into the instruction; the encoder
// remembers their instruction indices and finalize() reports their byte offsets after iced's
// block encoder has chosen final branch sizes.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::{registers::cl, *};
use iced_x86::{BlockEncoderOptions, Code, Instruction, Register};
use std::collections::{HashMap, HashSet};

pub type RegBank = u8;
pub type RegId = u8;

/// A machine register: bank 0 holds the general purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const RAX: AsmReg = AsmReg::new(0, 0);
    pub const RCX: AsmReg = AsmReg::new(0, 1);
    pub const RDX: AsmReg = AsmReg::new(0, 2);
    pub const RBX: AsmReg = AsmReg::new(0, 3);
    pub const RSP: AsmReg = AsmReg::new(0, 4);
    pub const RBP: AsmReg = AsmReg::new(0, 5);
    pub const RSI: AsmReg = AsmReg::new(0, 6);
    pub const RDI: AsmReg = AsmReg::new(0, 7);
    pub const R8: AsmReg = AsmReg::new(0, 8);
    pub const R9: AsmReg = AsmReg::new(0, 9);
    pub const R10: AsmReg = AsmReg::new(0, 10);
    pub const R11: AsmReg = AsmReg::new(0, 11);
}

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// A block label was referenced but never placed.
    UnplacedLabel(usize),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::UnplacedLabel(block) => write!(f, "Block {block} was never placed"),
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: iced_x86::IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Jump conditions for conditional branches and SETcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

/// Machine code plus the byte offsets of marked instructions.
#[derive(Debug, Clone)]
pub struct EncodedCode {
    pub code: Vec<u8>,
    /// Offset of every instruction, indexed by emission order.
    pub instruction_offsets: Vec<u32>,
}

impl EncodedCode {
    pub fn offset_of(&self, instruction_index: usize) -> Option<usize> {
        self.instruction_offsets
            .get(instruction_index)
            .filter(|&&off| off != u32::MAX)
            .map(|&off| off as usize)
    }
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    /// Labels for basic blocks.
    block_labels: HashMap<usize, CodeLabel>,
    placed_blocks: HashSet<usize>,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;

        Ok(Self {
            assembler,
            block_labels: HashMap::new(),
            placed_blocks: HashSet::new(),
        })
    }

    /// Convert AsmReg to iced-x86 64-bit GP register.
    fn to_gp64_register(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];

        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 8-bit GP register.
    fn to_gp8_register(&self, reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP8_REGS: [AsmRegister8; 16] = [
            al, cl, dl, bl, spl, bpl, sil, dil,
            r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
        ];

        GP8_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn to_register(&self, reg: AsmReg) -> Result<Register, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64: [Register; 16] = [
            Register::RAX, Register::RCX, Register::RDX, Register::RBX,
            Register::RSP, Register::RBP, Register::RSI, Register::RDI,
            Register::R8, Register::R9, Register::R10, Register::R11,
            Register::R12, Register::R13, Register::R14, Register::R15,
        ];

        GP64.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Index the next emitted instruction will have.
    pub fn next_instruction_index(&self) -> usize {
        self.assembler.instructions().len()
    }

    /// Emit MOV instruction - register to register.
    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;

        self.assembler.mov(dst_reg, src_reg).map_err(asm_err)
    }

    /// Emit MOV instruction - immediate to register, shortest encoding.
    pub fn mov_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;

        self.assembler.mov(dst_reg, imm).map_err(asm_err)
    }

    /// Emit MOV r64, imm64 with a full 8-byte immediate.
    ///
    /// Returns the instruction index; the immediate starts two bytes into
    /// the instruction (REX.W + B8+r).
    pub fn mov_reg_imm64(&mut self, dst: AsmReg, imm: u64) -> Result<usize, EncodingError> {
        let register = self.to_register(dst)?;
        let index = self.next_instruction_index();
        let instruction = Instruction::with2(Code::Mov_r64_imm64, register, imm).map_err(asm_err)?;
        self.assembler.add_instruction(instruction).map_err(asm_err)?;
        Ok(index)
    }

    /// Emit MOV instruction - memory to register.
    pub fn mov_reg_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        let mem = qword_ptr(base_reg + offset);
        self.assembler.mov(dst_reg, mem).map_err(asm_err)
    }

    /// Emit MOV instruction - register to memory.
    pub fn mov_mem_reg(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        let src_reg = self.to_gp64_register(src)?;

        let mem = qword_ptr(base_reg + offset);
        self.assembler.mov(mem, src_reg).map_err(asm_err)
    }

    /// Emit MOVZX instruction - 8-bit to 64-bit zero extension.
    pub fn movzx_reg8_to_reg64(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp8_register(src)?;

        self.assembler.movzx(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn add_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.add(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn add_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        self.assembler.add(dst_reg, imm).map_err(asm_err)
    }

    pub fn sub_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.sub(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn sub_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        self.assembler.sub(dst_reg, imm).map_err(asm_err)
    }

    /// Emit IMUL instruction - multiply two registers (dst = dst * src).
    pub fn imul_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.imul_2(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn and_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.and(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn or_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.or(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn xor_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.xor(dst_reg, src_reg).map_err(asm_err)
    }

    /// Emit SHL instruction - shift left by CL.
    pub fn shl_reg_cl(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        self.assembler.shl(dst_reg, cl).map_err(asm_err)
    }

    /// Emit SAR instruction - arithmetic shift right by CL.
    pub fn sar_reg_cl(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        self.assembler.sar(dst_reg, cl).map_err(asm_err)
    }

    /// Emit CQO instruction - sign extend RAX into RDX:RAX.
    pub fn cqo(&mut self) -> Result<(), EncodingError> {
        self.assembler.cqo().map_err(asm_err)
    }

    /// Emit IDIV instruction - signed divide RDX:RAX by register.
    pub fn idiv_reg(&mut self, divisor: AsmReg) -> Result<(), EncodingError> {
        let reg = self.to_gp64_register(divisor)?;
        self.assembler.idiv(reg).map_err(asm_err)
    }

    pub fn cmp_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let left_reg = self.to_gp64_register(left)?;
        let right_reg = self.to_gp64_register(right)?;
        self.assembler.cmp(left_reg, right_reg).map_err(asm_err)
    }

    pub fn test_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let left_reg = self.to_gp64_register(left)?;
        let right_reg = self.to_gp64_register(right)?;
        self.assembler.test(left_reg, right_reg).map_err(asm_err)
    }

    /// Emit SETcc on the low byte of `dst`.
    pub fn setcc_reg(&mut self, condition: JumpCondition, dst: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp8_register(dst)?;
        match condition {
            JumpCondition::Equal => self.assembler.sete(dst_reg),
            JumpCondition::NotEqual => self.assembler.setne(dst_reg),
            JumpCondition::Less => self.assembler.setl(dst_reg),
            JumpCondition::Greater => self.assembler.setg(dst_reg),
            JumpCondition::LessEqual => self.assembler.setle(dst_reg),
            JumpCondition::GreaterEqual => self.assembler.setge(dst_reg),
        }
        .map_err(asm_err)
    }

    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let src_reg = self.to_gp64_register(reg)?;
        self.assembler.push(src_reg).map_err(asm_err)
    }

    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(reg)?;
        self.assembler.pop(dst_reg).map_err(asm_err)
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)
    }

    /// Emit CALL instruction to register.
    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let target_reg = self.to_gp64_register(reg)?;
        self.assembler.call(target_reg).map_err(asm_err)
    }

    /// Emit JMP instruction to register.
    pub fn jmp_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let target_reg = self.to_gp64_register(reg)?;
        self.assembler.jmp(target_reg).map_err(asm_err)
    }

    /// Emit indirect JMP through memory.
    pub fn jmp_mem(&mut self, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        self.assembler.jmp(qword_ptr(base_reg + offset)).map_err(asm_err)
    }

    pub fn int3(&mut self) -> Result<(), EncodingError> {
        self.assembler.int3().map_err(asm_err)
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    /// Create or get a label for a basic block.
    pub fn get_or_create_label_for_block(&mut self, block_id: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block_id) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert(block_id, label);
            label
        }
    }

    /// Place a label for a basic block at the current position.
    pub fn place_label_for_block(&mut self, block_id: usize) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_block(block_id);
        self.assembler.set_label(&mut label).map_err(asm_err)?;
        self.block_labels.insert(block_id, label);
        self.placed_blocks.insert(block_id);
        Ok(())
    }

    pub fn is_block_placed(&self, block_id: usize) -> bool {
        self.placed_blocks.contains(&block_id)
    }

    /// Fresh label not tied to a block (edge copies).
    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_err)
    }

    /// Emit conditional jump to a label.
    pub fn jcc(&mut self, condition: JumpCondition, label: CodeLabel) -> Result<(), EncodingError> {
        match condition {
            JumpCondition::Equal => self.assembler.je(label),
            JumpCondition::NotEqual => self.assembler.jne(label),
            JumpCondition::Less => self.assembler.jl(label),
            JumpCondition::Greater => self.assembler.jg(label),
            JumpCondition::LessEqual => self.assembler.jle(label),
            JumpCondition::GreaterEqual => self.assembler.jge(label),
        }
        .map_err(asm_err)
    }

    /// Emit unconditional jump to a block.
    pub fn jmp_to_block(&mut self, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        self.assembler.jmp(label).map_err(asm_err)
    }

    /// Generate prologue for a function.
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.push_reg(AsmReg::RBP)?;
        self.mov_reg_reg(AsmReg::RBP, AsmReg::RSP)?;
        if frame_size > 0 {
            self.sub_reg_imm(AsmReg::RSP, frame_size as i32)?;
        }
        Ok(())
    }

    /// Generate epilogue for a function.
    pub fn emit_epilogue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        if frame_size > 0 {
            self.add_reg_imm(AsmReg::RSP, frame_size as i32)?;
        }
        self.pop_reg(AsmReg::RBP)?;
        self.ret()
    }

    /// Assemble at address 0 and report per-instruction offsets.
    pub fn finalize(mut self) -> Result<EncodedCode, EncodingError> {
        if let Some(&unplaced) = self
            .block_labels
            .keys()
            .find(|block| !self.placed_blocks.contains(*block))
        {
            return Err(EncodingError::UnplacedLabel(unplaced));
        }

        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;

        Ok(EncodedCode {
            code: result.inner.code_buffer,
            instruction_offsets: result.inner.new_instruction_offsets,
        })
    }
}
