// Indirection stubs for lazily compiled functions. Each stub is the published address of one
// function and jumps through an 8-byte slot owned by the lazy entry:
//
//     movabs r11, <slot>
//     jmp    qword ptr [r11]
//
// Until the function is compiled the slot points at the entry's reentry thunk, which saves
// the six integer argument registers, calls the reentry handler with the entry as its only
// argument, restores the arguments and tail-jumps to the address the handler returned. Once
// the slot holds the compiled body the thunk is never reached again. Slots, entries and the
// handler all live at fixed addresses when the block is emitted, so the stub block contains
// no relocations and is assembled position independent.

//! Lazy call-through stubs and reentry thunks for x86-64.

use super::backend::ARG_REGS;
use super::encoder::{AsmReg, EncodingError, X64Encoder};

/// Addresses one stub/thunk pair is built around.
#[derive(Debug, Clone, Copy)]
pub struct StubRequest {
    /// Address of the 8-byte slot the stub jumps through.
    pub slot: u64,
    /// Value passed to the handler in RDI.
    pub context: u64,
}

/// Encoded stub block with the offsets of each stub and thunk.
#[derive(Debug, Clone)]
pub struct StubBlock {
    pub code: Vec<u8>,
    pub stub_offsets: Vec<usize>,
    pub thunk_offsets: Vec<usize>,
}

/// Emit one stub and one reentry thunk per request. `handler` is an
/// `extern "C" fn(context) -> u64` returning the address to continue at.
pub fn emit_stub_block(requests: &[StubRequest], handler: u64) -> Result<StubBlock, EncodingError> {
    let mut encoder = X64Encoder::new()?;
    let mut stub_indices = Vec::with_capacity(requests.len());
    let mut thunk_indices = Vec::with_capacity(requests.len());

    for request in requests {
        stub_indices.push(encoder.mov_reg_imm64(AsmReg::R11, request.slot)?);
        encoder.jmp_mem(AsmReg::R11, 0)?;
        // Keeps stubs apart when a call faults in the thunk.
        encoder.int3()?;
    }

    for request in requests {
        thunk_indices.push(encoder.next_instruction_index());
        for reg in ARG_REGS {
            encoder.push_reg(reg)?;
        }
        // Six pushes leave RSP 8 bytes off the 16-byte call alignment.
        encoder.sub_reg_imm(AsmReg::RSP, 8)?;
        encoder.mov_reg_imm64(AsmReg::RDI, request.context)?;
        encoder.mov_reg_imm64(AsmReg::RAX, handler)?;
        encoder.call_reg(AsmReg::RAX)?;
        encoder.add_reg_imm(AsmReg::RSP, 8)?;
        for reg in ARG_REGS.iter().rev() {
            encoder.pop_reg(*reg)?;
        }
        encoder.jmp_reg(AsmReg::RAX)?;
    }

    let encoded = encoder.finalize()?;
    let offsets = |indices: Vec<usize>| -> Result<Vec<usize>, EncodingError> {
        indices
            .into_iter()
            .map(|index| {
                encoded.offset_of(index).ok_or_else(|| {
                    EncodingError::AssemblyError(format!("no offset for stub instruction {index}"))
                })
            })
            .collect()
    };
    let stub_offsets = offsets(stub_indices)?;
    let thunk_offsets = offsets(thunk_indices)?;

    log::trace!(
        "emitted {} stub(s) in {} bytes",
        requests.len(),
        encoded.code.len()
    );
    Ok(StubBlock {
        code: encoded.code,
        stub_offsets,
        thunk_offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_layout() {
        let requests = [
            StubRequest { slot: 0x1000, context: 0x2000 },
            StubRequest { slot: 0x1008, context: 0x2008 },
        ];
        let block = emit_stub_block(&requests, 0xdead_beef).unwrap();

        assert_eq!(block.stub_offsets.len(), 2);
        assert_eq!(block.thunk_offsets.len(), 2);
        assert_eq!(block.stub_offsets[0], 0);
        // movabs r11, imm64 = 49 BB imm64
        assert_eq!(&block.code[..2], &[0x49, 0xBB]);
        assert_eq!(
            u64::from_le_bytes(block.code[2..10].try_into().unwrap()),
            0x1000
        );
        // jmp qword ptr [r11] = 41 FF 23
        assert_eq!(&block.code[10..13], &[0x41, 0xFF, 0x23]);
        assert!(block.thunk_offsets[0] > block.stub_offsets[1]);
        // push rdi opens the thunk.
        assert_eq!(block.code[block.thunk_offsets[0]], 0x57);
    }
}
