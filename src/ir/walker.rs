//! Cursor over the instructions of a method.
//!
//! A walker is a plain `(block, index)` position, so it is `Copy` and does
//! not borrow the method. Navigation takes `&Method`, every edit takes
//! `&mut Method` and keeps use records and the cached CFG in sync.
//!
//! Inserting or erasing an instruction shifts the positions of all later
//! instructions in the same block; other walkers into that block must be
//! re-derived afterwards.

use super::block::BlockId;
use super::instruction::{InstrId, Instruction};
use super::method::Method;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstructionWalker {
    block: BlockId,
    index: usize,
}

impl InstructionWalker {
    pub(crate) fn new(block: BlockId, index: usize) -> Self {
        Self { block, index }
    }

    pub fn block(self) -> BlockId {
        self.block
    }

    pub fn index(self) -> usize {
        self.index
    }

    // ─── Queries ──────────────────────────────────────────────────

    pub fn id(self, method: &Method) -> Option<InstrId> {
        method.instruction_at(self.block, self.index)
    }

    pub fn get(self, method: &Method) -> Option<&Instruction> {
        self.id(method).map(|id| method.instruction(id))
    }

    /// At the label heading the block.
    pub fn is_start_of_block(self) -> bool {
        self.index == 0
    }

    pub fn is_end_of_block(self, method: &Method) -> bool {
        method
            .try_block(self.block)
            .is_none_or(|b| self.index >= b.len())
    }

    pub fn is_start_of_method(self, method: &Method) -> bool {
        self.is_start_of_block() && method.first_block() == Some(self.block)
    }

    pub fn is_end_of_method(self, method: &Method) -> bool {
        self.is_end_of_block(method)
            && (method.last_block() == Some(self.block) || method.try_block(self.block).is_none())
    }

    // ─── Navigation ───────────────────────────────────────────────

    pub fn next_in_block(self) -> Self {
        Self::new(self.block, self.index + 1)
    }

    /// One step back, staying at the label if already there.
    pub fn previous_in_block(self) -> Self {
        Self::new(self.block, self.index.saturating_sub(1))
    }

    /// One step forward, continuing with the next block in program order
    /// at the end of a block. Stays at the end of the last block.
    pub fn next_in_method(self, method: &Method) -> Self {
        if self.is_end_of_block(method) {
            return match method.next_block(self.block) {
                Some(block) => Self::new(block, 0),
                None => self,
            };
        }
        let next = self.next_in_block();
        if next.is_end_of_block(method) {
            if let Some(block) = method.next_block(self.block) {
                return Self::new(block, 0);
            }
        }
        next
    }

    /// One step back, continuing with the last instruction of the
    /// previous block from a label. Stays at the start of the method.
    pub fn previous_in_method(self, method: &Method) -> Self {
        if !self.is_start_of_block() {
            return self.previous_in_block();
        }
        match method.previous_block(self.block) {
            Some(block) => Self::new(block, method.block(block).len().saturating_sub(1)),
            None => self,
        }
    }

    // ─── Mutation ─────────────────────────────────────────────────

    /// Insert `instr` before the cursor. The returned walker points to the
    /// new instruction; the old one is now at `next_in_block`. At the
    /// label, the instruction goes directly behind it.
    pub fn emplace(self, method: &mut Method, instr: Instruction) -> Self {
        let index = self.index.max(1);
        method.insert_at(self.block, index, instr);
        Self::new(self.block, index)
    }

    /// Remove the instruction. The returned walker points to the
    /// instruction that followed it.
    pub fn erase(self, method: &mut Method) -> Self {
        method.remove_at(self.block, self.index);
        self
    }

    /// Remove the instruction and hand it back.
    pub fn release(self, method: &mut Method) -> Option<Instruction> {
        method.remove_at(self.block, self.index)
    }

    /// Replace the instruction, keeping its id. Returns the old one.
    pub fn reset(self, method: &mut Method, instr: Instruction) -> Option<Instruction> {
        method.replace_at(self.block, self.index, instr)
    }

    /// Change the instruction in place.
    pub fn modify<R>(self, method: &mut Method, f: impl FnOnce(&mut Instruction) -> R) -> Option<R> {
        method.modify_at(self.block, self.index, f)
    }
}
