use super::instruction::InstrId;
use super::local::LocalId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An ordered instruction sequence. The first instruction is always the
/// label defining the block.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub(crate) label: LocalId,
    pub(crate) instructions: Vec<InstrId>,
}

impl BasicBlock {
    /// Name of the block created when instructions are appended to an
    /// empty method.
    pub const DEFAULT_BLOCK: &'static str = "%start_of_function";
    /// Name of the terminal block returns are redirected to.
    pub const LAST_BLOCK: &'static str = "%end_of_function";

    pub fn label(&self) -> LocalId {
        self.label
    }

    pub fn instructions(&self) -> &[InstrId] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Only the label is left.
    pub fn is_empty(&self) -> bool {
        self.instructions.len() <= 1
    }
}
