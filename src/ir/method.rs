//! Methods own every local, instruction and basic block of a kernel.
//!
//! Instructions live in an arena indexed by `InstrId`, locals in an arena
//! indexed by `LocalId`. Blocks only list instruction ids in program
//! order. Every local records which instructions read or write it; the
//! record is updated whenever an instruction enters, leaves or changes,
//! which only happens through `InstructionWalker` or the structural
//! operations below.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::block::{BasicBlock, BlockId};
use super::cfg::ControlFlowGraph;
use super::instruction::{InstrId, InstrKind, Instruction};
use super::local::{
    BuiltinKind, Local, LocalData, LocalId, LocalKind, NameGenerator, ParameterInfo,
    StackAllocation,
};
use super::metadata::KernelMetaData;
use super::types::{AddressSpace, DataType, ScalarKind, TYPE_INT32, TYPE_LABEL};
use super::value::{Literal, Value};
use super::walker::InstructionWalker;
use crate::diagnostic::{CompilationError, CompileResult};
use crate::periphery::Scratchpad;

#[derive(Clone, Debug)]
pub struct Method {
    pub name: String,
    pub metadata: KernelMetaData,
    /// No memory object can be the source of interference between
    /// work-items, so code generation may omit synchronization barriers.
    pub cross_item_synchronization_free: bool,
    /// Scratchpad layout, filled in by memory lowering.
    pub scratchpad: Scratchpad,
    locals: Vec<Option<Local>>,
    local_names: FxHashMap<String, LocalId>,
    instructions: Vec<Option<Instruction>>,
    owners: Vec<Option<BlockId>>,
    blocks: Vec<Option<BasicBlock>>,
    order: Vec<BlockId>,
    label_blocks: FxHashMap<LocalId, BlockId>,
    parameters: Vec<LocalId>,
    stack_allocations: Vec<LocalId>,
    builtins: [Option<LocalId>; BuiltinKind::COUNT],
    cfg: Option<ControlFlowGraph>,
    names: Arc<NameGenerator>,
    revision: u64,
}

impl Method {
    pub fn new(name: impl Into<String>, names: Arc<NameGenerator>) -> Self {
        Self {
            name: name.into(),
            metadata: KernelMetaData::default(),
            cross_item_synchronization_free: false,
            scratchpad: Scratchpad::default(),
            locals: Vec::new(),
            local_names: FxHashMap::default(),
            instructions: Vec::new(),
            owners: Vec::new(),
            blocks: Vec::new(),
            order: Vec::new(),
            label_blocks: FxHashMap::default(),
            parameters: Vec::new(),
            stack_allocations: Vec::new(),
            builtins: [None; BuiltinKind::COUNT],
            cfg: None,
            names,
            revision: 0,
        }
    }

    pub fn name_generator(&self) -> &Arc<NameGenerator> {
        &self.names
    }

    /// Counter bumped by every edit of the instruction stream. Passes
    /// compare it before and after a walk to tell whether they changed
    /// anything.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // ─── Locals ───────────────────────────────────────────────────

    pub fn local(&self, id: LocalId) -> &Local {
        match self.locals.get(id.index()) {
            Some(Some(local)) => local,
            _ => panic!("{} does not belong to method {}", id, self.name),
        }
    }

    /// Mutable access to the descriptive parts of a local. Use records
    /// are not reachable from here.
    pub fn local_mut(&mut self, id: LocalId) -> &mut Local {
        match self.locals.get_mut(id.index()) {
            Some(Some(local)) => local,
            _ => panic!("{} does not belong to method {}", id, self.name),
        }
    }

    pub fn local_name(&self, id: LocalId) -> &str {
        match self.locals.get(id.index()) {
            Some(Some(local)) => &local.name,
            _ => "<removed>",
        }
    }

    pub fn local_value(&self, id: LocalId) -> Value {
        Value::local(id, self.local(id).ty.clone())
    }

    pub fn find_local(&self, name: &str) -> Option<LocalId> {
        self.local_names.get(name).copied()
    }

    pub fn locals(&self) -> impl Iterator<Item = (LocalId, &Local)> + '_ {
        self.locals
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|l| (LocalId(i as u32), l)))
    }

    pub fn num_locals(&self) -> usize {
        self.local_names.len()
    }

    fn insert_local(&mut self, local: Local) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.local_names.insert(local.name.clone(), id);
        self.locals.push(Some(local));
        id
    }

    /// Return the local named `name`, creating it if it does not exist.
    ///
    /// Integers of 33 to 64 bits are split into a `.lower`/`.upper` pair
    /// of 32-bit locals on creation.
    pub fn create_local(&mut self, ty: DataType, name: &str, kind: LocalKind) -> LocalId {
        if let Some(id) = self.find_local(name) {
            return id;
        }
        let id = self.insert_local(Local::new(name.to_string(), ty.clone(), kind));
        if let DataType::Scalar {
            kind: ScalarKind::Int,
            bits: 33..=64,
            width,
        } = ty
        {
            let half = TYPE_INT32.to_vector(width);
            let lower = self.insert_local(Local::new(
                format!("{}.lower", name),
                half.clone(),
                LocalKind::Plain,
            ));
            let upper = self.insert_local(Local::new(format!("{}.upper", name), half, LocalKind::Plain));
            self.local_mut(id).data = LocalData::MultiRegister { lower, upper };
        }
        id
    }

    /// A name no local of this method uses yet.
    pub fn create_local_name(&self, prefix: &str, postfix: &str) -> String {
        let mut name = self.names.create_name(prefix, postfix);
        while self.local_names.contains_key(&name) {
            name = self.names.create_name(&name, "");
        }
        name
    }

    /// Create a fresh plain local and return a reference to it.
    pub fn add_new_local(&mut self, ty: DataType, prefix: &str, postfix: &str) -> Value {
        let name = self.create_local_name(prefix, postfix);
        let id = self.create_local(ty.clone(), &name, LocalKind::Plain);
        Value::local(id, ty)
    }

    /// Create a local declared with `kind`. An existing local of the same
    /// name is only reused if it was declared the same way, with the same
    /// type.
    fn declare_local(&mut self, ty: DataType, name: &str, kind: LocalKind) -> CompileResult<LocalId> {
        if let Some(id) = self.find_local(name) {
            let existing = self.local(id);
            if std::mem::discriminant(&existing.kind) != std::mem::discriminant(&kind) || existing.ty != ty {
                return Err(CompilationError::general(format!(
                    "Local {} is already declared with a different kind or type",
                    name
                ))
                .with_context(format!("{:?} {}", existing.kind, existing.ty)));
            }
            return Ok(id);
        }
        Ok(self.create_local(ty, name, kind))
    }

    pub fn add_parameter(&mut self, name: &str, ty: DataType, read_only: bool) -> CompileResult<LocalId> {
        let info = ParameterInfo {
            read_only,
            max_byte_offset: None,
        };
        let id = self.declare_local(ty, name, LocalKind::Parameter(info))?;
        if !self.parameters.contains(&id) {
            self.parameters.push(id);
        }
        Ok(id)
    }

    /// Declare a private allocation holding one `content` value. The local
    /// itself is a pointer to the allocation.
    pub fn add_stack_allocation(
        &mut self,
        name: &str,
        content: DataType,
        alignment: u32,
    ) -> CompileResult<LocalId> {
        let size = content.in_memory_size();
        let ty = DataType::pointer_to(content, AddressSpace::Private, alignment);
        let alloc = StackAllocation {
            size,
            alignment: alignment.max(1),
            offset: 0,
            is_lowered: false,
        };
        let id = self.declare_local(ty, name, LocalKind::StackAllocation(alloc))?;
        if !self.stack_allocations.contains(&id) {
            self.stack_allocations.push(id);
        }
        Ok(id)
    }

    /// Reference a module-level global from this method.
    pub fn add_global_reference(&mut self, name: &str, ty: DataType, constant: bool) -> CompileResult<LocalId> {
        self.declare_local(ty, name, LocalKind::Global { constant })
    }

    pub fn parameters(&self) -> &[LocalId] {
        &self.parameters
    }

    pub fn stack_allocations(&self) -> &[LocalId] {
        &self.stack_allocations
    }

    pub fn find_parameter(&self, name: &str) -> Option<LocalId> {
        self.find_local(name)
            .filter(|id| self.local(*id).parameter().is_some())
    }

    pub fn find_stack_allocation(&self, name: &str) -> Option<LocalId> {
        self.find_local(name)
            .filter(|id| self.local(*id).stack_allocation().is_some())
    }

    pub fn find_global(&self, name: &str) -> Option<LocalId> {
        self.find_local(name).filter(|id| self.local(*id).is_global())
    }

    pub fn find_builtin(&self, kind: BuiltinKind) -> Option<LocalId> {
        self.builtins[kind.index()]
    }

    /// The local for an implicit kernel input. Creating it marks the input
    /// as used in the kernel metadata.
    pub fn find_or_create_builtin(&mut self, kind: BuiltinKind) -> LocalId {
        if let Some(id) = self.builtins[kind.index()] {
            return id;
        }
        let id = self.create_local(kind.data_type(), kind.local_name(), LocalKind::Builtin(kind));
        self.builtins[kind.index()] = Some(id);
        self.metadata.uniforms_used.set_used(kind, true);
        id
    }

    /// Follow `Reference` data to the memory object a pointer local
    /// points into.
    pub fn base_local(&self, id: LocalId) -> LocalId {
        let mut current = id;
        let mut seen = FxHashSet::default();
        while let LocalData::Reference { base, .. } = self.local(current).data {
            if !seen.insert(current) {
                break;
            }
            current = base;
        }
        current
    }

    /// Drop plain locals nothing references any more.
    pub fn clean_locals(&mut self) -> usize {
        let mut referenced: FxHashSet<LocalId> = FxHashSet::default();
        for (_, local) in self.locals() {
            match local.data {
                LocalData::MultiRegister { lower, upper } => {
                    referenced.insert(lower);
                    referenced.insert(upper);
                }
                LocalData::Reference { base, .. } => {
                    referenced.insert(base);
                }
                LocalData::None => {}
            }
        }
        let unused: Vec<LocalId> = self
            .locals()
            .filter(|(id, local)| {
                local.kind == LocalKind::Plain
                    && local.users().is_empty()
                    && !referenced.contains(id)
            })
            .map(|(id, _)| id)
            .collect();
        for id in &unused {
            if let Some(local) = self.locals[id.index()].take() {
                self.local_names.remove(&local.name);
            }
        }
        debug!("Cleaned {} unused locals from method {}", unused.len(), self.name);
        unused.len()
    }

    // ─── Instructions ─────────────────────────────────────────────

    pub fn instruction(&self, id: InstrId) -> &Instruction {
        match self.instructions.get(id.index()) {
            Some(Some(instr)) => instr,
            _ => panic!("instruction #{} does not belong to method {}", id.index(), self.name),
        }
    }

    pub fn try_instruction(&self, id: InstrId) -> Option<&Instruction> {
        self.instructions.get(id.index()).and_then(Option::as_ref)
    }

    /// Block currently containing the instruction.
    pub fn owner(&self, id: InstrId) -> Option<BlockId> {
        self.owners.get(id.index()).copied().flatten()
    }

    /// Position of an instruction.
    pub fn find_instruction(&self, id: InstrId) -> Option<InstructionWalker> {
        let block = self.owner(id)?;
        let index = self.block(block).instructions.iter().position(|i| *i == id)?;
        Some(InstructionWalker::new(block, index))
    }

    fn track(&mut self, id: InstrId) {
        self.revision += 1;
        let uses = self.instruction(id).local_uses();
        for (local, usage) in uses {
            if let Some(Some(local)) = self.locals.get_mut(local.index()) {
                local.add_use(id, usage);
            }
        }
    }

    fn untrack(&mut self, id: InstrId) {
        let uses = self.instruction(id).local_uses();
        for (local, _) in uses {
            if let Some(Some(local)) = self.locals.get_mut(local.index()) {
                local.remove_user(id);
            }
        }
    }

    fn alloc_instruction(&mut self, instr: Instruction) -> InstrId {
        let id = InstrId(self.instructions.len() as u32);
        self.instructions.push(Some(instr));
        self.owners.push(None);
        self.track(id);
        id
    }

    fn free_instruction(&mut self, id: InstrId) -> Option<Instruction> {
        self.try_instruction(id)?;
        self.untrack(id);
        self.owners[id.index()] = None;
        self.instructions[id.index()].take()
    }

    pub(crate) fn instruction_at(&self, block: BlockId, index: usize) -> Option<InstrId> {
        self.try_block(block)?.instructions.get(index).copied()
    }

    pub(crate) fn insert_at(&mut self, block: BlockId, index: usize, instr: Instruction) -> InstrId {
        let is_branch = instr.affects_control_flow();
        let id = self.alloc_instruction(instr);
        self.owners[id.index()] = Some(block);
        if let Some(Some(b)) = self.blocks.get_mut(block.index()) {
            let index = index.min(b.instructions.len());
            b.instructions.insert(index, id);
        }
        if is_branch {
            self.update_cfg(|cfg, method| cfg.add_branch(method, block, id));
        }
        id
    }

    pub(crate) fn remove_at(&mut self, block: BlockId, index: usize) -> Option<Instruction> {
        if index == 0 {
            warn!("Refusing to erase the label of a basic block, remove the block instead");
            return None;
        }
        let id = match self.blocks.get_mut(block.index()) {
            Some(Some(b)) if index < b.instructions.len() => b.instructions.remove(index),
            _ => return None,
        };
        let instr = self.free_instruction(id)?;
        if instr.affects_control_flow() {
            self.update_cfg(|cfg, method| cfg.remove_branch(method, block, id));
        }
        Some(instr)
    }

    /// Replace the instruction with `instr`, keeping its id.
    pub(crate) fn replace_at(&mut self, block: BlockId, index: usize, instr: Instruction) -> Option<Instruction> {
        let id = self.instruction_at(block, index)?;
        let was_branch = self.instruction(id).affects_control_flow();
        let is_branch = instr.affects_control_flow();
        self.untrack(id);
        let old = self.instructions[id.index()].replace(instr);
        self.track(id);
        if was_branch {
            self.update_cfg(|cfg, method| cfg.remove_branch(method, block, id));
        }
        if is_branch {
            self.update_cfg(|cfg, method| cfg.add_branch(method, block, id));
        }
        old
    }

    pub(crate) fn modify_at<R>(
        &mut self,
        block: BlockId,
        index: usize,
        f: impl FnOnce(&mut Instruction) -> R,
    ) -> Option<R> {
        let id = self.instruction_at(block, index)?;
        let was_branch = self.instruction(id).affects_control_flow();
        self.untrack(id);
        let result = match self.instructions.get_mut(id.index()) {
            Some(Some(instr)) => f(instr),
            _ => return None,
        };
        self.track(id);
        let is_branch = self.instruction(id).affects_control_flow();
        if was_branch {
            self.update_cfg(|cfg, method| cfg.remove_branch(method, block, id));
        }
        if is_branch {
            self.update_cfg(|cfg, method| cfg.add_branch(method, block, id));
        }
        Some(result)
    }

    /// Append to the last block, creating `%start_of_function` if the
    /// method has no block yet. Appending a label starts a new block.
    pub fn append(&mut self, instr: Instruction) -> InstructionWalker {
        if let InstrKind::Label { label } = instr.kind {
            let block = self.new_block(label);
            self.order.push(block);
            self.update_cfg(|cfg, method| cfg.add_block(method, block));
            return InstructionWalker::new(block, 0);
        }
        let block = self.ensure_default_block();
        let index = self.block(block).len();
        self.insert_at(block, index, instr);
        InstructionWalker::new(block, index)
    }

    pub fn count_instructions(&self) -> usize {
        self.order.iter().map(|b| self.block(*b).len()).sum()
    }

    /// Erase combined instructions that lost both halves.
    pub fn clean_empty_instructions(&mut self) -> usize {
        let mut removed = 0;
        for block in self.order.clone() {
            let mut index = 1;
            while let Some(id) = self.instruction_at(block, index) {
                let empty = matches!(
                    self.instruction(id).kind,
                    InstrKind::Combined {
                        first: None,
                        second: None
                    }
                );
                if empty {
                    self.remove_at(block, index);
                    removed += 1;
                } else {
                    index += 1;
                }
            }
        }
        removed
    }

    pub fn for_all_instructions(&self, mut f: impl FnMut(InstrId, &Instruction)) {
        for block in &self.order {
            for id in &self.block(*block).instructions {
                f(*id, self.instruction(*id));
            }
        }
    }

    /// Textual form of the whole method, one instruction per line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.for_all_instructions(|_, instr| {
            if !instr.is_label() {
                out.push_str("    ");
            }
            out.push_str(&instr.display(self).to_string());
            out.push('\n');
        });
        out
    }

    pub fn dump_instructions(&self) {
        debug!("Instructions of method {}:", self.name);
        for line in self.to_text().lines() {
            debug!("{}", line);
        }
    }

    /// Evaluate an instruction to a literal, resolving local operands
    /// through their single writer up to `depth` levels deep.
    pub fn precalculate(&self, id: InstrId, depth: u32) -> Option<Literal> {
        if depth == 0 {
            return None;
        }
        let instr = self.instruction(id);
        let args: SmallVec<[Option<Literal>; 4]> = instr
            .args()
            .iter()
            .map(|arg| self.evaluate_value(arg, depth - 1))
            .collect();
        instr.evaluate_literal(&args)
    }

    /// Compile-time value of an operand, if known.
    pub fn evaluate_value(&self, value: &Value, depth: u32) -> Option<Literal> {
        match value {
            Value::Literal { value, .. } => Some(*value),
            Value::Local { local, .. } if depth > 0 => {
                let writer = self.local(*local).single_writer()?;
                self.precalculate(writer, depth)
            }
            _ => None,
        }
    }

    // ─── Basic blocks ─────────────────────────────────────────────

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        match self.try_block(id) {
            Some(block) => block,
            None => panic!("block #{} does not belong to method {}", id.index(), self.name),
        }
    }

    pub fn try_block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index()).and_then(Option::as_ref)
    }

    /// Blocks in program order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.order.iter().copied()
    }

    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    pub fn block_position(&self, block: BlockId) -> Option<usize> {
        self.order.iter().position(|b| *b == block)
    }

    pub fn first_block(&self) -> Option<BlockId> {
        self.order.first().copied()
    }

    pub fn last_block(&self) -> Option<BlockId> {
        self.order.last().copied()
    }

    pub fn next_block(&self, block: BlockId) -> Option<BlockId> {
        let pos = self.block_position(block)?;
        self.order.get(pos + 1).copied()
    }

    pub fn previous_block(&self, block: BlockId) -> Option<BlockId> {
        let pos = self.block_position(block)?;
        pos.checked_sub(1).map(|p| self.order[p])
    }

    pub fn find_block_by_label(&self, label: LocalId) -> Option<BlockId> {
        self.label_blocks.get(&label).copied()
    }

    pub fn find_block_by_name(&self, name: &str) -> Option<BlockId> {
        self.find_local(name)
            .and_then(|label| self.find_block_by_label(label))
    }

    pub fn walk_all(&self) -> Option<InstructionWalker> {
        self.first_block().map(|b| InstructionWalker::new(b, 0))
    }

    pub fn walk_block(&self, block: BlockId) -> InstructionWalker {
        InstructionWalker::new(block, 0)
    }

    pub fn walk_block_end(&self, block: BlockId) -> InstructionWalker {
        InstructionWalker::new(block, self.block(block).len())
    }

    fn new_block(&mut self, label: LocalId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let instr = self.alloc_instruction(Instruction::label(label));
        self.owners[instr.index()] = Some(id);
        self.blocks.push(Some(BasicBlock {
            label,
            instructions: vec![instr],
        }));
        self.label_blocks.insert(label, id);
        id
    }

    fn new_label(&mut self, name: &str) -> LocalId {
        let name = if self.find_local(name).is_some() {
            self.create_local_name(name, "")
        } else {
            name.to_string()
        };
        self.create_local(TYPE_LABEL, &name, LocalKind::Label)
    }

    fn ensure_default_block(&mut self) -> BlockId {
        if let Some(last) = self.last_block() {
            return last;
        }
        let label = self.new_label(BasicBlock::DEFAULT_BLOCK);
        let block = self.new_block(label);
        self.order.push(block);
        self.update_cfg(|cfg, method| cfg.add_block(method, block));
        block
    }

    /// Start a new block labelled `label` at `at`. The instructions from
    /// `at` to the end of its block move into the new block, which
    /// directly follows the old one. At the start of a block, the new
    /// (empty) block is inserted in front of it instead.
    pub fn emplace_label(&mut self, at: InstructionWalker, label: LocalId) -> CompileResult<InstructionWalker> {
        if self.order.is_empty() {
            let block = self.new_block(label);
            self.order.push(block);
            self.update_cfg(|cfg, method| cfg.add_block(method, block));
            return Ok(InstructionWalker::new(block, 0));
        }
        let pos = self.block_position(at.block()).ok_or_else(|| {
            let context = at
                .get(self)
                .map(|i| i.display(self).to_string())
                .unwrap_or_default();
            CompilationError::general("Failed to find basic block for instruction iterator")
                .with_context(context)
        })?;
        let at_start = at.is_start_of_block();
        let block = self.new_block(label);
        self.order.insert(if at_start { pos } else { pos + 1 }, block);
        if !at_start {
            let tail = match self.blocks.get_mut(at.block().index()) {
                Some(Some(old)) => old.instructions.split_off(at.index().min(old.instructions.len())),
                _ => Vec::new(),
            };
            for id in &tail {
                self.owners[id.index()] = Some(block);
            }
            if let Some(Some(new)) = self.blocks.get_mut(block.index()) {
                new.instructions.extend(tail);
            }
        }
        let old = at.block();
        self.update_cfg(|cfg, method| {
            cfg.add_block(method, block);
            cfg.refresh_block(method, old);
        });
        Ok(InstructionWalker::new(block, 0))
    }

    /// Insert a new empty block at `position` in block order.
    pub fn create_and_insert_new_block(&mut self, position: usize, label_name: &str) -> BlockId {
        let label = self.new_label(label_name);
        let block = self.new_block(label);
        self.order.insert(position.min(self.order.len()), block);
        self.update_cfg(|cfg, method| cfg.add_block(method, block));
        block
    }

    /// Remove a block. Without `overwrite_usages`, only empty blocks no
    /// branch targets may be removed.
    pub fn remove_block(&mut self, block: BlockId, overwrite_usages: bool) -> CompileResult<()> {
        let label_name = |m: &Method| m.local_name(m.block(block).label).to_string();
        let pos = self.block_position(block).ok_or_else(|| {
            CompilationError::general("Basic block was not found in this function")
                .with_context(format!("block #{}", block.index()))
        })?;
        let label = self.block(block).label;
        if !overwrite_usages {
            if !self.block(block).is_empty() {
                return Err(CompilationError::general("Cannot remove non-empty basic block")
                    .with_context(label_name(self)));
            }
            let branched_to = self
                .local(label)
                .readers()
                .any(|r| self.instruction(r).branch_target() == Some(label));
            if branched_to {
                return Err(
                    CompilationError::general("Cannot remove basic block which is still branched to")
                        .with_context(label_name(self)),
                );
            }
        }
        debug!("Removing basic block '{}' from function {}", label_name(self), self.name);
        let previous = pos.checked_sub(1).map(|p| self.order[p]);
        self.order.remove(pos);
        self.label_blocks.remove(&label);
        let ids = match self.blocks.get_mut(block.index()).and_then(Option::take) {
            Some(b) => b.instructions,
            None => Vec::new(),
        };
        for id in ids {
            self.free_instruction(id);
        }
        self.update_cfg(|cfg, method| {
            cfg.remove_block(block);
            if let Some(prev) = previous {
                cfg.refresh_block(method, prev);
            }
        });
        Ok(())
    }

    /// Move a block to `position` in block order without recreating it.
    pub fn move_block(&mut self, block: BlockId, position: usize) {
        let Some(pos) = self.block_position(block) else {
            return;
        };
        let old_previous = self.previous_block(block);
        self.revision += 1;
        self.order.remove(pos);
        self.order.insert(position.min(self.order.len()), block);
        let new_previous = self.previous_block(block);
        self.update_cfg(|cfg, method| {
            for b in [old_previous, new_previous, Some(block)].into_iter().flatten() {
                cfg.refresh_block(method, b);
            }
        });
    }

    // ─── Control flow graph ───────────────────────────────────────

    /// The control flow graph, built on first request.
    pub fn cfg(&mut self) -> &ControlFlowGraph {
        let cfg = match self.cfg.take() {
            Some(cfg) => cfg,
            None => {
                debug!("Creating CFG for function: {}", self.name);
                ControlFlowGraph::build(self)
            }
        };
        self.cfg.insert(cfg)
    }

    pub fn cached_cfg(&self) -> Option<&ControlFlowGraph> {
        self.cfg.as_ref()
    }

    pub fn invalidate_cfg(&mut self) {
        self.cfg = None;
    }

    fn update_cfg(&mut self, f: impl FnOnce(&mut ControlFlowGraph, &Method)) {
        if let Some(mut cfg) = self.cfg.take() {
            f(&mut cfg, self);
            self.cfg = Some(cfg);
        }
    }

    /// Whether every remaining use of `local` from `start` on lies within
    /// `threshold` instructions, following branches into their targets.
    ///
    /// The instruction directly before `start` also counts (it may be the
    /// writer, e.g. a comparison setting flags). The scan gives up at an
    /// unconditional branch whose targets do not cover all uses.
    pub fn is_locally_limited(&self, start: InstructionWalker, local: LocalId, threshold: usize) -> bool {
        let mut remaining: BTreeSet<InstrId> = self.local(local).users().keys().copied().collect();
        let mut budget = threshold as isize;
        let mut visited: FxHashSet<BlockId> = FxHashSet::default();
        if !start.is_start_of_block() {
            if let Some(id) = start.previous_in_block().id(self) {
                remaining.remove(&id);
            }
        }
        let mut it = start;
        while budget >= 0 && !it.is_end_of_method(self) {
            if let Some(id) = it.id(self) {
                remaining.remove(&id);
                budget -= 1;
                let instr = self.instruction(id);
                if let Some(target) = instr.branch_target() {
                    if let Some(successor) = self.find_block_by_label(target) {
                        if self.uses_covered_from(successor, &mut remaining, &mut budget, &mut visited) {
                            return true;
                        }
                    }
                    if instr.is_unconditional_branch() {
                        return false;
                    }
                }
            }
            it = it.next_in_method(self);
        }
        remaining.is_empty()
    }

    fn uses_covered_from(
        &self,
        start: BlockId,
        remaining: &mut BTreeSet<InstrId>,
        budget: &mut isize,
        visited: &mut FxHashSet<BlockId>,
    ) -> bool {
        let mut worklist = vec![start];
        while let Some(block) = worklist.pop() {
            if !visited.insert(block) {
                continue;
            }
            let mut it = self.walk_block(block);
            while *budget >= 0 && !it.is_end_of_method(self) {
                if let Some(id) = it.id(self) {
                    remaining.remove(&id);
                    *budget -= 1;
                    if remaining.is_empty() {
                        return true;
                    }
                    let instr = self.instruction(id);
                    if let Some(target) = instr.branch_target() {
                        if let Some(successor) = self.find_block_by_label(target) {
                            worklist.push(successor);
                        }
                        if instr.is_unconditional_branch() {
                            break;
                        }
                    }
                }
                it = it.next_in_method(self);
            }
        }
        remaining.is_empty()
    }

    // ─── Stack frame ──────────────────────────────────────────────

    fn stack_allocation_infos(&self) -> impl Iterator<Item = &StackAllocation> + '_ {
        self.stack_allocations
            .iter()
            .filter_map(|id| self.local(*id).stack_allocation())
    }

    /// Start of the stack frame behind a global data segment of
    /// `global_data_size` bytes.
    pub fn stack_base_offset(&self, global_data_size: u32) -> u32 {
        let alignment = self
            .stack_allocation_infos()
            .next()
            .map_or(1, |s| s.alignment.max(1));
        global_data_size.next_multiple_of(alignment).next_multiple_of(8)
    }

    /// Assign stack offsets in declaration order. In-memory allocations
    /// are packed first; lowered allocations follow only to get unique
    /// addresses that never collide with real stack slots.
    pub fn calculate_stack_offsets(&mut self, base_offset: u32) {
        let mut current = 0u32;
        for lowered in [false, true] {
            for id in self.stack_allocations.clone() {
                if let LocalKind::StackAllocation(alloc) = &mut self.local_mut(id).kind {
                    if alloc.is_lowered != lowered {
                        continue;
                    }
                    let misalignment = (base_offset + current) % alloc.alignment;
                    if misalignment != 0 {
                        current += alloc.alignment - misalignment;
                    }
                    alloc.offset = current;
                    current += alloc.size;
                }
            }
        }
    }

    /// Size of one work-item's stack frame. Zero if every allocation is
    /// lowered.
    pub fn stack_frame_size(&self) -> u32 {
        let Some(end) = self
            .stack_allocation_infos()
            .filter(|s| !s.is_lowered)
            .map(|s| s.offset + s.size)
            .max()
        else {
            return 0;
        };
        let max_alignment = self
            .stack_allocation_infos()
            .map(|s| s.alignment)
            .max()
            .unwrap_or(1)
            .max(1);
        end.next_multiple_of(max_alignment).next_multiple_of(8)
    }
}
