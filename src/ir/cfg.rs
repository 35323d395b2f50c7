//! Control flow graph over basic blocks.
//!
//! Built on first request and cached on the method. Afterwards it is
//! updated edge by edge whenever a block or a branch enters or leaves the
//! method; it is never rebuilt behind the caller's back.

use std::collections::BTreeSet;

use petgraph::algo;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use rustc_hash::FxHashMap;

use super::block::BlockId;
use super::instruction::{InstrId, InstrKind};
use super::method::Method;

/// Why control can flow from one block to another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfgEdge {
    /// Branch instructions jumping along this edge.
    pub branches: BTreeSet<InstrId>,
    /// The source block runs into the target without a branch.
    pub fall_through: bool,
}

impl CfgEdge {
    fn is_dead(&self) -> bool {
        self.branches.is_empty() && !self.fall_through
    }
}

#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    graph: StableDiGraph<BlockId, CfgEdge>,
    nodes: FxHashMap<BlockId, NodeIndex>,
}

impl ControlFlowGraph {
    pub fn build(method: &Method) -> Self {
        let mut cfg = Self::default();
        for block in method.blocks() {
            cfg.ensure_node(block);
        }
        for block in method.blocks() {
            cfg.refresh_block(method, block);
        }
        cfg
    }

    fn ensure_node(&mut self, block: BlockId) -> NodeIndex {
        if let Some(node) = self.nodes.get(&block) {
            return *node;
        }
        let node = self.graph.add_node(block);
        self.nodes.insert(block, node);
        node
    }

    fn edge_entry(&mut self, from: BlockId, to: BlockId) -> &mut CfgEdge {
        let (a, b) = (self.ensure_node(from), self.ensure_node(to));
        let edge = match self.graph.find_edge(a, b) {
            Some(edge) => edge,
            None => self.graph.add_edge(a, b, CfgEdge::default()),
        };
        &mut self.graph[edge]
    }

    fn outgoing(&self, node: NodeIndex) -> Vec<EdgeIndex> {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| e.id())
            .collect()
    }

    /// The block control falls into after `block`, if any. Code after an
    /// unconditional branch or return is unreachable, so such a block
    /// never falls through.
    fn fall_through_target(method: &Method, block: BlockId) -> Option<BlockId> {
        let bb = method.try_block(block)?;
        let leaves = bb.instructions().iter().any(|id| {
            let instr = method.instruction(*id);
            instr.is_unconditional_branch() || matches!(instr.kind, InstrKind::Return)
        });
        if leaves {
            return None;
        }
        method.next_block(block)
    }

    fn update_fall_through(&mut self, method: &Method, block: BlockId) {
        let node = self.ensure_node(block);
        for edge in self.outgoing(node) {
            self.graph[edge].fall_through = false;
        }
        if let Some(next) = Self::fall_through_target(method, block) {
            self.edge_entry(block, next).fall_through = true;
        }
        for edge in self.outgoing(node) {
            if self.graph[edge].is_dead() {
                self.graph.remove_edge(edge);
            }
        }
    }

    /// Recompute every outgoing edge of `block`.
    pub(crate) fn refresh_block(&mut self, method: &Method, block: BlockId) {
        let node = self.ensure_node(block);
        for edge in self.outgoing(node) {
            self.graph.remove_edge(edge);
        }
        let Some(bb) = method.try_block(block) else {
            return;
        };
        for id in bb.instructions() {
            let target = method
                .instruction(*id)
                .branch_target()
                .and_then(|label| method.find_block_by_label(label));
            if let Some(target) = target {
                self.edge_entry(block, target).branches.insert(*id);
            }
        }
        self.update_fall_through(method, block);
    }

    /// A block was inserted: add its node and edges, the edges of branches
    /// already targeting its label and the fall-through of the block
    /// before it.
    pub(crate) fn add_block(&mut self, method: &Method, block: BlockId) {
        self.ensure_node(block);
        self.refresh_block(method, block);
        if let Some(previous) = method.previous_block(block) {
            self.update_fall_through(method, previous);
        }
        let label = method.block(block).label();
        for reader in method.local(label).readers() {
            if method.instruction(reader).branch_target() != Some(label) {
                continue;
            }
            if let Some(owner) = method.owner(reader) {
                self.edge_entry(owner, block).branches.insert(reader);
            }
        }
    }

    pub(crate) fn remove_block(&mut self, block: BlockId) {
        if let Some(node) = self.nodes.remove(&block) {
            self.graph.remove_node(node);
        }
    }

    /// A branch (or return) was inserted into `block`.
    pub(crate) fn add_branch(&mut self, method: &Method, block: BlockId, branch: InstrId) {
        let target = method
            .try_instruction(branch)
            .and_then(|i| i.branch_target())
            .and_then(|label| method.find_block_by_label(label));
        if let Some(target) = target {
            self.edge_entry(block, target).branches.insert(branch);
        }
        self.update_fall_through(method, block);
    }

    /// A branch (or return) was removed from `block`.
    pub(crate) fn remove_branch(&mut self, method: &Method, block: BlockId, branch: InstrId) {
        let node = self.ensure_node(block);
        for edge in self.outgoing(node) {
            self.graph[edge].branches.remove(&branch);
        }
        self.update_fall_through(method, block);
    }

    // ─── Queries ──────────────────────────────────────────────────

    pub fn num_blocks(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.neighbors(block, Direction::Outgoing)
    }

    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.neighbors(block, Direction::Incoming)
    }

    fn neighbors(&self, block: BlockId, direction: Direction) -> Vec<BlockId> {
        let Some(node) = self.nodes.get(&block) else {
            return Vec::new();
        };
        let mut blocks: Vec<BlockId> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n])
            .collect();
        blocks.sort();
        blocks
    }

    pub fn edge(&self, from: BlockId, to: BlockId) -> Option<&CfgEdge> {
        let (a, b) = (self.nodes.get(&from)?, self.nodes.get(&to)?);
        self.graph.find_edge(*a, *b).map(|e| &self.graph[e])
    }

    /// All edges, sorted by source and target block.
    pub fn edge_list(&self) -> Vec<(BlockId, BlockId, CfgEdge)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| (self.graph[e.source()], self.graph[e.target()], e.weight().clone()))
            .collect();
        edges.sort_by_key(|(from, to, _)| (*from, *to));
        edges
    }

    /// Same blocks and same edges.
    pub fn is_equivalent(&self, other: &ControlFlowGraph) -> bool {
        let mut mine: Vec<BlockId> = self.nodes.keys().copied().collect();
        let mut theirs: Vec<BlockId> = other.nodes.keys().copied().collect();
        mine.sort();
        theirs.sort();
        mine == theirs && self.edge_list() == other.edge_list()
    }

    pub fn is_reachable(&self, from: BlockId, to: BlockId) -> bool {
        match (self.nodes.get(&from), self.nodes.get(&to)) {
            (Some(a), Some(b)) => algo::has_path_connecting(&self.graph, *a, *b, None),
            _ => false,
        }
    }

    pub fn has_loops(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }
}
