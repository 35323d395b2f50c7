//! Locals: named storage slots with live use tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::instruction::InstrId;
use super::types::{DataType, TYPE_INT32};
use crate::diagnostic::{CompilationError, CompileResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub(crate) u32);

impl LocalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.0)
    }
}

// ─── Use records ──────────────────────────────────────────────────

/// How one instruction uses a local. An instruction may read the same
/// local twice (`add %a, %a`), so both roles are counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalUse {
    pub reads: u8,
    pub writes: u8,
}

impl LocalUse {
    pub const READ: LocalUse = LocalUse { reads: 1, writes: 0 };
    pub const WRITE: LocalUse = LocalUse { reads: 0, writes: 1 };

    pub fn is_reader(self) -> bool {
        self.reads > 0
    }

    pub fn is_writer(self) -> bool {
        self.writes > 0
    }

    pub fn merge(&mut self, other: LocalUse) {
        self.reads += other.reads;
        self.writes += other.writes;
    }
}

// ─── Builtins ─────────────────────────────────────────────────────

/// Implicit kernel inputs, materialized as locals on first request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    WorkDimensions,
    LocalSizes,
    LocalIds,
    NumGroupsX,
    NumGroupsY,
    NumGroupsZ,
    GroupIdX,
    GroupIdY,
    GroupIdZ,
    /// Vector of the three group ids.
    GroupIds,
    GlobalOffsetX,
    GlobalOffsetY,
    GlobalOffsetZ,
    GlobalDataAddress,
    UniformAddress,
    MaxGroupIdX,
    MaxGroupIdY,
    MaxGroupIdZ,
}

impl BuiltinKind {
    pub const COUNT: usize = 18;

    pub const ALL: [BuiltinKind; Self::COUNT] = [
        BuiltinKind::WorkDimensions,
        BuiltinKind::LocalSizes,
        BuiltinKind::LocalIds,
        BuiltinKind::NumGroupsX,
        BuiltinKind::NumGroupsY,
        BuiltinKind::NumGroupsZ,
        BuiltinKind::GroupIdX,
        BuiltinKind::GroupIdY,
        BuiltinKind::GroupIdZ,
        BuiltinKind::GroupIds,
        BuiltinKind::GlobalOffsetX,
        BuiltinKind::GlobalOffsetY,
        BuiltinKind::GlobalOffsetZ,
        BuiltinKind::GlobalDataAddress,
        BuiltinKind::UniformAddress,
        BuiltinKind::MaxGroupIdX,
        BuiltinKind::MaxGroupIdY,
        BuiltinKind::MaxGroupIdZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn local_name(self) -> &'static str {
        match self {
            BuiltinKind::WorkDimensions => "%work_dim",
            BuiltinKind::LocalSizes => "%local_sizes",
            BuiltinKind::LocalIds => "%local_ids",
            BuiltinKind::NumGroupsX => "%num_groups_x",
            BuiltinKind::NumGroupsY => "%num_groups_y",
            BuiltinKind::NumGroupsZ => "%num_groups_z",
            BuiltinKind::GroupIdX => "%group_id_x",
            BuiltinKind::GroupIdY => "%group_id_y",
            BuiltinKind::GroupIdZ => "%group_id_z",
            BuiltinKind::GroupIds => "%group_ids",
            BuiltinKind::GlobalOffsetX => "%global_offset_x",
            BuiltinKind::GlobalOffsetY => "%global_offset_y",
            BuiltinKind::GlobalOffsetZ => "%global_offset_z",
            BuiltinKind::GlobalDataAddress => "%global_data_address",
            BuiltinKind::UniformAddress => "%uniform_address",
            BuiltinKind::MaxGroupIdX => "%max_group_id_x",
            BuiltinKind::MaxGroupIdY => "%max_group_id_y",
            BuiltinKind::MaxGroupIdZ => "%max_group_id_z",
        }
    }

    pub fn data_type(self) -> DataType {
        match self {
            BuiltinKind::GroupIds => TYPE_INT32.to_vector(3),
            _ => TYPE_INT32,
        }
    }
}

impl TryFrom<u8> for BuiltinKind {
    type Error = CompilationError;

    fn try_from(index: u8) -> CompileResult<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| CompilationError::general("Unhandled built-in type").with_context(index.to_string()))
    }
}

// ─── Local kinds ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterInfo {
    pub read_only: bool,
    /// Highest byte offset ever accessed, if known.
    pub max_byte_offset: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackAllocation {
    pub size: u32,
    pub alignment: u32,
    /// Offset from the stack frame base. Assigned by the stack layout.
    pub offset: u32,
    /// Promoted into registers or scratchpad, not part of the in-memory stack.
    pub is_lowered: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalKind {
    Plain,
    Label,
    Parameter(ParameterInfo),
    /// Module-level data in the global data segment.
    Global { constant: bool },
    StackAllocation(StackAllocation),
    Builtin(BuiltinKind),
}

/// Extra data attached to a local.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LocalData {
    #[default]
    None,
    /// A wide value split into two 32-bit halves.
    MultiRegister { lower: LocalId, upper: LocalId },
    /// The local is a pointer into another memory object.
    Reference { base: LocalId, index: Option<i32> },
}

// ─── Local ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Local {
    pub name: String,
    pub ty: DataType,
    pub kind: LocalKind,
    pub data: LocalData,
    users: BTreeMap<InstrId, LocalUse>,
}

impl Local {
    pub(crate) fn new(name: String, ty: DataType, kind: LocalKind) -> Self {
        Self {
            name,
            ty,
            kind,
            data: LocalData::None,
            users: BTreeMap::new(),
        }
    }

    pub fn users(&self) -> &BTreeMap<InstrId, LocalUse> {
        &self.users
    }

    pub fn readers(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.users
            .iter()
            .filter(|(_, u)| u.is_reader())
            .map(|(id, _)| *id)
    }

    pub fn writers(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.users
            .iter()
            .filter(|(_, u)| u.is_writer())
            .map(|(id, _)| *id)
    }

    pub fn count_readers(&self) -> usize {
        self.readers().count()
    }

    pub fn count_writers(&self) -> usize {
        self.writers().count()
    }

    pub fn has_readers(&self) -> bool {
        self.users.values().any(|u| u.is_reader())
    }

    pub fn single_writer(&self) -> Option<InstrId> {
        let mut writers = self.writers();
        match (writers.next(), writers.next()) {
            (Some(w), None) => Some(w),
            _ => None,
        }
    }

    pub fn single_reader(&self) -> Option<InstrId> {
        let mut readers = self.readers();
        match (readers.next(), readers.next()) {
            (Some(r), None) => Some(r),
            _ => None,
        }
    }

    pub(crate) fn add_use(&mut self, instr: InstrId, usage: LocalUse) {
        self.users.entry(instr).or_default().merge(usage);
    }

    pub(crate) fn remove_user(&mut self, instr: InstrId) {
        self.users.remove(&instr);
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, LocalKind::Label)
    }

    pub fn builtin(&self) -> Option<BuiltinKind> {
        match self.kind {
            LocalKind::Builtin(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn stack_allocation(&self) -> Option<&StackAllocation> {
        match &self.kind {
            LocalKind::StackAllocation(alloc) => Some(alloc),
            _ => None,
        }
    }

    pub fn parameter(&self) -> Option<&ParameterInfo> {
        match &self.kind {
            LocalKind::Parameter(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self.kind, LocalKind::Global { .. })
    }

    /// Globals and stack allocations are memory objects themselves.
    pub fn resides_in_memory(&self) -> bool {
        matches!(
            self.kind,
            LocalKind::Global { .. } | LocalKind::StackAllocation(_)
        )
    }
}

// ─── Name generation ──────────────────────────────────────────────

/// Source of unique suffixes for generated local names.
///
/// One generator is shared (behind an `Arc`) by every method of a module,
/// so names stay unique even when methods are compiled in parallel.
#[derive(Debug, Default)]
pub struct NameGenerator {
    next: AtomicUsize,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a local name from a prefix and a postfix.
    ///
    /// * both empty (or prefix `%`): `%tmp.N`
    /// * prefix empty: `%postfix`
    /// * postfix empty: `prefix.N`
    /// * otherwise: `prefix.postfix`
    pub fn create_name(&self, prefix: &str, postfix: &str) -> String {
        let no_prefix = prefix.is_empty() || prefix == "%";
        if no_prefix && postfix.is_empty() {
            format!("%tmp.{}", self.next_index())
        } else if no_prefix {
            if postfix.starts_with('%') {
                postfix.to_string()
            } else {
                format!("%{}", postfix)
            }
        } else if postfix.is_empty() {
            format!("{}.{}", prefix, self.next_index())
        } else {
            format!("{}.{}", prefix, postfix)
        }
    }
}
