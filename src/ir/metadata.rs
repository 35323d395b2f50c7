//! Per-kernel metadata handed to code generation.

use super::local::BuiltinKind;

/// Number of processing units executing work-items in parallel.
pub const NUM_QPUS: u32 = 12;

/// Bit-set of the implicit uniforms the kernel actually reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct KernelUniforms(u32);

impl KernelUniforms {
    pub const WORK_DIMENSIONS: u32 = 1 << 0;
    pub const LOCAL_SIZES: u32 = 1 << 1;
    pub const LOCAL_IDS: u32 = 1 << 2;
    pub const NUM_GROUPS_X: u32 = 1 << 3;
    pub const NUM_GROUPS_Y: u32 = 1 << 4;
    pub const NUM_GROUPS_Z: u32 = 1 << 5;
    pub const GROUP_ID_X: u32 = 1 << 6;
    pub const GROUP_ID_Y: u32 = 1 << 7;
    pub const GROUP_ID_Z: u32 = 1 << 8;
    pub const GLOBAL_OFFSET_X: u32 = 1 << 9;
    pub const GLOBAL_OFFSET_Y: u32 = 1 << 10;
    pub const GLOBAL_OFFSET_Z: u32 = 1 << 11;
    pub const GLOBAL_DATA_ADDRESS: u32 = 1 << 12;
    pub const UNIFORM_ADDRESS: u32 = 1 << 13;
    pub const MAX_GROUP_ID_X: u32 = 1 << 14;
    pub const MAX_GROUP_ID_Y: u32 = 1 << 15;
    pub const MAX_GROUP_ID_Z: u32 = 1 << 16;

    /// The uniform bit a builtin is loaded through. The group-id vector is
    /// assembled from the scalar group ids and has no uniform of its own.
    pub fn bit_for(kind: BuiltinKind) -> Option<u32> {
        let bit = match kind {
            BuiltinKind::WorkDimensions => Self::WORK_DIMENSIONS,
            BuiltinKind::LocalSizes => Self::LOCAL_SIZES,
            BuiltinKind::LocalIds => Self::LOCAL_IDS,
            BuiltinKind::NumGroupsX => Self::NUM_GROUPS_X,
            BuiltinKind::NumGroupsY => Self::NUM_GROUPS_Y,
            BuiltinKind::NumGroupsZ => Self::NUM_GROUPS_Z,
            BuiltinKind::GroupIdX => Self::GROUP_ID_X,
            BuiltinKind::GroupIdY => Self::GROUP_ID_Y,
            BuiltinKind::GroupIdZ => Self::GROUP_ID_Z,
            BuiltinKind::GroupIds => return None,
            BuiltinKind::GlobalOffsetX => Self::GLOBAL_OFFSET_X,
            BuiltinKind::GlobalOffsetY => Self::GLOBAL_OFFSET_Y,
            BuiltinKind::GlobalOffsetZ => Self::GLOBAL_OFFSET_Z,
            BuiltinKind::GlobalDataAddress => Self::GLOBAL_DATA_ADDRESS,
            BuiltinKind::UniformAddress => Self::UNIFORM_ADDRESS,
            BuiltinKind::MaxGroupIdX => Self::MAX_GROUP_ID_X,
            BuiltinKind::MaxGroupIdY => Self::MAX_GROUP_ID_Y,
            BuiltinKind::MaxGroupIdZ => Self::MAX_GROUP_ID_Z,
        };
        Some(bit)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_used(self, kind: BuiltinKind) -> bool {
        Self::bit_for(kind).is_some_and(|bit| self.0 & bit != 0)
    }

    pub fn set_used(&mut self, kind: BuiltinKind, used: bool) {
        if let Some(bit) = Self::bit_for(kind) {
            if used {
                self.0 |= bit;
            } else {
                self.0 &= !bit;
            }
        }
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelMetaData {
    pub uniforms_used: KernelUniforms,
    /// Required work-group size, all zero if not fixed at compile time.
    pub work_group_sizes: [u32; 3],
    pub work_group_size_hints: [u32; 3],
    /// Number of work-items merged into one execution, 0 if not merged.
    pub merged_work_items_factor: u8,
}

impl KernelMetaData {
    pub fn fixed_work_group_size(&self) -> Option<u32> {
        if self.work_group_sizes.iter().any(|&s| s > 0) {
            Some(self.work_group_sizes.iter().map(|&s| s.max(1)).product())
        } else {
            None
        }
    }

    pub fn maximum_work_group_size(&self) -> u32 {
        match self.fixed_work_group_size() {
            Some(size) => size,
            None => NUM_QPUS * u32::from(self.merged_work_items_factor.max(1)),
        }
    }

    /// Maximum number of processing units needed for one work-group.
    pub fn maximum_instances_count(&self) -> u32 {
        let factor = u32::from(self.merged_work_items_factor.max(1));
        match self.fixed_work_group_size() {
            Some(size) => size.div_ceil(factor),
            None => NUM_QPUS,
        }
    }
}
