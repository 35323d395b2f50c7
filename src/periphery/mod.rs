//! Hardware peripherals as far as the middle-end needs them: the layout of
//! the shared scratchpad (VPM) and constant evaluation of the
//! special-function unit.

use log::debug;

use crate::ir::{LocalId, Literal, Register, NUM_QPUS};

// ─── Scratchpad ───────────────────────────────────────────────────

/// Bytes per scratchpad row: 16 lanes of 32 bit.
pub const SCRATCHPAD_ROW_BYTES: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScratchpadUsage {
    /// Spilled values and temporary data.
    Scratch,
    /// A per-work-item private object, one copy per processing unit.
    PrivateLowered,
    /// An object shared by the work-group, lowered completely.
    SharedLowered,
    /// A copy of external memory, synchronized before and after the kernel.
    Cache,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchpadArea {
    pub usage: ScratchpadUsage,
    pub base_row: u32,
    pub num_rows: u32,
    /// The memory object stored in this area.
    pub object: Option<LocalId>,
}

/// Row-granular bookkeeping of the scratchpad.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scratchpad {
    capacity_rows: u32,
    areas: Vec<ScratchpadArea>,
}

impl Scratchpad {
    pub fn new(size_bytes: u32) -> Self {
        Self {
            capacity_rows: size_bytes / SCRATCHPAD_ROW_BYTES,
            areas: Vec::new(),
        }
    }

    pub fn capacity_rows(&self) -> u32 {
        self.capacity_rows
    }

    pub fn used_rows(&self) -> u32 {
        self.areas.iter().map(|a| a.num_rows).sum()
    }

    pub fn free_rows(&self) -> u32 {
        self.capacity_rows.saturating_sub(self.used_rows())
    }

    /// Rows an object of `size_bytes` needs for the given usage.
    pub fn rows_for(usage: ScratchpadUsage, size_bytes: u32) -> u32 {
        let total = match usage {
            ScratchpadUsage::PrivateLowered => size_bytes * NUM_QPUS,
            _ => size_bytes,
        };
        total.div_ceil(SCRATCHPAD_ROW_BYTES).max(1)
    }

    /// Reserve an area. Returns its index, `None` if it does not fit.
    pub fn add_area(&mut self, usage: ScratchpadUsage, object: Option<LocalId>, size_bytes: u32) -> Option<usize> {
        let num_rows = Self::rows_for(usage, size_bytes);
        if num_rows > self.free_rows() {
            return None;
        }
        let base_row = self.used_rows();
        self.areas.push(ScratchpadArea {
            usage,
            base_row,
            num_rows,
            object,
        });
        Some(self.areas.len() - 1)
    }

    pub fn area(&self, index: usize) -> Option<&ScratchpadArea> {
        self.areas.get(index)
    }

    pub fn areas(&self) -> &[ScratchpadArea] {
        &self.areas
    }

    pub fn find_area(&self, object: LocalId) -> Option<usize> {
        self.areas.iter().position(|a| a.object == Some(object))
    }

    /// Rows consumed by spill and cache areas.
    pub fn scratch_area_rows(&self) -> u32 {
        self.areas
            .iter()
            .filter(|a| matches!(a.usage, ScratchpadUsage::Scratch | ScratchpadUsage::Cache))
            .map(|a| a.num_rows)
            .sum()
    }

    pub fn dump_usage(&self) {
        debug!(
            "Scratchpad usage: {} of {} rows",
            self.used_rows(),
            self.capacity_rows
        );
        for area in &self.areas {
            debug!(
                "    rows {}..{}: {:?}",
                area.base_row,
                area.base_row + area.num_rows,
                area.usage
            );
        }
    }
}

// ─── Special function unit ────────────────────────────────────────

/// Delay placeholders between an SFU trigger and reading its result.
pub const SFU_DELAY_NOPS: usize = 2;

/// Result of writing `input` into the SFU trigger register `reg`.
pub fn precalculate_sfu(reg: Register, input: Literal) -> Option<Literal> {
    let x = input.real_value();
    let result = match reg {
        Register::SfuRecip => 1.0 / x,
        Register::SfuRsqrt => 1.0 / x.sqrt(),
        Register::SfuExp2 => x.exp2(),
        Register::SfuLog2 => x.log2(),
        _ => return None,
    };
    Some(Literal::real(result))
}
