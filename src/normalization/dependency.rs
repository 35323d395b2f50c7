//! Can a memory object carry data from one work-item to another?
//!
//! Work-items only interfere if one of them reads what another one wrote.
//! Objects which are never written, or of which every QPU has its own
//! copy, never do. For all others every access must be provably disjoint
//! between work-items: its address offsets have to be the work-item id
//! itself, or the id multiplied by a factor at least as large as the
//! number of elements touched per access.

use log::debug;

use super::memory::{MemoryAccessRange, MemoryAccessType, MemoryInfo};
use crate::ir::{Decorations, InstrKind, LocalKind, MemoryOp, Method, OpCode, Value};

fn is_item_id(decorations: Decorations) -> bool {
    decorations.contains(Decorations::BUILTIN_LOCAL_ID) || decorations.contains(Decorations::BUILTIN_GLOBAL_ID)
}

fn decorations_of(method: &Method, value: &Value) -> Decorations {
    value
        .as_local()
        .and_then(|id| method.local(id).single_writer())
        .map_or(Decorations::NONE, |w| method.instruction(w).decorations)
}

/// Per-item factor of `value`, if it is the work-item id multiplied (or
/// shifted left) by a constant.
fn id_factor(method: &Method, value: &Value) -> Option<u32> {
    let writer = method.local(value.as_local()?).single_writer()?;
    let InstrKind::Operation { op, args, .. } = &method.instruction(writer).kind else {
        return None;
    };
    if !matches!(op, OpCode::Mul | OpCode::Mul24 | OpCode::Shl) || args.len() != 2 {
        return None;
    }
    let left_is_id = is_item_id(decorations_of(method, &args[0]));
    let right_is_id = is_item_id(decorations_of(method, &args[1]));
    if left_is_id == right_is_id {
        return None;
    }
    let constant = if left_is_id { &args[1] } else { &args[0] };
    let constant = method.evaluate_value(constant, 3)?.unsigned();
    if *op == OpCode::Shl {
        1u32.checked_shl(constant)
    } else {
        Some(constant)
    }
}

/// Whether every dynamic offset of `range` is derived from the work-item
/// id. Narrows `min_factor` and widens `max_size` on the way.
fn addresses_derive_from_item_id(
    method: &Method,
    object_width: u32,
    range: &MemoryAccessRange,
    min_factor: &mut u32,
    max_size: &mut u32,
) -> bool {
    // No dynamic parts means every work-item hits the same address, or the
    // parts were not found. Both are treated as shared.
    !range.dynamic_parts.is_empty()
        && range.dynamic_parts.iter().all(|(part, decorations)| {
            if is_item_id(*decorations) {
                // the id offsets by whole elements of the object
                *min_factor = (*min_factor).min(object_width);
                *max_size = (*max_size).max(object_width);
                return true;
            }
            if !matches!(range.op, MemoryOp::Read | MemoryOp::Write) {
                return false;
            }
            match id_factor(method, part) {
                Some(factor) => {
                    *min_factor = (*min_factor).min(factor);
                    *max_size = (*max_size).max(range.access_width as u32);
                    true
                }
                None => false,
            }
        })
}

/// Whether accesses to the object may let work-items see each other's
/// writes. Answers `true` whenever that cannot be ruled out.
pub fn may_have_cross_item_dependency(method: &Method, info: &MemoryInfo) -> bool {
    let object = method.local(info.object);
    let constant = match &object.kind {
        LocalKind::Global { constant } => *constant,
        LocalKind::Parameter(param) => param.read_only,
        _ => false,
    };
    if constant {
        return false;
    }
    match info.access {
        MemoryAccessType::RamLoadTmu
        | MemoryAccessType::RegisterReadOnly
        | MemoryAccessType::RegisterReadWrite
        | MemoryAccessType::ScratchpadPerQpu => return false,
        MemoryAccessType::ScratchpadShared
        | MemoryAccessType::ScratchpadCached
        | MemoryAccessType::RamReadWriteDma => {}
    }

    if let Some(ranges) = &info.ranges {
        let object_width = object
            .ty
            .pointer()
            .map_or(1, |p| p.element.vector_width() as u32);
        let mut min_factor = u32::MAX;
        let mut max_size = 0u32;
        let disjoint = ranges.iter().all(|range| {
            addresses_derive_from_item_id(method, object_width, range, &mut min_factor, &mut max_size)
        });
        if disjoint && max_size <= min_factor {
            return false;
        }
    }
    debug!(
        "Memory access might have cross work-item data dependency: {} ({:?})",
        object.name, info.access
    );
    true
}
