//! Normalization: lowering memory accesses and resolving addresses.
//!
//! Runs once per method before the optimizer. Memory objects are
//! classified and their accesses rewritten first, since that decides
//! which stack allocations stay in memory. Afterwards the stack frame is
//! laid out and every remaining pointer to a global or a stack allocation
//! is turned into an address computation.

use log::{debug, info};
use rustc_hash::FxHashSet;

use crate::config::Configuration;
use crate::diagnostic::CompileResult;
use crate::ir::types::{TYPE_INT32, TYPE_INT8};
use crate::ir::{
    BuiltinKind, InstrKind, Instruction, InstructionWalker, LocalData, LocalId, Method, OpCode,
    Register, UseRole, Value,
};
use crate::module::Module;
use crate::periphery::Scratchpad;

pub(crate) mod dependency;
pub(crate) mod memory;
#[cfg(test)]
mod tests;

pub use dependency::may_have_cross_item_dependency;
pub use memory::{map_memory_access, MemoryAccessRange, MemoryAccessType, MemoryInfo};

/// Instructions a local's uses must stay within to keep it out of the
/// spill candidates.
pub const SPILL_THRESHOLD: usize = 128;

/// Run every normalization step on one method.
pub fn normalize(module: &Module, method: &mut Method, config: &Configuration) -> CompileResult<()> {
    if method.scratchpad.capacity_rows() == 0 {
        method.scratchpad = Scratchpad::new(config.available_scratchpad_size);
    }
    map_memory_access(module, method, config)?;

    let base = method.stack_base_offset(module.global_data_size());
    method.calculate_stack_offsets(base);

    let Some(mut it) = method.walk_all() else {
        return Ok(());
    };
    while !it.is_end_of_method(method) {
        if !it.is_start_of_block() && it.get(method).is_some() {
            it = resolve_stack_allocation(module, method, it, config)?;
            if it.get(method).is_some_and(|i| !i.is_label()) {
                it = access_global_data(module, method, it, config)?;
            }
        }
        it = it.next_in_method(method);
    }
    spill_locals(module, method, config);
    method.clean_empty_instructions();
    Ok(())
}

fn global_offset(module: &Module, method: &Method, value: &Value) -> Option<u32> {
    let local = method.local(value.as_local()?);
    if !local.is_global() {
        return None;
    }
    module.global_data_offset(Some(&local.name))
}

/// Replace pointers to globals with the global-data address plus the
/// offset of the global inside the segment.
///
/// Returns the position of the rewritten instruction.
pub fn access_global_data(
    module: &Module,
    method: &mut Method,
    it: InstructionWalker,
    _config: &Configuration,
) -> CompileResult<InstructionWalker> {
    let Some(instr) = it.get(method) else {
        return Ok(it);
    };
    let mut globals: Vec<(Value, u32)> = Vec::new();
    for arg in instr.args() {
        if let Some(offset) = global_offset(module, method, arg) {
            if !globals.iter().any(|(v, _)| v == arg) {
                globals.push((arg.clone(), offset));
            }
        }
    }
    if globals.is_empty() {
        return Ok(it);
    }
    debug!("Replacing access to global data: {}", instr.display(method));
    let mut it = it;
    for (global, offset) in globals {
        let base = method.find_or_create_builtin(BuiltinKind::GlobalDataAddress);
        let base = method.local_value(base);
        let address = if offset == 0 {
            base
        } else {
            let tmp = method.add_new_local(TYPE_INT32, "%global_data_offset", "");
            it = it
                .emplace(method, Instruction::op(OpCode::Add, tmp.clone(), base, Value::uint(offset)))
                .next_in_block();
            tmp
        };
        it.modify(method, |i| i.replace_value(&global, &address, UseRole::Reader));
    }
    Ok(it)
}

/// Replace pointers to stack allocations with their address in the
/// per-processor stack frames behind the global data, and drop lifetime
/// markers.
///
/// The frames are laid out as `| frame of QPU 0 | frame of QPU 1 | ...`,
/// so an allocation lives at
/// `qpu_num * frame size + global-data address + (frame base + offset)`.
/// If every allocation is lowered and there are no globals, all stack
/// pointers become 0.
pub fn resolve_stack_allocation(
    module: &Module,
    method: &mut Method,
    it: InstructionWalker,
    _config: &Configuration,
) -> CompileResult<InstructionWalker> {
    let Some(instr) = it.get(method) else {
        return Ok(it);
    };
    let allocations: Vec<(Value, LocalId)> = instr
        .args()
        .into_iter()
        .filter_map(|arg| {
            let id = arg.as_local()?;
            let local = method.local(id);
            (local.ty.pointer().is_some() && local.stack_allocation().is_some()).then(|| (arg.clone(), id))
        })
        .collect();
    if allocations.is_empty() {
        return Ok(it);
    }
    if matches!(instr.kind, InstrKind::Lifetime { .. }) {
        debug!("Dropping life-time instruction for stack-allocation: {}", instr.display(method));
        return Ok(it.erase(method).previous_in_block());
    }

    let text = instr.display(method).to_string();
    let base_offset = method.stack_base_offset(module.global_data_size());
    let frame_size = method.stack_frame_size();
    let mut it = it;
    for (pointer, id) in allocations {
        let Some(alloc) = method.local(id).stack_allocation().cloned() else {
            continue;
        };
        if base_offset == 0 && frame_size == 0 && alloc.is_lowered {
            it.modify(method, |i| i.replace_value(&pointer, &Value::int(0), UseRole::Reader));
            continue;
        }
        debug!("Replacing access to stack allocated data: {}", text);
        let ty = pointer.ty().clone();
        let qpu_offset = method.add_new_local(TYPE_INT32, "%stack_offset", "");
        let qpu = Value::register(Register::QpuNumber, TYPE_INT8);
        it = it
            .emplace(
                method,
                Instruction::op(OpCode::Mul24, qpu_offset.clone(), qpu, Value::uint(frame_size)),
            )
            .next_in_block();
        let frame = method.add_new_local(ty.clone(), "%stack_addr", "");
        let global_data = method.find_or_create_builtin(BuiltinKind::GlobalDataAddress);
        let global_data = method.local_value(global_data);
        it = it
            .emplace(method, Instruction::op(OpCode::Add, frame.clone(), qpu_offset, global_data))
            .next_in_block();
        let address = method.add_new_local(ty, "%stack_addr", "");
        it = it
            .emplace(
                method,
                Instruction::op(
                    OpCode::Add,
                    address.clone(),
                    frame,
                    Value::uint(alloc.offset + base_offset),
                ),
            )
            .next_in_block();
        if let Some(local) = address.as_local() {
            method.local_mut(local).data = LocalData::Reference { base: id, index: None };
        }
        it.modify(method, |i| i.replace_value(&pointer, &address, UseRole::Reader));
    }
    Ok(it)
}

/// Select locals which could be spilled to memory.
///
/// Candidates are locals written at most once and read at all, or written
/// and read exactly once. A candidate whose uses all lie within
/// `SPILL_THRESHOLD` instructions of its writer is more likely to stay
/// in a register and is dropped. Nothing is spilled yet, the candidates
/// are only reported.
pub fn spill_locals(_module: &Module, method: &Method, _config: &Configuration) -> Vec<LocalId> {
    let mut candidates: FxHashSet<LocalId> = method
        .locals()
        .filter(|(_, local)| !local.is_label() && !local.resides_in_memory())
        .filter(|(_, local)| {
            let (writes, reads) = (local.count_writers(), local.count_readers());
            (writes <= 1 && reads > 0) || (writes >= 1 && reads == 1)
        })
        .map(|(id, _)| id)
        .collect();

    let Some(mut it) = method.walk_all() else {
        return Vec::new();
    };
    // skip leading empty blocks
    while !it.is_end_of_method(method) && it.get(method).is_some_and(|i| i.is_label()) {
        it = it.next_in_method(method);
    }
    // locals never written yet (parameters) only have to be limited from
    // the start of the kernel
    let start = it;
    candidates.retain(|id| {
        method.local(*id).count_writers() > 0 || !method.is_locally_limited(start, *id, SPILL_THRESHOLD)
    });
    while !it.is_end_of_method(method) && !candidates.is_empty() {
        if let Some(out) = it.get(method).and_then(|i| i.output_local()) {
            if candidates.contains(&out) && method.is_locally_limited(it, out, SPILL_THRESHOLD) {
                candidates.remove(&out);
            }
        }
        it = it.next_in_method(method);
    }

    let mut result: Vec<LocalId> = candidates.into_iter().collect();
    result.sort();
    for id in &result {
        let local = method.local(*id);
        debug!(
            "Spilling candidate: {} ({} writes, {} reads)",
            local.name,
            local.count_writers(),
            local.count_readers()
        );
    }
    if !result.is_empty() {
        info!("Method {} has {} spilling candidates", method.name, result.len());
    }
    result
}
