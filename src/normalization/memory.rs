//! Classification of memory objects and lowering of their accesses.
//!
//! Every object (global, stack allocation or pointer parameter) gets
//! exactly one way of being stored and accessed, the first that applies:
//!
//! 1. constant data small enough for a register is kept in a register,
//! 2. read-only data is loaded through the TMU,
//! 3. private data goes into a register or one scratchpad area per QPU,
//! 4. work-group shared data goes into the scratchpad,
//! 5. read-write data is cached in the scratchpad (if enabled),
//! 6. everything else is transferred by DMA on every access.

use log::{debug, info};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::dependency::may_have_cross_item_dependency;
use crate::config::Configuration;
use crate::diagnostic::{CompilationError, CompileResult};
use crate::ir::types::NATIVE_VECTOR_SIZE;
use crate::ir::{
    AccessPath, AddressSpace, BlockId, Condition, DataType, Decorations, InstrId, InstrKind,
    Instruction, InstructionWalker, Literal, Local, LocalId, LocalKind, MemoryOp, Method, OpCode,
    Register, Value,
};
use crate::module::Module;
use crate::optimization::{Optimizer, CACHE_MEMORY};
use crate::periphery::ScratchpadUsage;

/// Where a memory object lives and how it is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryAccessType {
    /// Constant contents held in a register.
    RegisterReadOnly,
    /// Private object held in a register.
    RegisterReadWrite,
    /// Private object in the scratchpad, one copy per QPU.
    ScratchpadPerQpu,
    /// Object shared by the work-group, in the scratchpad.
    ScratchpadShared,
    /// External memory with a copy in the scratchpad, loaded before and
    /// written back after the kernel.
    ScratchpadCached,
    /// External memory, loaded through the TMU.
    RamLoadTmu,
    /// External memory, every access goes through DMA.
    RamReadWriteDma,
}

/// One access to a memory object.
#[derive(Clone, Debug)]
pub struct MemoryAccessRange {
    pub instr: InstrId,
    pub op: MemoryOp,
    /// Vector width of the value read or written.
    pub access_width: u8,
    /// Non-constant offsets added to the object's address, each with the
    /// decorations of the instruction computing it.
    pub dynamic_parts: Vec<(Value, Decorations)>,
}

#[derive(Clone, Debug)]
pub struct MemoryInfo {
    pub object: LocalId,
    pub access: MemoryAccessType,
    pub area: Option<usize>,
    /// Local holding the contents of a register-lowered object.
    pub register: Option<LocalId>,
    /// Every access to the object. `None` if some address could not be
    /// traced back to the object.
    pub ranges: Option<Vec<MemoryAccessRange>>,
}

// ─── Address tracing ──────────────────────────────────────────────

const TRACE_DEPTH: u32 = 8;

/// Objects a pointer is derived from, and the offsets added on the way.
#[derive(Default)]
struct AddressTrace {
    bases: SmallVec<[LocalId; 2]>,
    /// Locals the trace ended at without reaching a memory object.
    unknown: SmallVec<[LocalId; 2]>,
    parts: Vec<(Value, Decorations)>,
    analyzable: bool,
    /// Some local on the way has several writers, so the pointer may
    /// address one of several objects.
    conditional: bool,
}

fn is_memory_object(local: &Local) -> bool {
    match &local.kind {
        LocalKind::Global { .. } | LocalKind::StackAllocation(_) => true,
        LocalKind::Parameter(_) => local.ty.pointer().is_some(),
        _ => false,
    }
}

fn writer_decorations(method: &Method, value: &Value) -> Decorations {
    value
        .as_local()
        .and_then(|id| method.local(id).single_writer())
        .map_or(Decorations::NONE, |w| method.instruction(w).decorations)
}

fn trace_address(method: &Method, address: &Value) -> AddressTrace {
    let mut trace = AddressTrace {
        analyzable: true,
        ..AddressTrace::default()
    };
    trace_into(method, address, &mut trace, TRACE_DEPTH);
    trace
}

fn trace_into(method: &Method, address: &Value, trace: &mut AddressTrace, depth: u32) {
    let Some(id) = address.as_local() else {
        trace.analyzable = false;
        return;
    };
    let local = method.local(id);
    if is_memory_object(local) {
        if !trace.bases.contains(&id) {
            trace.bases.push(id);
        }
        return;
    }
    let writers: SmallVec<[InstrId; 2]> = local.writers().collect();
    if writers.is_empty() || depth == 0 {
        trace.analyzable = false;
        let base = method.base_local(id);
        if base != id && is_memory_object(method.local(base)) {
            if !trace.bases.contains(&base) {
                trace.bases.push(base);
            }
        } else {
            trace.unknown.push(id);
        }
        return;
    }
    trace.conditional |= writers.len() > 1;
    for writer in writers {
        match &method.instruction(writer).kind {
            InstrKind::Move {
                source,
                rotation: None,
                ..
            } => trace_into(method, source, trace, depth - 1),
            InstrKind::Operation {
                op: OpCode::Add,
                args,
                ..
            } if args.len() == 2 => {
                let (pointer, offset) = if args[0].ty().pointer().is_some() {
                    (&args[0], &args[1])
                } else if args[1].ty().pointer().is_some() {
                    (&args[1], &args[0])
                } else {
                    trace.analyzable = false;
                    trace.unknown.push(id);
                    continue;
                };
                trace_into(method, pointer, trace, depth - 1);
                if !offset.is_literal() {
                    trace.parts.push((offset.clone(), writer_decorations(method, offset)));
                }
            }
            _ => {
                trace.analyzable = false;
                trace.unknown.push(id);
            }
        }
    }
}

/// Element of `object` addressed by `address`, if the address is the
/// object itself or the object plus a single offset.
fn element_index(method: &Method, address: &Value, object: LocalId) -> Option<Value> {
    let id = address.as_local()?;
    if id == object {
        return Some(Value::int(0));
    }
    let writer = method.local(id).single_writer()?;
    match &method.instruction(writer).kind {
        InstrKind::Operation {
            op: OpCode::Add,
            args,
            ..
        } if args.len() == 2 => {
            if args[0].as_local() == Some(object) {
                Some(args[1].clone())
            } else if args[1].as_local() == Some(object) {
                Some(args[0].clone())
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_zero(value: &Value) -> bool {
    value.as_literal() == Some(Literal(0))
}

// ─── Collecting accesses ──────────────────────────────────────────

struct Access {
    instr: InstrId,
    op: MemoryOp,
    /// Objects read from.
    sources: SmallVec<[LocalId; 2]>,
    /// Objects written to.
    destinations: SmallVec<[LocalId; 2]>,
}

struct ObjectUsage {
    reads: bool,
    writes: bool,
    /// Only reads and writes, no copies or fills.
    only_loads_and_stores: bool,
    /// Element index of every access. `None` once an access does not
    /// address the object directly.
    indices: Option<Vec<Value>>,
    ranges: Option<Vec<MemoryAccessRange>>,
}

impl ObjectUsage {
    fn new() -> Self {
        Self {
            reads: false,
            writes: false,
            only_loads_and_stores: true,
            indices: Some(Vec::new()),
            ranges: Some(Vec::new()),
        }
    }
}

/// The address operands of a memory instruction, as (address, is written).
fn address_operands(kind: &InstrKind) -> SmallVec<[(Value, bool); 2]> {
    let InstrKind::Memory {
        op,
        destination,
        source,
        ..
    } = kind
    else {
        return SmallVec::new();
    };
    match op {
        MemoryOp::Read => smallvec::smallvec![(source.clone(), false)],
        MemoryOp::Write | MemoryOp::Fill => smallvec::smallvec![(destination.clone(), true)],
        MemoryOp::Copy => smallvec::smallvec![(source.clone(), false), (destination.clone(), true)],
    }
}

fn access_width(kind: &InstrKind, address: &Value) -> u8 {
    match kind {
        InstrKind::Memory {
            op: MemoryOp::Read,
            destination,
            ..
        } => destination.ty().vector_width(),
        InstrKind::Memory {
            op: MemoryOp::Write,
            source,
            ..
        } => source.ty().vector_width(),
        _ => address.ty().pointer().map_or(1, |p| p.element.vector_width()),
    }
}

struct Collected {
    accesses: Vec<Access>,
    objects: Vec<LocalId>,
    usages: FxHashMap<LocalId, ObjectUsage>,
}

fn collect_accesses(method: &Method) -> CompileResult<Collected> {
    let mut memory_instructions: Vec<InstrId> = Vec::new();
    method.for_all_instructions(|id, instr| {
        if matches!(instr.kind, InstrKind::Memory { .. }) {
            memory_instructions.push(id);
        }
    });

    let mut collected = Collected {
        accesses: Vec::new(),
        objects: Vec::new(),
        usages: FxHashMap::default(),
    };
    for id in memory_instructions {
        let instr = method.instruction(id);
        let InstrKind::Memory { op, .. } = instr.kind else {
            continue;
        };
        let mut access = Access {
            instr: id,
            op,
            sources: SmallVec::new(),
            destinations: SmallVec::new(),
        };
        for (address, written) in address_operands(&instr.kind) {
            let trace = trace_address(method, &address);
            if trace.conditional {
                if let Some(unknown) = trace.unknown.first() {
                    return Err(CompilationError::normalizer(
                        "Memory info for conditionally addressed memory location not found",
                    )
                    .with_context(method.local_name(*unknown).to_string()));
                }
            }
            for base in &trace.bases {
                if !collected.usages.contains_key(base) {
                    collected.objects.push(*base);
                }
                let usage = collected.usages.entry(*base).or_insert_with(ObjectUsage::new);
                usage.reads |= !written;
                usage.writes |= written;
                usage.only_loads_and_stores &= matches!(op, MemoryOp::Read | MemoryOp::Write);
                let index = element_index(method, &address, *base).filter(|_| !trace.conditional);
                match (usage.indices.as_mut(), index) {
                    (Some(indices), Some(index)) => indices.push(index),
                    _ => usage.indices = None,
                }
                if !trace.analyzable {
                    usage.ranges = None;
                }
                if let Some(ranges) = usage.ranges.as_mut() {
                    ranges.push(MemoryAccessRange {
                        instr: id,
                        op,
                        access_width: access_width(&instr.kind, &address),
                        dynamic_parts: trace.parts.clone(),
                    });
                }
            }
            if written {
                access.destinations.extend(trace.bases.iter().copied());
            } else {
                access.sources.extend(trace.bases.iter().copied());
            }
        }
        collected.accesses.push(access);
    }
    Ok(collected)
}

// ─── Classification ───────────────────────────────────────────────

fn pointee(local: &Local) -> Option<DataType> {
    local.ty.pointer().map(|p| p.element.clone())
}

fn object_size(module: &Module, local: &Local) -> Option<u32> {
    match &local.kind {
        LocalKind::StackAllocation(alloc) => Some(alloc.size),
        LocalKind::Global { .. } => module.find_global(&local.name).map(|g| g.ty.in_memory_size()),
        LocalKind::Parameter(info) => info.max_byte_offset.map(|o| o + 1),
        _ => None,
    }
}

fn address_space(local: &Local) -> Option<AddressSpace> {
    local.ty.pointer().map(|p| p.space)
}

/// Contents of a constant global which fit into one register, with the
/// type of that register.
fn register_contents(module: &Module, local: &Local) -> Option<(Vec<Literal>, DataType)> {
    if !local.is_global() {
        return None;
    }
    let global = module.find_global(&local.name)?;
    let scalar = global.ty.element_type();
    if !scalar.is_scalar() || scalar.vector_width() != 1 {
        return None;
    }
    let contents = match &global.initializer {
        Some(values) if !values.is_empty() => values.clone(),
        Some(_) => return None,
        None => {
            let count = global.ty.in_memory_size() / scalar.in_memory_size().max(1);
            vec![Literal(0); count.max(1) as usize]
        }
    };
    if contents.len() > NATIVE_VECTOR_SIZE as usize {
        return None;
    }
    let ty = if contents.len() > 1 {
        scalar.to_vector(contents.len() as u8)
    } else {
        scalar
    };
    Some((contents, ty))
}

struct Classification {
    access: MemoryAccessType,
    area: Option<usize>,
    register: Option<DataType>,
    contents: Option<Vec<Literal>>,
}

impl Classification {
    fn new(access: MemoryAccessType) -> Self {
        Self {
            access,
            area: None,
            register: None,
            contents: None,
        }
    }

    fn in_area(access: MemoryAccessType, area: usize) -> Self {
        Self {
            area: Some(area),
            ..Self::new(access)
        }
    }
}

fn classify(
    module: &Module,
    method: &mut Method,
    object: LocalId,
    usage: &ObjectUsage,
    allow_caching: bool,
    config: &Configuration,
) -> Classification {
    let local = method.local(object);
    let size = object_size(module, local);
    let limit = config.additional_options.register_lowering_limit_bytes;
    let indexable = usage.only_loads_and_stores && usage.indices.is_some();
    let fits_register = size.is_some_and(|s| s <= limit);

    if !usage.writes && indexable && fits_register {
        if let Some((contents, ty)) = register_contents(module, local) {
            return Classification {
                register: Some(ty),
                contents: Some(contents),
                ..Classification::new(MemoryAccessType::RegisterReadOnly)
            };
        }
    }
    if !usage.writes {
        return Classification::new(MemoryAccessType::RamLoadTmu);
    }

    let is_private = local.stack_allocation().is_some() || address_space(local) == Some(AddressSpace::Private);
    if is_private {
        let whole_object = usage
            .indices
            .as_ref()
            .is_some_and(|indices| indices.iter().all(is_zero));
        let register = pointee(local).filter(|ty| ty.is_scalar());
        if indexable && whole_object && fits_register {
            if let Some(ty) = register {
                return Classification {
                    register: Some(ty),
                    ..Classification::new(MemoryAccessType::RegisterReadWrite)
                };
            }
        }
        if let Some(size) = size {
            if let Some(area) = method
                .scratchpad
                .add_area(ScratchpadUsage::PrivateLowered, Some(object), size)
            {
                return Classification::in_area(MemoryAccessType::ScratchpadPerQpu, area);
            }
        }
        return Classification::new(MemoryAccessType::RamReadWriteDma);
    }

    let Some(size) = size else {
        return Classification::new(MemoryAccessType::RamReadWriteDma);
    };
    if address_space(method.local(object)) == Some(AddressSpace::Local) {
        if let Some(area) = method
            .scratchpad
            .add_area(ScratchpadUsage::SharedLowered, Some(object), size)
        {
            return Classification::in_area(MemoryAccessType::ScratchpadShared, area);
        }
    }
    if allow_caching {
        if let Some(area) = method.scratchpad.add_area(ScratchpadUsage::Cache, Some(object), size) {
            return Classification::in_area(MemoryAccessType::ScratchpadCached, area);
        }
    }
    Classification::new(MemoryAccessType::RamReadWriteDma)
}

fn object_kind_name(local: &Local) -> &'static str {
    match local.kind {
        LocalKind::Parameter(_) => "Parameter",
        LocalKind::StackAllocation(_) => "Stack variable",
        LocalKind::Global { .. } => "Global",
        _ => "Local",
    }
}

// ─── Lowering ─────────────────────────────────────────────────────

/// Decide where every memory object lives and rewrite the accesses.
///
/// Accesses to register-lowered objects become moves (reads of a
/// constant element rotate the element into the first lane), all others
/// are tagged with their access path. Objects cached in the scratchpad
/// get a preload copy at the start of the kernel and, if written, a
/// write-back copy at its end. If no object can create a data dependency
/// between work-items, the method is marked as not needing
/// synchronization across them.
pub fn map_memory_access(
    module: &Module,
    method: &mut Method,
    config: &Configuration,
) -> CompileResult<Vec<MemoryInfo>> {
    let collected = collect_accesses(method)?;
    let allow_caching = Optimizer::is_enabled(CACHE_MEMORY, config);

    let mut infos: FxHashMap<LocalId, MemoryInfo> = FxHashMap::default();
    let mut initializers: Vec<(LocalId, Vec<Literal>)> = Vec::new();
    for object in &collected.objects {
        let Some(usage) = collected.usages.get(object) else {
            continue;
        };
        let class = classify(module, method, *object, usage, allow_caching, config);
        let register = class.register.and_then(|ty| {
            let name = method.local_name(*object).to_string();
            method.add_new_local(ty, &name, "register").as_local()
        });
        if let (Some(register), Some(contents)) = (register, class.contents) {
            initializers.push((register, contents));
        }
        if let LocalKind::StackAllocation(alloc) = &mut method.local_mut(*object).kind {
            alloc.is_lowered = matches!(
                class.access,
                MemoryAccessType::RegisterReadWrite | MemoryAccessType::ScratchpadPerQpu
            );
        }
        let local = method.local(*object);
        debug!(
            "{} '{}' will be mapped to: {:?}",
            object_kind_name(local),
            local.name,
            class.access
        );
        infos.insert(
            *object,
            MemoryInfo {
                object: *object,
                access: class.access,
                area: class.area,
                register,
                ranges: usage.ranges.clone(),
            },
        );
    }

    method.cross_item_synchronization_free = !collected
        .objects
        .iter()
        .filter_map(|o| infos.get(o))
        .any(|info| may_have_cross_item_dependency(method, info));

    for access in &collected.accesses {
        lower_access(method, access, &infos)?;
    }
    insert_register_initializers(method, &initializers);
    insert_cache_synchronization(module, method, &collected, &infos);

    method.scratchpad.dump_usage();
    info!(
        "Memory of {} mapped, {} scratchpad rows used for caching",
        method.name,
        method.scratchpad.scratch_area_rows()
    );
    method.clean_empty_instructions();
    Ok(collected
        .objects
        .iter()
        .filter_map(|o| infos.remove(o))
        .collect())
}

fn access_path(op: MemoryOp, sources: &[&MemoryInfo], destinations: &[&MemoryInfo]) -> AccessPath {
    if op == MemoryOp::Read
        && !sources.is_empty()
        && sources.iter().all(|i| i.access == MemoryAccessType::RamLoadTmu)
    {
        return AccessPath::Tmu;
    }
    let external = |info: &MemoryInfo| {
        matches!(
            info.access,
            MemoryAccessType::RamLoadTmu | MemoryAccessType::RamReadWriteDma
        )
    };
    if sources.iter().chain(destinations.iter()).any(|i| external(i)) {
        return AccessPath::Dma;
    }
    destinations
        .iter()
        .chain(sources.iter())
        .find_map(|i| i.area)
        .map_or(AccessPath::Dma, |area| AccessPath::Scratchpad { area })
}

fn lower_access(method: &mut Method, access: &Access, infos: &FxHashMap<LocalId, MemoryInfo>) -> CompileResult<()> {
    let Some(it) = method.find_instruction(access.instr) else {
        return Ok(());
    };
    let instr = method.instruction(access.instr).clone();
    let sources: SmallVec<[&MemoryInfo; 2]> = access.sources.iter().filter_map(|o| infos.get(o)).collect();
    let destinations: SmallVec<[&MemoryInfo; 2]> =
        access.destinations.iter().filter_map(|o| infos.get(o)).collect();
    let InstrKind::Memory {
        destination, source, ..
    } = &instr.kind
    else {
        return Ok(());
    };

    match access.op {
        MemoryOp::Read => {
            if let Some(info) = sources.iter().find(|i| i.register.is_some()) {
                let register = method.local_value(info.register.unwrap_or(info.object));
                let index = element_index(method, source, info.object).ok_or_else(|| {
                    CompilationError::normalizer("Register-lowered memory read without element index")
                        .with_context(instr.display(method).to_string())
                })?;
                debug!("Lowering read from register: {}", instr.display(method));
                let replacement = if is_zero(&index) {
                    Instruction::mov(destination.clone(), register)
                } else {
                    Instruction::rotate(destination.clone(), register, index)
                };
                it.reset(
                    method,
                    replacement
                        .with_condition(instr.condition)
                        .with_decorations(instr.decorations),
                );
                return Ok(());
            }
        }
        MemoryOp::Write => {
            if let Some(info) = destinations.iter().find(|i| i.register.is_some()) {
                let register = method.local_value(info.register.unwrap_or(info.object));
                debug!("Lowering write into register: {}", instr.display(method));
                it.reset(
                    method,
                    Instruction::mov(register, source.clone())
                        .with_condition(instr.condition)
                        .with_decorations(instr.decorations),
                );
                return Ok(());
            }
        }
        MemoryOp::Copy | MemoryOp::Fill => {}
    }
    let path = access_path(access.op, &sources, &destinations);
    it.modify(method, |i| {
        if let InstrKind::Memory { path: p, .. } = &mut i.kind {
            *p = Some(path);
        }
    });
    Ok(())
}

/// Fill register-lowered constants at the start of the kernel. Elements
/// differing from the first one are written under a condition on the
/// element number.
fn insert_register_initializers(method: &mut Method, initializers: &[(LocalId, Vec<Literal>)]) {
    let Some(first) = method.first_block() else {
        return;
    };
    let mut at = method.walk_block(first).next_in_block();
    for (register, contents) in initializers {
        let Some(head) = contents.first().copied() else {
            continue;
        };
        let value = method.local_value(*register);
        let scalar = value.ty().element_type();
        at = at
            .emplace(method, Instruction::mov(value.clone(), Value::literal(head, scalar.clone())))
            .next_in_block();
        for (index, element) in contents.iter().enumerate().skip(1) {
            if *element == head {
                continue;
            }
            let check = Instruction::op(
                OpCode::Xor,
                Value::register(Register::Nop, scalar.clone()),
                Value::register(Register::ElementNumber, scalar.clone()),
                Value::int(index as i32),
            )
            .with_flags();
            at = at.emplace(method, check).next_in_block();
            let set = Instruction::mov(value.clone(), Value::literal(*element, scalar.clone()))
                .with_condition(Condition::ZeroSet)
                .with_decorations(Decorations::ELEMENT_INSERTION);
            at = at.emplace(method, set).next_in_block();
        }
    }
}

fn insert_cache_synchronization(
    module: &Module,
    method: &mut Method,
    collected: &Collected,
    infos: &FxHashMap<LocalId, MemoryInfo>,
) {
    let (Some(first), Some(last)) = (method.first_block(), method.last_block()) else {
        return;
    };
    for object in &collected.objects {
        let Some(info) = infos.get(object).filter(|i| i.access == MemoryAccessType::ScratchpadCached) else {
            continue;
        };
        let (Some(area), Some(usage)) = (info.area, collected.usages.get(object)) else {
            continue;
        };
        let local = method.local(*object);
        let pointer = method.local_value(*object);
        let element_size = pointee(local).map_or(1, |ty| ty.element_type().in_memory_size().max(1));
        let elements = object_size(module, local).map_or(1, |size| size.div_ceil(element_size));
        let count = Value::uint(elements);
        let cache = Value::register(Register::VpmIo, pointer.ty().clone());
        let path = AccessPath::Scratchpad { area };

        // any write may only cover parts of the object, so written
        // objects are preloaded too
        if usage.reads || usage.writes {
            debug!("Inserting preload of cached memory: {}", local.name);
            let preload = Instruction::memory(MemoryOp::Copy, cache.clone(), pointer.clone(), count.clone())
                .with_access_path(path);
            method.walk_block(first).emplace(method, preload);
        }
        if usage.writes {
            debug!("Inserting write-back of cached memory: {}", method.local_name(*object));
            let write_back =
                Instruction::memory(MemoryOp::Copy, pointer, cache, count).with_access_path(path);
            for at in kernel_exits(method, last) {
                at.emplace(method, write_back.clone());
            }
        }
    }
}

/// Positions control can leave the kernel from: every return, and the end
/// of the last block unless it ends in an unconditional jump or return.
/// Returned back to front, so emplacing at one keeps the others valid.
fn kernel_exits(method: &Method, last: BlockId) -> Vec<InstructionWalker> {
    let mut exits = Vec::new();
    method.for_all_instructions(|id, instr| {
        if matches!(instr.kind, InstrKind::Return) {
            exits.extend(method.find_instruction(id));
        }
    });
    let end = method.walk_block_end(last);
    let before = end.previous_in_block();
    let leaves_block = match before.get(method) {
        Some(i) if !before.is_start_of_block() && !i.has_conditional_execution() => matches!(
            i.kind,
            InstrKind::Return | InstrKind::Branch { condition: None, .. }
        ),
        _ => false,
    };
    if !leaves_block {
        exits.push(end);
    }
    exits.reverse();
    exits
}
