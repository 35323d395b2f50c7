use super::*;
use crate::diagnostic::CompilationStep;
use crate::ir::types::{TYPE_INT32, TYPE_LABEL};
use crate::ir::{
    AccessPath, AddressSpace, Condition, DataType, Decorations, DelayType, Literal, LocalKind,
    MemoryOp, OpCode,
};
use crate::module::Global;
use crate::testing::{assert_uses_consistent, KernelBuilder};

fn store(out: &Value, value: Value) -> Instruction {
    Instruction::memory(MemoryOp::Write, out.clone(), value, Value::int(1))
}

fn load(output: &Value, address: &Value) -> Instruction {
    Instruction::memory(MemoryOp::Read, output.clone(), address.clone(), Value::int(1))
}

fn body(m: &Method) -> Vec<String> {
    m.to_text()
        .lines()
        .filter(|l| l.starts_with("    "))
        .map(|l| l.trim().to_string())
        .collect()
}

fn pointer_local(k: &mut KernelBuilder, name: &str, like: &Value) -> Value {
    let id = k.method.create_local(like.ty().clone(), name, LocalKind::Plain);
    k.method.local_value(id)
}

fn vector_local(k: &mut KernelBuilder, name: &str, width: u8) -> Value {
    let id = k.method.create_local(TYPE_INT32.to_vector(width), name, LocalKind::Plain);
    k.method.local_value(id)
}

fn global(name: &str, ty: DataType, constant: bool, initializer: Option<Vec<Literal>>) -> Global {
    Global {
        name: name.to_string(),
        ty,
        alignment: 4,
        constant,
        initializer,
    }
}

fn paths(m: &Method) -> Vec<AccessPath> {
    let mut paths = Vec::new();
    m.for_all_instructions(|_, instr| {
        if let Some(path) = instr.access_path() {
            paths.push(path);
        }
    });
    paths
}

fn first_instruction(m: &Method) -> InstructionWalker {
    m.walk_all().unwrap().next_in_block()
}

fn set_max_byte_offset(m: &mut Method, param: &Value, offset: u32) {
    if let LocalKind::Parameter(info) = &mut m.local_mut(param.as_local().unwrap()).kind {
        info.max_byte_offset = Some(offset);
    }
}

// ─── Addresses ────────────────────────────────────────────────────

#[test]
fn globals_are_addressed_relative_to_global_data() {
    let mut module = Module::new();
    module.add_global(global("@first", TYPE_INT32, false, None));
    module.add_global(global("@second", TYPE_INT32, false, None));
    let mut k = KernelBuilder::new("globals");
    let v = k.param("%v");
    let ptr = DataType::pointer_to(TYPE_INT32, AddressSpace::Global, 4);
    let first = k.method.add_global_reference("@first", ptr.clone(), false).unwrap();
    let second = k.method.add_global_reference("@second", ptr, false).unwrap();
    let first = k.method.local_value(first);
    let second = k.method.local_value(second);
    k.push(store(&first, v.clone()));
    k.push(store(&second, v));
    let mut m = k.finish();
    let config = Configuration::default();

    let first = first_instruction(&m);
    let it = access_global_data(&module, &mut m, first, &config).unwrap();
    let it = access_global_data(&module, &mut m, it.next_in_block(), &config).unwrap();
    assert_eq!(
        body(&m),
        vec![
            "store %v -> %global_data_address",
            "%global_data_offset.0 = add %global_data_address, 4",
            "store %v -> %global_data_offset.0",
        ]
    );
    let rewritten = it.get(&m).map(|i| i.display(&m).to_string());
    assert_eq!(rewritten.as_deref(), Some("store %v -> %global_data_offset.0"));
    assert!(m
        .metadata
        .uniforms_used
        .is_used(BuiltinKind::GlobalDataAddress));
    assert_uses_consistent(&m);
}

#[test]
fn stack_pointers_become_per_qpu_addresses() {
    let module = Module::new();
    let mut k = KernelBuilder::new("stack");
    let v = k.param("%v");
    k.method.add_stack_allocation("%word", TYPE_INT32, 4).unwrap();
    let block = k.method.add_stack_allocation("%block", TYPE_INT32.to_vector(4), 16).unwrap();
    let block = k.method.local_value(block);
    k.push(store(&block, v));
    let mut m = k.finish();
    m.calculate_stack_offsets(m.stack_base_offset(0));
    assert_eq!(m.stack_frame_size(), 32);

    let it = first_instruction(&m);
    resolve_stack_allocation(&module, &mut m, it, &Configuration::default()).unwrap();
    assert_eq!(
        body(&m),
        vec![
            "%stack_offset.0 = mul24 qpu_num, 32",
            "%stack_addr.1 = add %stack_offset.0, %global_data_address",
            "%stack_addr.2 = add %stack_addr.1, 16",
            "store %v -> %stack_addr.2",
        ]
    );
    let address = m.find_local("%stack_addr.2").unwrap();
    assert_eq!(m.base_local(address), block.as_local().unwrap());
    assert_uses_consistent(&m);
}

#[test]
fn lifetime_markers_are_dropped() {
    let module = Module::new();
    let mut k = KernelBuilder::new("lifetime");
    let alloc = k.method.add_stack_allocation("%tmp", TYPE_INT32, 4).unwrap();
    let alloc = k.method.local_value(alloc);
    k.push(Instruction::lifetime(alloc.clone(), false));
    k.push(Instruction::nop(DelayType::WaitRegister));
    k.push(Instruction::lifetime(alloc, true));
    let mut m = k.finish();

    let first = first_instruction(&m);
    let it = resolve_stack_allocation(&module, &mut m, first, &Configuration::default()).unwrap();
    assert!(it.is_start_of_block());
    assert_eq!(body(&m), vec!["nop (WaitRegister)", "life-time for %tmp ends"]);
}

#[test]
fn lowered_stack_pointer_without_frame_is_zero() {
    let module = Module::new();
    let mut k = KernelBuilder::new("lowered");
    let v = k.param("%v");
    let alloc = k.method.add_stack_allocation("%tmp", TYPE_INT32, 4).unwrap();
    if let LocalKind::StackAllocation(info) = &mut k.method.local_mut(alloc).kind {
        info.is_lowered = true;
    }
    let alloc = k.method.local_value(alloc);
    k.push(store(&alloc, v));
    let mut m = k.finish();
    m.calculate_stack_offsets(0);
    assert_eq!(m.stack_frame_size(), 0);

    let first = first_instruction(&m);
    resolve_stack_allocation(&module, &mut m, first, &Configuration::default()).unwrap();
    assert_eq!(body(&m), vec!["store %v -> 0"]);
}

// ─── Classification ───────────────────────────────────────────────

#[test]
fn small_private_allocation_lives_in_register() {
    let mut k = KernelBuilder::new("private");
    let v = k.param("%v");
    let out = k.buffer("%out", TYPE_INT32, false);
    let alloc = k.method.add_stack_allocation("%s", TYPE_INT32, 4).unwrap();
    let alloc = k.method.local_value(alloc);
    let x = k.local("%x");
    k.push(store(&alloc, v));
    k.push(load(&x, &alloc));
    k.push(store(&out, x));
    let mut m = k.finish();

    let infos = map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    assert_eq!(
        body(&m),
        vec!["%s.register = %v", "%x = %s.register", "store %x -> %out"]
    );
    assert_eq!(infos[0].access, MemoryAccessType::RegisterReadWrite);
    assert_eq!(infos[1].access, MemoryAccessType::RamReadWriteDma);
    assert!(m.local(alloc.as_local().unwrap()).stack_allocation().unwrap().is_lowered);
    assert_eq!(paths(&m), vec![AccessPath::Dma]);
    // every work-item writes the same element of %out
    assert!(!m.cross_item_synchronization_free);
    assert_uses_consistent(&m);
}

#[test]
fn read_only_parameter_is_loaded_through_tmu() {
    let mut k = KernelBuilder::new("tmu");
    let input = k.buffer("%in", TYPE_INT32, true);
    let x = k.local("%x");
    k.push(load(&x, &input));
    let mut m = k.finish();

    let infos = map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].access, MemoryAccessType::RamLoadTmu);
    assert_eq!(paths(&m), vec![AccessPath::Tmu]);
    assert!(m.cross_item_synchronization_free);
}

#[test]
fn constant_table_is_lowered_into_register() {
    let mut module = Module::new();
    let table = module.create_array_type(TYPE_INT32, 4);
    let contents = vec![Literal(1), Literal(1), Literal(3), Literal(1)];
    module.add_global(global("@table", table.clone(), true, Some(contents)));
    let mut k = KernelBuilder::new("table");
    let i = k.param("%i");
    let ptr = DataType::pointer_to(table, AddressSpace::Constant, 4);
    let table = k.method.add_global_reference("@table", ptr, true).unwrap();
    let table = k.method.local_value(table);
    let p = pointer_local(&mut k, "%p", &table);
    let x = k.local("%x");
    k.push(Instruction::op(OpCode::Add, p.clone(), table, i));
    k.push(load(&x, &p));
    let mut m = k.finish();

    let infos = map_memory_access(&module, &mut m, &Configuration::default()).unwrap();
    assert_eq!(infos[0].access, MemoryAccessType::RegisterReadOnly);
    assert_eq!(
        body(&m),
        vec![
            "@table.register = 1",
            "- = xor elem_num, 2 (setf)",
            "@table.register = 3 (ifz)",
            "%p = add @table, %i",
            "%x = @table.register rotate %i",
        ]
    );
    assert!(paths(&m).is_empty());
}

#[test]
fn local_buffer_goes_into_scratchpad() {
    let mut k = KernelBuilder::new("shared");
    let v = k.param("%v");
    let ty = DataType::pointer_to(TYPE_INT32, AddressSpace::Local, 4);
    let shared = k.method.add_parameter("%shared", ty, false).unwrap();
    let shared = k.method.local_value(shared);
    let x = k.local("%x");
    k.push(store(&shared, v));
    k.push(load(&x, &shared));
    let mut m = k.finish();
    set_max_byte_offset(&mut m, &shared, 63);
    m.scratchpad = crate::periphery::Scratchpad::new(4096);

    let infos = map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    assert_eq!(infos[0].access, MemoryAccessType::ScratchpadShared);
    assert_eq!(infos[0].area, Some(0));
    assert_eq!(
        paths(&m),
        vec![AccessPath::Scratchpad { area: 0 }, AccessPath::Scratchpad { area: 0 }]
    );
    assert_eq!(m.scratchpad.used_rows(), 1);
}

fn cached_kernel() -> Method {
    let mut k = KernelBuilder::new("cached");
    let v = k.param("%v");
    let buffer = k.buffer("%buf", TYPE_INT32, false);
    k.push(store(&buffer, v));
    k.push(Instruction::ret());
    let mut m = k.finish();
    set_max_byte_offset(&mut m, &buffer, 127);
    m.scratchpad = crate::periphery::Scratchpad::new(4096);
    m
}

#[test]
fn written_buffer_is_cached_in_scratchpad() {
    let mut m = cached_kernel();
    let infos = map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    assert_eq!(infos[0].access, MemoryAccessType::ScratchpadCached);
    assert_eq!(
        body(&m),
        vec![
            "copy 32 from %buf to vpm",
            "store %v -> %buf",
            "copy 32 from vpm to %buf",
            "ret",
        ]
    );
    assert_eq!(paths(&m), vec![AccessPath::Scratchpad { area: 0 }; 3]);
    assert_eq!(m.scratchpad.scratch_area_rows(), 2);
}

const WRITE_BACK: &str = "copy 32 from vpm to %buf";

#[test]
fn conditional_early_return_writes_back_cache() {
    let mut k = KernelBuilder::new("early_return");
    let v = k.param("%v");
    let buffer = k.buffer("%buf", TYPE_INT32, false);
    k.push(store(&buffer, v));
    k.push(Instruction::ret().with_condition(Condition::ZeroSet));
    k.block("%tail");
    k.push(Instruction::ret());
    let mut m = k.finish();
    set_max_byte_offset(&mut m, &buffer, 127);
    m.scratchpad = crate::periphery::Scratchpad::new(4096);

    map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    assert_eq!(
        body(&m),
        vec![
            "copy 32 from %buf to vpm",
            "store %v -> %buf",
            WRITE_BACK,
            "ret (ifz)",
            WRITE_BACK,
            "ret",
        ]
    );
    assert_uses_consistent(&m);
}

#[test]
fn every_exit_of_a_branching_kernel_writes_back_cache() {
    let mut k = KernelBuilder::new("exits");
    let v = k.param("%v");
    let buffer = k.buffer("%buf", TYPE_INT32, false);
    let tail = k.label_local("%tail");
    k.push(store(&buffer, v.clone()));
    k.push(Instruction::branch_if(tail, v.clone()));
    k.block("%early");
    k.push(Instruction::ret());
    k.method.append(Instruction::label(tail));
    k.push(store(&buffer, v));
    let mut m = k.finish();
    set_max_byte_offset(&mut m, &buffer, 127);
    m.scratchpad = crate::periphery::Scratchpad::new(4096);

    map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    let lines = body(&m);
    // one write-back before the early return, one at the fall-off end
    assert_eq!(lines.iter().filter(|l| *l == WRITE_BACK).count(), 2);
    let ret = lines.iter().position(|l| l == "ret").unwrap();
    assert_eq!(lines[ret - 1], WRITE_BACK);
    assert_eq!(lines.last().map(String::as_str), Some(WRITE_BACK));
    // the branch itself does not leave the kernel
    assert_ne!(lines[2], WRITE_BACK);
    assert_uses_consistent(&m);
}

#[test]
fn disabled_caching_keeps_buffer_in_memory() {
    let mut m = cached_kernel();
    let config = Configuration::default().disable(crate::optimization::CACHE_MEMORY);
    let infos = map_memory_access(&Module::new(), &mut m, &config).unwrap();
    assert_eq!(infos[0].access, MemoryAccessType::RamReadWriteDma);
    assert_eq!(body(&m), vec!["store %v -> %buf", "ret"]);
    assert_eq!(paths(&m), vec![AccessPath::Dma]);
}

#[test]
fn conditional_address_of_unknown_memory_is_an_error() {
    let mut k = KernelBuilder::new("conditional");
    let v = k.param("%v");
    let buffer = k.buffer("%buf", TYPE_INT32, false);
    let p = pointer_local(&mut k, "%p", &buffer);
    let q = pointer_local(&mut k, "%q", &buffer);
    k.push(Instruction::mov(p.clone(), buffer));
    k.push(Instruction::mov(p.clone(), q));
    k.push(store(&p, v));
    let mut m = k.finish();

    let err = map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap_err();
    assert_eq!(err.step, CompilationStep::Normalizer);
    assert_eq!(err.context.as_deref(), Some("%q"));
}

// ─── Cross work-item dependencies ─────────────────────────────────

/// Store a vector of `width` elements to `%out + offset`, where the
/// offset is computed from the global id by `offset`.
fn hazard_kernel(width: u8, offset: impl FnOnce(Value, Value) -> Instruction) -> Method {
    let mut k = KernelBuilder::new("hazard");
    let out = k.buffer("%out", TYPE_INT32, false);
    let gid = k.local("%gid");
    let uniform = Value::register(crate::ir::Register::Uniform, TYPE_INT32);
    k.push(Instruction::mov(gid.clone(), uniform).with_decorations(Decorations::BUILTIN_GLOBAL_ID));
    let off = k.local("%offset");
    k.push(offset(off.clone(), gid));
    let p = pointer_local(&mut k, "%p", &out);
    k.push(Instruction::op(OpCode::Add, p.clone(), out, off));
    let v = vector_local(&mut k, "%v", width);
    k.push(store(&p, v));
    let mut m = k.finish();
    map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    m
}

#[test]
fn id_times_access_width_is_hazard_free() {
    let m = hazard_kernel(4, |off, gid| Instruction::op(OpCode::Mul24, off, gid, Value::int(4)));
    assert!(m.cross_item_synchronization_free);
}

#[test]
fn id_shifted_by_access_width_is_hazard_free() {
    let m = hazard_kernel(4, |off, gid| Instruction::op(OpCode::Shl, off, gid, Value::int(2)));
    assert!(m.cross_item_synchronization_free);
}

#[test]
fn access_wider_than_id_factor_is_hazardous() {
    let m = hazard_kernel(8, |off, gid| Instruction::op(OpCode::Mul24, off, gid, Value::int(4)));
    assert!(!m.cross_item_synchronization_free);
}

#[test]
fn address_unrelated_to_id_is_hazardous() {
    let m = hazard_kernel(1, |off, gid| Instruction::op(OpCode::Add, off, gid, Value::int(3)));
    assert!(!m.cross_item_synchronization_free);
}

#[test]
fn plain_id_offset_is_hazard_free() {
    let mut k = KernelBuilder::new("plain");
    let out = k.buffer("%out", TYPE_INT32, false);
    let gid = k.local("%gid");
    let uniform = Value::register(crate::ir::Register::Uniform, TYPE_INT32);
    k.push(Instruction::mov(gid.clone(), uniform).with_decorations(Decorations::BUILTIN_LOCAL_ID));
    let p = pointer_local(&mut k, "%p", &out);
    k.push(Instruction::op(OpCode::Add, p.clone(), out, gid.clone()));
    k.push(store(&p, gid));
    let mut m = k.finish();

    map_memory_access(&Module::new(), &mut m, &Configuration::default()).unwrap();
    assert!(m.cross_item_synchronization_free);
}

// ─── Spilling ─────────────────────────────────────────────────────

#[test]
fn long_lived_locals_are_spill_candidates() {
    let mut k = KernelBuilder::new("spill");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    for _ in 0..(SPILL_THRESHOLD + 8) {
        k.push(Instruction::nop(DelayType::WaitRegister));
    }
    k.push(Instruction::op(OpCode::Add, x.clone(), a.clone(), Value::int(1)));
    k.push(store(&out, x.clone()));
    let m = k.finish();

    let candidates = spill_locals(&Module::new(), &m, &Configuration::default());
    assert!(candidates.contains(&a.as_local().unwrap()));
    assert!(!candidates.contains(&x.as_local().unwrap()));
}

#[test]
fn labels_are_never_spill_candidates() {
    let mut k = KernelBuilder::new("labels");
    let label = k.method.create_local(TYPE_LABEL, "%target", LocalKind::Label);
    k.push(Instruction::branch(label));
    k.block("%target");
    let m = k.finish();

    let candidates = spill_locals(&Module::new(), &m, &Configuration::default());
    assert!(candidates.is_empty());
}

// ─── Driver ───────────────────────────────────────────────────────

#[test]
fn normalize_rewrites_remaining_memory_accesses() {
    let mut module = Module::new();
    module.add_global(global("@counter", TYPE_INT32, false, None));
    let mut k = KernelBuilder::new("normalize");
    let v = k.param("%v");
    let ptr = DataType::pointer_to(TYPE_INT32, AddressSpace::Global, 4);
    let counter = k.method.add_global_reference("@counter", ptr, false).unwrap();
    let counter = k.method.local_value(counter);
    k.push(store(&counter, v));
    let mut m = k.finish();

    normalize(&module, &mut m, &Configuration::default()).unwrap();
    // the writable global is cached, its copies are rewritten as well
    assert_eq!(
        body(&m),
        vec![
            "copy 1 from %global_data_address to vpm",
            "store %v -> %global_data_address",
            "copy 1 from vpm to %global_data_address",
        ]
    );
    assert_eq!(paths(&m), vec![AccessPath::Scratchpad { area: 0 }; 3]);
    assert_uses_consistent(&m);
}
