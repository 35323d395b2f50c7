//! Passes removing instructions: dead code, forwarded and redundant
//! moves, bit operations without effect.

use log::debug;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::steps::fold_constants;
use crate::config::Configuration;
use crate::diagnostic::{CompilationError, CompileResult};
use crate::ir::{
    BuiltinKind, DataType, Decorations, DelayType, InstrId, InstrKind, Instruction,
    InstructionWalker, Literal, LocalData, LocalId, LocalKind, Method, OpCode, Register,
    RegisterFile, SideEffects, Signal, UseRole, Value,
};

/// Instructions producing a value and nothing else.
fn computes_value(instr: &Instruction) -> bool {
    matches!(
        instr.kind,
        InstrKind::Operation { .. } | InstrKind::Move { .. } | InstrKind::LoadImmediate { .. }
    )
}

fn clobbers_r4(instr: &Instruction) -> bool {
    instr.signal.triggers_read_of_r4()
        || instr
            .outputs()
            .iter()
            .any(|o| o.as_register().is_some_and(|r| r.triggers_read_of_r4()))
}

fn touches_r5(instr: &Instruction) -> bool {
    instr.reads_register(Register::Acc5) || instr.writes_register(Register::Acc5)
}

fn is_vpm(reg: Register) -> bool {
    matches!(reg, Register::VpmIo | Register::VpmAddress)
}

/// Whether an instruction strictly between `from` and `to` (same block)
/// changes `value`.
fn is_overwritten_between(method: &Method, from: InstructionWalker, to: InstructionWalker, value: &Value) -> bool {
    let mut check = from.next_in_block();
    while check.index() < to.index() {
        if let Some(instr) = check.get(method) {
            let overwritten = match value {
                Value::Local { local, .. } => instr.writes_local(*local),
                Value::Register { reg, .. } => {
                    instr.writes_register(*reg)
                        || (matches!(reg, Register::SfuOut | Register::TmuOut) && clobbers_r4(instr))
                }
                _ => false,
            };
            if overwritten {
                return true;
            }
        }
        check = check.next_in_block();
    }
    false
}

// ─── Dead code ────────────────────────────────────────────────────

/// Remove instructions whose results are never used.
///
/// * side-effect free writes to locals nobody reads (the walk then steps
///   back, so a predecessor which just became dead is looked at again)
/// * simple moves between locals of the same type, by merging the locals
/// * unused reads of work-group uniforms, clearing their metadata bit
/// * side-effect free writes to r5 which are overwritten before read
/// * side-effect free writes to locals overwritten before the next read
pub fn eliminate_dead_code(method: &mut Method, _config: &Configuration) -> CompileResult<bool> {
    let before = method.revision();
    if let Some(mut it) = method.walk_all() {
        while !it.is_end_of_method(method) {
            it = match remove_dead_instruction(method, it)? {
                Some(revisit) => revisit,
                None => it.next_in_method(method),
            };
        }
    }
    method.clean_locals();
    Ok(method.revision() != before)
}

/// Returns the position to look at next if the instruction was removed.
fn remove_dead_instruction(method: &mut Method, it: InstructionWalker) -> CompileResult<Option<InstructionWalker>> {
    let Some(instr) = it.get(method) else {
        return Ok(None);
    };
    if it.is_start_of_block() || !computes_value(instr) {
        return Ok(None);
    }
    let side_effects = instr.has_side_effects();

    if let Some(out) = instr.output_local() {
        let local = method.local(out);
        if !side_effects && local.parameter().is_none() && !local.has_readers() {
            debug!(
                "Removing instruction {}, since its output is never read",
                instr.display(method)
            );
            return Ok(Some(it.erase(method).previous_in_block()));
        }
        let merge_source = instr
            .move_source()
            .and_then(Value::as_local)
            .filter(|_| instr.is_simple_move() && !side_effects);
        if let Some(source) = merge_source {
            if merge_locals(method, it, source, out)? {
                return Ok(Some(it.erase(method)));
            }
        }
        let Some(instr) = it.get(method) else {
            return Ok(None);
        };
        let reads_uniform = instr.move_source().is_some_and(|s| s.has_register(Register::Uniform))
            && !instr.signal.has_side_effects();
        let local = method.local(out);
        if let Some(kind) = local.builtin().filter(|k| reads_uniform && !local.has_readers() && is_work_group_uniform(*k)) {
            debug!(
                "Removing read of work-group UNIFORM, since it is never used: {}",
                instr.display(method)
            );
            method.metadata.uniforms_used.set_used(kind, false);
            return Ok(Some(it.erase(method)));
        }
    }

    let Some(instr) = it.get(method) else {
        return Ok(None);
    };
    if instr.output_register().is_some() && !side_effects && instr.writes_register(Register::Acc5) {
        let mut check = it.next_in_block();
        while let Some(next) = check.get(method) {
            if next.reads_register(Register::Acc5) {
                break;
            }
            if next.writes_register(Register::Acc5) {
                debug!(
                    "Removing write to special purpose register which is never used: {}",
                    instr.display(method)
                );
                return Ok(Some(it.erase(method)));
            }
            check = check.next_in_block();
        }
    }

    if let Some(out) = instr.output_local().filter(|_| !side_effects) {
        let mut check = it.next_in_block();
        while let Some(next) = check.get(method) {
            if next.reads_local(out) || next.is_branch() {
                break;
            }
            let full_overwrite = !next.has_conditional_execution()
                && !next.decorations.contains(Decorations::ELEMENT_INSERTION);
            if next.writes_local(out) && full_overwrite {
                debug!(
                    "Removing write to local which is overridden before the next read: {}",
                    instr.display(method)
                );
                return Ok(Some(it.erase(method)));
            }
            check = check.next_in_block();
        }
    }
    Ok(None)
}

/// Work-group information loaded through a uniform which may be dropped
/// again if nothing reads it.
fn is_work_group_uniform(kind: BuiltinKind) -> bool {
    matches!(
        kind,
        BuiltinKind::WorkDimensions
            | BuiltinKind::GlobalDataAddress
            | BuiltinKind::GlobalOffsetX
            | BuiltinKind::GlobalOffsetY
            | BuiltinKind::GlobalOffsetZ
            | BuiltinKind::GroupIdX
            | BuiltinKind::GroupIdY
            | BuiltinKind::GroupIdZ
            | BuiltinKind::LocalIds
            | BuiltinKind::LocalSizes
            | BuiltinKind::NumGroupsX
            | BuiltinKind::NumGroupsY
            | BuiltinKind::NumGroupsZ
    )
}

/// Make every reader of `out` read `source` instead. Only done when the
/// move is the single writer of `out`, all readers follow the move in its
/// block and `source` keeps its value up to the last of them.
fn merge_locals(method: &mut Method, it: InstructionWalker, source: LocalId, out: LocalId) -> CompileResult<bool> {
    if source == out {
        return Ok(false);
    }
    let out_local = method.local(out);
    if out_local.kind != LocalKind::Plain
        || out_local.single_writer() != it.id(method)
        || method.local(source).ty != out_local.ty
    {
        return Ok(false);
    }
    let readers: Vec<InstrId> = out_local.readers().collect();
    let mut last = it.index();
    for reader in &readers {
        match method.find_instruction(*reader) {
            Some(pos) if pos.block() == it.block() && pos.index() > it.index() => {
                last = last.max(pos.index());
            }
            _ => return Ok(false),
        }
    }
    let source_value = method.local_value(source);
    if is_overwritten_between(method, it, InstructionWalker::new(it.block(), last), &source_value) {
        return Ok(false);
    }
    debug!(
        "Merging locals {} and {} since they contain the same value",
        method.local_name(source),
        method.local_name(out)
    );
    let out_value = method.local_value(out);
    for reader in readers {
        let replaced = method
            .find_instruction(reader)
            .and_then(|pos| pos.modify(method, |i| i.replace_value(&out_value, &source_value, UseRole::Reader)))
            .unwrap_or(false);
        if !replaced {
            let context = method.instruction(reader).display(method).to_string();
            return Err(CompilationError::optimizer("Unsupported case of instruction merging!").with_context(context));
        }
    }
    Ok(true)
}

// ─── Move propagation ─────────────────────────────────────────────

/// Literals the hardware can encode directly in an instruction.
fn is_small_immediate(literal: Literal, ty: &DataType) -> bool {
    if ty.is_float() {
        let value = literal.real_value();
        return (-8..=7).any(|e| value == 2f32.powi(e));
    }
    (-16..=15).contains(&literal.signed())
}

/// Whether `instr` leaves the register `source` reads intact. Only the
/// r4 result register and r5 are checked, any other register is never
/// forwarded.
fn register_forwarding_allowed(source: &Value, instr: &Instruction) -> bool {
    match source.as_register() {
        None => true,
        Some(Register::SfuOut | Register::TmuOut) => !clobbers_r4(instr),
        Some(Register::Acc5) => !instr.writes_register(Register::Acc5),
        Some(_) => false,
    }
}

/// Substitute the source of a plain move into the reads of its output
/// later in the same block.
///
/// The scan stops when the output or the source is written again, when
/// an instruction may change a forwarded register, or when all reads of
/// the output are rewritten. Every rewritten instruction is offered to
/// constant folding right away.
pub fn propagate_moves(method: &mut Method, config: &Configuration) -> CompileResult<bool> {
    let group_ids = method.find_builtin(BuiltinKind::GroupIds);
    let mut replaced = false;
    let Some(mut it) = method.walk_all() else {
        return Ok(false);
    };
    while !it.is_end_of_method(method) {
        if let Some((old, new)) = forwardable_move(method, it, group_ids) {
            replaced |= forward_move(method, it, old, &new, config)?;
        }
        it = it.next_in_method(method);
    }
    Ok(replaced)
}

fn forwardable_move(method: &Method, it: InstructionWalker, group_ids: Option<LocalId>) -> Option<(LocalId, Value)> {
    if it.is_start_of_block() {
        return None;
    }
    let instr = it.get(method)?;
    if !instr.is_simple_move() || instr.has_side_effects() {
        return None;
    }
    let out = instr.output_local()?;
    let source = instr.move_source()?;
    if source.has_local(out) {
        return None;
    }
    if source
        .as_literal()
        .is_some_and(|l| !is_small_immediate(l, source.ty()))
    {
        return None;
    }
    // the group-id vector is assembled by hand-written work-group loop code
    if group_ids.is_some_and(|g| instr.reads_local(g)) {
        return None;
    }
    Some((out, source.clone()))
}

fn forward_move(
    method: &mut Method,
    it: InstructionWalker,
    old: LocalId,
    new: &Value,
    config: &Configuration,
) -> CompileResult<bool> {
    let old_value = method.local_value(old);
    let mut remaining: FxHashSet<InstrId> = method.local(old).readers().collect();
    // registers of physical file B cannot be combined with a literal
    let skip_literal_reads = new.as_register().is_some_and(|r| r.file() == RegisterFile::PhysicalB);
    let mut replaced = false;
    let mut check = it.next_in_block();
    while !remaining.is_empty() {
        let Some(id) = check.id(method) else {
            break;
        };
        let instr = method.instruction(id);
        if instr.reads_local(old) && (!skip_literal_reads || !instr.reads_literal()) {
            let before = instr.display(method).to_string();
            if check
                .modify(method, |i| i.replace_value(&old_value, new, UseRole::Reader))
                .unwrap_or(false)
            {
                debug!(
                    "Propagated move into '{}': {}",
                    before,
                    method.instruction(id).display(method)
                );
                remaining.remove(&id);
                replaced = true;
                fold_constants(method, check, config)?;
            }
        }
        let instr = method.instruction(id);
        let source_written = new.as_local().is_some_and(|l| instr.writes_local(l));
        if instr.writes_local(old) || source_written || !register_forwarding_allowed(new, instr) {
            break;
        }
        check = check.next_in_block();
    }
    Ok(replaced)
}

// ─── Redundant moves ──────────────────────────────────────────────

/// No instruction strictly between the two positions reads or writes
/// `reg` or otherwise disturbs the peripheral behind it.
fn is_no_read_between(method: &Method, first: InstructionWalker, second: InstructionWalker, reg: Register) -> bool {
    let mut check = first.next_in_block();
    while check.index() < second.index() {
        if let Some(instr) = check.get(method) {
            if instr.reads_register(reg)
                || instr.writes_register(reg)
                || clobbers_r4(instr)
                || instr.writes_register(Register::Mutex)
            {
                return false;
            }
            if is_vpm(reg) && instr.output_register().is_some_and(is_vpm) {
                return false;
            }
        }
        check = check.next_in_block();
    }
    true
}

/// An instruction using r5 may not be moved across other uses of r5.
fn can_move_instruction(method: &Method, source: InstructionWalker, destination: InstructionWalker) -> bool {
    if !source.get(method).is_some_and(touches_r5) {
        return true;
    }
    let mut check = source.next_in_block();
    while check.index() < destination.index() {
        if check.get(method).is_some_and(touches_r5) {
            return false;
        }
        check = check.next_in_block();
    }
    true
}

/// Remove moves which only copy values around.
///
/// In order of preference, a move
/// * to itself is dropped (or becomes a NOP keeping its signal),
/// * between two locals written and read once is replaced by reading the
///   source directly,
/// * into a register takes over the instruction computing its source,
/// * from a register is dropped and its single consumer reads the register.
///
/// Phi moves, conditional moves, rotations and moves with (un)pack modes
/// are left alone.
pub fn eliminate_redundant_moves(method: &mut Method, _config: &Configuration) -> CompileResult<bool> {
    let mut changed = false;
    let Some(mut it) = method.walk_all() else {
        return Ok(false);
    };
    while !it.is_end_of_method(method) {
        if let Some(continue_at) = remove_redundant_move(method, it)? {
            changed = true;
            it = continue_at;
        }
        it = it.next_in_method(method);
    }
    Ok(changed)
}

fn remove_redundant_move(method: &mut Method, it: InstructionWalker) -> CompileResult<Option<InstructionWalker>> {
    if it.is_start_of_block() {
        return Ok(None);
    }
    let Some(id) = it.id(method) else {
        return Ok(None);
    };
    let instr = method.instruction(id);
    let InstrKind::Move {
        output,
        source,
        rotation: None,
    } = &instr.kind
    else {
        return Ok(None);
    };
    if instr.decorations.contains(Decorations::PHI_NODE)
        || instr.has_pack_mode()
        || instr.has_unpack_mode()
        || instr.has_conditional_execution()
    {
        return Ok(None);
    }
    let (output, source) = (output.clone(), source.clone());
    let text = instr.display(method).to_string();
    let signal = instr.signal;
    let set_flags = instr.set_flags;
    let has_side_effects = instr.has_side_effects();
    let decorations = instr.decorations;

    if source == output && !instr.has_other_side_effects(SideEffects::SIGNAL) {
        if signal == Signal::None {
            debug!("Removing obsolete move: {}", text);
            return Ok(Some(it.erase(method).previous_in_block()));
        }
        debug!("Removing obsolete move with nop: {}", text);
        it.reset(method, Instruction::nop(DelayType::WaitRegister).with_signal(signal));
        return Ok(Some(it));
    }

    let source_local = source.as_local();
    let source_used_once = source_local.is_some_and(|l| {
        let local = method.local(l);
        local.single_writer().is_some() && local.count_readers() == 1
    });
    let output_local = output.as_local();
    let destination_reader = output_local
        .filter(|l| method.local(*l).single_writer() == Some(id))
        .and_then(|l| method.local(l).single_reader());
    let reader_pos = destination_reader
        .and_then(|r| method.find_instruction(r))
        .filter(|p| p.block() == it.block() && p.index() > it.index());
    let destination_without_literal = destination_reader.is_some_and(|r| !method.instruction(r).reads_literal());
    let writer_pos = source_local
        .and_then(|l| method.local(l).single_writer())
        .and_then(|w| method.find_instruction(w))
        .filter(|p| p.block() == it.block() && p.index() < it.index());

    if let (Some(reader), Some(_)) = (reader_pos, source_local) {
        if !has_side_effects
            && source_used_once
            && destination_without_literal
            && source.ty() == output.ty()
            && !is_overwritten_between(method, it, reader, &source)
        {
            debug!(
                "Removing obsolete move by replacing uses of the output with the input: {}",
                text
            );
            reader.modify(method, |i| {
                i.replace_value(&output, &source, UseRole::Reader);
                if matches!(i.kind, InstrKind::Move { .. }) {
                    i.decorations.insert(decorations.forwardable());
                }
            });
            return Ok(Some(it.erase(method).previous_in_block()));
        }
    }

    if let (Some(out_reg), Some(writer)) = (output.as_register(), writer_pos) {
        if let Some(sunk) = sink_source_writer(method, writer, it, out_reg, source_used_once, signal) {
            debug!(
                "Replacing obsolete move with instruction calculating its source: {}",
                text
            );
            let mut sunk = sunk;
            if let Some(out) = sunk.output_mut() {
                *out = output.clone();
            }
            sunk.set_flags = set_flags;
            it.reset(method, sunk);
            writer.erase(method);
            // the erased writer was in front of the move
            return Ok(Some(it.previous_in_block()));
        }
    }

    if let (Some(src_reg), Some(reader), Some(old)) = (source.as_register(), reader_pos, output_local) {
        let Some(consumer) = reader.get(method) else {
            return Ok(None);
        };
        let usable_file = destination_without_literal
            || matches!(
                src_reg.file(),
                RegisterFile::Accumulator | RegisterFile::PhysicalA | RegisterFile::PhysicalB
            );
        if usable_file
            && !signal.has_side_effects()
            && !set_flags
            && !consumer.has_unpack_mode()
            && !consumer.has_conditional_execution()
            && !consumer.reads_register(src_reg)
            && is_no_read_between(method, it, reader, src_reg)
            // the VPM cannot be read and written by the same instruction
            && !(src_reg == Register::VpmIo && consumer.writes_register(Register::VpmIo))
        {
            debug!(
                "Replacing obsolete move by inserting the source into the instruction consuming its result: {}",
                text
            );
            let register = Value::register(src_reg, output.ty().clone());
            reader.modify(method, |i| i.replace_value(&output, &register, UseRole::Reader));
            carry_reference(method, reader, old);
            return Ok(Some(it.erase(method).previous_in_block()));
        }
    }
    Ok(None)
}

/// The instruction computing the source of a move into `out_reg`, if it
/// can be retargeted to write the register directly.
fn sink_source_writer(
    method: &Method,
    writer: InstructionWalker,
    it: InstructionWalker,
    out_reg: Register,
    source_used_once: bool,
    signal: Signal,
) -> Option<Instruction> {
    let instr = writer.get(method)?;
    let movable = source_used_once
        && computes_value(instr)
        && !instr.has_side_effects()
        && !signal.has_side_effects()
        && can_move_instruction(method, writer, it)
        && !instr.args().iter().any(|arg| is_overwritten_between(method, writer, it, arg))
        && !matches!(out_reg, Register::ReplicateAll | Register::ReplicateQuad)
        // peripheral registers can neither be written conditionally nor packed into
        && (!out_reg.has_side_effects_on_write()
            || (!instr.has_conditional_execution() && !instr.has_pack_mode()));
    movable.then(|| instr.clone())
}

/// Let the consumer's output inherit what memory the removed move's output
/// referenced.
fn carry_reference(method: &mut Method, consumer: InstructionWalker, old: LocalId) {
    let Some(target) = consumer.get(method).and_then(Instruction::output_local) else {
        return;
    };
    if method.local(target).data != LocalData::None {
        return;
    }
    let old_local = method.local(old);
    let data = if old_local.resides_in_memory() {
        LocalData::Reference {
            base: old,
            index: None,
        }
    } else if let LocalData::Reference { .. } = old_local.data {
        old_local.data.clone()
    } else {
        return;
    };
    method.local_mut(target).data = data;
    consumer.modify(method, |i| i.decorations.insert(Decorations::REFERENCE_PROVENANCE));
}

// ─── Bit operations ───────────────────────────────────────────────

fn can_replace_bit_op(instr: &Instruction) -> bool {
    !instr.has_unpack_mode() && !instr.side_effects().contains(SideEffects::REGISTER_READ)
}

/// Remove bit operations which do not change the result.
///
/// * `(a and b) and a` is `a and b`, `(a and b) or a` is `a`
/// * `(a or b) or a` is `a or b`, `(a or b) and a` is `a`
/// * masking a single extracted byte with 255 is a move
/// * an arithmetic right shift whose sign bits are all masked away is a
///   logical right shift
/// * `(a << k) >> k` is `a and (2^(32-k) - 1)`
///
/// The first two look ahead at most `max_common_expression_distance`
/// instructions and stop at a write of either operand.
pub fn eliminate_redundant_bit_op(method: &mut Method, config: &Configuration) -> CompileResult<bool> {
    let distance = config.additional_options.max_common_expression_distance as usize;
    let mut replaced = false;
    let Some(mut it) = method.walk_all() else {
        return Ok(false);
    };
    while !it.is_end_of_method(method) {
        if !it.is_start_of_block() {
            replaced |= simplify_bit_op(method, it, distance);
        }
        it = it.next_in_method(method);
    }
    Ok(replaced)
}

fn simplify_bit_op(method: &mut Method, it: InstructionWalker, distance: usize) -> bool {
    let Some(instr) = it.get(method) else {
        return false;
    };
    let Some(op) = instr.operation() else {
        return false;
    };
    if instr.has_conditional_execution() {
        return false;
    }
    let mut replaced = false;
    match op {
        OpCode::And | OpCode::Or => {
            let absorbing_source = !instr.has_pack_mode() && !instr.has_unpack_mode();
            if let Some(out) = instr.output_local().filter(|o| absorbing_source && !instr.reads_local(*o)) {
                let mut inputs: SmallVec<[LocalId; 2]> = instr.args().iter().filter_map(|a| a.as_local()).collect();
                inputs.dedup();
                for input in inputs {
                    replaced |= absorb_bit_ops(method, it, op, out, input, distance);
                }
            }
            if op == OpCode::And {
                replaced |= remove_byte_mask(method, it).is_some();
            }
        }
        OpCode::Asr => replaced |= downgrade_arithmetic_shift(method, it).is_some(),
        _ => {}
    }
    replaced | collapse_shift_pair(method, it).is_some()
}

fn absorb_bit_ops(
    method: &mut Method,
    it: InstructionWalker,
    op: OpCode,
    out: LocalId,
    input: LocalId,
    distance: usize,
) -> bool {
    let out_value = method.local_value(out);
    let in_value = method.local_value(input);
    let mut replaced = false;
    let mut check = it.next_in_block();
    for _ in 0..distance {
        let Some(next) = check.get(method) else {
            break;
        };
        let second = next
            .operation()
            .filter(|o| matches!(o, OpCode::And | OpCode::Or))
            .filter(|_| can_replace_bit_op(next) && next.reads_local(out) && next.reads_local(input));
        if let (Some(second), Some(output)) = (second, next.output().cloned()) {
            let source = if second == op {
                out_value.clone()
            } else {
                in_value.clone()
            };
            debug!(
                "Replacing obsolete {} with move, its operands were combined by {} before",
                next.display(method),
                op
            );
            let mov = Instruction::mov(output, source).copy_extras_from(next);
            check.reset(method, mov);
            replaced = true;
        }
        if check
            .get(method)
            .is_some_and(|i| i.writes_local(out) || i.writes_local(input))
        {
            break;
        }
        check = check.next_in_block();
    }
    replaced
}

fn has_single_byte_extraction_writer(method: &Method, value: &Value) -> bool {
    let Some(writer) = value.as_local().and_then(|l| method.local(l).single_writer()) else {
        return false;
    };
    let writer = method.instruction(writer);
    matches!(writer.kind, InstrKind::Move { rotation: None, .. })
        && !writer.has_conditional_execution()
        && !writer.has_pack_mode()
        && writer.unpack.is_byte_extraction()
}

fn remove_byte_mask(method: &mut Method, it: InstructionWalker) -> Option<()> {
    let instr = it.get(method)?;
    if instr.has_unpack_mode() {
        return None;
    }
    let is_byte_mask = |v: &Value| method.evaluate_value(v, 3) == Some(Literal(255));
    let other = {
        let args = instr.args();
        let [first, second] = args.as_slice() else {
            return None;
        };
        if is_byte_mask(*first) {
            *second
        } else if is_byte_mask(*second) {
            *first
        } else {
            return None;
        }
    };
    if !has_single_byte_extraction_writer(method, other) {
        return None;
    }
    debug!(
        "Replacing redundant byte masking for value already extracted from single byte with move: {}",
        instr.display(method)
    );
    let mov = Instruction::mov(instr.output()?.clone(), other.clone()).copy_extras_from(instr);
    it.reset(method, mov);
    Some(())
}

fn downgrade_arithmetic_shift(method: &mut Method, it: InstructionWalker) -> Option<()> {
    let instr = it.get(method)?;
    if instr.set_flags || instr.has_pack_mode() {
        return None;
    }
    // the ALU only uses the low five bits of the offset
    let shift = instr.arg(1)?.as_literal()?.unsigned() & 0x1F;
    if shift == 0 {
        return None;
    }
    let mask = u32::MAX >> shift;
    let out = instr.output_local()?;
    let all_masked = method.local(out).users().iter().all(|(user, usage)| {
        if !usage.is_reader() {
            return true;
        }
        let reader = method.instruction(*user);
        if reader.operation() != Some(OpCode::And) || reader.has_unpack_mode() {
            return false;
        }
        let args = reader.args();
        let other = match args.as_slice() {
            [a, b] if a.has_local(out) && !b.has_local(out) => *b,
            [a, b] if b.has_local(out) && !a.has_local(out) => *a,
            _ => return false,
        };
        method
            .evaluate_value(other, 3)
            .is_some_and(|c| c.unsigned().wrapping_add(1).is_power_of_two() && c.unsigned() <= mask)
    });
    if !all_masked {
        return None;
    }
    debug!(
        "Replacing arithmetic shift with simpler bit-wise shift: {}",
        instr.display(method)
    );
    it.modify(method, |i| {
        if let InstrKind::Operation { op, .. } = &mut i.kind {
            *op = OpCode::Shr;
        }
    });
    Some(())
}

fn collapse_shift_pair(method: &mut Method, it: InstructionWalker) -> Option<()> {
    let instr = it.get(method)?;
    if instr.operation()? != OpCode::Shr
        || instr.has_unpack_mode()
        || instr.set_flags
        || instr.has_conditional_execution()
    {
        return None;
    }
    let shift = instr.arg(1)?.as_literal()?.unsigned() & 0x1F;
    if shift == 0 {
        return None;
    }
    let mask = u32::MAX >> shift;
    let writer_id = method.local(instr.arg(0)?.as_local()?).single_writer()?;
    let writer_pos = method
        .find_instruction(writer_id)
        .filter(|p| p.block() == it.block() && p.index() < it.index())?;
    let writer = method.instruction(writer_id);
    if writer.operation()? != OpCode::Shl
        || writer.has_pack_mode()
        || writer.has_unpack_mode()
        || writer.has_conditional_execution()
    {
        return None;
    }
    let writer_shift = method.evaluate_value(writer.arg(1)?, 3)?.unsigned() & 0x1F;
    if writer_shift != shift {
        return None;
    }
    let input = writer.arg(0)?.clone();
    if is_overwritten_between(method, writer_pos, it, &input) {
        return None;
    }
    debug!(
        "Replacing redundant left and right shift with same offset to and with mask: {}",
        instr.display(method)
    );
    it.modify(method, |i| {
        if let InstrKind::Operation { op, args, .. } = &mut i.kind {
            *op = OpCode::And;
            args[0] = input.with_type(args[0].ty().clone());
            args[1] = Value::uint(mask);
        }
    });
    Some(())
}
