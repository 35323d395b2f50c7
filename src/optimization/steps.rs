//! Single-instruction rewrites, run together in one walk.

use log::debug;

use crate::config::Configuration;
use crate::diagnostic::{CompilationError, CompileResult};
use crate::ir::types::TYPE_FLOAT;
use crate::ir::{
    BasicBlock, Decorations, DelayType, InstrKind, Instruction, InstructionWalker, Literal, Method,
    OpCode, Register, SideEffects, UseRole, Value,
};
use crate::periphery::{precalculate_sfu, SFU_DELAY_NOPS};

/// No flags, signals or (un)pack modes which a replacement would have
/// to keep.
fn is_simple_operation(instr: &Instruction) -> bool {
    matches!(instr.kind, InstrKind::Operation { .. })
        && !instr.has_side_effects()
        && !instr.has_pack_mode()
        && !instr.has_unpack_mode()
}

fn has_literal(value: &Value, literal: Option<Literal>) -> bool {
    literal.is_some_and(|l| value.as_literal() == Some(l))
}

/// A move replacing `instr`, keeping its condition and decorations.
fn move_replacing(instr: &Instruction, output: Value, source: Value) -> Instruction {
    let mut mov = Instruction::mov(output, source).with_condition(instr.condition);
    mov.set_flags = instr.set_flags;
    mov.with_decorations(instr.decorations)
}

/// Replace operations which do not compute anything with moves, or drop
/// them if they write their own input unchanged.
///
/// Operands are pre-evaluated through their single writer, so `%a = 0;
/// %b = %c and %a` is recognized as a move of 0.
pub fn simplify_operation(
    method: &mut Method,
    it: InstructionWalker,
    _config: &Configuration,
) -> CompileResult<InstructionWalker> {
    let Some(instr) = it.get(method) else {
        return Ok(it);
    };
    match &instr.kind {
        InstrKind::Operation { .. } if is_simple_operation(instr) => simplify_arithmetic(method, it),
        InstrKind::Move { .. } => Ok(simplify_move(method, it)),
        _ => Ok(it),
    }
}

fn simplify_arithmetic(method: &mut Method, it: InstructionWalker) -> CompileResult<InstructionWalker> {
    let Some(instr) = it.get(method) else {
        return Ok(it);
    };
    let InstrKind::Operation { op, output, args } = &instr.kind else {
        return Ok(it);
    };
    let (op, output) = (*op, output.clone());
    let Some(raw_first) = args.first().cloned() else {
        return Ok(it);
    };
    let raw_second = args.get(1).cloned();
    let pre_evaluate = |value: &Value| {
        method
            .evaluate_value(value, 3)
            .map(|l| Value::literal(l, value.ty().clone()))
            .unwrap_or_else(|| value.clone())
    };
    let first = pre_evaluate(&raw_first);
    let second = raw_second.as_ref().map(pre_evaluate);
    let same_operands = second.as_ref() == Some(&first);
    let plain_operand = first.as_register().is_none() && !first.is_undefined();

    let original = instr.clone();
    let text = instr.display(method).to_string();
    let replacement = if let Some(z) = op.left_absorbing_element().filter(|z| has_literal(&first, Some(*z))) {
        debug!("Replacing obsolete {} with move 1", text);
        Some(move_replacing(&original, output.clone(), Value::literal(z, output.ty().clone())))
    } else if let Some(z) = op.right_absorbing_element().filter(|z| second.as_ref().is_some_and(|s| has_literal(s, Some(*z)))) {
        debug!("Replacing obsolete {} with move 2", text);
        Some(move_replacing(&original, output.clone(), Value::literal(z, output.ty().clone())))
    } else if op.is_self_inverse() && same_operands && !first.ty().element_type().is_bool() {
        debug!("Replacing obsolete {} with move 7", text);
        Some(move_replacing(&original, output.clone(), Value::literal(Literal(0), output.ty().clone())))
    } else if output == raw_first {
        let no_op = second.as_ref().is_some_and(|s| has_literal(s, op.right_identity()))
            || (op.is_idempotent() && same_operands);
        if no_op {
            debug!("Removing obsolete {}", text);
            return Ok(it.erase(method).previous_in_block());
        }
        None
    } else if raw_second.as_ref() == Some(&output) {
        let no_op = has_literal(&first, op.left_identity())
            || (op.is_idempotent() && same_operands && plain_operand);
        if no_op {
            debug!("Removing obsolete {}", text);
            return Ok(it.erase(method).previous_in_block());
        }
        None
    } else if second.as_ref().is_some_and(|s| has_literal(s, op.right_identity())) {
        debug!("Replacing obsolete {} with move 3", text);
        Some(move_replacing(&original, output, raw_first))
    } else if let Some(second_arg) = raw_second.clone().filter(|_| has_literal(&first, op.left_identity())) {
        debug!("Replacing obsolete {} with move 4", text);
        Some(move_replacing(&original, output, second_arg))
    } else if let Some(second_arg) = raw_second.clone().filter(|_| op.is_idempotent() && same_operands && plain_operand) {
        debug!("Replacing obsolete {} with move 5", text);
        Some(move_replacing(&original, output, second_arg))
    } else if op == OpCode::Xor && raw_first.as_literal() == Some(Literal::int(-1)) {
        debug!("Replacing XOR {} with NOT", text);
        raw_second.map(|arg| not_replacing(&original, output, arg))
    } else if op == OpCode::Xor && raw_second.as_ref().and_then(Value::as_literal) == Some(Literal::int(-1)) {
        debug!("Replacing XOR {} with NOT", text);
        Some(not_replacing(&original, output, raw_first))
    } else {
        None
    };
    if let Some(replacement) = replacement {
        it.reset(method, replacement);
    }
    Ok(it)
}

fn not_replacing(instr: &Instruction, output: Value, arg: Value) -> Instruction {
    let mut not = Instruction::unary(OpCode::Not, output, arg).with_condition(instr.condition);
    not.set_flags = instr.set_flags;
    not.with_decorations(instr.decorations)
}

fn simplify_move(method: &mut Method, it: InstructionWalker) -> InstructionWalker {
    let Some(instr) = it.get(method) else {
        return it;
    };
    let InstrKind::Move {
        output,
        source,
        rotation,
    } = &instr.kind
    else {
        return it;
    };
    if source == output && instr.is_simple_move() && !instr.has_side_effects() {
        debug!("Removing obsolete {}", instr.display(method));
        return it.erase(method).previous_in_block();
    }
    if rotation.is_some() && source.is_all_lanes_equal() {
        debug!("Replacing obsolete {} with move 6", instr.display(method));
        let replacement = Instruction::mov(output.clone(), source.clone())
            .copy_extras_from(instr)
            .with_decorations(instr.decorations);
        it.reset(method, replacement);
    }
    it
}

/// Replace an operation on constant operands with a move of the result.
///
/// Flag-setting and (un)packing operations are kept, a move cannot
/// reproduce their effects. So are self-xors under a condition, which are
/// generated deliberately, and operations materializing a constant.
pub fn fold_constants(
    method: &mut Method,
    it: InstructionWalker,
    _config: &Configuration,
) -> CompileResult<InstructionWalker> {
    let Some(id) = it.id(method) else {
        return Ok(it);
    };
    let instr = method.instruction(id);
    let InstrKind::Operation { op, output, args } = &instr.kind else {
        return Ok(it);
    };
    if instr.set_flags || instr.has_pack_mode() || instr.has_unpack_mode() {
        return Ok(it);
    }
    if !args.iter().all(|arg| method.evaluate_value(arg, 3).is_some()) {
        return Ok(it);
    }
    if instr.has_conditional_execution() && *op == OpCode::Xor && args.first() == args.get(1) {
        return Ok(it);
    }
    if instr.decorations.contains(Decorations::CONSTANT_LOAD) {
        return Ok(it);
    }
    let Some(value) = method.precalculate(id, 3) else {
        return Ok(it);
    };
    let output = output.clone();
    debug!(
        "Replacing '{}' with constant value: {}",
        instr.display(method),
        value.signed()
    );
    let replacement = Instruction::mov(output.clone(), Value::literal(value, output.ty().clone()))
        .copy_extras_from(instr)
        .with_decorations(instr.decorations);
    it.reset(method, replacement);
    Ok(it)
}

/// Replace a return with a branch to the end of the kernel, creating the
/// final block if needed.
pub fn eliminate_return(
    method: &mut Method,
    it: InstructionWalker,
    _config: &Configuration,
) -> CompileResult<InstructionWalker> {
    let Some(instr) = it.get(method) else {
        return Ok(it);
    };
    if !matches!(instr.kind, InstrKind::Return) {
        return Ok(it);
    }
    let condition = instr.condition;
    let target = match method.find_block_by_name(BasicBlock::LAST_BLOCK) {
        Some(block) => block,
        None => method.create_and_insert_new_block(method.num_blocks(), BasicBlock::LAST_BLOCK),
    };
    let label = method.block(target).label();
    debug!("Replacing return in kernel-function {} with branch to end-label", method.name);
    it.reset(method, Instruction::branch(label).with_condition(condition));
    Ok(it)
}

/// Pre-calculate a special-function-unit call on a constant input.
///
/// The trigger and its delay NOPs are removed and the read of the result
/// register reads the result directly.
pub fn rewrite_constant_sfu_call(
    method: &mut Method,
    it: InstructionWalker,
    _config: &Configuration,
) -> CompileResult<InstructionWalker> {
    let Some(id) = it.id(method) else {
        return Ok(it);
    };
    let instr = method.instruction(id);
    let Some(reg) = instr.output_register().filter(|r| r.is_special_functions_unit()) else {
        return Ok(it);
    };
    if instr.has_conditional_execution()
        || instr.has_other_side_effects(SideEffects::REGISTER_WRITE)
        || instr.has_pack_mode()
        || instr.has_unpack_mode()
    {
        return Ok(it);
    }
    let Some(result) = method
        .precalculate(id, 3)
        .and_then(|input| precalculate_sfu(reg, input))
    else {
        return Ok(it);
    };
    let text = instr.display(method).to_string();
    debug!(
        "Replacing SFU call with constant input '{}' to move of result: {}",
        text,
        result.real_value()
    );

    let mut it = it.erase(method);
    let mut delays = SFU_DELAY_NOPS;
    while delays != 0 && !it.is_end_of_block(method) {
        let is_delay = matches!(
            it.get(method).map(|i| &i.kind),
            Some(InstrKind::Nop {
                delay: DelayType::WaitSfu
            })
        );
        if is_delay {
            it = it.erase(method);
            delays -= 1;
        } else {
            it = it.next_in_block();
        }
    }
    if delays != 0 {
        return Err(
            CompilationError::optimizer("Failed to find both NOPs for waiting for SFU result").with_context(text),
        );
    }

    while !it.is_end_of_block(method) {
        if let Some(reader) = it.get(method).filter(|i| i.reads_register(Register::SfuOut)) {
            match &reader.kind {
                InstrKind::Move {
                    output,
                    rotation: None,
                    ..
                } => {
                    let replacement = Instruction::mov(output.clone(), Value::literal(result, output.ty().clone()))
                        .copy_extras_from(reader)
                        .with_decorations(reader.decorations);
                    it.reset(method, replacement);
                }
                _ => {
                    let r4 = Value::register(Register::SfuOut, TYPE_FLOAT);
                    let literal = Value::literal(result, TYPE_FLOAT);
                    it.modify(method, |i| i.replace_value(&r4, &literal, UseRole::Reader));
                }
            }
            return Ok(it.previous_in_block());
        }
        it = it.next_in_block();
    }
    Err(CompilationError::optimizer("Failed to find the reading of the SFU result").with_context(text))
}
