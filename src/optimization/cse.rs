//! Common subexpression elimination inside basic blocks.

use log::debug;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::config::Configuration;
use crate::diagnostic::CompileResult;
use crate::ir::{BlockId, ExprOp, Expression, InstrId, Instruction, LocalId, Method, Register, Value};

/// An expression already computed into a local.
struct Available {
    instr: InstrId,
    output: Value,
    position: usize,
}

/// Operands whose value only depends on the instruction stream of the
/// block. Peripheral reads produce a different value every time.
fn is_cacheable_operand(value: &Value) -> bool {
    match value {
        Value::Local { .. } | Value::Literal { .. } => true,
        Value::Register { reg, .. } => matches!(reg, Register::ElementNumber | Register::QpuNumber),
        Value::Undefined(_) => false,
    }
}

fn is_cacheable(expr: &Expression) -> bool {
    is_cacheable_operand(&expr.first) && expr.second.as_ref().is_none_or(is_cacheable_operand)
}

/// Replace recomputations of an expression with a move of the local
/// holding its earlier result, and fold chains of associative operations
/// with literal operands.
///
/// Each block is handled on its own. A computed expression stays available
/// for `max_common_expression_distance` instructions and until one of its
/// operands or its output local is written again. Copies are not replaced,
/// that would only swap one move for another.
pub fn eliminate_common_subexpressions(method: &mut Method, config: &Configuration) -> CompileResult<bool> {
    let distance = config.additional_options.max_common_expression_distance as usize;
    let blocks: Vec<BlockId> = method.blocks().collect();
    let mut replaced = false;
    for block in blocks {
        replaced |= eliminate_in_block(method, block, distance);
    }
    Ok(replaced)
}

fn eliminate_in_block(method: &mut Method, block: BlockId, distance: usize) -> bool {
    let mut available: FxHashMap<Expression, Available> = FxHashMap::default();
    // expressions computed into a local, for folding them into readers
    let mut in_flight: FxHashMap<LocalId, Expression> = FxHashMap::default();
    let mut replaced = false;
    let mut position = 0usize;
    let mut it = method.walk_block(block).next_in_block();
    while let Some(id) = it.id(method) {
        position += 1;
        available.retain(|_, a| position - a.position <= distance);

        let instr = method.instruction(id);
        let written: SmallVec<[LocalId; 2]> = instr.outputs().iter().filter_map(|o| o.as_local()).collect();
        let output = instr.output().filter(|o| o.as_local().is_some()).cloned();
        let expr = Expression::from_instruction(instr).filter(is_cacheable);
        let (Some(expr), Some(output)) = (expr, output) else {
            invalidate(&mut available, &mut in_flight, &written);
            it = it.next_in_block();
            continue;
        };
        let Some(out) = output.as_local() else {
            it = it.next_in_block();
            continue;
        };
        in_flight.remove(&out);

        let prior = available
            .get(&expr)
            .filter(|a| a.instr != id && expr.op != ExprOp::Move && expr.constant_value().is_none())
            .map(|a| (a.instr, a.output.clone()));
        let mut recorded = expr.clone();
        if let Some((prior_instr, prior_output)) = prior {
            debug!(
                "Found common subexpression: {} is the same as {}",
                instr.display(method),
                method.instruction(prior_instr).display(method)
            );
            it.reset(method, Instruction::mov(output.clone(), prior_output));
            replaced = true;
        } else if let Some(combined) = expr.combine_with(&in_flight).filter(|c| *c != expr) {
            debug!("Folding {} into a single operation", instr.display(method));
            // the instruction keeps its id, so it cannot stay the source of
            // an expression it no longer computes
            available.retain(|_, a| a.instr != id);
            it.reset(method, combined.to_instruction(output.clone()));
            recorded = combined;
            replaced = true;
        }

        invalidate(&mut available, &mut in_flight, &written);
        if !recorded.reads_local(out) {
            in_flight.insert(out, recorded.clone());
            available.entry(recorded).or_insert(Available {
                instr: id,
                output,
                position,
            });
        }
        it = it.next_in_block();
    }
    replaced
}

/// Forget everything computed from or into the locals just written.
fn invalidate(
    available: &mut FxHashMap<Expression, Available>,
    in_flight: &mut FxHashMap<LocalId, Expression>,
    written: &[LocalId],
) {
    for local in written {
        available.retain(|expr, a| !expr.reads_local(*local) && !a.output.has_local(*local));
        in_flight.retain(|key, expr| key != local && !expr.reads_local(*local));
    }
}
