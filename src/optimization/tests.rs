use super::*;
use crate::diagnostic::CompilationStep;
use crate::ir::types::{TYPE_FLOAT, TYPE_INT32};
use crate::ir::{
    BasicBlock, BuiltinKind, Condition, DelayType, InstrKind, Instruction, Literal, LocalId,
    LocalKind, MemoryOp, OpCode, Register, Signal, UnpackMode, Value,
};
use crate::testing::{assert_uses_consistent, interpret, KernelBuilder};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

fn store(out: &Value, value: Value) -> Instruction {
    Instruction::memory(MemoryOp::Write, out.clone(), value, Value::int(1))
}

fn body(m: &Method) -> Vec<String> {
    m.to_text()
        .lines()
        .filter(|l| l.starts_with("    "))
        .map(|l| l.trim().to_string())
        .collect()
}

fn steps(m: &mut Method, steps: &[StepFn]) -> bool {
    run_single_steps(m, steps, &Configuration::default()).unwrap()
}

// ─── Dead code ────────────────────────────────────────────────────

#[test]
fn dead_local_disappears() {
    let mut k = KernelBuilder::new("dead");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x, a.clone(), Value::int(1)));
    k.push(Instruction::op(OpCode::Add, y.clone(), a, Value::int(2)));
    k.push(store(&out, y));
    let mut m = k.finish();

    assert!(eliminate_dead_code(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m), vec!["%y = add %a, 2", "store %y -> %out"]);
    assert!(m.find_local("%x").is_none());
    assert_uses_consistent(&m);
}

#[test]
fn dead_code_elimination_is_idempotent() {
    let mut k = KernelBuilder::new("dead");
    let a = k.param("%a");
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x.clone(), a, Value::int(1)));
    k.push(Instruction::op(OpCode::Shl, y, x, Value::int(1)));
    let mut m = k.finish();

    // the chain dies in one run, the walk steps back to the writer of %x
    assert!(eliminate_dead_code(&mut m, &Configuration::default()).unwrap());
    assert!(body(&m).is_empty());
    let text = m.to_text();
    assert!(!eliminate_dead_code(&mut m, &Configuration::default()).unwrap());
    assert_eq!(m.to_text(), text);
}

#[test]
fn overwritten_write_is_removed() {
    let mut k = KernelBuilder::new("overwrite");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    k.push(Instruction::op(OpCode::Add, x.clone(), a.clone(), Value::int(1)));
    k.push(Instruction::op(OpCode::Add, x.clone(), a, Value::int(2)));
    k.push(store(&out, x));
    let mut m = k.finish();

    eliminate_dead_code(&mut m, &Configuration::default()).unwrap();
    assert_eq!(body(&m), vec!["%x = add %a, 2", "store %x -> %out"]);
}

#[test]
fn conditional_overwrite_keeps_write() {
    let mut k = KernelBuilder::new("overwrite");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    k.push(Instruction::op(OpCode::Add, x.clone(), a.clone(), Value::int(1)));
    k.push(Instruction::op(OpCode::Add, x.clone(), a, Value::int(2)).with_condition(Condition::ZeroSet));
    k.push(store(&out, x));
    let mut m = k.finish();

    assert!(!eliminate_dead_code(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m).len(), 3);
}

#[test]
fn copies_between_locals_are_merged() {
    let mut k = KernelBuilder::new("merge");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x.clone(), a, Value::int(1)));
    k.push(Instruction::mov(y.clone(), x));
    k.push(store(&out, y));
    let mut m = k.finish();

    eliminate_dead_code(&mut m, &Configuration::default()).unwrap();
    assert_eq!(body(&m), vec!["%x = add %a, 1", "store %x -> %out"]);
    assert!(m.find_local("%y").is_none());
    assert_uses_consistent(&m);
}

#[test]
fn copies_are_not_merged_over_source_writes() {
    let mut k = KernelBuilder::new("merge");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x.clone(), a.clone(), Value::int(1)));
    k.push(Instruction::mov(y.clone(), x.clone()));
    k.push(Instruction::op(OpCode::Add, x.clone(), a, Value::int(2)));
    k.push(store(&out, x));
    k.push(store(&out, y));
    let mut m = k.finish();

    assert!(!eliminate_dead_code(&mut m, &Configuration::default()).unwrap());
}

#[test]
fn unused_work_group_uniform_is_dropped() {
    let mut k = KernelBuilder::new("uniforms");
    let group = k.method.find_or_create_builtin(BuiltinKind::GroupIdX);
    let group = k.method.local_value(group);
    k.push(Instruction::mov(group, Value::register(Register::Uniform, TYPE_INT32)));
    let mut m = k.finish();
    assert!(m.metadata.uniforms_used.is_used(BuiltinKind::GroupIdX));

    assert!(eliminate_dead_code(&mut m, &Configuration::default()).unwrap());
    assert!(body(&m).is_empty());
    assert!(!m.metadata.uniforms_used.is_used(BuiltinKind::GroupIdX));
}

#[test]
fn unused_r5_write_is_removed() {
    let mut k = KernelBuilder::new("r5");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let r5 = Value::register(Register::Acc5, TYPE_INT32);
    k.push(Instruction::mov(Value::register(Register::ReplicateAll, TYPE_INT32), a.clone()));
    k.push(Instruction::mov(r5.clone(), a));
    k.push(Instruction::mov(x.clone(), r5));
    k.push(store(&out, x));
    let mut m = k.finish();

    eliminate_dead_code(&mut m, &Configuration::default()).unwrap();
    assert_eq!(body(&m), vec!["r5 = %a", "%x = r5", "store %x -> %out"]);
}

// ─── Single steps ─────────────────────────────────────────────────

#[test]
fn constant_and_is_folded() {
    let mut k = KernelBuilder::new("fold");
    let x = k.local("%x");
    let pos = k.push(Instruction::op(OpCode::And, x.clone(), Value::int(0xFF), Value::int(0x0F)));
    let mut m = k.finish();

    assert!(steps(&mut m, &[fold_constants]));
    let instr = pos.get(&m).unwrap();
    assert!(matches!(
        &instr.kind,
        InstrKind::Move { source, .. } if source.as_literal() == Some(Literal(0x0F))
    ));
}

#[test]
fn folding_matches_evaluation_in_both_operand_orders() {
    let ops = [OpCode::Add, OpCode::Mul, OpCode::And, OpCode::Or, OpCode::Xor, OpCode::Min, OpCode::Max];
    for op in ops {
        assert!(op.is_commutative() && op.is_associative());
        for (first, second) in [(7, 12), (-3, 9), (0x70, -1)] {
            let expected = op.evaluate(Literal::int(first), Some(Literal::int(second)));
            for (l, r) in [(first, second), (second, first)] {
                let mut k = KernelBuilder::new("fold");
                let x = k.local("%x");
                let pos = k.push(Instruction::op(op, x, Value::int(l), Value::int(r)));
                let mut m = k.finish();
                steps(&mut m, &[fold_constants]);
                let folded = pos.get(&m).and_then(Instruction::move_source).and_then(Value::as_literal);
                assert_eq!(folded, expected, "{} {} {}", op, l, r);
            }
        }
    }
}

#[test]
fn folding_resolves_single_writers() {
    let mut k = KernelBuilder::new("fold");
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::load_immediate(x.clone(), Literal::int(20)));
    let pos = k.push(Instruction::op(OpCode::Sub, y, x, Value::int(5)));
    let mut m = k.finish();

    steps(&mut m, &[fold_constants]);
    assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), "%y = 15");
}

#[test]
fn flag_setting_operations_are_not_folded() {
    let mut k = KernelBuilder::new("fold");
    let x = k.local("%x");
    k.push(Instruction::op(OpCode::Add, x, Value::int(1), Value::int(2)).with_flags());
    let mut m = k.finish();
    assert!(!steps(&mut m, &[fold_constants]));
}

#[test]
fn arithmetic_identities_become_moves() {
    let cases = [
        (OpCode::Add, Some(0), None, "%x = %a"),
        (OpCode::Or, None, Some(0), "%x = %a"),
        (OpCode::And, Some(0), None, "%x = 0"),
        (OpCode::Or, Some(-1), None, "%x = -1"),
        (OpCode::Shl, None, Some(0), "%x = 0"),
        (OpCode::Xor, Some(-1), None, "%x = not %a"),
    ];
    for (op, right, left, expected) in cases {
        let mut k = KernelBuilder::new("simplify");
        let a = k.param("%a");
        let x = k.local("%x");
        let (first, second) = match (left, right) {
            (Some(l), _) => (Value::int(l), a.clone()),
            (None, Some(r)) => (a.clone(), Value::int(r)),
            (None, None) => unreachable!(),
        };
        let pos = k.push(Instruction::op(op, x, first, second));
        let mut m = k.finish();
        steps(&mut m, &[simplify_operation]);
        assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), expected, "{}", op);
    }
}

#[test]
fn self_inverse_on_equal_operands_is_zero() {
    let mut k = KernelBuilder::new("simplify");
    let a = k.param("%a");
    let x = k.local("%x");
    let pos = k.push(Instruction::op(OpCode::Xor, x, a.clone(), a));
    let mut m = k.finish();
    steps(&mut m, &[simplify_operation]);
    assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), "%x = 0");
}

#[test]
fn operations_rewriting_their_input_are_removed() {
    let mut k = KernelBuilder::new("simplify");
    let a = k.param("%a");
    let x = k.local("%x");
    k.push(Instruction::mov(x.clone(), a));
    k.push(Instruction::op(OpCode::Add, x.clone(), x.clone(), Value::int(0)));
    k.push(Instruction::op(OpCode::Max, x.clone(), x.clone(), x.clone()));
    let mut m = k.finish();

    assert!(steps(&mut m, &[simplify_operation]));
    assert_eq!(body(&m), vec!["%x = %a"]);
    assert_uses_consistent(&m);
}

#[test]
fn rotation_of_uniform_value_is_a_move() {
    let mut k = KernelBuilder::new("simplify");
    let x = k.local("%x");
    let pos = k.push(Instruction::rotate(x, Value::int(5), Value::int(3)));
    let mut m = k.finish();
    steps(&mut m, &[simplify_operation]);
    assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), "%x = 5");
}

#[test]
fn return_becomes_branch_to_end_block() {
    let mut k = KernelBuilder::new("ret");
    let a = k.param("%a");
    let x = k.local("%x");
    k.push(Instruction::op(OpCode::Add, x, a, Value::int(1)));
    let pos = k.push(Instruction::ret().with_condition(Condition::ZeroClear));
    let mut m = k.finish();

    assert!(steps(&mut m, &[eliminate_return]));
    let end = m.find_block_by_name(BasicBlock::LAST_BLOCK).unwrap();
    assert_eq!(m.last_block(), Some(end));
    let branch = pos.get(&m).unwrap();
    assert_eq!(branch.branch_target(), Some(m.block(end).label()));
    assert_eq!(branch.condition, Condition::ZeroClear);
}

fn sfu_kernel(nops: usize) -> (Method, Value) {
    let mut k = KernelBuilder::new("sfu");
    let out = k.buffer("%out", TYPE_FLOAT, false);
    let x = k.method.create_local(TYPE_FLOAT, "%x", LocalKind::Plain);
    let x = k.method.local_value(x);
    k.push(Instruction::mov(
        Value::register(Register::SfuRecip, TYPE_FLOAT),
        Value::literal(Literal::real(4.0), TYPE_FLOAT),
    ));
    for _ in 0..nops {
        k.push(Instruction::nop(DelayType::WaitSfu));
    }
    k.push(Instruction::mov(x.clone(), Value::register(Register::SfuOut, TYPE_FLOAT)));
    k.push(store(&out, x));
    (k.finish(), out)
}

#[test]
fn constant_sfu_call_is_precalculated() {
    let (mut m, _) = sfu_kernel(2);
    let before = interpret(&m, &FxHashMap::default());

    assert!(steps(&mut m, &[rewrite_constant_sfu_call]));
    assert_eq!(body(&m), vec!["%x = 0.25", "store %x -> %out"]);
    assert_eq!(interpret(&m, &FxHashMap::default()), before);
    assert_eq!(before, vec![Literal::real(0.25).unsigned()]);
}

#[test]
fn constant_sfu_call_without_delays_is_an_error() {
    let (mut m, _) = sfu_kernel(1);
    let err = run_single_steps(&mut m, &[rewrite_constant_sfu_call], &Configuration::default()).unwrap_err();
    assert_eq!(err.step, CompilationStep::Optimizer);
    assert!(err.message.contains("NOPs"));
}

// ─── Moves ────────────────────────────────────────────────────────

#[test]
fn moves_are_propagated_and_folded() {
    let mut k = KernelBuilder::new("propagate");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    let z = k.local("%z");
    let c = k.local("%c");
    k.push(Instruction::mov(x.clone(), a));
    k.push(Instruction::op(OpCode::Add, y.clone(), x, Value::int(1)));
    k.push(Instruction::mov(c.clone(), Value::int(6)));
    k.push(Instruction::op(OpCode::Mul, z.clone(), c, Value::int(7)));
    k.push(store(&out, y));
    k.push(store(&out, z));
    let mut m = k.finish();

    assert!(propagate_moves(&mut m, &Configuration::default()).unwrap());
    assert_eq!(
        body(&m),
        vec!["%x = %a", "%y = add %a, 1", "%c = 6", "%z = 42", "store %y -> %out", "store %z -> %out"]
    );
    assert_uses_consistent(&m);
}

#[test]
fn large_literals_are_not_propagated() {
    let mut k = KernelBuilder::new("propagate");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    k.push(Instruction::mov(x.clone(), Value::int(1000)));
    k.push(store(&out, x));
    let mut m = k.finish();
    assert!(!propagate_moves(&mut m, &Configuration::default()).unwrap());
}

#[test]
fn propagation_stops_at_source_write() {
    let mut k = KernelBuilder::new("propagate");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let s = k.local("%s");
    k.push(Instruction::op(OpCode::Add, s.clone(), a.clone(), Value::int(1)));
    k.push(Instruction::mov(x.clone(), s.clone()));
    k.push(Instruction::op(OpCode::Add, s, a, Value::int(2)));
    k.push(store(&out, x));
    let mut m = k.finish();

    assert!(!propagate_moves(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m)[3], "store %x -> %out");
}

#[test]
fn self_moves_are_removed() {
    let mut k = KernelBuilder::new("moves");
    let x = k.local("%x");
    k.push(Instruction::mov(x.clone(), x.clone()));
    k.push(Instruction::mov(x.clone(), x).with_signal(Signal::ThreadSwitch));
    let mut m = k.finish();

    assert!(eliminate_redundant_moves(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m), vec!["nop (WaitRegister) (thrsw)"]);
}

#[test]
fn move_between_single_use_locals_is_removed() {
    let mut k = KernelBuilder::new("moves");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let t = k.local("%t");
    let y = k.local("%y");
    let z = k.local("%z");
    k.push(Instruction::op(OpCode::Add, t.clone(), a.clone(), Value::int(1)));
    k.push(Instruction::mov(y.clone(), t));
    k.push(Instruction::op(OpCode::Xor, z.clone(), y, a));
    k.push(store(&out, z));
    let mut m = k.finish();

    assert!(eliminate_redundant_moves(&mut m, &Configuration::default()).unwrap());
    assert_eq!(
        body(&m),
        vec!["%t = add %a, 1", "%z = xor %t, %a", "store %z -> %out"]
    );
    assert_uses_consistent(&m);
}

#[test]
fn producer_writes_register_directly() {
    let mut k = KernelBuilder::new("moves");
    let a = k.param("%a");
    let b = k.param("%b");
    let out = k.buffer("%out", TYPE_INT32, false);
    let t = k.local("%t");
    let r0 = Value::register(Register::Accumulator(0), TYPE_INT32);
    k.push(Instruction::op(OpCode::Add, t.clone(), a, b));
    k.push(Instruction::mov(r0.clone(), t));
    k.push(store(&out, r0));
    let mut m = k.finish();

    assert!(eliminate_redundant_moves(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m), vec!["r0 = add %a, %b", "store r0 -> %out"]);
    assert_uses_consistent(&m);
}

#[test]
fn register_read_is_moved_into_consumer() {
    let mut k = KernelBuilder::new("moves");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::mov(x.clone(), Value::register(Register::Uniform, TYPE_INT32)));
    k.push(Instruction::op(OpCode::Add, y.clone(), x, a));
    k.push(store(&out, y));
    let mut m = k.finish();

    assert!(eliminate_redundant_moves(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m), vec!["%y = add unif, %a", "store %y -> %out"]);
}

#[test]
fn register_read_is_not_moved_across_other_reads() {
    let mut k = KernelBuilder::new("moves");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    let z = k.local("%z");
    let unif = Value::register(Register::Uniform, TYPE_INT32);
    k.push(Instruction::mov(x.clone(), unif.clone()));
    k.push(Instruction::mov(z.clone(), unif));
    k.push(Instruction::op(OpCode::Add, y.clone(), x, a));
    k.push(store(&out, y));
    k.push(store(&out, z));
    let mut m = k.finish();

    eliminate_redundant_moves(&mut m, &Configuration::default()).unwrap();
    assert_eq!(body(&m)[0], "%x = unif");
}

// ─── Bit operations ───────────────────────────────────────────────

#[test]
fn repeated_bit_operations_are_absorbed() {
    let cases = [
        (OpCode::And, OpCode::And, "%z = %o"),
        (OpCode::And, OpCode::Or, "%z = %a"),
        (OpCode::Or, OpCode::Or, "%z = %o"),
        (OpCode::Or, OpCode::And, "%z = %a"),
    ];
    for (first, second, expected) in cases {
        let mut k = KernelBuilder::new("bits");
        let a = k.param("%a");
        let b = k.param("%b");
        let out = k.buffer("%out", TYPE_INT32, false);
        let o = k.local("%o");
        let z = k.local("%z");
        k.push(Instruction::op(first, o.clone(), a.clone(), b));
        let pos = k.push(Instruction::op(second, z.clone(), o, a));
        k.push(store(&out, z));
        let mut m = k.finish();

        assert!(eliminate_redundant_bit_op(&mut m, &Configuration::default()).unwrap());
        assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), expected);
    }
}

#[test]
fn masking_an_extracted_byte_is_a_move() {
    let mut k = KernelBuilder::new("bits");
    let a = k.param("%a");
    let e = k.local("%e");
    let x = k.local("%x");
    k.push(Instruction::mov(e.clone(), a).with_unpack(UnpackMode::Unpack8A));
    let pos = k.push(Instruction::op(OpCode::And, x, Value::int(255), e));
    let mut m = k.finish();

    assert!(eliminate_redundant_bit_op(&mut m, &Configuration::default()).unwrap());
    assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), "%x = %e");
}

#[test]
fn masked_arithmetic_shift_becomes_logical() {
    let mut k = KernelBuilder::new("bits");
    let a = k.param("%a");
    let s = k.local("%s");
    let x = k.local("%x");
    let pos = k.push(Instruction::op(OpCode::Asr, s.clone(), a, Value::int(4)));
    k.push(Instruction::op(OpCode::And, x, s, Value::int(0xFF)));
    let mut m = k.finish();

    assert!(eliminate_redundant_bit_op(&mut m, &Configuration::default()).unwrap());
    assert_eq!(pos.get(&m).unwrap().operation(), Some(OpCode::Shr));
}

#[test]
fn wide_mask_keeps_arithmetic_shift() {
    let mut k = KernelBuilder::new("bits");
    let a = k.param("%a");
    let s = k.local("%s");
    let x = k.local("%x");
    let pos = k.push(Instruction::op(OpCode::Asr, s.clone(), a, Value::int(28)));
    k.push(Instruction::op(OpCode::And, x, s, Value::int(0xFF)));
    let mut m = k.finish();

    eliminate_redundant_bit_op(&mut m, &Configuration::default()).unwrap();
    assert_eq!(pos.get(&m).unwrap().operation(), Some(OpCode::Asr));
}

#[test]
fn shift_pair_becomes_mask() {
    let mut k = KernelBuilder::new("bits");
    let a = k.param("%a");
    let t = k.local("%t");
    let u = k.local("%u");
    k.push(Instruction::op(OpCode::Shl, t.clone(), a, Value::int(8)));
    let pos = k.push(Instruction::op(OpCode::Shr, u, t, Value::int(8)));
    let mut m = k.finish();

    assert!(eliminate_redundant_bit_op(&mut m, &Configuration::default()).unwrap());
    assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), "%u = and %a, 16777215");
    assert_uses_consistent(&m);
}

// ─── Common subexpressions ────────────────────────────────────────

#[test]
fn recomputation_reads_earlier_result() {
    let mut k = KernelBuilder::new("cse");
    let a = k.param("%a");
    let b = k.param("%b");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x.clone(), a.clone(), b.clone()));
    k.push(Instruction::op(OpCode::Add, y.clone(), b, a));
    k.push(store(&out, x));
    k.push(store(&out, y));
    let mut m = k.finish();

    assert!(eliminate_common_subexpressions(&mut m, &Configuration::default()).unwrap());
    assert_eq!(body(&m)[1], "%y = %x");
}

#[test]
fn operand_write_ends_availability() {
    let mut k = KernelBuilder::new("cse");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let v = k.local("%v");
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::mov(v.clone(), a.clone()));
    k.push(Instruction::op(OpCode::Add, x.clone(), v.clone(), a.clone()));
    k.push(Instruction::op(OpCode::Sub, v.clone(), v.clone(), Value::int(1)));
    k.push(Instruction::op(OpCode::Add, y.clone(), v, a));
    k.push(store(&out, x));
    k.push(store(&out, y));
    let mut m = k.finish();

    assert!(!eliminate_common_subexpressions(&mut m, &Configuration::default()).unwrap());
}

#[test]
fn chained_literal_operations_are_combined() {
    let mut k = KernelBuilder::new("cse");
    let a = k.param("%a");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x.clone(), a, Value::int(3)));
    let pos = k.push(Instruction::op(OpCode::Add, y.clone(), x.clone(), Value::int(4)));
    k.push(store(&out, x));
    k.push(store(&out, y));
    let mut m = k.finish();

    assert!(eliminate_common_subexpressions(&mut m, &Configuration::default()).unwrap());
    assert_eq!(pos.get(&m).unwrap().display(&m).to_string(), "%y = add %a, 7");
    assert_uses_consistent(&m);
}

#[test]
fn availability_is_limited_by_distance() {
    let mut k = KernelBuilder::new("cse");
    let a = k.param("%a");
    let b = k.param("%b");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::op(OpCode::Add, x.clone(), a.clone(), b.clone()));
    for _ in 0..4 {
        k.push(store(&out, x.clone()));
    }
    k.push(Instruction::op(OpCode::Add, y.clone(), a, b));
    k.push(store(&out, y));
    let mut m = k.finish();

    let mut config = Configuration::default();
    config.additional_options.max_common_expression_distance = 2;
    assert!(!eliminate_common_subexpressions(&mut m, &config).unwrap());
    config.additional_options.max_common_expression_distance = 8;
    assert!(eliminate_common_subexpressions(&mut m, &config).unwrap());
}

// ─── Driver ───────────────────────────────────────────────────────

#[test]
fn passes_are_enabled_by_level() {
    let none = Configuration::with_level(OptimizationLevel::None);
    let basic = Configuration::with_level(OptimizationLevel::Basic);
    let medium = Configuration::with_level(OptimizationLevel::Medium);
    let full = Configuration::with_level(OptimizationLevel::Full);

    assert!(PASSES.iter().all(|p| !Optimizer::is_enabled(p.name, &none)));
    assert!(Optimizer::is_enabled("fold-constants", &basic));
    assert!(!Optimizer::is_enabled("propagate-moves", &basic));
    assert!(Optimizer::is_enabled("propagate-moves", &medium));
    assert!(!Optimizer::is_enabled("eliminate-common-subexpressions", &medium));
    assert!(PASSES.iter().all(|p| Optimizer::is_enabled(p.name, &full)));
    assert!(Optimizer::is_enabled(CACHE_MEMORY, &medium));
    assert!(!Optimizer::is_enabled(CACHE_MEMORY, &basic));
    assert!(!Optimizer::new(&none).has_passes());
}

#[test]
fn explicit_switches_override_level() {
    let config = Configuration::with_level(OptimizationLevel::Basic)
        .enable("eliminate-common-subexpressions")
        .disable("fold-constants")
        .enable("fold-constants")
        .enable("no-such-pass");
    assert!(Optimizer::is_enabled("eliminate-common-subexpressions", &config));
    assert!(!Optimizer::is_enabled("fold-constants", &config));
    assert!(Optimizer::is_enabled("no-such-pass", &config));
    assert!(!Optimizer::is_enabled("other-unknown-pass", &config));
    assert!(find_pass("no-such-pass").is_none());
}

#[test]
fn optimizer_reaches_fixpoint() {
    let mut k = KernelBuilder::new("fixpoint");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::mov(x.clone(), Value::int(2)));
    k.push(Instruction::op(OpCode::Add, y.clone(), x, Value::int(3)));
    k.push(store(&out, y));
    let mut m = k.finish();

    let config = Configuration::with_level(OptimizationLevel::Full);
    let optimizer = Optimizer::new(&config);
    assert!(optimizer.optimize_method(&mut m).unwrap());
    insta::assert_snapshot!(m.to_text(), @r"
    label: %start_of_function
        store 5 -> %out
    ");
    assert!(!optimizer.optimize_method(&mut m).unwrap());
    assert_uses_consistent(&m);
}

#[test]
fn optimizer_stops_at_iteration_limit() {
    let mut k = KernelBuilder::new("limit");
    let out = k.buffer("%out", TYPE_INT32, false);
    let x = k.local("%x");
    let y = k.local("%y");
    k.push(Instruction::mov(x.clone(), Value::int(2)));
    k.push(Instruction::op(OpCode::Add, y.clone(), x, Value::int(3)));
    k.push(store(&out, y));
    let mut m = k.finish();

    let mut config = Configuration::with_level(OptimizationLevel::Basic);
    config.additional_options.max_optimization_iterations = 1;
    Optimizer::new(&config).optimize_method(&mut m).unwrap();
    // one round folds the add, the dead move of %x goes with it
    assert_eq!(body(&m), vec!["%y = 5", "store %y -> %out"]);
}

fn random_operand(rng: &mut StdRng, written: &[Value]) -> Value {
    if rng.random_bool(0.25) {
        Value::int(rng.random_range(-16..=15))
    } else {
        written[rng.random_range(0..written.len())].clone()
    }
}

fn random_kernel(rng: &mut StdRng) -> (Method, Vec<LocalId>) {
    const OPS: [OpCode; 9] = [
        OpCode::Add,
        OpCode::Sub,
        OpCode::And,
        OpCode::Or,
        OpCode::Xor,
        OpCode::Shl,
        OpCode::Shr,
        OpCode::Min,
        OpCode::Max,
    ];
    let mut k = KernelBuilder::new("random");
    let params = vec![k.param("%a"), k.param("%b")];
    let out = k.buffer("%out", TYPE_INT32, false);
    let locals: Vec<Value> = (0..6).map(|i| k.local(&format!("%l{}", i))).collect();
    let mut written = params.clone();
    for _ in 0..24 {
        let dest = locals[rng.random_range(0..locals.len())].clone();
        match rng.random_range(0..5) {
            0 => {
                let source = random_operand(rng, &written);
                k.push(Instruction::mov(dest.clone(), source));
            }
            1 => {
                let value = written[rng.random_range(0..written.len())].clone();
                k.push(store(&out, value));
                continue;
            }
            _ => {
                let op = OPS[rng.random_range(0..OPS.len())];
                let first = random_operand(rng, &written);
                let second = random_operand(rng, &written);
                k.push(Instruction::op(op, dest.clone(), first, second));
            }
        }
        if !written.contains(&dest) {
            written.push(dest);
        }
    }
    for value in &written {
        k.push(store(&out, value.clone()));
    }
    let inputs = params.iter().filter_map(Value::as_local).collect();
    (k.finish(), inputs)
}

#[test]
fn optimized_kernels_compute_the_same_stores() {
    let config = Configuration::with_level(OptimizationLevel::Full);
    let optimizer = Optimizer::new(&config);
    let mut rng = StdRng::seed_from_u64(0x0b7);
    for round in 0..64 {
        let (mut m, params) = random_kernel(&mut rng);
        let inputs: FxHashMap<LocalId, u32> = params.into_iter().map(|p| (p, rng.random())).collect();
        let expected = interpret(&m, &inputs);
        let source = m.to_text();

        optimizer.optimize_method(&mut m).unwrap();
        assert_eq!(
            interpret(&m, &inputs),
            expected,
            "round {}\nbefore:\n{}\nafter:\n{}",
            round,
            source,
            m.to_text()
        );
        assert_uses_consistent(&m);
    }
}
