//! Helpers for unit tests: a small kernel builder, a use-record checker
//! and a straight-line interpreter for semantics comparisons.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ir::{
    DataType, InstrId, InstrKind, Instruction, InstructionWalker, LocalId, LocalKind, LocalUse,
    MemoryOp, Method, NameGenerator, Register, Value,
};
use crate::ir::types::{AddressSpace, TYPE_INT32, TYPE_LABEL};
use crate::periphery::precalculate_sfu;

pub(crate) struct KernelBuilder {
    pub method: Method,
}

impl KernelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            method: Method::new(name, Arc::new(NameGenerator::new())),
        }
    }

    /// A plain 32-bit local.
    pub fn local(&mut self, name: &str) -> Value {
        let id = self.method.create_local(TYPE_INT32, name, LocalKind::Plain);
        self.method.local_value(id)
    }

    pub fn param(&mut self, name: &str) -> Value {
        let id = self.method.add_parameter(name, TYPE_INT32, false).unwrap();
        self.method.local_value(id)
    }

    /// A pointer parameter into global memory.
    pub fn buffer(&mut self, name: &str, element: DataType, read_only: bool) -> Value {
        let ty = DataType::pointer_to(element, AddressSpace::Global, 4);
        let id = self.method.add_parameter(name, ty, read_only).unwrap();
        self.method.local_value(id)
    }

    pub fn label_local(&mut self, name: &str) -> LocalId {
        self.method.create_local(TYPE_LABEL, name, LocalKind::Label)
    }

    /// Start a new block labelled `name`.
    pub fn block(&mut self, name: &str) -> LocalId {
        let label = self.label_local(name);
        self.method.append(Instruction::label(label));
        label
    }

    pub fn push(&mut self, instr: Instruction) -> InstructionWalker {
        self.method.append(instr)
    }

    pub fn finish(self) -> Method {
        self.method
    }
}

/// Every position holding a non-label instruction, in program order.
pub(crate) fn positions(method: &Method) -> Vec<InstructionWalker> {
    method
        .blocks()
        .flat_map(|block| (1..method.block(block).len()).map(move |i| InstructionWalker::new(block, i)))
        .collect()
}

/// Use records recomputed from scratch.
pub(crate) fn recompute_uses(method: &Method) -> FxHashMap<LocalId, BTreeMap<InstrId, LocalUse>> {
    let mut uses: FxHashMap<LocalId, BTreeMap<InstrId, LocalUse>> = FxHashMap::default();
    method.for_all_instructions(|id, instr| {
        for (local, usage) in instr.local_uses() {
            uses.entry(local).or_default().entry(id).or_default().merge(usage);
        }
    });
    uses
}

pub(crate) fn assert_uses_consistent(method: &Method) {
    let expected = recompute_uses(method);
    for (id, local) in method.locals() {
        let empty = BTreeMap::new();
        let want = expected.get(&id).unwrap_or(&empty);
        assert_eq!(
            local.users(),
            want,
            "use records of {} diverged\n{}",
            local.name,
            method.to_text()
        );
    }
}

// ─── Interpreter ──────────────────────────────────────────────────

fn register_slot(reg: Register) -> Register {
    match reg {
        Register::ReplicateQuad | Register::ReplicateAll => Register::Acc5,
        Register::TmuOut => Register::SfuOut,
        other => other,
    }
}

/// Runs the instructions of one lane in program order, ignoring control
/// flow. Returns every value stored to memory, in order.
pub(crate) fn interpret(method: &Method, inputs: &FxHashMap<LocalId, u32>) -> Vec<u32> {
    let mut locals = inputs.clone();
    let mut registers: FxHashMap<Register, u32> = FxHashMap::default();
    let mut stores = Vec::new();
    method.for_all_instructions(|_, instr| {
        execute(instr, &mut locals, &mut registers, &mut stores);
    });
    stores
}

fn read(value: &Value, locals: &FxHashMap<LocalId, u32>, registers: &FxHashMap<Register, u32>) -> u32 {
    match value {
        Value::Local { local, .. } => locals.get(local).copied().unwrap_or(0),
        Value::Register { reg, .. } => registers.get(&register_slot(*reg)).copied().unwrap_or(0),
        Value::Literal { value, .. } => value.unsigned(),
        Value::Undefined(_) => 0,
    }
}

fn write(
    value: &Value,
    result: u32,
    locals: &mut FxHashMap<LocalId, u32>,
    registers: &mut FxHashMap<Register, u32>,
) {
    match value {
        Value::Local { local, .. } => {
            locals.insert(*local, result);
        }
        Value::Register { reg, .. } => {
            if reg.is_special_functions_unit() {
                let out = precalculate_sfu(*reg, crate::ir::Literal(result)).map_or(0, |l| l.unsigned());
                registers.insert(Register::SfuOut, out);
            } else {
                registers.insert(register_slot(*reg), result);
            }
        }
        _ => {}
    }
}

fn execute(
    instr: &Instruction,
    locals: &mut FxHashMap<LocalId, u32>,
    registers: &mut FxHashMap<Register, u32>,
    stores: &mut Vec<u32>,
) {
    assert!(
        !instr.has_conditional_execution(),
        "the interpreter only runs unconditional code"
    );
    let args: Vec<u32> = instr.args().iter().map(|a| read(a, locals, registers)).collect();
    let literal = |i: usize| crate::ir::Literal(args.get(i).copied().unwrap_or(0));
    match &instr.kind {
        InstrKind::Operation { op, output, .. } => {
            let second = (args.len() > 1).then(|| literal(1));
            let result = op.evaluate(literal(0), second).map_or(0, |l| l.unsigned());
            write(output, result, locals, registers);
        }
        InstrKind::Move { output, .. } => write(output, args[0], locals, registers),
        InstrKind::LoadImmediate { output, value } => write(output, value.unsigned(), locals, registers),
        InstrKind::Memory {
            op: MemoryOp::Write,
            ..
        } => stores.push(args[1]),
        InstrKind::Combined { first, second } => {
            for half in first.iter().chain(second.iter()) {
                execute(half, locals, registers, stores);
            }
        }
        _ => {}
    }
}
