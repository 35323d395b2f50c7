//! Side-effect free computations in canonical form, used to find
//! equivalent instructions.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHashMap;

use super::instruction::{Decorations, InstrKind, Instruction, PackMode, UnpackMode};
use super::local::LocalId;
use super::opcode::OpCode;
use super::value::{Literal, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExprOp {
    Op(OpCode),
    Move,
}

/// The value computed by an operation or move. Equality ignores
/// decorations and operand types.
#[derive(Clone, Debug)]
pub struct Expression {
    pub op: ExprOp,
    pub first: Value,
    pub second: Option<Value>,
    pub pack: PackMode,
    pub unpack: UnpackMode,
    pub decorations: Decorations,
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.first == other.first
            && self.second == other.second
            && self.pack == other.pack
            && self.unpack == other.unpack
    }
}

impl Eq for Expression {}

impl Hash for Expression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op.hash(state);
        self.first.hash(state);
        self.second.hash(state);
        self.pack.hash(state);
        self.unpack.hash(state);
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Local { .. } => 0,
        Value::Register { .. } => 1,
        Value::Literal { .. } => 2,
        Value::Undefined(_) => 3,
    }
}

/// Locals first, literals last.
fn canonical_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Local { local: x, .. }, Value::Local { local: y, .. }) => x.cmp(y),
        (Value::Register { reg: x, .. }, Value::Register { reg: y, .. }) => x.cmp(y),
        (Value::Literal { value: x, .. }, Value::Literal { value: y, .. }) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl Expression {
    /// The expression an instruction computes, if it computes one
    /// unconditionally and without side effects.
    pub fn from_instruction(instr: &Instruction) -> Option<Expression> {
        if instr.has_conditional_execution() || instr.has_side_effects() {
            return None;
        }
        let (op, first, second) = match &instr.kind {
            InstrKind::Operation { op, args, .. } => {
                (ExprOp::Op(*op), args.first()?.clone(), args.get(1).cloned())
            }
            InstrKind::Move {
                source,
                rotation: None,
                ..
            } => (ExprOp::Move, source.clone(), None),
            _ => return None,
        };
        let mut expr = Expression {
            op,
            first,
            second,
            pack: instr.pack,
            unpack: instr.unpack,
            decorations: instr.decorations,
        };
        expr.canonicalize();
        Some(expr)
    }

    fn canonicalize(&mut self) {
        if let (ExprOp::Op(op), Some(second)) = (self.op, &mut self.second) {
            if op.is_commutative() && canonical_order(&self.first, second) == Ordering::Greater {
                std::mem::swap(&mut self.first, second);
            }
        }
    }

    pub fn reads_local(&self, local: LocalId) -> bool {
        self.first.has_local(local) || self.second.as_ref().is_some_and(|v| v.has_local(local))
    }

    /// The literal this expression always produces, if any.
    pub fn constant_value(&self) -> Option<Literal> {
        if self.pack != PackMode::None || self.unpack != UnpackMode::None {
            return None;
        }
        let first = self.first.as_literal()?;
        match self.op {
            ExprOp::Move => Some(first),
            ExprOp::Op(op) => {
                let second = match &self.second {
                    Some(value) => Some(value.as_literal()?),
                    None => None,
                };
                op.evaluate(first, second)
            }
        }
    }

    /// Fold this expression with a not yet materialized expression for one
    /// of its operands: `(x op l1) op l2` becomes `x op (l1 op l2)`.
    pub fn combine_with(&self, in_flight: &FxHashMap<LocalId, Expression>) -> Option<Expression> {
        let ExprOp::Op(op) = self.op else {
            return None;
        };
        if !(op.is_associative() && op.is_commutative())
            || self.pack != PackMode::None
            || self.unpack != UnpackMode::None
        {
            return None;
        }
        let outer_literal = self.second.as_ref()?.as_literal()?;
        let inner = in_flight.get(&self.first.as_local()?)?;
        if inner.op != self.op || inner.pack != PackMode::None || inner.unpack != UnpackMode::None {
            return None;
        }
        let inner_literal = inner.second.as_ref()?.as_literal()?;
        if inner.first.is_literal() {
            return None;
        }
        let folded = op.evaluate(inner_literal, Some(outer_literal))?;
        let literal_type = self.second.as_ref()?.ty().clone();
        let mut combined = Expression {
            op: self.op,
            first: inner.first.clone(),
            second: Some(Value::literal(folded, literal_type)),
            pack: PackMode::None,
            unpack: UnpackMode::None,
            decorations: self.decorations,
        };
        combined.canonicalize();
        Some(combined)
    }

    /// An instruction computing this expression into `output`.
    pub fn to_instruction(&self, output: Value) -> Instruction {
        let instr = match (self.op, &self.second) {
            (ExprOp::Move, _) => Instruction::mov(output, self.first.clone()),
            (ExprOp::Op(op), Some(second)) => Instruction::op(op, output, self.first.clone(), second.clone()),
            (ExprOp::Op(op), None) => Instruction::unary(op, output, self.first.clone()),
        };
        instr
            .with_pack(self.pack)
            .with_unpack(self.unpack)
            .with_decorations(self.decorations)
    }
}
