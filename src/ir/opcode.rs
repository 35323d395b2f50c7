//! Arithmetic and logical op-codes with their algebraic properties.

use std::fmt;

use super::value::Literal;

/// Op-code of an `Operation`.
///
/// Integer ops follow the ALU semantics of the target: shift amounts are
/// taken modulo 32, `mul24` multiplies the low 24 bits of both operands
/// and `min`/`max` compare signed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    Add,
    Sub,
    Mul24,
    /// Full 32-bit multiplication, lowered to several `mul24` later on.
    Mul,
    And,
    Or,
    Xor,
    Not,
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Asr,
    Ror,
    Min,
    Max,
    Clz,
    FAdd,
    FSub,
    FMul,
    FMin,
    FMax,
    ItoF,
    FtoI,
}

const ALL_ONES: u32 = 0xFFFF_FFFF;

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul24 => "mul24",
            OpCode::Mul => "mul",
            OpCode::And => "and",
            OpCode::Or => "or",
            OpCode::Xor => "xor",
            OpCode::Not => "not",
            OpCode::Shl => "shl",
            OpCode::Shr => "shr",
            OpCode::Asr => "asr",
            OpCode::Ror => "ror",
            OpCode::Min => "min",
            OpCode::Max => "max",
            OpCode::Clz => "clz",
            OpCode::FAdd => "fadd",
            OpCode::FSub => "fsub",
            OpCode::FMul => "fmul",
            OpCode::FMin => "fmin",
            OpCode::FMax => "fmax",
            OpCode::ItoF => "itof",
            OpCode::FtoI => "ftoi",
        }
    }

    pub fn num_operands(self) -> usize {
        match self {
            OpCode::Not | OpCode::Clz | OpCode::ItoF | OpCode::FtoI => 1,
            _ => 2,
        }
    }

    pub fn accepts_float(self) -> bool {
        matches!(
            self,
            OpCode::FAdd
                | OpCode::FSub
                | OpCode::FMul
                | OpCode::FMin
                | OpCode::FMax
                | OpCode::FtoI
        )
    }

    pub fn returns_float(self) -> bool {
        matches!(
            self,
            OpCode::FAdd
                | OpCode::FSub
                | OpCode::FMul
                | OpCode::FMin
                | OpCode::FMax
                | OpCode::ItoF
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            OpCode::Add
                | OpCode::Mul24
                | OpCode::Mul
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Min
                | OpCode::Max
                | OpCode::FAdd
                | OpCode::FMul
                | OpCode::FMin
                | OpCode::FMax
        )
    }

    /// Integer-exact associativity. Float add/mul are not associative
    /// under rounding and `mul24` truncates its inputs.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            OpCode::Add
                | OpCode::Mul
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Min
                | OpCode::Max
                | OpCode::FMin
                | OpCode::FMax
        )
    }

    /// `f(a, a) == a`
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            OpCode::And | OpCode::Or | OpCode::Min | OpCode::Max | OpCode::FMin | OpCode::FMax
        )
    }

    /// `f(a, a) == 0`
    pub fn is_self_inverse(self) -> bool {
        matches!(self, OpCode::Xor | OpCode::Sub)
    }

    /// `e` with `f(e, a) == a`
    pub fn left_identity(self) -> Option<Literal> {
        match self {
            OpCode::Add | OpCode::Or | OpCode::Xor => Some(Literal(0)),
            OpCode::Mul24 | OpCode::Mul => Some(Literal(1)),
            OpCode::And => Some(Literal(ALL_ONES)),
            OpCode::FAdd => Some(Literal::real(0.0)),
            OpCode::FMul => Some(Literal::real(1.0)),
            _ => None,
        }
    }

    /// `e` with `f(a, e) == a`
    pub fn right_identity(self) -> Option<Literal> {
        match self {
            OpCode::Sub | OpCode::Shl | OpCode::Shr | OpCode::Asr | OpCode::Ror => Some(Literal(0)),
            OpCode::FSub => Some(Literal::real(0.0)),
            _ => self.left_identity(),
        }
    }

    /// `z` with `f(z, a) == z`
    pub fn left_absorbing_element(self) -> Option<Literal> {
        match self {
            OpCode::And
            | OpCode::Mul24
            | OpCode::Mul
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::Asr
            | OpCode::Ror => Some(Literal(0)),
            OpCode::Or => Some(Literal(ALL_ONES)),
            _ => None,
        }
    }

    /// `z` with `f(a, z) == z`
    pub fn right_absorbing_element(self) -> Option<Literal> {
        match self {
            OpCode::And | OpCode::Mul24 | OpCode::Mul => Some(Literal(0)),
            OpCode::Or => Some(Literal(ALL_ONES)),
            _ => None,
        }
    }

    /// Compute the result for literal operands. Returns `None` if the
    /// operand count does not match.
    pub fn evaluate(self, first: Literal, second: Option<Literal>) -> Option<Literal> {
        if self.num_operands() == 1 {
            return Some(self.evaluate_unary(first));
        }
        let second = second?;
        let (a, b) = (first.0, second.0);
        let (fa, fb) = (first.real_value(), second.real_value());
        let result = match self {
            OpCode::Add => Literal(a.wrapping_add(b)),
            OpCode::Sub => Literal(a.wrapping_sub(b)),
            OpCode::Mul24 => Literal((a & 0x00FF_FFFF).wrapping_mul(b & 0x00FF_FFFF)),
            OpCode::Mul => Literal(a.wrapping_mul(b)),
            OpCode::And => Literal(a & b),
            OpCode::Or => Literal(a | b),
            OpCode::Xor => Literal(a ^ b),
            OpCode::Shl => Literal(a.wrapping_shl(b & 31)),
            OpCode::Shr => Literal(a.wrapping_shr(b & 31)),
            OpCode::Asr => Literal::int((a as i32).wrapping_shr(b & 31)),
            OpCode::Ror => Literal(a.rotate_right(b & 31)),
            OpCode::Min => Literal::int((a as i32).min(b as i32)),
            OpCode::Max => Literal::int((a as i32).max(b as i32)),
            OpCode::FAdd => Literal::real(fa + fb),
            OpCode::FSub => Literal::real(fa - fb),
            OpCode::FMul => Literal::real(fa * fb),
            OpCode::FMin => Literal::real(fa.min(fb)),
            OpCode::FMax => Literal::real(fa.max(fb)),
            OpCode::Not | OpCode::Clz | OpCode::ItoF | OpCode::FtoI => return None,
        };
        Some(result)
    }

    fn evaluate_unary(self, value: Literal) -> Literal {
        match self {
            OpCode::Not => Literal(!value.0),
            OpCode::Clz => Literal(value.0.leading_zeros()),
            OpCode::ItoF => Literal::real(value.signed() as f32),
            OpCode::FtoI => Literal::int(value.real_value() as i32),
            _ => value,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
