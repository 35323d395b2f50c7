//! Operands: locals, machine registers, literals and the undefined marker.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::local::LocalId;
use super::types::{DataType, TYPE_INT32};

// ─── Literals ─────────────────────────────────────────────────────

/// A 32-bit immediate. The bits are interpreted according to the type of
/// the surrounding `Value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Literal(pub u32);

impl Literal {
    pub fn int(value: i32) -> Self {
        Literal(value as u32)
    }

    pub fn uint(value: u32) -> Self {
        Literal(value)
    }

    pub fn real(value: f32) -> Self {
        Literal(value.to_bits())
    }

    pub fn bool(value: bool) -> Self {
        Literal(value as u32)
    }

    pub fn unsigned(self) -> u32 {
        self.0
    }

    pub fn signed(self) -> i32 {
        self.0 as i32
    }

    pub fn real_value(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub fn is_true(self) -> bool {
        self.0 != 0
    }
}

// ─── Registers ────────────────────────────────────────────────────

/// Which register file a register lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterFile {
    Accumulator,
    PhysicalA,
    PhysicalB,
    /// Peripheral I/O addresses, reachable from both files.
    Peripheral,
}

/// Machine registers the IR can reference directly.
///
/// `Accumulator(n)` covers r0..r3. r4 is only ever read, as the result of
/// the special-function unit or a TMU load. r5 is written through its
/// replication aliases and read as `Acc5`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Accumulator(u8),
    /// r4 read as special-function-unit result.
    SfuOut,
    /// r4 read as TMU load result.
    TmuOut,
    Acc5,
    /// Write to r5, replicate element 0 of every quad to the whole quad.
    ReplicateQuad,
    /// Write to r5, replicate element 0 to all 16 elements.
    ReplicateAll,
    PhysicalA(u8),
    PhysicalB(u8),
    Uniform,
    ElementNumber,
    QpuNumber,
    VpmIo,
    VpmAddress,
    Mutex,
    TmuAddress,
    SfuRecip,
    SfuRsqrt,
    SfuExp2,
    SfuLog2,
    Nop,
}

impl Register {
    pub fn file(self) -> RegisterFile {
        match self {
            Register::Accumulator(_)
            | Register::SfuOut
            | Register::TmuOut
            | Register::Acc5
            | Register::ReplicateQuad
            | Register::ReplicateAll => RegisterFile::Accumulator,
            Register::PhysicalA(_) | Register::ElementNumber => RegisterFile::PhysicalA,
            Register::PhysicalB(_) | Register::QpuNumber => RegisterFile::PhysicalB,
            _ => RegisterFile::Peripheral,
        }
    }

    pub fn is_accumulator(self) -> bool {
        self.file() == RegisterFile::Accumulator
    }

    pub fn is_general_purpose(self) -> bool {
        matches!(
            self,
            Register::Accumulator(_) | Register::PhysicalA(_) | Register::PhysicalB(_)
        )
    }

    /// Reading consumes or changes hardware state.
    pub fn has_side_effects_on_read(self) -> bool {
        matches!(
            self,
            Register::Uniform | Register::VpmIo | Register::Mutex
        )
    }

    /// Writing starts a hardware operation.
    pub fn has_side_effects_on_write(self) -> bool {
        matches!(
            self,
            Register::VpmIo
                | Register::VpmAddress
                | Register::Mutex
                | Register::TmuAddress
                | Register::SfuRecip
                | Register::SfuRsqrt
                | Register::SfuExp2
                | Register::SfuLog2
        )
    }

    pub fn is_special_functions_unit(self) -> bool {
        matches!(
            self,
            Register::SfuRecip | Register::SfuRsqrt | Register::SfuExp2 | Register::SfuLog2
        )
    }

    /// A write to this register makes its result appear in r4.
    pub fn triggers_read_of_r4(self) -> bool {
        self.is_special_functions_unit() || self == Register::TmuAddress
    }

    /// Registers reading the same value in every SIMD lane.
    pub fn is_all_lanes_equal(self) -> bool {
        matches!(self, Register::Uniform | Register::QpuNumber)
    }

    /// Whether `self` and `other` name the same physical storage, e.g. the
    /// r5 replication aliases and r5 itself.
    pub fn aliases(self, other: Register) -> bool {
        if self == other {
            return true;
        }
        let r5 = |r: Register| {
            matches!(
                r,
                Register::Acc5 | Register::ReplicateQuad | Register::ReplicateAll
            )
        };
        let r4 = |r: Register| matches!(r, Register::SfuOut | Register::TmuOut);
        (r5(self) && r5(other)) || (r4(self) && r4(other))
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Accumulator(n) => write!(f, "r{}", n),
            Register::SfuOut => write!(f, "r4"),
            Register::TmuOut => write!(f, "r4 (tmu)"),
            Register::Acc5 => write!(f, "r5"),
            Register::ReplicateQuad => write!(f, "r5quad"),
            Register::ReplicateAll => write!(f, "r5rep"),
            Register::PhysicalA(n) => write!(f, "ra{}", n),
            Register::PhysicalB(n) => write!(f, "rb{}", n),
            Register::Uniform => write!(f, "unif"),
            Register::ElementNumber => write!(f, "elem_num"),
            Register::QpuNumber => write!(f, "qpu_num"),
            Register::VpmIo => write!(f, "vpm"),
            Register::VpmAddress => write!(f, "vpm_addr"),
            Register::Mutex => write!(f, "mutex"),
            Register::TmuAddress => write!(f, "tmu0s"),
            Register::SfuRecip => write!(f, "sfu_recip"),
            Register::SfuRsqrt => write!(f, "sfu_rsqrt"),
            Register::SfuExp2 => write!(f, "sfu_exp2"),
            Register::SfuLog2 => write!(f, "sfu_log2"),
            Register::Nop => write!(f, "-"),
        }
    }
}

// ─── Values ───────────────────────────────────────────────────────

/// An instruction operand. Values are immutable and held by copy.
///
/// Equality and hashing ignore the type: two values are equal when they
/// name the same local, register or literal bits.
#[derive(Clone, Debug)]
pub enum Value {
    Local { local: LocalId, ty: DataType },
    Register { reg: Register, ty: DataType },
    Literal { value: Literal, ty: DataType },
    Undefined(DataType),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Local { local: a, .. }, Value::Local { local: b, .. }) => a == b,
            (Value::Register { reg: a, .. }, Value::Register { reg: b, .. }) => a == b,
            (Value::Literal { value: a, .. }, Value::Literal { value: b, .. }) => a == b,
            (Value::Undefined(_), Value::Undefined(_)) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Local { local, .. } => local.hash(state),
            Value::Register { reg, .. } => reg.hash(state),
            Value::Literal { value, .. } => value.hash(state),
            Value::Undefined(_) => {}
        }
    }
}

impl Value {
    pub fn local(local: LocalId, ty: DataType) -> Self {
        Value::Local { local, ty }
    }

    pub fn register(reg: Register, ty: DataType) -> Self {
        Value::Register { reg, ty }
    }

    pub fn literal(value: Literal, ty: DataType) -> Self {
        Value::Literal { value, ty }
    }

    pub fn int(value: i32) -> Self {
        Value::literal(Literal::int(value), TYPE_INT32)
    }

    pub fn uint(value: u32) -> Self {
        Value::literal(Literal::uint(value), TYPE_INT32)
    }

    pub fn ty(&self) -> &DataType {
        match self {
            Value::Local { ty, .. }
            | Value::Register { ty, .. }
            | Value::Literal { ty, .. }
            | Value::Undefined(ty) => ty,
        }
    }

    /// The same value with a different type.
    pub fn with_type(&self, ty: DataType) -> Self {
        match self {
            Value::Local { local, .. } => Value::Local { local: *local, ty },
            Value::Register { reg, .. } => Value::Register { reg: *reg, ty },
            Value::Literal { value, .. } => Value::Literal { value: *value, ty },
            Value::Undefined(_) => Value::Undefined(ty),
        }
    }

    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            Value::Local { local, .. } => Some(*local),
            _ => None,
        }
    }

    pub fn has_local(&self, id: LocalId) -> bool {
        self.as_local() == Some(id)
    }

    pub fn as_register(&self) -> Option<Register> {
        match self {
            Value::Register { reg, .. } => Some(*reg),
            _ => None,
        }
    }

    pub fn has_register(&self, reg: Register) -> bool {
        self.as_register() == Some(reg)
    }

    pub fn as_literal(&self) -> Option<Literal> {
        match self {
            Value::Literal { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Value::Literal { .. })
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined(_))
    }

    /// Every SIMD lane holds the same value.
    pub fn is_all_lanes_equal(&self) -> bool {
        match self {
            Value::Literal { .. } | Value::Undefined(_) => true,
            Value::Register { reg, .. } => reg.is_all_lanes_equal(),
            Value::Local { .. } => false,
        }
    }
}
