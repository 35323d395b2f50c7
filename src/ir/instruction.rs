//! IR instructions.
//!
//! An `Instruction` is a closed sum type (`InstrKind`) plus the modifiers
//! every machine instruction can carry: an execution condition, a flag
//! update, a hardware signal, pack/unpack modes and semantic decorations.

use std::fmt;
use std::ops::BitOr;

use smallvec::{smallvec, SmallVec};

use super::local::{LocalId, LocalUse};
use super::method::Method;
use super::opcode::OpCode;
use super::value::{Literal, Register, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ─── Modifiers ────────────────────────────────────────────────────

/// Per-lane execution condition, evaluated against the flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Condition {
    #[default]
    Always,
    Never,
    ZeroSet,
    ZeroClear,
    NegativeSet,
    NegativeClear,
    CarrySet,
    CarryClear,
}

impl Condition {
    pub fn is_conditional(self) -> bool {
        self != Condition::Always
    }

    pub fn invert(self) -> Self {
        match self {
            Condition::Always => Condition::Never,
            Condition::Never => Condition::Always,
            Condition::ZeroSet => Condition::ZeroClear,
            Condition::ZeroClear => Condition::ZeroSet,
            Condition::NegativeSet => Condition::NegativeClear,
            Condition::NegativeClear => Condition::NegativeSet,
            Condition::CarrySet => Condition::CarryClear,
            Condition::CarryClear => Condition::CarrySet,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Condition::Always => "",
            Condition::Never => "never",
            Condition::ZeroSet => "ifz",
            Condition::ZeroClear => "ifzc",
            Condition::NegativeSet => "ifn",
            Condition::NegativeClear => "ifnc",
            Condition::CarrySet => "ifc",
            Condition::CarryClear => "ifcc",
        }
    }
}

/// Hardware signal attached to an instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Signal {
    #[default]
    None,
    Breakpoint,
    ThreadSwitch,
    ProgramEnd,
    /// Load the next TMU result into r4.
    LoadTmu,
    LoadAlpha,
}

impl Signal {
    pub fn has_side_effects(self) -> bool {
        self != Signal::None
    }

    pub fn triggers_read_of_r4(self) -> bool {
        self == Signal::LoadTmu
    }

    fn name(self) -> &'static str {
        match self {
            Signal::None => "",
            Signal::Breakpoint => "bkpt",
            Signal::ThreadSwitch => "thrsw",
            Signal::ProgramEnd => "thrend",
            Signal::LoadTmu => "load_tmu",
            Signal::LoadAlpha => "load_alpha",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PackMode {
    #[default]
    None,
    Pack16A,
    Pack16B,
    Pack8A,
    Saturate32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnpackMode {
    #[default]
    None,
    Unpack16A,
    Unpack16B,
    Unpack8A,
    Unpack8B,
    Unpack8C,
    Unpack8D,
}

impl UnpackMode {
    /// Extracts a single unsigned byte (zero-extended).
    pub fn is_byte_extraction(self) -> bool {
        matches!(
            self,
            UnpackMode::Unpack8A | UnpackMode::Unpack8B | UnpackMode::Unpack8C | UnpackMode::Unpack8D
        )
    }
}

/// Semantic annotations on an instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Decorations(u16);

impl Decorations {
    pub const NONE: Decorations = Decorations(0);
    /// The output is the local id of the work-item.
    pub const BUILTIN_LOCAL_ID: Decorations = Decorations(1 << 0);
    /// The output is the global id of the work-item.
    pub const BUILTIN_GLOBAL_ID: Decorations = Decorations(1 << 1);
    /// The output is the id of the work-group.
    pub const BUILTIN_GROUP_ID: Decorations = Decorations(1 << 2);
    pub const PHI_NODE: Decorations = Decorations(1 << 3);
    /// Exists only to materialize a constant.
    pub const CONSTANT_LOAD: Decorations = Decorations(1 << 4);
    pub const UNSIGNED_RESULT: Decorations = Decorations(1 << 5);
    pub const ELEMENT_INSERTION: Decorations = Decorations(1 << 6);
    /// The output aliases the memory object it was computed from.
    pub const REFERENCE_PROVENANCE: Decorations = Decorations(1 << 7);

    pub fn contains(self, other: Decorations) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Decorations) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Decorations) {
        self.0 &= !other.0;
    }

    /// The output is a work-item or work-group identity value.
    pub fn is_identity(self) -> bool {
        self.0 & (Self::BUILTIN_LOCAL_ID.0 | Self::BUILTIN_GLOBAL_ID.0 | Self::BUILTIN_GROUP_ID.0)
            != 0
    }

    /// Decorations that describe the value and stay valid when the value
    /// is moved to another instruction.
    pub fn forwardable(self) -> Decorations {
        Decorations(
            self.0
                & (Self::BUILTIN_LOCAL_ID.0
                    | Self::BUILTIN_GLOBAL_ID.0
                    | Self::BUILTIN_GROUP_ID.0
                    | Self::UNSIGNED_RESULT.0
                    | Self::REFERENCE_PROVENANCE.0),
        )
    }
}

impl BitOr for Decorations {
    type Output = Decorations;

    fn bitor(self, rhs: Decorations) -> Decorations {
        Decorations(self.0 | rhs.0)
    }
}

/// Effects that forbid deleting or reordering an instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SideEffects(u8);

impl SideEffects {
    pub const NONE: SideEffects = SideEffects(0);
    pub const FLAGS: SideEffects = SideEffects(1 << 0);
    pub const SIGNAL: SideEffects = SideEffects(1 << 1);
    pub const REGISTER_READ: SideEffects = SideEffects(1 << 2);
    pub const REGISTER_WRITE: SideEffects = SideEffects(1 << 3);
    pub const MEMORY: SideEffects = SideEffects(1 << 4);
    pub const CONTROL_FLOW: SideEffects = SideEffects(1 << 5);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SideEffects) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn without(self, other: SideEffects) -> SideEffects {
        SideEffects(self.0 & !other.0)
    }
}

impl BitOr for SideEffects {
    type Output = SideEffects;

    fn bitor(self, rhs: SideEffects) -> SideEffects {
        SideEffects(self.0 | rhs.0)
    }
}

/// What a `Nop` waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DelayType {
    WaitRegister,
    /// Pipeline delay between an SFU trigger and reading r4.
    WaitSfu,
    WaitTmu,
    WaitVpm,
    ThreadEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Read,
    Write,
    Copy,
    /// Write the source value `count` times.
    Fill,
}

/// How a memory instruction reaches its data, decided by memory lowering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessPath {
    /// Load-only fast path from external memory.
    Tmu,
    /// Transfer engine between external memory and scratchpad.
    Dma,
    /// Directly in the scratchpad, in the given area.
    Scratchpad { area: usize },
}

// ─── Instruction ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum InstrKind {
    Operation {
        op: OpCode,
        output: Value,
        args: SmallVec<[Value; 2]>,
    },
    Move {
        output: Value,
        source: Value,
        /// Vector rotation by a literal or `r5` amount.
        rotation: Option<Value>,
    },
    LoadImmediate {
        output: Value,
        value: Literal,
    },
    Branch {
        target: LocalId,
        /// Branch only if this value is non-zero. Unconditional if absent.
        condition: Option<Value>,
    },
    Label {
        label: LocalId,
    },
    Memory {
        op: MemoryOp,
        destination: Value,
        source: Value,
        count: Value,
        path: Option<AccessPath>,
    },
    Lifetime {
        allocation: Value,
        is_end: bool,
    },
    Nop {
        delay: DelayType,
    },
    Return,
    /// Two operations executed in the same cycle.
    Combined {
        first: Option<Box<Instruction>>,
        second: Option<Box<Instruction>>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub kind: InstrKind,
    pub condition: Condition,
    pub set_flags: bool,
    pub signal: Signal,
    pub pack: PackMode,
    pub unpack: UnpackMode,
    pub decorations: Decorations,
}

/// Whether a value substitution applies to reads, writes or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseRole {
    Reader,
    Writer,
    Both,
}

impl Instruction {
    pub fn new(kind: InstrKind) -> Self {
        Self {
            kind,
            condition: Condition::Always,
            set_flags: false,
            signal: Signal::None,
            pack: PackMode::None,
            unpack: UnpackMode::None,
            decorations: Decorations::NONE,
        }
    }

    pub fn op(op: OpCode, output: Value, first: Value, second: Value) -> Self {
        Self::new(InstrKind::Operation {
            op,
            output,
            args: smallvec![first, second],
        })
    }

    pub fn unary(op: OpCode, output: Value, arg: Value) -> Self {
        Self::new(InstrKind::Operation {
            op,
            output,
            args: smallvec![arg],
        })
    }

    pub fn mov(output: Value, source: Value) -> Self {
        Self::new(InstrKind::Move {
            output,
            source,
            rotation: None,
        })
    }

    pub fn rotate(output: Value, source: Value, offset: Value) -> Self {
        Self::new(InstrKind::Move {
            output,
            source,
            rotation: Some(offset),
        })
    }

    pub fn load_immediate(output: Value, value: Literal) -> Self {
        Self::new(InstrKind::LoadImmediate { output, value })
    }

    pub fn branch(target: LocalId) -> Self {
        Self::new(InstrKind::Branch {
            target,
            condition: None,
        })
    }

    pub fn branch_if(target: LocalId, condition: Value) -> Self {
        Self::new(InstrKind::Branch {
            target,
            condition: Some(condition),
        })
    }

    pub fn label(label: LocalId) -> Self {
        Self::new(InstrKind::Label { label })
    }

    pub fn memory(op: MemoryOp, destination: Value, source: Value, count: Value) -> Self {
        Self::new(InstrKind::Memory {
            op,
            destination,
            source,
            count,
            path: None,
        })
    }

    pub fn lifetime(allocation: Value, is_end: bool) -> Self {
        Self::new(InstrKind::Lifetime { allocation, is_end })
    }

    pub fn nop(delay: DelayType) -> Self {
        Self::new(InstrKind::Nop { delay })
    }

    pub fn ret() -> Self {
        Self::new(InstrKind::Return)
    }

    pub fn combined(first: Instruction, second: Instruction) -> Self {
        Self::new(InstrKind::Combined {
            first: Some(Box::new(first)),
            second: Some(Box::new(second)),
        })
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_flags(mut self) -> Self {
        self.set_flags = true;
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_pack(mut self, pack: PackMode) -> Self {
        self.pack = pack;
        self
    }

    pub fn with_unpack(mut self, unpack: UnpackMode) -> Self {
        self.unpack = unpack;
        self
    }

    pub fn with_decorations(mut self, decorations: Decorations) -> Self {
        self.decorations.insert(decorations);
        self
    }

    /// Take over condition, flags, signal and pack/unpack from `other`.
    pub fn copy_extras_from(mut self, other: &Instruction) -> Self {
        self.condition = other.condition;
        self.set_flags = other.set_flags;
        self.signal = other.signal;
        self.pack = other.pack;
        self.unpack = other.unpack;
        self
    }

    /// Set the access path of a memory instruction. Other kinds are
    /// returned unchanged.
    pub fn with_access_path(mut self, access: AccessPath) -> Self {
        if let InstrKind::Memory { path, .. } = &mut self.kind {
            *path = Some(access);
        }
        self
    }

    // ─── Operand access ───────────────────────────────────────────

    /// The single output. `Combined` has no single output, see `outputs`.
    pub fn output(&self) -> Option<&Value> {
        match &self.kind {
            InstrKind::Operation { output, .. }
            | InstrKind::Move { output, .. }
            | InstrKind::LoadImmediate { output, .. } => Some(output),
            InstrKind::Memory {
                op: MemoryOp::Read,
                destination,
                ..
            } => Some(destination),
            _ => None,
        }
    }

    pub fn output_mut(&mut self) -> Option<&mut Value> {
        match &mut self.kind {
            InstrKind::Operation { output, .. }
            | InstrKind::Move { output, .. }
            | InstrKind::LoadImmediate { output, .. } => Some(output),
            InstrKind::Memory {
                op: MemoryOp::Read,
                destination,
                ..
            } => Some(destination),
            _ => None,
        }
    }

    pub fn outputs(&self) -> SmallVec<[&Value; 2]> {
        match &self.kind {
            InstrKind::Combined { first, second } => first
                .iter()
                .chain(second.iter())
                .flat_map(|half| half.output())
                .collect(),
            _ => self.output().into_iter().collect(),
        }
    }

    /// Input arguments in order.
    pub fn args(&self) -> SmallVec<[&Value; 4]> {
        match &self.kind {
            InstrKind::Operation { args, .. } => args.iter().collect(),
            InstrKind::Move {
                source, rotation, ..
            } => std::iter::once(source).chain(rotation.iter()).collect(),
            InstrKind::Branch { condition, .. } => condition.iter().collect(),
            InstrKind::Memory {
                op,
                destination,
                source,
                count,
                ..
            } => {
                if *op == MemoryOp::Read {
                    smallvec![source, count]
                } else {
                    smallvec![destination, source, count]
                }
            }
            InstrKind::Lifetime { allocation, .. } => smallvec![allocation],
            InstrKind::Combined { first, second } => first
                .iter()
                .chain(second.iter())
                .flat_map(|half| half.args())
                .collect(),
            InstrKind::LoadImmediate { .. }
            | InstrKind::Label { .. }
            | InstrKind::Nop { .. }
            | InstrKind::Return => SmallVec::new(),
        }
    }

    pub fn args_mut(&mut self) -> SmallVec<[&mut Value; 4]> {
        match &mut self.kind {
            InstrKind::Operation { args, .. } => args.iter_mut().collect(),
            InstrKind::Move {
                source, rotation, ..
            } => std::iter::once(source).chain(rotation.iter_mut()).collect(),
            InstrKind::Branch { condition, .. } => condition.iter_mut().collect(),
            InstrKind::Memory {
                op,
                destination,
                source,
                count,
                ..
            } => {
                if *op == MemoryOp::Read {
                    smallvec![source, count]
                } else {
                    smallvec![destination, source, count]
                }
            }
            InstrKind::Lifetime { allocation, .. } => smallvec![allocation],
            InstrKind::Combined { first, second } => {
                let mut all = SmallVec::new();
                if let Some(half) = first {
                    all.extend(half.args_mut());
                }
                if let Some(half) = second {
                    all.extend(half.args_mut());
                }
                all
            }
            InstrKind::LoadImmediate { .. }
            | InstrKind::Label { .. }
            | InstrKind::Nop { .. }
            | InstrKind::Return => SmallVec::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args().get(index).copied()
    }

    /// Every local this instruction references, with its combined use.
    pub fn local_uses(&self) -> SmallVec<[(LocalId, LocalUse); 4]> {
        let mut uses: SmallVec<[(LocalId, LocalUse); 4]> = SmallVec::new();
        let mut add = |local: LocalId, usage: LocalUse| {
            match uses.iter_mut().find(|(l, _)| *l == local) {
                Some((_, existing)) => existing.merge(usage),
                None => uses.push((local, usage)),
            }
        };
        for out in self.outputs() {
            if let Some(local) = out.as_local() {
                add(local, LocalUse::WRITE);
            }
        }
        for arg in self.args() {
            if let Some(local) = arg.as_local() {
                add(local, LocalUse::READ);
            }
        }
        match &self.kind {
            InstrKind::Branch { target, .. } => add(*target, LocalUse::READ),
            InstrKind::Label { label } => add(*label, LocalUse::WRITE),
            _ => {}
        }
        uses
    }

    pub fn output_local(&self) -> Option<LocalId> {
        self.output().and_then(Value::as_local)
    }

    pub fn output_register(&self) -> Option<Register> {
        self.output().and_then(Value::as_register)
    }

    pub fn reads_local(&self, local: LocalId) -> bool {
        self.args().iter().any(|a| a.has_local(local))
    }

    pub fn writes_local(&self, local: LocalId) -> bool {
        self.outputs().iter().any(|o| o.has_local(local))
    }

    /// Reads `reg` or a register aliasing it.
    pub fn reads_register(&self, reg: Register) -> bool {
        self.args()
            .iter()
            .any(|a| a.as_register().is_some_and(|r| r.aliases(reg)))
    }

    pub fn writes_register(&self, reg: Register) -> bool {
        self.outputs()
            .iter()
            .any(|o| o.as_register().is_some_and(|r| r.aliases(reg)))
    }

    pub fn reads_literal(&self) -> bool {
        self.args().iter().any(|a| a.is_literal())
    }

    /// Substitute `old` with `new`, keeping the type of the replaced
    /// operand. Returns whether anything was replaced. The caller is
    /// responsible for use tracking, see `InstructionWalker::modify`.
    pub fn replace_value(&mut self, old: &Value, new: &Value, role: UseRole) -> bool {
        let mut replaced = false;
        if role != UseRole::Writer {
            for arg in self.args_mut() {
                if *arg == *old {
                    *arg = new.with_type(arg.ty().clone());
                    replaced = true;
                }
            }
        }
        if role == UseRole::Reader {
            return replaced;
        }
        if let InstrKind::Combined { first, second } = &mut self.kind {
            for half in [first, second].into_iter().flatten() {
                replaced |= half.replace_value(old, new, UseRole::Writer);
            }
            return replaced;
        }
        if let Some(out) = self.output_mut() {
            if *out == *old {
                *out = new.with_type(out.ty().clone());
                replaced = true;
            }
        }
        replaced
    }

    // ─── Properties ───────────────────────────────────────────────

    pub fn side_effects(&self) -> SideEffects {
        let mut effects = SideEffects::NONE;
        if self.set_flags {
            effects = effects | SideEffects::FLAGS;
        }
        if self.signal.has_side_effects() {
            effects = effects | SideEffects::SIGNAL;
        }
        if self
            .outputs()
            .iter()
            .any(|o| o.as_register().is_some_and(|r| r.has_side_effects_on_write()))
        {
            effects = effects | SideEffects::REGISTER_WRITE;
        }
        if self
            .args()
            .iter()
            .any(|a| a.as_register().is_some_and(|r| r.has_side_effects_on_read()))
        {
            effects = effects | SideEffects::REGISTER_READ;
        }
        match &self.kind {
            InstrKind::Memory { .. } => effects = effects | SideEffects::MEMORY,
            InstrKind::Branch { .. } | InstrKind::Label { .. } | InstrKind::Return => {
                effects = effects | SideEffects::CONTROL_FLOW
            }
            InstrKind::Combined { first, second } => {
                for half in first.iter().chain(second.iter()) {
                    effects = effects | half.side_effects();
                }
            }
            _ => {}
        }
        effects
    }

    pub fn has_side_effects(&self) -> bool {
        !self.side_effects().is_empty()
    }

    /// Any side effect besides `allowed`.
    pub fn has_other_side_effects(&self, allowed: SideEffects) -> bool {
        !self.side_effects().without(allowed).is_empty()
    }

    pub fn has_conditional_execution(&self) -> bool {
        self.condition.is_conditional()
    }

    pub fn has_pack_mode(&self) -> bool {
        self.pack != PackMode::None
    }

    pub fn has_unpack_mode(&self) -> bool {
        self.unpack != UnpackMode::None
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, InstrKind::Branch { .. })
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstrKind::Label { .. })
    }

    /// Branches and returns decide where control goes after the block.
    pub fn affects_control_flow(&self) -> bool {
        matches!(self.kind, InstrKind::Branch { .. } | InstrKind::Return)
    }

    pub fn is_unconditional_branch(&self) -> bool {
        matches!(self.kind, InstrKind::Branch { condition: None, .. })
            && !self.has_conditional_execution()
    }

    pub fn branch_target(&self) -> Option<LocalId> {
        match self.kind {
            InstrKind::Branch { target, .. } => Some(target),
            _ => None,
        }
    }

    /// An unconditional, unmodified copy without rotation.
    pub fn is_simple_move(&self) -> bool {
        matches!(self.kind, InstrKind::Move { rotation: None, .. })
            && !self.has_conditional_execution()
            && !self.set_flags
            && !self.signal.has_side_effects()
            && !self.has_pack_mode()
            && !self.has_unpack_mode()
    }

    pub fn move_source(&self) -> Option<&Value> {
        match &self.kind {
            InstrKind::Move { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn access_path(&self) -> Option<AccessPath> {
        match &self.kind {
            InstrKind::Memory { path, .. } => *path,
            _ => None,
        }
    }

    pub fn operation(&self) -> Option<OpCode> {
        match &self.kind {
            InstrKind::Operation { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Evaluate to a literal if all operands are literals. Locals are
    /// resolved through their single writer by `Method::precalculate`.
    pub fn evaluate_literal(&self, args: &[Option<Literal>]) -> Option<Literal> {
        if self.has_pack_mode() || self.has_unpack_mode() || self.has_conditional_execution() {
            return None;
        }
        match &self.kind {
            InstrKind::Operation { op, .. } => {
                let first = args.first().copied().flatten()?;
                let second = args.get(1).copied().flatten();
                op.evaluate(first, second)
            }
            InstrKind::Move { rotation: None, .. } => args.first().copied().flatten(),
            InstrKind::Move {
                rotation: Some(_), ..
            } => None,
            InstrKind::LoadImmediate { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn display<'a>(&'a self, method: &'a Method) -> InstructionDisplay<'a> {
        InstructionDisplay {
            instr: self,
            method,
        }
    }
}

// ─── Display ──────────────────────────────────────────────────────

pub struct ValueDisplay<'a> {
    value: &'a Value,
    method: &'a Method,
}

impl<'a> ValueDisplay<'a> {
    pub fn new(value: &'a Value, method: &'a Method) -> Self {
        Self { value, method }
    }
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Local { local, .. } => write!(f, "{}", self.method.local_name(*local)),
            Value::Register { reg, .. } => write!(f, "{}", reg),
            Value::Literal { value, ty } => {
                if ty.is_float() {
                    write!(f, "{}", value.real_value())
                } else if ty.is_bool() {
                    write!(f, "{}", value.is_true())
                } else {
                    write!(f, "{}", value.signed())
                }
            }
            Value::Undefined(_) => write!(f, "undefined"),
        }
    }
}

pub struct InstructionDisplay<'a> {
    instr: &'a Instruction,
    method: &'a Method,
}

impl InstructionDisplay<'_> {
    fn value(&self, value: &Value) -> String {
        ValueDisplay::new(value, self.method).to_string()
    }

    fn extras(&self) -> String {
        let instr = self.instr;
        let mut parts = Vec::new();
        if instr.has_conditional_execution() {
            parts.push(instr.condition.suffix().to_string());
        }
        if instr.set_flags {
            parts.push("setf".to_string());
        }
        if instr.signal.has_side_effects() {
            parts.push(instr.signal.name().to_string());
        }
        if instr.has_pack_mode() {
            parts.push(format!("pack {:?}", instr.pack));
        }
        if instr.has_unpack_mode() {
            parts.push(format!("unpack {:?}", instr.unpack));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" ({})", parts.join(", "))
        }
    }
}

impl fmt::Display for InstructionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instr.kind {
            InstrKind::Operation { op, output, args } => {
                let args: Vec<String> = args.iter().map(|a| self.value(a)).collect();
                write!(f, "{} = {} {}", self.value(output), op, args.join(", "))?;
            }
            InstrKind::Move {
                output,
                source,
                rotation,
            } => {
                write!(f, "{} = {}", self.value(output), self.value(source))?;
                if let Some(offset) = rotation {
                    write!(f, " rotate {}", self.value(offset))?;
                }
            }
            InstrKind::LoadImmediate { output, value } => {
                write!(f, "{} = loadi {}", self.value(output), value.signed())?;
            }
            InstrKind::Branch { target, condition } => {
                write!(f, "br {}", self.method.local_name(*target))?;
                if let Some(cond) = condition {
                    write!(f, " if {}", self.value(cond))?;
                }
            }
            InstrKind::Label { label } => write!(f, "label: {}", self.method.local_name(*label))?,
            InstrKind::Memory {
                op,
                destination,
                source,
                count,
                ..
            } => match op {
                MemoryOp::Read => write!(f, "{} = load {}", self.value(destination), self.value(source))?,
                MemoryOp::Write => {
                    write!(f, "store {} -> {}", self.value(source), self.value(destination))?
                }
                MemoryOp::Copy => write!(
                    f,
                    "copy {} from {} to {}",
                    self.value(count),
                    self.value(source),
                    self.value(destination)
                )?,
                MemoryOp::Fill => write!(
                    f,
                    "fill {} with {} x {}",
                    self.value(destination),
                    self.value(source),
                    self.value(count)
                )?,
            },
            InstrKind::Lifetime { allocation, is_end } => write!(
                f,
                "life-time for {} {}",
                self.value(allocation),
                if *is_end { "ends" } else { "starts" }
            )?,
            InstrKind::Nop { delay } => write!(f, "nop ({:?})", delay)?,
            InstrKind::Return => write!(f, "ret")?,
            InstrKind::Combined { first, second } => {
                let halves: Vec<String> = first
                    .iter()
                    .chain(second.iter())
                    .map(|half| half.display(self.method).to_string())
                    .collect();
                write!(f, "{}", halves.join(" and "))?;
            }
        }
        write!(f, "{}", self.extras())
    }
}
