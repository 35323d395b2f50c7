//! Intermediate representation of kernels.
//!
//! A `Method` owns arenas of locals, instructions and basic blocks. Every
//! local knows the instructions reading and writing it, and the optional
//! cached control flow graph follows every structural edit. All edits go
//! through `InstructionWalker` or the structural operations on `Method`.

pub mod block;
pub mod cfg;
pub mod expression;
pub mod instruction;
pub mod local;
pub mod metadata;
pub mod method;
pub mod opcode;
pub mod types;
pub mod value;
pub mod walker;

pub use block::{BasicBlock, BlockId};
pub use cfg::{CfgEdge, ControlFlowGraph};
pub use expression::{ExprOp, Expression};
pub use instruction::{
    AccessPath, Condition, Decorations, DelayType, InstrId, InstrKind, Instruction, MemoryOp,
    PackMode, SideEffects, Signal, UnpackMode, UseRole,
};
pub use local::{
    BuiltinKind, Local, LocalData, LocalId, LocalKind, LocalUse, NameGenerator, ParameterInfo,
    StackAllocation,
};
pub use metadata::{KernelMetaData, KernelUniforms, NUM_QPUS};
pub use method::Method;
pub use opcode::OpCode;
pub use types::{AddressSpace, DataType, ScalarKind};
pub use value::{Literal, Register, RegisterFile, Value};
pub use walker::InstructionWalker;
