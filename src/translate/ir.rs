// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The flat function IR.
//!
//! Structured control flow is gone by the time a [`FunctionIr`] exists:
//! blocks, loops and ifs have been reduced to forward and backward jumps
//! whose [`Target`]s name an operation index directly, together with the
//! stack shuffle ([`DropKeep`]) the branch performs. The compiler walks this
//! stream once and emits machine code; the interpreter dispatches over it.

use crate::indices::{DataIndex, ElemIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::types::ValType;

/// The stack shuffle performed by a branch: the top `keep` values survive,
/// the `drop` values beneath them are discarded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DropKeep {
    pub drop: u32,
    pub keep: u32,
}

impl DropKeep {
    pub const NONE: DropKeep = DropKeep { drop: 0, keep: 0 };

    pub fn is_noop(self) -> bool {
        self.drop == 0
    }
}

/// A resolved branch target: the destination operation index plus the stack
/// shuffle to perform on the way.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Target {
    pub dest: u32,
    pub drop_keep: DropKeep,
}

/// Width and extension of an atomic access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AtomicTy {
    I32,
    I64,
    I32U8,
    I32U16,
    I64U8,
    I64U16,
    I64U32,
}

impl AtomicTy {
    /// Access width in bytes; also the required alignment.
    pub fn width(self) -> u32 {
        match self {
            AtomicTy::I32U8 | AtomicTy::I64U8 => 1,
            AtomicTy::I32U16 | AtomicTy::I64U16 => 2,
            AtomicTy::I32 | AtomicTy::I64U32 => 4,
            AtomicTy::I64 => 8,
        }
    }

    /// Whether results widen into an i64 rather than an i32.
    pub fn is_64(self) -> bool {
        matches!(
            self,
            AtomicTy::I64 | AtomicTy::I64U8 | AtomicTy::I64U16 | AtomicTy::I64U32
        )
    }

    /// ABI code used when crossing into the builtin functions.
    pub fn code(self) -> u32 {
        match self {
            AtomicTy::I32 => 0,
            AtomicTy::I64 => 1,
            AtomicTy::I32U8 => 2,
            AtomicTy::I32U16 => 3,
            AtomicTy::I64U8 => 4,
            AtomicTy::I64U16 => 5,
            AtomicTy::I64U32 => 6,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => AtomicTy::I32,
            1 => AtomicTy::I64,
            2 => AtomicTy::I32U8,
            3 => AtomicTy::I32U16,
            4 => AtomicTy::I64U8,
            5 => AtomicTy::I64U16,
            6 => AtomicTy::I64U32,
            _ => unreachable!("invalid atomic type code {code}"),
        }
    }
}

/// The read-modify-write operation of an atomic RMW instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

impl AtomicOp {
    /// ABI code used when crossing into the builtin functions.
    pub fn code(self) -> u32 {
        match self {
            AtomicOp::Add => 0,
            AtomicOp::Sub => 1,
            AtomicOp::And => 2,
            AtomicOp::Or => 3,
            AtomicOp::Xor => 4,
            AtomicOp::Xchg => 5,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => AtomicOp::Add,
            1 => AtomicOp::Sub,
            2 => AtomicOp::And,
            3 => AtomicOp::Or,
            4 => AtomicOp::Xor,
            5 => AtomicOp::Xchg,
            _ => unreachable!("invalid atomic op code {code}"),
        }
    }
}

/// One pre-decoded operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ===== control =====
    Unreachable,
    Br(Target),
    /// Branch if the popped i32 is non-zero.
    BrIfNez(Target),
    /// Branch if the popped i32 is zero (lowered `if`).
    BrIfEqz(Target),
    /// The last entry is the default target.
    BrTable(Box<[Target]>),
    Return,
    Call(FuncIndex),
    CallIndirect {
        type_index: TypeIndex,
        table: TableIndex,
    },
    /// Cancellation poll inserted at loop headers when back-edge
    /// instrumentation is enabled.
    CancelPoll,

    // ===== parametric =====
    Drop,
    Select,

    // ===== locals & globals =====
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(GlobalIndex),
    GlobalSet(GlobalIndex),

    // ===== constants =====
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    V128Const(u128),

    // ===== references =====
    RefNull,
    RefIsNull,
    RefFunc(FuncIndex),

    // ===== memory, offsets are the static memarg offset =====
    I32Load(u32),
    I64Load(u32),
    F32Load(u32),
    F64Load(u32),
    I32Load8S(u32),
    I32Load8U(u32),
    I32Load16S(u32),
    I32Load16U(u32),
    I64Load8S(u32),
    I64Load8U(u32),
    I64Load16S(u32),
    I64Load16U(u32),
    I64Load32S(u32),
    I64Load32U(u32),
    I32Store(u32),
    I64Store(u32),
    F32Store(u32),
    F64Store(u32),
    I32Store8(u32),
    I32Store16(u32),
    I64Store8(u32),
    I64Store16(u32),
    I64Store32(u32),
    V128Load(u32),
    V128Store(u32),
    MemorySize,
    MemoryGrow,
    MemoryFill,
    MemoryCopy,
    MemoryInit(DataIndex),
    DataDrop(DataIndex),

    // ===== tables =====
    TableGet(TableIndex),
    TableSet(TableIndex),
    TableSize(TableIndex),
    TableGrow(TableIndex),
    TableFill(TableIndex),
    TableCopy {
        dst: TableIndex,
        src: TableIndex,
    },
    TableInit {
        elem: ElemIndex,
        table: TableIndex,
    },
    ElemDrop(ElemIndex),

    // ===== i32 =====
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    I32Clz,
    I32Ctz,
    I32Popcnt,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32Rotl,
    I32Rotr,

    // ===== i64 =====
    I64Eqz,
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    I64GeU,
    I64Clz,
    I64Ctz,
    I64Popcnt,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64Rotl,
    I64Rotr,

    // ===== f32 =====
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    F32Abs,
    F32Neg,
    F32Ceil,
    F32Floor,
    F32Trunc,
    F32Nearest,
    F32Sqrt,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Min,
    F32Max,
    F32Copysign,

    // ===== f64 =====
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
    F64Abs,
    F64Neg,
    F64Ceil,
    F64Floor,
    F64Trunc,
    F64Nearest,
    F64Sqrt,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Min,
    F64Max,
    F64Copysign,

    // ===== conversions =====
    I32WrapI64,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,

    // ===== sign extension (core v2) =====
    I32Extend8S,
    I32Extend16S,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,

    // ===== saturating truncation (core v2) =====
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,

    // ===== v128 bit ops (core v2 subset) =====
    V128And,
    V128AndNot,
    V128Or,
    V128Xor,
    V128Not,
    V128Bitselect,
    V128AnyTrue,

    // ===== atomics (threads) =====
    AtomicNotify {
        offset: u32,
    },
    AtomicWait32 {
        offset: u32,
    },
    AtomicWait64 {
        offset: u32,
    },
    AtomicFence,
    AtomicLoad {
        ty: AtomicTy,
        offset: u32,
    },
    AtomicStore {
        ty: AtomicTy,
        offset: u32,
    },
    AtomicRmw {
        op: AtomicOp,
        ty: AtomicTy,
        offset: u32,
    },
    AtomicCmpxchg {
        ty: AtomicTy,
        offset: u32,
    },
}

/// The IR of one defined function.
#[derive(Debug, Default)]
pub struct FunctionIr {
    pub ops: Box<[Op]>,
    /// Types of declared locals, params excluded.
    pub locals: Box<[ValType]>,
    /// Upper bound on the value-stack height, in values.
    pub max_stack_height: u32,
}
