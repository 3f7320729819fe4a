// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Flattens one validated function body into [`FunctionIr`].
//!
//! Structured control flow becomes forward/backward jumps with explicit
//! [`DropKeep`] shuffles. Every operator is fed to the `wasmparser` function
//! validator before translation, so the translation itself only has to deal
//! with well-typed input; dead code after a terminator is skipped entirely
//! rather than translated.

use crate::errors::validation_error;
use crate::indices::{DataIndex, ElemIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::translate::ir::{AtomicOp, AtomicTy, DropKeep, FunctionIr, Op, Target};
use crate::translate::TranslatedModule;
use crate::types::{FuncType, ValType};
use crate::wasm_unsupported;
use wasmparser::{FuncToValidate, FuncValidator, FunctionBody, Operator, ValidatorResources};

/// An unresolved forward-branch destination.
const PENDING_DEST: u32 = u32::MAX;

#[derive(Debug)]
enum FrameKind {
    Block,
    Loop { header: u32 },
    If { else_fixup: usize },
    Else,
}

#[derive(Debug)]
struct ControlFrame {
    kind: FrameKind,
    /// Stack height below this frame's parameters.
    base: u32,
    param_arity: u32,
    result_arity: u32,
    /// `(op index, target slot)` pairs awaiting the end label.
    to_patch: Vec<(usize, usize)>,
}

pub struct FuncTranslator<'a> {
    module: &'a TranslatedModule,
    func_ty: FuncType,
    validator: FuncValidator<ValidatorResources>,
    insert_cancel_polls: bool,

    ops: Vec<Op>,
    locals: Vec<ValType>,
    frames: Vec<ControlFrame>,
    height: u32,
    max_height: u32,
    reachable: bool,
    /// Number of frames entered while in dead code.
    unreachable_depth: u32,
}

impl<'a> FuncTranslator<'a> {
    pub fn new(
        module: &'a TranslatedModule,
        func_ty: FuncType,
        func_to_validate: FuncToValidate<ValidatorResources>,
        insert_cancel_polls: bool,
    ) -> Self {
        let validator = func_to_validate.into_validator(Default::default());
        Self {
            module,
            func_ty,
            validator,
            insert_cancel_polls,
            ops: Vec::new(),
            locals: Vec::new(),
            frames: Vec::new(),
            height: 0,
            max_height: 0,
            reachable: true,
            unreachable_depth: 0,
        }
    }

    pub fn translate(mut self, body: &FunctionBody<'_>) -> crate::Result<FunctionIr> {
        let mut locals = body.get_locals_reader()?;
        for _ in 0..locals.get_count() {
            let offset = locals.original_position();
            let (count, ty) = locals.read()?;
            self.validator
                .define_locals(offset, count, ty)
                .map_err(validation_error)?;
            let ty = ValType::from_wasmparser(ty)?;
            for _ in 0..count {
                self.locals.push(ty);
            }
        }

        self.frames.push(ControlFrame {
            kind: FrameKind::Block,
            base: 0,
            param_arity: 0,
            result_arity: u32::try_from(self.func_ty.results().len()).unwrap(),
            to_patch: Vec::new(),
        });

        let mut reader = body.get_operators_reader()?;
        while !reader.eof() {
            let (op, offset) = reader.read_with_offset()?;
            self.validator.op(offset, &op).map_err(validation_error)?;
            self.translate_op(&op)?;
        }
        self.validator
            .finish(reader.original_position())
            .map_err(validation_error)?;

        debug_assert!(self.frames.is_empty());

        Ok(FunctionIr {
            ops: self.ops.into_boxed_slice(),
            locals: self.locals.into_boxed_slice(),
            max_stack_height: self.max_height,
        })
    }

    // ===== stack bookkeeping =====

    fn push(&mut self, n: u32) {
        self.height += n;
        self.max_height = self.max_height.max(self.height);
    }

    fn pop(&mut self, n: u32) {
        debug_assert!(self.height >= n);
        self.height -= n;
    }

    fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn block_arity(&self, blockty: &wasmparser::BlockType) -> (u32, u32) {
        match blockty {
            wasmparser::BlockType::Empty => (0, 0),
            wasmparser::BlockType::Type(_) => (0, 1),
            wasmparser::BlockType::FuncType(idx) => {
                let ty = &self.module.types[TypeIndex::from_u32(*idx)];
                (
                    u32::try_from(ty.params().len()).unwrap(),
                    u32::try_from(ty.results().len()).unwrap(),
                )
            }
        }
    }

    fn call_arity(&self, index: FuncIndex) -> (u32, u32) {
        let ty = self.module.func_type(index);
        (
            u32::try_from(ty.params().len()).unwrap(),
            u32::try_from(ty.results().len()).unwrap(),
        )
    }

    // ===== branch resolution =====

    /// Computes the target of a branch to `relative_depth`. Backward branches
    /// (to a loop header) resolve immediately; forward branches return a
    /// pending target that must be registered with [`Self::defer_patch`].
    fn branch_target(&self, relative_depth: u32) -> Target {
        let frame = &self.frames[self.frames.len() - 1 - relative_depth as usize];
        let keep = match frame.kind {
            FrameKind::Loop { .. } => frame.param_arity,
            _ => frame.result_arity,
        };
        let drop = self.height - frame.base - keep;
        let dest = match frame.kind {
            FrameKind::Loop { header } => header,
            _ => PENDING_DEST,
        };
        Target {
            dest,
            drop_keep: DropKeep { drop, keep },
        }
    }

    /// Registers `(op, slot)` for patching when the frame at
    /// `relative_depth` ends, unless the target resolved immediately.
    fn defer_patch(&mut self, relative_depth: u32, op: usize, slot: usize) {
        let idx = self.frames.len() - 1 - relative_depth as usize;
        let frame = &mut self.frames[idx];
        if !matches!(frame.kind, FrameKind::Loop { .. }) {
            frame.to_patch.push((op, slot));
        }
    }

    fn patch(ops: &mut [Op], at: usize, slot: usize, dest: u32) {
        match &mut ops[at] {
            Op::Br(t) | Op::BrIfNez(t) | Op::BrIfEqz(t) => {
                debug_assert_eq!(t.dest, PENDING_DEST);
                t.dest = dest;
            }
            Op::BrTable(targets) => {
                debug_assert_eq!(targets[slot].dest, PENDING_DEST);
                targets[slot].dest = dest;
            }
            op => unreachable!("patched op is not a branch: {op:?}"),
        }
    }

    // ===== frame transitions =====

    fn end_frame(&mut self, fallthrough_reachable: bool) {
        let frame = self.frames.pop().expect("control frame underflow");
        let dest = u32::try_from(self.ops.len()).unwrap();
        let had_branches = !frame.to_patch.is_empty();

        for (op, slot) in frame.to_patch {
            Self::patch(&mut self.ops, op, slot, dest);
        }
        // An `if` that never saw an `else` falls through to the end label on
        // a false condition.
        if let FrameKind::If { else_fixup } = frame.kind {
            Self::patch(&mut self.ops, else_fixup, 0, dest);
        }

        self.height = frame.base + frame.result_arity;
        self.max_height = self.max_height.max(self.height);
        self.reachable =
            fallthrough_reachable || had_branches || matches!(frame.kind, FrameKind::If { .. });

        if self.frames.is_empty() {
            // Function end: every branch to the outermost label lands on this
            // return.
            if self.reachable {
                self.emit(Op::Return);
            }
            self.reachable = false;
        }
    }

    fn else_frame(&mut self, then_reachable: bool) {
        let frame_idx = self.frames.len() - 1;

        // Terminate the then-arm with a jump over the else-arm.
        if then_reachable {
            let op = self.ops.len();
            self.emit(Op::Br(Target {
                dest: PENDING_DEST,
                drop_keep: DropKeep::NONE,
            }));
            self.frames[frame_idx].to_patch.push((op, 0));
        }

        let dest = u32::try_from(self.ops.len()).unwrap();
        let frame = &mut self.frames[frame_idx];
        match frame.kind {
            FrameKind::If { else_fixup } => {
                Self::patch(&mut self.ops, else_fixup, 0, dest);
            }
            _ => unreachable!("else outside of if"),
        }
        frame.kind = FrameKind::Else;
        self.height = frame.base + frame.param_arity;
        self.reachable = true;
    }

    // ===== operator translation =====

    #[allow(clippy::too_many_lines)]
    fn translate_op(&mut self, op: &Operator<'_>) -> crate::Result<()> {
        use Operator as O;

        if !self.reachable {
            match op {
                O::Block { .. } | O::Loop { .. } | O::If { .. } => self.unreachable_depth += 1,
                O::Else => {
                    if self.unreachable_depth == 0 {
                        self.else_frame(false);
                    }
                }
                O::End => {
                    if self.unreachable_depth > 0 {
                        self.unreachable_depth -= 1;
                    } else {
                        self.end_frame(false);
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        match op {
            // ===== control =====
            O::Unreachable => {
                self.emit(Op::Unreachable);
                self.reachable = false;
            }
            O::Nop => {}
            O::Block { blockty } => {
                let (params, results) = self.block_arity(blockty);
                self.frames.push(ControlFrame {
                    kind: FrameKind::Block,
                    base: self.height - params,
                    param_arity: params,
                    result_arity: results,
                    to_patch: Vec::new(),
                });
            }
            O::Loop { blockty } => {
                let (params, results) = self.block_arity(blockty);
                let header = u32::try_from(self.ops.len()).unwrap();
                if self.insert_cancel_polls {
                    self.emit(Op::CancelPoll);
                }
                self.frames.push(ControlFrame {
                    kind: FrameKind::Loop { header },
                    base: self.height - params,
                    param_arity: params,
                    result_arity: results,
                    to_patch: Vec::new(),
                });
            }
            O::If { blockty } => {
                let (params, results) = self.block_arity(blockty);
                self.pop(1);
                let else_fixup = self.ops.len();
                self.emit(Op::BrIfEqz(Target {
                    dest: PENDING_DEST,
                    drop_keep: DropKeep::NONE,
                }));
                self.frames.push(ControlFrame {
                    kind: FrameKind::If { else_fixup },
                    base: self.height - params,
                    param_arity: params,
                    result_arity: results,
                    to_patch: Vec::new(),
                });
            }
            O::Else => self.else_frame(true),
            O::End => self.end_frame(true),
            O::Br { relative_depth } => {
                let target = self.branch_target(*relative_depth);
                let op = self.ops.len();
                self.emit(Op::Br(target));
                self.defer_patch(*relative_depth, op, 0);
                self.reachable = false;
            }
            O::BrIf { relative_depth } => {
                self.pop(1);
                let target = self.branch_target(*relative_depth);
                let op = self.ops.len();
                self.emit(Op::BrIfNez(target));
                self.defer_patch(*relative_depth, op, 0);
            }
            O::BrTable { targets } => {
                self.pop(1);
                let op = self.ops.len();
                let mut resolved = Vec::with_capacity(targets.len() as usize + 1);
                let mut depths = Vec::with_capacity(targets.len() as usize + 1);
                for depth in targets.targets() {
                    let depth = depth?;
                    resolved.push(self.branch_target(depth));
                    depths.push(depth);
                }
                resolved.push(self.branch_target(targets.default()));
                depths.push(targets.default());
                self.emit(Op::BrTable(resolved.into_boxed_slice()));
                for (slot, depth) in depths.into_iter().enumerate() {
                    self.defer_patch(depth, op, slot);
                }
                self.reachable = false;
            }
            O::Return => {
                self.emit(Op::Return);
                self.reachable = false;
            }
            O::Call { function_index } => {
                let index = FuncIndex::from_u32(*function_index);
                let (params, results) = self.call_arity(index);
                self.pop(params);
                self.push(results);
                self.emit(Op::Call(index));
            }
            O::CallIndirect {
                type_index,
                table_index,
            } => {
                let ty = TypeIndex::from_u32(*type_index);
                let func_ty = &self.module.types[ty];
                let params = u32::try_from(func_ty.params().len()).unwrap();
                let results = u32::try_from(func_ty.results().len()).unwrap();
                self.pop(params + 1);
                self.push(results);
                self.emit(Op::CallIndirect {
                    type_index: ty,
                    table: TableIndex::from_u32(*table_index),
                });
            }

            // ===== parametric =====
            O::Drop => {
                self.pop(1);
                self.emit(Op::Drop);
            }
            O::Select | O::TypedSelect { .. } => {
                self.pop(3);
                self.push(1);
                self.emit(Op::Select);
            }

            // ===== locals & globals =====
            O::LocalGet { local_index } => {
                self.push(1);
                self.emit(Op::LocalGet(*local_index));
            }
            O::LocalSet { local_index } => {
                self.pop(1);
                self.emit(Op::LocalSet(*local_index));
            }
            O::LocalTee { local_index } => {
                self.emit(Op::LocalTee(*local_index));
            }
            O::GlobalGet { global_index } => {
                self.push(1);
                self.emit(Op::GlobalGet(GlobalIndex::from_u32(*global_index)));
            }
            O::GlobalSet { global_index } => {
                self.pop(1);
                self.emit(Op::GlobalSet(GlobalIndex::from_u32(*global_index)));
            }

            // ===== constants =====
            O::I32Const { value } => {
                self.push(1);
                self.emit(Op::I32Const(*value));
            }
            O::I64Const { value } => {
                self.push(1);
                self.emit(Op::I64Const(*value));
            }
            O::F32Const { value } => {
                self.push(1);
                self.emit(Op::F32Const(value.bits()));
            }
            O::F64Const { value } => {
                self.push(1);
                self.emit(Op::F64Const(value.bits()));
            }
            O::V128Const { value } => {
                self.push(1);
                self.emit(Op::V128Const(u128::from_le_bytes(*value.bytes())));
            }

            // ===== references =====
            O::RefNull { .. } => {
                self.push(1);
                self.emit(Op::RefNull);
            }
            O::RefIsNull => {
                self.emit(Op::RefIsNull);
            }
            O::RefFunc { function_index } => {
                self.push(1);
                self.emit(Op::RefFunc(FuncIndex::from_u32(*function_index)));
            }

            // ===== memory =====
            O::I32Load { memarg } => self.load(memarg, Op::I32Load)?,
            O::I64Load { memarg } => self.load(memarg, Op::I64Load)?,
            O::F32Load { memarg } => self.load(memarg, Op::F32Load)?,
            O::F64Load { memarg } => self.load(memarg, Op::F64Load)?,
            O::I32Load8S { memarg } => self.load(memarg, Op::I32Load8S)?,
            O::I32Load8U { memarg } => self.load(memarg, Op::I32Load8U)?,
            O::I32Load16S { memarg } => self.load(memarg, Op::I32Load16S)?,
            O::I32Load16U { memarg } => self.load(memarg, Op::I32Load16U)?,
            O::I64Load8S { memarg } => self.load(memarg, Op::I64Load8S)?,
            O::I64Load8U { memarg } => self.load(memarg, Op::I64Load8U)?,
            O::I64Load16S { memarg } => self.load(memarg, Op::I64Load16S)?,
            O::I64Load16U { memarg } => self.load(memarg, Op::I64Load16U)?,
            O::I64Load32S { memarg } => self.load(memarg, Op::I64Load32S)?,
            O::I64Load32U { memarg } => self.load(memarg, Op::I64Load32U)?,
            O::V128Load { memarg } => self.load(memarg, Op::V128Load)?,
            O::I32Store { memarg } => self.store(memarg, Op::I32Store)?,
            O::I64Store { memarg } => self.store(memarg, Op::I64Store)?,
            O::F32Store { memarg } => self.store(memarg, Op::F32Store)?,
            O::F64Store { memarg } => self.store(memarg, Op::F64Store)?,
            O::I32Store8 { memarg } => self.store(memarg, Op::I32Store8)?,
            O::I32Store16 { memarg } => self.store(memarg, Op::I32Store16)?,
            O::I64Store8 { memarg } => self.store(memarg, Op::I64Store8)?,
            O::I64Store16 { memarg } => self.store(memarg, Op::I64Store16)?,
            O::I64Store32 { memarg } => self.store(memarg, Op::I64Store32)?,
            O::V128Store { memarg } => self.store(memarg, Op::V128Store)?,
            O::MemorySize { .. } => {
                self.push(1);
                self.emit(Op::MemorySize);
            }
            O::MemoryGrow { .. } => {
                self.emit(Op::MemoryGrow);
            }
            O::MemoryFill { .. } => {
                self.pop(3);
                self.emit(Op::MemoryFill);
            }
            O::MemoryCopy { .. } => {
                self.pop(3);
                self.emit(Op::MemoryCopy);
            }
            O::MemoryInit { data_index, .. } => {
                self.pop(3);
                self.emit(Op::MemoryInit(DataIndex::from_u32(*data_index)));
            }
            O::DataDrop { data_index } => {
                self.emit(Op::DataDrop(DataIndex::from_u32(*data_index)));
            }

            // ===== tables =====
            O::TableGet { table } => {
                self.emit(Op::TableGet(TableIndex::from_u32(*table)));
            }
            O::TableSet { table } => {
                self.pop(2);
                self.emit(Op::TableSet(TableIndex::from_u32(*table)));
            }
            O::TableSize { table } => {
                self.push(1);
                self.emit(Op::TableSize(TableIndex::from_u32(*table)));
            }
            O::TableGrow { table } => {
                self.pop(2);
                self.push(1);
                self.emit(Op::TableGrow(TableIndex::from_u32(*table)));
            }
            O::TableFill { table } => {
                self.pop(3);
                self.emit(Op::TableFill(TableIndex::from_u32(*table)));
            }
            O::TableCopy {
                dst_table,
                src_table,
            } => {
                self.pop(3);
                self.emit(Op::TableCopy {
                    dst: TableIndex::from_u32(*dst_table),
                    src: TableIndex::from_u32(*src_table),
                });
            }
            O::TableInit { elem_index, table } => {
                self.pop(3);
                self.emit(Op::TableInit {
                    elem: ElemIndex::from_u32(*elem_index),
                    table: TableIndex::from_u32(*table),
                });
            }
            O::ElemDrop { elem_index } => {
                self.emit(Op::ElemDrop(ElemIndex::from_u32(*elem_index)));
            }

            // ===== numeric =====
            O::I32Eqz => self.unop(Op::I32Eqz),
            O::I32Eq => self.binop(Op::I32Eq),
            O::I32Ne => self.binop(Op::I32Ne),
            O::I32LtS => self.binop(Op::I32LtS),
            O::I32LtU => self.binop(Op::I32LtU),
            O::I32GtS => self.binop(Op::I32GtS),
            O::I32GtU => self.binop(Op::I32GtU),
            O::I32LeS => self.binop(Op::I32LeS),
            O::I32LeU => self.binop(Op::I32LeU),
            O::I32GeS => self.binop(Op::I32GeS),
            O::I32GeU => self.binop(Op::I32GeU),
            O::I32Clz => self.unop(Op::I32Clz),
            O::I32Ctz => self.unop(Op::I32Ctz),
            O::I32Popcnt => self.unop(Op::I32Popcnt),
            O::I32Add => self.binop(Op::I32Add),
            O::I32Sub => self.binop(Op::I32Sub),
            O::I32Mul => self.binop(Op::I32Mul),
            O::I32DivS => self.binop(Op::I32DivS),
            O::I32DivU => self.binop(Op::I32DivU),
            O::I32RemS => self.binop(Op::I32RemS),
            O::I32RemU => self.binop(Op::I32RemU),
            O::I32And => self.binop(Op::I32And),
            O::I32Or => self.binop(Op::I32Or),
            O::I32Xor => self.binop(Op::I32Xor),
            O::I32Shl => self.binop(Op::I32Shl),
            O::I32ShrS => self.binop(Op::I32ShrS),
            O::I32ShrU => self.binop(Op::I32ShrU),
            O::I32Rotl => self.binop(Op::I32Rotl),
            O::I32Rotr => self.binop(Op::I32Rotr),

            O::I64Eqz => {
                self.emit(Op::I64Eqz);
            }
            O::I64Eq => self.binop(Op::I64Eq),
            O::I64Ne => self.binop(Op::I64Ne),
            O::I64LtS => self.binop(Op::I64LtS),
            O::I64LtU => self.binop(Op::I64LtU),
            O::I64GtS => self.binop(Op::I64GtS),
            O::I64GtU => self.binop(Op::I64GtU),
            O::I64LeS => self.binop(Op::I64LeS),
            O::I64LeU => self.binop(Op::I64LeU),
            O::I64GeS => self.binop(Op::I64GeS),
            O::I64GeU => self.binop(Op::I64GeU),
            O::I64Clz => self.unop(Op::I64Clz),
            O::I64Ctz => self.unop(Op::I64Ctz),
            O::I64Popcnt => self.unop(Op::I64Popcnt),
            O::I64Add => self.binop(Op::I64Add),
            O::I64Sub => self.binop(Op::I64Sub),
            O::I64Mul => self.binop(Op::I64Mul),
            O::I64DivS => self.binop(Op::I64DivS),
            O::I64DivU => self.binop(Op::I64DivU),
            O::I64RemS => self.binop(Op::I64RemS),
            O::I64RemU => self.binop(Op::I64RemU),
            O::I64And => self.binop(Op::I64And),
            O::I64Or => self.binop(Op::I64Or),
            O::I64Xor => self.binop(Op::I64Xor),
            O::I64Shl => self.binop(Op::I64Shl),
            O::I64ShrS => self.binop(Op::I64ShrS),
            O::I64ShrU => self.binop(Op::I64ShrU),
            O::I64Rotl => self.binop(Op::I64Rotl),
            O::I64Rotr => self.binop(Op::I64Rotr),

            O::F32Eq => self.binop(Op::F32Eq),
            O::F32Ne => self.binop(Op::F32Ne),
            O::F32Lt => self.binop(Op::F32Lt),
            O::F32Gt => self.binop(Op::F32Gt),
            O::F32Le => self.binop(Op::F32Le),
            O::F32Ge => self.binop(Op::F32Ge),
            O::F32Abs => self.unop(Op::F32Abs),
            O::F32Neg => self.unop(Op::F32Neg),
            O::F32Ceil => self.unop(Op::F32Ceil),
            O::F32Floor => self.unop(Op::F32Floor),
            O::F32Trunc => self.unop(Op::F32Trunc),
            O::F32Nearest => self.unop(Op::F32Nearest),
            O::F32Sqrt => self.unop(Op::F32Sqrt),
            O::F32Add => self.binop(Op::F32Add),
            O::F32Sub => self.binop(Op::F32Sub),
            O::F32Mul => self.binop(Op::F32Mul),
            O::F32Div => self.binop(Op::F32Div),
            O::F32Min => self.binop(Op::F32Min),
            O::F32Max => self.binop(Op::F32Max),
            O::F32Copysign => self.binop(Op::F32Copysign),

            O::F64Eq => self.binop(Op::F64Eq),
            O::F64Ne => self.binop(Op::F64Ne),
            O::F64Lt => self.binop(Op::F64Lt),
            O::F64Gt => self.binop(Op::F64Gt),
            O::F64Le => self.binop(Op::F64Le),
            O::F64Ge => self.binop(Op::F64Ge),
            O::F64Abs => self.unop(Op::F64Abs),
            O::F64Neg => self.unop(Op::F64Neg),
            O::F64Ceil => self.unop(Op::F64Ceil),
            O::F64Floor => self.unop(Op::F64Floor),
            O::F64Trunc => self.unop(Op::F64Trunc),
            O::F64Nearest => self.unop(Op::F64Nearest),
            O::F64Sqrt => self.unop(Op::F64Sqrt),
            O::F64Add => self.binop(Op::F64Add),
            O::F64Sub => self.binop(Op::F64Sub),
            O::F64Mul => self.binop(Op::F64Mul),
            O::F64Div => self.binop(Op::F64Div),
            O::F64Min => self.binop(Op::F64Min),
            O::F64Max => self.binop(Op::F64Max),
            O::F64Copysign => self.binop(Op::F64Copysign),

            // ===== conversions =====
            O::I32WrapI64 => self.unop(Op::I32WrapI64),
            O::I32TruncF32S => self.unop(Op::I32TruncF32S),
            O::I32TruncF32U => self.unop(Op::I32TruncF32U),
            O::I32TruncF64S => self.unop(Op::I32TruncF64S),
            O::I32TruncF64U => self.unop(Op::I32TruncF64U),
            O::I64ExtendI32S => self.unop(Op::I64ExtendI32S),
            O::I64ExtendI32U => self.unop(Op::I64ExtendI32U),
            O::I64TruncF32S => self.unop(Op::I64TruncF32S),
            O::I64TruncF32U => self.unop(Op::I64TruncF32U),
            O::I64TruncF64S => self.unop(Op::I64TruncF64S),
            O::I64TruncF64U => self.unop(Op::I64TruncF64U),
            O::F32ConvertI32S => self.unop(Op::F32ConvertI32S),
            O::F32ConvertI32U => self.unop(Op::F32ConvertI32U),
            O::F32ConvertI64S => self.unop(Op::F32ConvertI64S),
            O::F32ConvertI64U => self.unop(Op::F32ConvertI64U),
            O::F32DemoteF64 => self.unop(Op::F32DemoteF64),
            O::F64ConvertI32S => self.unop(Op::F64ConvertI32S),
            O::F64ConvertI32U => self.unop(Op::F64ConvertI32U),
            O::F64ConvertI64S => self.unop(Op::F64ConvertI64S),
            O::F64ConvertI64U => self.unop(Op::F64ConvertI64U),
            O::F64PromoteF32 => self.unop(Op::F64PromoteF32),
            O::I32ReinterpretF32 => self.unop(Op::I32ReinterpretF32),
            O::I64ReinterpretF64 => self.unop(Op::I64ReinterpretF64),
            O::F32ReinterpretI32 => self.unop(Op::F32ReinterpretI32),
            O::F64ReinterpretI64 => self.unop(Op::F64ReinterpretI64),

            O::I32Extend8S => self.unop(Op::I32Extend8S),
            O::I32Extend16S => self.unop(Op::I32Extend16S),
            O::I64Extend8S => self.unop(Op::I64Extend8S),
            O::I64Extend16S => self.unop(Op::I64Extend16S),
            O::I64Extend32S => self.unop(Op::I64Extend32S),

            O::I32TruncSatF32S => self.unop(Op::I32TruncSatF32S),
            O::I32TruncSatF32U => self.unop(Op::I32TruncSatF32U),
            O::I32TruncSatF64S => self.unop(Op::I32TruncSatF64S),
            O::I32TruncSatF64U => self.unop(Op::I32TruncSatF64U),
            O::I64TruncSatF32S => self.unop(Op::I64TruncSatF32S),
            O::I64TruncSatF32U => self.unop(Op::I64TruncSatF32U),
            O::I64TruncSatF64S => self.unop(Op::I64TruncSatF64S),
            O::I64TruncSatF64U => self.unop(Op::I64TruncSatF64U),

            // ===== v128 subset =====
            O::V128And => self.binop(Op::V128And),
            O::V128AndNot => self.binop(Op::V128AndNot),
            O::V128Or => self.binop(Op::V128Or),
            O::V128Xor => self.binop(Op::V128Xor),
            O::V128Not => self.unop(Op::V128Not),
            O::V128Bitselect => {
                self.pop(3);
                self.push(1);
                self.emit(Op::V128Bitselect);
            }
            O::V128AnyTrue => self.unop(Op::V128AnyTrue),

            // ===== atomics =====
            O::MemoryAtomicNotify { memarg } => {
                self.pop(2);
                self.push(1);
                let offset = Self::memarg_offset(memarg);
                self.emit(Op::AtomicNotify { offset });
            }
            O::MemoryAtomicWait32 { memarg } => {
                self.pop(3);
                self.push(1);
                let offset = Self::memarg_offset(memarg);
                self.emit(Op::AtomicWait32 { offset });
            }
            O::MemoryAtomicWait64 { memarg } => {
                self.pop(3);
                self.push(1);
                let offset = Self::memarg_offset(memarg);
                self.emit(Op::AtomicWait64 { offset });
            }
            O::AtomicFence => self.emit(Op::AtomicFence),

            O::I32AtomicLoad { memarg } => self.atomic_load(memarg, AtomicTy::I32),
            O::I64AtomicLoad { memarg } => self.atomic_load(memarg, AtomicTy::I64),
            O::I32AtomicLoad8U { memarg } => self.atomic_load(memarg, AtomicTy::I32U8),
            O::I32AtomicLoad16U { memarg } => self.atomic_load(memarg, AtomicTy::I32U16),
            O::I64AtomicLoad8U { memarg } => self.atomic_load(memarg, AtomicTy::I64U8),
            O::I64AtomicLoad16U { memarg } => self.atomic_load(memarg, AtomicTy::I64U16),
            O::I64AtomicLoad32U { memarg } => self.atomic_load(memarg, AtomicTy::I64U32),

            O::I32AtomicStore { memarg } => self.atomic_store(memarg, AtomicTy::I32),
            O::I64AtomicStore { memarg } => self.atomic_store(memarg, AtomicTy::I64),
            O::I32AtomicStore8 { memarg } => self.atomic_store(memarg, AtomicTy::I32U8),
            O::I32AtomicStore16 { memarg } => self.atomic_store(memarg, AtomicTy::I32U16),
            O::I64AtomicStore8 { memarg } => self.atomic_store(memarg, AtomicTy::I64U8),
            O::I64AtomicStore16 { memarg } => self.atomic_store(memarg, AtomicTy::I64U16),
            O::I64AtomicStore32 { memarg } => self.atomic_store(memarg, AtomicTy::I64U32),

            O::I32AtomicRmwAdd { memarg } => self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I32),
            O::I64AtomicRmwAdd { memarg } => self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I64),
            O::I32AtomicRmw8AddU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I32U8)
            }
            O::I32AtomicRmw16AddU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I32U16)
            }
            O::I64AtomicRmw8AddU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I64U8)
            }
            O::I64AtomicRmw16AddU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I64U16)
            }
            O::I64AtomicRmw32AddU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Add, AtomicTy::I64U32)
            }

            O::I32AtomicRmwSub { memarg } => self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I32),
            O::I64AtomicRmwSub { memarg } => self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I64),
            O::I32AtomicRmw8SubU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I32U8)
            }
            O::I32AtomicRmw16SubU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I32U16)
            }
            O::I64AtomicRmw8SubU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I64U8)
            }
            O::I64AtomicRmw16SubU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I64U16)
            }
            O::I64AtomicRmw32SubU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Sub, AtomicTy::I64U32)
            }

            O::I32AtomicRmwAnd { memarg } => self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I32),
            O::I64AtomicRmwAnd { memarg } => self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I64),
            O::I32AtomicRmw8AndU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I32U8)
            }
            O::I32AtomicRmw16AndU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I32U16)
            }
            O::I64AtomicRmw8AndU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I64U8)
            }
            O::I64AtomicRmw16AndU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I64U16)
            }
            O::I64AtomicRmw32AndU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::And, AtomicTy::I64U32)
            }

            O::I32AtomicRmwOr { memarg } => self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I32),
            O::I64AtomicRmwOr { memarg } => self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I64),
            O::I32AtomicRmw8OrU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I32U8)
            }
            O::I32AtomicRmw16OrU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I32U16)
            }
            O::I64AtomicRmw8OrU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I64U8)
            }
            O::I64AtomicRmw16OrU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I64U16)
            }
            O::I64AtomicRmw32OrU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Or, AtomicTy::I64U32)
            }

            O::I32AtomicRmwXor { memarg } => self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I32),
            O::I64AtomicRmwXor { memarg } => self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I64),
            O::I32AtomicRmw8XorU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I32U8)
            }
            O::I32AtomicRmw16XorU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I32U16)
            }
            O::I64AtomicRmw8XorU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I64U8)
            }
            O::I64AtomicRmw16XorU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I64U16)
            }
            O::I64AtomicRmw32XorU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xor, AtomicTy::I64U32)
            }

            O::I32AtomicRmwXchg { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I32)
            }
            O::I64AtomicRmwXchg { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I64)
            }
            O::I32AtomicRmw8XchgU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I32U8)
            }
            O::I32AtomicRmw16XchgU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I32U16)
            }
            O::I64AtomicRmw8XchgU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I64U8)
            }
            O::I64AtomicRmw16XchgU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I64U16)
            }
            O::I64AtomicRmw32XchgU { memarg } => {
                self.atomic_rmw(memarg, AtomicOp::Xchg, AtomicTy::I64U32)
            }

            O::I32AtomicRmwCmpxchg { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I32),
            O::I64AtomicRmwCmpxchg { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I64),
            O::I32AtomicRmw8CmpxchgU { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I32U8),
            O::I32AtomicRmw16CmpxchgU { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I32U16),
            O::I64AtomicRmw8CmpxchgU { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I64U8),
            O::I64AtomicRmw16CmpxchgU { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I64U16),
            O::I64AtomicRmw32CmpxchgU { memarg } => self.atomic_cmpxchg(memarg, AtomicTy::I64U32),

            op => {
                return Err(wasm_unsupported!("operator {op:?}"));
            }
        }

        Ok(())
    }

    fn memarg_offset(memarg: &wasmparser::MemArg) -> u32 {
        // 64-bit memories are rejected at translation, so the validator has
        // already bounded the offset.
        u32::try_from(memarg.offset).unwrap()
    }

    fn load(
        &mut self,
        memarg: &wasmparser::MemArg,
        f: impl FnOnce(u32) -> Op,
    ) -> crate::Result<()> {
        let offset = Self::memarg_offset(memarg);
        self.emit(f(offset));
        Ok(())
    }

    fn store(
        &mut self,
        memarg: &wasmparser::MemArg,
        f: impl FnOnce(u32) -> Op,
    ) -> crate::Result<()> {
        let offset = Self::memarg_offset(memarg);
        self.pop(2);
        self.emit(f(offset));
        Ok(())
    }

    fn atomic_load(&mut self, memarg: &wasmparser::MemArg, ty: AtomicTy) {
        let offset = Self::memarg_offset(memarg);
        self.emit(Op::AtomicLoad { ty, offset });
    }

    fn atomic_store(&mut self, memarg: &wasmparser::MemArg, ty: AtomicTy) {
        let offset = Self::memarg_offset(memarg);
        self.pop(2);
        self.emit(Op::AtomicStore { ty, offset });
    }

    fn atomic_rmw(&mut self, memarg: &wasmparser::MemArg, op: AtomicOp, ty: AtomicTy) {
        let offset = Self::memarg_offset(memarg);
        self.pop(2);
        self.push(1);
        self.emit(Op::AtomicRmw { op, ty, offset });
    }

    fn atomic_cmpxchg(&mut self, memarg: &wasmparser::MemArg, ty: AtomicTy) {
        let offset = Self::memarg_offset(memarg);
        self.pop(3);
        self.push(1);
        self.emit(Op::AtomicCmpxchg { ty, offset });
    }

    fn unop(&mut self, op: Op) {
        self.emit(op);
    }

    fn binop(&mut self, op: Op) {
        self.pop(2);
        self.push(1);
        self.emit(op);
    }
}
