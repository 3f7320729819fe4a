// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-pass lowering from the flat IR to x86_64.
//!
//! The abstract value stack maps each entry to either a register or its
//! fixed home slot in the frame. Registers come from a free list; when it
//! runs dry the value lowest on the stack is spilled. At control-flow joins
//! and around calls everything is spilled so that every path observes the
//! same canonical layout.
//!
//! Functions use the array-call ABI throughout: `rdi` carries the callee
//! context (kept in `r14`), `rsi` the caller context, `rdx` the value array,
//! and the status word comes back in `eax`. Traps jump to a shared exit with
//! the status preloaded; nothing unwinds through generated frames.

use crate::compile::asm::x86_64::{AssembledFunction, Assembler, Cond, Inst, Reg};
use crate::compile::asm::{Label, StaticConst};
use crate::config::Config;
use crate::indices::{DefinedFuncIndex, FuncIndex, GlobalIndex, SharedTypeIndex, TableIndex, TypeIndex};
use crate::translate::{
    AtomicOp, AtomicTy, DropKeep, FunctionIr, ModuleTranslation, Op, Target, TranslatedModule,
};
use crate::trap::TrapKind;
use crate::types::{FuncType, ValType};
use crate::vm::{
    VMBuiltinFunctionsArray, VMContext, VMFuncRef, VMFunctionImport, VMGlobal,
    VMMemoryDefinition, VMTableDefinition, VMVal,
};
use core::mem::{offset_of, size_of};
use cranelift_entity::PrimaryMap;
use std::collections::HashMap;

const VMCTX_MEMORY_DEF: i32 = offset_of!(VMContext, memory_def) as i32;
const VMCTX_GLOBALS: i32 = offset_of!(VMContext, globals) as i32;
const VMCTX_IMPORTED_GLOBALS: i32 = offset_of!(VMContext, imported_globals) as i32;
const VMCTX_FUNC_REFS: i32 = offset_of!(VMContext, func_refs) as i32;
const VMCTX_IMPORTED_FUNCS: i32 = offset_of!(VMContext, imported_funcs) as i32;
const VMCTX_TABLES: i32 = offset_of!(VMContext, tables) as i32;
const VMCTX_BUILTINS: i32 = offset_of!(VMContext, builtins) as i32;
const VMCTX_STACK_LIMIT: i32 = offset_of!(VMContext, stack_limit) as i32;
const VMCTX_CANCEL: i32 = offset_of!(VMContext, cancel) as i32;
const VMCTX_TRAP: i32 = offset_of!(VMContext, trap) as i32;

const MEMDEF_BASE: i32 = offset_of!(VMMemoryDefinition, base) as i32;
const MEMDEF_LEN: i32 = offset_of!(VMMemoryDefinition, current_length) as i32;

const FUNCREF_ARRAY_CALL: i32 = offset_of!(VMFuncRef, array_call) as i32;
const FUNCREF_VMCTX: i32 = offset_of!(VMFuncRef, vmctx) as i32;
const FUNCREF_TYPE_INDEX: i32 = offset_of!(VMFuncRef, type_index) as i32;
const FUNCREF_SIZE: i32 = size_of::<VMFuncRef>() as i32;

const TABLEDEF_BASE: i32 = offset_of!(VMTableDefinition, base) as i32;
const TABLEDEF_LEN: i32 = offset_of!(VMTableDefinition, current_elements) as i32;

/// The context register and the cached linear-memory base.
const VMCTX: Reg = Reg::R14;
const MEMBASE: Reg = Reg::R15;

/// Fixed frame area below `rbp`: five callee-saved registers plus the value
/// array pointer, padded to keep the 16-byte slots below aligned.
const FIXED: i32 = 64;
const SAVE_RBX: i32 = -8;
const SAVE_R12: i32 = -16;
const SAVE_R13: i32 = -24;
const SAVE_R14: i32 = -32;
const SAVE_R15: i32 = -40;
const SAVE_VALS: i32 = -48;

const VMVAL_SIZE: i32 = size_of::<VMVal>() as i32;

#[derive(Debug, Copy, Clone, PartialEq)]
enum Loc {
    Reg(Reg),
    Stack,
}

#[derive(Debug, Copy, Clone)]
struct Value {
    loc: Loc,
    ty: ValType,
}

struct LabelInfo {
    label: Label,
    shape: Option<Vec<ValType>>,
}

/// Compiles one function's IR into unlinked machine code.
pub fn compile_function(
    translation: &ModuleTranslation,
    shared_signatures: &PrimaryMap<TypeIndex, SharedTypeIndex>,
    def_index: DefinedFuncIndex,
    ir: &FunctionIr,
    config: &Config,
) -> crate::Result<AssembledFunction> {
    let module = &translation.module;
    let func_index = module.func_index(def_index);
    let func_ty = module.func_type(func_index).clone();

    let mut local_types: Vec<ValType> = func_ty.params().to_vec();
    local_types.extend_from_slice(&ir.locals);

    let mut lowering = Lowering {
        asm: Assembler::new(),
        module,
        shared_signatures,
        ir,
        func_ty,
        local_types,
        num_locals: 0,
        max_stack: ir.max_stack_height as usize,
        scratch_slots: 0,
        stack: Vec::new(),
        free_gp: Vec::new(),
        free_xmm: Vec::new(),
        labels: HashMap::new(),
        trap_labels: HashMap::new(),
        exit_label: Label(u32::MAX),
        mask_consts: HashMap::new(),
        has_memory: !module.memories.is_empty(),
        terminated: false,
    };
    lowering.num_locals = lowering.local_types.len();
    if let Some(max) = config.max_displacement {
        lowering.asm.max_displacement_for_constant_pool = max;
    }
    lowering.run()
}

struct Lowering<'a> {
    asm: Assembler,
    module: &'a TranslatedModule,
    shared_signatures: &'a PrimaryMap<TypeIndex, SharedTypeIndex>,
    ir: &'a FunctionIr,
    func_ty: FuncType,
    local_types: Vec<ValType>,
    num_locals: usize,
    max_stack: usize,
    scratch_slots: usize,
    stack: Vec<Value>,
    free_gp: Vec<Reg>,
    free_xmm: Vec<Reg>,
    labels: HashMap<u32, LabelInfo>,
    trap_labels: HashMap<u8, Label>,
    exit_label: Label,
    mask_consts: HashMap<u128, StaticConst>,
    has_memory: bool,
    terminated: bool,
}

/// Pop order for the general-purpose free list; `alloc_gp` takes from the
/// back so rax/rcx/rdx (wanted by division and shifts) go out last.
#[rustfmt::skip]
const GP_POOL: &[Reg] = &[
    Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::R13, Reg::R12, Reg::Rdi, Reg::Rsi,
    Reg::Rbx, Reg::R11, Reg::R10, Reg::R9, Reg::R8,
];
#[rustfmt::skip]
const XMM_POOL: &[Reg] = &[
    Reg::Xmm0, Reg::Xmm1, Reg::Xmm2, Reg::Xmm3, Reg::Xmm4, Reg::Xmm5, Reg::Xmm6,
    Reg::Xmm7, Reg::Xmm8, Reg::Xmm9, Reg::Xmm10, Reg::Xmm11, Reg::Xmm12,
    Reg::Xmm13, Reg::Xmm14, Reg::Xmm15,
];

fn is_gp_type(ty: ValType) -> bool {
    matches!(ty, ValType::I32 | ValType::I64 | ValType::FuncRef)
}

/// Sign/mantissa masks for the float bit tricks, one lane pattern repeated
/// across the 16-byte pool constant.
const F32_ABS_MASK: u128 = 0x7fffffff_7fffffff_7fffffff_7fffffff;
const F32_NEG_MASK: u128 = 0x80000000_80000000_80000000_80000000;
const F64_ABS_MASK: u128 = 0x7fffffffffffffff_7fffffffffffffff;
const F64_NEG_MASK: u128 = 0x8000000000000000_8000000000000000;

impl<'a> Lowering<'a> {
    fn run(mut self) -> crate::Result<AssembledFunction> {
        self.free_gp = GP_POOL.to_vec();
        self.free_xmm = XMM_POOL.to_vec();
        self.exit_label = self.asm.new_label();
        self.scratch_slots = self.compute_scratch_slots();
        self.collect_branch_targets();

        self.emit_prologue();

        let ir = self.ir;
        for (pc, op) in ir.ops.iter().enumerate() {
            let pc = u32::try_from(pc).unwrap();
            if self.labels.contains_key(&pc) {
                self.begin_join_point(pc);
            } else {
                debug_assert!(!self.terminated, "unreachable op without a label: {op:?}");
            }
            self.lower_op(pc, op)?;
        }
        debug_assert!(self.terminated, "function fell off the end");

        self.emit_out_of_line();

        self.asm.assemble().map_err(Into::into)
    }

    // ===== frame geometry =====

    fn local_disp(&self, index: usize) -> i32 {
        -(FIXED + 16 * (index as i32) + 16)
    }

    fn stack_disp(&self, index: usize) -> i32 {
        -(FIXED + 16 * (self.num_locals as i32) + 16 * (index as i32) + 16)
    }

    /// Call-argument slots ascend so `&scratch[0]` can be passed as the
    /// callee's value array.
    fn scratch_disp(&self, index: usize) -> i32 {
        -self.frame_size() + 16 * (index as i32)
    }

    fn frame_size(&self) -> i32 {
        FIXED + 16 * ((self.num_locals + self.max_stack + self.scratch_slots) as i32)
    }

    fn compute_scratch_slots(&self) -> usize {
        let mut max = 0;
        for op in self.ir.ops.iter() {
            let arity = match op {
                Op::Call(func) => {
                    let ty = self.module.func_type(*func);
                    ty.params().len().max(ty.results().len())
                }
                Op::CallIndirect { type_index, .. } => {
                    let ty = &self.module.types[*type_index];
                    ty.params().len().max(ty.results().len())
                }
                _ => continue,
            };
            max = max.max(arity);
        }
        max
    }

    fn collect_branch_targets(&mut self) {
        let mut add = |labels: &mut HashMap<u32, LabelInfo>, asm: &mut Assembler, dest: u32| {
            labels.entry(dest).or_insert_with(|| LabelInfo {
                label: asm.new_label(),
                shape: None,
            });
        };
        let ir = self.ir;
        for op in ir.ops.iter() {
            match op {
                Op::Br(t) | Op::BrIfNez(t) | Op::BrIfEqz(t) => {
                    add(&mut self.labels, &mut self.asm, t.dest);
                }
                Op::BrTable(targets) => {
                    for t in targets.iter() {
                        add(&mut self.labels, &mut self.asm, t.dest);
                    }
                }
                _ => {}
            }
        }
    }

    // ===== register allocation =====

    fn alloc_class(&mut self, gp: bool) -> Reg {
        let free = if gp { &mut self.free_gp } else { &mut self.free_xmm };
        if let Some(reg) = free.pop() {
            return reg;
        }
        // Spill the lowest stack value held in a register of this class.
        let victim = self
            .stack
            .iter()
            .position(|v| matches!(v.loc, Loc::Reg(r) if r.is_xmm() != gp))
            .expect("register pressure with empty stack");
        let Loc::Reg(reg) = self.stack[victim].loc else {
            unreachable!()
        };
        let ty = self.stack[victim].ty;
        let disp = self.stack_disp(victim);
        self.store_to_frame(ty, reg, disp);
        self.stack[victim].loc = Loc::Stack;
        reg
    }

    fn alloc_gp(&mut self) -> Reg {
        self.alloc_class(true)
    }

    fn alloc_xmm(&mut self) -> Reg {
        self.alloc_class(false)
    }

    fn free_reg(&mut self, reg: Reg) {
        if reg.is_xmm() {
            self.free_xmm.push(reg);
        } else {
            self.free_gp.push(reg);
        }
    }

    /// Claims a specific register, spilling whatever stack value holds it.
    fn take_reg(&mut self, reg: Reg) {
        if let Some(pos) = self
            .stack
            .iter()
            .position(|v| v.loc == Loc::Reg(reg))
        {
            let ty = self.stack[pos].ty;
            let disp = self.stack_disp(pos);
            self.store_to_frame(ty, reg, disp);
            self.stack[pos].loc = Loc::Stack;
            return;
        }
        let free = if reg.is_xmm() { &mut self.free_xmm } else { &mut self.free_gp };
        let pos = free
            .iter()
            .position(|r| *r == reg)
            .expect("specific register neither free nor on the stack");
        free.remove(pos);
    }

    fn push_reg(&mut self, reg: Reg, ty: ValType) {
        self.stack.push(Value {
            loc: Loc::Reg(reg),
            ty,
        });
    }

    /// Pops the top value, materializing it into a register the caller now
    /// owns.
    fn pop_to_reg(&mut self) -> (Reg, ValType) {
        let value = self.stack.pop().expect("value stack underflow");
        let index = self.stack.len();
        match value.loc {
            Loc::Reg(reg) => (reg, value.ty),
            Loc::Stack => {
                let reg = if is_gp_type(value.ty) {
                    self.alloc_gp()
                } else {
                    self.alloc_xmm()
                };
                let disp = self.stack_disp(index);
                self.load_from_frame(value.ty, disp, reg);
                (reg, value.ty)
            }
        }
    }

    /// Spills every in-register stack value to its home slot.
    fn spill_all(&mut self) {
        for index in 0..self.stack.len() {
            if let Loc::Reg(reg) = self.stack[index].loc {
                let ty = self.stack[index].ty;
                let disp = self.stack_disp(index);
                self.store_to_frame(ty, reg, disp);
                self.stack[index].loc = Loc::Stack;
                self.free_reg(reg);
            }
        }
    }

    fn stack_shape(&self) -> Vec<ValType> {
        self.stack.iter().map(|v| v.ty).collect()
    }

    fn reset_stack(&mut self, shape: &[ValType]) {
        self.stack = shape
            .iter()
            .map(|ty| Value {
                loc: Loc::Stack,
                ty: *ty,
            })
            .collect();
        self.free_gp = GP_POOL.to_vec();
        self.free_xmm = XMM_POOL.to_vec();
    }

    // ===== frame moves =====

    fn load_from_frame(&mut self, ty: ValType, disp: i32, reg: Reg) {
        let inst = match ty {
            ValType::I32 => Inst::Movl,
            ValType::I64 | ValType::FuncRef => Inst::Movq,
            ValType::F32 => Inst::Movss,
            ValType::F64 => Inst::Movsd,
            ValType::V128 => Inst::Movdqu,
        };
        self.asm.compile_memory_to_register(inst, Reg::Rbp, disp, reg);
    }

    fn store_to_frame(&mut self, ty: ValType, reg: Reg, disp: i32) {
        let inst = match ty {
            ValType::I32 => Inst::Movl,
            ValType::I64 | ValType::FuncRef => Inst::Movq,
            ValType::F32 => Inst::Movss,
            ValType::F64 => Inst::Movsd,
            ValType::V128 => Inst::Movdqu,
        };
        self.asm.compile_register_to_memory(inst, reg, Reg::Rbp, disp);
    }

    // ===== traps & labels =====

    fn trap_label(&mut self, kind: TrapKind) -> Label {
        let status = u8::from(kind);
        if let Some(label) = self.trap_labels.get(&status) {
            return *label;
        }
        let label = self.asm.new_label();
        self.trap_labels.insert(status, label);
        label
    }

    fn emit_trap_if(&mut self, cond: Cond, kind: TrapKind) {
        let label = self.trap_label(kind);
        self.asm.compile_jump_cond(cond, label);
    }

    fn emit_trap(&mut self, kind: TrapKind) {
        let label = self.trap_label(kind);
        self.asm.compile_jump(label);
    }

    fn begin_join_point(&mut self, pc: u32) {
        self.spill_all();
        if self.terminated {
            let shape = self.labels[&pc]
                .shape
                .as_ref()
                .expect("label reached only by fallthrough was never shaped")
                .clone();
            self.reset_stack(&shape);
            self.terminated = false;
        } else if self.labels[&pc].shape.is_none() {
            let shape = self.stack_shape();
            self.labels.get_mut(&pc).unwrap().shape = Some(shape);
        }
        let label = self.labels[&pc].label;
        self.asm.bind(label);
    }

    /// Records the stack shape a branch with `dk` produces at its target.
    fn record_branch_shape(&mut self, dest: u32, dk: DropKeep) {
        let info = self.labels.get_mut(&dest).expect("branch to unknown label");
        if info.shape.is_some() {
            return;
        }
        let len = self.stack.len();
        let keep = dk.keep as usize;
        let drop = dk.drop as usize;
        let mut shape: Vec<ValType> = self.stack[..len - keep - drop]
            .iter()
            .map(|v| v.ty)
            .collect();
        shape.extend(self.stack[len - keep..].iter().map(|v| v.ty));
        info.shape = Some(shape);
    }

    /// Emits the stack shuffle of a branch; assumes everything is spilled.
    fn emit_drop_keep(&mut self, dk: DropKeep) {
        if dk.is_noop() {
            return;
        }
        let len = self.stack.len();
        let keep = dk.keep as usize;
        let drop = dk.drop as usize;
        for i in 0..keep {
            let src = len - keep + i;
            let dst = src - drop;
            let ty = self.stack[src].ty;
            let (src_disp, dst_disp) = (self.stack_disp(src), self.stack_disp(dst));
            if is_gp_type(ty) || matches!(ty, ValType::F32 | ValType::F64) {
                let tmp = self.alloc_gp();
                self.asm
                    .compile_memory_to_register(Inst::Movq, Reg::Rbp, src_disp, tmp);
                self.asm
                    .compile_register_to_memory(Inst::Movq, tmp, Reg::Rbp, dst_disp);
                self.free_reg(tmp);
            } else {
                let tmp = self.alloc_xmm();
                self.asm
                    .compile_memory_to_register(Inst::Movdqu, Reg::Rbp, src_disp, tmp);
                self.asm
                    .compile_register_to_memory(Inst::Movdqu, tmp, Reg::Rbp, dst_disp);
                self.free_reg(tmp);
            }
        }
    }

    fn emit_branch(&mut self, target: &Target) {
        self.spill_all();
        self.record_branch_shape(target.dest, target.drop_keep);
        self.emit_drop_keep(target.drop_keep);
        let label = self.labels[&target.dest].label;
        self.asm.compile_jump(label);
    }

    // ===== prologue / epilogue =====

    fn emit_prologue(&mut self) {
        let frame_size = self.frame_size();
        let asm = &mut self.asm;
        asm.compile_one_operand(Inst::Pushq, Reg::Rbp);
        asm.compile_register_to_register(Inst::Movq, Reg::Rsp, Reg::Rbp);
        asm.compile_const_to_register(Inst::Subq, i64::from(frame_size), Reg::Rsp);

        asm.compile_register_to_memory(Inst::Movq, Reg::Rbx, Reg::Rbp, SAVE_RBX);
        asm.compile_register_to_memory(Inst::Movq, Reg::R12, Reg::Rbp, SAVE_R12);
        asm.compile_register_to_memory(Inst::Movq, Reg::R13, Reg::Rbp, SAVE_R13);
        asm.compile_register_to_memory(Inst::Movq, Reg::R14, Reg::Rbp, SAVE_R14);
        asm.compile_register_to_memory(Inst::Movq, Reg::R15, Reg::Rbp, SAVE_R15);
        asm.compile_register_to_memory(Inst::Movq, Reg::Rdx, Reg::Rbp, SAVE_VALS);

        // vmctx into its home register, then the entry checks.
        asm.compile_register_to_register(Inst::Movq, Reg::Rdi, VMCTX);
        asm.compile_memory_to_register(Inst::Cmpq, VMCTX, VMCTX_STACK_LIMIT, Reg::Rsp);
        self.emit_trap_if(Cond::B, TrapKind::StackExhausted);
        self.emit_cancel_poll();

        if self.has_memory {
            self.emit_reload_membase();
        }

        // Parameters from the value array into their local slots.
        let params = self.func_ty.params().to_vec();
        for (i, ty) in params.iter().enumerate() {
            let disp_src = VMVAL_SIZE * i as i32;
            let disp_dst = self.local_disp(i);
            match ty {
                ValType::V128 => {
                    self.asm
                        .compile_memory_to_register(Inst::Movdqu, Reg::Rdx, disp_src, Reg::Xmm0);
                    self.asm
                        .compile_register_to_memory(Inst::Movdqu, Reg::Xmm0, Reg::Rbp, disp_dst);
                }
                _ => {
                    self.asm
                        .compile_memory_to_register(Inst::Movq, Reg::Rdx, disp_src, Reg::Rax);
                    self.asm
                        .compile_register_to_memory(Inst::Movq, Reg::Rax, Reg::Rbp, disp_dst);
                }
            }
        }

        // Declared locals default to zero.
        if self.num_locals > params.len() {
            self.asm
                .compile_register_to_register(Inst::Xorl, Reg::Rax, Reg::Rax);
            for i in params.len()..self.num_locals {
                let disp = self.local_disp(i);
                self.asm
                    .compile_register_to_memory(Inst::Movq, Reg::Rax, Reg::Rbp, disp);
                self.asm
                    .compile_register_to_memory(Inst::Movq, Reg::Rax, Reg::Rbp, disp + 8);
            }
        }
    }

    fn emit_cancel_poll(&mut self) {
        self.asm
            .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_CANCEL, Reg::Rax);
        self.asm
            .compile_memory_to_register(Inst::Movl, Reg::Rax, 0, Reg::Rax);
        self.asm
            .compile_register_to_register(Inst::Testl, Reg::Rax, Reg::Rax);
        self.emit_trap_if(Cond::Ne, TrapKind::Cancelled);
    }

    fn emit_reload_membase(&mut self) {
        self.asm
            .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_MEMORY_DEF, Reg::R11);
        self.asm
            .compile_memory_to_register(Inst::Movq, Reg::R11, MEMDEF_BASE, MEMBASE);
    }

    /// Trap stubs and the shared exit path.
    fn emit_out_of_line(&mut self) {
        let stubs: Vec<(u8, Label)> = self.trap_labels.iter().map(|(s, l)| (*s, *l)).collect();
        for (status, label) in stubs {
            self.asm.bind(label);
            self.asm.compile_const_to_register(
                Inst::Movl,
                i64::from(u32::from(status) + 1),
                Reg::Rax,
            );
            self.asm.compile_jump(self.exit_label);
        }

        self.asm.bind(self.exit_label);
        let asm = &mut self.asm;
        asm.compile_memory_to_register(Inst::Movq, Reg::Rbp, SAVE_RBX, Reg::Rbx);
        asm.compile_memory_to_register(Inst::Movq, Reg::Rbp, SAVE_R12, Reg::R12);
        asm.compile_memory_to_register(Inst::Movq, Reg::Rbp, SAVE_R13, Reg::R13);
        asm.compile_memory_to_register(Inst::Movq, Reg::Rbp, SAVE_R14, Reg::R14);
        asm.compile_memory_to_register(Inst::Movq, Reg::Rbp, SAVE_R15, Reg::R15);
        asm.compile_standalone(Inst::Leave);
        asm.compile_standalone(Inst::Ret);
    }

    /// Checks the builtin trap word after a builtin call that can trap.
    /// Clobbers `r11`; call before results are moved out of `rax`.
    fn emit_builtin_trap_check(&mut self) {
        let ok = self.asm.new_label();
        self.asm
            .compile_memory_to_register(Inst::Movl, VMCTX, VMCTX_TRAP, Reg::R11);
        self.asm
            .compile_register_to_register(Inst::Testl, Reg::R11, Reg::R11);
        self.asm.compile_jump_cond(Cond::E, ok);
        self.asm
            .compile_register_to_register(Inst::Movl, Reg::R11, Reg::Rax);
        self.asm.compile_jump(self.exit_label);
        self.asm.bind(ok);
    }

    /// `call qword ptr [builtins + offset]`, with `rdi = vmctx` already set
    /// by the caller of this helper if required.
    fn emit_call_builtin(&mut self, field_offset: usize) {
        self.asm
            .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_BUILTINS, Reg::Rax);
        self.asm
            .compile_call_memory(Reg::Rax, i32::try_from(field_offset).unwrap());
        if self.has_memory {
            self.emit_reload_membase();
        }
    }

    // ===== constants for float bit tricks =====

    fn mask_const(&mut self, bits: u128) -> StaticConst {
        if let Some(c) = self.mask_consts.get(&bits) {
            return *c;
        }
        let c = self.asm.new_static_const(&bits.to_le_bytes());
        self.mask_consts.insert(bits, c);
        c
    }

    // ===== the big dispatch =====

    #[allow(clippy::too_many_lines)]
    fn lower_op(&mut self, _pc: u32, op: &Op) -> crate::Result<()> {
        match op {
            // ===== control =====
            Op::Unreachable => {
                self.emit_trap(TrapKind::Unreachable);
                self.terminated = true;
            }
            Op::CancelPoll => {
                let rax_busy = self.stack.iter().any(|v| v.loc == Loc::Reg(Reg::Rax));
                if rax_busy {
                    self.take_reg(Reg::Rax);
                    self.free_reg(Reg::Rax);
                }
                self.emit_cancel_poll();
            }
            Op::Br(target) => {
                self.emit_branch(target);
                self.terminated = true;
            }
            Op::BrIfNez(target) => self.lower_br_if(target, Cond::Ne),
            Op::BrIfEqz(target) => self.lower_br_if(target, Cond::E),
            Op::BrTable(targets) => {
                self.lower_br_table(targets);
                self.terminated = true;
            }
            Op::Return => {
                self.lower_return();
                self.terminated = true;
            }
            Op::Call(func) => self.lower_call(*func),
            Op::CallIndirect { type_index, table } => {
                self.lower_call_indirect(*type_index, *table);
            }

            // ===== parametric =====
            Op::Drop => {
                let value = self.stack.pop().expect("value stack underflow");
                if let Loc::Reg(reg) = value.loc {
                    self.free_reg(reg);
                }
            }
            Op::Select => {
                let (cond, _) = self.pop_to_reg();
                let (v2, ty) = self.pop_to_reg();
                let (v1, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Testl, cond, cond);
                let keep = self.asm.new_label();
                self.asm.compile_jump_cond(Cond::Ne, keep);
                if v1.is_xmm() {
                    self.asm.compile_register_to_register(Inst::Movaps, v2, v1);
                } else {
                    self.asm.compile_register_to_register(Inst::Movq, v2, v1);
                }
                self.asm.bind(keep);
                self.free_reg(cond);
                self.free_reg(v2);
                self.push_reg(v1, ty);
            }

            // ===== locals & globals =====
            Op::LocalGet(index) => {
                let ty = self.local_types[*index as usize];
                let reg = if is_gp_type(ty) {
                    self.alloc_gp()
                } else {
                    self.alloc_xmm()
                };
                let disp = self.local_disp(*index as usize);
                self.load_from_frame(ty, disp, reg);
                self.push_reg(reg, ty);
            }
            Op::LocalSet(index) => {
                let (reg, ty) = self.pop_to_reg();
                let disp = self.local_disp(*index as usize);
                self.store_to_frame(ty, reg, disp);
                self.free_reg(reg);
            }
            Op::LocalTee(index) => {
                let (reg, ty) = self.pop_to_reg();
                let disp = self.local_disp(*index as usize);
                self.store_to_frame(ty, reg, disp);
                self.push_reg(reg, ty);
            }
            Op::GlobalGet(index) => self.lower_global_get(*index),
            Op::GlobalSet(index) => self.lower_global_set(*index),

            // ===== constants =====
            Op::I32Const(v) => {
                let reg = self.alloc_gp();
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(*v), reg);
                self.push_reg(reg, ValType::I32);
            }
            Op::I64Const(v) => {
                let reg = self.alloc_gp();
                self.asm.compile_const_to_register(Inst::Movq, *v, reg);
                self.push_reg(reg, ValType::I64);
            }
            Op::F32Const(bits) => {
                let reg = self.alloc_xmm();
                let c = self.asm.new_static_const(&bits.to_le_bytes());
                self.asm
                    .compile_static_const_to_register(Inst::Movss, c, reg)?;
                self.push_reg(reg, ValType::F32);
            }
            Op::F64Const(bits) => {
                let reg = self.alloc_xmm();
                let c = self.asm.new_static_const(&bits.to_le_bytes());
                self.asm
                    .compile_static_const_to_register(Inst::Movsd, c, reg)?;
                self.push_reg(reg, ValType::F64);
            }
            Op::V128Const(bits) => {
                let reg = self.alloc_xmm();
                let c = self.asm.new_static_const(&bits.to_le_bytes());
                self.asm
                    .compile_static_const_to_register(Inst::Movdqu, c, reg)?;
                self.push_reg(reg, ValType::V128);
            }

            // ===== references =====
            Op::RefNull => {
                let reg = self.alloc_gp();
                self.asm.compile_register_to_register(Inst::Xorl, reg, reg);
                self.push_reg(reg, ValType::FuncRef);
            }
            Op::RefIsNull => {
                let (reg, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Testq, reg, reg);
                self.asm.compile_setcc(Cond::E, reg);
                self.asm.compile_register_to_register(Inst::Movzxbl, reg, reg);
                self.push_reg(reg, ValType::I32);
            }
            Op::RefFunc(index) => {
                let reg = self.alloc_gp();
                if self.module.is_imported_function(*index) {
                    self.asm.compile_memory_to_register(
                        Inst::Movq,
                        VMCTX,
                        VMCTX_IMPORTED_FUNCS,
                        reg,
                    );
                    let slot = size_of::<VMFunctionImport>() as i32 * index.as_u32() as i32;
                    self.asm.compile_memory_to_register(Inst::Movq, reg, slot, reg);
                } else {
                    let func_ref = self.module.functions[*index].func_ref;
                    self.asm
                        .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_FUNC_REFS, reg);
                    self.asm.compile_memory_to_register(
                        Inst::Leaq,
                        reg,
                        FUNCREF_SIZE * func_ref.as_u32() as i32,
                        reg,
                    );
                }
                self.push_reg(reg, ValType::FuncRef);
            }

            // ===== memory =====
            Op::I32Load(o) => self.lower_load(*o, 4, Inst::Movl, ValType::I32),
            Op::I64Load(o) => self.lower_load(*o, 8, Inst::Movq, ValType::I64),
            Op::F32Load(o) => self.lower_load(*o, 4, Inst::Movss, ValType::F32),
            Op::F64Load(o) => self.lower_load(*o, 8, Inst::Movsd, ValType::F64),
            Op::I32Load8S(o) => self.lower_load(*o, 1, Inst::Movsxbl, ValType::I32),
            Op::I32Load8U(o) => self.lower_load(*o, 1, Inst::Movzxbl, ValType::I32),
            Op::I32Load16S(o) => self.lower_load(*o, 2, Inst::Movsxwl, ValType::I32),
            Op::I32Load16U(o) => self.lower_load(*o, 2, Inst::Movzxwl, ValType::I32),
            Op::I64Load8S(o) => self.lower_load(*o, 1, Inst::Movsxbq, ValType::I64),
            Op::I64Load8U(o) => self.lower_load(*o, 1, Inst::Movzxbl, ValType::I64),
            Op::I64Load16S(o) => self.lower_load(*o, 2, Inst::Movsxwq, ValType::I64),
            Op::I64Load16U(o) => self.lower_load(*o, 2, Inst::Movzxwl, ValType::I64),
            Op::I64Load32S(o) => self.lower_load(*o, 4, Inst::Movsxdq, ValType::I64),
            Op::I64Load32U(o) => self.lower_load(*o, 4, Inst::Movl, ValType::I64),
            Op::V128Load(o) => self.lower_load(*o, 16, Inst::Movdqu, ValType::V128),
            Op::I32Store(o) => self.lower_store(*o, 4, Inst::Movl),
            Op::I64Store(o) => self.lower_store(*o, 8, Inst::Movq),
            Op::F32Store(o) => self.lower_store(*o, 4, Inst::Movss),
            Op::F64Store(o) => self.lower_store(*o, 8, Inst::Movsd),
            Op::I32Store8(o) => self.lower_store(*o, 1, Inst::Movb),
            Op::I32Store16(o) => self.lower_store(*o, 2, Inst::Movw),
            Op::I64Store8(o) => self.lower_store(*o, 1, Inst::Movb),
            Op::I64Store16(o) => self.lower_store(*o, 2, Inst::Movw),
            Op::I64Store32(o) => self.lower_store(*o, 4, Inst::Movl),
            Op::V128Store(o) => self.lower_store(*o, 16, Inst::Movdqu),
            Op::MemorySize => {
                let reg = self.alloc_gp();
                self.asm
                    .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_MEMORY_DEF, reg);
                self.asm
                    .compile_memory_to_register(Inst::Movq, reg, MEMDEF_LEN, reg);
                self.asm.compile_shift_imm(Inst::Shrq, 16, reg);
                self.push_reg(reg, ValType::I32);
            }
            Op::MemoryGrow => {
                let (delta, _) = self.pop_to_reg();
                self.spill_all();
                if delta != Reg::Rsi {
                    self.asm.compile_register_to_register(Inst::Movl, delta, Reg::Rsi);
                    self.free_reg(delta);
                } else {
                    self.free_reg(delta);
                }
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, memory_grow));
                self.take_reg(Reg::Rax);
                // Truncate the -1/previous-pages result to i32.
                self.asm.compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
                self.push_reg(Reg::Rax, ValType::I32);
            }
            Op::MemoryFill => {
                self.lower_builtin_3(offset_of!(VMBuiltinFunctionsArray, memory_fill));
            }
            Op::MemoryCopy => {
                self.lower_builtin_3(offset_of!(VMBuiltinFunctionsArray, memory_copy));
            }
            Op::MemoryInit(seg) => {
                self.lower_seg_builtin(
                    offset_of!(VMBuiltinFunctionsArray, memory_init),
                    seg.as_u32(),
                );
            }
            Op::DataDrop(seg) => {
                self.spill_all();
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(seg.as_u32()), Reg::Rsi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, data_drop));
            }

            // ===== tables =====
            Op::TableGet(table) => {
                let (index, _) = self.pop_to_reg();
                self.spill_all();
                self.asm.compile_register_to_register(Inst::Movl, index, index);
                if index != Reg::Rdx {
                    self.asm.compile_register_to_register(Inst::Movq, index, Reg::Rdx);
                }
                self.free_reg(index);
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(table.as_u32()), Reg::Rsi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, table_get));
                self.emit_builtin_trap_check();
                self.take_reg(Reg::Rax);
                self.push_reg(Reg::Rax, ValType::FuncRef);
            }
            Op::TableSet(table) => {
                let (value, _) = self.pop_to_reg();
                let (index, _) = self.pop_to_reg();
                self.spill_all();
                self.emit_shuffle2((index, Reg::Rdx), (value, Reg::Rcx));
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(table.as_u32()), Reg::Rsi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, table_set));
                self.emit_builtin_trap_check();
            }
            Op::TableSize(table) => {
                let reg = self.alloc_gp();
                let tmp = self.alloc_gp();
                self.asm
                    .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_TABLES, tmp);
                self.asm.compile_memory_to_register(
                    Inst::Movq,
                    tmp,
                    8 * table.as_u32() as i32,
                    tmp,
                );
                self.asm
                    .compile_memory_to_register(Inst::Movq, tmp, TABLEDEF_LEN, reg);
                self.free_reg(tmp);
                self.push_reg(reg, ValType::I32);
            }
            Op::TableGrow(table) => {
                let (delta, _) = self.pop_to_reg();
                let (init, _) = self.pop_to_reg();
                self.spill_all();
                self.emit_shuffle2((delta, Reg::Rdx), (init, Reg::Rcx));
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(table.as_u32()), Reg::Rsi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, table_grow));
                self.take_reg(Reg::Rax);
                self.asm.compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
                self.push_reg(Reg::Rax, ValType::I32);
            }
            Op::TableFill(table) => {
                let (len, _) = self.pop_to_reg();
                let (value, _) = self.pop_to_reg();
                let (dst, _) = self.pop_to_reg();
                self.spill_all();
                self.emit_shuffle3((dst, Reg::Rdx), (value, Reg::Rcx), (len, Reg::R8));
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(table.as_u32()), Reg::Rsi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, table_fill));
                self.emit_builtin_trap_check();
            }
            Op::TableCopy { dst, src } => {
                let (len, _) = self.pop_to_reg();
                let (src_i, _) = self.pop_to_reg();
                let (dst_i, _) = self.pop_to_reg();
                self.spill_all();
                self.emit_shuffle3((dst_i, Reg::Rcx), (src_i, Reg::R8), (len, Reg::R9));
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(dst.as_u32()), Reg::Rsi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(src.as_u32()), Reg::Rdx);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, table_copy));
                self.emit_builtin_trap_check();
            }
            Op::TableInit { elem, table } => {
                let (len, _) = self.pop_to_reg();
                let (src_i, _) = self.pop_to_reg();
                let (dst_i, _) = self.pop_to_reg();
                self.spill_all();
                self.emit_shuffle3((dst_i, Reg::Rcx), (src_i, Reg::R8), (len, Reg::R9));
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(elem.as_u32()), Reg::Rsi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(table.as_u32()), Reg::Rdx);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, table_init));
                self.emit_builtin_trap_check();
            }
            Op::ElemDrop(elem) => {
                self.spill_all();
                self.asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
                self.asm
                    .compile_const_to_register(Inst::Movl, i64::from(elem.as_u32()), Reg::Rsi);
                self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, elem_drop));
            }

            // ===== i32/i64 alu =====
            Op::I32Add => self.lower_binop_gp(Inst::Addl),
            Op::I32Sub => self.lower_binop_gp(Inst::Subl),
            Op::I32Mul => self.lower_binop_gp(Inst::Imull),
            Op::I32And => self.lower_binop_gp(Inst::Andl),
            Op::I32Or => self.lower_binop_gp(Inst::Orl),
            Op::I32Xor => self.lower_binop_gp(Inst::Xorl),
            Op::I64Add => self.lower_binop_gp(Inst::Addq),
            Op::I64Sub => self.lower_binop_gp(Inst::Subq),
            Op::I64Mul => self.lower_binop_gp(Inst::Imulq),
            Op::I64And => self.lower_binop_gp(Inst::Andq),
            Op::I64Or => self.lower_binop_gp(Inst::Orq),
            Op::I64Xor => self.lower_binop_gp(Inst::Xorq),

            Op::I32Shl => self.lower_shift(Inst::Shll),
            Op::I32ShrS => self.lower_shift(Inst::Sarl),
            Op::I32ShrU => self.lower_shift(Inst::Shrl),
            Op::I32Rotl => self.lower_shift(Inst::Roll),
            Op::I32Rotr => self.lower_shift(Inst::Rorl),
            Op::I64Shl => self.lower_shift(Inst::Shlq),
            Op::I64ShrS => self.lower_shift(Inst::Sarq),
            Op::I64ShrU => self.lower_shift(Inst::Shrq),
            Op::I64Rotl => self.lower_shift(Inst::Rolq),
            Op::I64Rotr => self.lower_shift(Inst::Rorq),

            Op::I32DivS => self.lower_div(false, true, true),
            Op::I32DivU => self.lower_div(false, false, true),
            Op::I32RemS => self.lower_div(false, true, false),
            Op::I32RemU => self.lower_div(false, false, false),
            Op::I64DivS => self.lower_div(true, true, true),
            Op::I64DivU => self.lower_div(true, false, true),
            Op::I64RemS => self.lower_div(true, true, false),
            Op::I64RemU => self.lower_div(true, false, false),

            Op::I32Clz => self.lower_unop_gp(Inst::Lzcntl, ValType::I32),
            Op::I32Ctz => self.lower_unop_gp(Inst::Tzcntl, ValType::I32),
            Op::I32Popcnt => self.lower_unop_gp(Inst::Popcntl, ValType::I32),
            Op::I64Clz => self.lower_unop_gp(Inst::Lzcntq, ValType::I64),
            Op::I64Ctz => self.lower_unop_gp(Inst::Tzcntq, ValType::I64),
            Op::I64Popcnt => self.lower_unop_gp(Inst::Popcntq, ValType::I64),

            Op::I32Eqz => self.lower_eqz(Inst::Testl),
            Op::I64Eqz => self.lower_eqz(Inst::Testq),

            Op::I32Eq => self.lower_icmp(Inst::Cmpl, Cond::E),
            Op::I32Ne => self.lower_icmp(Inst::Cmpl, Cond::Ne),
            Op::I32LtS => self.lower_icmp(Inst::Cmpl, Cond::L),
            Op::I32LtU => self.lower_icmp(Inst::Cmpl, Cond::B),
            Op::I32GtS => self.lower_icmp(Inst::Cmpl, Cond::G),
            Op::I32GtU => self.lower_icmp(Inst::Cmpl, Cond::A),
            Op::I32LeS => self.lower_icmp(Inst::Cmpl, Cond::Le),
            Op::I32LeU => self.lower_icmp(Inst::Cmpl, Cond::Be),
            Op::I32GeS => self.lower_icmp(Inst::Cmpl, Cond::Ge),
            Op::I32GeU => self.lower_icmp(Inst::Cmpl, Cond::Ae),
            Op::I64Eq => self.lower_icmp(Inst::Cmpq, Cond::E),
            Op::I64Ne => self.lower_icmp(Inst::Cmpq, Cond::Ne),
            Op::I64LtS => self.lower_icmp(Inst::Cmpq, Cond::L),
            Op::I64LtU => self.lower_icmp(Inst::Cmpq, Cond::B),
            Op::I64GtS => self.lower_icmp(Inst::Cmpq, Cond::G),
            Op::I64GtU => self.lower_icmp(Inst::Cmpq, Cond::A),
            Op::I64LeS => self.lower_icmp(Inst::Cmpq, Cond::Le),
            Op::I64LeU => self.lower_icmp(Inst::Cmpq, Cond::Be),
            Op::I64GeS => self.lower_icmp(Inst::Cmpq, Cond::Ge),
            Op::I64GeU => self.lower_icmp(Inst::Cmpq, Cond::Ae),

            // ===== float arithmetic =====
            Op::F32Add => self.lower_binop_sse(Inst::Addss),
            Op::F32Sub => self.lower_binop_sse(Inst::Subss),
            Op::F32Mul => self.lower_binop_sse(Inst::Mulss),
            Op::F32Div => self.lower_binop_sse(Inst::Divss),
            Op::F64Add => self.lower_binop_sse(Inst::Addsd),
            Op::F64Sub => self.lower_binop_sse(Inst::Subsd),
            Op::F64Mul => self.lower_binop_sse(Inst::Mulsd),
            Op::F64Div => self.lower_binop_sse(Inst::Divsd),

            Op::F32Sqrt => self.lower_unop_sse(Inst::Sqrtss),
            Op::F64Sqrt => self.lower_unop_sse(Inst::Sqrtsd),

            Op::F32Abs => self.lower_float_mask(Inst::Andps, F32_ABS_MASK),
            Op::F32Neg => self.lower_float_mask(Inst::Xorps, F32_NEG_MASK),
            Op::F64Abs => self.lower_float_mask(Inst::Andps, F64_ABS_MASK),
            Op::F64Neg => self.lower_float_mask(Inst::Xorps, F64_NEG_MASK),

            Op::F32Ceil => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f32_ceil), ValType::F32),
            Op::F32Floor => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f32_floor), ValType::F32),
            Op::F32Trunc => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f32_trunc), ValType::F32),
            Op::F32Nearest => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f32_nearest), ValType::F32),
            Op::F64Ceil => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f64_ceil), ValType::F64),
            Op::F64Floor => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f64_floor), ValType::F64),
            Op::F64Trunc => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f64_trunc), ValType::F64),
            Op::F64Nearest => self.lower_float_builtin1(offset_of!(VMBuiltinFunctionsArray, f64_nearest), ValType::F64),

            Op::F32Min => self.lower_float_builtin2(offset_of!(VMBuiltinFunctionsArray, f32_min), ValType::F32),
            Op::F32Max => self.lower_float_builtin2(offset_of!(VMBuiltinFunctionsArray, f32_max), ValType::F32),
            Op::F32Copysign => self.lower_float_builtin2(offset_of!(VMBuiltinFunctionsArray, f32_copysign), ValType::F32),
            Op::F64Min => self.lower_float_builtin2(offset_of!(VMBuiltinFunctionsArray, f64_min), ValType::F64),
            Op::F64Max => self.lower_float_builtin2(offset_of!(VMBuiltinFunctionsArray, f64_max), ValType::F64),
            Op::F64Copysign => self.lower_float_builtin2(offset_of!(VMBuiltinFunctionsArray, f64_copysign), ValType::F64),

            Op::F32Eq => self.lower_fcmp(Inst::Ucomiss, FloatCmp::Eq),
            Op::F32Ne => self.lower_fcmp(Inst::Ucomiss, FloatCmp::Ne),
            Op::F32Lt => self.lower_fcmp(Inst::Ucomiss, FloatCmp::Lt),
            Op::F32Gt => self.lower_fcmp(Inst::Ucomiss, FloatCmp::Gt),
            Op::F32Le => self.lower_fcmp(Inst::Ucomiss, FloatCmp::Le),
            Op::F32Ge => self.lower_fcmp(Inst::Ucomiss, FloatCmp::Ge),
            Op::F64Eq => self.lower_fcmp(Inst::Ucomisd, FloatCmp::Eq),
            Op::F64Ne => self.lower_fcmp(Inst::Ucomisd, FloatCmp::Ne),
            Op::F64Lt => self.lower_fcmp(Inst::Ucomisd, FloatCmp::Lt),
            Op::F64Gt => self.lower_fcmp(Inst::Ucomisd, FloatCmp::Gt),
            Op::F64Le => self.lower_fcmp(Inst::Ucomisd, FloatCmp::Le),
            Op::F64Ge => self.lower_fcmp(Inst::Ucomisd, FloatCmp::Ge),

            // ===== conversions =====
            Op::I32WrapI64 => {
                let (reg, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Movl, reg, reg);
                self.push_reg(reg, ValType::I32);
            }
            Op::I64ExtendI32S => {
                let (reg, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Movsxdq, reg, reg);
                self.push_reg(reg, ValType::I64);
            }
            Op::I64ExtendI32U => {
                let (reg, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Movl, reg, reg);
                self.push_reg(reg, ValType::I64);
            }
            Op::I32Extend8S => self.lower_extend(Inst::Movsxbl, ValType::I32),
            Op::I32Extend16S => self.lower_extend(Inst::Movsxwl, ValType::I32),
            Op::I64Extend8S => self.lower_extend(Inst::Movsxbq, ValType::I64),
            Op::I64Extend16S => self.lower_extend(Inst::Movsxwq, ValType::I64),
            Op::I64Extend32S => self.lower_extend(Inst::Movsxdq, ValType::I64),

            Op::F32ConvertI32S => self.lower_int_to_float(Inst::Cvtsi2ssl, ValType::F32),
            Op::F32ConvertI32U => self.lower_int_to_float(Inst::Cvtsi2ssq, ValType::F32),
            Op::F32ConvertI64S => self.lower_int_to_float(Inst::Cvtsi2ssq, ValType::F32),
            Op::F64ConvertI32S => self.lower_int_to_float(Inst::Cvtsi2sdl, ValType::F64),
            Op::F64ConvertI32U => self.lower_int_to_float(Inst::Cvtsi2sdq, ValType::F64),
            Op::F64ConvertI64S => self.lower_int_to_float(Inst::Cvtsi2sdq, ValType::F64),
            Op::F32ConvertI64U => self.lower_u64_to_float(
                offset_of!(VMBuiltinFunctionsArray, f32_convert_i64_u),
                ValType::F32,
            ),
            Op::F64ConvertI64U => self.lower_u64_to_float(
                offset_of!(VMBuiltinFunctionsArray, f64_convert_i64_u),
                ValType::F64,
            ),

            Op::F32DemoteF64 => self.lower_unop_sse_as(Inst::Cvtsd2ss, ValType::F32),
            Op::F64PromoteF32 => self.lower_unop_sse_as(Inst::Cvtss2sd, ValType::F64),

            Op::I32ReinterpretF32 => self.lower_bitcast(false, ValType::I32),
            Op::I64ReinterpretF64 => self.lower_bitcast(false, ValType::I64),
            Op::F32ReinterpretI32 => self.lower_bitcast(true, ValType::F32),
            Op::F64ReinterpretI64 => self.lower_bitcast(true, ValType::F64),

            Op::I32TruncF32S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_f32_s), true, false, true),
            Op::I32TruncF32U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_f32_u), true, false, true),
            Op::I32TruncF64S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_f64_s), false, false, true),
            Op::I32TruncF64U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_f64_u), false, false, true),
            Op::I64TruncF32S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_f32_s), true, true, true),
            Op::I64TruncF32U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_f32_u), true, true, true),
            Op::I64TruncF64S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_f64_s), false, true, true),
            Op::I64TruncF64U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_f64_u), false, true, true),
            Op::I32TruncSatF32S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_sat_f32_s), true, false, false),
            Op::I32TruncSatF32U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_sat_f32_u), true, false, false),
            Op::I32TruncSatF64S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_sat_f64_s), false, false, false),
            Op::I32TruncSatF64U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i32_trunc_sat_f64_u), false, false, false),
            Op::I64TruncSatF32S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_sat_f32_s), true, true, false),
            Op::I64TruncSatF32U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_sat_f32_u), true, true, false),
            Op::I64TruncSatF64S => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_sat_f64_s), false, true, false),
            Op::I64TruncSatF64U => self.lower_trunc(offset_of!(VMBuiltinFunctionsArray, i64_trunc_sat_f64_u), false, true, false),

            // ===== v128 =====
            Op::V128And => self.lower_binop_sse_v(Inst::Pand),
            Op::V128Or => self.lower_binop_sse_v(Inst::Por),
            Op::V128Xor => self.lower_binop_sse_v(Inst::Pxor),
            Op::V128AndNot => {
                // a & !b: pandn computes !dst & src, so the popped rhs is the
                // destination.
                let (rhs, _) = self.pop_to_reg();
                let (lhs, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Pandn, lhs, rhs);
                self.free_reg(lhs);
                self.push_reg(rhs, ValType::V128);
            }
            Op::V128Not => {
                let (reg, _) = self.pop_to_reg();
                let c = self.mask_const(u128::MAX);
                self.asm.compile_static_const_to_register(Inst::Pxor, c, reg)?;
                self.push_reg(reg, ValType::V128);
            }
            Op::V128Bitselect => {
                let (c, _) = self.pop_to_reg();
                let (v2, _) = self.pop_to_reg();
                let (v1, _) = self.pop_to_reg();
                self.asm.compile_register_to_register(Inst::Pand, c, v1);
                self.asm.compile_register_to_register(Inst::Pandn, v2, c);
                self.asm.compile_register_to_register(Inst::Por, c, v1);
                self.free_reg(c);
                self.free_reg(v2);
                self.push_reg(v1, ValType::V128);
            }
            Op::V128AnyTrue => {
                let (v, _) = self.pop_to_reg();
                let reg = self.alloc_gp();
                self.asm.compile_register_to_register(Inst::Ptest, v, v);
                self.asm.compile_setcc(Cond::Ne, reg);
                self.asm.compile_register_to_register(Inst::Movzxbl, reg, reg);
                self.free_reg(v);
                self.push_reg(reg, ValType::I32);
            }

            // ===== atomics =====
            Op::AtomicFence => self.asm.compile_standalone(Inst::Mfence),
            Op::AtomicLoad { ty, offset } => self.lower_atomic_load(*ty, *offset),
            Op::AtomicStore { ty, offset } => self.lower_atomic_store(*ty, *offset),
            Op::AtomicRmw { op, ty, offset } => self.lower_atomic_rmw(*op, *ty, *offset),
            Op::AtomicCmpxchg { ty, offset } => self.lower_atomic_cmpxchg(*ty, *offset),
            Op::AtomicNotify { offset } => self.lower_atomic_notify(*offset),
            Op::AtomicWait32 { offset } => self.lower_atomic_wait(*offset, false),
            Op::AtomicWait64 { offset } => self.lower_atomic_wait(*offset, true),
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
enum FloatCmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

mod helpers;
