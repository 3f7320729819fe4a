// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-operation emission helpers for the x86_64 lowering.

use super::*;

impl<'a> Lowering<'a> {
    // ===== control flow =====

    pub(super) fn lower_br_if(&mut self, target: &Target, cond: Cond) {
        let (reg, _) = self.pop_to_reg();
        self.spill_all();
        self.asm.compile_register_to_register(Inst::Testl, reg, reg);
        self.free_reg(reg);
        self.record_branch_shape(target.dest, target.drop_keep);

        if target.drop_keep.is_noop() {
            let label = self.labels[&target.dest].label;
            self.asm.compile_jump_cond(cond, label);
        } else {
            let skip = self.asm.new_label();
            let inverse = match cond {
                Cond::E => Cond::Ne,
                Cond::Ne => Cond::E,
                _ => unreachable!(),
            };
            self.asm.compile_jump_cond(inverse, skip);
            self.emit_drop_keep(target.drop_keep);
            let label = self.labels[&target.dest].label;
            self.asm.compile_jump(label);
            self.asm.bind(skip);
        }
    }

    pub(super) fn lower_br_table(&mut self, targets: &[Target]) {
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        for t in targets {
            self.record_branch_shape(t.dest, t.drop_keep);
        }

        let n = targets.len() - 1;
        let default = targets[n];

        if n == 0 {
            self.free_reg(idx);
            self.emit_drop_keep(default.drop_keep);
            let label = self.labels[&default.dest].label;
            self.asm.compile_jump(label);
            return;
        }

        if idx != Reg::R10 {
            self.asm.compile_register_to_register(Inst::Movl, idx, Reg::R10);
            self.free_reg(idx);
        }

        // Clamp to the default target.
        let mut shims: Vec<(Label, Target)> = Vec::new();
        let default_label = if default.drop_keep.is_noop() {
            self.labels[&default.dest].label
        } else {
            let shim = self.asm.new_label();
            shims.push((shim, default));
            shim
        };
        self.asm
            .compile_const_to_register(Inst::Cmpl, n as i64, Reg::R10);
        self.asm.compile_jump_cond(Cond::Ae, default_label);

        // The jump table itself: 32-bit offsets relative to the table start.
        let mut entry_labels = Vec::with_capacity(n);
        for t in &targets[..n] {
            if t.drop_keep.is_noop() {
                entry_labels.push(self.labels[&t.dest].label);
            } else {
                let shim = self.asm.new_label();
                shims.push((shim, *t));
                entry_labels.push(shim);
            }
        }
        let table = self.asm.new_static_const(&vec![0u8; 4 * n]);
        self.asm
            .compile_static_const_to_register(Inst::Leaq, table, Reg::R11)
            .expect("jump tables are even-length");
        self.asm
            .compile_memory_index_to_register(Inst::Movsxdq, Reg::R11, Reg::R10, 2, 0, Reg::R10);
        self.asm
            .compile_register_to_register(Inst::Addq, Reg::R11, Reg::R10);
        self.asm.compile_jump_to_register(Reg::R10);
        self.asm.set_jump_table(table, entry_labels);

        for (shim, target) in shims {
            self.asm.bind(shim);
            self.emit_drop_keep(target.drop_keep);
            let label = self.labels[&target.dest].label;
            self.asm.compile_jump(label);
        }
    }

    pub(super) fn lower_return(&mut self) {
        let n = self.func_ty.results().len();
        self.spill_all();

        if n > 0 {
            let vals = self.alloc_gp();
            self.asm
                .compile_memory_to_register(Inst::Movq, Reg::Rbp, SAVE_VALS, vals);
            let tmp_gp = self.alloc_gp();
            let tmp_xmm = self.alloc_xmm();
            for i in 0..n {
                let index = self.stack.len() - n + i;
                let ty = self.stack[index].ty;
                let src = self.stack_disp(index);
                let dst = VMVAL_SIZE * i as i32;
                if matches!(ty, ValType::V128) {
                    self.asm
                        .compile_memory_to_register(Inst::Movdqu, Reg::Rbp, src, tmp_xmm);
                    self.asm
                        .compile_register_to_memory(Inst::Movdqu, tmp_xmm, vals, dst);
                } else {
                    self.asm
                        .compile_memory_to_register(Inst::Movq, Reg::Rbp, src, tmp_gp);
                    self.asm
                        .compile_register_to_memory(Inst::Movq, tmp_gp, vals, dst);
                }
            }
            self.free_reg(vals);
            self.free_reg(tmp_gp);
            self.free_reg(tmp_xmm);
        }

        self.asm
            .compile_register_to_register(Inst::Xorl, Reg::Rax, Reg::Rax);
        self.asm.compile_jump(self.exit_label);
    }

    /// Copies the top `count` stack slots into the scratch (argument) area.
    fn copy_args_to_scratch(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let tmp_gp = self.alloc_gp();
        let tmp_xmm = self.alloc_xmm();
        for i in 0..count {
            let index = self.stack.len() - count + i;
            let ty = self.stack[index].ty;
            let src = self.stack_disp(index);
            let dst = self.scratch_disp(i);
            if matches!(ty, ValType::V128) {
                self.asm
                    .compile_memory_to_register(Inst::Movdqu, Reg::Rbp, src, tmp_xmm);
                self.asm
                    .compile_register_to_memory(Inst::Movdqu, tmp_xmm, Reg::Rbp, dst);
            } else {
                self.asm
                    .compile_memory_to_register(Inst::Movq, Reg::Rbp, src, tmp_gp);
                self.asm
                    .compile_register_to_memory(Inst::Movq, tmp_gp, Reg::Rbp, dst);
            }
        }
        self.free_reg(tmp_gp);
        self.free_reg(tmp_xmm);
        self.stack.truncate(self.stack.len() - count);
    }

    /// Common tail of every wasm-to-wasm call: status propagation, memory
    /// base refresh, results back onto the abstract stack.
    fn finish_wasm_call(&mut self, results: &[ValType]) {
        self.asm
            .compile_register_to_register(Inst::Testl, Reg::Rax, Reg::Rax);
        self.asm.compile_jump_cond(Cond::Ne, self.exit_label);
        if self.has_memory {
            self.emit_reload_membase();
        }
        for (i, ty) in results.iter().enumerate() {
            let reg = if is_gp_type(*ty) {
                self.alloc_gp()
            } else {
                self.alloc_xmm()
            };
            let disp = self.scratch_disp(i);
            self.load_from_frame(*ty, disp, reg);
            self.push_reg(reg, *ty);
        }
    }

    pub(super) fn lower_call(&mut self, func: FuncIndex) {
        let callee_ty = self.module.func_type(func).clone();
        let np = callee_ty.params().len();
        let nr = callee_ty.results().len();

        self.spill_all();
        self.copy_args_to_scratch(np);

        let scratch0 = self.scratch_disp(0);
        let imported = self.module.is_imported_function(func);
        let asm = &mut self.asm;
        if imported {
            let slot = size_of::<VMFunctionImport>() as i32 * func.as_u32() as i32;
            asm.compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_IMPORTED_FUNCS, Reg::R11);
            asm.compile_memory_to_register(Inst::Movq, Reg::R11, slot, Reg::R11);
            asm.compile_memory_to_register(Inst::Movq, Reg::R11, FUNCREF_VMCTX, Reg::Rdi);
            asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rsi);
            asm.compile_memory_to_register(Inst::Leaq, Reg::Rbp, scratch0, Reg::Rdx);
            asm.compile_const_to_register(Inst::Movl, np.max(nr) as i64, Reg::Rcx);
            asm.compile_memory_to_register(Inst::Movq, Reg::R11, FUNCREF_ARRAY_CALL, Reg::Rax);
            asm.compile_call_register(Reg::Rax);
        } else {
            asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
            asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rsi);
            asm.compile_memory_to_register(Inst::Leaq, Reg::Rbp, scratch0, Reg::Rdx);
            asm.compile_const_to_register(Inst::Movl, np.max(nr) as i64, Reg::Rcx);
            asm.compile_call_func(func);
        }

        let results = callee_ty.results().to_vec();
        self.finish_wasm_call(&results);
    }

    pub(super) fn lower_call_indirect(&mut self, type_index: TypeIndex, table: TableIndex) {
        let callee_ty = self.module.types[type_index].clone();
        let np = callee_ty.params().len();
        let nr = callee_ty.results().len();
        let expected = self.shared_signatures[type_index].as_u32();

        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        // Pin the scratch registers this sequence lives in, so copying the
        // arguments below cannot allocate them out from under us.
        if idx != Reg::R9 {
            self.take_reg(Reg::R9);
            self.asm.compile_register_to_register(Inst::Movl, idx, Reg::R9);
            self.free_reg(idx);
        }
        self.take_reg(Reg::R10);
        self.take_reg(Reg::R11);

        // Table bounds, null entry, then signature.
        self.asm
            .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_TABLES, Reg::R11);
        self.asm.compile_memory_to_register(
            Inst::Movq,
            Reg::R11,
            8 * table.as_u32() as i32,
            Reg::R11,
        );
        self.asm
            .compile_memory_to_register(Inst::Cmpq, Reg::R11, TABLEDEF_LEN, Reg::R9);
        self.emit_trap_if(Cond::Ae, TrapKind::UndefinedElement);
        self.asm
            .compile_memory_to_register(Inst::Movq, Reg::R11, TABLEDEF_BASE, Reg::R11);
        self.asm
            .compile_memory_index_to_register(Inst::Movq, Reg::R11, Reg::R9, 3, 0, Reg::R11);
        self.asm
            .compile_register_to_register(Inst::Testq, Reg::R11, Reg::R11);
        self.emit_trap_if(Cond::E, TrapKind::UndefinedElement);
        self.asm
            .compile_memory_to_register(Inst::Movl, Reg::R11, FUNCREF_TYPE_INDEX, Reg::R10);
        self.asm
            .compile_const_to_register(Inst::Cmpl, i64::from(expected), Reg::R10);
        self.emit_trap_if(Cond::Ne, TrapKind::IndirectCallTypeMismatch);

        self.copy_args_to_scratch(np);

        let scratch0 = self.scratch_disp(0);
        let asm = &mut self.asm;
        asm.compile_memory_to_register(Inst::Movq, Reg::R11, FUNCREF_VMCTX, Reg::Rdi);
        asm.compile_register_to_register(Inst::Movq, VMCTX, Reg::Rsi);
        asm.compile_memory_to_register(Inst::Leaq, Reg::Rbp, scratch0, Reg::Rdx);
        asm.compile_const_to_register(Inst::Movl, np.max(nr) as i64, Reg::Rcx);
        asm.compile_memory_to_register(Inst::Movq, Reg::R11, FUNCREF_ARRAY_CALL, Reg::Rax);
        asm.compile_call_register(Reg::Rax);

        self.free_reg(Reg::R9);
        self.free_reg(Reg::R10);
        self.free_reg(Reg::R11);
        let results = callee_ty.results().to_vec();
        self.finish_wasm_call(&results);
    }

    // ===== globals =====

    fn global_cell(&mut self, index: GlobalIndex) -> (Reg, i32) {
        let tmp = self.alloc_gp();
        match self.module.defined_global_index(index) {
            Some(def) => {
                self.asm
                    .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_GLOBALS, tmp);
                (tmp, size_of::<VMGlobal>() as i32 * def.as_u32() as i32)
            }
            None => {
                self.asm
                    .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_IMPORTED_GLOBALS, tmp);
                self.asm.compile_memory_to_register(
                    Inst::Movq,
                    tmp,
                    8 * index.as_u32() as i32,
                    tmp,
                );
                (tmp, 0)
            }
        }
    }

    pub(super) fn lower_global_get(&mut self, index: GlobalIndex) {
        let ty = self.module.globals[index].content;
        let (cell, disp) = self.global_cell(index);
        let dst = if is_gp_type(ty) {
            self.alloc_gp()
        } else {
            self.alloc_xmm()
        };
        let inst = match ty {
            ValType::I32 => Inst::Movl,
            ValType::I64 | ValType::FuncRef => Inst::Movq,
            ValType::F32 => Inst::Movss,
            ValType::F64 => Inst::Movsd,
            ValType::V128 => Inst::Movdqu,
        };
        self.asm.compile_memory_to_register(inst, cell, disp, dst);
        self.free_reg(cell);
        self.push_reg(dst, ty);
    }

    pub(super) fn lower_global_set(&mut self, index: GlobalIndex) {
        let ty = self.module.globals[index].content;
        let (value, _) = self.pop_to_reg();
        let (cell, disp) = self.global_cell(index);
        let inst = match ty {
            ValType::I32 => Inst::Movl,
            ValType::I64 | ValType::FuncRef => Inst::Movq,
            ValType::F32 => Inst::Movss,
            ValType::F64 => Inst::Movsd,
            ValType::V128 => Inst::Movdqu,
        };
        self.asm.compile_register_to_memory(inst, value, cell, disp);
        self.free_reg(cell);
        self.free_reg(value);
    }

    // ===== linear memory =====

    /// Emits the bounds check for `[index + offset, index + offset + width)`
    /// against the current memory length. The index register stays live.
    fn emit_bounds_check(&mut self, idx: Reg, offset: u32, width: u32) {
        let end = self.alloc_gp();
        let sum = i64::from(offset) + i64::from(width);
        if let Ok(disp) = i32::try_from(sum) {
            self.asm.compile_memory_to_register(Inst::Leaq, idx, disp, end);
        } else {
            self.asm.compile_const_to_register(Inst::Movq, sum, end);
            self.asm.compile_register_to_register(Inst::Addq, idx, end);
        }
        let len = self.alloc_gp();
        self.asm
            .compile_memory_to_register(Inst::Movq, VMCTX, VMCTX_MEMORY_DEF, len);
        self.asm
            .compile_memory_to_register(Inst::Cmpq, len, MEMDEF_LEN, end);
        self.emit_trap_if(Cond::A, TrapKind::OutOfBounds);
        self.free_reg(end);
        self.free_reg(len);
    }

    pub(super) fn lower_load(&mut self, offset: u32, width: u32, inst: Inst, ty: ValType) {
        let (idx, _) = self.pop_to_reg();
        self.emit_bounds_check(idx, offset, width);

        let dst = if is_gp_type(ty) {
            self.alloc_gp()
        } else {
            self.alloc_xmm()
        };
        if let Ok(disp) = i32::try_from(offset) {
            self.asm
                .compile_memory_index_to_register(inst, MEMBASE, idx, 0, disp, dst);
            self.free_reg(idx);
        } else {
            let addr = self.alloc_gp();
            self.asm
                .compile_const_to_register(Inst::Movq, i64::from(offset), addr);
            self.asm.compile_register_to_register(Inst::Addq, idx, addr);
            self.free_reg(idx);
            self.asm
                .compile_memory_index_to_register(inst, MEMBASE, addr, 0, 0, dst);
            self.free_reg(addr);
        }
        self.push_reg(dst, ty);
    }

    pub(super) fn lower_store(&mut self, offset: u32, width: u32, inst: Inst) {
        let (value, _) = self.pop_to_reg();
        let (idx, _) = self.pop_to_reg();
        self.emit_bounds_check(idx, offset, width);

        if let Ok(disp) = i32::try_from(offset) {
            self.asm
                .compile_register_to_memory_index(inst, value, MEMBASE, idx, 0, disp);
            self.free_reg(idx);
        } else {
            let addr = self.alloc_gp();
            self.asm
                .compile_const_to_register(Inst::Movq, i64::from(offset), addr);
            self.asm.compile_register_to_register(Inst::Addq, idx, addr);
            self.free_reg(idx);
            self.asm
                .compile_register_to_memory_index(inst, value, MEMBASE, addr, 0, 0);
            self.free_reg(addr);
        }
        self.free_reg(value);
    }

    // ===== integer alu =====

    pub(super) fn lower_binop_gp(&mut self, inst: Inst) {
        let (rhs, _) = self.pop_to_reg();
        let (lhs, ty) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, rhs, lhs);
        self.free_reg(rhs);
        self.push_reg(lhs, ty);
    }

    pub(super) fn lower_unop_gp(&mut self, inst: Inst, ty: ValType) {
        let (reg, _) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, reg, reg);
        self.push_reg(reg, ty);
    }

    pub(super) fn lower_eqz(&mut self, test: Inst) {
        let (reg, _) = self.pop_to_reg();
        self.asm.compile_register_to_register(test, reg, reg);
        self.asm.compile_setcc(Cond::E, reg);
        self.asm.compile_register_to_register(Inst::Movzxbl, reg, reg);
        self.push_reg(reg, ValType::I32);
    }

    pub(super) fn lower_icmp(&mut self, cmp: Inst, cond: Cond) {
        let (rhs, _) = self.pop_to_reg();
        let (lhs, _) = self.pop_to_reg();
        self.asm.compile_register_to_register(cmp, rhs, lhs);
        self.asm.compile_setcc(cond, lhs);
        self.asm.compile_register_to_register(Inst::Movzxbl, lhs, lhs);
        self.free_reg(rhs);
        self.push_reg(lhs, ValType::I32);
    }

    pub(super) fn lower_shift(&mut self, inst: Inst) {
        let ty = match inst {
            Inst::Shll | Inst::Shrl | Inst::Sarl | Inst::Roll | Inst::Rorl => ValType::I32,
            _ => ValType::I64,
        };
        let (count, _) = self.pop_to_reg();
        if count != Reg::Rcx {
            self.take_reg(Reg::Rcx);
            self.asm
                .compile_register_to_register(Inst::Movq, count, Reg::Rcx);
            self.free_reg(count);
        }
        let (value, _) = self.pop_to_reg();
        debug_assert_ne!(value, Reg::Rcx);
        self.asm.compile_shift_cl(inst, value);
        self.free_reg(Reg::Rcx);
        self.push_reg(value, ty);
    }

    pub(super) fn lower_div(&mut self, is64: bool, signed: bool, want_quotient: bool) {
        let ty = if is64 { ValType::I64 } else { ValType::I32 };
        let (test, cmp, div_signed, div_unsigned) = if is64 {
            (Inst::Testq, Inst::Cmpq, Inst::Idivq, Inst::Divq)
        } else {
            (Inst::Testl, Inst::Cmpl, Inst::Idivl, Inst::Divl)
        };

        self.take_reg(Reg::Rax);
        self.take_reg(Reg::Rdx);
        let (rhs, _) = self.pop_to_reg();
        debug_assert!(rhs != Reg::Rax && rhs != Reg::Rdx);
        let (lhs, _) = self.pop_to_reg();
        if lhs != Reg::Rax {
            self.asm
                .compile_register_to_register(Inst::Movq, lhs, Reg::Rax);
            self.free_reg(lhs);
        }

        self.asm.compile_register_to_register(test, rhs, rhs);
        self.emit_trap_if(Cond::E, TrapKind::IntegerDivideByZero);

        let done = self.asm.new_label();
        if signed {
            let no_special = self.asm.new_label();
            self.asm.compile_const_to_register(cmp, -1, rhs);
            self.asm.compile_jump_cond(Cond::Ne, no_special);
            if want_quotient {
                // INT_MIN / -1 overflows.
                if is64 {
                    let min = self.alloc_gp();
                    self.asm
                        .compile_const_to_register(Inst::Movq, i64::MIN, min);
                    self.asm
                        .compile_register_to_register(Inst::Cmpq, min, Reg::Rax);
                    self.free_reg(min);
                } else {
                    self.asm
                        .compile_const_to_register(Inst::Cmpl, i64::from(i32::MIN), Reg::Rax);
                }
                self.emit_trap_if(Cond::E, TrapKind::IntegerOverflow);
            } else {
                // x rem -1 is 0, and must not raise the idiv overflow fault.
                self.asm
                    .compile_register_to_register(Inst::Xorl, Reg::Rdx, Reg::Rdx);
                self.asm.compile_jump(done);
            }
            self.asm.bind(no_special);
            self.asm
                .compile_standalone(if is64 { Inst::Cqo } else { Inst::Cdq });
            self.asm.compile_one_operand(div_signed, rhs);
        } else {
            self.asm
                .compile_register_to_register(Inst::Xorl, Reg::Rdx, Reg::Rdx);
            self.asm.compile_one_operand(div_unsigned, rhs);
        }
        self.asm.bind(done);

        self.free_reg(rhs);
        if want_quotient {
            self.free_reg(Reg::Rdx);
            self.push_reg(Reg::Rax, ty);
        } else {
            self.free_reg(Reg::Rax);
            self.push_reg(Reg::Rdx, ty);
        }
    }

    // ===== floating point =====

    pub(super) fn lower_binop_sse(&mut self, inst: Inst) {
        let (rhs, _) = self.pop_to_reg();
        let (lhs, ty) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, rhs, lhs);
        self.free_reg(rhs);
        self.push_reg(lhs, ty);
    }

    pub(super) fn lower_binop_sse_v(&mut self, inst: Inst) {
        let (rhs, _) = self.pop_to_reg();
        let (lhs, _) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, rhs, lhs);
        self.free_reg(rhs);
        self.push_reg(lhs, ValType::V128);
    }

    pub(super) fn lower_unop_sse(&mut self, inst: Inst) {
        let (reg, ty) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, reg, reg);
        self.push_reg(reg, ty);
    }

    pub(super) fn lower_unop_sse_as(&mut self, inst: Inst, ty: ValType) {
        let (reg, _) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, reg, reg);
        self.push_reg(reg, ty);
    }

    pub(super) fn lower_float_mask(&mut self, inst: Inst, mask: u128) {
        let (reg, ty) = self.pop_to_reg();
        let c = self.mask_const(mask);
        self.asm
            .compile_static_const_to_register(inst, c, reg)
            .expect("mask constants are even-length");
        self.push_reg(reg, ty);
    }

    pub(super) fn lower_float_builtin1(&mut self, field_offset: usize, ty: ValType) {
        self.spill_all();
        self.stack.pop().expect("value stack underflow");
        let disp = self.stack_disp(self.stack.len());
        self.load_from_frame(ty, disp, Reg::Xmm0);
        self.emit_call_builtin(field_offset);
        self.take_reg(Reg::Xmm0);
        self.push_reg(Reg::Xmm0, ty);
    }

    pub(super) fn lower_float_builtin2(&mut self, field_offset: usize, ty: ValType) {
        self.spill_all();
        self.stack.pop().expect("value stack underflow");
        let rhs_disp = self.stack_disp(self.stack.len());
        self.stack.pop().expect("value stack underflow");
        let lhs_disp = self.stack_disp(self.stack.len());
        self.load_from_frame(ty, lhs_disp, Reg::Xmm0);
        self.load_from_frame(ty, rhs_disp, Reg::Xmm1);
        self.emit_call_builtin(field_offset);
        self.take_reg(Reg::Xmm0);
        self.push_reg(Reg::Xmm0, ty);
    }

    pub(super) fn lower_fcmp(&mut self, ucomis: Inst, cmp: FloatCmp) {
        let (rhs, _) = self.pop_to_reg();
        let (lhs, _) = self.pop_to_reg();
        let result = self.alloc_gp();

        match cmp {
            FloatCmp::Eq | FloatCmp::Ne => {
                let parity = self.alloc_gp();
                self.asm.compile_register_to_register(ucomis, rhs, lhs);
                if matches!(cmp, FloatCmp::Eq) {
                    // Equal and ordered.
                    self.asm.compile_setcc(Cond::E, result);
                    self.asm.compile_setcc(Cond::Np, parity);
                    self.asm
                        .compile_register_to_register(Inst::Movzxbl, result, result);
                    self.asm
                        .compile_register_to_register(Inst::Movzxbl, parity, parity);
                    self.asm
                        .compile_register_to_register(Inst::Andl, parity, result);
                } else {
                    // Unequal or unordered.
                    self.asm.compile_setcc(Cond::Ne, result);
                    self.asm.compile_setcc(Cond::P, parity);
                    self.asm
                        .compile_register_to_register(Inst::Movzxbl, result, result);
                    self.asm
                        .compile_register_to_register(Inst::Movzxbl, parity, parity);
                    self.asm
                        .compile_register_to_register(Inst::Orl, parity, result);
                }
                self.free_reg(parity);
            }
            FloatCmp::Lt => {
                // a < b via b cmp a, so NaN falls out through the carry flag.
                self.asm.compile_register_to_register(ucomis, lhs, rhs);
                self.asm.compile_setcc(Cond::A, result);
                self.asm
                    .compile_register_to_register(Inst::Movzxbl, result, result);
            }
            FloatCmp::Le => {
                self.asm.compile_register_to_register(ucomis, lhs, rhs);
                self.asm.compile_setcc(Cond::Ae, result);
                self.asm
                    .compile_register_to_register(Inst::Movzxbl, result, result);
            }
            FloatCmp::Gt => {
                self.asm.compile_register_to_register(ucomis, rhs, lhs);
                self.asm.compile_setcc(Cond::A, result);
                self.asm
                    .compile_register_to_register(Inst::Movzxbl, result, result);
            }
            FloatCmp::Ge => {
                self.asm.compile_register_to_register(ucomis, rhs, lhs);
                self.asm.compile_setcc(Cond::Ae, result);
                self.asm
                    .compile_register_to_register(Inst::Movzxbl, result, result);
            }
        }

        self.free_reg(rhs);
        self.free_reg(lhs);
        self.push_reg(result, ValType::I32);
    }

    // ===== conversions =====

    pub(super) fn lower_extend(&mut self, inst: Inst, ty: ValType) {
        let (reg, _) = self.pop_to_reg();
        self.asm.compile_register_to_register(inst, reg, reg);
        self.push_reg(reg, ty);
    }

    pub(super) fn lower_int_to_float(&mut self, inst: Inst, ty: ValType) {
        let (src, _) = self.pop_to_reg();
        let dst = self.alloc_xmm();
        self.asm.compile_register_to_register(inst, src, dst);
        self.free_reg(src);
        self.push_reg(dst, ty);
    }

    pub(super) fn lower_u64_to_float(&mut self, field_offset: usize, ty: ValType) {
        self.spill_all();
        self.stack.pop().expect("value stack underflow");
        let disp = self.stack_disp(self.stack.len());
        self.asm
            .compile_memory_to_register(Inst::Movq, Reg::Rbp, disp, Reg::Rdi);
        self.emit_call_builtin(field_offset);
        self.take_reg(Reg::Xmm0);
        self.push_reg(Reg::Xmm0, ty);
    }

    pub(super) fn lower_bitcast(&mut self, to_xmm: bool, ty: ValType) {
        let (src, _) = self.pop_to_reg();
        let mov = match ty {
            ValType::I32 | ValType::F32 => Inst::Movl,
            _ => Inst::Movq,
        };
        let dst = if to_xmm { self.alloc_xmm() } else { self.alloc_gp() };
        self.asm.compile_register_to_register(mov, src, dst);
        self.free_reg(src);
        self.push_reg(dst, ty);
    }

    pub(super) fn lower_trunc(
        &mut self,
        field_offset: usize,
        f32_src: bool,
        is_64: bool,
        trapping: bool,
    ) {
        self.spill_all();
        self.stack.pop().expect("value stack underflow");
        let disp = self.stack_disp(self.stack.len());
        let load = if f32_src { Inst::Movss } else { Inst::Movsd };
        self.asm
            .compile_memory_to_register(load, Reg::Rbp, disp, Reg::Xmm0);
        if trapping {
            self.asm
                .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        }
        self.emit_call_builtin(field_offset);
        if trapping {
            self.emit_builtin_trap_check();
        }
        self.take_reg(Reg::Rax);
        if !is_64 {
            self.asm
                .compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
        }
        self.push_reg(Reg::Rax, if is_64 { ValType::I64 } else { ValType::I32 });
    }

    // ===== builtin call plumbing =====

    /// Resolves a parallel register shuffle, routing cycles through a
    /// scratch register that participates in neither side.
    fn emit_parallel_move(&mut self, mut pairs: Vec<(Reg, Reg)>) {
        pairs.retain(|(src, dst)| src != dst);
        while !pairs.is_empty() {
            if let Some(i) = (0..pairs.len()).find(|&i| {
                let dst = pairs[i].1;
                pairs.iter().enumerate().all(|(j, p)| j == i || p.0 != dst)
            }) {
                let (src, dst) = pairs.remove(i);
                self.asm.compile_register_to_register(Inst::Movq, src, dst);
            } else {
                let scratch = *GP_POOL
                    .iter()
                    .find(|r| pairs.iter().all(|(s, d)| s != *r && d != *r))
                    .expect("no scratch register for parallel move");
                let (src, dst) = pairs[0];
                self.asm
                    .compile_register_to_register(Inst::Movq, src, scratch);
                pairs[0] = (scratch, dst);
            }
        }
    }

    pub(super) fn emit_shuffle2(&mut self, a: (Reg, Reg), b: (Reg, Reg)) {
        self.emit_parallel_move(vec![a, b]);
        self.free_reg(a.0);
        self.free_reg(b.0);
    }

    pub(super) fn emit_shuffle3(&mut self, a: (Reg, Reg), b: (Reg, Reg), c: (Reg, Reg)) {
        self.emit_parallel_move(vec![a, b, c]);
        self.free_reg(a.0);
        self.free_reg(b.0);
        self.free_reg(c.0);
    }

    /// `(vmctx, a, b, c)` builtins over three popped operands.
    pub(super) fn lower_builtin_3(&mut self, field_offset: usize) {
        let (c, _) = self.pop_to_reg();
        let (b, _) = self.pop_to_reg();
        let (a, _) = self.pop_to_reg();
        self.spill_all();
        self.emit_shuffle3((a, Reg::Rsi), (b, Reg::Rdx), (c, Reg::Rcx));
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.emit_call_builtin(field_offset);
        self.emit_builtin_trap_check();
    }

    /// `(vmctx, seg, dst, src, len)` builtins (`memory.init`).
    pub(super) fn lower_seg_builtin(&mut self, field_offset: usize, seg: u32) {
        let (len, _) = self.pop_to_reg();
        let (src, _) = self.pop_to_reg();
        let (dst, _) = self.pop_to_reg();
        self.spill_all();
        self.emit_shuffle3((dst, Reg::Rdx), (src, Reg::Rcx), (len, Reg::R8));
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.asm
            .compile_const_to_register(Inst::Movl, i64::from(seg), Reg::Rsi);
        self.emit_call_builtin(field_offset);
        self.emit_builtin_trap_check();
    }

    // ===== atomics =====

    /// Computes `index + offset` in place, returning the register now
    /// holding the 64-bit effective address.
    fn emit_addr(&mut self, idx: Reg, offset: u32) -> Reg {
        if let Ok(disp) = i32::try_from(offset) {
            if disp != 0 {
                self.asm
                    .compile_memory_to_register(Inst::Leaq, idx, disp, idx);
            }
            idx
        } else {
            let addr = self.alloc_gp();
            self.asm
                .compile_const_to_register(Inst::Movq, i64::from(offset), addr);
            self.asm.compile_register_to_register(Inst::Addq, idx, addr);
            self.free_reg(idx);
            addr
        }
    }

    pub(super) fn lower_atomic_load(&mut self, ty: AtomicTy, offset: u32) {
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        let addr = self.emit_addr(idx, offset);
        self.emit_parallel_move(vec![(addr, Reg::Rdx)]);
        self.free_reg(addr);
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.asm
            .compile_const_to_register(Inst::Movl, i64::from(ty.code()), Reg::Rsi);
        self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, atomic_load));
        self.emit_builtin_trap_check();
        self.take_reg(Reg::Rax);
        if !ty.is_64() {
            self.asm
                .compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
        }
        self.push_reg(Reg::Rax, if ty.is_64() { ValType::I64 } else { ValType::I32 });
    }

    pub(super) fn lower_atomic_store(&mut self, ty: AtomicTy, offset: u32) {
        let (value, _) = self.pop_to_reg();
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        let addr = self.emit_addr(idx, offset);
        self.emit_parallel_move(vec![(addr, Reg::Rdx), (value, Reg::Rcx)]);
        self.free_reg(addr);
        self.free_reg(value);
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.asm
            .compile_const_to_register(Inst::Movl, i64::from(ty.code()), Reg::Rsi);
        self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, atomic_store));
        self.emit_builtin_trap_check();
    }

    pub(super) fn lower_atomic_rmw(&mut self, op: AtomicOp, ty: AtomicTy, offset: u32) {
        let (operand, _) = self.pop_to_reg();
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        let addr = self.emit_addr(idx, offset);
        self.emit_parallel_move(vec![(addr, Reg::Rcx), (operand, Reg::R8)]);
        self.free_reg(addr);
        self.free_reg(operand);
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.asm
            .compile_const_to_register(Inst::Movl, i64::from(op.code()), Reg::Rsi);
        self.asm
            .compile_const_to_register(Inst::Movl, i64::from(ty.code()), Reg::Rdx);
        self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, atomic_rmw));
        self.emit_builtin_trap_check();
        self.take_reg(Reg::Rax);
        if !ty.is_64() {
            self.asm
                .compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
        }
        self.push_reg(Reg::Rax, if ty.is_64() { ValType::I64 } else { ValType::I32 });
    }

    pub(super) fn lower_atomic_cmpxchg(&mut self, ty: AtomicTy, offset: u32) {
        let (replacement, _) = self.pop_to_reg();
        let (expected, _) = self.pop_to_reg();
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        let addr = self.emit_addr(idx, offset);
        self.emit_parallel_move(vec![
            (addr, Reg::Rdx),
            (expected, Reg::Rcx),
            (replacement, Reg::R8),
        ]);
        self.free_reg(addr);
        self.free_reg(expected);
        self.free_reg(replacement);
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.asm
            .compile_const_to_register(Inst::Movl, i64::from(ty.code()), Reg::Rsi);
        self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, atomic_cmpxchg));
        self.emit_builtin_trap_check();
        self.take_reg(Reg::Rax);
        if !ty.is_64() {
            self.asm
                .compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
        }
        self.push_reg(Reg::Rax, if ty.is_64() { ValType::I64 } else { ValType::I32 });
    }

    pub(super) fn lower_atomic_notify(&mut self, offset: u32) {
        let (count, _) = self.pop_to_reg();
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        let addr = self.emit_addr(idx, offset);
        self.emit_parallel_move(vec![(addr, Reg::Rsi), (count, Reg::Rdx)]);
        self.free_reg(addr);
        self.free_reg(count);
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        self.emit_call_builtin(offset_of!(VMBuiltinFunctionsArray, atomic_notify));
        self.emit_builtin_trap_check();
        self.take_reg(Reg::Rax);
        self.asm
            .compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
        self.push_reg(Reg::Rax, ValType::I32);
    }

    pub(super) fn lower_atomic_wait(&mut self, offset: u32, is_64: bool) {
        let (timeout, _) = self.pop_to_reg();
        let (expected, _) = self.pop_to_reg();
        let (idx, _) = self.pop_to_reg();
        self.spill_all();
        let addr = self.emit_addr(idx, offset);
        self.emit_parallel_move(vec![
            (addr, Reg::Rsi),
            (expected, Reg::Rdx),
            (timeout, Reg::Rcx),
        ]);
        self.free_reg(addr);
        self.free_reg(expected);
        self.free_reg(timeout);
        self.asm
            .compile_register_to_register(Inst::Movq, VMCTX, Reg::Rdi);
        let field = if is_64 {
            offset_of!(VMBuiltinFunctionsArray, atomic_wait64)
        } else {
            offset_of!(VMBuiltinFunctionsArray, atomic_wait32)
        };
        self.emit_call_builtin(field);
        self.emit_builtin_trap_check();
        self.take_reg(Reg::Rax);
        self.asm
            .compile_register_to_register(Inst::Movl, Reg::Rax, Reg::Rax);
        self.push_reg(Reg::Rax, ValType::I32);
    }
}
