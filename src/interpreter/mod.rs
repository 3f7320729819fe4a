// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The interpreter engine.
//!
//! A tight dispatch loop over the same flat IR the compiler lowers. Trap
//! kinds, NaN bit patterns and memory observation order are identical to the
//! compiled code by construction: the operations with interesting semantics
//! (float min/max/rounding, trapping conversions, atomics, bulk memory) run
//! through the very same functions in [`crate::vm::builtins`].

use crate::indices::{DataIndex, DefinedFuncIndex, FuncIndex};
use crate::module::CachedModule;
use crate::store::StoreOpaque;
use crate::translate::{FunctionIr, Op, Target};
use crate::trap::TrapKind;
use crate::vm::{
    self, atomic_cmpxchg_raw, atomic_load_raw, atomic_rmw_raw, atomic_store_raw, fops,
    memory_access, status_from_trap, table_init_impl, VMFuncRef, VMMemoryDefinition, VMVal,
    STATUS_OK,
};
use crate::MAX_CALL_DEPTH;
use smallvec::SmallVec;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Runs one interpreted function under the array-call contract: `vals`
/// carries the parameters in and the results out, the return value is the
/// status word.
///
/// # Safety
///
/// `store` must point at the live store owning `instance_id`, and `vals`
/// must have room for `max(params, results)` slots.
pub unsafe fn invoke(
    store: *mut StoreOpaque,
    instance_id: usize,
    def_index: DefinedFuncIndex,
    vals: *mut VMVal,
    nvals: usize,
) -> u32 {
    // Safety: per contract.
    let store_ref = unsafe { &mut *store };
    if store_ref.cancel.is_cancelled() {
        return status_from_trap(TrapKind::Cancelled);
    }
    store_ref.call_depth += 1;
    if store_ref.call_depth > MAX_CALL_DEPTH {
        store_ref.call_depth -= 1;
        return status_from_trap(TrapKind::StackExhausted);
    }

    let module = Arc::clone(&store_ref.instance(instance_id).module);
    let ir = module.function_ir(def_index);
    let func_index = module.translated.func_index(def_index);
    let func_ty = module.translated.func_type(func_index);
    let num_params = func_ty.params().len();
    let num_results = func_ty.results().len();
    debug_assert!(nvals >= num_params.max(num_results));

    let mut frame = Frame {
        store,
        instance_id,
        module: &module,
        locals: vec![VMVal::ZERO; num_params + ir.locals.len()],
        stack: Vec::with_capacity(ir.max_stack_height as usize),
    };
    for i in 0..num_params {
        // Safety: in bounds per nvals contract.
        frame.locals[i] = unsafe { *vals.add(i) };
    }

    let status = match frame.exec(ir) {
        Ok(()) => {
            let results = &frame.stack[frame.stack.len() - num_results..];
            for (i, v) in results.iter().enumerate() {
                // Safety: in bounds per nvals contract.
                unsafe { *vals.add(i) = *v };
            }
            STATUS_OK
        }
        Err(Unwind::Trap(kind)) => status_from_trap(kind),
        Err(Unwind::Status(status)) => status,
    };

    // Safety: still live; re-borrow after the guest ran.
    unsafe { (*store).call_depth -= 1 };
    status
}

/// Why the dispatch loop stopped early: a trap raised here, or a status word
/// propagated from a callee.
enum Unwind {
    Trap(TrapKind),
    Status(u32),
}

impl From<TrapKind> for Unwind {
    fn from(kind: TrapKind) -> Self {
        Unwind::Trap(kind)
    }
}

type Control = Result<(), Unwind>;

struct Frame<'a> {
    store: *mut StoreOpaque,
    instance_id: usize,
    module: &'a Arc<CachedModule>,
    locals: Vec<VMVal>,
    stack: Vec<VMVal>,
}

impl<'a> Frame<'a> {
    fn store(&mut self) -> &mut StoreOpaque {
        // Safety: the store outlives every frame it spawned.
        unsafe { &mut *self.store }
    }

    fn memory_def(&mut self) -> Result<&'a VMMemoryDefinition, Unwind> {
        let instance_id = self.instance_id;
        let store = self.store();
        match store.instance(instance_id).memory0_id() {
            // Safety: memory definitions are pinned for the store's life.
            Some(id) => Ok(unsafe { &*store.memory(id).def_ptr() }),
            None => Err(TrapKind::OutOfBounds.into()),
        }
    }

    // ===== stack helpers, raw bits =====

    #[inline]
    fn push(&mut self, v: VMVal) {
        self.stack.push(v);
    }

    #[inline]
    fn pop(&mut self) -> VMVal {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    fn push_i32(&mut self, v: i32) {
        self.push(VMVal::i32(v));
    }

    #[inline]
    fn push_u32(&mut self, v: u32) {
        self.push(VMVal::i32(v as i32));
    }

    #[inline]
    fn push_i64(&mut self, v: i64) {
        self.push(VMVal::i64(v));
    }

    #[inline]
    fn push_bool(&mut self, v: bool) {
        self.push_i32(i32::from(v));
    }

    #[inline]
    fn push_f32(&mut self, v: f32) {
        self.push(VMVal::f32(v.to_bits()));
    }

    #[inline]
    fn push_f64(&mut self, v: f64) {
        self.push(VMVal::f64(v.to_bits()));
    }

    #[inline]
    fn pop_i32(&mut self) -> i32 {
        self.pop().get_i32()
    }

    #[inline]
    fn pop_u32(&mut self) -> u32 {
        self.pop().get_i32() as u32
    }

    #[inline]
    fn pop_i64(&mut self) -> i64 {
        self.pop().get_i64()
    }

    #[inline]
    fn pop_u64(&mut self) -> u64 {
        self.pop().get_u64()
    }

    #[inline]
    fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop().get_f32())
    }

    #[inline]
    fn pop_f64(&mut self) -> f64 {
        f64::from_bits(self.pop().get_f64())
    }

    fn branch(&mut self, target: &Target, pc: &mut usize) {
        let drop = target.drop_keep.drop as usize;
        let keep = target.drop_keep.keep as usize;
        if drop > 0 {
            let len = self.stack.len();
            for i in 0..keep {
                self.stack[len - keep - drop + i] = self.stack[len - keep + i];
            }
            self.stack.truncate(len - drop);
        }
        *pc = target.dest as usize;
    }

    /// Effective address of a memory access.
    #[inline]
    fn addr(&mut self, offset: u32) -> u64 {
        u64::from(self.pop_u32()) + u64::from(offset)
    }

    fn load<const N: usize>(&mut self, offset: u32) -> Result<[u8; N], Unwind> {
        let addr = self.addr(offset);
        let def = self.memory_def()?;
        // Safety: bounds-checked by memory_access.
        unsafe {
            let ptr = memory_access(def, addr, N as u64)?;
            let mut out = [0u8; N];
            core::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), N);
            Ok(out)
        }
    }

    fn store_bytes(&mut self, offset: u32, bytes: &[u8]) -> Control {
        let addr = self.addr(offset);
        let def = self.memory_def()?;
        // Safety: bounds-checked by memory_access.
        unsafe {
            let ptr = memory_access(def, addr, bytes.len() as u64)?;
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(())
    }

    /// Calls through a funcref, marshalling arguments from the value stack.
    fn call_func_ref(
        &mut self,
        func_ref: *mut VMFuncRef,
        num_params: usize,
        num_results: usize,
    ) -> Control {
        let mut vals: SmallVec<[VMVal; 8]> =
            SmallVec::from_elem(VMVal::ZERO, num_params.max(num_results).max(1));
        let args_start = self.stack.len() - num_params;
        vals[..num_params].copy_from_slice(&self.stack[args_start..]);
        self.stack.truncate(args_start);

        let instance_id = self.instance_id;
        let caller_vmctx = self.store().instance(instance_id).vmctx_ptr();
        // Safety: the funcref was resolved against live store state.
        let status = unsafe {
            crate::func::invoke_func_ref(
                self.store,
                func_ref,
                caller_vmctx,
                vals.as_mut_ptr(),
                vals.len(),
            )
        };
        if status != STATUS_OK {
            return Err(Unwind::Status(status));
        }
        self.stack.extend_from_slice(&vals[..num_results]);
        Ok(())
    }

    // ===== the dispatch loop =====

    #[allow(clippy::too_many_lines)]
    fn exec(&mut self, ir: &FunctionIr) -> Control {
        let ops = &ir.ops;
        let mut pc = 0usize;

        loop {
            debug_assert!(pc < ops.len(), "fell off the operation stream");
            let op = &ops[pc];
            pc += 1;

            match op {
                // ===== control =====
                Op::Unreachable => return Err(TrapKind::Unreachable.into()),
                Op::CancelPoll => {
                    if self.store().cancel.is_cancelled() {
                        return Err(TrapKind::Cancelled.into());
                    }
                }
                Op::Br(target) => self.branch(target, &mut pc),
                Op::BrIfNez(target) => {
                    if self.pop_i32() != 0 {
                        self.branch(target, &mut pc);
                    }
                }
                Op::BrIfEqz(target) => {
                    if self.pop_i32() == 0 {
                        self.branch(target, &mut pc);
                    }
                }
                Op::BrTable(targets) => {
                    let index = self.pop_u32() as usize;
                    let n = targets.len() - 1;
                    let target = targets[index.min(n)];
                    self.branch(&target, &mut pc);
                }
                Op::Return => return Ok(()),
                Op::Call(func) => self.call_direct(*func)?,
                Op::CallIndirect { type_index, table } => {
                    let ty = &self.module.translated.types[*type_index];
                    let (np, nr) = (ty.params().len(), ty.results().len());
                    let expected = self.module.shared_signatures[*type_index].as_u32();
                    let index = u64::from(self.pop_u32());

                    let instance_id = self.instance_id;
                    let table_id = self.store().instance(instance_id).table_id(*table);
                    let element = self
                        .store()
                        .table(table_id)
                        .get(index)
                        .ok_or(TrapKind::UndefinedElement)?;
                    if element.is_null() {
                        return Err(TrapKind::UndefinedElement.into());
                    }
                    // Safety: non-null table elements are live funcrefs.
                    if unsafe { (*element).type_index } != expected {
                        return Err(TrapKind::IndirectCallTypeMismatch.into());
                    }
                    self.call_func_ref(element, np, nr)?;
                }

                // ===== parametric =====
                Op::Drop => {
                    self.pop();
                }
                Op::Select => {
                    let cond = self.pop_i32();
                    let v2 = self.pop();
                    let v1 = self.pop();
                    self.push(if cond != 0 { v1 } else { v2 });
                }

                // ===== locals & globals =====
                Op::LocalGet(index) => self.push(self.locals[*index as usize]),
                Op::LocalSet(index) => {
                    let v = self.pop();
                    self.locals[*index as usize] = v;
                }
                Op::LocalTee(index) => {
                    let v = *self.stack.last().expect("value stack underflow");
                    self.locals[*index as usize] = v;
                }
                Op::GlobalGet(index) => {
                    let instance_id = self.instance_id;
                    let cell = self.store().instance(instance_id).global_ptr(*index);
                    // Safety: global cells are pinned for the store's life.
                    self.push(unsafe { (*cell).to_vmval() });
                }
                Op::GlobalSet(index) => {
                    let v = self.pop();
                    let instance_id = self.instance_id;
                    let cell = self.store().instance(instance_id).global_ptr(*index);
                    // Safety: as above.
                    unsafe { *cell = vm::VMGlobal::from_vmval(v) };
                }

                // ===== constants =====
                Op::I32Const(v) => self.push_i32(*v),
                Op::I64Const(v) => self.push_i64(*v),
                Op::F32Const(bits) => self.push(VMVal::f32(*bits)),
                Op::F64Const(bits) => self.push(VMVal::f64(*bits)),
                Op::V128Const(v) => self.push(VMVal::v128(*v)),

                // ===== references =====
                Op::RefNull => self.push(VMVal::funcref(std::ptr::null_mut())),
                Op::RefIsNull => {
                    let v = self.pop_u64();
                    self.push_bool(v == 0);
                }
                Op::RefFunc(index) => {
                    let instance_id = self.instance_id;
                    let ptr = self.store().instance(instance_id).func_ref_ptr(*index);
                    self.push(VMVal::funcref(ptr));
                }

                // ===== memory =====
                Op::I32Load(o) => {
                    let b = self.load::<4>(*o)?;
                    self.push_i32(i32::from_le_bytes(b));
                }
                Op::I64Load(o) => {
                    let b = self.load::<8>(*o)?;
                    self.push_i64(i64::from_le_bytes(b));
                }
                Op::F32Load(o) => {
                    let b = self.load::<4>(*o)?;
                    self.push(VMVal::f32(u32::from_le_bytes(b)));
                }
                Op::F64Load(o) => {
                    let b = self.load::<8>(*o)?;
                    self.push(VMVal::f64(u64::from_le_bytes(b)));
                }
                Op::I32Load8S(o) => {
                    let b = self.load::<1>(*o)?;
                    self.push_i32(i32::from(b[0] as i8));
                }
                Op::I32Load8U(o) => {
                    let b = self.load::<1>(*o)?;
                    self.push_u32(u32::from(b[0]));
                }
                Op::I32Load16S(o) => {
                    let b = self.load::<2>(*o)?;
                    self.push_i32(i32::from(i16::from_le_bytes(b)));
                }
                Op::I32Load16U(o) => {
                    let b = self.load::<2>(*o)?;
                    self.push_u32(u32::from(u16::from_le_bytes(b)));
                }
                Op::I64Load8S(o) => {
                    let b = self.load::<1>(*o)?;
                    self.push_i64(i64::from(b[0] as i8));
                }
                Op::I64Load8U(o) => {
                    let b = self.load::<1>(*o)?;
                    self.push_i64(i64::from(b[0]));
                }
                Op::I64Load16S(o) => {
                    let b = self.load::<2>(*o)?;
                    self.push_i64(i64::from(i16::from_le_bytes(b)));
                }
                Op::I64Load16U(o) => {
                    let b = self.load::<2>(*o)?;
                    self.push_i64(i64::from(u16::from_le_bytes(b)));
                }
                Op::I64Load32S(o) => {
                    let b = self.load::<4>(*o)?;
                    self.push_i64(i64::from(i32::from_le_bytes(b)));
                }
                Op::I64Load32U(o) => {
                    let b = self.load::<4>(*o)?;
                    self.push_i64(i64::from(u32::from_le_bytes(b)));
                }
                Op::V128Load(o) => {
                    let b = self.load::<16>(*o)?;
                    self.push(VMVal::v128(u128::from_le_bytes(b)));
                }
                Op::I32Store(o) => {
                    let v = self.pop_i32();
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::I64Store(o) => {
                    let v = self.pop_i64();
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::F32Store(o) => {
                    let v = self.pop().get_f32();
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::F64Store(o) => {
                    let v = self.pop().get_f64();
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::I32Store8(o) => {
                    let v = self.pop_i32() as u8;
                    self.store_bytes(*o, &[v])?;
                }
                Op::I32Store16(o) => {
                    let v = self.pop_i32() as u16;
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::I64Store8(o) => {
                    let v = self.pop_i64() as u8;
                    self.store_bytes(*o, &[v])?;
                }
                Op::I64Store16(o) => {
                    let v = self.pop_i64() as u16;
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::I64Store32(o) => {
                    let v = self.pop_i64() as u32;
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::V128Store(o) => {
                    let v = self.pop().get_v128();
                    self.store_bytes(*o, &v.to_le_bytes())?;
                }
                Op::MemorySize => {
                    let def = self.memory_def()?;
                    let pages = def.current_length.load(Ordering::Acquire) as u64
                        / crate::WASM_PAGE_SIZE;
                    self.push_u32(u32::try_from(pages).unwrap());
                }
                Op::MemoryGrow => {
                    let delta = u64::from(self.pop_u32());
                    let instance_id = self.instance_id;
                    let store = self.store();
                    let result = match store.instance(instance_id).memory0_id() {
                        Some(id) => match store.memory_mut(id).grow(delta) {
                            Ok(Some(prev)) => prev as i64 as i32,
                            Ok(None) | Err(_) => -1,
                        },
                        None => -1,
                    };
                    self.push_i32(result);
                }
                Op::MemoryFill => {
                    let len = u64::from(self.pop_u32());
                    let val = self.pop_u32();
                    let dst = u64::from(self.pop_u32());
                    let def = self.memory_def()?;
                    // Safety: bounds-checked by memory_access.
                    unsafe {
                        let ptr = memory_access(def, dst, len)?;
                        core::ptr::write_bytes(ptr, val as u8, len as usize);
                    }
                }
                Op::MemoryCopy => {
                    let len = u64::from(self.pop_u32());
                    let src = u64::from(self.pop_u32());
                    let dst = u64::from(self.pop_u32());
                    let def = self.memory_def()?;
                    // Safety: both ranges bounds-checked; copy handles
                    // overlap.
                    unsafe {
                        let dst_ptr = memory_access(def, dst, len)?;
                        let src_ptr = memory_access(def, src, len)?;
                        core::ptr::copy(src_ptr, dst_ptr, len as usize);
                    }
                }
                Op::MemoryInit(seg) => self.memory_init(*seg)?,
                Op::DataDrop(seg) => {
                    let instance_id = self.instance_id;
                    self.store()
                        .instance_mut(instance_id)
                        .dropped_data
                        .insert(*seg);
                }

                // ===== tables =====
                Op::TableGet(table) => {
                    let index = u64::from(self.pop_u32());
                    let instance_id = self.instance_id;
                    let table_id = self.store().instance(instance_id).table_id(*table);
                    let element = self
                        .store()
                        .table(table_id)
                        .get(index)
                        .ok_or(TrapKind::OutOfBounds)?;
                    self.push(VMVal::funcref(element));
                }
                Op::TableSet(table) => {
                    let value = self.pop().get_funcref();
                    let index = u64::from(self.pop_u32());
                    let instance_id = self.instance_id;
                    let table_id = self.store().instance(instance_id).table_id(*table);
                    if !self.store().table_mut(table_id).set(index, value) {
                        return Err(TrapKind::OutOfBounds.into());
                    }
                }
                Op::TableSize(table) => {
                    let instance_id = self.instance_id;
                    let table_id = self.store().instance(instance_id).table_id(*table);
                    let size = self.store().table(table_id).size();
                    self.push_u32(u32::try_from(size).unwrap());
                }
                Op::TableGrow(table) => {
                    let delta = u64::from(self.pop_u32());
                    let init = self.pop().get_funcref();
                    let instance_id = self.instance_id;
                    let table_id = self.store().instance(instance_id).table_id(*table);
                    let result = match self.store().table_mut(table_id).grow(delta, init) {
                        Some(prev) => prev as i64 as i32,
                        None => -1,
                    };
                    self.push_i32(result);
                }
                Op::TableFill(table) => {
                    let len = u64::from(self.pop_u32());
                    let value = self.pop().get_funcref();
                    let dst = u64::from(self.pop_u32());
                    let instance_id = self.instance_id;
                    let table_id = self.store().instance(instance_id).table_id(*table);
                    if !self.store().table_mut(table_id).fill(dst, value, len) {
                        return Err(TrapKind::OutOfBounds.into());
                    }
                }
                Op::TableCopy { dst, src } => {
                    let len = u64::from(self.pop_u32());
                    let src_i = u64::from(self.pop_u32());
                    let dst_i = u64::from(self.pop_u32());
                    self.table_copy(*dst, *src, dst_i, src_i, len)?;
                }
                Op::TableInit { elem, table } => {
                    let len = u64::from(self.pop_u32());
                    let src = u64::from(self.pop_u32());
                    let dst = u64::from(self.pop_u32());
                    let instance_id = self.instance_id;
                    table_init_impl(self.store(), instance_id, *elem, *table, dst, src, len)?;
                }
                Op::ElemDrop(elem) => {
                    let instance_id = self.instance_id;
                    self.store()
                        .instance_mut(instance_id)
                        .dropped_elements
                        .insert(*elem);
                }

                // ===== i32 =====
                Op::I32Eqz => {
                    let v = self.pop_i32();
                    self.push_bool(v == 0);
                }
                Op::I32Eq => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_bool(a == b);
                }
                Op::I32Ne => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_bool(a != b);
                }
                Op::I32LtS => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_bool(a < b);
                }
                Op::I32LtU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_bool(a < b);
                }
                Op::I32GtS => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_bool(a > b);
                }
                Op::I32GtU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_bool(a > b);
                }
                Op::I32LeS => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_bool(a <= b);
                }
                Op::I32LeU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_bool(a <= b);
                }
                Op::I32GeS => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_bool(a >= b);
                }
                Op::I32GeU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_bool(a >= b);
                }
                Op::I32Clz => {
                    let v = self.pop_u32();
                    self.push_u32(v.leading_zeros());
                }
                Op::I32Ctz => {
                    let v = self.pop_u32();
                    self.push_u32(v.trailing_zeros());
                }
                Op::I32Popcnt => {
                    let v = self.pop_u32();
                    self.push_u32(v.count_ones());
                }
                Op::I32Add => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a.wrapping_add(b));
                }
                Op::I32Sub => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a.wrapping_sub(b));
                }
                Op::I32Mul => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a.wrapping_mul(b));
                }
                Op::I32DivS => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    if a == i32::MIN && b == -1 {
                        return Err(TrapKind::IntegerOverflow.into());
                    }
                    self.push_i32(a.wrapping_div(b));
                }
                Op::I32DivU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    self.push_u32(a / b);
                }
                Op::I32RemS => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    self.push_i32(a.wrapping_rem(b));
                }
                Op::I32RemU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    self.push_u32(a % b);
                }
                Op::I32And => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a & b);
                }
                Op::I32Or => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a | b);
                }
                Op::I32Xor => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a ^ b);
                }
                Op::I32Shl => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a.wrapping_shl(b));
                }
                Op::I32ShrS => {
                    let (b, a) = (self.pop_u32(), self.pop_i32());
                    self.push_i32(a.wrapping_shr(b));
                }
                Op::I32ShrU => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a.wrapping_shr(b));
                }
                Op::I32Rotl => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a.rotate_left(b));
                }
                Op::I32Rotr => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_u32(a.rotate_right(b));
                }

                // ===== i64 =====
                Op::I64Eqz => {
                    let v = self.pop_i64();
                    self.push_bool(v == 0);
                }
                Op::I64Eq => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_bool(a == b);
                }
                Op::I64Ne => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_bool(a != b);
                }
                Op::I64LtS => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_bool(a < b);
                }
                Op::I64LtU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push_bool(a < b);
                }
                Op::I64GtS => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_bool(a > b);
                }
                Op::I64GtU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push_bool(a > b);
                }
                Op::I64LeS => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_bool(a <= b);
                }
                Op::I64LeU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push_bool(a <= b);
                }
                Op::I64GeS => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_bool(a >= b);
                }
                Op::I64GeU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push_bool(a >= b);
                }
                Op::I64Clz => {
                    let v = self.pop_u64();
                    self.push_i64(i64::from(v.leading_zeros()));
                }
                Op::I64Ctz => {
                    let v = self.pop_u64();
                    self.push_i64(i64::from(v.trailing_zeros()));
                }
                Op::I64Popcnt => {
                    let v = self.pop_u64();
                    self.push_i64(i64::from(v.count_ones()));
                }
                Op::I64Add => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_i64(a.wrapping_add(b));
                }
                Op::I64Sub => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_i64(a.wrapping_sub(b));
                }
                Op::I64Mul => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_i64(a.wrapping_mul(b));
                }
                Op::I64DivS => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    if a == i64::MIN && b == -1 {
                        return Err(TrapKind::IntegerOverflow.into());
                    }
                    self.push_i64(a.wrapping_div(b));
                }
                Op::I64DivU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    self.push(VMVal::u64(a / b));
                }
                Op::I64RemS => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    self.push_i64(a.wrapping_rem(b));
                }
                Op::I64RemU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    if b == 0 {
                        return Err(TrapKind::IntegerDivideByZero.into());
                    }
                    self.push(VMVal::u64(a % b));
                }
                Op::I64And => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a & b));
                }
                Op::I64Or => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a | b));
                }
                Op::I64Xor => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a ^ b));
                }
                Op::I64Shl => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a.wrapping_shl(b as u32)));
                }
                Op::I64ShrS => {
                    let (b, a) = (self.pop_u64(), self.pop_i64());
                    self.push_i64(a.wrapping_shr(b as u32));
                }
                Op::I64ShrU => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a.wrapping_shr(b as u32)));
                }
                Op::I64Rotl => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a.rotate_left(b as u32 % 64)));
                }
                Op::I64Rotr => {
                    let (b, a) = (self.pop_u64(), self.pop_u64());
                    self.push(VMVal::u64(a.rotate_right(b as u32 % 64)));
                }

                // ===== f32 =====
                Op::F32Eq => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_bool(a == b);
                }
                Op::F32Ne => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_bool(a != b);
                }
                Op::F32Lt => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_bool(a < b);
                }
                Op::F32Gt => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_bool(a > b);
                }
                Op::F32Le => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_bool(a <= b);
                }
                Op::F32Ge => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_bool(a >= b);
                }
                Op::F32Abs => {
                    let v = self.pop_f32();
                    self.push_f32(v.abs());
                }
                Op::F32Neg => {
                    let v = self.pop_f32();
                    self.push_f32(-v);
                }
                Op::F32Ceil => {
                    let v = self.pop_f32();
                    self.push_f32(fops::f32_ceil(v));
                }
                Op::F32Floor => {
                    let v = self.pop_f32();
                    self.push_f32(fops::f32_floor(v));
                }
                Op::F32Trunc => {
                    let v = self.pop_f32();
                    self.push_f32(fops::f32_trunc(v));
                }
                Op::F32Nearest => {
                    let v = self.pop_f32();
                    self.push_f32(fops::f32_nearest(v));
                }
                Op::F32Sqrt => {
                    let v = self.pop_f32();
                    self.push_f32(v.sqrt());
                }
                Op::F32Add => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(a + b);
                }
                Op::F32Sub => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(a - b);
                }
                Op::F32Mul => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(a * b);
                }
                Op::F32Div => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(a / b);
                }
                Op::F32Min => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(fops::f32_min(a, b));
                }
                Op::F32Max => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(fops::f32_max(a, b));
                }
                Op::F32Copysign => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(fops::f32_copysign(a, b));
                }

                // ===== f64 =====
                Op::F64Eq => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_bool(a == b);
                }
                Op::F64Ne => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_bool(a != b);
                }
                Op::F64Lt => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_bool(a < b);
                }
                Op::F64Gt => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_bool(a > b);
                }
                Op::F64Le => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_bool(a <= b);
                }
                Op::F64Ge => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_bool(a >= b);
                }
                Op::F64Abs => {
                    let v = self.pop_f64();
                    self.push_f64(v.abs());
                }
                Op::F64Neg => {
                    let v = self.pop_f64();
                    self.push_f64(-v);
                }
                Op::F64Ceil => {
                    let v = self.pop_f64();
                    self.push_f64(fops::f64_ceil(v));
                }
                Op::F64Floor => {
                    let v = self.pop_f64();
                    self.push_f64(fops::f64_floor(v));
                }
                Op::F64Trunc => {
                    let v = self.pop_f64();
                    self.push_f64(fops::f64_trunc(v));
                }
                Op::F64Nearest => {
                    let v = self.pop_f64();
                    self.push_f64(fops::f64_nearest(v));
                }
                Op::F64Sqrt => {
                    let v = self.pop_f64();
                    self.push_f64(v.sqrt());
                }
                Op::F64Add => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(a + b);
                }
                Op::F64Sub => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(a - b);
                }
                Op::F64Mul => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(a * b);
                }
                Op::F64Div => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(a / b);
                }
                Op::F64Min => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(fops::f64_min(a, b));
                }
                Op::F64Max => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(fops::f64_max(a, b));
                }
                Op::F64Copysign => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(fops::f64_copysign(a, b));
                }

                // ===== conversions =====
                Op::I32WrapI64 => {
                    let v = self.pop_i64();
                    self.push_i32(v as i32);
                }
                Op::I32TruncF32S => {
                    let v = self.pop_f32();
                    self.push_i32(fops::i32_trunc_f32_s(v)?);
                }
                Op::I32TruncF32U => {
                    let v = self.pop_f32();
                    self.push_i32(fops::i32_trunc_f32_u(v)?);
                }
                Op::I32TruncF64S => {
                    let v = self.pop_f64();
                    self.push_i32(fops::i32_trunc_f64_s(v)?);
                }
                Op::I32TruncF64U => {
                    let v = self.pop_f64();
                    self.push_i32(fops::i32_trunc_f64_u(v)?);
                }
                Op::I64ExtendI32S => {
                    let v = self.pop_i32();
                    self.push_i64(i64::from(v));
                }
                Op::I64ExtendI32U => {
                    let v = self.pop_u32();
                    self.push_i64(i64::from(v));
                }
                Op::I64TruncF32S => {
                    let v = self.pop_f32();
                    self.push_i64(fops::i64_trunc_f32_s(v)?);
                }
                Op::I64TruncF32U => {
                    let v = self.pop_f32();
                    self.push_i64(fops::i64_trunc_f32_u(v)?);
                }
                Op::I64TruncF64S => {
                    let v = self.pop_f64();
                    self.push_i64(fops::i64_trunc_f64_s(v)?);
                }
                Op::I64TruncF64U => {
                    let v = self.pop_f64();
                    self.push_i64(fops::i64_trunc_f64_u(v)?);
                }
                Op::F32ConvertI32S => {
                    let v = self.pop_i32();
                    self.push_f32(v as f32);
                }
                Op::F32ConvertI32U => {
                    let v = self.pop_u32();
                    self.push_f32(v as f32);
                }
                Op::F32ConvertI64S => {
                    let v = self.pop_i64();
                    self.push_f32(v as f32);
                }
                Op::F32ConvertI64U => {
                    let v = self.pop_u64();
                    self.push_f32(fops::f32_convert_i64_u(v));
                }
                Op::F32DemoteF64 => {
                    let v = self.pop_f64();
                    self.push_f32(v as f32);
                }
                Op::F64ConvertI32S => {
                    let v = self.pop_i32();
                    self.push_f64(f64::from(v));
                }
                Op::F64ConvertI32U => {
                    let v = self.pop_u32();
                    self.push_f64(f64::from(v));
                }
                Op::F64ConvertI64S => {
                    let v = self.pop_i64();
                    self.push_f64(v as f64);
                }
                Op::F64ConvertI64U => {
                    let v = self.pop_u64();
                    self.push_f64(fops::f64_convert_i64_u(v));
                }
                Op::F64PromoteF32 => {
                    let v = self.pop_f32();
                    self.push_f64(f64::from(v));
                }
                Op::I32ReinterpretF32 => {
                    let bits = self.pop().get_f32();
                    self.push_u32(bits);
                }
                Op::I64ReinterpretF64 => {
                    let bits = self.pop().get_f64();
                    self.push(VMVal::u64(bits));
                }
                Op::F32ReinterpretI32 => {
                    let v = self.pop_u32();
                    self.push(VMVal::f32(v));
                }
                Op::F64ReinterpretI64 => {
                    let v = self.pop_u64();
                    self.push(VMVal::f64(v));
                }

                Op::I32Extend8S => {
                    let v = self.pop_i32();
                    self.push_i32(i32::from(v as i8));
                }
                Op::I32Extend16S => {
                    let v = self.pop_i32();
                    self.push_i32(i32::from(v as i16));
                }
                Op::I64Extend8S => {
                    let v = self.pop_i64();
                    self.push_i64(i64::from(v as i8));
                }
                Op::I64Extend16S => {
                    let v = self.pop_i64();
                    self.push_i64(i64::from(v as i16));
                }
                Op::I64Extend32S => {
                    let v = self.pop_i64();
                    self.push_i64(i64::from(v as i32));
                }

                Op::I32TruncSatF32S => {
                    let v = self.pop_f32();
                    self.push_i32(fops::i32_trunc_sat_f32_s(v));
                }
                Op::I32TruncSatF32U => {
                    let v = self.pop_f32();
                    self.push_i32(fops::i32_trunc_sat_f32_u(v));
                }
                Op::I32TruncSatF64S => {
                    let v = self.pop_f64();
                    self.push_i32(fops::i32_trunc_sat_f64_s(v));
                }
                Op::I32TruncSatF64U => {
                    let v = self.pop_f64();
                    self.push_i32(fops::i32_trunc_sat_f64_u(v));
                }
                Op::I64TruncSatF32S => {
                    let v = self.pop_f32();
                    self.push_i64(fops::i64_trunc_sat_f32_s(v));
                }
                Op::I64TruncSatF32U => {
                    let v = self.pop_f32();
                    self.push_i64(fops::i64_trunc_sat_f32_u(v));
                }
                Op::I64TruncSatF64S => {
                    let v = self.pop_f64();
                    self.push_i64(fops::i64_trunc_sat_f64_s(v));
                }
                Op::I64TruncSatF64U => {
                    let v = self.pop_f64();
                    self.push_i64(fops::i64_trunc_sat_f64_u(v));
                }

                // ===== v128 =====
                Op::V128And => {
                    let (b, a) = (self.pop().get_v128(), self.pop().get_v128());
                    self.push(VMVal::v128(a & b));
                }
                Op::V128AndNot => {
                    let (b, a) = (self.pop().get_v128(), self.pop().get_v128());
                    self.push(VMVal::v128(a & !b));
                }
                Op::V128Or => {
                    let (b, a) = (self.pop().get_v128(), self.pop().get_v128());
                    self.push(VMVal::v128(a | b));
                }
                Op::V128Xor => {
                    let (b, a) = (self.pop().get_v128(), self.pop().get_v128());
                    self.push(VMVal::v128(a ^ b));
                }
                Op::V128Not => {
                    let v = self.pop().get_v128();
                    self.push(VMVal::v128(!v));
                }
                Op::V128Bitselect => {
                    let c = self.pop().get_v128();
                    let v2 = self.pop().get_v128();
                    let v1 = self.pop().get_v128();
                    self.push(VMVal::v128((v1 & c) | (v2 & !c)));
                }
                Op::V128AnyTrue => {
                    let v = self.pop().get_v128();
                    self.push_bool(v != 0);
                }

                // ===== atomics =====
                Op::AtomicFence => fence(Ordering::SeqCst),
                Op::AtomicLoad { ty, offset } => {
                    let addr = self.addr(*offset);
                    let def = self.memory_def()?;
                    // Safety: bounds/alignment checked inside.
                    let v = unsafe { atomic_load_raw(def, *ty, addr)? };
                    if ty.is_64() {
                        self.push(VMVal::u64(v));
                    } else {
                        self.push_u32(v as u32);
                    }
                }
                Op::AtomicStore { ty, offset } => {
                    let v = self.pop_u64();
                    let addr = self.addr(*offset);
                    let def = self.memory_def()?;
                    // Safety: bounds/alignment checked inside.
                    unsafe { atomic_store_raw(def, *ty, addr, v)? };
                }
                Op::AtomicRmw { op, ty, offset } => {
                    let operand = self.pop_u64();
                    let addr = self.addr(*offset);
                    let def = self.memory_def()?;
                    // Safety: bounds/alignment checked inside.
                    let old = unsafe { atomic_rmw_raw(def, *op, *ty, addr, operand)? };
                    if ty.is_64() {
                        self.push(VMVal::u64(old));
                    } else {
                        self.push_u32(old as u32);
                    }
                }
                Op::AtomicCmpxchg { ty, offset } => {
                    let replacement = self.pop_u64();
                    let expected = self.pop_u64();
                    let addr = self.addr(*offset);
                    let def = self.memory_def()?;
                    // Narrow widths compare only the low bits.
                    let expected = expected & width_mask(ty.width());
                    // Safety: bounds/alignment checked inside.
                    let old =
                        unsafe { atomic_cmpxchg_raw(def, *ty, addr, expected, replacement)? };
                    if ty.is_64() {
                        self.push(VMVal::u64(old));
                    } else {
                        self.push_u32(old as u32);
                    }
                }
                Op::AtomicNotify { offset } => {
                    let count = u64::from(self.pop_u32());
                    let addr = self.addr(*offset);
                    let woken = self.atomic_notify(addr, count)?;
                    self.push_u32(u32::try_from(woken).unwrap());
                }
                Op::AtomicWait32 { offset } => {
                    let timeout = self.pop_i64();
                    let expected = u64::from(self.pop_u32());
                    let addr = self.addr(*offset);
                    let outcome = self.atomic_wait(addr, expected, timeout, 4)?;
                    self.push_u32(u32::try_from(outcome).unwrap());
                }
                Op::AtomicWait64 { offset } => {
                    let timeout = self.pop_i64();
                    let expected = self.pop_u64();
                    let addr = self.addr(*offset);
                    let outcome = self.atomic_wait(addr, expected, timeout, 8)?;
                    self.push_u32(u32::try_from(outcome).unwrap());
                }
            }
        }
    }

    fn call_direct(&mut self, func: FuncIndex) -> Control {
        let ty = self.module.translated.func_type(func);
        let (np, nr) = (ty.params().len(), ty.results().len());

        if let Some(def_index) = self.module.translated.defined_func_index(func) {
            let mut vals: SmallVec<[VMVal; 8]> = SmallVec::from_elem(VMVal::ZERO, np.max(nr).max(1));
            let args_start = self.stack.len() - np;
            vals[..np].copy_from_slice(&self.stack[args_start..]);
            self.stack.truncate(args_start);
            // Safety: same store, same contract as our own invocation.
            let status = unsafe {
                invoke(
                    self.store,
                    self.instance_id,
                    def_index,
                    vals.as_mut_ptr(),
                    vals.len(),
                )
            };
            if status != STATUS_OK {
                return Err(Unwind::Status(status));
            }
            self.stack.extend_from_slice(&vals[..nr]);
            Ok(())
        } else {
            let instance_id = self.instance_id;
            let func_ref = self
                .store()
                .instance(instance_id)
                .imported_func_ref(func)
                .expect("unresolved function import");
            self.call_func_ref(func_ref as *mut VMFuncRef, np, nr)
        }
    }

    fn memory_init(&mut self, seg: DataIndex) -> Control {
        let len = u64::from(self.pop_u32());
        let src = u64::from(self.pop_u32());
        let dst = u64::from(self.pop_u32());

        let instance_id = self.instance_id;
        let dropped = self.store().instance(instance_id).dropped_data.contains(seg);
        let module = Arc::clone(self.module);
        let data: &[u8] = if dropped {
            &[]
        } else {
            &module.translated.data_segments[seg].data
        };

        let src_end = src.checked_add(len).ok_or(TrapKind::OutOfBounds)?;
        if src_end > data.len() as u64 {
            return Err(TrapKind::OutOfBounds.into());
        }
        let def = self.memory_def()?;
        // Safety: both ranges bounds-checked.
        unsafe {
            let ptr = memory_access(def, dst, len)?;
            core::ptr::copy_nonoverlapping(data.as_ptr().add(src as usize), ptr, len as usize);
        }
        Ok(())
    }

    fn table_copy(
        &mut self,
        dst: crate::indices::TableIndex,
        src: crate::indices::TableIndex,
        dst_i: u64,
        src_i: u64,
        len: u64,
    ) -> Control {
        let instance_id = self.instance_id;
        let store = self.store();
        let dst_id = store.instance(instance_id).table_id(dst);
        let src_id = store.instance(instance_id).table_id(src);

        let in_bounds = |size: u64, start: u64, count: u64| {
            start.checked_add(count).is_some_and(|end| end <= size)
        };

        if dst_id == src_id {
            let table = store.table_mut(dst_id);
            if !in_bounds(table.size(), dst_i, len) || !in_bounds(table.size(), src_i, len) {
                return Err(TrapKind::OutOfBounds.into());
            }
            table
                .elements_mut()
                .copy_within(src_i as usize..(src_i + len) as usize, dst_i as usize);
        } else {
            let (dst_t, src_t) = store.two_tables_mut(dst_id, src_id);
            if !in_bounds(dst_t.size(), dst_i, len) || !in_bounds(src_t.size(), src_i, len) {
                return Err(TrapKind::OutOfBounds.into());
            }
            dst_t.elements_mut()[dst_i as usize..(dst_i + len) as usize]
                .copy_from_slice(&src_t.elements()[src_i as usize..(src_i + len) as usize]);
        }
        Ok(())
    }

    fn atomic_wait(&mut self, addr: u64, expected: u64, timeout: i64, width: u64) -> Result<u64, Unwind> {
        let instance_id = self.instance_id;
        let store = self.store();
        let Some(memory_id) = store.instance(instance_id).memory0_id() else {
            return Err(TrapKind::AtomicWaitNonSharedMemory.into());
        };
        let Some(shared) = store.memory(memory_id).shared().cloned() else {
            return Err(TrapKind::AtomicWaitNonSharedMemory.into());
        };
        // Safety: shared memory definitions are pinned in their Arc.
        let def = unsafe { &*shared.def_ptr() };
        if addr % width != 0 {
            return Err(TrapKind::OutOfBounds.into());
        }
        // Safety: bounds-checked.
        unsafe { memory_access(def, addr, width)? };
        let base = def.base;
        Ok(shared.wait(addr, timeout, move || {
            // Safety: aligned, in bounds, and the base never moves.
            unsafe {
                if width == 4 {
                    u64::from(
                        (*base.add(addr as usize).cast::<std::sync::atomic::AtomicU32>())
                            .load(Ordering::SeqCst),
                    ) == expected
                } else {
                    (*base.add(addr as usize).cast::<std::sync::atomic::AtomicU64>())
                        .load(Ordering::SeqCst)
                        == expected
                }
            }
        }))
    }

    fn atomic_notify(&mut self, addr: u64, count: u64) -> Result<u64, Unwind> {
        let instance_id = self.instance_id;
        let store = self.store();
        let Some(memory_id) = store.instance(instance_id).memory0_id() else {
            return Err(TrapKind::OutOfBounds.into());
        };
        let memory = store.memory(memory_id);
        // Safety: memory definitions are pinned for the store's life.
        let def = unsafe { &*memory.def_ptr() };
        if addr % 4 != 0 {
            return Err(TrapKind::OutOfBounds.into());
        }
        // Safety: bounds-checked.
        unsafe { memory_access(def, addr, 4)? };
        Ok(match memory.shared() {
            Some(shared) => shared.notify(addr, count),
            None => 0,
        })
    }
}

fn width_mask(width: u32) -> u64 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        8 => u64::MAX,
        _ => unreachable!(),
    }
}
