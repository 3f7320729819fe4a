// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builtin functions.
//!
//! Operations that are either too large to emit inline (bulk memory, table
//! manipulation) or whose semantics must be bit-identical across engines
//! (float min/max/nearest, float→int conversions, atomics) live here. The
//! compiler reaches them through [`VMBuiltinFunctionsArray`]; the interpreter
//! calls the same underlying functions directly, which is what makes the two
//! engines indistinguishable on these paths.
//!
//! Builtins that can trap park the status word in [`VMContext::trap`];
//! generated code tests it after the call and branches to its trap exit.

use crate::store::StoreOpaque;
use crate::translate::{AtomicOp, AtomicTy};
use crate::trap::TrapKind;
use crate::vm::{
    status_from_trap, VMBuiltinFunctionsArray, VMContext, VMFuncRef, VMMemoryDefinition,
    VMCONTEXT_MAGIC,
};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// The builtin table generated code indexes through
/// [`VMContext::builtins`](crate::vm::VMContext::builtins).
pub static BUILTINS: VMBuiltinFunctionsArray = VMBuiltinFunctionsArray {
    memory_grow,
    memory_fill,
    memory_copy,
    memory_init,
    data_drop,
    table_get,
    table_set,
    table_grow,
    table_fill,
    table_copy,
    table_init,
    elem_drop,
    f32_ceil,
    f32_floor,
    f32_trunc,
    f32_nearest,
    f32_min,
    f32_max,
    f32_copysign,
    f64_ceil,
    f64_floor,
    f64_trunc,
    f64_nearest,
    f64_min,
    f64_max,
    f64_copysign,
    i32_trunc_f32_s,
    i32_trunc_f32_u,
    i32_trunc_f64_s,
    i32_trunc_f64_u,
    i64_trunc_f32_s,
    i64_trunc_f32_u,
    i64_trunc_f64_s,
    i64_trunc_f64_u,
    i32_trunc_sat_f32_s,
    i32_trunc_sat_f32_u,
    i32_trunc_sat_f64_s,
    i32_trunc_sat_f64_u,
    i64_trunc_sat_f32_s,
    i64_trunc_sat_f32_u,
    i64_trunc_sat_f64_s,
    i64_trunc_sat_f64_u,
    f32_convert_i64_u,
    f64_convert_i64_u,
    atomic_load,
    atomic_store,
    atomic_rmw,
    atomic_cmpxchg,
    atomic_wait32,
    atomic_wait64,
    atomic_notify,
};

/// Entry point installed on funcrefs of interpreted functions. Interpreted
/// calls are dispatched through the store (the caller has the funcref and
/// with it the function's identity); landing here means a raw `array_call`
/// was made on an interpreted funcref, which no supported path does.
pub unsafe extern "C" fn interpreter_entry(
    _callee: *mut VMContext,
    _caller: *mut VMContext,
    _vals: *mut crate::vm::VMVal,
    _len: usize,
) -> u32 {
    unreachable!("interpreted funcrefs are invoked through the store");
}

// ===== shared semantic core (also called by the interpreter) =====

/// Wasm-semantics float helpers. `a + b` in the NaN arms produces a quiet
/// NaN the same way the hardware would, so compiled SSE code and the
/// interpreter agree on the bit patterns.
pub mod fops {
    use crate::trap::TrapKind;

    pub extern "C" fn f32_ceil(x: f32) -> f32 {
        x.ceil()
    }
    pub extern "C" fn f32_floor(x: f32) -> f32 {
        x.floor()
    }
    pub extern "C" fn f32_trunc(x: f32) -> f32 {
        x.trunc()
    }
    pub extern "C" fn f32_nearest(x: f32) -> f32 {
        x.round_ties_even()
    }
    pub extern "C" fn f32_min(a: f32, b: f32) -> f32 {
        if a < b {
            a
        } else if b < a {
            b
        } else if a == b {
            if a.is_sign_negative() {
                a
            } else {
                b
            }
        } else {
            a + b
        }
    }
    pub extern "C" fn f32_max(a: f32, b: f32) -> f32 {
        if a > b {
            a
        } else if b > a {
            b
        } else if a == b {
            if a.is_sign_positive() {
                a
            } else {
                b
            }
        } else {
            a + b
        }
    }
    pub extern "C" fn f32_copysign(a: f32, b: f32) -> f32 {
        a.copysign(b)
    }

    pub extern "C" fn f64_ceil(x: f64) -> f64 {
        x.ceil()
    }
    pub extern "C" fn f64_floor(x: f64) -> f64 {
        x.floor()
    }
    pub extern "C" fn f64_trunc(x: f64) -> f64 {
        x.trunc()
    }
    pub extern "C" fn f64_nearest(x: f64) -> f64 {
        x.round_ties_even()
    }
    pub extern "C" fn f64_min(a: f64, b: f64) -> f64 {
        if a < b {
            a
        } else if b < a {
            b
        } else if a == b {
            if a.is_sign_negative() {
                a
            } else {
                b
            }
        } else {
            a + b
        }
    }
    pub extern "C" fn f64_max(a: f64, b: f64) -> f64 {
        if a > b {
            a
        } else if b > a {
            b
        } else if a == b {
            if a.is_sign_positive() {
                a
            } else {
                b
            }
        } else {
            a + b
        }
    }
    pub extern "C" fn f64_copysign(a: f64, b: f64) -> f64 {
        a.copysign(b)
    }

    fn trunc_checked(t: f64, lo: f64, hi: f64) -> Result<f64, TrapKind> {
        if t.is_nan() {
            return Err(TrapKind::InvalidConversionToInteger);
        }
        let t = t.trunc();
        if t >= lo && t < hi {
            Ok(t)
        } else {
            Err(TrapKind::IntegerOverflow)
        }
    }

    pub fn i32_trunc_f32_s(x: f32) -> Result<i32, TrapKind> {
        trunc_checked(f64::from(x), -2_147_483_648.0, 2_147_483_648.0).map(|t| t as i32)
    }
    pub fn i32_trunc_f32_u(x: f32) -> Result<i32, TrapKind> {
        trunc_checked(f64::from(x), -0.0, 4_294_967_296.0).map(|t| t as u32 as i32)
    }
    pub fn i32_trunc_f64_s(x: f64) -> Result<i32, TrapKind> {
        trunc_checked(x, -2_147_483_648.0, 2_147_483_648.0).map(|t| t as i32)
    }
    pub fn i32_trunc_f64_u(x: f64) -> Result<i32, TrapKind> {
        trunc_checked(x, -0.0, 4_294_967_296.0).map(|t| t as u32 as i32)
    }
    pub fn i64_trunc_f32_s(x: f32) -> Result<i64, TrapKind> {
        trunc_checked(
            f64::from(x),
            -9_223_372_036_854_775_808.0,
            9_223_372_036_854_775_808.0,
        )
        .map(|t| t as i64)
    }
    pub fn i64_trunc_f32_u(x: f32) -> Result<i64, TrapKind> {
        trunc_checked(f64::from(x), -0.0, 18_446_744_073_709_551_616.0).map(|t| t as u64 as i64)
    }
    pub fn i64_trunc_f64_s(x: f64) -> Result<i64, TrapKind> {
        trunc_checked(
            x,
            -9_223_372_036_854_775_808.0,
            9_223_372_036_854_775_808.0,
        )
        .map(|t| t as i64)
    }
    pub fn i64_trunc_f64_u(x: f64) -> Result<i64, TrapKind> {
        trunc_checked(x, -0.0, 18_446_744_073_709_551_616.0).map(|t| t as u64 as i64)
    }

    // Rust `as` casts saturate (and map NaN to zero), which is exactly the
    // nontrapping-conversion semantics.
    pub extern "C" fn i32_trunc_sat_f32_s(x: f32) -> i32 {
        x as i32
    }
    pub extern "C" fn i32_trunc_sat_f32_u(x: f32) -> i32 {
        x as u32 as i32
    }
    pub extern "C" fn i32_trunc_sat_f64_s(x: f64) -> i32 {
        x as i32
    }
    pub extern "C" fn i32_trunc_sat_f64_u(x: f64) -> i32 {
        x as u32 as i32
    }
    pub extern "C" fn i64_trunc_sat_f32_s(x: f32) -> i64 {
        x as i64
    }
    pub extern "C" fn i64_trunc_sat_f32_u(x: f32) -> i64 {
        x as u64 as i64
    }
    pub extern "C" fn i64_trunc_sat_f64_s(x: f64) -> i64 {
        x as i64
    }
    pub extern "C" fn i64_trunc_sat_f64_u(x: f64) -> i64 {
        x as u64 as i64
    }

    pub extern "C" fn f32_convert_i64_u(x: u64) -> f32 {
        x as f32
    }
    pub extern "C" fn f64_convert_i64_u(x: u64) -> f64 {
        x as f64
    }
}

/// Bounds-checks `[addr, addr + len)` against the memory, returning the host
/// pointer to the first byte.
///
/// # Safety
///
/// `def` must describe a live linear memory.
pub unsafe fn memory_access(
    def: &VMMemoryDefinition,
    addr: u64,
    len: u64,
) -> Result<*mut u8, TrapKind> {
    let size = def.current_length.load(Ordering::Acquire) as u64;
    let end = addr.checked_add(len).ok_or(TrapKind::OutOfBounds)?;
    if end > size {
        return Err(TrapKind::OutOfBounds);
    }
    // Safety: in bounds per the check above.
    Ok(unsafe { def.base.add(addr as usize) })
}

/// Aligned, sequentially-consistent atomic access core shared by both
/// engines. Misaligned addresses trap.
///
/// # Safety
///
/// `def` must describe a live linear memory.
pub unsafe fn atomic_load_raw(
    def: &VMMemoryDefinition,
    ty: AtomicTy,
    addr: u64,
) -> Result<u64, TrapKind> {
    let width = u64::from(ty.width());
    let ptr = check_aligned(def, addr, width)?;
    // Safety: aligned and in bounds.
    unsafe {
        Ok(match width {
            1 => u64::from((*ptr.cast::<AtomicU8>()).load(Ordering::SeqCst)),
            2 => u64::from((*ptr.cast::<AtomicU16>()).load(Ordering::SeqCst)),
            4 => u64::from((*ptr.cast::<AtomicU32>()).load(Ordering::SeqCst)),
            8 => (*ptr.cast::<AtomicU64>()).load(Ordering::SeqCst),
            _ => unreachable!(),
        })
    }
}

/// # Safety
///
/// See [`atomic_load_raw`].
pub unsafe fn atomic_store_raw(
    def: &VMMemoryDefinition,
    ty: AtomicTy,
    addr: u64,
    val: u64,
) -> Result<(), TrapKind> {
    let width = u64::from(ty.width());
    let ptr = check_aligned(def, addr, width)?;
    // Safety: aligned and in bounds.
    unsafe {
        match width {
            1 => (*ptr.cast::<AtomicU8>()).store(val as u8, Ordering::SeqCst),
            2 => (*ptr.cast::<AtomicU16>()).store(val as u16, Ordering::SeqCst),
            4 => (*ptr.cast::<AtomicU32>()).store(val as u32, Ordering::SeqCst),
            8 => (*ptr.cast::<AtomicU64>()).store(val, Ordering::SeqCst),
            _ => unreachable!(),
        }
    }
    Ok(())
}

/// # Safety
///
/// See [`atomic_load_raw`].
pub unsafe fn atomic_rmw_raw(
    def: &VMMemoryDefinition,
    op: AtomicOp,
    ty: AtomicTy,
    addr: u64,
    operand: u64,
) -> Result<u64, TrapKind> {
    let width = u64::from(ty.width());
    let ptr = check_aligned(def, addr, width)?;

    macro_rules! rmw {
        ($atomic:ty, $prim:ty) => {{
            // Safety: aligned and in bounds.
            let a = unsafe { &*ptr.cast::<$atomic>() };
            let operand = operand as $prim;
            let old = match op {
                AtomicOp::Add => a.fetch_add(operand, Ordering::SeqCst),
                AtomicOp::Sub => a.fetch_sub(operand, Ordering::SeqCst),
                AtomicOp::And => a.fetch_and(operand, Ordering::SeqCst),
                AtomicOp::Or => a.fetch_or(operand, Ordering::SeqCst),
                AtomicOp::Xor => a.fetch_xor(operand, Ordering::SeqCst),
                AtomicOp::Xchg => a.swap(operand, Ordering::SeqCst),
            };
            old as u64
        }};
    }

    Ok(match width {
        1 => rmw!(AtomicU8, u8),
        2 => rmw!(AtomicU16, u16),
        4 => rmw!(AtomicU32, u32),
        8 => rmw!(AtomicU64, u64),
        _ => unreachable!(),
    })
}

/// # Safety
///
/// See [`atomic_load_raw`].
pub unsafe fn atomic_cmpxchg_raw(
    def: &VMMemoryDefinition,
    ty: AtomicTy,
    addr: u64,
    expected: u64,
    replacement: u64,
) -> Result<u64, TrapKind> {
    let width = u64::from(ty.width());
    let ptr = check_aligned(def, addr, width)?;

    macro_rules! cmpxchg {
        ($atomic:ty, $prim:ty) => {{
            // Safety: aligned and in bounds.
            let a = unsafe { &*ptr.cast::<$atomic>() };
            match a.compare_exchange(
                expected as $prim,
                replacement as $prim,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(old) | Err(old) => old as u64,
            }
        }};
    }

    Ok(match width {
        1 => cmpxchg!(AtomicU8, u8),
        2 => cmpxchg!(AtomicU16, u16),
        4 => cmpxchg!(AtomicU32, u32),
        8 => cmpxchg!(AtomicU64, u64),
        _ => unreachable!(),
    })
}

unsafe fn check_aligned(
    def: &VMMemoryDefinition,
    addr: u64,
    width: u64,
) -> Result<*mut u8, TrapKind> {
    if addr % width != 0 {
        return Err(TrapKind::OutOfBounds);
    }
    // Safety: forwarded to memory_access.
    unsafe { memory_access(def, addr, width) }
}

// ===== extern "C" wrappers for generated code =====

unsafe fn store_of<'a>(vmctx: *mut VMContext) -> (&'a mut StoreOpaque, usize) {
    // Safety: vmctx is a live instance context whose store pointer was
    // installed at instantiation.
    unsafe {
        debug_assert_eq!((*vmctx).magic, VMCONTEXT_MAGIC);
        let store = (*vmctx).store.cast::<StoreOpaque>();
        (&mut *store, (*vmctx).instance as usize)
    }
}

unsafe fn park_trap(vmctx: *mut VMContext, kind: TrapKind) {
    // Safety: vmctx live per caller contract.
    unsafe {
        (*vmctx).trap = status_from_trap(kind);
    }
}

unsafe fn memory_def<'a>(vmctx: *mut VMContext) -> &'a VMMemoryDefinition {
    // Safety: modules that execute memory operations declare a memory, so
    // the pointer is non-null.
    unsafe {
        debug_assert!(!(*vmctx).memory_def.is_null());
        &*(*vmctx).memory_def
    }
}

unsafe extern "C" fn memory_grow(vmctx: *mut VMContext, delta: u64) -> u64 {
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let Some(memory_id) = store.instance(instance_id).memory0_id() else {
            return u64::MAX;
        };
        match store.memory_mut(memory_id).grow(delta) {
            Ok(Some(prev_pages)) => prev_pages,
            // Out-of-memory on grow is reported to the guest as -1, never
            // as a trap.
            Ok(None) | Err(_) => u64::MAX,
        }
    }
}

unsafe extern "C" fn memory_fill(vmctx: *mut VMContext, dst: u64, val: u32, len: u64) {
    // Safety: per array-call contract.
    unsafe {
        let def = memory_def(vmctx);
        match memory_access(def, dst, len) {
            Ok(ptr) => core::ptr::write_bytes(ptr, val as u8, len as usize),
            Err(kind) => park_trap(vmctx, kind),
        }
    }
}

unsafe extern "C" fn memory_copy(vmctx: *mut VMContext, dst: u64, src: u64, len: u64) {
    // Safety: per array-call contract.
    unsafe {
        let def = memory_def(vmctx);
        match (memory_access(def, dst, len), memory_access(def, src, len)) {
            (Ok(dst), Ok(src)) => core::ptr::copy(src, dst, len as usize),
            (Err(kind), _) | (_, Err(kind)) => park_trap(vmctx, kind),
        }
    }
}

unsafe extern "C" fn memory_init(vmctx: *mut VMContext, seg: u32, dst: u64, src: u64, len: u64) {
    use crate::indices::DataIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let instance = store.instance(instance_id);
        let index = DataIndex::from_u32(seg);
        let data: &[u8] = if instance.dropped_data.contains(index) {
            &[]
        } else {
            &instance.module.translated.data_segments[index].data
        };

        let Some(src_end) = src.checked_add(len) else {
            park_trap(vmctx, TrapKind::OutOfBounds);
            return;
        };
        if src_end > data.len() as u64 {
            park_trap(vmctx, TrapKind::OutOfBounds);
            return;
        }
        let def = memory_def(vmctx);
        match memory_access(def, dst, len) {
            Ok(ptr) => {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr().add(src as usize),
                    ptr,
                    len as usize,
                );
            }
            Err(kind) => park_trap(vmctx, kind),
        }
    }
}

unsafe extern "C" fn data_drop(vmctx: *mut VMContext, seg: u32) {
    use crate::indices::DataIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        store
            .instance_mut(instance_id)
            .dropped_data
            .insert(DataIndex::from_u32(seg));
    }
}

unsafe extern "C" fn table_get(vmctx: *mut VMContext, table: u32, index: u64) -> u64 {
    use crate::indices::TableIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let id = store
            .instance(instance_id)
            .table_id(TableIndex::from_u32(table));
        match store.table(id).get(index) {
            Some(element) => element as u64,
            None => {
                park_trap(vmctx, TrapKind::OutOfBounds);
                0
            }
        }
    }
}

unsafe extern "C" fn table_set(vmctx: *mut VMContext, table: u32, index: u64, value: u64) {
    use crate::indices::TableIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let id = store
            .instance(instance_id)
            .table_id(TableIndex::from_u32(table));
        if !store
            .table_mut(id)
            .set(index, value as usize as *mut VMFuncRef)
        {
            park_trap(vmctx, TrapKind::OutOfBounds);
        }
    }
}

unsafe extern "C" fn table_grow(vmctx: *mut VMContext, table: u32, delta: u64, init: u64) -> u64 {
    use crate::indices::TableIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let id = store
            .instance(instance_id)
            .table_id(TableIndex::from_u32(table));
        match store
            .table_mut(id)
            .grow(delta, init as usize as *mut VMFuncRef)
        {
            Some(prev) => prev,
            None => u64::MAX,
        }
    }
}

unsafe extern "C" fn table_fill(vmctx: *mut VMContext, table: u32, dst: u64, val: u64, len: u64) {
    use crate::indices::TableIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let id = store
            .instance(instance_id)
            .table_id(TableIndex::from_u32(table));
        if !store
            .table_mut(id)
            .fill(dst, val as usize as *mut VMFuncRef, len)
        {
            park_trap(vmctx, TrapKind::OutOfBounds);
        }
    }
}

unsafe extern "C" fn table_copy(
    vmctx: *mut VMContext,
    dst_table: u32,
    src_table: u32,
    dst: u64,
    src: u64,
    len: u64,
) {
    use crate::indices::TableIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let instance = store.instance(instance_id);
        let dst_id = instance.table_id(TableIndex::from_u32(dst_table));
        let src_id = instance.table_id(TableIndex::from_u32(src_table));

        let oob = |t: &crate::vm::Table, start: u64, count: u64| {
            start
                .checked_add(count)
                .is_none_or(|end| end > t.size())
        };

        if dst_id == src_id {
            let t = store.table_mut(dst_id);
            if oob(t, dst, len) || oob(t, src, len) {
                park_trap(vmctx, TrapKind::OutOfBounds);
                return;
            }
            t.elements_mut()
                .copy_within(src as usize..(src + len) as usize, dst as usize);
        } else {
            let (dst_t, src_t) = store.two_tables_mut(dst_id, src_id);
            if oob(dst_t, dst, len) || oob(src_t, src, len) {
                park_trap(vmctx, TrapKind::OutOfBounds);
                return;
            }
            dst_t.elements_mut()[dst as usize..(dst + len) as usize]
                .copy_from_slice(&src_t.elements()[src as usize..(src + len) as usize]);
        }
    }
}

unsafe extern "C" fn table_init(
    vmctx: *mut VMContext,
    elem: u32,
    table: u32,
    dst: u64,
    src: u64,
    len: u64,
) {
    use crate::indices::{ElemIndex, TableIndex};
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let status = table_init_impl(
            store,
            instance_id,
            ElemIndex::from_u32(elem),
            TableIndex::from_u32(table),
            dst,
            src,
            len,
        );
        if let Err(kind) = status {
            park_trap(vmctx, kind);
        }
    }
}

/// Shared by the builtin above and active-segment application at
/// instantiation.
pub fn table_init_impl(
    store: &mut StoreOpaque,
    instance_id: usize,
    elem: crate::indices::ElemIndex,
    table: crate::indices::TableIndex,
    dst: u64,
    src: u64,
    len: u64,
) -> Result<(), TrapKind> {
    let instance = store.instance(instance_id);
    let module = std::sync::Arc::clone(&instance.module);
    let table_id = instance.table_id(table);

    let empty: &[Option<crate::indices::FuncIndex>] = &[];
    let elements = if instance.dropped_elements.contains(elem) {
        empty
    } else {
        &module.translated.element_segments[elem].elements
    };

    let src_end = src.checked_add(len).ok_or(TrapKind::OutOfBounds)?;
    if src_end > elements.len() as u64 {
        return Err(TrapKind::OutOfBounds);
    }
    let dst_end = dst.checked_add(len).ok_or(TrapKind::OutOfBounds)?;
    if dst_end > store.table(table_id).size() {
        return Err(TrapKind::OutOfBounds);
    }

    for i in 0..len {
        let value = match elements[(src + i) as usize] {
            Some(func_index) => store.instance(instance_id).func_ref_ptr(func_index),
            None => std::ptr::null_mut(),
        };
        let ok = store.table_mut(table_id).set(dst + i, value);
        debug_assert!(ok);
    }
    Ok(())
}

unsafe extern "C" fn elem_drop(vmctx: *mut VMContext, elem: u32) {
    use crate::indices::ElemIndex;
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        store
            .instance_mut(instance_id)
            .dropped_elements
            .insert(ElemIndex::from_u32(elem));
    }
}

// ===== float builtins (thin extern shims over fops) =====

use fops::{
    f32_ceil, f32_convert_i64_u, f32_copysign, f32_floor, f32_max, f32_min, f32_nearest,
    f32_trunc, f64_ceil, f64_convert_i64_u, f64_copysign, f64_floor, f64_max, f64_min,
    f64_nearest, f64_trunc, i32_trunc_sat_f32_s, i32_trunc_sat_f32_u, i32_trunc_sat_f64_s,
    i32_trunc_sat_f64_u, i64_trunc_sat_f32_s, i64_trunc_sat_f32_u, i64_trunc_sat_f64_s,
    i64_trunc_sat_f64_u,
};

macro_rules! trapping_trunc {
    ($($name:ident($src:ty) -> $dst:ty;)*) => {
        $(
            unsafe extern "C" fn $name(vmctx: *mut VMContext, x: $src) -> $dst {
                match fops::$name(x) {
                    Ok(v) => v,
                    Err(kind) => {
                        // Safety: per array-call contract.
                        unsafe { park_trap(vmctx, kind) };
                        0
                    }
                }
            }
        )*
    };
}

trapping_trunc! {
    i32_trunc_f32_s(f32) -> i32;
    i32_trunc_f32_u(f32) -> i32;
    i32_trunc_f64_s(f64) -> i32;
    i32_trunc_f64_u(f64) -> i32;
    i64_trunc_f32_s(f32) -> i64;
    i64_trunc_f32_u(f32) -> i64;
    i64_trunc_f64_s(f64) -> i64;
    i64_trunc_f64_u(f64) -> i64;
}

// ===== atomic builtins =====

unsafe extern "C" fn atomic_load(vmctx: *mut VMContext, ty: u32, addr: u64) -> u64 {
    // Safety: per array-call contract.
    unsafe {
        let def = memory_def(vmctx);
        match atomic_load_raw(def, AtomicTy::from_code(ty), addr) {
            Ok(v) => v,
            Err(kind) => {
                park_trap(vmctx, kind);
                0
            }
        }
    }
}

unsafe extern "C" fn atomic_store(vmctx: *mut VMContext, ty: u32, addr: u64, val: u64) {
    // Safety: per array-call contract.
    unsafe {
        let def = memory_def(vmctx);
        if let Err(kind) = atomic_store_raw(def, AtomicTy::from_code(ty), addr, val) {
            park_trap(vmctx, kind);
        }
    }
}

unsafe extern "C" fn atomic_rmw(
    vmctx: *mut VMContext,
    op: u32,
    ty: u32,
    addr: u64,
    operand: u64,
) -> u64 {
    // Safety: per array-call contract.
    unsafe {
        let def = memory_def(vmctx);
        match atomic_rmw_raw(
            def,
            AtomicOp::from_code(op),
            AtomicTy::from_code(ty),
            addr,
            operand,
        ) {
            Ok(v) => v,
            Err(kind) => {
                park_trap(vmctx, kind);
                0
            }
        }
    }
}

unsafe extern "C" fn atomic_cmpxchg(
    vmctx: *mut VMContext,
    ty: u32,
    addr: u64,
    expected: u64,
    replacement: u64,
) -> u64 {
    // Safety: per array-call contract.
    unsafe {
        let def = memory_def(vmctx);
        match atomic_cmpxchg_raw(def, AtomicTy::from_code(ty), addr, expected, replacement) {
            Ok(v) => v,
            Err(kind) => {
                park_trap(vmctx, kind);
                0
            }
        }
    }
}

/// Shared wait implementation; `width` is 4 or 8.
unsafe fn atomic_wait_impl(
    vmctx: *mut VMContext,
    addr: u64,
    expected: u64,
    timeout: i64,
    width: u64,
) -> u64 {
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let Some(memory_id) = store.instance(instance_id).memory0_id() else {
            park_trap(vmctx, TrapKind::AtomicWaitNonSharedMemory);
            return 0;
        };
        let Some(shared) = store.memory(memory_id).shared().cloned() else {
            park_trap(vmctx, TrapKind::AtomicWaitNonSharedMemory);
            return 0;
        };

        let def = &*shared.def_ptr();
        if addr % width != 0 || memory_access(def, addr, width).is_err() {
            park_trap(vmctx, TrapKind::OutOfBounds);
            return 0;
        }
        let base = def.base;
        shared.wait(addr, timeout, move || {
            // Safety: checked aligned and in bounds above; the base of a
            // shared memory never moves.
            unsafe {
                if width == 4 {
                    u64::from(
                        (*base.add(addr as usize).cast::<AtomicU32>()).load(Ordering::SeqCst),
                    ) == expected
                } else {
                    (*base.add(addr as usize).cast::<AtomicU64>()).load(Ordering::SeqCst)
                        == expected
                }
            }
        })
    }
}

unsafe extern "C" fn atomic_wait32(
    vmctx: *mut VMContext,
    addr: u64,
    expected: u64,
    timeout: i64,
) -> u64 {
    // Safety: per array-call contract.
    unsafe { atomic_wait_impl(vmctx, addr, expected & 0xffff_ffff, timeout, 4) }
}

unsafe extern "C" fn atomic_wait64(
    vmctx: *mut VMContext,
    addr: u64,
    expected: u64,
    timeout: i64,
) -> u64 {
    // Safety: per array-call contract.
    unsafe { atomic_wait_impl(vmctx, addr, expected, timeout, 8) }
}

unsafe extern "C" fn atomic_notify(vmctx: *mut VMContext, addr: u64, count: u64) -> u64 {
    // Safety: per array-call contract.
    unsafe {
        let (store, instance_id) = store_of(vmctx);
        let Some(memory_id) = store.instance(instance_id).memory0_id() else {
            park_trap(vmctx, TrapKind::OutOfBounds);
            return 0;
        };
        let memory = store.memory(memory_id);
        let def = &*memory.def_ptr();
        if addr % 4 != 0 || memory_access(def, addr, 4).is_err() {
            park_trap(vmctx, TrapKind::OutOfBounds);
            return 0;
        }
        match memory.shared() {
            Some(shared) => shared.notify(addr, count),
            // Notifying a non-shared memory is valid and wakes nobody.
            None => 0,
        }
    }
}
