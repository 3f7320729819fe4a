// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::StoreOpaque;
use crate::types::ValType;
use crate::vm::VMVal;
use crate::Func;
use core::ptr;

/// A WebAssembly value.
///
/// Floats are carried as raw bits so that NaN payloads survive the host
/// boundary unchanged.
#[derive(Debug, Clone)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    V128(u128),
    /// A first-class reference to a WebAssembly function.
    ///
    /// The host, or the Wasm guest, can invoke this function. The guest can
    /// create non-null function references via the `ref.func` instruction, or
    /// null references via `ref.null func`.
    FuncRef(Option<Func>),
}

impl Val {
    /// Returns the default (zero) value for the given type.
    pub fn default_for_ty(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            ValType::V128 => Val::V128(0),
            ValType::FuncRef => Val::FuncRef(None),
        }
    }

    /// Returns the corresponding [`ValType`] for this `Val`.
    #[inline]
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
            Val::FuncRef(_) => ValType::FuncRef,
        }
    }

    pub(crate) fn matches_ty(&self, ty: ValType) -> bool {
        self.ty() == ty
    }

    pub(crate) fn to_vmval(&self, store: &mut StoreOpaque) -> VMVal {
        match self {
            Val::I32(i) => VMVal::i32(*i),
            Val::I64(i) => VMVal::i64(*i),
            Val::F32(u) => VMVal::f32(*u),
            Val::F64(u) => VMVal::f64(*u),
            Val::V128(b) => VMVal::v128(*b),
            Val::FuncRef(f) => VMVal::funcref(match f {
                None => ptr::null_mut(),
                Some(f) => f.vm_func_ref(store),
            }),
        }
    }

    /// # Safety
    ///
    /// `vmval` must carry a valid bit pattern for `ty`; for references it
    /// must be either null or a `VMFuncRef` owned by `store`.
    pub(crate) unsafe fn from_vmval(store: &mut StoreOpaque, vmval: VMVal, ty: ValType) -> Val {
        // Safety: ensured by caller
        unsafe {
            match ty {
                ValType::I32 => Val::I32(vmval.get_i32()),
                ValType::I64 => Val::I64(vmval.get_i64()),
                ValType::F32 => Val::F32(vmval.get_f32()),
                ValType::F64 => Val::F64(vmval.get_f64()),
                ValType::V128 => Val::V128(vmval.get_v128()),
                ValType::FuncRef => Val::FuncRef(Func::from_vm_func_ref(store, vmval.get_funcref())),
            }
        }
    }

    enum_accessors! {
        e
        (I32(i32) is_i32 get_i32 unwrap_i32 *e)
        (I64(i64) is_i64 get_i64 unwrap_i64 *e)
        (F32(f32) is_f32 get_f32 unwrap_f32 f32::from_bits(*e))
        (F64(f64) is_f64 get_f64 unwrap_f64 f64::from_bits(*e))
        (V128(u128) is_v128 get_v128 unwrap_v128 *e)
        (FuncRef(Option<&Func>) is_func_ref get_func_ref unwrap_func_ref e.as_ref())
    }
}

impl From<i32> for Val {
    #[inline]
    fn from(val: i32) -> Val {
        Val::I32(val)
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(val: i64) -> Val {
        Val::I64(val)
    }
}

impl From<f32> for Val {
    #[inline]
    fn from(val: f32) -> Val {
        Val::F32(val.to_bits())
    }
}

impl From<f64> for Val {
    #[inline]
    fn from(val: f64) -> Val {
        Val::F64(val.to_bits())
    }
}

impl From<u128> for Val {
    #[inline]
    fn from(val: u128) -> Val {
        Val::V128(val)
    }
}

impl From<Func> for Val {
    #[inline]
    fn from(val: Func) -> Val {
        Val::FuncRef(Some(val))
    }
}

impl From<Option<Func>> for Val {
    #[inline]
    fn from(val: Option<Func>) -> Val {
        Val::FuncRef(val)
    }
}
