// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Statically typed function handles.

use crate::func::Func;
use crate::store::{Store, StoreOpaque};
use crate::types::ValType;
use crate::vm::{VMVal, STATUS_OK};
use crate::Error;
use core::marker::PhantomData;

/// A [`Func`] whose parameter and result types were checked once, up front.
pub struct TypedFunc<Params, Results> {
    func: Func,
    _m: PhantomData<fn(Params) -> Results>,
}

impl<Params, Results> Copy for TypedFunc<Params, Results> {}
impl<Params, Results> Clone for TypedFunc<Params, Results> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Params, Results> TypedFunc<Params, Results>
where
    Params: WasmParams,
    Results: WasmResults,
{
    pub(crate) fn new(func: Func, store: &StoreOpaque) -> crate::Result<Self> {
        let ty = func.ty_opaque(store);
        if ty.params() != Params::types().as_slice() || ty.results() != Results::types().as_slice()
        {
            return Err(Error::Link {
                module: String::new(),
                field: String::new(),
                message: format!("function has type {ty}"),
            });
        }
        Ok(Self {
            func,
            _m: PhantomData,
        })
    }

    pub fn func(&self) -> Func {
        self.func
    }

    pub fn call(&self, store: &mut Store, params: Params) -> crate::Result<Results> {
        self.call_opaque(store.opaque_mut(), params)
    }

    pub(crate) fn call_opaque(
        &self,
        store: &mut StoreOpaque,
        params: Params,
    ) -> crate::Result<Results> {
        let num_params = Params::types().len();
        let num_results = Results::types().len();
        let mut vals = vec![VMVal::ZERO; num_params.max(num_results).max(1)];
        params.store_params(&mut vals);

        let data = store[self.func.0].clone();
        let status = self.func.invoke_raw(store, &data, &mut vals)?;
        if status != STATUS_OK {
            return Err(store.take_status(status));
        }
        Ok(Results::load_results(&vals))
    }
}

/// A primitive value that crosses the typed host boundary.
pub trait WasmTy: Copy + Send + 'static {
    const TY: ValType;
    fn into_vmval(self) -> VMVal;
    fn from_vmval(val: VMVal) -> Self;
}

macro_rules! impl_wasm_ty {
    ($($ty:ty => $valty:ident, $into:expr, $from:expr;)*) => {
        $(
            impl WasmTy for $ty {
                const TY: ValType = ValType::$valty;
                #[inline]
                fn into_vmval(self) -> VMVal {
                    let f: fn($ty) -> VMVal = $into;
                    f(self)
                }
                #[inline]
                fn from_vmval(val: VMVal) -> Self {
                    let f: fn(VMVal) -> $ty = $from;
                    f(val)
                }
            }
        )*
    };
}

impl_wasm_ty! {
    i32 => I32, VMVal::i32, |v: VMVal| v.get_i32();
    u32 => I32, |v: u32| VMVal::i32(v as i32), |v: VMVal| v.get_i32() as u32;
    i64 => I64, VMVal::i64, |v: VMVal| v.get_i64();
    u64 => I64, |v: u64| VMVal::u64(v), |v: VMVal| v.get_u64();
    f32 => F32, |v: f32| VMVal::f32(v.to_bits()), |v: VMVal| f32::from_bits(v.get_f32());
    f64 => F64, |v: f64| VMVal::f64(v.to_bits()), |v: VMVal| f64::from_bits(v.get_f64());
}

/// Parameter tuples.
pub trait WasmParams: Send {
    fn types() -> Vec<ValType>;
    fn store_params(self, out: &mut [VMVal]);
}

/// Result types: unit, a single value, or a tuple.
pub trait WasmResults: Send {
    fn types() -> Vec<ValType>;
    fn load_results(vals: &[VMVal]) -> Self;
}

impl<T: WasmTy> WasmParams for T {
    fn types() -> Vec<ValType> {
        vec![T::TY]
    }
    fn store_params(self, out: &mut [VMVal]) {
        out[0] = self.into_vmval();
    }
}

impl<T: WasmTy> WasmResults for T {
    fn types() -> Vec<ValType> {
        vec![T::TY]
    }
    fn load_results(vals: &[VMVal]) -> Self {
        T::from_vmval(vals[0])
    }
}

macro_rules! impl_wasm_tuples {
    ($(($($t:ident),*);)*) => {
        $(
            #[allow(non_snake_case, unused_variables, unused_mut, unused_assignments)]
            impl<$($t: WasmTy),*> WasmParams for ($($t,)*) {
                fn types() -> Vec<ValType> {
                    vec![$($t::TY),*]
                }
                fn store_params(self, out: &mut [VMVal]) {
                    let ($($t,)*) = self;
                    let mut i = 0;
                    $(
                        out[i] = $t.into_vmval();
                        i += 1;
                    )*
                }
            }

            #[allow(non_snake_case, unused_variables, unused_mut, unused_assignments)]
            impl<$($t: WasmTy),*> WasmResults for ($($t,)*) {
                fn types() -> Vec<ValType> {
                    vec![$($t::TY),*]
                }
                fn load_results(vals: &[VMVal]) -> Self {
                    let mut i = 0;
                    ($(
                        {
                            let v = $t::from_vmval(vals[i]);
                            i += 1;
                            v
                        },
                    )*)
                }
            }
        )*
    };
}

impl_wasm_tuples! {
    ();
    (A1, A2);
    (A1, A2, A3);
    (A1, A2, A3, A4);
    (A1, A2, A3, A4, A5);
    (A1, A2, A3, A4, A5, A6);
}
