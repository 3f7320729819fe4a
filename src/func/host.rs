// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host-defined functions.
//!
//! A host function materializes in the store as a [`HostFuncData`] box whose
//! embedded header doubles as the funcref's "context": the header leads with
//! a magic word distinct from [`VMCONTEXT_MAGIC`], which is how the call
//! dispatch tells host functions from wasm functions.

use crate::func::{Func, FuncData, FuncKind};
use crate::host::WasiCtx;
use crate::indices::SharedTypeIndex;
use crate::store::StoreOpaque;
use crate::types::{FuncType, ValType};
use crate::vm::{VMContext, VMFuncRef, VMVal, STATUS_OK};
use crate::TrapKind;
use smallvec::SmallVec;
use std::ptr;

pub const HOST_CTX_MAGIC: u32 = u32::from_le_bytes(*b"host");

/// The closure type every host function is erased to.
pub type HostFn =
    dyn Fn(&mut Caller<'_>, &[VMVal], &mut [VMVal]) -> crate::Result<()> + Send + Sync;

/// First field of [`HostFuncData`]; what a host funcref's `vmctx` points at.
#[repr(C)]
#[derive(Debug)]
pub struct HostFuncHeader {
    pub magic: u32,
    _pad: u32,
    pub data: *const HostFuncData,
}

pub struct HostFuncData {
    pub header: HostFuncHeader,
    pub ty: FuncType,
    pub type_index: SharedTypeIndex,
    pub func_ref: VMFuncRef,
    pub closure: Box<HostFn>,
}

// Safety: the self-referential pointers target the same heap box; access is
// serialized through the store.
unsafe impl Send for HostFuncData {}

impl core::fmt::Debug for HostFuncData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostFuncData")
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

impl StoreOpaque {
    /// Materializes a host function into this store, returning its handle.
    pub(crate) fn define_host_func(&mut self, ty: FuncType, closure: Box<HostFn>) -> Func {
        let type_index = self.engine().type_registry().intern(&ty);
        let index = self.host_funcs.len();

        let mut data = Box::new(HostFuncData {
            header: HostFuncHeader {
                magic: HOST_CTX_MAGIC,
                _pad: 0,
                data: ptr::null(),
            },
            ty: ty.clone(),
            type_index,
            func_ref: VMFuncRef {
                array_call: host_entry,
                vmctx: ptr::null_mut(),
                type_index: type_index.as_u32(),
                index: u32::try_from(index).unwrap(),
            },
            closure,
        });
        data.header.data = &*data;
        data.func_ref.vmctx = (&data.header) as *const HostFuncHeader as *mut VMContext;
        self.host_funcs.push(data);

        let func_ref = (&mut self.host_funcs[index].func_ref) as *mut VMFuncRef;
        let stored = self.add_function(FuncData {
            kind: FuncKind::Host { index },
            ty,
            type_index,
            func_ref,
        });
        Func(stored)
    }
}

/// View of the calling context handed to host functions.
pub struct Caller<'a> {
    pub(crate) store: &'a mut StoreOpaque,
    /// Store id of the instance whose code made the call, if any.
    pub(crate) instance: Option<usize>,
}

impl<'a> Caller<'a> {
    /// The caller's linear memory 0, if the calling instance has one.
    pub(crate) fn memory_mut(&mut self) -> Option<&mut [u8]> {
        let instance = self.instance?;
        let id = self.store.instance(instance).memory0_id()?;
        Some(self.store.memory_mut(id).slice_mut())
    }

    /// Temporarily detaches the caller's system-interface context; pair with
    /// [`Caller::put_back_wasi`] so memory and context can be used together.
    pub(crate) fn take_wasi(&mut self) -> Option<WasiCtx> {
        let instance = self.instance?;
        self.store.instance_mut(instance).wasi.take()
    }

    pub(crate) fn put_back_wasi(&mut self, wasi: WasiCtx) {
        if let Some(instance) = self.instance {
            self.store.instance_mut(instance).wasi = Some(wasi);
        }
    }
}

/// The array-call entry installed on host funcrefs; used when *generated
/// code* calls an imported host function.
///
/// # Safety
///
/// Reached only through the array-call contract with a host-function header
/// as the callee context and a live instance context as the caller.
pub unsafe extern "C" fn host_entry(
    callee: *mut VMContext,
    caller: *mut VMContext,
    vals: *mut VMVal,
    nvals: usize,
) -> u32 {
    // Safety: per contract.
    unsafe {
        let header = &*(callee as *const HostFuncHeader);
        debug_assert_eq!(header.magic, HOST_CTX_MAGIC);
        debug_assert!(!caller.is_null());
        let store = (*caller).store.cast::<StoreOpaque>();
        host_invoke(
            store,
            &*header.data,
            Some((*caller).instance as usize),
            vals,
            nvals,
        )
    }
}

/// Shared host-call core: unpack arguments, run the closure, park errors.
///
/// # Safety
///
/// `store` and `data` must be live; `vals` sized per the function's arity.
pub(crate) unsafe fn host_invoke(
    store: *mut StoreOpaque,
    data: &HostFuncData,
    caller_instance: Option<usize>,
    vals: *mut VMVal,
    nvals: usize,
) -> u32 {
    let num_params = data.ty.params().len();
    let num_results = data.ty.results().len();
    debug_assert!(nvals >= num_params.max(num_results));

    // Safety: per contract.
    let params: SmallVec<[VMVal; 8]> = unsafe {
        (0..num_params).map(|i| *vals.add(i)).collect()
    };
    let mut results: SmallVec<[VMVal; 8]> = SmallVec::from_elem(VMVal::ZERO, num_results);

    // Safety: the guest is suspended for the duration of this call, so the
    // exclusive re-borrow of the store is sound.
    let store_ref = unsafe { &mut *store };
    if store_ref.cancel.is_cancelled() {
        return crate::vm::status_from_trap(TrapKind::Cancelled);
    }
    let mut caller = Caller {
        store: store_ref,
        instance: caller_instance,
    };

    match (data.closure)(&mut caller, &params, &mut results) {
        Ok(()) => {
            for (i, v) in results.iter().enumerate() {
                // Safety: per contract.
                unsafe { *vals.add(i) = *v };
            }
            STATUS_OK
        }
        // Safety: store still live.
        Err(err) => unsafe { (*store).park_error(err) },
    }
}

// ===== typed host-function construction =====

/// Closed-over host functions with statically typed parameters and results,
/// the `Linker::func_wrap` surface.
pub trait IntoFunc<Params, Results>: Send + Sync + 'static {
    fn ty() -> FuncType;
    fn into_host_fn(self) -> Box<HostFn>;
}

/// A value a typed host closure may return.
pub trait HostResult {
    fn result_types() -> Vec<ValType>;
    fn store_results(self, out: &mut [VMVal]) -> crate::Result<()>;
}

impl HostResult for () {
    fn result_types() -> Vec<ValType> {
        Vec::new()
    }
    fn store_results(self, _out: &mut [VMVal]) -> crate::Result<()> {
        Ok(())
    }
}

impl<T: super::typed::WasmTy> HostResult for T {
    fn result_types() -> Vec<ValType> {
        vec![T::TY]
    }
    fn store_results(self, out: &mut [VMVal]) -> crate::Result<()> {
        out[0] = self.into_vmval();
        Ok(())
    }
}

impl<T: HostResult> HostResult for crate::Result<T> {
    fn result_types() -> Vec<ValType> {
        T::result_types()
    }
    fn store_results(self, out: &mut [VMVal]) -> crate::Result<()> {
        self?.store_results(out)
    }
}

macro_rules! impl_into_func {
    ($($args:ident)*) => {
        // Plain closure.
        impl<F, R, $($args,)*> IntoFunc<($($args,)*), R> for F
        where
            F: Fn($($args),*) -> R + Send + Sync + 'static,
            R: HostResult,
            $($args: super::typed::WasmTy,)*
        {
            fn ty() -> FuncType {
                FuncType::new([$($args::TY),*], R::result_types())
            }

            #[allow(non_snake_case, unused_variables, unused_mut, unused_assignments)]
            fn into_host_fn(self) -> Box<HostFn> {
                Box::new(move |_caller, params, results| {
                    let mut i = 0;
                    $(
                        let $args = $args::from_vmval(params[i]);
                        i += 1;
                    )*
                    self($($args),*).store_results(results)
                })
            }
        }

        // Closure taking a leading `&mut Caller`.
        impl<F, R, $($args,)*> IntoFunc<(Caller<'static>, $($args,)*), R> for F
        where
            F: Fn(&mut Caller<'_>, $($args),*) -> R + Send + Sync + 'static,
            R: HostResult,
            $($args: super::typed::WasmTy,)*
        {
            fn ty() -> FuncType {
                FuncType::new([$($args::TY),*], R::result_types())
            }

            #[allow(non_snake_case, unused_variables, unused_mut, unused_assignments)]
            fn into_host_fn(self) -> Box<HostFn> {
                Box::new(move |caller, params, results| {
                    let mut i = 0;
                    $(
                        let $args = $args::from_vmval(params[i]);
                        i += 1;
                    )*
                    self(caller, $($args),*).store_results(results)
                })
            }
        }
    };
}

impl_into_func!();
impl_into_func!(A1);
impl_into_func!(A1 A2);
impl_into_func!(A1 A2 A3);
impl_into_func!(A1 A2 A3 A4);
impl_into_func!(A1 A2 A3 A4 A5);
impl_into_func!(A1 A2 A3 A4 A5 A6);
