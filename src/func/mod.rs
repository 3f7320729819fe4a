// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Function handles and the host↔guest boundary.
//!
//! Every callable, compiled, interpreted or host-defined, is reached
//! through a [`VMFuncRef`] and the array-call contract. The status word that
//! comes back is translated into a typed error exactly once, at this
//! boundary; generated code never unwinds.

mod host;
mod typed;

pub use typed::TypedFunc;

pub(crate) use host::{Caller, HostFn, HostFuncData, IntoFunc, HOST_CTX_MAGIC};

use crate::config::EngineKind;
use crate::indices::{DefinedFuncIndex, SharedTypeIndex};
use crate::store::{Store, StoreOpaque, Stored};
use crate::types::{FuncType, ValType};
use crate::vm::{self, ExportedFunction, VMContext, VMFuncRef, VMVal, STATUS_OK};
use crate::{Error, Val};
use std::ptr;

/// A WebAssembly or host function.
#[derive(Debug, Copy, Clone)]
pub struct Func(Stored<FuncData>);

#[derive(Debug, Clone)]
pub struct FuncData {
    pub(crate) kind: FuncKind,
    pub(crate) ty: FuncType,
    pub(crate) type_index: SharedTypeIndex,
    pub(crate) func_ref: *mut VMFuncRef,
}

// Safety: the funcref targets store-pinned state; all use happens under
// store access.
unsafe impl Send for FuncData {}

#[derive(Debug, Copy, Clone)]
pub(crate) enum FuncKind {
    Wasm { instance: usize },
    Host { index: usize },
}

impl Func {
    /// The function's type.
    pub fn ty(&self, store: &Store) -> FuncType {
        self.ty_opaque(store.opaque())
    }

    pub(crate) fn ty_opaque(&self, store: &StoreOpaque) -> FuncType {
        store[self.0].ty.clone()
    }

    /// Calls the function with `params`, writing into `results` (which must
    /// match the result arity). Traps, host errors and guest exits surface
    /// as typed errors.
    pub fn call(&self, store: &mut Store, params: &[Val], results: &mut [Val]) -> crate::Result<()> {
        self.call_opaque(store.opaque_mut(), params, results)
    }

    pub(crate) fn call_opaque(
        &self,
        store: &mut StoreOpaque,
        params: &[Val],
        results: &mut [Val],
    ) -> crate::Result<()> {
        let data = store[self.0].clone();
        let ty = &data.ty;

        if params.len() != ty.params().len() {
            return Err(Error::Link {
                module: String::new(),
                field: String::new(),
                message: format!(
                    "expected {} parameters, got {}",
                    ty.params().len(),
                    params.len()
                ),
            });
        }
        for (param, expected) in params.iter().zip(ty.params()) {
            if !param.matches_ty(*expected) {
                return Err(Error::Link {
                    module: String::new(),
                    field: String::new(),
                    message: format!("parameter type mismatch: expected {expected}"),
                });
            }
        }
        if results.len() != ty.results().len() {
            return Err(Error::Link {
                module: String::new(),
                field: String::new(),
                message: format!(
                    "expected buffer for {} results, got {}",
                    ty.results().len(),
                    results.len()
                ),
            });
        }

        let nvals = params.len().max(results.len()).max(1);
        let mut vals = vec![VMVal::ZERO; nvals];
        for (slot, param) in vals.iter_mut().zip(params) {
            *slot = param.to_vmval(store);
        }

        let result_types: Vec<ValType> = ty.results().to_vec();
        let status = self.invoke_raw(store, &data, &mut vals)?;
        if status != STATUS_OK {
            return Err(store.take_status(status));
        }

        for (i, ty) in result_types.iter().enumerate() {
            // Safety: the callee wrote a value of its declared result type.
            results[i] = unsafe { Val::from_vmval(store, vals[i], *ty) };
        }
        Ok(())
    }

    fn invoke_raw(
        &self,
        store: &mut StoreOpaque,
        data: &FuncData,
        vals: &mut [VMVal],
    ) -> crate::Result<u32> {
        if let FuncKind::Wasm { instance } = data.kind {
            if store.instance(instance).closed {
                return Err(Error::Closed);
            }
            let vmctx = store.instance(instance).vmctx_ptr();
            // Fresh entry bookkeeping: stack limit and a clean trap word.
            // Safety: vmctx is pinned instance state.
            unsafe {
                (*vmctx).stack_limit = store.stack_limit_for_entry();
                (*vmctx).trap = 0;
            }
        }

        // Safety: funcref and store are live; vals sized per arity above.
        let status = unsafe {
            invoke_func_ref(
                store.as_raw(),
                data.func_ref,
                ptr::null_mut(),
                vals.as_mut_ptr(),
                vals.len(),
            )
        };
        Ok(status)
    }

    /// A statically-typed view of this function.
    pub fn typed<P, R>(&self, store: &Store) -> crate::Result<TypedFunc<P, R>>
    where
        P: typed::WasmParams,
        R: typed::WasmResults,
    {
        TypedFunc::new(*self, store.opaque())
    }


    pub(crate) fn vm_func_ref(&self, store: &mut StoreOpaque) -> *mut VMFuncRef {
        store[self.0].func_ref
    }

    pub(crate) fn type_index(&self, store: &StoreOpaque) -> SharedTypeIndex {
        store[self.0].type_index
    }

    /// Recovers a `Func` from a raw funcref (e.g. a table element handed to
    /// the host).
    ///
    /// # Safety
    ///
    /// `func_ref` must be null or a live funcref owned by `store`.
    pub(crate) unsafe fn from_vm_func_ref(
        store: &mut StoreOpaque,
        func_ref: *mut VMFuncRef,
    ) -> Option<Func> {
        if func_ref.is_null() {
            return None;
        }
        // Safety: per contract.
        Some(unsafe { Self::from_raw_func_ref(store, func_ref) })
    }

    /// # Safety
    ///
    /// `export.func_ref` must be a live funcref owned by `store`.
    pub(crate) unsafe fn from_exported_function(
        store: &mut StoreOpaque,
        export: ExportedFunction,
    ) -> Func {
        // Safety: per contract.
        unsafe { Self::from_raw_func_ref(store, export.func_ref) }
    }

    unsafe fn from_raw_func_ref(store: &mut StoreOpaque, func_ref: *mut VMFuncRef) -> Func {
        // Safety: per caller contract.
        let fr = unsafe { &*func_ref };
        let type_index = SharedTypeIndex::from_u32(fr.type_index);
        let ty = store.engine().type_registry().lookup(type_index);

        // Safety: both host headers and instance contexts lead with their
        // magic word.
        let kind = unsafe {
            if *(fr.vmctx as *const u32) == HOST_CTX_MAGIC {
                FuncKind::Host {
                    index: fr.index as usize,
                }
            } else {
                debug_assert_eq!((*fr.vmctx).magic, vm::VMCONTEXT_MAGIC);
                FuncKind::Wasm {
                    instance: (*fr.vmctx).instance as usize,
                }
            }
        };

        let stored = store.add_function(FuncData {
            kind,
            ty,
            type_index,
            func_ref,
        });
        Func(stored)
    }
}

/// Invokes any funcref with the array-call contract, dispatching on what is
/// behind it: host closure, interpreted function, or native code.
///
/// # Safety
///
/// `store` and `func_ref` must be live; `vals` must have room for
/// `max(params, results)` slots of the callee's signature.
pub(crate) unsafe fn invoke_func_ref(
    store: *mut StoreOpaque,
    func_ref: *mut VMFuncRef,
    caller_vmctx: *mut VMContext,
    vals: *mut VMVal,
    nvals: usize,
) -> u32 {
    // Safety: per contract.
    unsafe {
        let fr = &*func_ref;
        if *(fr.vmctx as *const u32) == HOST_CTX_MAGIC {
            let header = &*(fr.vmctx as *const host::HostFuncHeader);
            let caller_instance = if caller_vmctx.is_null() {
                None
            } else {
                Some((*caller_vmctx).instance as usize)
            };
            return host::host_invoke(store, &*header.data, caller_instance, vals, nvals);
        }

        debug_assert_eq!((*fr.vmctx).magic, vm::VMCONTEXT_MAGIC);
        match (*store).engine().strategy() {
            EngineKind::Interpreter => crate::interpreter::invoke(
                store,
                (*fr.vmctx).instance as usize,
                DefinedFuncIndex::from_u32(fr.index),
                vals,
                nvals,
            ),
            EngineKind::Compiler => {
                let caller = if caller_vmctx.is_null() {
                    fr.vmctx
                } else {
                    caller_vmctx
                };
                (fr.array_call)(fr.vmctx, caller, vals, nvals)
            }
        }
    }
}
