// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The store: owner of all instantiation-time state.
//!
//! Instances, linear memories, tables and host functions live in store-owned
//! slabs and are referenced by index from the public handle types. The
//! opaque part is boxed so its address stays stable across moves of the
//! [`Store`] itself; `VMContext::store` points straight at it.

mod stored;

pub(crate) use stored::{Stored, StoredData};

use crate::engine::Engine;
use crate::errors::Error;
use crate::func::HostFuncData;
use crate::vm::{self, CancelToken};
use crate::{TrapKind, MAX_WASM_STACK};

/// A collection of instantiated WebAssembly state.
///
/// A store is not safe for concurrent mutation; callers serialize
/// invocations on it externally (or use one store per thread).
pub struct Store {
    opaque: Box<StoreOpaque>,
}

impl Store {
    pub fn new(engine: &Engine) -> Self {
        Self {
            opaque: Box::new(StoreOpaque {
                engine: engine.clone(),
                instances: Vec::new(),
                memories: Vec::new(),
                tables: Vec::new(),
                host_funcs: Vec::new(),
                stored: StoredData::default(),
                cancel: CancelToken::new(),
                pending_error: None,
                call_depth: 0,
            }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.opaque.engine
    }

    /// The cancellation token polled by every invocation made through this
    /// store. Clone it to another thread and call
    /// [`CancelToken::cancel`](crate::CancelToken::cancel) to interrupt a
    /// running guest.
    pub fn cancel_token(&self) -> CancelToken {
        self.opaque.cancel.clone()
    }

    pub(crate) fn opaque(&self) -> &StoreOpaque {
        &self.opaque
    }

    pub(crate) fn opaque_mut(&mut self) -> &mut StoreOpaque {
        &mut self.opaque
    }
}

impl core::fmt::Debug for Store {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("instances", &self.opaque.instances.len())
            .finish_non_exhaustive()
    }
}

pub struct StoreOpaque {
    engine: Engine,
    pub(crate) instances: Vec<vm::Instance>,
    pub(crate) memories: Vec<vm::Memory>,
    pub(crate) tables: Vec<vm::Table>,
    pub(crate) host_funcs: Vec<Box<HostFuncData>>,
    pub(crate) stored: StoredData,
    pub(crate) cancel: CancelToken,
    /// Error parked by a host function or system-interface import while the
    /// guest unwinds with [`vm::STATUS_HOST`].
    pub(crate) pending_error: Option<Error>,
    /// Re-entrant host↔guest crossings, bounded for the interpreter.
    pub(crate) call_depth: usize,
}

impl StoreOpaque {
    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn as_raw(&mut self) -> *mut StoreOpaque {
        self as *mut StoreOpaque
    }

    pub(crate) fn instance(&self, id: usize) -> &vm::Instance {
        &self.instances[id]
    }

    pub(crate) fn instance_mut(&mut self, id: usize) -> &mut vm::Instance {
        &mut self.instances[id]
    }

    pub(crate) fn memory(&self, id: usize) -> &vm::Memory {
        &self.memories[id]
    }

    pub(crate) fn memory_mut(&mut self, id: usize) -> &mut vm::Memory {
        &mut self.memories[id]
    }

    pub(crate) fn table(&self, id: usize) -> &vm::Table {
        &self.tables[id]
    }

    pub(crate) fn table_mut(&mut self, id: usize) -> &mut vm::Table {
        &mut self.tables[id]
    }

    /// Split borrow of two distinct tables (`table.copy` across tables).
    pub(crate) fn two_tables_mut(
        &mut self,
        dst: usize,
        src: usize,
    ) -> (&mut vm::Table, &vm::Table) {
        debug_assert_ne!(dst, src);
        if dst < src {
            let (a, b) = self.tables.split_at_mut(src);
            (&mut a[dst], &b[0])
        } else {
            let (a, b) = self.tables.split_at_mut(dst);
            (&mut b[0], &a[src])
        }
    }

    /// Parks `err` for retrieval after the guest unwinds, returning the
    /// status word the boundary crossing reports.
    pub(crate) fn park_error(&mut self, err: Error) -> u32 {
        self.pending_error = Some(err);
        vm::STATUS_HOST
    }

    /// Maps a nonzero status word back to the error it denotes.
    pub(crate) fn take_status(&mut self, status: u32) -> Error {
        debug_assert_ne!(status, vm::STATUS_OK);
        if status == vm::STATUS_HOST {
            self.pending_error
                .take()
                .unwrap_or_else(|| Error::trap(TrapKind::Unreachable))
        } else {
            match vm::trap_from_status(status) {
                Some(kind) => Error::trap(kind),
                None => unreachable!("invalid status word {status}"),
            }
        }
    }

    /// An approximation of the current stack limit for the next guest entry:
    /// everything deeper than `MAX_WASM_STACK` below the caller's frame
    /// traps with `StackExhausted`.
    pub(crate) fn stack_limit_for_entry(&self) -> usize {
        let approx_sp = &self as *const _ as usize;
        approx_sp.saturating_sub(MAX_WASM_STACK)
    }
}
