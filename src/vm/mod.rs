// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime internals shared by both engines: the instance layout, linear
//! memories, tables, executable memory, builtin functions and the
//! host/guest call ABI.

mod builtins;
mod code_memory;
mod const_eval;
mod instance;
mod memory;
mod mmap;
mod table;
mod vmcontext;

pub use builtins::{
    atomic_cmpxchg_raw, atomic_load_raw, atomic_rmw_raw, atomic_store_raw, fops,
    interpreter_entry, memory_access, table_init_impl, BUILTINS,
};
pub use code_memory::CodeMemory;
pub use const_eval::ConstExprEvaluator;
pub use instance::{Imports, Instance};
pub use memory::Memory;
pub use mmap::Mmap;
pub use table::Table;
pub use vmcontext::{
    VMArrayCallFunction, VMBuiltinFunctionsArray, VMContext, VMFuncRef, VMFunctionImport,
    VMGlobal, VMMemoryDefinition, VMTableDefinition, VMVal, VMCONTEXT_MAGIC,
};

use crate::trap::TrapKind;
use crate::types::{GlobalType, TableType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Status word returned by every guest-to-host boundary crossing: zero for a
/// normal return, a trap kind plus one, or [`STATUS_HOST`] when the error
/// object has been parked in the store.
pub const STATUS_OK: u32 = 0;
/// A host function (or system-interface import) parked an error in the
/// store; includes orderly `proc_exit` exits.
pub const STATUS_HOST: u32 = 15;

#[inline]
pub fn status_from_trap(kind: TrapKind) -> u32 {
    u32::from(u8::from(kind)) + 1
}

#[inline]
pub fn trap_from_status(status: u32) -> Option<TrapKind> {
    let raw = u8::try_from(status.checked_sub(1)?).ok()?;
    TrapKind::try_from(raw).ok()
}

/// A cancellation token: polled by both engines at function entry (and loop
/// back-edges when enabled). Cancelling raises [`TrapKind::Cancelled`] in the
/// running guest.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(pub(crate) Arc<AtomicU32>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Clears a previous cancellation so the store can run guests again.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// A resolved entity exported from an instance.
#[derive(Debug, Clone)]
pub enum Export {
    Function(ExportedFunction),
    Table(ExportedTable),
    Memory(ExportedMemory),
    Global(ExportedGlobal),
}

#[derive(Debug, Copy, Clone)]
pub struct ExportedFunction {
    pub func_ref: *mut VMFuncRef,
}

// Safety: the funcref is owned by store-pinned instance state and only
// dereferenced under store access.
unsafe impl Send for ExportedFunction {}

#[derive(Debug, Clone)]
pub struct ExportedTable {
    /// Store-local table id.
    pub id: usize,
    pub ty: TableType,
}

#[derive(Debug, Clone)]
pub struct ExportedMemory {
    /// Store-local memory id.
    pub id: usize,
}

#[derive(Debug, Copy, Clone)]
pub struct ExportedGlobal {
    pub definition: *mut VMGlobal,
    pub ty: GlobalType,
}

// Safety: see `ExportedFunction`.
unsafe impl Send for ExportedGlobal {}
