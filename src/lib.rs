// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # tern, a WebAssembly virtual machine
//!
//! `tern` executes WebAssembly modules through one of two engines that share a
//! single frontend, instance layout and trap model:
//!
//! - a **compiler** engine that translates validated function bodies into
//!   native machine code in a single pass, and
//! - an **interpreter** engine that dispatches over the same pre-decoded
//!   operation stream.
//!
//! Both engines are selected once, at [`Engine`] construction, and are
//! behaviorally indistinguishable: identical results (including NaN bit
//! patterns), identical trap kinds, identical memory observation order.

#[macro_use]
mod utils;

mod compile;
mod config;
mod engine;
mod errors;
mod func;
mod global;
mod host;
mod indices;
mod instance;
mod interpreter;
mod linker;
mod memory;
mod module;
mod runtime;
mod store;
mod table;
mod translate;
mod trap;
mod types;
mod values;
mod vm;

pub use config::{Config, EngineKind, Features, InstanceConfig};
pub use engine::Engine;
pub use errors::{CompileError, Error};
pub use func::{Func, TypedFunc};
pub use global::Global;
pub use instance::Instance;
pub use linker::Linker;
pub use memory::Memory;
pub use module::Module;
pub use runtime::Runtime;
pub use store::Store;
pub use table::Table;
pub use trap::TrapKind;
pub use types::{ExternType, FuncType, GlobalType, MemoryType, TableType, ValType};
pub use values::Val;
pub use vm::CancelToken;

use crate::store::StoreOpaque;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Size of a WebAssembly page, in bytes.
pub const WASM_PAGE_SIZE: u64 = 1 << 16;
/// The number of pages we can have before we run out of 32-bit byte index
/// space.
pub const WASM32_MAX_PAGES: u64 = 1 << 16;
/// Maximum size, in bytes, of 32-bit memories (4G).
pub const WASM32_MAX_SIZE: u64 = 1 << 32;
/// Maximum size, in bytes, of WebAssembly stacks.
pub const MAX_WASM_STACK: usize = 512 * 1024;
/// Maximum interpreter call depth; sized so the dispatch loop's own frames
/// fit comfortably inside a default host thread stack. The compiler engine
/// bounds recursion by the stack-limit word instead.
pub const MAX_CALL_DEPTH: usize = 512;

/// A WebAssembly external value: any entity that can be imported or exported
/// between modules.
#[derive(Clone, Debug)]
pub enum Extern {
    Func(Func),
    Table(Table),
    Memory(Memory),
    Global(Global),
}

impl From<Func> for Extern {
    fn from(f: Func) -> Self {
        Extern::Func(f)
    }
}

impl From<Table> for Extern {
    fn from(t: Table) -> Self {
        Extern::Table(t)
    }
}

impl From<Memory> for Extern {
    fn from(m: Memory) -> Self {
        Extern::Memory(m)
    }
}

impl From<Global> for Extern {
    fn from(g: Global) -> Self {
        Extern::Global(g)
    }
}

// ===== impl Extern =====

impl Extern {
    pub(crate) fn ty(&self, store: &StoreOpaque) -> ExternType {
        match self {
            Extern::Func(f) => ExternType::Func(f.ty_opaque(store)),
            Extern::Table(t) => ExternType::Table(t.ty_opaque(store)),
            Extern::Memory(m) => ExternType::Memory(m.ty_opaque(store)),
            Extern::Global(g) => ExternType::Global(g.ty_opaque(store)),
        }
    }

    /// # Safety
    ///
    /// The caller must ensure `export` is a valid export within `store`.
    pub(crate) unsafe fn from_export(export: vm::Export, store: &mut StoreOpaque) -> Self {
        // Safety: ensured by caller
        unsafe {
            match export {
                vm::Export::Function(e) => Extern::Func(Func::from_exported_function(store, e)),
                vm::Export::Table(e) => Extern::Table(Table::from_exported_table(store, e)),
                vm::Export::Memory(e) => Extern::Memory(Memory::from_exported_memory(store, e)),
                vm::Export::Global(e) => Extern::Global(Global::from_exported_global(store, e)),
            }
        }
    }

    enum_accessors! {
        e
        (Func(&Func) is_func get_func unwrap_func e)
        (Table(&Table) is_table get_table unwrap_table e)
        (Memory(&Memory) is_memory get_memory unwrap_memory e)
        (Global(&Global) is_global get_global unwrap_global e)
    }

    owned_enum_accessors! {
        e
        (Func(Func) into_func e)
        (Table(Table) into_table e)
        (Memory(Memory) into_memory e)
        (Global(Global) into_global e)
    }
}
