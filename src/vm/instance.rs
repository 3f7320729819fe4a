// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-instance state and its allocation.
//!
//! The layout is common between engines so that a module can be instantiated
//! by either. Every pointer installed into the [`VMContext`] targets a boxed
//! allocation owned by this instance (or by the store's entity slabs), so
//! moving the `Instance` value itself never invalidates generated code.

use crate::host::WasiCtx;
use crate::indices::{DataIndex, ElemIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex};
use crate::module::CachedModule;
use crate::store::StoreOpaque;
use crate::vm::{
    self, VMContext, VMFuncRef, VMFunctionImport, VMGlobal, VMMemoryDefinition,
    VMTableDefinition, VMCONTEXT_MAGIC,
};
use cranelift_entity::EntitySet;
use std::ptr;
use std::sync::Arc;

/// Resolved imports, in the order the module declared them.
#[derive(Default)]
pub struct Imports {
    pub functions: Vec<*const VMFuncRef>,
    /// `(store table id, definition)` pairs.
    pub tables: Vec<(usize, *mut VMTableDefinition)>,
    /// Store memory ids.
    pub memories: Vec<usize>,
    pub globals: Vec<*mut VMGlobal>,
}

pub struct Instance {
    pub module: Arc<CachedModule>,
    vmctx: Box<VMContext>,
    /// Store ids for the full memory index space, imported first.
    pub memory_ids: Box<[usize]>,
    /// Store ids for the full table index space, imported first.
    pub table_ids: Box<[usize]>,
    globals: Box<[VMGlobal]>,
    imported_globals: Box<[*mut VMGlobal]>,
    func_refs: Box<[VMFuncRef]>,
    imported_funcs: Box<[VMFunctionImport]>,
    table_defs: Box<[*mut VMTableDefinition]>,
    pub dropped_elements: EntitySet<ElemIndex>,
    pub dropped_data: EntitySet<DataIndex>,
    pub wasi: Option<WasiCtx>,
    pub closed: bool,
}

// Safety: the raw pointers all target store-owned or instance-owned
// allocations; cross-thread use is governed by the store's external
// serialization contract.
unsafe impl Send for Instance {}

impl Instance {
    /// Allocates the instance state into `store`, returning its store id.
    /// Segment initialization and the start function are the caller's
    /// (the linker's) responsibility.
    pub fn allocate(
        store: &mut StoreOpaque,
        module: Arc<CachedModule>,
        imports: Imports,
    ) -> crate::Result<usize> {
        let translated = &module.translated;
        let instance_id = store.instances.len();
        let guard_reserve = store.engine().config().guard_pages;

        // Defined memories and tables go into the store's slabs.
        let mut memory_ids = imports.memories.clone();
        for (index, ty) in translated.memories.iter() {
            if index.as_u32() < translated.num_imported_memories {
                continue;
            }
            let id = store.memories.len();
            store.memories.push(vm::Memory::new(ty, guard_reserve)?);
            memory_ids.push(id);
        }

        let mut table_ids: Vec<usize> = imports.tables.iter().map(|(id, _)| *id).collect();
        let mut table_defs: Vec<*mut VMTableDefinition> =
            imports.tables.iter().map(|(_, def)| *def).collect();
        for (index, ty) in translated.tables.iter() {
            if index.as_u32() < translated.num_imported_tables {
                continue;
            }
            let id = store.tables.len();
            store.tables.push(vm::Table::new(ty));
            table_defs.push(store.tables[id].def_ptr());
            table_ids.push(id);
        }

        let num_defined_globals =
            translated.globals.len() - translated.num_imported_globals as usize;
        let globals: Box<[VMGlobal]> = vec![VMGlobal::ZERO; num_defined_globals].into();
        let imported_globals: Box<[*mut VMGlobal]> = imports.globals.into();
        let imported_funcs: Box<[VMFunctionImport]> = imports
            .functions
            .iter()
            .map(|func_ref| VMFunctionImport { func_ref: *func_ref })
            .collect();

        // Funcrefs for escaping functions, placed at their FuncRefIndex (the
        // order they were flagged, not function order); instance vmctx
        // back-pointers are patched once the context exists.
        let mut func_refs: Box<[VMFuncRef]> = vec![
            VMFuncRef {
                array_call: vm::interpreter_entry,
                vmctx: ptr::null_mut(),
                type_index: u32::MAX,
                index: u32::MAX,
            };
            translated.num_escaped_functions as usize
        ]
        .into();
        for (index, desc) in translated.functions.iter() {
            if !desc.is_escaping() {
                continue;
            }
            let slot = desc.func_ref.as_u32() as usize;
            func_refs[slot] = match translated.defined_func_index(index) {
                Some(def_index) => VMFuncRef {
                    array_call: module.func_entry(def_index),
                    vmctx: ptr::null_mut(),
                    type_index: module.shared_signatures[desc.signature].as_u32(),
                    index: def_index.as_u32(),
                },
                None => {
                    // Imported escaping function: reuse the exporter's
                    // funcref wholesale.
                    let import = imports.functions[index.as_u32() as usize];
                    // Safety: resolved by the linker against a live
                    // exporting instance.
                    unsafe { *import }
                }
            };
        }

        let memory_def: *const VMMemoryDefinition = match memory_ids.first() {
            Some(&id) => store.memory(id).def_ptr(),
            None => ptr::null(),
        };

        let vmctx = Box::new(VMContext {
            magic: VMCONTEXT_MAGIC,
            instance: u32::try_from(instance_id).unwrap(),
            store: ptr::null_mut(),
            memory_def,
            globals: ptr::null_mut(),
            imported_globals: ptr::null(),
            func_refs: ptr::null_mut(),
            imported_funcs: ptr::null(),
            tables: ptr::null(),
            builtins: &vm::BUILTINS,
            stack_limit: 0,
            cancel: Arc::as_ptr(&store.cancel.0),
            trap: 0,
            _pad: 0,
        });

        let mut instance = Instance {
            module,
            vmctx,
            memory_ids: memory_ids.into(),
            table_ids: table_ids.into(),
            globals,
            imported_globals,
            func_refs,
            imported_funcs,
            table_defs: table_defs.into(),
            dropped_elements: EntitySet::new(),
            dropped_data: EntitySet::new(),
            wasi: None,
            closed: false,
        };

        let vmctx_ptr: *mut VMContext = &mut *instance.vmctx;
        instance.vmctx.globals = instance.globals.as_mut_ptr();
        instance.vmctx.imported_globals = instance.imported_globals.as_ptr();
        instance.vmctx.func_refs = instance.func_refs.as_mut_ptr();
        instance.vmctx.imported_funcs = instance.imported_funcs.as_ptr();
        instance.vmctx.tables = instance.table_defs.as_ptr();
        instance.vmctx.store = store.as_raw().cast();
        for func_ref in instance.func_refs.iter_mut() {
            if func_ref.vmctx.is_null() {
                func_ref.vmctx = vmctx_ptr;
            }
        }

        store.instances.push(instance);
        Ok(instance_id)
    }

    #[inline]
    pub fn vmctx_ptr(&self) -> *mut VMContext {
        (&*self.vmctx) as *const VMContext as *mut VMContext
    }

    pub fn global_ptr(&self, index: GlobalIndex) -> *mut VMGlobal {
        let translated = &self.module.translated;
        match translated.defined_global_index(index) {
            Some(def) => {
                let cell = &self.globals[def.as_u32() as usize];
                cell as *const VMGlobal as *mut VMGlobal
            }
            None => self.imported_globals[index.as_u32() as usize],
        }
    }

    /// The funcref of an escaping function.
    pub fn func_ref_ptr(&self, index: FuncIndex) -> *mut VMFuncRef {
        let translated = &self.module.translated;
        if translated.is_imported_function(index) {
            self.imported_funcs[index.as_u32() as usize].func_ref as *mut VMFuncRef
        } else {
            let desc = &translated.functions[index];
            debug_assert!(desc.is_escaping(), "took funcref of a private function");
            let cell = &self.func_refs[desc.func_ref.as_u32() as usize];
            cell as *const VMFuncRef as *mut VMFuncRef
        }
    }

    /// Funcref for any function index, imported or defined; used by the
    /// interpreter's call paths (the defined function need not escape).
    pub fn imported_func_ref(&self, index: FuncIndex) -> Option<*const VMFuncRef> {
        self.module
            .translated
            .is_imported_function(index)
            .then(|| self.imported_funcs[index.as_u32() as usize].func_ref)
    }

    pub fn table_id(&self, index: TableIndex) -> usize {
        self.table_ids[index.as_u32() as usize]
    }

    pub fn table_def(&self, index: TableIndex) -> *mut VMTableDefinition {
        self.table_defs[index.as_u32() as usize]
    }

    pub fn memory_id(&self, index: MemoryIndex) -> usize {
        self.memory_ids[index.as_u32() as usize]
    }

    pub fn memory0_id(&self) -> Option<usize> {
        self.memory_ids.first().copied()
    }
}

impl core::fmt::Debug for Instance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.module.translated.name)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
