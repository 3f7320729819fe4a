// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::EntityIndex;
use crate::store::{Store, StoreOpaque, Stored};
use crate::vm::{Export, ExportedFunction, ExportedGlobal, ExportedMemory, ExportedTable};
use crate::{Extern, Func, Memory};

/// An instantiated WebAssembly module.
#[derive(Debug, Copy, Clone)]
pub struct Instance(Stored<InstanceData>);

#[derive(Debug)]
pub struct InstanceData {
    /// Store id of the backing `vm::Instance`.
    pub id: usize,
}

impl Instance {
    pub(crate) fn from_id(store: &mut StoreOpaque, id: usize) -> Instance {
        Instance(store.add_instance(InstanceData { id }))
    }

    pub(crate) fn id(&self, store: &StoreOpaque) -> usize {
        store[self.0].id
    }

    /// Looks up an export by name.
    pub fn get_export(&self, store: &mut StoreOpaque, name: &str) -> Option<Extern> {
        let id = self.id(store);
        let vm_instance = store.instance(id);
        let translated = &vm_instance.module.translated;
        let index = *translated.exports.get(name)?;

        let export = match index {
            EntityIndex::Function(index) => Export::Function(ExportedFunction {
                func_ref: vm_instance.func_ref_ptr(index),
            }),
            EntityIndex::Table(index) => Export::Table(ExportedTable {
                id: vm_instance.table_id(index),
                ty: translated.tables[index],
            }),
            EntityIndex::Memory(index) => Export::Memory(ExportedMemory {
                id: vm_instance.memory_id(index),
            }),
            EntityIndex::Global(index) => Export::Global(ExportedGlobal {
                definition: vm_instance.global_ptr(index),
                ty: translated.globals[index],
            }),
        };
        // Safety: resolved against this store's own instance.
        Some(unsafe { Extern::from_export(export, store) })
    }

    /// Looks up an exported function by name, or `None` if the export is
    /// missing or not a function.
    pub fn function(&self, store: &mut Store, name: &str) -> Option<Func> {
        self.get_func(store.opaque_mut(), name)
    }

    pub(crate) fn get_func(&self, store: &mut StoreOpaque, name: &str) -> Option<Func> {
        self.get_export(store, name)?.into_func()
    }

    pub fn get_memory(&self, store: &mut Store, name: &str) -> Option<Memory> {
        self.get_export(store.opaque_mut(), name)?.into_memory()
    }

    /// The names of all exports.
    pub fn exports(&self, store: &Store) -> Vec<String> {
        self.exports_opaque(store.opaque())
    }

    pub(crate) fn exports_opaque(&self, store: &StoreOpaque) -> Vec<String> {
        let id = self.id(store);
        store
            .instance(id)
            .module
            .translated
            .exports
            .keys()
            .cloned()
            .collect()
    }

    /// Marks the instance closed: subsequent invocations of its functions
    /// fail with [`Error::Closed`](crate::Error::Closed). Idempotent.
    pub fn close(&self, store: &mut Store) {
        let id = self.id(store.opaque());
        store.opaque_mut().instance_mut(id).closed = true;
    }

    pub fn is_closed(&self, store: &Store) -> bool {
        let id = self.id(store.opaque());
        store.opaque().instance(id).closed
    }

}
