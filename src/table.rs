// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::{Store, StoreOpaque, Stored};
use crate::types::TableType;
use crate::vm::ExportedTable;
use crate::{Error, Func, TrapKind, Val};
use std::ptr;

/// A WebAssembly table of function references.
#[derive(Debug, Copy, Clone)]
pub struct Table(Stored<ExportedTable>);

impl Table {
    pub fn ty(&self, store: &Store) -> TableType {
        self.ty_opaque(store.opaque())
    }

    pub(crate) fn ty_opaque(&self, store: &StoreOpaque) -> TableType {
        store[self.0].ty
    }

    pub fn size(&self, store: &Store) -> u64 {
        let id = store.opaque()[self.0].id;
        store.opaque().table(id).size()
    }

    pub fn get(&self, store: &mut Store, index: u64) -> Option<Val> {
        let store = store.opaque_mut();
        let id = store[self.0].id;
        let element = store.table(id).get(index)?;
        // Safety: table elements are live funcrefs owned by this store.
        Some(Val::FuncRef(unsafe {
            Func::from_vm_func_ref(store, element)
        }))
    }

    pub fn set(&self, store: &mut Store, index: u64, value: Val) -> crate::Result<()> {
        let store = store.opaque_mut();
        let id = store[self.0].id;
        let element = match value {
            Val::FuncRef(None) => ptr::null_mut(),
            Val::FuncRef(Some(f)) => f.vm_func_ref(store),
            _ => {
                return Err(Error::Link {
                    module: String::new(),
                    field: String::new(),
                    message: "table elements must be function references".into(),
                })
            }
        };
        if store.table_mut(id).set(index, element) {
            Ok(())
        } else {
            Err(Error::trap(TrapKind::OutOfBounds))
        }
    }

    pub fn grow(&self, store: &mut Store, delta: u64, init: Val) -> crate::Result<u64> {
        let store = store.opaque_mut();
        let id = store[self.0].id;
        let element = match init {
            Val::FuncRef(None) => ptr::null_mut(),
            Val::FuncRef(Some(f)) => f.vm_func_ref(store),
            _ => {
                return Err(Error::Link {
                    module: String::new(),
                    field: String::new(),
                    message: "table elements must be function references".into(),
                })
            }
        };
        store
            .table_mut(id)
            .grow(delta, element)
            .ok_or(Error::trap(TrapKind::OutOfBounds))
    }

    pub(crate) fn from_exported_table(store: &mut StoreOpaque, export: ExportedTable) -> Self {
        Self(store.add_table(export))
    }

    pub(crate) fn store_id(&self, store: &StoreOpaque) -> usize {
        store[self.0].id
    }
}
