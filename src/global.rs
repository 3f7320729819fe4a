// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::{Store, StoreOpaque, Stored};
use crate::types::GlobalType;
use crate::vm::{ExportedGlobal, VMGlobal};
use crate::{Error, Val};

/// A WebAssembly global.
#[derive(Debug, Copy, Clone)]
pub struct Global(Stored<ExportedGlobal>);

impl Global {
    pub fn ty(&self, store: &Store) -> GlobalType {
        self.ty_opaque(store.opaque())
    }

    pub(crate) fn ty_opaque(&self, store: &StoreOpaque) -> GlobalType {
        store[self.0].ty
    }

    pub fn get(&self, store: &mut Store) -> Val {
        let store = store.opaque_mut();
        let export = store[self.0];
        // Safety: global cells are pinned for the store's life.
        let raw = unsafe { (*export.definition).to_vmval() };
        unsafe { Val::from_vmval(store, raw, export.ty.content) }
    }

    pub fn set(&self, store: &mut Store, value: Val) -> crate::Result<()> {
        let store = store.opaque_mut();
        let export = store[self.0];
        if !export.ty.mutable {
            return Err(Error::Link {
                module: String::new(),
                field: String::new(),
                message: "cannot set an immutable global".into(),
            });
        }
        if !value.matches_ty(export.ty.content) {
            return Err(Error::Link {
                module: String::new(),
                field: String::new(),
                message: format!("global type mismatch: expected {}", export.ty.content),
            });
        }
        let raw = value.to_vmval(store);
        // Safety: as in `get`.
        unsafe { *export.definition = VMGlobal::from_vmval(raw) };
        Ok(())
    }

    pub(crate) fn from_exported_global(store: &mut StoreOpaque, export: ExportedGlobal) -> Self {
        Self(store.add_global(export))
    }

    pub(crate) fn definition(&self, store: &StoreOpaque) -> *mut VMGlobal {
        store[self.0].definition
    }
}
