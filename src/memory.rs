// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::{Store, StoreOpaque, Stored};
use crate::types::MemoryType;
use crate::vm::ExportedMemory;
use crate::{Error, TrapKind};

/// A WebAssembly linear memory.
#[derive(Debug, Copy, Clone)]
pub struct Memory(Stored<ExportedMemory>);

impl Memory {
    pub fn ty(&self, store: &Store) -> MemoryType {
        self.ty_opaque(store.opaque())
    }

    pub(crate) fn ty_opaque(&self, store: &StoreOpaque) -> MemoryType {
        let export = &store[self.0];
        store.memory(export.id).ty()
    }

    /// Current size in pages.
    pub fn size(&self, store: &Store) -> u64 {
        let export = &store.opaque()[self.0];
        store.opaque().memory(export.id).size_in_pages()
    }

    /// Grows the memory by `delta` pages, returning the previous size in
    /// pages or an error if the limits do not permit it.
    pub fn grow(&self, store: &mut Store, delta: u64) -> crate::Result<u64> {
        let store = store.opaque_mut();
        let id = store[self.0].id;
        match store.memory_mut(id).grow(delta)? {
            Some(prev) => Ok(prev),
            None => Err(Error::trap(TrapKind::OutOfBounds)),
        }
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    pub fn read(&self, store: &Store, offset: usize, buf: &mut [u8]) -> crate::Result<()> {
        let export = &store.opaque()[self.0];
        let data = store.opaque().memory(export.id).slice();
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or(Error::trap(TrapKind::OutOfBounds))?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Writes `data` starting at `offset`.
    pub fn write(&self, store: &mut Store, offset: usize, data: &[u8]) -> crate::Result<()> {
        let store = store.opaque_mut();
        let id = store[self.0].id;
        let mem = store.memory_mut(id).slice_mut();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= mem.len())
            .ok_or(Error::trap(TrapKind::OutOfBounds))?;
        mem[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// A snapshot view of the memory contents.
    pub fn data<'a>(&self, store: &'a Store) -> &'a [u8] {
        let export = &store.opaque()[self.0];
        store.opaque().memory(export.id).slice()
    }

    pub(crate) fn from_exported_memory(store: &mut StoreOpaque, export: ExportedMemory) -> Self {
        Self(store.add_memory(export))
    }

    pub(crate) fn store_id(&self, store: &StoreOpaque) -> usize {
        store[self.0].id
    }
}

