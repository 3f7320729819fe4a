// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable memory for generated code.
//!
//! Code is written into a writable mapping, then published: instruction
//! caches are flushed and the pages transition write→execute exactly once.
//! A module only becomes visible to instantiation after `publish` returns,
//! which establishes the happens-before relation for every thread that later
//! runs the code. Regions stay pinned (via `Arc`) for the lifetime of the
//! owning module's artifact and are unmapped on drop.

use crate::vm::mmap::Mmap;

#[derive(Debug)]
pub struct CodeMemory {
    mmap: Mmap,
    len: usize,
    published: bool,
}

impl CodeMemory {
    /// Copies `text` into a fresh writable mapping.
    pub fn new(text: &[u8]) -> crate::Result<Self> {
        let mut mmap = Mmap::new_accessible(text.len())?;
        if !text.is_empty() {
            mmap.slice_mut(0, text.len()).copy_from_slice(text);
        }
        Ok(Self {
            mmap,
            len: text.len(),
            published: false,
        })
    }

    /// Flushes instruction caches and makes the region executable. Must be
    /// called exactly once, before any entry point is derived from it.
    pub fn publish(&mut self) -> crate::Result<()> {
        assert!(!self.published, "code memory published twice");
        self.published = true;
        if self.len != 0 {
            clear_icache(self.mmap.as_ptr(), self.len);
            self.mmap.make_executable()?;
        }
        Ok(())
    }

    /// Base of the executable region.
    pub fn text_ptr(&self) -> *const u8 {
        assert!(self.published, "code memory used before publish");
        self.mmap.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        // x86_64 keeps instruction caches coherent with data writes; the
        // mprotect round-trip provides the serializing barrier.
        fn clear_icache(_ptr: *const u8, _len: usize) {}
    } else if #[cfg(target_arch = "aarch64")] {
        fn clear_icache(ptr: *const u8, len: usize) {
            // Clean the data cache to the point of unification, invalidate
            // the instruction cache, then synchronize. Cache line size is
            // conservatively assumed to be 64 bytes.
            const LINE: usize = 64;
            let start = ptr as usize & !(LINE - 1);
            let end = ptr as usize + len;
            unsafe {
                let mut addr = start;
                while addr < end {
                    core::arch::asm!("dc cvau, {0}", in(reg) addr, options(nostack, preserves_flags));
                    addr += LINE;
                }
                core::arch::asm!("dsb ish", options(nostack, preserves_flags));
                let mut addr = start;
                while addr < end {
                    core::arch::asm!("ic ivau, {0}", in(reg) addr, options(nostack, preserves_flags));
                    addr += LINE;
                }
                core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
            }
        }
    } else {
        fn clear_icache(_ptr: *const u8, _len: usize) {
            unreachable!("no compiler backend on this architecture");
        }
    }
}
