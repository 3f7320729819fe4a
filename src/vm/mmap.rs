// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page-aligned anonymous mappings.
//!
//! The thin layer every region of guest-visible memory goes through: linear
//! memories, executable code. Supports address-space reservation
//! (inaccessible until committed) so memory bases can stay stable across
//! growth.

use crate::Error;
use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};
use std::ptr::{self, NonNull};

/// An owned anonymous mapping. The length is always a multiple of the page
/// size; a zero-length `Mmap` owns no mapping at all.
#[derive(Debug)]
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is owned; concurrent access is governed by the
// users (shared memories serialize growth themselves).
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Rounds `len` up to the page size.
pub fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    len.checked_add(page - 1).expect("mapping size overflow") & !(page - 1)
}

impl Mmap {
    pub fn new_empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    /// Maps `len` bytes of zeroed read-write memory.
    pub fn new_accessible(len: usize) -> crate::Result<Self> {
        Self::with_prot(len, ProtFlags::READ | ProtFlags::WRITE)
    }

    /// Reserves `len` bytes of address space with no access rights. Commit
    /// ranges later with [`Mmap::make_accessible`].
    pub fn reserve(len: usize) -> crate::Result<Self> {
        Self::with_prot(len, ProtFlags::empty())
    }

    fn with_prot(len: usize, prot: ProtFlags) -> crate::Result<Self> {
        if len == 0 {
            return Ok(Self::new_empty());
        }
        let len = round_up_to_page(len);
        // Safety: requesting a fresh anonymous private mapping.
        let ptr = unsafe { mmap_anonymous(ptr::null_mut(), len, prot, MapFlags::PRIVATE) }
            .map_err(Error::Mmap)?;
        Ok(Self {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Commits `[start, start + len)` as read-write. Offsets must be
    /// page-aligned and in bounds.
    pub fn make_accessible(&mut self, start: usize, len: usize) -> crate::Result<()> {
        let page = page_size();
        assert_eq!(start % page, 0);
        assert_eq!(len % page, 0);
        assert!(start.checked_add(len).is_some_and(|end| end <= self.len));
        // Safety: the range is within our own mapping.
        unsafe {
            mprotect(
                self.ptr.as_ptr().add(start).cast(),
                len,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        }
        .map_err(Error::Mmap)
    }

    /// Transitions the whole mapping to read+execute.
    pub fn make_executable(&self) -> crate::Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        // Safety: protecting our own mapping.
        unsafe {
            mprotect(
                self.ptr.as_ptr().cast(),
                self.len,
                MprotectFlags::READ | MprotectFlags::EXEC,
            )
        }
        .map_err(Error::Mmap)
    }

    pub fn slice(&self, start: usize, len: usize) -> &[u8] {
        assert!(start.checked_add(len).is_some_and(|end| end <= self.len));
        // Safety: in-bounds, and the mapping lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), len) }
    }

    pub fn slice_mut(&mut self, start: usize, len: usize) -> &mut [u8] {
        assert!(start.checked_add(len).is_some_and(|end| end <= self.len));
        // Safety: in-bounds, exclusive through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.len != 0 {
            // Safety: unmapping the mapping we own; failure here is
            // unrecoverable address-space corruption, so assert.
            let res = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) };
            debug_assert!(res.is_ok(), "munmap failed: {res:?}");
        }
    }
}
