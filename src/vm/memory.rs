// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Linear memories.
//!
//! Two flavors share the [`VMMemoryDefinition`] contract:
//!
//! - **Local** memories belong to one instance. With guard reservations
//!   enabled the full limit is reserved up front and growth commits pages in
//!   place (the base never moves); without, growth remaps and the definition
//!   is updated.
//! - **Shared** memories (threads proposal) always reserve their limit, and
//!   serialize growth against concurrent atomic operations with a
//!   reader-writer lock: atomics hold the read side, `memory.grow` the write
//!   side. The current length is published with a release store so racing
//!   readers observe a fully committed page range.

use crate::types::MemoryType;
use crate::vm::mmap::{round_up_to_page, Mmap};
use crate::vm::VMMemoryDefinition;
use crate::{WASM32_MAX_PAGES, WASM_PAGE_SIZE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug)]
pub enum Memory {
    Local(LocalMemory),
    Shared(SharedMemory),
}

impl Memory {
    pub fn new(ty: &MemoryType, guard_reserve: bool) -> crate::Result<Self> {
        if ty.shared {
            Ok(Memory::Shared(SharedMemory::new(ty)?))
        } else {
            Ok(Memory::Local(LocalMemory::new(ty, guard_reserve)?))
        }
    }

    /// The declared type of the memory.
    pub fn ty(&self) -> MemoryType {
        match self {
            Memory::Local(m) => m.ty,
            Memory::Shared(m) => m.0.ty,
        }
    }

    pub fn def_ptr(&self) -> *const VMMemoryDefinition {
        match self {
            Memory::Local(m) => &*m.def,
            Memory::Shared(m) => &m.0.def,
        }
    }

    pub fn byte_size(&self) -> usize {
        // Safety: def_ptr points into self.
        unsafe { (*self.def_ptr()).current_length.load(Ordering::Acquire) }
    }

    pub fn size_in_pages(&self) -> u64 {
        (self.byte_size() as u64) / WASM_PAGE_SIZE
    }

    /// Standard `memory.grow`: returns the previous size in pages, or `None`
    /// (surfaced to the guest as −1) if the limits do not permit the growth.
    pub fn grow(&mut self, delta_pages: u64) -> crate::Result<Option<u64>> {
        match self {
            Memory::Local(m) => m.grow(delta_pages),
            Memory::Shared(m) => m.grow(delta_pages),
        }
    }

    pub fn shared(&self) -> Option<&SharedMemory> {
        match self {
            Memory::Shared(m) => Some(m),
            Memory::Local(_) => None,
        }
    }

    /// The currently accessible bytes. The returned slice borrows the store,
    /// so the usual aliasing discipline applies; for shared memories racing
    /// guest writes are possible and the caller must tolerate tearing.
    pub fn slice(&self) -> &[u8] {
        let def = self.def_ptr();
        // Safety: base/current_length describe an accessible region owned by
        // this memory.
        unsafe {
            let len = (*def).current_length.load(Ordering::Acquire);
            std::slice::from_raw_parts((*def).base, len)
        }
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        let def = self.def_ptr();
        // Safety: as `slice`, plus exclusivity through `&mut self`.
        unsafe {
            let len = (*def).current_length.load(Ordering::Acquire);
            std::slice::from_raw_parts_mut((*def).base, len)
        }
    }

    fn clamp_maximum(ty: &MemoryType) -> u64 {
        ty.maximum.unwrap_or(WASM32_MAX_PAGES).min(WASM32_MAX_PAGES)
    }
}

#[derive(Debug)]
pub struct LocalMemory {
    mmap: Mmap,
    ty: MemoryType,
    maximum_pages: u64,
    /// Whether the full limit was reserved up front (guard-page layout).
    reserved: bool,
    def: Box<VMMemoryDefinition>,
}

impl LocalMemory {
    fn new(ty: &MemoryType, guard_reserve: bool) -> crate::Result<Self> {
        let maximum_pages = Memory::clamp_maximum(ty);
        let initial_len = usize::try_from(ty.minimum * WASM_PAGE_SIZE).unwrap();

        let mmap = if guard_reserve {
            let reserve_len = usize::try_from(maximum_pages * WASM_PAGE_SIZE).unwrap();
            let mut mmap = Mmap::reserve(reserve_len)?;
            if initial_len > 0 {
                mmap.make_accessible(0, round_up_to_page(initial_len))?;
            }
            mmap
        } else {
            Mmap::new_accessible(initial_len)?
        };

        let def = Box::new(VMMemoryDefinition {
            base: mmap.as_mut_ptr(),
            current_length: AtomicUsize::new(initial_len),
        });
        Ok(Self {
            mmap,
            ty: *ty,
            maximum_pages,
            reserved: guard_reserve,
            def,
        })
    }

    fn grow(&mut self, delta_pages: u64) -> crate::Result<Option<u64>> {
        let old_pages = self.def.current_length.load(Ordering::Relaxed) as u64 / WASM_PAGE_SIZE;
        let Some(new_pages) = old_pages.checked_add(delta_pages) else {
            return Ok(None);
        };
        if new_pages > self.maximum_pages {
            return Ok(None);
        }
        if delta_pages == 0 {
            return Ok(Some(old_pages));
        }

        let old_len = usize::try_from(old_pages * WASM_PAGE_SIZE).unwrap();
        let new_len = usize::try_from(new_pages * WASM_PAGE_SIZE).unwrap();

        if self.reserved {
            self.mmap
                .make_accessible(round_up_to_page(old_len), new_len - round_up_to_page(old_len))?;
        } else {
            // Unreserved layout: remap and copy; the base moves and the
            // definition is updated before anyone reads it again.
            let mut grown = Mmap::new_accessible(new_len)?;
            grown.slice_mut(0, old_len).copy_from_slice(self.mmap.slice(0, old_len));
            self.mmap = grown;
            self.def.base = self.mmap.as_mut_ptr();
        }
        self.def.current_length.store(new_len, Ordering::Release);
        Ok(Some(old_pages))
    }
}

/// A shared linear memory, clonable across instances and threads.
#[derive(Debug, Clone)]
pub struct SharedMemory(Arc<SharedMemoryInner>);

#[derive(Debug)]
pub struct SharedMemoryInner {
    /// Guards growth (write) against concurrent atomics (read).
    grow_lock: RwLock<GrowState>,
    ty: MemoryType,
    maximum_pages: u64,
    def: VMMemoryDefinition,
    waiters: Mutex<HashMap<u64, Arc<WaitSpot>>>,
}

// Safety: `def.base` points into the mmap owned by `grow_lock`, which is only
// ever replaced (on grow) while holding the write lock; all access to the
// underlying memory is synchronized via `grow_lock` and Wasm atomics.
unsafe impl Send for SharedMemoryInner {}
unsafe impl Sync for SharedMemoryInner {}

#[derive(Debug)]
struct GrowState {
    mmap: Mmap,
}

#[derive(Debug, Default)]
struct WaitSpot {
    state: Mutex<SpotState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct SpotState {
    waiters: u64,
    wakeups: u64,
}

/// `memory.atomic.wait*` outcomes, per the threads proposal.
pub const WAIT_OK: u64 = 0;
pub const WAIT_MISMATCH: u64 = 1;
pub const WAIT_TIMED_OUT: u64 = 2;

impl SharedMemory {
    fn new(ty: &MemoryType) -> crate::Result<Self> {
        let maximum_pages = Memory::clamp_maximum(ty);
        let reserve_len = usize::try_from(maximum_pages * WASM_PAGE_SIZE).unwrap();
        let initial_len = usize::try_from(ty.minimum * WASM_PAGE_SIZE).unwrap();

        let mut mmap = Mmap::reserve(reserve_len)?;
        if initial_len > 0 {
            mmap.make_accessible(0, round_up_to_page(initial_len))?;
        }
        let def = VMMemoryDefinition {
            base: mmap.as_mut_ptr(),
            current_length: AtomicUsize::new(initial_len),
        };
        Ok(Self(Arc::new(SharedMemoryInner {
            grow_lock: RwLock::new(GrowState { mmap }),
            ty: *ty,
            maximum_pages,
            def,
            waiters: Mutex::new(HashMap::new()),
        })))
    }

    pub fn def_ptr(&self) -> *const VMMemoryDefinition {
        &self.0.def
    }

    /// Takes the exclusive side of the growth lock, excluding concurrent
    /// atomics for the duration of the commit.
    pub fn grow(&self, delta_pages: u64) -> crate::Result<Option<u64>> {
        let mut state = self.0.grow_lock.write().expect("grow lock poisoned");

        let old_len = self.0.def.current_length.load(Ordering::Relaxed);
        let old_pages = old_len as u64 / WASM_PAGE_SIZE;
        let Some(new_pages) = old_pages.checked_add(delta_pages) else {
            return Ok(None);
        };
        if new_pages > self.0.maximum_pages {
            return Ok(None);
        }
        if delta_pages == 0 {
            return Ok(Some(old_pages));
        }

        let new_len = usize::try_from(new_pages * WASM_PAGE_SIZE).unwrap();
        state
            .mmap
            .make_accessible(round_up_to_page(old_len), new_len - round_up_to_page(old_len))?;
        self.0.def.current_length.store(new_len, Ordering::Release);
        Ok(Some(old_pages))
    }

    /// Runs `f` with the shared side of the growth lock held, so the length
    /// observed inside cannot shrink nor the base be mid-commit.
    pub fn with_atomic_access<R>(&self, f: impl FnOnce(&VMMemoryDefinition) -> R) -> R {
        let _guard = self.0.grow_lock.read().expect("grow lock poisoned");
        f(&self.0.def)
    }

    /// `memory.atomic.wait32/64` once the expected-value check has been
    /// performed by `check` (under the spot lock, so a racing notify cannot
    /// slip between check and sleep). `timeout_ns < 0` waits forever.
    pub fn wait(&self, addr: u64, timeout_ns: i64, check: impl FnOnce() -> bool) -> u64 {
        let spot = {
            let mut waiters = self.0.waiters.lock().expect("waiter map poisoned");
            Arc::clone(waiters.entry(addr).or_default())
        };

        let mut state = spot.state.lock().expect("wait spot poisoned");
        if !check() {
            return WAIT_MISMATCH;
        }
        state.waiters += 1;

        let deadline = (timeout_ns >= 0).then(|| Duration::from_nanos(timeout_ns as u64));
        let mut remaining = deadline;
        loop {
            if state.wakeups > 0 {
                state.wakeups -= 1;
                state.waiters -= 1;
                return WAIT_OK;
            }
            match remaining {
                None => {
                    state = spot.cond.wait(state).expect("wait spot poisoned");
                }
                Some(left) => {
                    let start = std::time::Instant::now();
                    let (next, timeout) = spot
                        .cond
                        .wait_timeout(state, left)
                        .expect("wait spot poisoned");
                    state = next;
                    if timeout.timed_out() {
                        state.waiters -= 1;
                        return WAIT_TIMED_OUT;
                    }
                    remaining = Some(left.saturating_sub(start.elapsed()));
                }
            }
        }
    }

    /// `memory.atomic.notify`: wakes up to `count` waiters at `addr`,
    /// returning how many were woken.
    pub fn notify(&self, addr: u64, count: u64) -> u64 {
        let Some(spot) = self
            .0
            .waiters
            .lock()
            .expect("waiter map poisoned")
            .get(&addr)
            .cloned()
        else {
            return 0;
        };
        let mut state = spot.state.lock().expect("wait spot poisoned");
        let woken = count.min(state.waiters.saturating_sub(state.wakeups));
        state.wakeups += woken;
        drop(state);
        spot.cond.notify_all();
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{AtomicOp, AtomicTy};
    use crate::vm::{atomic_load_raw, atomic_rmw_raw};

    fn shared(min_pages: u64, max_pages: u64) -> SharedMemory {
        SharedMemory::new(&MemoryType {
            minimum: min_pages,
            maximum: Some(max_pages),
            shared: true,
        })
        .unwrap()
    }

    #[test]
    fn concurrent_rmw_is_sequentially_consistent() {
        let memory = shared(1, 4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let memory = memory.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    // Safety: the definition is pinned in the Arc and the
                    // address is in the committed first page.
                    unsafe {
                        atomic_rmw_raw(&*memory.def_ptr(), AtomicOp::Add, AtomicTy::I32, 64, 1)
                            .unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Safety: as above.
        let total =
            unsafe { atomic_load_raw(&*memory.def_ptr(), AtomicTy::I32, 64).unwrap() };
        assert_eq!(total, 8 * 10_000);
    }

    #[test]
    fn grow_excludes_concurrent_atomics() {
        let memory = shared(1, 64);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let memory = memory.clone();
            let stop = Arc::clone(&stop);
            handles.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    // Safety: address 0 stays committed; the base of a
                    // shared memory never moves across growth.
                    unsafe {
                        atomic_rmw_raw(&*memory.def_ptr(), AtomicOp::Add, AtomicTy::I64, 0, 1)
                            .unwrap();
                    }
                }
            }));
        }

        for _ in 0..32 {
            assert!(memory.grow(1).unwrap().is_some());
        }
        assert_eq!(memory.grow(u64::MAX).unwrap(), None);
        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }

        // Safety: as above.
        let len = unsafe { (*memory.def_ptr()).current_length.load(Ordering::Acquire) };
        assert_eq!(len as u64, 33 * WASM_PAGE_SIZE);
    }

    #[test]
    fn wait_returns_mismatch_without_blocking() {
        let memory = shared(1, 2);
        // The value at address 8 is zero; expecting anything else returns
        // immediately.
        assert_eq!(memory.wait(8, -1, || false), WAIT_MISMATCH);
    }

    #[test]
    fn wait_times_out() {
        let memory = shared(1, 2);
        assert_eq!(memory.wait(8, 1_000_000, || true), WAIT_TIMED_OUT);
    }

    #[test]
    fn notify_wakes_waiters() {
        let memory = shared(1, 2);
        let waiter = {
            let memory = memory.clone();
            std::thread::spawn(move || memory.wait(16, -1, || true))
        };
        // Spin until the waiter has parked, then wake it.
        loop {
            if memory.notify(16, 1) == 1 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(waiter.join().unwrap(), WAIT_OK);
    }

    #[test]
    fn local_memory_grow_respects_maximum() {
        let mut memory = Memory::new(
            &MemoryType {
                minimum: 1,
                maximum: Some(2),
                shared: false,
            },
            true,
        )
        .unwrap();
        assert_eq!(memory.size_in_pages(), 1);
        assert_eq!(memory.grow(1).unwrap(), Some(1));
        assert_eq!(memory.grow(1).unwrap(), None);
        assert_eq!(memory.size_in_pages(), 2);
    }

    #[test]
    fn unreserved_grow_preserves_contents() {
        let mut memory = Memory::new(
            &MemoryType {
                minimum: 1,
                maximum: None,
                shared: false,
            },
            false,
        )
        .unwrap();
        memory.slice_mut()[100] = 0xab;
        assert_eq!(memory.grow(3).unwrap(), Some(1));
        assert_eq!(memory.slice()[100], 0xab);
        assert_eq!(memory.size_in_pages(), 4);
    }
}
