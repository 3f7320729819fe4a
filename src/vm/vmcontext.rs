// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `repr(C)` structures shared between Rust and generated code.
//!
//! Generated code addresses every field of [`VMContext`] by constant offset
//! (`core::mem::offset_of!`), so the layout here *is* the ABI. Both engines
//! use the same layout; the interpreter simply reads the fields through
//! ordinary Rust code.

use static_assertions::const_assert_eq;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;

/// Magic value held in [`VMContext::magic`], checked in debug builds before
/// the context is dereferenced from generated code entry points.
pub const VMCONTEXT_MAGIC: u32 = u32::from_le_bytes(*b"vmcx");

/// The array-call ABI every function (compiled, interpreted or host) is
/// invoked through: `(callee context, caller context, values, len)`, where
/// `values` carries the parameters on entry and the results on exit. The
/// return value is the status word (see [`crate::vm::STATUS_OK`]).
pub type VMArrayCallFunction =
    unsafe extern "C" fn(*mut VMContext, *mut VMContext, *mut VMVal, usize) -> u32;

/// Per-instance context visible to generated code.
#[repr(C)]
#[derive(Debug)]
pub struct VMContext {
    pub magic: u32,
    /// Store-local index of the owning instance.
    pub instance: u32,
    /// `*mut StoreOpaque`, installed at instantiation.
    pub store: *mut u8,
    /// Definition of linear memory 0 (owned or imported); null when the
    /// module declares no memory.
    pub memory_def: *const VMMemoryDefinition,
    /// Defined globals, 16 bytes per cell.
    pub globals: *mut VMGlobal,
    /// Imported globals, one pointer per import.
    pub imported_globals: *const *mut VMGlobal,
    /// Funcrefs for this module's escaping functions.
    pub func_refs: *mut VMFuncRef,
    /// Imported functions, one entry per import.
    pub imported_funcs: *const VMFunctionImport,
    /// All tables in the module's index space, defined and imported alike.
    pub tables: *const *mut VMTableDefinition,
    /// The builtin function array.
    pub builtins: *const VMBuiltinFunctionsArray,
    /// Stack-exhaustion limit, refreshed on every host-to-guest entry.
    pub stack_limit: usize,
    /// Cancellation flag; non-zero requests a `Cancelled` trap.
    pub cancel: *const AtomicU32,
    /// Trap status parked by builtins that cannot return it directly.
    pub trap: u32,
    pub _pad: u32,
}

// The lowering loads `memory_def` and `stack_limit` with 8-byte moves.
const_assert_eq!(core::mem::offset_of!(VMContext, store) % 8, 0);
const_assert_eq!(core::mem::offset_of!(VMContext, memory_def) % 8, 0);
const_assert_eq!(core::mem::offset_of!(VMContext, stack_limit) % 8, 0);

/// A 16-byte value slot of the array-call ABI. Scalars occupy the low bytes
/// in little-endian order; `v128` uses the full width.
#[derive(Copy, Clone)]
#[repr(C, align(16))]
pub struct VMVal {
    bytes: [u8; 16],
}

impl core::fmt::Debug for VMVal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VMVal({:#034x})", u128::from_le_bytes(self.bytes))
    }
}

impl VMVal {
    pub const ZERO: VMVal = VMVal { bytes: [0; 16] };

    #[inline]
    pub fn i32(v: i32) -> Self {
        Self::u64(v as u32 as u64)
    }

    #[inline]
    pub fn i64(v: i64) -> Self {
        Self::u64(v as u64)
    }

    #[inline]
    pub fn u64(v: u64) -> Self {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&v.to_le_bytes());
        Self { bytes }
    }

    #[inline]
    pub fn f32(bits: u32) -> Self {
        Self::u64(u64::from(bits))
    }

    #[inline]
    pub fn f64(bits: u64) -> Self {
        Self::u64(bits)
    }

    #[inline]
    pub fn v128(v: u128) -> Self {
        Self {
            bytes: v.to_le_bytes(),
        }
    }

    #[inline]
    pub fn funcref(ptr: *mut VMFuncRef) -> Self {
        Self::u64(ptr as usize as u64)
    }

    #[inline]
    pub fn get_u64(&self) -> u64 {
        u64::from_le_bytes(self.bytes[..8].try_into().unwrap())
    }

    #[inline]
    pub fn get_i32(&self) -> i32 {
        self.get_u64() as u32 as i32
    }

    #[inline]
    pub fn get_i64(&self) -> i64 {
        self.get_u64() as i64
    }

    #[inline]
    pub fn get_f32(&self) -> u32 {
        self.get_u64() as u32
    }

    #[inline]
    pub fn get_f64(&self) -> u64 {
        self.get_u64()
    }

    #[inline]
    pub fn get_v128(&self) -> u128 {
        u128::from_le_bytes(self.bytes)
    }

    #[inline]
    pub fn get_funcref(&self) -> *mut VMFuncRef {
        self.get_u64() as usize as *mut VMFuncRef
    }
}

/// A typed global cell. All value types share the 16-byte representation of
/// [`VMVal`].
#[derive(Copy, Clone, Debug)]
#[repr(C, align(16))]
pub struct VMGlobal {
    bytes: [u8; 16],
}

impl VMGlobal {
    pub const ZERO: VMGlobal = VMGlobal { bytes: [0; 16] };

    #[inline]
    pub fn from_vmval(v: VMVal) -> Self {
        Self {
            bytes: VMVal::v128(v.get_v128()).bytes,
        }
    }

    #[inline]
    pub fn to_vmval(self) -> VMVal {
        VMVal::v128(u128::from_le_bytes(self.bytes))
    }
}

/// The shape of a table as generated code sees it: element base plus current
/// length. Growth updates this in place so the pointer stays valid for the
/// table's lifetime.
#[derive(Debug)]
#[repr(C)]
pub struct VMTableDefinition {
    pub base: *mut *mut VMFuncRef,
    pub current_elements: usize,
}

/// The shape of a linear memory as generated code sees it. The length is
/// atomic because shared memories update it under concurrent readers.
#[derive(Debug)]
#[repr(C)]
pub struct VMMemoryDefinition {
    pub base: *mut u8,
    pub current_length: AtomicUsize,
}

const_assert_eq!(core::mem::offset_of!(VMMemoryDefinition, base), 0);
const_assert_eq!(core::mem::offset_of!(VMMemoryDefinition, current_length), 8);

/// A callable reference: the unit stored in tables, used for indirect calls
/// and passed across the host boundary.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct VMFuncRef {
    pub array_call: VMArrayCallFunction,
    /// The callee's context: an instance [`VMContext`] for wasm functions, a
    /// host-function header for host functions.
    pub vmctx: *mut VMContext,
    /// Engine-canonical signature id, compared on indirect calls.
    pub type_index: u32,
    /// Defined-function index for wasm functions, host-function id for host
    /// functions.
    pub index: u32,
}

/// One imported function.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct VMFunctionImport {
    pub func_ref: *const VMFuncRef,
}

/// The table of builtin functions reachable from generated code through
/// [`VMContext::builtins`]. Field order is ABI; the lowering indexes this
/// struct with `offset_of!`.
#[repr(C)]
pub struct VMBuiltinFunctionsArray {
    // memory
    pub memory_grow: unsafe extern "C" fn(*mut VMContext, u64) -> u64,
    pub memory_fill: unsafe extern "C" fn(*mut VMContext, u64, u32, u64),
    pub memory_copy: unsafe extern "C" fn(*mut VMContext, u64, u64, u64),
    pub memory_init: unsafe extern "C" fn(*mut VMContext, u32, u64, u64, u64),
    pub data_drop: unsafe extern "C" fn(*mut VMContext, u32),
    // tables
    pub table_get: unsafe extern "C" fn(*mut VMContext, u32, u64) -> u64,
    pub table_set: unsafe extern "C" fn(*mut VMContext, u32, u64, u64),
    pub table_grow: unsafe extern "C" fn(*mut VMContext, u32, u64, u64) -> u64,
    pub table_fill: unsafe extern "C" fn(*mut VMContext, u32, u64, u64, u64),
    pub table_copy: unsafe extern "C" fn(*mut VMContext, u32, u32, u64, u64, u64),
    pub table_init: unsafe extern "C" fn(*mut VMContext, u32, u32, u64, u64, u64),
    pub elem_drop: unsafe extern "C" fn(*mut VMContext, u32),
    // float helpers with wasm (not host ISA) semantics
    pub f32_ceil: extern "C" fn(f32) -> f32,
    pub f32_floor: extern "C" fn(f32) -> f32,
    pub f32_trunc: extern "C" fn(f32) -> f32,
    pub f32_nearest: extern "C" fn(f32) -> f32,
    pub f32_min: extern "C" fn(f32, f32) -> f32,
    pub f32_max: extern "C" fn(f32, f32) -> f32,
    pub f32_copysign: extern "C" fn(f32, f32) -> f32,
    pub f64_ceil: extern "C" fn(f64) -> f64,
    pub f64_floor: extern "C" fn(f64) -> f64,
    pub f64_trunc: extern "C" fn(f64) -> f64,
    pub f64_nearest: extern "C" fn(f64) -> f64,
    pub f64_min: extern "C" fn(f64, f64) -> f64,
    pub f64_max: extern "C" fn(f64, f64) -> f64,
    pub f64_copysign: extern "C" fn(f64, f64) -> f64,
    // trapping float-to-int conversions
    pub i32_trunc_f32_s: unsafe extern "C" fn(*mut VMContext, f32) -> i32,
    pub i32_trunc_f32_u: unsafe extern "C" fn(*mut VMContext, f32) -> i32,
    pub i32_trunc_f64_s: unsafe extern "C" fn(*mut VMContext, f64) -> i32,
    pub i32_trunc_f64_u: unsafe extern "C" fn(*mut VMContext, f64) -> i32,
    pub i64_trunc_f32_s: unsafe extern "C" fn(*mut VMContext, f32) -> i64,
    pub i64_trunc_f32_u: unsafe extern "C" fn(*mut VMContext, f32) -> i64,
    pub i64_trunc_f64_s: unsafe extern "C" fn(*mut VMContext, f64) -> i64,
    pub i64_trunc_f64_u: unsafe extern "C" fn(*mut VMContext, f64) -> i64,
    // saturating variants
    pub i32_trunc_sat_f32_s: extern "C" fn(f32) -> i32,
    pub i32_trunc_sat_f32_u: extern "C" fn(f32) -> i32,
    pub i32_trunc_sat_f64_s: extern "C" fn(f64) -> i32,
    pub i32_trunc_sat_f64_u: extern "C" fn(f64) -> i32,
    pub i64_trunc_sat_f32_s: extern "C" fn(f32) -> i64,
    pub i64_trunc_sat_f32_u: extern "C" fn(f32) -> i64,
    pub i64_trunc_sat_f64_s: extern "C" fn(f64) -> i64,
    pub i64_trunc_sat_f64_u: extern "C" fn(f64) -> i64,
    // unsigned 64-bit to float
    pub f32_convert_i64_u: extern "C" fn(u64) -> f32,
    pub f64_convert_i64_u: extern "C" fn(u64) -> f64,
    // atomics (threads)
    pub atomic_load: unsafe extern "C" fn(*mut VMContext, u32, u64) -> u64,
    pub atomic_store: unsafe extern "C" fn(*mut VMContext, u32, u64, u64),
    pub atomic_rmw: unsafe extern "C" fn(*mut VMContext, u32, u32, u64, u64) -> u64,
    pub atomic_cmpxchg: unsafe extern "C" fn(*mut VMContext, u32, u64, u64, u64) -> u64,
    pub atomic_wait32: unsafe extern "C" fn(*mut VMContext, u64, u64, i64) -> u64,
    pub atomic_wait64: unsafe extern "C" fn(*mut VMContext, u64, u64, i64) -> u64,
    pub atomic_notify: unsafe extern "C" fn(*mut VMContext, u64, u64) -> u64,
}
