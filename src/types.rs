// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{wasm_unsupported, Error};
use core::fmt;

/// The type of a WebAssembly value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 128-bit vector.
    V128,
    /// Nullable reference to a function.
    FuncRef,
}

impl ValType {
    pub fn is_ref(&self) -> bool {
        matches!(self, ValType::FuncRef)
    }

    pub(crate) fn from_wasmparser(ty: wasmparser::ValType) -> crate::Result<Self> {
        match ty {
            wasmparser::ValType::I32 => Ok(ValType::I32),
            wasmparser::ValType::I64 => Ok(ValType::I64),
            wasmparser::ValType::F32 => Ok(ValType::F32),
            wasmparser::ValType::F64 => Ok(ValType::F64),
            wasmparser::ValType::V128 => Ok(ValType::V128),
            wasmparser::ValType::Ref(rt) if rt.is_func_ref() => Ok(ValType::FuncRef),
            wasmparser::ValType::Ref(rt) => Err(wasm_unsupported!("reference type {rt}")),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
            ValType::V128 => f.write_str("v128"),
            ValType::FuncRef => f.write_str("funcref"),
        }
    }
}

/// The type of a WebAssembly function: its parameter and result types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    pub(crate) fn from_wasmparser(ty: &wasmparser::FuncType) -> crate::Result<Self> {
        let params = ty
            .params()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<crate::Result<Box<[_]>>>()?;
        let results = ty
            .results()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<crate::Result<Box<[_]>>>()?;
        Ok(Self { params, results })
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(func")?;
        if !self.params.is_empty() {
            f.write_str(" (param")?;
            for p in self.params.iter() {
                write!(f, " {p}")?;
            }
            f.write_str(")")?;
        }
        if !self.results.is_empty() {
            f.write_str(" (result")?;
            for r in self.results.iter() {
                write!(f, " {r}")?;
            }
            f.write_str(")")?;
        }
        f.write_str(")")
    }
}

/// The type of a linear memory: limits in units of 64 KiB pages, plus the
/// shared flag from the threads proposal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub minimum: u64,
    pub maximum: Option<u64>,
    pub shared: bool,
}

impl MemoryType {
    pub(crate) fn from_wasmparser(ty: wasmparser::MemoryType) -> crate::Result<Self> {
        if ty.memory64 {
            return Err(wasm_unsupported!("64-bit memories"));
        }
        Ok(Self {
            minimum: ty.initial,
            maximum: ty.maximum,
            shared: ty.shared,
        })
    }

    /// Whether `other` can satisfy an import of type `self`.
    pub(crate) fn is_compatible_with(&self, other: &MemoryType) -> bool {
        if self.shared != other.shared || other.minimum < self.minimum {
            return false;
        }
        match (self.maximum, other.maximum) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(want), Some(have)) => have <= want,
        }
    }
}

/// The type of a table: element type plus limits in elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TableType {
    pub element: ValType,
    pub minimum: u64,
    pub maximum: Option<u64>,
}

impl TableType {
    pub(crate) fn from_wasmparser(ty: wasmparser::TableType) -> crate::Result<Self> {
        if !ty.element_type.is_func_ref() {
            return Err(wasm_unsupported!("table element type {}", ty.element_type));
        }
        Ok(Self {
            element: ValType::FuncRef,
            minimum: ty.initial,
            maximum: ty.maximum,
        })
    }

    pub(crate) fn is_compatible_with(&self, other: &TableType) -> bool {
        if self.element != other.element || other.minimum < self.minimum {
            return false;
        }
        match (self.maximum, other.maximum) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(want), Some(have)) => have <= want,
        }
    }
}

/// The type of a global: content type plus mutability.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

impl GlobalType {
    pub(crate) fn from_wasmparser(ty: wasmparser::GlobalType) -> crate::Result<Self> {
        Ok(Self {
            content: ValType::from_wasmparser(ty.content_type)?,
            mutable: ty.mutable,
        })
    }
}

/// The type of any importable or exportable entity.
#[derive(Debug, Clone)]
pub enum ExternType {
    Func(FuncType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl ExternType {
    pub(crate) fn desc(&self) -> &'static str {
        match self {
            ExternType::Func(_) => "function",
            ExternType::Table(_) => "table",
            ExternType::Memory(_) => "memory",
            ExternType::Global(_) => "global",
        }
    }
}
