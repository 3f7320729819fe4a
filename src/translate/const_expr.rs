// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::{FuncIndex, GlobalIndex};
use crate::wasm_unsupported;
use smallvec::SmallVec;

/// A validated constant expression, as used by global, element and data
/// segment initializers.
///
/// Without the extended-const proposal these are single operations; the
/// enum keeps the door shut on anything else at translation time so the
/// evaluator in `vm::const_eval` never sees an unexpected shape.
#[derive(Debug, Clone)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    V128(u128),
    GlobalGet(GlobalIndex),
    RefNull,
    RefFunc(FuncIndex),
}

impl ConstExpr {
    /// Converts a `wasmparser` const expression, also reporting which
    /// functions escape through `ref.func`.
    pub fn from_wasmparser(
        expr: &wasmparser::ConstExpr<'_>,
    ) -> crate::Result<(Self, SmallVec<[FuncIndex; 1]>)> {
        let mut ops = expr.get_operators_reader();
        let op = ops.read()?;
        let mut escaped = SmallVec::new();

        let expr = match op {
            wasmparser::Operator::I32Const { value } => ConstExpr::I32(value),
            wasmparser::Operator::I64Const { value } => ConstExpr::I64(value),
            wasmparser::Operator::F32Const { value } => ConstExpr::F32(value.bits()),
            wasmparser::Operator::F64Const { value } => ConstExpr::F64(value.bits()),
            wasmparser::Operator::V128Const { value } => {
                ConstExpr::V128(u128::from_le_bytes(*value.bytes()))
            }
            wasmparser::Operator::GlobalGet { global_index } => {
                ConstExpr::GlobalGet(GlobalIndex::from_u32(global_index))
            }
            wasmparser::Operator::RefNull { .. } => ConstExpr::RefNull,
            wasmparser::Operator::RefFunc { function_index } => {
                let index = FuncIndex::from_u32(function_index);
                escaped.push(index);
                ConstExpr::RefFunc(index)
            }
            op => {
                return Err(wasm_unsupported!("constant expression operator {op:?}"));
            }
        };

        match ops.read()? {
            wasmparser::Operator::End => {}
            op => {
                return Err(wasm_unsupported!(
                    "multi-operation constant expression ({op:?})"
                ));
            }
        }

        Ok((expr, escaped))
    }
}
