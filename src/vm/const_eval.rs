// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::StoreOpaque;
use crate::translate::ConstExpr;
use crate::vm::VMVal;
use std::ptr;

/// Evaluates validated constant expressions against an instance's globals
/// and funcrefs.
#[derive(Debug, Default)]
pub struct ConstExprEvaluator {}

impl ConstExprEvaluator {
    pub fn eval(&mut self, store: &StoreOpaque, instance_id: usize, expr: &ConstExpr) -> VMVal {
        let instance = store.instance(instance_id);
        match expr {
            ConstExpr::I32(v) => VMVal::i32(*v),
            ConstExpr::I64(v) => VMVal::i64(*v),
            ConstExpr::F32(bits) => VMVal::f32(*bits),
            ConstExpr::F64(bits) => VMVal::f64(*bits),
            ConstExpr::V128(v) => VMVal::v128(*v),
            ConstExpr::GlobalGet(index) => {
                // Safety: global pointers installed at instantiation stay
                // valid for the instance's lifetime.
                unsafe { (*instance.global_ptr(*index)).to_vmval() }
            }
            ConstExpr::RefNull => VMVal::funcref(ptr::null_mut()),
            ConstExpr::RefFunc(index) => VMVal::funcref(instance.func_ref_ptr(*index)),
        }
    }
}
