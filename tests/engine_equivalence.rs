// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compiler and interpreter must be behaviorally indistinguishable: for
//! every module and input vector here, both engines produce bit-identical
//! results (including NaN payloads) and identical trap kinds.

use tern::{Config, Engine, Features, Linker, Module, Store, TrapKind, Val};

fn features() -> Features {
    Features::CORE_V1 | Features::CORE_V2 | Features::THREADS
}

fn engines() -> Vec<Engine> {
    let mut engines = vec![Engine::new(Config::interpreter().with_features(features()))];
    if Engine::compiler_supported() {
        engines.push(Engine::new(Config::compiler().with_features(features())));
    }
    engines
}

/// A comparable image of a call result: either result bit patterns or a
/// trap kind.
#[derive(Debug, PartialEq)]
enum Outcome {
    Values(Vec<(u8, u128)>),
    Trap(TrapKind),
}

fn val_bits(v: &Val) -> (u8, u128) {
    match v {
        Val::I32(v) => (0, *v as u32 as u128),
        Val::I64(v) => (1, *v as u64 as u128),
        Val::F32(bits) => (2, u128::from(*bits)),
        Val::F64(bits) => (3, u128::from(*bits)),
        Val::V128(v) => (4, *v),
        Val::FuncRef(f) => (5, u128::from(f.is_some())),
    }
}

fn run_one(engine: &Engine, wasm: &[u8], func: &str, args: &[Val]) -> Outcome {
    let module = Module::from_bytes(engine, wasm).expect("corpus module must compile");
    let mut store = Store::new(engine);
    let linker = Linker::new(engine);
    let instance = linker
        .instantiate(&mut store, &module)
        .expect("corpus module must instantiate");
    let func = instance
        .function(&mut store, func)
        .expect("exported function missing");

    let mut results = vec![Val::I32(0); func.ty(&store).results().len()];
    match func.call(&mut store, args, &mut results) {
        Ok(()) => Outcome::Values(results.iter().map(val_bits).collect()),
        Err(err) => Outcome::Trap(err.trap_kind().expect("non-trap error in corpus run")),
    }
}

#[track_caller]
fn assert_equivalent(wat: &str, func: &str, args: &[Val]) -> Outcome {
    let wasm = wat::parse_str(wat).expect("corpus wat must parse");
    let mut outcomes = engines()
        .iter()
        .map(|engine| run_one(engine, &wasm, func, args))
        .collect::<Vec<_>>();
    let first = outcomes.remove(0);
    for other in outcomes {
        assert_eq!(first, other, "engines disagree on {func}({args:?})");
    }
    first
}

#[track_caller]
fn assert_result(wat: &str, func: &str, args: &[Val], expected: Val) {
    let outcome = assert_equivalent(wat, func, args);
    assert_eq!(outcome, Outcome::Values(vec![val_bits(&expected)]));
}

#[track_caller]
fn assert_trap(wat: &str, func: &str, args: &[Val], expected: TrapKind) {
    let outcome = assert_equivalent(wat, func, args);
    assert_eq!(outcome, Outcome::Trap(expected));
}

#[test]
fn i32_arithmetic() {
    let wat = r#"(module
        (func (export "add") (param i32 i32) (result i32)
            (i32.add (local.get 0) (local.get 1)))
        (func (export "mixed") (param i32 i32) (result i32)
            (i32.xor
                (i32.mul (local.get 0) (i32.const 3))
                (i32.shr_u (local.get 1) (i32.const 2))))
        (func (export "clz") (param i32) (result i32)
            (i32.clz (local.get 0)))
        (func (export "popcnt") (param i32) (result i32)
            (i32.popcnt (local.get 0)))
        (func (export "rotl") (param i32 i32) (result i32)
            (i32.rotl (local.get 0) (local.get 1)))
    )"#;
    assert_result(wat, "add", &[Val::I32(2), Val::I32(40)], Val::I32(42));
    assert_result(
        wat,
        "add",
        &[Val::I32(i32::MAX), Val::I32(1)],
        Val::I32(i32::MIN),
    );
    assert_result(
        wat,
        "mixed",
        &[Val::I32(-7), Val::I32(1024)],
        Val::I32((-7i32).wrapping_mul(3) ^ (1024 >> 2)),
    );
    assert_result(wat, "clz", &[Val::I32(1)], Val::I32(31));
    assert_result(wat, "clz", &[Val::I32(0)], Val::I32(32));
    assert_result(wat, "popcnt", &[Val::I32(-1)], Val::I32(32));
    assert_result(wat, "rotl", &[Val::I32(0x0f00_0000), Val::I32(8)], {
        Val::I32((0x0f00_0000u32).rotate_left(8) as i32)
    });
}

#[test]
fn i64_arithmetic() {
    let wat = r#"(module
        (func (export "mul") (param i64 i64) (result i64)
            (i64.mul (local.get 0) (local.get 1)))
        (func (export "div_u") (param i64 i64) (result i64)
            (i64.div_u (local.get 0) (local.get 1)))
        (func (export "shr_s") (param i64 i64) (result i64)
            (i64.shr_s (local.get 0) (local.get 1)))
    )"#;
    assert_result(
        wat,
        "mul",
        &[Val::I64(0x1234_5678), Val::I64(0x9abc_def0)],
        Val::I64(0x1234_5678i64.wrapping_mul(0x9abc_def0)),
    );
    assert_result(
        wat,
        "div_u",
        &[Val::I64(-2), Val::I64(7)],
        Val::I64(((-2i64) as u64 / 7) as i64),
    );
    assert_result(wat, "shr_s", &[Val::I64(-1024), Val::I64(70)], {
        // Shift counts are masked to the width.
        Val::I64(-1024 >> 6)
    });
}

#[test]
fn division_traps() {
    let wat = r#"(module
        (func (export "div_s") (param i32 i32) (result i32)
            (i32.div_s (local.get 0) (local.get 1)))
        (func (export "rem_s") (param i32 i32) (result i32)
            (i32.rem_s (local.get 0) (local.get 1)))
        (func (export "div_s64") (param i64 i64) (result i64)
            (i64.div_s (local.get 0) (local.get 1)))
    )"#;
    assert_result(wat, "div_s", &[Val::I32(-7), Val::I32(2)], Val::I32(-3));
    assert_trap(
        wat,
        "div_s",
        &[Val::I32(1), Val::I32(0)],
        TrapKind::IntegerDivideByZero,
    );
    assert_trap(
        wat,
        "div_s",
        &[Val::I32(i32::MIN), Val::I32(-1)],
        TrapKind::IntegerOverflow,
    );
    // INT_MIN rem -1 is 0, not a trap.
    assert_result(
        wat,
        "rem_s",
        &[Val::I32(i32::MIN), Val::I32(-1)],
        Val::I32(0),
    );
    assert_trap(
        wat,
        "div_s64",
        &[Val::I64(i64::MIN), Val::I64(-1)],
        TrapKind::IntegerOverflow,
    );
}

#[test]
fn float_semantics() {
    let wat = r#"(module
        (func (export "add") (param f32 f32) (result f32)
            (f32.add (local.get 0) (local.get 1)))
        (func (export "min") (param f64 f64) (result f64)
            (f64.min (local.get 0) (local.get 1)))
        (func (export "max") (param f32 f32) (result f32)
            (f32.max (local.get 0) (local.get 1)))
        (func (export "nearest") (param f64) (result f64)
            (f64.nearest (local.get 0)))
        (func (export "sqrt") (param f64) (result f64)
            (f64.sqrt (local.get 0)))
        (func (export "copysign") (param f32 f32) (result f32)
            (f32.copysign (local.get 0) (local.get 1)))
        (func (export "cmp") (param f64 f64) (result i32)
            (f64.lt (local.get 0) (local.get 1)))
    )"#;
    assert_result(
        wat,
        "add",
        &[Val::from(1.5f32), Val::from(2.25f32)],
        Val::from(3.75f32),
    );
    // NaN-producing and NaN-propagating cases only assert that the engines
    // agree bit for bit.
    assert_equivalent(wat, "add", &[Val::from(f32::INFINITY), Val::from(f32::NEG_INFINITY)]);
    assert_equivalent(wat, "add", &[Val::F32(0x7fa0_0001), Val::from(1.0f32)]);
    assert_result(
        wat,
        "min",
        &[Val::from(-0.0f64), Val::from(0.0f64)],
        Val::from(-0.0f64),
    );
    assert_equivalent(wat, "min", &[Val::from(f64::NAN), Val::from(1.0f64)]);
    assert_result(
        wat,
        "max",
        &[Val::from(-1.0f32), Val::from(1.0f32)],
        Val::from(1.0f32),
    );
    // Round-half-to-even.
    assert_result(wat, "nearest", &[Val::from(2.5f64)], Val::from(2.0f64));
    assert_result(wat, "nearest", &[Val::from(3.5f64)], Val::from(4.0f64));
    assert_result(wat, "nearest", &[Val::from(-0.5f64)], Val::from(-0.0f64));
    assert_result(wat, "sqrt", &[Val::from(9.0f64)], Val::from(3.0f64));
    assert_equivalent(wat, "sqrt", &[Val::from(-1.0f64)]);
    assert_result(
        wat,
        "copysign",
        &[Val::from(3.0f32), Val::from(-0.0f32)],
        Val::from(-3.0f32),
    );
    assert_result(
        wat,
        "cmp",
        &[Val::from(f64::NAN), Val::from(1.0f64)],
        Val::I32(0),
    );
}

#[test]
fn conversions() {
    let wat = r#"(module
        (func (export "trunc") (param f32) (result i32)
            (i32.trunc_f32_s (local.get 0)))
        (func (export "trunc_sat") (param f32) (result i32)
            (i32.trunc_sat_f32_s (local.get 0)))
        (func (export "trunc_u64") (param f64) (result i64)
            (i64.trunc_f64_u (local.get 0)))
        (func (export "convert_u") (param i64) (result f64)
            (f64.convert_i64_u (local.get 0)))
        (func (export "demote") (param f64) (result f32)
            (f32.demote_f64 (local.get 0)))
        (func (export "reinterpret") (param f64) (result i64)
            (i64.reinterpret_f64 (local.get 0)))
        (func (export "extend8") (param i32) (result i32)
            (i32.extend8_s (local.get 0)))
    )"#;
    assert_result(wat, "trunc", &[Val::from(-3.9f32)], Val::I32(-3));
    assert_trap(
        wat,
        "trunc",
        &[Val::from(3.0e9f32)],
        TrapKind::IntegerOverflow,
    );
    assert_trap(
        wat,
        "trunc",
        &[Val::from(f32::NAN)],
        TrapKind::InvalidConversionToInteger,
    );
    assert_result(wat, "trunc_sat", &[Val::from(3.0e9f32)], Val::I32(i32::MAX));
    assert_result(wat, "trunc_sat", &[Val::from(f32::NAN)], Val::I32(0));
    assert_result(
        wat,
        "trunc_u64",
        &[Val::from(1.8e19f64)],
        Val::I64(1.8e19f64 as u64 as i64),
    );
    assert_result(
        wat,
        "convert_u",
        &[Val::I64(-1)],
        Val::from(u64::MAX as f64),
    );
    assert_result(wat, "demote", &[Val::from(1.1f64)], Val::from(1.1f64 as f32));
    assert_result(
        wat,
        "reinterpret",
        &[Val::from(-0.0f64)],
        Val::I64(i64::MIN),
    );
    assert_result(wat, "extend8", &[Val::I32(0x80)], Val::I32(-128));
}

#[test]
fn memory_operations() {
    let wat = r#"(module
        (memory 1 4)
        (func (export "store_load") (param i32 i32) (result i32)
            (i32.store (local.get 0) (local.get 1))
            (i32.load (local.get 0)))
        (func (export "load8_s") (param i32) (result i32)
            (i32.load8_s (local.get 0)))
        (func (export "oob") (result i32)
            (i32.load (i32.const 65536)))
        (func (export "size") (result i32) (memory.size))
        (func (export "grow") (param i32) (result i32)
            (memory.grow (local.get 0)))
        (func (export "fill_and_sum") (result i32)
            (memory.fill (i32.const 16) (i32.const 7) (i32.const 4))
            (i32.add
                (i32.load8_u (i32.const 16))
                (i32.load8_u (i32.const 19))))
        (func (export "copy_overlap") (result i32)
            (i32.store (i32.const 32) (i32.const 0x04030201))
            (memory.copy (i32.const 34) (i32.const 32) (i32.const 4))
            (i32.load (i32.const 34)))
    )"#;
    assert_result(
        wat,
        "store_load",
        &[Val::I32(128), Val::I32(-559038737)],
        Val::I32(-559038737),
    );
    assert_result(wat, "load8_s", &[Val::I32(65535)], Val::I32(0));
    assert_trap(wat, "oob", &[], TrapKind::OutOfBounds);
    assert_result(wat, "size", &[], Val::I32(1));
    assert_result(wat, "grow", &[Val::I32(1)], Val::I32(1));
    assert_result(wat, "grow", &[Val::I32(100)], Val::I32(-1));
    assert_result(wat, "fill_and_sum", &[], Val::I32(14));
    assert_result(wat, "copy_overlap", &[], Val::I32(0x04030201));
}

#[test]
fn control_flow() {
    let wat = r#"(module
        (func (export "sum_loop") (param i32) (result i32)
            (local $acc i32) (local $i i32)
            (block $exit
                (loop $top
                    (br_if $exit (i32.ge_u (local.get $i) (local.get 0)))
                    (local.set $acc (i32.add (local.get $acc) (local.get $i)))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br $top)))
            (local.get $acc))
        (func (export "pick") (param i32) (result i32)
            (block $b2
                (block $b1
                    (block $b0
                        (br_table $b0 $b1 $b2 (local.get 0)))
                    (return (i32.const 100)))
                (return (i32.const 200)))
            (i32.const 8))
        (func (export "cond") (param i32) (result i32)
            (if (result i32) (local.get 0)
                (then (i32.const 10))
                (else (i32.const 20))))
        (func (export "choose") (param i32) (result f64)
            (select (f64.const 1.5) (f64.const 2.5) (local.get 0)))
        (func (export "dead") (result i32)
            (return (i32.const 4))
            (i32.const 9))
    )"#;
    assert_result(wat, "sum_loop", &[Val::I32(10)], Val::I32(45));
    assert_result(wat, "sum_loop", &[Val::I32(0)], Val::I32(0));
    assert_result(wat, "pick", &[Val::I32(0)], Val::I32(100));
    assert_result(wat, "pick", &[Val::I32(1)], Val::I32(200));
    assert_result(wat, "pick", &[Val::I32(2)], Val::I32(8));
    assert_result(wat, "pick", &[Val::I32(99)], Val::I32(8));
    assert_result(wat, "cond", &[Val::I32(1)], Val::I32(10));
    assert_result(wat, "cond", &[Val::I32(0)], Val::I32(20));
    assert_result(wat, "choose", &[Val::I32(1)], Val::from(1.5f64));
    assert_result(wat, "choose", &[Val::I32(0)], Val::from(2.5f64));
    assert_result(wat, "dead", &[], Val::I32(4));
}

#[test]
fn calls_and_tables() {
    let wat = r#"(module
        (type $binop (func (param i32 i32) (result i32)))
        (type $nullary (func (result i32)))
        (table 4 funcref)
        (elem (i32.const 0) $add $sub)
        (func $add (type $binop)
            (i32.add (local.get 0) (local.get 1)))
        (func $sub (type $binop)
            (i32.sub (local.get 0) (local.get 1)))
        (func (export "fib") (param i32) (result i32)
            (if (result i32) (i32.lt_u (local.get 0) (i32.const 2))
                (then (local.get 0))
                (else (i32.add
                    (call 2 (i32.sub (local.get 0) (i32.const 1)))
                    (call 2 (i32.sub (local.get 0) (i32.const 2)))))))
        (func (export "dispatch") (param i32 i32 i32) (result i32)
            (call_indirect (type $binop)
                (local.get 1) (local.get 2) (local.get 0)))
        (func (export "bad_sig") (result i32)
            (call_indirect (type $nullary) (i32.const 0)))
        (func (export "null_entry") (result i32)
            (call_indirect (type $nullary) (i32.const 3)))
        (func (export "oob_entry") (result i32)
            (call_indirect (type $nullary) (i32.const 100)))
    )"#;
    assert_result(wat, "fib", &[Val::I32(8)], Val::I32(21));
    assert_result(wat, "fib", &[Val::I32(1)], Val::I32(1));
    assert_result(
        wat,
        "dispatch",
        &[Val::I32(0), Val::I32(40), Val::I32(2)],
        Val::I32(42),
    );
    assert_result(
        wat,
        "dispatch",
        &[Val::I32(1), Val::I32(40), Val::I32(2)],
        Val::I32(38),
    );
    assert_trap(wat, "bad_sig", &[], TrapKind::IndirectCallTypeMismatch);
    assert_trap(wat, "null_entry", &[], TrapKind::UndefinedElement);
    assert_trap(wat, "oob_entry", &[], TrapKind::UndefinedElement);
}

#[test]
fn globals() {
    let wat = r#"(module
        (global $counter (mut i64) (i64.const 40))
        (global $scale f64 (f64.const 2.5))
        (func (export "bump") (param i64) (result i64)
            (global.set $counter (i64.add (global.get $counter) (local.get 0)))
            (global.get $counter))
        (func (export "scale") (result f64) (global.get $scale))
    )"#;
    assert_result(wat, "bump", &[Val::I64(2)], Val::I64(42));
    assert_result(wat, "scale", &[], Val::from(2.5f64));
}

#[test]
fn unreachable_traps() {
    let wat = r#"(module
        (func (export "boom") (unreachable))
    )"#;
    assert_trap(wat, "boom", &[], TrapKind::Unreachable);
}

#[test]
fn multi_value() {
    let wat = r#"(module
        (func (export "swap") (param i32 i64) (result i64 i32)
            (local.get 1) (local.get 0))
        (func (export "divmod") (param i32 i32) (result i32 i32)
            (i32.div_u (local.get 0) (local.get 1))
            (i32.rem_u (local.get 0) (local.get 1)))
    )"#;
    let outcome = assert_equivalent(wat, "swap", &[Val::I32(7), Val::I64(9)]);
    assert_eq!(
        outcome,
        Outcome::Values(vec![(1, 9), (0, 7)]),
        "swap results"
    );
    let outcome = assert_equivalent(wat, "divmod", &[Val::I32(17), Val::I32(5)]);
    assert_eq!(outcome, Outcome::Values(vec![(0, 3), (0, 2)]));
}

#[test]
fn v128_bit_operations() {
    let wat = r#"(module
        (memory 1)
        (func (export "mix") (result i64)
            (v128.store (i32.const 0)
                (v128.xor
                    (v128.const i64x2 0x00ff00ff00ff00ff 0x1234567812345678)
                    (v128.not (v128.const i64x2 0 -1))))
            (i64.load (i32.const 0)))
        (func (export "any_true") (result i32)
            (v128.any_true (v128.const i64x2 0 1)))
        (func (export "bitselect") (result i64)
            (v128.store (i32.const 16)
                (v128.bitselect
                    (v128.const i64x2 -1 -1)
                    (v128.const i64x2 0 0)
                    (v128.const i64x2 0x00f0f00f0ff0f000 0)))
            (i64.load (i32.const 16)))
    )"#;
    assert_result(
        wat,
        "mix",
        &[],
        Val::I64((0x00ff00ff00ff00ffu64 ^ u64::MAX) as i64),
    );
    assert_result(wat, "any_true", &[], Val::I32(1));
    assert_result(wat, "bitselect", &[], Val::I64(0x00f0f00f0ff0f000));
}

#[test]
fn atomics_single_threaded() {
    let wat = r#"(module
        (memory 1 8 shared)
        (func (export "rmw_add") (param i32 i32) (result i32)
            (i32.atomic.rmw.add (local.get 0) (local.get 1)))
        (func (export "cmpxchg") (param i32 i32 i32) (result i32)
            (i32.atomic.rmw.cmpxchg (local.get 0) (local.get 1) (local.get 2)))
        (func (export "load") (param i32) (result i32)
            (i32.atomic.load (local.get 0)))
        (func (export "misaligned") (result i32)
            (i32.atomic.load (i32.const 2)))
        (func (export "notify") (result i32)
            (memory.atomic.notify (i32.const 0) (i32.const 1)))
    )"#;
    assert_result(
        wat,
        "rmw_add",
        &[Val::I32(8), Val::I32(5)],
        Val::I32(0),
    );
    assert_result(
        wat,
        "cmpxchg",
        &[Val::I32(16), Val::I32(0), Val::I32(9)],
        Val::I32(0),
    );
    assert_result(wat, "load", &[Val::I32(64)], Val::I32(0));
    assert_trap(wat, "misaligned", &[], TrapKind::OutOfBounds);
    assert_result(wat, "notify", &[], Val::I32(0));
}
