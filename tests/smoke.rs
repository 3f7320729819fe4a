// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use tern::{CancelToken, Config, Engine, Linker, Module, Store, TrapKind, TypedFunc, Val};

const FIB: &str = r#"(module
    (func $fib (export "fib") (param i32) (result i32)
        (if (result i32) (i32.lt_u (local.get 0) (i32.const 2))
            (then (local.get 0))
            (else (i32.add
                (call $fib (i32.sub (local.get 0) (i32.const 1)))
                (call $fib (i32.sub (local.get 0) (i32.const 2)))))))
)"#;

fn engines() -> Vec<Engine> {
    let mut engines = vec![Engine::new(Config::interpreter())];
    if Engine::compiler_supported() {
        engines.push(Engine::new(Config::compiler()));
    }
    engines
}

#[test]
fn fib_typed_call() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let module = Module::from_bytes(&engine, &wat::parse_str(FIB).unwrap()).unwrap();

        let instance = linker.instantiate(&mut store, &module).unwrap();
        let func = instance.function(&mut store, "fib").unwrap();
        let func: TypedFunc<i32, i32> = func.typed(&store).unwrap();

        assert_eq!(func.call(&mut store, 8).unwrap(), 21);
        assert_eq!(func.call(&mut store, 20).unwrap(), 6765);
    }
}

#[test]
fn host_function_roundtrip() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        linker
            .func_wrap("env", "roundtrip_i64", |arg: u64| -> u64 { arg })
            .unwrap();
        linker
            .func_wrap("env", "add3", |a: i32, b: i32, c: i32| -> i32 { a + b + c })
            .unwrap();

        let wat = r#"(module
            (import "env" "roundtrip_i64" (func $rt (param i64) (result i64)))
            (import "env" "add3" (func $add3 (param i32 i32 i32) (result i32)))
            (func (export "run") (param i64) (result i64)
                (call $rt (local.get 0)))
            (func (export "sum") (result i32)
                (call $add3 (i32.const 1) (i32.const 2) (i32.const 39)))
        )"#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();

        let run: TypedFunc<u64, u64> = instance
            .function(&mut store, "run")
            .unwrap()
            .typed(&store)
            .unwrap();
        assert_eq!(run.call(&mut store, 0xdead_beef).unwrap(), 0xdead_beef);

        let sum: TypedFunc<(), i32> = instance
            .function(&mut store, "sum")
            .unwrap()
            .typed(&store)
            .unwrap();
        assert_eq!(sum.call(&mut store, ()).unwrap(), 42);
    }
}

#[test]
fn host_function_error_propagates() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        linker
            .func_wrap("env", "fail", || -> tern::Result<i32> {
                Err(tern::Error::Host("deliberate".into()))
            })
            .unwrap();

        let wat = r#"(module
            (import "env" "fail" (func $fail (result i32)))
            (func (export "run") (result i32) (call $fail))
        )"#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let func = instance.function(&mut store, "run").unwrap();

        let err = func.call(&mut store, &[], &mut [Val::I32(0)]).unwrap_err();
        assert!(matches!(err, tern::Error::Host(_)), "got {err}");
    }
}

#[test]
fn start_function_runs_at_instantiation() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let wat = r#"(module
            (memory (export "memory") 1)
            (func $init (i32.store (i32.const 0) (i32.const 1234)))
            (start $init)
        )"#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let memory = instance.get_memory(&mut store, "memory").unwrap();

        let mut buf = [0u8; 4];
        memory.read(&store, 0, &mut buf).unwrap();
        assert_eq!(i32::from_le_bytes(buf), 1234);
    }
}

#[test]
fn cancellation_interrupts_entry() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let module = Module::from_bytes(&engine, &wat::parse_str(FIB).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let func = instance.function(&mut store, "fib").unwrap();

        let token: CancelToken = store.cancel_token();
        token.cancel();
        let err = func
            .call(&mut store, &[Val::I32(30)], &mut [Val::I32(0)])
            .unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::Cancelled));
    }
}

#[test]
fn stack_exhaustion_traps() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let wat = r#"(module
            (func $loop (export "loop") (result i32)
                (i32.add (call $loop) (i32.const 1)))
        )"#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let func = instance.function(&mut store, "loop").unwrap();

        let err = func.call(&mut store, &[], &mut [Val::I32(0)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::StackExhausted));
    }
}

#[test]
fn artifact_cache_reuses_compilations() {
    let engine = Engine::new(Config::interpreter());
    let wasm = wat::parse_str(FIB).unwrap();
    let a = Module::from_bytes(&engine, &wasm).unwrap();
    let b = Module::from_bytes(&engine, &wasm).unwrap();

    // Both modules instantiate and behave identically; the second hit the
    // engine cache.
    let mut store = Store::new(&engine);
    let linker = Linker::new(&engine);
    for module in [&a, &b] {
        let instance = linker.instantiate(&mut store, module).unwrap();
        let fib: TypedFunc<i32, i32> = instance
            .function(&mut store, "fib")
            .unwrap()
            .typed(&store)
            .unwrap();
        assert_eq!(fib.call(&mut store, 10).unwrap(), 55);
    }
}

#[test]
fn serialized_artifact_round_trips() {
    if !Engine::compiler_supported() {
        return;
    }
    let engine = Engine::new(Config::compiler());
    let wasm = wat::parse_str(FIB).unwrap();
    let module = Module::from_bytes(&engine, &wasm).unwrap();
    let blob = module.serialize().unwrap();

    let restored = Module::deserialize(&engine, &wasm, &blob).unwrap();
    let mut store = Store::new(&engine);
    let linker = Linker::new(&engine);
    let instance = linker.instantiate(&mut store, &restored).unwrap();
    let fib: TypedFunc<i32, i32> = instance
        .function(&mut store, "fib")
        .unwrap()
        .typed(&store)
        .unwrap();
    assert_eq!(fib.call(&mut store, 12).unwrap(), 144);

    // A blob from different bytes is rejected.
    let other = wat::parse_str("(module)").unwrap();
    assert!(Module::deserialize(&engine, &other, &blob).is_err());
}
