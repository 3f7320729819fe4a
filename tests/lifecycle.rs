// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Module and instance lifecycle: close is idempotent, anything used after
//! close reports an error instead of undefined behavior, and running
//! instances survive their module being closed.

use tern::{Config, Engine, Error, Linker, Module, Store, TypedFunc, Val};

const ANSWER: &str = r#"(module
    (func (export "answer") (result i32) (i32.const 42))
)"#;

fn engines() -> Vec<Engine> {
    let mut engines = vec![Engine::new(Config::interpreter())];
    if Engine::compiler_supported() {
        engines.push(Engine::new(Config::compiler()));
    }
    engines
}

#[test]
fn module_close_is_idempotent() {
    for engine in engines() {
        let module = Module::from_bytes(&engine, &wat::parse_str(ANSWER).unwrap()).unwrap();
        assert!(!module.is_closed());
        module.close();
        assert!(module.is_closed());
        module.close();
        module.close();
        assert!(module.is_closed());
    }
}

#[test]
fn instantiation_after_close_fails() {
    for engine in engines() {
        let module = Module::from_bytes(&engine, &wat::parse_str(ANSWER).unwrap()).unwrap();
        module.close();

        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        assert!(matches!(
            linker.instantiate(&mut store, &module),
            Err(Error::Closed)
        ));
    }
}

#[test]
fn running_instances_survive_module_close() {
    for engine in engines() {
        let module = Module::from_bytes(&engine, &wat::parse_str(ANSWER).unwrap()).unwrap();
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let answer: TypedFunc<(), i32> = instance
            .function(&mut store, "answer")
            .unwrap()
            .typed(&store)
            .unwrap();

        // Closing the module drops its own artifact reference; the instance
        // keeps the code alive through its own.
        module.close();
        assert_eq!(answer.call(&mut store, ()).unwrap(), 42);
    }
}

#[test]
fn calls_on_closed_instance_fail() {
    for engine in engines() {
        let module = Module::from_bytes(&engine, &wat::parse_str(ANSWER).unwrap()).unwrap();
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let func = instance.function(&mut store, "answer").unwrap();

        instance.close(&mut store);
        // Idempotent.
        instance.close(&mut store);
        assert!(instance.is_closed(&store));

        let err = func.call(&mut store, &[], &mut [Val::I32(0)]).unwrap_err();
        assert!(matches!(err, Error::Closed), "got {err}");
    }
}

#[test]
fn close_evicts_the_artifact_cache() {
    for engine in engines() {
        let wasm = wat::parse_str(ANSWER).unwrap();
        let module = Module::from_bytes(&engine, &wasm).unwrap();
        module.close();

        // A recompile after close must produce a fresh, working module, not
        // resurrect the evicted artifact.
        let module = Module::from_bytes(&engine, &wasm).unwrap();
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let answer: TypedFunc<(), i32> = instance
            .function(&mut store, "answer")
            .unwrap()
            .typed(&store)
            .unwrap();
        assert_eq!(answer.call(&mut store, ()).unwrap(), 42);
    }
}

#[test]
fn link_errors_are_reported() {
    for engine in engines() {
        let wat = r#"(module
            (import "env" "missing" (func (param i32)))
        )"#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let err = linker.instantiate(&mut store, &module).unwrap_err();
        assert!(matches!(err, Error::Link { .. }), "got {err}");
    }
}

#[test]
fn mistyped_import_is_a_link_error() {
    for engine in engines() {
        let wat = r#"(module
            (import "env" "f" (func (param i32) (result i32)))
        )"#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        linker.func_wrap("env", "f", |x: i64| -> i64 { x }).unwrap();
        let err = linker.instantiate(&mut store, &module).unwrap_err();
        assert!(matches!(err, Error::Link { .. }), "got {err}");
    }
}
