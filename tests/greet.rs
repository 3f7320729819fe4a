// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guest/host string round-trip: the host writes a name into linear memory,
//! the guest builds `Hello, <name>!` there, the host reads it back.

use tern::{Config, Engine, Linker, Module, Store, TypedFunc};

const GREET: &str = r#"(module
    (memory (export "memory") 1)
    (data (i32.const 0) "Hello, ")
    (func (export "greet") (param $name i32) (param $len i32) (result i32 i32)
        (local $out i32)
        (local.set $out (i32.const 4096))
        ;; "Hello, "
        (memory.copy (local.get $out) (i32.const 0) (i32.const 7))
        ;; the name
        (memory.copy
            (i32.add (local.get $out) (i32.const 7))
            (local.get $name)
            (local.get $len))
        ;; "!"
        (i32.store8
            (i32.add (i32.add (local.get $out) (i32.const 7)) (local.get $len))
            (i32.const 33))
        (local.get $out)
        (i32.add (local.get $len) (i32.const 8)))
)"#;

fn engines() -> Vec<Engine> {
    let mut engines = vec![Engine::new(Config::interpreter())];
    if Engine::compiler_supported() {
        engines.push(Engine::new(Config::compiler()));
    }
    engines
}

#[test]
fn greet_round_trip() {
    for engine in engines() {
        let mut store = Store::new(&engine);
        let linker = Linker::new(&engine);
        let module = Module::from_bytes(&engine, &wat::parse_str(GREET).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();

        let memory = instance.get_memory(&mut store, "memory").unwrap();
        let name = b"wazero";
        memory.write(&mut store, 2048, name).unwrap();

        let greet: TypedFunc<(i32, i32), (i32, i32)> = instance
            .function(&mut store, "greet")
            .unwrap()
            .typed(&store)
            .unwrap();
        let (ptr, len) = greet
            .call(&mut store, (2048, i32::try_from(name.len()).unwrap()))
            .unwrap();

        let mut out = vec![0u8; usize::try_from(len).unwrap()];
        memory.read(&store, usize::try_from(ptr).unwrap(), &mut out).unwrap();
        assert_eq!(out, b"Hello, wazero!");
    }
}
