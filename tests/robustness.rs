// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compilation must never panic: arbitrary bytes either produce a typed
//! error or a module that closes cleanly. A deterministic mini-corpus of
//! hostile inputs; the fuzz target in `fuzz/` extends this with coverage
//! guidance.

use tern::{Config, Engine, Features, Module};

fn try_compile(engine: &Engine, bytes: &[u8]) {
    if let Ok(module) = Module::from_bytes(engine, bytes) {
        module.close();
    }
}

fn engines() -> Vec<Engine> {
    let features = Features::CORE_V1 | Features::CORE_V2 | Features::THREADS;
    let mut engines = vec![Engine::new(Config::interpreter().with_features(features))];
    if Engine::compiler_supported() {
        engines.push(Engine::new(Config::compiler().with_features(features)));
    }
    engines
}

#[test]
fn malformed_inputs_do_not_panic() {
    let corpus: Vec<Vec<u8>> = vec![
        vec![],
        vec![0x00],
        b"\0asm".to_vec(),
        b"\0asm\x01\x00\x00\x00".to_vec(),
        // Version 2.
        b"\0asm\x02\x00\x00\x00".to_vec(),
        // Truncated type section.
        b"\0asm\x01\x00\x00\x00\x01\x7f".to_vec(),
        // Section length longer than the input.
        b"\0asm\x01\x00\x00\x00\x03\xff\xff\xff\xff\x0f".to_vec(),
        // Function section without a type section.
        b"\0asm\x01\x00\x00\x00\x03\x02\x01\x00".to_vec(),
        // Start section referencing a missing function.
        b"\0asm\x01\x00\x00\x00\x08\x01\x05".to_vec(),
        // An unknown section id.
        b"\0asm\x01\x00\x00\x00\x0e\x01\x00".to_vec(),
        // Garbage tail behind a valid header.
        [b"\0asm\x01\x00\x00\x00".as_ref(), &[0xde; 64]].concat(),
    ];

    for engine in engines() {
        for bytes in &corpus {
            try_compile(&engine, bytes);
        }

        // A deterministic pseudo-random sweep; none of these should be valid
        // modules, none may panic.
        let mut state = 0x1234_5678_9abc_def0u64;
        let mut bytes = b"\0asm\x01\x00\x00\x00".to_vec();
        for _ in 0..4096 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            bytes.push((state >> 56) as u8);
            if bytes.len() % 97 == 0 {
                try_compile(&engine, &bytes);
            }
        }
        try_compile(&engine, &bytes);
    }
}

#[test]
fn validation_failures_are_typed_errors() {
    for engine in engines() {
        // Structurally sound, semantically invalid: the body leaves an f32
        // where an i32 result is declared. The text assembler emits this
        // verbatim; validation must reject it without panicking.
        let wat = r#"(module
            (func (export "bad") (result i32) (f32.const 1))
        )"#;
        let bytes = wat::parse_str(wat).unwrap();
        assert!(Module::from_bytes(&engine, &bytes).is_err());

        // A function section referencing an out-of-range type index,
        // assembled by hand.
        let bytes = [
            b"\0asm\x01\x00\x00\x00".as_ref(),
            &[0x01, 0x01, 0x00],       // type section, empty vec
            &[0x03, 0x02, 0x01, 0x05], // function section, index 5
        ]
        .concat();
        assert!(Module::from_bytes(&engine, &bytes).is_err());
    }
}
