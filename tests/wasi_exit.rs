// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System-interface exit semantics: a guest calling `proc_exit` surfaces as
//! a typed exit error carrying the code, from the start function included.

use std::io::Write;
use std::sync::{Arc, Mutex};
use tern::{Config, InstanceConfig, Runtime};

/// `wat2wasm exit_on_start.wat`, in source form.
const EXIT_ON_START: &str = r#"(module $exit_on_start
    (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
    (func $main (call $proc_exit (i32.const 2)))
    (start $main)
)"#;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn configs() -> Vec<Config> {
    let mut configs = vec![Config::interpreter()];
    if tern::Engine::compiler_supported() {
        configs.push(Config::compiler());
    }
    configs
}

#[test]
fn exit_on_start_surfaces_exit_code() {
    for config in configs() {
        let mut runtime = Runtime::new(config).unwrap();
        let module = runtime
            .compile_module(&wat::parse_str(EXIT_ON_START).unwrap())
            .unwrap();

        let stdout = SharedBuf::default();
        let err = runtime
            .instantiate_with(
                &module,
                InstanceConfig::new()
                    .with_name("wasi-demo")
                    .with_stdout(stdout.clone()),
            )
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(2), "got {err}");
    }
}

#[test]
fn fd_write_reaches_configured_stdout() {
    for config in configs() {
        let mut runtime = Runtime::new(config).unwrap();
        let wat = r#"(module
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 64) "hi from wasm\n")
            (func $main
                ;; iovec { base = 64, len = 13 } at address 0
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const 13))
                (drop (call $fd_write
                    (i32.const 1)   ;; stdout
                    (i32.const 0)   ;; iovs
                    (i32.const 1)   ;; iovs_len
                    (i32.const 32)  ;; nwritten
                )))
            (start $main)
        )"#;
        let module = runtime.compile_module(&wat::parse_str(wat).unwrap()).unwrap();

        let stdout = SharedBuf::default();
        runtime
            .instantiate_with(&module, InstanceConfig::new().with_stdout(stdout.clone()))
            .unwrap();

        let written = stdout.0.lock().unwrap().clone();
        assert_eq!(written, b"hi from wasm\n");
    }
}

#[test]
fn args_and_environ_round_trip() {
    for config in configs() {
        let mut runtime = Runtime::new(config).unwrap();
        let wat = r#"(module
            (import "wasi_snapshot_preview1" "args_sizes_get"
                (func $args_sizes_get (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "argc") (result i32)
                (drop (call $args_sizes_get (i32.const 0) (i32.const 4)))
                (i32.load (i32.const 0)))
        )"#;
        let module = runtime.compile_module(&wat::parse_str(wat).unwrap()).unwrap();
        let instance = runtime
            .instantiate_with(
                &module,
                InstanceConfig::new().with_args(["prog", "one", "two"]),
            )
            .unwrap();
        let argc = runtime.function(instance, "argc").unwrap();
        let mut results = vec![tern::Val::I32(0)];
        runtime.call(argc, &[], &mut results).unwrap();
        assert!(matches!(results[0], tern::Val::I32(3)));
    }
}
