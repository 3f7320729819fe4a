//! Ensure that validation and compilation do not panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tern::{Config, Engine, Features, Module};

fuzz_target!(|data: &[u8]| {
    let features = Features::CORE_V1 | Features::CORE_V2 | Features::THREADS;
    let engine = Engine::new(Config::compiler().with_features(features));
    if let Ok(module) = Module::from_bytes(&engine, data) {
        module.close();
    }
});
