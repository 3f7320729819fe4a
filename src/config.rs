// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use bitflags::bitflags;
use rand_core::RngCore;
use std::fmt;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// The WebAssembly feature sets a runtime can be configured with.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// The first finalized spec edition (MVP plus mutable globals).
        const CORE_V1 = 1 << 0;
        /// The second finalized spec edition: sign-extension, saturating
        /// truncation, multi-value, bulk memory, reference types and vectors.
        const CORE_V2 = 1 << 1;
        /// The threads proposal: shared memories and atomic operations.
        const THREADS = 1 << 2;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::CORE_V1 | Features::CORE_V2
    }
}

impl Features {
    pub(crate) fn to_wasmparser(self) -> wasmparser::WasmFeatures {
        let mut f = wasmparser::WasmFeatures::empty();
        f.insert(wasmparser::WasmFeatures::FLOATS);
        f.insert(wasmparser::WasmFeatures::GC_TYPES);
        if self.contains(Features::CORE_V1) {
            f.insert(wasmparser::WasmFeatures::MUTABLE_GLOBAL);
        }
        if self.contains(Features::CORE_V2) {
            f.insert(wasmparser::WasmFeatures::SIGN_EXTENSION);
            f.insert(wasmparser::WasmFeatures::SATURATING_FLOAT_TO_INT);
            f.insert(wasmparser::WasmFeatures::MULTI_VALUE);
            f.insert(wasmparser::WasmFeatures::BULK_MEMORY);
            f.insert(wasmparser::WasmFeatures::REFERENCE_TYPES);
            f.insert(wasmparser::WasmFeatures::SIMD);
        }
        if self.contains(Features::THREADS) {
            f.insert(wasmparser::WasmFeatures::THREADS);
        }
        f
    }
}

/// Which execution engine a runtime uses. The choice is made once at
/// [`Engine`](crate::Engine) construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Single-pass native code generation.
    Compiler,
    /// Dispatch loop over the pre-decoded operation stream.
    Interpreter,
}

/// Runtime-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) engine: EngineKind,
    pub(crate) features: Features,
    pub(crate) guard_pages: bool,
    pub(crate) max_displacement: Option<usize>,
    pub(crate) poll_loop_backedges: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineKind::Compiler,
            features: Features::default(),
            guard_pages: true,
            max_displacement: None,
            poll_loop_backedges: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the interpreter engine.
    pub fn interpreter() -> Self {
        Self {
            engine: EngineKind::Interpreter,
            ..Self::default()
        }
    }

    /// Selects the compiler engine. Falls back to the interpreter at
    /// [`Engine`](crate::Engine) construction when the host architecture has
    /// no backend.
    pub fn compiler() -> Self {
        Self {
            engine: EngineKind::Compiler,
            ..Self::default()
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Controls whether linear memories reserve their full address range up
    /// front so that growth never moves the base.
    pub fn with_guard_pages(mut self, enabled: bool) -> Self {
        self.guard_pages = enabled;
        self
    }

    /// Overrides the maximum displacement budget for the assembler constant
    /// pool. Advanced; the per-target defaults are correct for the supported
    /// instruction encodings.
    pub fn with_max_displacement(mut self, max: usize) -> Self {
        self.max_displacement = Some(max);
        self
    }

    /// Additionally polls the cancellation token on loop back-edges, not just
    /// at function entry.
    pub fn with_loop_backedge_polls(mut self, enabled: bool) -> Self {
        self.poll_loop_backedges = enabled;
        self
    }
}

/// A source of wall-clock or monotonic time, in nanoseconds.
pub type ClockFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Per-instance configuration: the name plus the system-interface capability
/// set. Omitted options default to discarding sinks and empty sources.
pub struct InstanceConfig {
    pub(crate) name: Option<String>,
    pub(crate) stdin: Option<Box<dyn Read + Send>>,
    pub(crate) stdout: Option<Box<dyn Write + Send>>,
    pub(crate) stderr: Option<Box<dyn Write + Send>>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) args: Vec<String>,
    pub(crate) random: Option<Box<dyn RngCore + Send>>,
    pub(crate) wall_clock: Option<ClockFn>,
    pub(crate) monotonic_clock: Option<ClockFn>,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("name", &self.name)
            .field("env", &self.env)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self {
            name: None,
            stdin: None,
            stdout: None,
            stderr: None,
            env: Vec::new(),
            args: Vec::new(),
            random: None,
            wall_clock: None,
            monotonic_clock: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_random(mut self, random: impl RngCore + Send + 'static) -> Self {
        self.random = Some(Box::new(random));
        self
    }

    pub fn with_wall_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.wall_clock = Some(Box::new(clock));
        self
    }

    pub fn with_monotonic_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.monotonic_clock = Some(Box::new(clock));
        self
    }

    pub(crate) fn default_wall_clock() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}
