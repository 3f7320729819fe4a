// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::config::{Config, EngineKind};
use crate::indices::SharedTypeIndex;
use crate::module::{CachedModule, Fingerprint};
use crate::types::FuncType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The engine: global compilation configuration, the canonical type
/// registry, and the artifact cache. Cheap to clone; all modules created
/// from one engine share it.
///
/// The execution strategy (compiler or interpreter) is fixed at
/// construction. Requesting the compiler on a host without a backend falls
/// back to the interpreter with a warning.
#[derive(Debug, Clone)]
pub struct Engine(Arc<EngineInner>);

#[derive(Debug)]
struct EngineInner {
    config: Config,
    strategy: EngineKind,
    type_registry: TypeRegistry,
    artifact_cache: Mutex<HashMap<Fingerprint, Arc<CachedModule>>>,
}

// ===== impl Engine =====

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    pub fn new(config: Config) -> Engine {
        let strategy = match config.engine {
            EngineKind::Compiler if Self::compiler_supported() => EngineKind::Compiler,
            EngineKind::Compiler => {
                tracing::warn!(
                    "compiler engine not supported on this architecture, \
                     falling back to the interpreter"
                );
                EngineKind::Interpreter
            }
            EngineKind::Interpreter => EngineKind::Interpreter,
        };
        Engine(Arc::new(EngineInner {
            config,
            strategy,
            type_registry: TypeRegistry::default(),
            artifact_cache: Mutex::new(HashMap::new()),
        }))
    }

    /// Whether the single-pass compiler backend exists for the host.
    pub fn compiler_supported() -> bool {
        cfg!(all(target_arch = "x86_64", unix))
    }

    pub fn same(lhs: &Engine, rhs: &Engine) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.0.config
    }

    /// The execution strategy actually in effect.
    pub fn strategy(&self) -> EngineKind {
        self.0.strategy
    }

    /// Returns the type registry of this engine, used to canonicalize
    /// function signatures for indirect-call checks.
    pub(crate) fn type_registry(&self) -> &TypeRegistry {
        &self.0.type_registry
    }

    pub(crate) fn cache_get(&self, fingerprint: &Fingerprint) -> Option<Arc<CachedModule>> {
        self.0
            .artifact_cache
            .lock()
            .expect("artifact cache poisoned")
            .get(fingerprint)
            .cloned()
    }

    pub(crate) fn cache_insert(&self, fingerprint: Fingerprint, module: Arc<CachedModule>) {
        self.0
            .artifact_cache
            .lock()
            .expect("artifact cache poisoned")
            .insert(fingerprint, module);
    }

    pub(crate) fn cache_remove(&self, fingerprint: &Fingerprint) {
        self.0
            .artifact_cache
            .lock()
            .expect("artifact cache poisoned")
            .remove(fingerprint);
    }
}

/// Interns function signatures so an indirect call compares two `u32`s
/// instead of two structural types.
#[derive(Debug, Default)]
pub(crate) struct TypeRegistry {
    inner: Mutex<TypeRegistryInner>,
}

#[derive(Debug, Default)]
struct TypeRegistryInner {
    map: HashMap<FuncType, SharedTypeIndex>,
    types: Vec<FuncType>,
}

impl TypeRegistry {
    pub fn intern(&self, ty: &FuncType) -> SharedTypeIndex {
        let mut inner = self.inner.lock().expect("type registry poisoned");
        if let Some(index) = inner.map.get(ty) {
            return *index;
        }
        let index = SharedTypeIndex::from_u32(u32::try_from(inner.types.len()).unwrap());
        inner.types.push(ty.clone());
        inner.map.insert(ty.clone(), index);
        index
    }

    pub fn lookup(&self, index: SharedTypeIndex) -> FuncType {
        let inner = self.inner.lock().expect("type registry poisoned");
        inner.types[index.as_u32() as usize].clone()
    }
}
