// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compiled modules.
//!
//! A [`Module`] is the immutable product of validating and compiling (or
//! pre-decoding) one binary. The heavyweight state (translated structure,
//! canonical signatures, the executable artifact) lives in a shared
//! [`CachedModule`]: instances hold their own reference, so closing the
//! module only cuts the module's and the engine cache's references while
//! running instances stay safe. The executable region is unmapped when the
//! last reference drops.

use crate::compile;
use crate::config::EngineKind;
use crate::engine::Engine;
use crate::errors::Error;
use crate::indices::{DefinedFuncIndex, SharedTypeIndex, TypeIndex};
use crate::translate::{FunctionIr, ModuleTranslator, TranslatedModule};
use crate::types::ExternType;
use crate::vm::{self, VMArrayCallFunction};
use crate::wasm_unsupported;
use cranelift_entity::PrimaryMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};
use wasmparser::Validator;

/// Stable identity of an artifact: a hash over the input binary, the enabled
/// feature flags, the execution strategy and the target architecture.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub(crate) fn compute(engine: &Engine, bytes: &[u8]) -> Self {
        let config = engine.config();
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.update(config.features.bits().to_le_bytes());
        hasher.update([
            match engine.strategy() {
                EngineKind::Compiler => 0u8,
                EngineKind::Interpreter => 1u8,
            },
            u8::from(config.guard_pages),
            u8::from(config.poll_loop_backedges),
        ]);
        hasher.update(std::env::consts::ARCH.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…)")
    }
}

/// The per-function execution artifact: native code offsets for the
/// compiler, the pre-decoded operation stream for the interpreter.
#[derive(Debug)]
pub enum ModuleArtifact {
    Compiled(compile::CompiledArtifact),
    Interpreted {
        ir: PrimaryMap<DefinedFuncIndex, FunctionIr>,
    },
}

/// The shared, immutable compilation product.
#[derive(Debug)]
pub struct CachedModule {
    pub translated: TranslatedModule,
    pub shared_signatures: PrimaryMap<TypeIndex, SharedTypeIndex>,
    pub artifact: ModuleArtifact,
}

impl CachedModule {
    /// The array-call entry point of a defined function.
    pub fn func_entry(&self, index: DefinedFuncIndex) -> VMArrayCallFunction {
        match &self.artifact {
            ModuleArtifact::Compiled(artifact) => artifact.func_entry(index),
            ModuleArtifact::Interpreted { .. } => vm::interpreter_entry,
        }
    }

    /// The IR of a defined function; interpreter artifacts only.
    pub fn function_ir(&self, index: DefinedFuncIndex) -> &FunctionIr {
        match &self.artifact {
            ModuleArtifact::Interpreted { ir } => &ir[index],
            ModuleArtifact::Compiled(_) => {
                unreachable!("requested IR from a natively compiled module")
            }
        }
    }
}

/// A compiled WebAssembly module, ready for instantiation.
#[derive(Debug, Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

#[derive(Debug)]
struct ModuleInner {
    engine: Engine,
    cached: RwLock<Option<Arc<CachedModule>>>,
    fingerprint: Fingerprint,
    name: Option<String>,
}

impl Module {
    /// Validates and compiles `bytes` with the engine's configured strategy.
    /// Results are cached per fingerprint; recompiling the same binary with
    /// the same configuration reuses the artifact.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> crate::Result<Module> {
        let fingerprint = Fingerprint::compute(engine, bytes);

        let cached = match engine.cache_get(&fingerprint) {
            Some(cached) => {
                tracing::debug!(?fingerprint, "artifact cache hit");
                cached
            }
            None => {
                let cached = Arc::new(Self::build(engine, bytes, None)?);
                engine.cache_insert(fingerprint, Arc::clone(&cached));
                cached
            }
        };

        let name = cached.translated.name.clone();
        Ok(Module {
            inner: Arc::new(ModuleInner {
                engine: engine.clone(),
                cached: RwLock::new(Some(cached)),
                fingerprint,
                name,
            }),
        })
    }

    /// Rebuilds a module from its original bytes plus a serialized artifact
    /// blob, skipping native code generation. The blob's fingerprint must
    /// match the engine configuration and input bytes.
    pub fn deserialize(engine: &Engine, bytes: &[u8], blob: &[u8]) -> crate::Result<Module> {
        let fingerprint = Fingerprint::compute(engine, bytes);
        let artifact = compile::deserialize_artifact(blob, &fingerprint.0)?;

        let cached = Arc::new(Self::build(engine, bytes, Some(artifact))?);
        engine.cache_insert(fingerprint, Arc::clone(&cached));

        let name = cached.translated.name.clone();
        Ok(Module {
            inner: Arc::new(ModuleInner {
                engine: engine.clone(),
                cached: RwLock::new(Some(cached)),
                fingerprint,
                name,
            }),
        })
    }

    fn build(
        engine: &Engine,
        bytes: &[u8],
        prebuilt: Option<compile::CompiledArtifact>,
    ) -> crate::Result<CachedModule> {
        let config = engine.config();
        let mut validator = Validator::new_with_features(config.features.to_wasmparser());
        let translation =
            ModuleTranslator::new(&mut validator, config.poll_loop_backedges).translate(bytes)?;

        let shared_signatures: PrimaryMap<TypeIndex, SharedTypeIndex> = translation
            .module
            .types
            .iter()
            .map(|(_, ty)| engine.type_registry().intern(ty))
            .collect();

        let artifact = match (engine.strategy(), prebuilt) {
            (_, Some(artifact)) => ModuleArtifact::Compiled(artifact),
            (EngineKind::Compiler, None) => ModuleArtifact::Compiled(compile::compile_module(
                &translation,
                &shared_signatures,
                config,
            )?),
            (EngineKind::Interpreter, None) => ModuleArtifact::Interpreted {
                ir: translation.function_ir,
            },
        };

        Ok(CachedModule {
            translated: translation.module,
            shared_signatures,
            artifact,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// The module's name from its name section, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The declared imports as `(module, name, type)` triples.
    pub fn imports(&self) -> crate::Result<Vec<(String, String, ExternType)>> {
        let cached = self.cached()?;
        let registry = self.inner.engine.type_registry();
        Ok(cached
            .translated
            .imports
            .iter()
            .map(|import| {
                let ty = match &import.ty {
                    crate::translate::EntityDesc::Function(sig) => {
                        ExternType::Func(registry.lookup(cached.shared_signatures[*sig]))
                    }
                    crate::translate::EntityDesc::Table(ty) => ExternType::Table(*ty),
                    crate::translate::EntityDesc::Memory(ty) => ExternType::Memory(*ty),
                    crate::translate::EntityDesc::Global(ty) => ExternType::Global(*ty),
                };
                (import.module.clone(), import.name.clone(), ty)
            })
            .collect())
    }

    /// Serializes the native artifact into an opaque blob keyed by the
    /// module's fingerprint. Interpreter artifacts have nothing to persist.
    pub fn serialize(&self) -> crate::Result<Vec<u8>> {
        let cached = self.cached()?;
        match &cached.artifact {
            ModuleArtifact::Compiled(artifact) => {
                Ok(compile::serialize_artifact(artifact, &self.inner.fingerprint.0))
            }
            ModuleArtifact::Interpreted { .. } => {
                Err(wasm_unsupported!("serializing an interpreter artifact"))
            }
        }
    }

    /// Releases the module's executable memory and evicts its cached
    /// artifact. Idempotent; running instances keep their own reference and
    /// stay valid, new instantiations fail with [`Error::Closed`].
    pub fn close(&self) {
        let mut cached = self.inner.cached.write().expect("module lock poisoned");
        if cached.take().is_some() {
            self.inner.engine.cache_remove(&self.inner.fingerprint);
            tracing::debug!(name = ?self.inner.name, "module closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .cached
            .read()
            .expect("module lock poisoned")
            .is_none()
    }

    pub(crate) fn cached(&self) -> crate::Result<Arc<CachedModule>> {
        self.inner
            .cached
            .read()
            .expect("module lock poisoned")
            .clone()
            .ok_or(Error::Closed)
    }
}
