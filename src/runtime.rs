// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The all-in-one runtime facade.
//!
//! [`Runtime`] bundles an [`Engine`], a [`Store`] and a [`Linker`] with the
//! system-interface imports pre-registered: compile, instantiate, look up a
//! function, call it. The underlying pieces stay reachable for callers that
//! want to drive them directly.

use crate::config::{Config, InstanceConfig};
use crate::engine::Engine;
use crate::host;
use crate::instance::Instance;
use crate::linker::Linker;
use crate::module::Module;
use crate::store::Store;
use crate::{Func, Val};

pub struct Runtime {
    engine: Engine,
    store: Store,
    linker: Linker,
    /// Modules in creation order; closed in reverse on drop.
    modules: Vec<Module>,
}

impl Runtime {
    /// Creates a runtime with the system-interface imports registered.
    pub fn new(config: Config) -> crate::Result<Runtime> {
        let engine = Engine::new(config);
        let store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        host::define_wasi(&mut linker)?;
        Ok(Runtime {
            engine,
            store,
            linker,
            modules: Vec::new(),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn linker_mut(&mut self) -> &mut Linker {
        &mut self.linker
    }

    /// Validates and compiles a binary.
    pub fn compile_module(&mut self, bytes: &[u8]) -> crate::Result<Module> {
        let module = Module::from_bytes(&self.engine, bytes)?;
        self.modules.push(module.clone());
        Ok(module)
    }

    /// Instantiates `module` with default (discarding) options, running its
    /// start function.
    pub fn instantiate(&mut self, module: &Module) -> crate::Result<Instance> {
        self.linker.instantiate(&mut self.store, module)
    }

    /// Instantiates `module` with the given system-interface options.
    pub fn instantiate_with(
        &mut self,
        module: &Module,
        config: InstanceConfig,
    ) -> crate::Result<Instance> {
        self.linker.instantiate_with(&mut self.store, module, config)
    }

    /// Registers an instance's exports for subsequent instantiations.
    pub fn define_instance(&mut self, name: &str, instance: Instance) -> crate::Result<()> {
        self.linker
            .define_instance(&mut self.store, name, instance)?;
        Ok(())
    }

    /// Looks up an exported function.
    pub fn function(&mut self, instance: Instance, name: &str) -> Option<Func> {
        instance.function(&mut self.store, name)
    }

    /// Calls an exported function by handle.
    pub fn call(&mut self, func: Func, params: &[Val], results: &mut [Val]) -> crate::Result<()> {
        func.call(&mut self.store, params, results)
    }

    /// Closes every module in reverse creation order. Also happens on drop.
    pub fn close(mut self) {
        self.close_modules();
    }

    fn close_modules(&mut self) {
        for module in self.modules.drain(..).rev() {
            module.close();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.close_modules();
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("modules", &self.modules.len())
            .finish_non_exhaustive()
    }
}
