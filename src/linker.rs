// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The linker: name-based import resolution and instantiation.
//!
//! Host functions are defined once, store-independently, and materialize
//! into a store on first use at instantiation. Wasm-level definitions
//! (`define_instance`) carry store handles directly.

use crate::config::InstanceConfig;
use crate::engine::Engine;
use crate::errors::Error;
use crate::func::{HostFn, IntoFunc};
use crate::host::WasiCtx;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::module::Module;
use crate::store::{Store, StoreOpaque};
use crate::translate::{ConstExpr, ElementKind, EntityDesc};
use crate::types::FuncType;
use crate::vm::{self, memory_access, table_init_impl, ConstExprEvaluator, Imports, VMGlobal};
use crate::{Extern, Func};
use std::collections::HashMap;
use std::sync::Arc;

/// A name-indexed collection of definitions used to satisfy imports.
pub struct Linker {
    engine: Engine,
    definitions: HashMap<(String, String), Definition>,
}

enum Definition {
    Extern(Extern),
    HostFunc {
        ty: FuncType,
        func: Arc<HostFn>,
    },
}

impl Linker {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            definitions: HashMap::new(),
        }
    }

    fn insert(
        &mut self,
        module: &str,
        name: &str,
        definition: Definition,
    ) -> crate::Result<&mut Self> {
        let key = (module.to_string(), name.to_string());
        if self.definitions.contains_key(&key) {
            return Err(Error::AlreadyDefined {
                module: module.to_string(),
                field: name.to_string(),
            });
        }
        self.definitions.insert(key, definition);
        Ok(self)
    }

    /// Defines an extern (a handle exported from some instance) under
    /// `module::name`.
    pub fn define(
        &mut self,
        module: &str,
        name: &str,
        item: impl Into<Extern>,
    ) -> crate::Result<&mut Self> {
        self.insert(module, name, Definition::Extern(item.into()))
    }

    /// Defines a typed host function under `module::name`.
    pub fn func_wrap<Params, Results, F>(
        &mut self,
        module: &str,
        name: &str,
        func: F,
    ) -> crate::Result<&mut Self>
    where
        F: IntoFunc<Params, Results>,
    {
        let ty = F::ty();
        let host_fn: Arc<HostFn> = Arc::from(func.into_host_fn());
        self.insert(module, name, Definition::HostFunc { ty, func: host_fn })
    }

    /// Defines an untyped host function; the system-interface shims use
    /// this.
    pub(crate) fn define_host_raw(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: Arc<HostFn>,
    ) -> crate::Result<&mut Self> {
        self.insert(module, name, Definition::HostFunc { ty, func })
    }

    /// Defines every export of `instance` under `module::<export name>`.
    pub fn define_instance(
        &mut self,
        store: &mut Store,
        module: &str,
        instance: Instance,
    ) -> crate::Result<&mut Self> {
        let names: Vec<String> = instance.exports_opaque(store.opaque());
        for name in names {
            let item = instance
                .get_export(store.opaque_mut(), &name)
                .expect("export listed but not resolvable");
            self.insert(module, &name, Definition::Extern(item))?;
        }
        Ok(self)
    }

    /// Instantiates `module` with default (discarding) system-interface
    /// options.
    pub fn instantiate(&self, store: &mut Store, module: &Module) -> crate::Result<Instance> {
        self.instantiate_with(store, module, InstanceConfig::default())
    }

    /// Instantiates `module`: resolves imports, allocates the instance,
    /// applies segment initializers, attaches the system-interface context
    /// and runs the start function.
    pub fn instantiate_with(
        &self,
        store: &mut Store,
        module: &Module,
        config: InstanceConfig,
    ) -> crate::Result<Instance> {
        assert!(
            Engine::same(&self.engine, store.engine()),
            "linker and store belong to different engines"
        );
        let cached = module.cached()?;
        let store = store.opaque_mut();

        let imports = self.resolve_imports(store, &cached)?;
        let instance_id = vm::Instance::allocate(store, Arc::clone(&cached), imports)?;
        store.instance_mut(instance_id).wasi = Some(WasiCtx::new(config));

        let mut const_eval = ConstExprEvaluator::default();
        self.initialize_globals(store, instance_id, &mut const_eval);
        self.apply_table_segments(store, instance_id, &mut const_eval)?;
        self.apply_data_segments(store, instance_id, &mut const_eval)?;

        let instance = Instance::from_id(store, instance_id);

        if let Some(start) = cached.translated.start {
            self.run_start(store, instance_id, start)?;
        }

        tracing::debug!(
            module = ?cached.translated.name,
            instance = instance_id,
            "instantiated module"
        );
        Ok(instance)
    }

    fn resolve_imports(
        &self,
        store: &mut StoreOpaque,
        cached: &crate::module::CachedModule,
    ) -> crate::Result<Imports> {
        let mut imports = Imports::default();

        for import in &cached.translated.imports {
            let key = (import.module.clone(), import.name.clone());
            let link_error = |message: String| Error::Link {
                module: import.module.clone(),
                field: import.name.clone(),
                message,
            };
            let Some(definition) = self.definitions.get(&key) else {
                return Err(link_error("import not defined".into()));
            };

            match (&import.ty, definition) {
                (EntityDesc::Function(sig), Definition::HostFunc { ty, func }) => {
                    let expected = cached.shared_signatures[*sig];
                    let have = store.engine().type_registry().intern(ty);
                    if have != expected {
                        return Err(link_error(format!(
                            "function type mismatch: expected {}, found {ty}",
                            store.engine().type_registry().lookup(expected),
                        )));
                    }
                    let host = Arc::clone(func);
                    let func = store.define_host_func(
                        ty.clone(),
                        Box::new(move |caller, params, results| host(caller, params, results)),
                    );
                    imports.functions.push(func.vm_func_ref(store));
                }
                (EntityDesc::Function(sig), Definition::Extern(Extern::Func(func))) => {
                    let expected = cached.shared_signatures[*sig];
                    if func.type_index(store) != expected {
                        return Err(link_error(format!(
                            "function type mismatch: expected {}, found {}",
                            store.engine().type_registry().lookup(expected),
                            func.ty_opaque(store),
                        )));
                    }
                    imports.functions.push(func.vm_func_ref(store));
                }
                (EntityDesc::Table(expected), Definition::Extern(Extern::Table(table))) => {
                    let have = table.ty_opaque(store);
                    if !expected.is_compatible_with(&have) {
                        return Err(link_error("table type mismatch".into()));
                    }
                    let id = table.store_id(store);
                    let def = store.table(id).def_ptr();
                    imports.tables.push((id, def));
                }
                (EntityDesc::Memory(expected), Definition::Extern(Extern::Memory(memory))) => {
                    let have = memory.ty_opaque(store);
                    if !expected.is_compatible_with(&have) {
                        return Err(link_error("memory type mismatch".into()));
                    }
                    imports.memories.push(memory.store_id(store));
                }
                (EntityDesc::Global(expected), Definition::Extern(Extern::Global(global))) => {
                    let have = global.ty_opaque(store);
                    if have.content != expected.content || have.mutable != expected.mutable {
                        return Err(link_error("global type mismatch".into()));
                    }
                    imports.globals.push(global.definition(store));
                }
                (expected, _) => {
                    let kind = match expected {
                        EntityDesc::Function(_) => "function",
                        EntityDesc::Table(_) => "table",
                        EntityDesc::Memory(_) => "memory",
                        EntityDesc::Global(_) => "global",
                    };
                    return Err(link_error(format!("expected a {kind} import")));
                }
            }
        }

        Ok(imports)
    }

    fn initialize_globals(
        &self,
        store: &mut StoreOpaque,
        instance_id: usize,
        const_eval: &mut ConstExprEvaluator,
    ) {
        let module = Arc::clone(&store.instance(instance_id).module);
        for (def_index, expr) in module.translated.global_initializers.iter() {
            let value = const_eval.eval(store, instance_id, expr);
            let index = crate::indices::GlobalIndex::from_u32(
                module.translated.num_imported_globals + def_index.as_u32(),
            );
            let cell = store.instance(instance_id).global_ptr(index);
            // Safety: cells were allocated with the instance.
            unsafe { *cell = VMGlobal::from_vmval(value) };
        }
    }

    fn apply_table_segments(
        &self,
        store: &mut StoreOpaque,
        instance_id: usize,
        const_eval: &mut ConstExprEvaluator,
    ) -> crate::Result<()> {
        let module = Arc::clone(&store.instance(instance_id).module);
        for (elem_index, segment) in module.translated.element_segments.iter() {
            match &segment.kind {
                ElementKind::Active {
                    table_index,
                    offset,
                } => {
                    let offset = eval_u32(store, instance_id, const_eval, offset);
                    table_init_impl(
                        store,
                        instance_id,
                        elem_index,
                        *table_index,
                        u64::from(offset),
                        0,
                        segment.elements.len() as u64,
                    )
                    .map_err(Error::trap)?;
                    // Active segments behave as dropped after instantiation.
                    store
                        .instance_mut(instance_id)
                        .dropped_elements
                        .insert(elem_index);
                }
                ElementKind::Declared => {
                    store
                        .instance_mut(instance_id)
                        .dropped_elements
                        .insert(elem_index);
                }
                ElementKind::Passive => {}
            }
        }
        Ok(())
    }

    fn apply_data_segments(
        &self,
        store: &mut StoreOpaque,
        instance_id: usize,
        const_eval: &mut ConstExprEvaluator,
    ) -> crate::Result<()> {
        let module = Arc::clone(&store.instance(instance_id).module);
        for (data_index, segment) in module.translated.data_segments.iter() {
            let Some((memory_index, offset)) = &segment.active else {
                continue;
            };
            let offset = eval_u32(store, instance_id, const_eval, offset);
            let memory_id = store.instance(instance_id).memory_id(*memory_index);
            let def = store.memory(memory_id).def_ptr();
            // Safety: definition pinned; range checked by memory_access.
            unsafe {
                let ptr = memory_access(&*def, u64::from(offset), segment.data.len() as u64)
                    .map_err(Error::trap)?;
                core::ptr::copy_nonoverlapping(segment.data.as_ptr(), ptr, segment.data.len());
            }
            store
                .instance_mut(instance_id)
                .dropped_data
                .insert(data_index);
        }
        Ok(())
    }

    fn run_start(
        &self,
        store: &mut StoreOpaque,
        instance_id: usize,
        start: FuncIndex,
    ) -> crate::Result<()> {
        let func_ref = store.instance(instance_id).func_ref_ptr(start);
        // Safety: start funcrefs are flagged escaping at translation.
        let func = unsafe { Func::from_vm_func_ref(store, func_ref) }
            .expect("start function resolves to a funcref");
        tracing::trace!(instance = instance_id, "running start function");
        func.call_opaque(store, &[], &mut [])
    }
}

fn eval_u32(
    store: &StoreOpaque,
    instance_id: usize,
    const_eval: &mut ConstExprEvaluator,
    expr: &ConstExpr,
) -> u32 {
    const_eval.eval(store, instance_id, expr).get_i32() as u32
}
