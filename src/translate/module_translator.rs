// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::errors::validation_error;
use crate::indices::{
    EntityIndex, FuncIndex, FuncRefIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex,
};
use cranelift_entity::packed_option::ReservedValue;
use crate::translate::func_translator::FuncTranslator;
use crate::translate::{
    ConstExpr, DataSegment, ElementKind, ElementSegment, EntityDesc, FunctionDesc,
    ModuleTranslation,
};
use crate::types::{FuncType, GlobalType, MemoryType, TableType};
use crate::wasm_unsupported;
use wasmparser::{
    CompositeInnerType, DataKind, DataSectionReader, ElementItems, ElementKind as ParserElementKind,
    ElementSectionReader, ExportSectionReader, ExternalKind, FunctionSectionReader,
    GlobalSectionReader, ImportSectionReader, MemorySectionReader, Parser, Payload,
    TableSectionReader, TypeRef, TypeSectionReader, Validator,
};

/// A translator for converting the output of `wasmparser` into the types used
/// by this crate.
pub struct ModuleTranslator<'a> {
    result: ModuleTranslation,
    validator: &'a mut Validator,
    insert_cancel_polls: bool,
}

impl<'a> ModuleTranslator<'a> {
    pub fn new(validator: &'a mut Validator, insert_cancel_polls: bool) -> Self {
        Self {
            result: ModuleTranslation::default(),
            validator,
            insert_cancel_polls,
        }
    }

    /// Translate raw WASM bytes into a [`ModuleTranslation`].
    pub fn translate(mut self, data: &[u8]) -> crate::Result<ModuleTranslation> {
        let mut parser = Parser::default();
        parser.set_features(*self.validator.features());

        for payload in parser.parse_all(data) {
            self.translate_payload(payload?)?;
        }

        self.validator.reset();

        debug_assert!(
            self.result.module.functions.len()
                >= self.result.module.num_imported_functions as usize
        );

        Ok(self.result)
    }

    fn translate_payload(&mut self, payload: Payload<'_>) -> crate::Result<()> {
        match payload {
            Payload::Version {
                num,
                encoding,
                range,
            } => {
                self.validator
                    .version(num, encoding, &range)
                    .map_err(validation_error)?;
            }
            Payload::TypeSection(types) => {
                self.validator
                    .type_section(&types)
                    .map_err(validation_error)?;
                self.translate_type_section(types)?;
            }
            Payload::ImportSection(imports) => {
                self.validator
                    .import_section(&imports)
                    .map_err(validation_error)?;
                self.translate_import_section(imports)?;
            }
            Payload::FunctionSection(functions) => {
                self.validator
                    .function_section(&functions)
                    .map_err(validation_error)?;
                self.translate_function_section(functions)?;
            }
            Payload::TableSection(tables) => {
                self.validator
                    .table_section(&tables)
                    .map_err(validation_error)?;
                self.translate_table_section(tables)?;
            }
            Payload::MemorySection(memories) => {
                self.validator
                    .memory_section(&memories)
                    .map_err(validation_error)?;
                self.translate_memory_section(memories)?;
            }
            Payload::TagSection(tags) => {
                self.validator
                    .tag_section(&tags)
                    .map_err(validation_error)?;
                return Err(wasm_unsupported!("exception handling"));
            }
            Payload::GlobalSection(globals) => {
                self.validator
                    .global_section(&globals)
                    .map_err(validation_error)?;
                self.translate_global_section(globals)?;
            }
            Payload::ExportSection(exports) => {
                self.validator
                    .export_section(&exports)
                    .map_err(validation_error)?;
                self.translate_export_section(exports)?;
            }
            Payload::StartSection { func, range } => {
                self.validator
                    .start_section(func, &range)
                    .map_err(validation_error)?;
                let index = FuncIndex::from_u32(func);
                self.flag_func_as_escaped(index);
                self.result.module.start = Some(index);
            }
            Payload::ElementSection(elements) => {
                self.validator
                    .element_section(&elements)
                    .map_err(validation_error)?;
                self.translate_element_section(elements)?;
            }
            Payload::DataCountSection { count, range } => {
                self.validator
                    .data_count_section(count, &range)
                    .map_err(validation_error)?;
            }
            Payload::DataSection(data) => {
                self.validator
                    .data_section(&data)
                    .map_err(validation_error)?;
                self.translate_data_section(data)?;
            }
            Payload::CodeSectionStart { count, range, .. } => {
                self.validator
                    .code_section_start(count, &range)
                    .map_err(validation_error)?;
            }
            Payload::CodeSectionEntry(body) => {
                let func_to_validate = self
                    .validator
                    .code_section_entry(&body)
                    .map_err(validation_error)?;

                let def_func_index = self.result.function_ir.next_key();
                let func_index = self.result.module.func_index(def_func_index);
                let sig = self.result.module.functions[func_index].signature;
                let func_ty = self.result.module.types[sig].clone();

                let translator = FuncTranslator::new(
                    &self.result.module,
                    func_ty,
                    func_to_validate,
                    self.insert_cancel_polls,
                );
                let ir = translator.translate(&body)?;
                self.result.function_ir.push(ir);
            }
            Payload::CustomSection(section) => {
                tracing::trace!(name = section.name(), "skipping custom section");
            }
            Payload::End(offset) => {
                self.validator.end(offset).map_err(validation_error)?;
            }
            p => {
                return Err(wasm_unsupported!("section {p:?}"));
            }
        }
        Ok(())
    }

    fn flag_func_as_escaped(&mut self, func_index: FuncIndex) {
        let desc = &mut self.result.module.functions[func_index];
        if desc.is_escaping() {
            return;
        }
        let index = self.result.module.num_escaped_functions;
        desc.func_ref = FuncRefIndex::from_u32(index);
        self.result.module.num_escaped_functions += 1;
    }

    fn translate_type_section(&mut self, types: TypeSectionReader<'_>) -> crate::Result<()> {
        self.result.module.types.reserve(types.count() as usize);

        for rec_group in types {
            for sub_ty in rec_group?.into_types() {
                match &sub_ty.composite_type.inner {
                    CompositeInnerType::Func(func_ty) => {
                        self.result
                            .module
                            .types
                            .push(FuncType::from_wasmparser(func_ty)?);
                    }
                    other => {
                        return Err(wasm_unsupported!("composite type {other:?}"));
                    }
                }
            }
        }

        Ok(())
    }

    fn translate_import_section(
        &mut self,
        imports: ImportSectionReader<'_>,
    ) -> crate::Result<()> {
        self.result
            .module
            .imports
            .reserve_exact(imports.count() as usize);

        for import in imports {
            let import = import?;

            let ty = match import.ty {
                TypeRef::Func(index) => {
                    self.result.module.num_imported_functions += 1;
                    let signature = TypeIndex::from_u32(index);
                    self.result.module.functions.push(FunctionDesc {
                        signature,
                        func_ref: FuncRefIndex::reserved_value(),
                    });
                    EntityDesc::Function(signature)
                }
                TypeRef::Table(ty) => {
                    self.result.module.num_imported_tables += 1;
                    let table = TableType::from_wasmparser(ty)?;
                    self.result.module.tables.push(table);
                    EntityDesc::Table(table)
                }
                TypeRef::Memory(ty) => {
                    self.result.module.num_imported_memories += 1;
                    let memory = MemoryType::from_wasmparser(ty)?;
                    self.result.module.memories.push(memory);
                    EntityDesc::Memory(memory)
                }
                TypeRef::Global(ty) => {
                    self.result.module.num_imported_globals += 1;
                    let global = GlobalType::from_wasmparser(ty)?;
                    self.result.module.globals.push(global);
                    EntityDesc::Global(global)
                }
                // doesn't get past validation with exceptions disabled
                TypeRef::Tag(_) => unreachable!(),
            };

            self.result.module.imports.push(crate::translate::Import {
                module: import.module.to_string(),
                name: import.name.to_string(),
                ty,
            });
        }

        Ok(())
    }

    fn translate_function_section(
        &mut self,
        functions: FunctionSectionReader<'_>,
    ) -> crate::Result<()> {
        self.result
            .module
            .functions
            .reserve_exact(functions.count() as usize);

        for index in functions {
            let signature = TypeIndex::from_u32(index?);
            self.result.module.functions.push(FunctionDesc {
                signature,
                func_ref: FuncRefIndex::reserved_value(),
            });
        }

        Ok(())
    }

    fn translate_table_section(&mut self, tables: TableSectionReader<'_>) -> crate::Result<()> {
        self.result
            .module
            .tables
            .reserve_exact(tables.count() as usize);

        for table in tables {
            let table = table?;
            if !matches!(table.init, wasmparser::TableInit::RefNull) {
                return Err(wasm_unsupported!("table initialization expression"));
            }
            self.result
                .module
                .tables
                .push(TableType::from_wasmparser(table.ty)?);
        }

        Ok(())
    }

    fn translate_memory_section(
        &mut self,
        memories: MemorySectionReader<'_>,
    ) -> crate::Result<()> {
        self.result
            .module
            .memories
            .reserve_exact(memories.count() as usize);

        for ty in memories {
            self.result
                .module
                .memories
                .push(MemoryType::from_wasmparser(ty?)?);
        }

        Ok(())
    }

    fn translate_global_section(&mut self, globals: GlobalSectionReader<'_>) -> crate::Result<()> {
        self.result
            .module
            .globals
            .reserve_exact(globals.count() as usize);

        for global in globals {
            let global = global?;

            self.result
                .module
                .globals
                .push(GlobalType::from_wasmparser(global.ty)?);

            let (init, escaped) = ConstExpr::from_wasmparser(&global.init_expr)?;
            for func in escaped {
                self.flag_func_as_escaped(func);
            }
            self.result.module.global_initializers.push(init);
        }

        Ok(())
    }

    fn translate_export_section(&mut self, exports: ExportSectionReader<'_>) -> crate::Result<()> {
        for export in exports {
            let export = export?;
            let index = match export.kind {
                ExternalKind::Func => {
                    let index = FuncIndex::from_u32(export.index);
                    self.flag_func_as_escaped(index);
                    EntityIndex::Function(index)
                }
                ExternalKind::Table => EntityIndex::Table(TableIndex::from_u32(export.index)),
                ExternalKind::Memory => EntityIndex::Memory(MemoryIndex::from_u32(export.index)),
                ExternalKind::Global => EntityIndex::Global(GlobalIndex::from_u32(export.index)),
                ExternalKind::Tag => return Err(wasm_unsupported!("exception handling")),
            };

            self.result
                .module
                .exports
                .insert(export.name.to_string(), index);
        }

        Ok(())
    }

    fn translate_element_section(
        &mut self,
        elements: ElementSectionReader<'_>,
    ) -> crate::Result<()> {
        for element in elements {
            let element = element?;

            let items = match element.items {
                ElementItems::Functions(funcs) => {
                    let mut out = Vec::with_capacity(funcs.count() as usize);
                    for func_idx in funcs {
                        let index = FuncIndex::from_u32(func_idx?);
                        self.flag_func_as_escaped(index);
                        out.push(Some(index));
                    }
                    out.into_boxed_slice()
                }
                ElementItems::Expressions(_, exprs) => {
                    let mut out = Vec::with_capacity(exprs.count() as usize);
                    for expr in exprs {
                        let (expr, escaped) = ConstExpr::from_wasmparser(&expr?)?;
                        for func in escaped {
                            self.flag_func_as_escaped(func);
                        }
                        out.push(match expr {
                            ConstExpr::RefNull => None,
                            ConstExpr::RefFunc(index) => Some(index),
                            other => {
                                return Err(wasm_unsupported!(
                                    "element initializer expression {other:?}"
                                ));
                            }
                        });
                    }
                    out.into_boxed_slice()
                }
            };

            let kind = match element.kind {
                ParserElementKind::Active {
                    table_index,
                    offset_expr,
                } => {
                    let (offset, escaped) = ConstExpr::from_wasmparser(&offset_expr)?;
                    debug_assert!(escaped.is_empty());
                    ElementKind::Active {
                        table_index: TableIndex::from_u32(table_index.unwrap_or(0)),
                        offset,
                    }
                }
                ParserElementKind::Passive => ElementKind::Passive,
                ParserElementKind::Declared => ElementKind::Declared,
            };

            self.result.module.element_segments.push(ElementSegment {
                kind,
                elements: items,
            });
        }

        Ok(())
    }

    fn translate_data_section(&mut self, section: DataSectionReader<'_>) -> crate::Result<()> {
        for entry in section {
            let entry = entry?;

            let active = match entry.kind {
                DataKind::Active {
                    memory_index,
                    offset_expr,
                } => {
                    let (offset, escaped) = ConstExpr::from_wasmparser(&offset_expr)?;
                    debug_assert!(escaped.is_empty());
                    Some((MemoryIndex::from_u32(memory_index), offset))
                }
                DataKind::Passive => None,
            };

            self.result.module.data_segments.push(DataSegment {
                active,
                data: entry.data.to_vec().into_boxed_slice(),
            });
        }

        Ok(())
    }
}
