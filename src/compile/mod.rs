// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The compiler engine: per-function single-pass code generation, then a
//! link pass that lays every body into one text section and resolves the
//! direct-call relocations recorded by the assembler.

pub mod asm;
pub mod lower;

use crate::config::Config;
use crate::indices::{DefinedFuncIndex, SharedTypeIndex, TypeIndex};
use crate::translate::{encode, ModuleTranslation};
use crate::vm::{CodeMemory, VMArrayCallFunction};
use crate::Error;
use cranelift_entity::{EntityRef, PrimaryMap};

/// Description of where a function is located in the text section of a
/// compiled image.
#[derive(Debug, Copy, Clone)]
pub struct FunctionLoc {
    /// The byte offset from the start of the text section.
    pub start: u32,
    /// The byte length of the function body.
    pub length: u32,
}

/// A module's native code: the published executable region plus the
/// per-function locations within it.
#[derive(Debug)]
pub struct CompiledArtifact {
    code: CodeMemory,
    funcs: PrimaryMap<DefinedFuncIndex, FunctionLoc>,
}

impl CompiledArtifact {
    pub fn func_entry(&self, index: DefinedFuncIndex) -> VMArrayCallFunction {
        let loc = self.funcs[index];
        // Safety: the link pass put a function with the array-call ABI at
        // this offset, and the region is published.
        unsafe {
            let entry = self.code.text_ptr().add(loc.start as usize);
            core::mem::transmute::<*const u8, VMArrayCallFunction>(entry)
        }
    }

    /// The executable text section; readable after publication.
    pub fn text(&self) -> &[u8] {
        // Safety: the region is mapped R+X for the artifact's lifetime.
        unsafe { std::slice::from_raw_parts(self.code.text_ptr(), self.code.len()) }
    }
}

/// Compiles every defined function and links the results into one published
/// text section.
pub fn compile_module(
    translation: &ModuleTranslation,
    shared_signatures: &PrimaryMap<TypeIndex, SharedTypeIndex>,
    config: &Config,
) -> crate::Result<CompiledArtifact> {
    let mut bodies = Vec::with_capacity(translation.function_ir.len());
    for (def_index, ir) in translation.function_ir.iter() {
        tracing::debug!(
            function = def_index.as_u32(),
            ops = ir.ops.len(),
            "compiling function"
        );
        let assembled =
            lower::compile_function(translation, shared_signatures, def_index, ir, config)?;
        bodies.push(assembled);
    }
    link_and_publish(translation, bodies)
}

/// Lays the assembled bodies into one buffer (16-byte aligned), resolves
/// call relocations, and publishes the region write→execute.
fn link_and_publish(
    translation: &ModuleTranslation,
    bodies: Vec<asm::x86_64::AssembledFunction>,
) -> crate::Result<CompiledArtifact> {
    const ALIGN: usize = 16;

    let mut funcs: PrimaryMap<DefinedFuncIndex, FunctionLoc> = PrimaryMap::new();
    let mut text = Vec::new();
    for body in &bodies {
        while text.len() % ALIGN != 0 {
            // int3 padding between functions
            text.push(0xcc);
        }
        funcs.push(FunctionLoc {
            start: u32::try_from(text.len()).unwrap(),
            length: u32::try_from(body.code.len()).unwrap(),
        });
        text.extend_from_slice(&body.code);
    }

    for (def_index, body) in bodies.iter().enumerate() {
        let own_start = funcs[DefinedFuncIndex::new(def_index)].start;
        for reloc in &body.relocations {
            let target_def = translation
                .module
                .defined_func_index(reloc.target)
                .expect("relocation against an imported function");
            let target_start = funcs[target_def].start;
            let at = (own_start + reloc.offset) as usize;
            let disp = i64::from(target_start) - i64::from(own_start + reloc.offset + 4);
            let disp = i32::try_from(disp).expect("text section exceeds rel32 range");
            text[at..at + 4].copy_from_slice(&disp.to_le_bytes());
        }
    }

    let mut code = CodeMemory::new(&text)?;
    code.publish()?;
    tracing::debug!(
        text_len = text.len(),
        functions = funcs.len(),
        "module linked and published"
    );
    Ok(CompiledArtifact { code, funcs })
}

const ARTIFACT_MAGIC: &[u8; 4] = b"trnA";

/// Serializes the artifact into an opaque blob: magic, fingerprint, function
/// table, text section, all framed with the crate's LEB encoding.
pub fn serialize_artifact(artifact: &CompiledArtifact, fingerprint: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ARTIFACT_MAGIC);
    out.extend_from_slice(fingerprint);
    encode::write_u32(&mut out, u32::try_from(artifact.funcs.len()).unwrap());
    for (_, loc) in artifact.funcs.iter() {
        encode::write_u32(&mut out, loc.start);
        encode::write_u32(&mut out, loc.length);
    }
    encode::write_bytes(&mut out, artifact.text());
    out
}

/// Reverses [`serialize_artifact`]. The fingerprint must match; a stale or
/// foreign blob is rejected rather than trusted.
pub fn deserialize_artifact(
    blob: &[u8],
    fingerprint: &[u8; 32],
) -> crate::Result<CompiledArtifact> {
    let err = || Error::Decode {
        message: "malformed artifact blob".into(),
        offset: 0,
    };

    let rest = blob.strip_prefix(ARTIFACT_MAGIC).ok_or_else(err)?;
    let (blob_fingerprint, rest) = rest.split_at_checked(32).ok_or_else(err)?;
    if blob_fingerprint != fingerprint {
        return Err(Error::Decode {
            message: "artifact fingerprint mismatch".into(),
            offset: 0,
        });
    }

    let mut pos = 0;
    let count = encode::read_u32(rest, &mut pos).ok_or_else(err)?;
    let mut funcs = PrimaryMap::with_capacity(count as usize);
    for _ in 0..count {
        let start = encode::read_u32(rest, &mut pos).ok_or_else(err)?;
        let length = encode::read_u32(rest, &mut pos).ok_or_else(err)?;
        funcs.push(FunctionLoc { start, length });
    }
    let text = encode::read_bytes(rest, &mut pos).ok_or_else(err)?;
    if pos != rest.len() {
        return Err(err());
    }

    let mut code = CodeMemory::new(text)?;
    code.publish()?;
    Ok(CompiledArtifact { code, funcs })
}
