// Code generator collaborator
//
//  Copyright (C) 2014-2023 Ryan Specialty, LLC.
//
//  This file is part of AOTC.
//
//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.
//
//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//  GNU General Public License for more details.
//
//  You should have received a copy of the GNU General Public License
//  along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Interface to the native code generator.
//!
//! The compiler core never turns IL into machine code itself.
//! When a method body is found to be reachable,
//!   the marking engine hands the method to a [`Codegen`] and records the
//!   resulting [`CompiledMethod`] on the method's node.
//!
//! A code generator must not create graph nodes.
//! It instead reports what it needs _declaratively_:
//!
//!   - every relocation in the emitted code names the [`ArtifactKey`] it
//!       targets,
//!       which becomes a static dependency of the method body;
//!   - [`CompiledMethod::dependencies`] lists any additional artifacts the
//!       code requires without referencing them directly;
//!   - lookups performed by shared generic code are requested through
//!       [`CompileRequest::dictionary_slot`],
//!       which reserves a slot in the owning dictionary layout and returns
//!       its index for the code generator to bake into the code.
//!
//! [`ScriptedCodegen`] replays predetermined results and is useful for
//!   exercising the graph without a real backend.

use crate::{
    generic::{DictionaryOwner, GenericLookup},
    global::DictSlotSize,
    graph::ArtifactKey,
    session::PointerSize,
    ts::{MethodId, TypeSystem},
};
use fxhash::FxHashMap;
use std::{error::Error, fmt::Display};

/// Kind of a relocation within generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeRelocKind {
    /// Absolute pointer-sized address.
    Pointer,

    /// 32-bit displacement relative to the end of the relocated field.
    Rel32,

    /// 32-bit image-relative address.
    Abs32,
}

impl CodeRelocKind {
    /// Number of bytes of code the relocation overwrites.
    pub fn size(self, ptr: PointerSize) -> u32 {
        match self {
            Self::Pointer => ptr.bytes(),
            Self::Rel32 | Self::Abs32 => 4,
        }
    }
}

/// A relocation within generated code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeReloc {
    pub offset: u32,
    pub kind: CodeRelocKind,
    pub target: ArtifactKey,
    pub addend: i64,
}

/// Result of compiling a single method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMethod {
    pub code: Vec<u8>,
    pub alignment: u32,
    pub relocs: Vec<CodeReloc>,
    pub frame_info: Vec<u8>,
    pub gc_info: Vec<u8>,
    pub eh_info: Vec<u8>,

    /// Artifacts the code requires that are not the target of any
    ///   relocation.
    pub dependencies: Vec<ArtifactKey>,

    /// Dictionary lookups requested while compiling,
    ///   along with the slot that each was assigned.
    ///
    /// This is populated by the compiler core,
    ///   not by the code generator.
    pub lookups: Vec<(GenericLookup, DictSlotSize)>,
}

impl CompiledMethod {
    /// A method consisting of the provided code and nothing else.
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            code,
            alignment: 16,
            relocs: Vec::new(),
            frame_info: Vec::new(),
            gc_info: Vec::new(),
            eh_info: Vec::new(),
            dependencies: Vec::new(),
            lookups: Vec::new(),
        }
    }

    /// Every artifact this method depends upon,
    ///   in a stable order.
    pub fn required_artifacts(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.relocs
            .iter()
            .map(|reloc| &reloc.target)
            .chain(self.dependencies.iter())
    }

    /// Ensure that every relocation of `method` lies within its code and
    ///   that no two relocations overlap.
    ///
    /// Relocations may be listed in any order.
    pub fn check_relocs(
        &self,
        method: MethodId,
        ptr: PointerSize,
    ) -> Result<(), CodegenError> {
        let mut spans = self
            .relocs
            .iter()
            .map(|r| (r.offset as u64, r.offset as u64 + r.kind.size(ptr) as u64))
            .collect::<Vec<_>>();
        spans.sort();

        let mut free_from = 0;
        for (start, end) in spans {
            if start < free_from || end > self.code.len() as u64 {
                return Err(CodegenError::BadRelocation(method, start as u32));
            }
            free_from = end;
        }

        Ok(())
    }
}

/// Reserves dictionary slots on behalf of shared code.
///
/// This is implemented by the compiler core.
pub trait SlotAllocator {
    fn slot_for(
        &mut self,
        owner: DictionaryOwner,
        lookup: GenericLookup,
    ) -> DictSlotSize;
}

/// A request to compile a single method.
pub struct CompileRequest<'a> {
    pub method: MethodId,

    /// Generate an unboxing stub that adjusts `this` before entering the
    ///   method proper.
    pub unboxing: bool,

    /// Dictionary through which shared code performs its lookups,
    ///   if the method is shared.
    pub dictionary: Option<DictionaryOwner>,

    slots: &'a mut dyn SlotAllocator,
}

impl<'a> CompileRequest<'a> {
    pub fn new(
        method: MethodId,
        unboxing: bool,
        dictionary: Option<DictionaryOwner>,
        slots: &'a mut dyn SlotAllocator,
    ) -> Self {
        Self {
            method,
            unboxing,
            dictionary,
            slots,
        }
    }

    /// Reserve a slot in this method's dictionary for `lookup`.
    ///
    /// Requesting the same lookup more than once yields the same slot.
    ///
    /// Panics
    /// ======
    /// If the method is not shared there is no dictionary to allocate
    ///   from,
    ///     and the code generator has requested a lookup that can never
    ///     be satisfied.
    pub fn dictionary_slot(&mut self, lookup: GenericLookup) -> DictSlotSize {
        match self.dictionary {
            Some(owner) => self.slots.slot_for(owner, lookup),
            None => crate::diagnostic_panic!(
                vec![],
                "dictionary lookup {lookup:?} requested while compiling \
                    unshared {}",
                self.method,
            ),
        }
    }
}

/// Error reported by a code generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The code generator cannot compile this method.
    Unsupported(MethodId, String),

    /// The method body is invalid.
    InvalidProgram(MethodId, String),

    /// The relocation at the given code offset overlaps another or
    ///   extends past the end of the code.
    BadRelocation(MethodId, u32),
}

impl CodegenError {
    pub fn method(&self) -> MethodId {
        match self {
            Self::Unsupported(m, _)
            | Self::InvalidProgram(m, _)
            | Self::BadRelocation(m, _) => *m,
        }
    }
}

impl Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported(m, msg) => {
                write!(f, "unable to compile {m}: {msg}")
            }
            Self::InvalidProgram(m, msg) => {
                write!(f, "invalid program in {m}: {msg}")
            }
            Self::BadRelocation(m, offset) => {
                write!(f, "relocation at offset {offset} does not fit the code of {m}")
            }
        }
    }
}

impl Error for CodegenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

/// A native code generator.
pub trait Codegen {
    fn compile(
        &mut self,
        ts: &dyn TypeSystem,
        request: CompileRequest,
    ) -> Result<CompiledMethod, CodegenError>;
}

/// What a [`ScriptedCodegen`] produces for a method.
#[derive(Debug, Clone, Default)]
pub struct Script {
    relocs: Vec<ArtifactKey>,
    placed: Vec<(u32, ArtifactKey)>,
    dependencies: Vec<ArtifactKey>,
    lookups: Vec<GenericLookup>,
    error: Option<String>,
}

impl Script {
    /// Emit a pointer-sized relocation against `target`.
    pub fn reloc(mut self, target: ArtifactKey) -> Self {
        self.relocs.push(target);
        self
    }

    /// Place a pointer-sized relocation against `target` at `offset`
    ///   within the finished code,
    ///     without reserving any bytes for it.
    pub fn reloc_at(mut self, offset: u32, target: ArtifactKey) -> Self {
        self.placed.push((offset, target));
        self
    }

    pub fn depends_on(mut self, target: ArtifactKey) -> Self {
        self.dependencies.push(target);
        self
    }

    /// Perform a dictionary lookup.
    pub fn lookup(mut self, lookup: GenericLookup) -> Self {
        self.lookups.push(lookup);
        self
    }

    /// Fail compilation.
    pub fn fail(mut self, msg: &str) -> Self {
        self.error = Some(msg.into());
        self
    }
}

/// A [`Codegen`] that replays [`Script`]s.
///
/// The generated code for each method is a pointer-sized placeholder
///   per relocation followed by a 4-byte slot index per lookup and a
///   single return instruction.
/// Methods without a script compile to just the return instruction.
#[derive(Debug, Default)]
pub struct ScriptedCodegen {
    scripts: FxHashMap<MethodId, Script>,
    compiled: Vec<MethodId>,
    pointer_size: u32,
}

impl ScriptedCodegen {
    pub fn new(pointer_size: u32) -> Self {
        Self {
            pointer_size,
            ..Default::default()
        }
    }

    pub fn script(&mut self, method: MethodId, script: Script) -> &mut Self {
        self.scripts.insert(method, script);
        self
    }

    /// Methods compiled so far,
    ///   in order.
    pub fn compiled(&self) -> &[MethodId] {
        &self.compiled
    }
}

impl Codegen for ScriptedCodegen {
    fn compile(
        &mut self,
        _ts: &dyn TypeSystem,
        mut request: CompileRequest,
    ) -> Result<CompiledMethod, CodegenError> {
        let method = request.method;
        self.compiled.push(method);

        let script = self.scripts.get(&method).cloned().unwrap_or_default();

        if let Some(msg) = script.error {
            return Err(CodegenError::InvalidProgram(method, msg));
        }

        let mut compiled = CompiledMethod::new(Vec::new());

        for target in script.relocs {
            compiled.relocs.push(CodeReloc {
                offset: compiled.code.len() as u32,
                kind: CodeRelocKind::Pointer,
                target,
                addend: 0,
            });
            compiled
                .code
                .extend(std::iter::repeat(0).take(self.pointer_size as usize));
        }

        for lookup in script.lookups {
            let slot = request.dictionary_slot(lookup);
            compiled.code.extend(slot.to_le_bytes());
        }

        compiled.code.push(0xC3);
        compiled.dependencies = script.dependencies;

        for (offset, target) in script.placed {
            compiled.relocs.push(CodeReloc {
                offset,
                kind: CodeRelocKind::Pointer,
                target,
                addend: 0,
            });
        }

        Ok(compiled)
    }
}
