// Object file writers
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

//! Sinks for finalized object data.
//!
//! An [`ObjectWriter`] receives every emitted block in its final order,
//!   followed by a single call to [`ObjectWriter::finish`],
//!     at which point all relocations must be resolvable.
//! Producing an actual object file format is the responsibility of the
//!   embedder;
//!     [`MemoryObjectWriter`] lays sections out in memory and resolves
//!     relocations against them,
//!       which is sufficient to inspect and verify the output of a
//!       compilation.

use super::{MethodInfo, ObjectData, RelocKind, Section};
use crate::{session::PointerSize, sym::SymbolId};
use fxhash::{FxHashMap, FxHashSet};
use std::{error::Error, fmt::Display, io};

pub type WriterResult<T> = Result<T, WriterError>;

/// Error while writing object data.
#[derive(Debug)]
pub enum WriterError {
    /// The same symbol was defined more than once.
    DuplicateSymbol(SymbolId),

    /// A relocation targets a symbol that was never defined or declared
    ///   external.
    UnresolvedSymbol(SymbolId),

    /// A resolved relocation does not fit within its field.
    RelocationOverflow(SymbolId),

    /// Data was emitted after the writer was finished.
    AlreadyFinished,

    Io(io::Error),
}

impl From<io::Error> for WriterError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl Display for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateSymbol(sym) => write!(f, "duplicate symbol {sym}"),
            Self::UnresolvedSymbol(sym) => {
                write!(f, "relocation against undefined symbol {sym}")
            }
            Self::RelocationOverflow(sym) => {
                write!(f, "relocation against {sym} overflows its field")
            }
            Self::AlreadyFinished => {
                write!(f, "object data emitted after writer was finished")
            }
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl Error for WriterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Consumer of finalized object data.
pub trait ObjectWriter {
    /// Declare a symbol that is defined outside of this object.
    fn declare_extern(&mut self, symbol: SymbolId);

    fn emit(&mut self, data: ObjectData) -> WriterResult<()>;

    /// Resolve relocations and complete the object.
    fn finish(&mut self) -> WriterResult<()>;
}

/// Alignment of each section's base address.
const SECTION_ALIGNMENT: u64 = 0x1000;

#[derive(Debug, Clone, Copy)]
struct PendingReloc {
    section: Section,
    offset: u32,
    kind: RelocKind,
    target: SymbolId,
    addend: i64,
}

/// Lays out sections in memory and resolves relocations.
///
/// Sections are placed in the order of [`Section::ALL`],
///   each beginning at a multiple of `0x1000`,
///   with the first at `0x1000`.
/// Empty sections occupy no space.
/// Relocations against external symbols resolve to `0` and are recorded
///   as imports.
#[derive(Debug)]
pub struct MemoryObjectWriter {
    ptr: PointerSize,
    sections: FxHashMap<Section, Vec<u8>>,
    bases: FxHashMap<Section, u64>,
    symbols: FxHashMap<SymbolId, (Section, u32)>,
    order: Vec<SymbolId>,
    externs: FxHashSet<SymbolId>,
    imports: Vec<(Section, u32, SymbolId)>,
    relocs: Vec<PendingReloc>,
    method_info: Vec<(SymbolId, MethodInfo)>,
    finished: bool,
}

impl MemoryObjectWriter {
    pub fn new(ptr: PointerSize) -> Self {
        Self {
            ptr,
            sections: Default::default(),
            bases: Default::default(),
            symbols: Default::default(),
            order: Vec::new(),
            externs: Default::default(),
            imports: Vec::new(),
            relocs: Vec::new(),
            method_info: Vec::new(),
            finished: false,
        }
    }

    pub fn section(&self, section: Section) -> &[u8] {
        self.sections.get(&section).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every defined symbol,
    ///   in the order that they were emitted.
    pub fn symbols(&self) -> &[SymbolId] {
        &self.order
    }

    pub fn is_defined(&self, symbol: SymbolId) -> bool {
        self.symbols.contains_key(&symbol)
    }

    pub fn is_extern(&self, symbol: SymbolId) -> bool {
        self.externs.contains(&symbol)
    }

    /// Section and offset of a defined symbol.
    pub fn location(&self, symbol: SymbolId) -> Option<(Section, u32)> {
        self.symbols.get(&symbol).copied()
    }

    /// Final address of a defined symbol.
    ///
    /// This is available only after [`ObjectWriter::finish`].
    pub fn address(&self, symbol: SymbolId) -> Option<u64> {
        let (section, offset) = self.location(symbol)?;
        self.bases.get(&section).map(|base| base + offset as u64)
    }

    /// Bytes at `offset` from `symbol`.
    pub fn bytes_at(&self, symbol: SymbolId, offset: u32, len: usize) -> Option<&[u8]> {
        let (section, start) = self.location(symbol)?;
        let start = (start + offset) as usize;

        self.section(section).get(start..start + len)
    }

    /// Sites that refer to external symbols.
    pub fn imports(&self) -> &[(Section, u32, SymbolId)] {
        &self.imports
    }

    pub fn method_info(&self, symbol: SymbolId) -> Option<&MethodInfo> {
        self.method_info
            .iter()
            .find(|(sym, _)| *sym == symbol)
            .map(|(_, info)| info)
    }

    fn layout_sections(&mut self) {
        let mut next = SECTION_ALIGNMENT;

        for section in Section::ALL {
            self.bases.insert(section, next);

            let len = self.section(section).len() as u64;
            next = (next + len + SECTION_ALIGNMENT - 1) / SECTION_ALIGNMENT
                * SECTION_ALIGNMENT;
        }
    }

    fn resolve(&mut self, reloc: PendingReloc) -> WriterResult<()> {
        let site = self.bases[&reloc.section] + reloc.offset as u64;

        let target = match self.address(reloc.target) {
            Some(addr) => addr,
            None if self.externs.contains(&reloc.target) => {
                self.imports.push((reloc.section, reloc.offset, reloc.target));
                return Ok(());
            }
            None => return Err(WriterError::UnresolvedSymbol(reloc.target)),
        };

        let value = (target as i64).wrapping_add(reloc.addend);
        let overflow = || WriterError::RelocationOverflow(reloc.target);

        let bytes: Vec<u8> = match reloc.kind {
            RelocKind::Pointer => match self.ptr {
                PointerSize::Four => u32::try_from(value)
                    .map_err(|_| overflow())?
                    .to_le_bytes()
                    .to_vec(),
                PointerSize::Eight => (value as u64).to_le_bytes().to_vec(),
            },
            RelocKind::Abs32 => u32::try_from(value)
                .map_err(|_| overflow())?
                .to_le_bytes()
                .to_vec(),
            RelocKind::Rel32 => i32::try_from(value - (site as i64 + 4))
                .map_err(|_| overflow())?
                .to_le_bytes()
                .to_vec(),
            RelocKind::RelPtr32 => i32::try_from(value - site as i64)
                .map_err(|_| overflow())?
                .to_le_bytes()
                .to_vec(),
        };

        let data = self.sections.entry(reloc.section).or_default();
        let start = reloc.offset as usize;
        data[start..start + bytes.len()].copy_from_slice(&bytes);

        Ok(())
    }
}

impl ObjectWriter for MemoryObjectWriter {
    fn declare_extern(&mut self, symbol: SymbolId) {
        self.externs.insert(symbol);
    }

    fn emit(&mut self, data: ObjectData) -> WriterResult<()> {
        if self.finished {
            return Err(WriterError::AlreadyFinished);
        }

        let bytes = self.sections.entry(data.section).or_default();

        let align = data.alignment.max(1) as usize;
        let padded = (bytes.len() + align - 1) / align * align;
        bytes.resize(padded, 0);

        let start = bytes.len() as u32;
        bytes.extend_from_slice(&data.data);

        for def in &data.symbols {
            if self.symbols.contains_key(&def.symbol) {
                return Err(WriterError::DuplicateSymbol(def.symbol));
            }

            self.symbols
                .insert(def.symbol, (data.section, start + def.offset));
            self.order.push(def.symbol);
        }

        self.relocs.extend(data.relocs.iter().map(|reloc| PendingReloc {
            section: data.section,
            offset: start + reloc.offset,
            kind: reloc.kind,
            target: reloc.target,
            addend: reloc.addend,
        }));

        if let (Some(info), Some(def)) = (data.method_info, data.symbols.first()) {
            self.method_info.push((def.symbol, info));
        }

        Ok(())
    }

    fn finish(&mut self) -> WriterResult<()> {
        if self.finished {
            return Err(WriterError::AlreadyFinished);
        }

        self.finished = true;
        self.layout_sections();

        for reloc in std::mem::take(&mut self.relocs) {
            self.resolve(reloc)?;
        }

        Ok(())
    }
}
