// Object data
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

//! Serialized node contents.
//!
//! Every emittable node of the dependency graph is eventually finalized
//!   into an [`ObjectData`]:
//!     a block of bytes destined for a particular [`Section`],
//!     the relocations within those bytes,
//!     and the symbols that the block defines.
//! Blocks are assembled using an [`ObjectDataBuilder`] and handed to an
//!   [`ObjectWriter`](writer::ObjectWriter) in emission order.
//!
//! All multi-byte values are little-endian.

pub mod writer;

use crate::{session::PointerSize, sym::SymbolId};
use std::fmt::Display;

/// Destination section of a block of object data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// Executable code.
    Text,

    /// Data never written at runtime.
    ReadOnly,

    /// Writable data,
    ///   including type descriptors and statics.
    Data,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::Text, Section::ReadOnly, Section::Data];
}

impl Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, ".text"),
            Self::ReadOnly => write!(f, ".rdata"),
            Self::Data => write!(f, ".data"),
        }
    }
}

/// Kind of relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Absolute address the size of a target pointer.
    Pointer,

    /// 32-bit displacement from the end of the relocated field.
    Rel32,

    /// 32-bit displacement from the start of the relocated field.
    ///
    /// This is used by tables that refer to nodes without requiring an
    ///   absolute address.
    RelPtr32,

    /// 32-bit absolute address.
    Abs32,
}

impl RelocKind {
    /// Width of the relocated field.
    pub fn size(self, ptr: PointerSize) -> u32 {
        match self {
            Self::Pointer => ptr.bytes(),
            Self::Rel32 | Self::RelPtr32 | Self::Abs32 => 4,
        }
    }
}

/// A relocation within a block of object data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u32,
    pub kind: RelocKind,
    pub target: SymbolId,
    pub addend: i64,
}

/// A symbol defined by a block at the given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolDef {
    pub symbol: SymbolId,
    pub offset: u32,
}

/// Unwind and GC information accompanying compiled code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodInfo {
    pub frame_info: Vec<u8>,
    pub gc_info: Vec<u8>,
    pub eh_info: Vec<u8>,
}

/// A finalized block of object data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub section: Section,
    pub alignment: u32,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub symbols: Vec<SymbolDef>,
    pub method_info: Option<MethodInfo>,
}

impl ObjectData {
    /// Offset of `symbol` within this block,
    ///   if defined here.
    pub fn symbol_offset(&self, symbol: SymbolId) -> Option<u32> {
        self.symbols
            .iter()
            .find(|def| def.symbol == symbol)
            .map(|def| def.offset)
    }
}

/// Incrementally assembles an [`ObjectData`].
#[derive(Debug)]
pub struct ObjectDataBuilder {
    ptr: PointerSize,
    section: Section,
    alignment: u32,
    data: Vec<u8>,
    relocs: Vec<Reloc>,
    symbols: Vec<SymbolDef>,
    method_info: Option<MethodInfo>,
}

impl ObjectDataBuilder {
    pub fn new(ptr: PointerSize, section: Section) -> Self {
        Self {
            ptr,
            section,
            alignment: ptr.bytes(),
            data: Vec::new(),
            relocs: Vec::new(),
            symbols: Vec::new(),
            method_info: None,
        }
    }

    pub fn with_alignment(self, alignment: u32) -> Self {
        Self { alignment, ..self }
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.ptr
    }

    /// Current offset from the start of the block.
    pub fn offset(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.data.extend(value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.data.extend(value.to_le_bytes());
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.data.extend(value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.data.extend(value.to_le_bytes());
    }

    /// Emit a signed value the size of a target pointer.
    pub fn emit_natural(&mut self, value: i64) {
        match self.ptr {
            PointerSize::Four => self.emit_i32(value as i32),
            PointerSize::Eight => self.data.extend(value.to_le_bytes()),
        }
    }

    /// Emit a signed value half the size of a target pointer.
    pub fn emit_half_natural(&mut self, value: i32) {
        match self.ptr {
            PointerSize::Four => self.data.extend((value as i16).to_le_bytes()),
            PointerSize::Eight => self.emit_i32(value),
        }
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn emit_zeros(&mut self, count: u32) {
        self.data.extend(std::iter::repeat(0).take(count as usize));
    }

    pub fn emit_zero_pointer(&mut self) {
        self.emit_zeros(self.ptr.bytes());
    }

    /// Emit a placeholder for a relocation of the given kind against
    ///   `target`.
    pub fn emit_reloc(&mut self, kind: RelocKind, target: SymbolId, addend: i64) {
        self.relocs.push(Reloc {
            offset: self.offset(),
            kind,
            target,
            addend,
        });

        self.emit_zeros(kind.size(self.ptr));
    }

    pub fn emit_pointer_reloc(&mut self, target: SymbolId) {
        self.emit_reloc(RelocKind::Pointer, target, 0);
    }

    /// Pad with zeros until the offset is a multiple of `align`.
    pub fn pad_to(&mut self, align: u32) {
        let rem = self.offset() % align;
        if rem != 0 {
            self.emit_zeros(align - rem);
        }
    }

    /// Define `symbol` at the current offset.
    pub fn define_symbol(&mut self, symbol: SymbolId) {
        self.define_symbol_at(symbol, self.offset());
    }

    pub fn define_symbol_at(&mut self, symbol: SymbolId, offset: u32) {
        self.symbols.push(SymbolDef { symbol, offset });
    }

    pub fn set_method_info(&mut self, info: MethodInfo) {
        self.method_info = Some(info);
    }

    /// Relocations emitted so far.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    pub fn build(self) -> ObjectData {
        ObjectData {
            section: self.section,
            alignment: self.alignment,
            data: self.data,
            relocs: self.relocs,
            symbols: self.symbols,
            method_info: self.method_info,
        }
    }
}
