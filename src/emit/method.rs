// Method body emission
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


//! Compiled method bodies.
//!
//! The code generator reports relocations against [`ArtifactKey`]s;
//!   here they are rewritten against the symbols of the marked nodes for
//!   those keys.
//! The placeholder bytes at each relocation are replaced with zeros.

use super::EmitContext;
use crate::{
    codegen::CodeRelocKind,
    diagnose::Annotate,
    diagnostic_panic,
    graph::NodeId,
    obj::{MethodInfo, ObjectData, RelocKind, Section},
};

impl From<CodeRelocKind> for RelocKind {
    fn from(kind: CodeRelocKind) -> Self {
        match kind {
            CodeRelocKind::Pointer => Self::Pointer,
            CodeRelocKind::Rel32 => Self::Rel32,
            CodeRelocKind::Abs32 => Self::Abs32,
        }
    }
}

pub fn emit(ctx: &mut EmitContext, id: NodeId) -> ObjectData {
    let node = ctx.factory.graph().node(id);

    let Some(code) = node.code() else {
        diagnostic_panic!(
            vec![id.internal_error("this method was never compiled")],
            "no code for {}",
            node.key(),
        )
    };

    let mut b = ctx
        .node_builder(id, Section::Text)
        .with_alignment(code.alignment);

    let mut relocs = code.relocs.iter().collect::<Vec<_>>();
    relocs.sort_by_key(|reloc| reloc.offset);

    let mut cur = 0usize;
    for reloc in relocs {
        let start = reloc.offset as usize;
        b.emit_bytes(&code.code[cur..start]);

        let kind = RelocKind::from(reloc.kind);
        b.emit_reloc(kind, ctx.symbol_of(&reloc.target), reloc.addend);
        cur = start + kind.size(ctx.ptr()) as usize;
    }

    b.emit_bytes(&code.code[cur..]);

    b.set_method_info(MethodInfo {
        frame_info: code.frame_info.clone(),
        gc_info: code.gc_info.clone(),
        eh_info: code.eh_info.clone(),
    });

    b.build()
}
