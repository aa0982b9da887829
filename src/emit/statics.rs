// Statics emission
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


//! Storage for static fields.
//!
//! Statics of a type are split by [`StaticsKind`].
//! Non-GC statics are plain zeroed data,
//!   preceded by a class construction context when the type has a static
//!   constructor.
//! GC and thread statics are allocated by the runtime at startup;
//!   the object file holds only a pointer to a [GC static
//!   descriptor](emit_gc_static_descriptor) describing the allocation,
//!     tagged in its low bit to mark the storage as not yet allocated.
//! Each such pointer is listed in the statics region of its kind so that
//!   the runtime can find them.

use super::{eetype::flags, gcdesc, EmitContext};
use crate::{
    diagnose::Annotate,
    diagnostic_panic,
    graph::{ArtifactKey, NodeId, StaticsKind},
    obj::{ObjectData, RelocKind, Section},
    session::PointerSize,
    ts::{TypeCategory, TypeId, TypeSystem},
};

/// Size and reference map of the statics of one kind of a type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticsLayout {
    pub size: u32,

    /// One entry per pointer-sized cell,
    ///   `true` where the cell holds a reference.
    pub gc_map: Vec<bool>,
}

fn belongs_to(ts: &dyn TypeSystem, kind: StaticsKind, ty: TypeId, thread: bool) -> bool {
    match kind {
        StaticsKind::Thread => thread,
        StaticsKind::Gc => !thread && gcdesc::is_gc_slot(ts, ty),
        StaticsKind::NonGc => !thread && !gcdesc::is_gc_slot(ts, ty),
    }
}

/// Storage occupied by a static field of type `ty`.
///
/// Value types holding references are boxed and so occupy a single
///   reference.
fn static_field_size(ts: &dyn TypeSystem, ptr: PointerSize, ty: TypeId) -> u32 {
    if gcdesc::is_gc_slot(ts, ty) {
        return ptr.bytes();
    }

    match ts.category(ty) {
        TypeCategory::Primitive(k) | TypeCategory::Enum(k) => k.size(ptr),
        TypeCategory::Struct => ts.instance_byte_count(ty),
        _ => ptr.bytes(),
    }
}

pub fn statics_layout(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    ty: TypeId,
    kind: StaticsKind,
) -> StaticsLayout {
    let fields: Vec<_> = ts
        .fields(ty)
        .into_iter()
        .map(|f| ts.field(f))
        .filter(|f| f.is_static && belongs_to(ts, kind, f.ty, f.is_thread_static))
        .collect();

    let size = ptr.align(
        fields
            .iter()
            .map(|f| f.offset + static_field_size(ts, ptr, f.ty))
            .max()
            .unwrap_or(0),
    );

    let mut gc_map = vec![false; (size / ptr.bytes()) as usize];

    for f in fields.iter().filter(|f| gcdesc::is_gc_slot(ts, f.ty)) {
        gc_map[(f.offset / ptr.bytes()) as usize] = true;
    }

    StaticsLayout { size, gc_map }
}

pub fn emit_statics(
    ctx: &mut EmitContext,
    id: NodeId,
    ty: TypeId,
    kind: StaticsKind,
) -> ObjectData {
    let ts = ctx.ts();
    let ptr = ctx.ptr();
    let symbol = ctx.factory.node_symbol(id);
    let mut b = ctx.builder(Section::Data);

    match kind {
        StaticsKind::NonGc => {
            if let Some(cctor) = ts.static_constructor(ty) {
                b.emit_pointer_reloc(ctx.symbol_of(&ArtifactKey::method_body(cctor)));
                b.emit_natural(0);
            }

            b.define_symbol(symbol);
            b.emit_zeros(statics_layout(ts, ptr, ty, kind).size);
        }

        StaticsKind::Gc | StaticsKind::Thread => {
            let layout = statics_layout(ts, ptr, ty, kind);

            b.define_symbol(symbol);
            b.emit_reloc(
                RelocKind::Pointer,
                ctx.symbol_of(&ArtifactKey::GcStaticDescriptor(layout.gc_map)),
                1,
            );
        }
    }

    b.build()
}

/// Emit a minimal type descriptor from which the runtime allocates an
///   object holding statics laid out as `map`.
pub fn emit_gc_static_descriptor(
    ctx: &mut EmitContext,
    id: NodeId,
    map: &[bool],
) -> ObjectData {
    let ptr = ctx.ptr();
    let mut b = ctx.builder(Section::ReadOnly);

    let size = map.len() as u32 * ptr.bytes();
    let base_size = ptr.align(ptr.bytes() + size).max(3 * ptr.bytes());

    // The allocated object begins with its descriptor pointer.
    let cells: Vec<bool> = std::iter::once(false).chain(map.iter().copied()).collect();
    gcdesc::emit_series(&mut b, &cells, base_size);

    b.define_symbol(ctx.factory.node_symbol(id));

    let bits = match map.contains(&true) {
        true => flags::HAS_POINTERS,
        false => 0,
    };

    b.emit_u16(0);
    b.emit_u16(bits);
    b.emit_u32(base_size);
    b.emit_zero_pointer();
    b.emit_u16(0);
    b.emit_u16(0);
    b.emit_u32(0);

    b.build()
}

/// Emit the table of statics bases of `kind`,
///   bracketed by start and end symbols.
pub fn emit_region(ctx: &mut EmitContext, id: NodeId, kind: StaticsKind) -> ObjectData {
    let graph = ctx.factory.graph();
    let mut b = ctx.node_builder(id, Section::Data);

    for &node in graph.marked() {
        if matches!(graph.key(node), ArtifactKey::Statics(_, k) if *k == kind) {
            b.emit_pointer_reloc(ctx.node_symbol(node));
        }
    }

    match ctx.factory.end_symbol(id) {
        Some(end) => b.define_symbol(end),
        None => diagnostic_panic!(
            vec![id.internal_error("statics region without an end symbol")],
            "no end symbol for {kind} statics region",
        ),
    }

    b.build()
}
