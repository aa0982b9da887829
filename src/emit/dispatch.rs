// Interface dispatch emission
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


//! Interface dispatch structures and indirection cells.
//!
//! An interface dispatch map tells the runtime which vtable slot of a
//!   type implements each interface method.
//! It is a `u32` entry count followed by one entry per implemented
//!   interface method:
//!
//! ```text
//! u16 interface index   (into the type's interface map)
//! u16 interface slot    (within the interface's vtable)
//! u16 implementation    (vtable slot of the implementing type)
//! ```
//!
//! An implementation without a vtable slot in the emitted descriptor
//!   cannot be reached through the interface and has no entry.
//!
//! A dispatch cell is the call site state of an interface call:
//!   the initial dispatch helper,
//!   the interface type tagged in its low bit,
//!   and the slot being called.

use super::EmitContext;
use crate::{
    deps::{vtable_layout, INITIAL_DISPATCH_HELPER},
    diagnose::Annotate,
    diagnostic_panic,
    graph::{ArtifactKey, NodeId},
    obj::{ObjectData, RelocKind, Section},
    ts::{MethodId, TypeId, TypeSystem, TypeSystemExt},
};

/// One entry of an interface dispatch map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMapEntry {
    pub interface_index: u16,
    pub interface_slot: u16,
    pub implementation_slot: u16,
}

/// Entries of the dispatch map of `ty`,
///   whose vtable is laid out as `vtable`.
pub fn dispatch_map_entries(
    ts: &dyn TypeSystem,
    ty: TypeId,
    vtable: &[MethodId],
) -> Vec<DispatchMapEntry> {
    let mut entries = Vec::new();

    for (i, iface) in ts.runtime_interfaces(ty).into_iter().enumerate() {
        for (j, slot) in ts.virtual_slots(iface).into_iter().enumerate() {
            let Some(target) = ts.resolve_interface_method(ty, slot) else {
                continue;
            };

            if ts.method(target).is_abstract {
                continue;
            }

            let defining = ts.slot_defining_method(target);

            if let Some(k) = vtable.iter().position(|&m| m == defining) {
                entries.push(DispatchMapEntry {
                    interface_index: i as u16,
                    interface_slot: j as u16,
                    implementation_slot: k as u16,
                });
            }
        }
    }

    entries
}

pub fn emit_dispatch_map(ctx: &mut EmitContext, id: NodeId, ty: TypeId) -> ObjectData {
    let vtable = vtable_layout(ctx.env, ctx.factory, ty);
    let entries = dispatch_map_entries(ctx.ts(), ty, &vtable);

    let mut b = ctx.node_builder(id, Section::ReadOnly).with_alignment(4);
    b.emit_u32(entries.len() as u32);

    for entry in entries {
        b.emit_u16(entry.interface_index);
        b.emit_u16(entry.interface_slot);
        b.emit_u16(entry.implementation_slot);
    }

    b.build()
}

/// Index of `method` among the slots of its interface.
///
/// Panics
/// ======
/// If `method` does not occupy a slot of its interface.
pub(super) fn interface_slot(ts: &dyn TypeSystem, method: MethodId) -> usize {
    let owner = ts.method(method).owner;
    let def = ts.method_definition(method);

    let slot = ts
        .virtual_slots(owner)
        .into_iter()
        .position(|slot| slot == method || ts.method_definition(slot) == def);

    match slot {
        Some(slot) => slot,
        None => diagnostic_panic!(
            vec![
                method.internal_error("dispatched through this method"),
                owner.note("whose interface has no slot for it"),
            ],
            "no interface slot for {method}",
        ),
    }
}

pub fn emit_dispatch_cell(ctx: &mut EmitContext, id: NodeId, method: MethodId) -> ObjectData {
    let ts = ctx.ts();
    let owner = ts.method(method).owner;
    let mut b = ctx.node_builder(id, Section::Data);

    b.emit_pointer_reloc(
        ctx.symbol_of(&ArtifactKey::extern_symbol(INITIAL_DISPATCH_HELPER)),
    );
    b.emit_reloc(
        RelocKind::Pointer,
        ctx.symbol_of(&ArtifactKey::necessary_type(owner)),
        1,
    );
    b.emit_natural(interface_slot(ts, method) as i64);

    b.build()
}

pub fn emit_indirection(ctx: &mut EmitContext, id: NodeId, target: NodeId) -> ObjectData {
    let mut b = ctx.node_builder(id, Section::Data);
    b.emit_pointer_reloc(ctx.node_symbol(target));
    b.build()
}
