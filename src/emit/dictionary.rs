// Generic dictionary emission
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


//! Exact generic dictionaries.
//!
//! A dictionary holds one pointer-sized slot per lookup in the layout of
//!   its canonical owner
//!     (see [`DictionaryLayouts`](crate::generic::DictionaryLayouts)),
//!   each resolved within the exact instantiation that the dictionary
//!   belongs to.
//!
//! Method dictionaries are preceded by a `u32` hash of the exact method,
//!   padded to pointer alignment,
//!     which the runtime uses to locate existing instantiations;
//!   the symbol follows the hash.
//!
//! A slot whose target was never marked belongs to code that is never
//!   executed for this instantiation and is left null.

use super::EmitContext;
use crate::{
    generic::{
        instantiate_lookup, method_hash_code, DictionaryOwner, GenericContext,
        SlotTarget,
    },
    graph::{ArtifactKey, NodeId},
    obj::{ObjectData, ObjectDataBuilder, Section},
    session::PointerSize,
    ts::{MethodId, TypeId},
};
use tracing::trace;

fn emit_slots(
    ctx: &EmitContext,
    b: &mut ObjectDataBuilder,
    key: &ArtifactKey,
    generic: &GenericContext,
) {
    let ts = ctx.ts();

    let Some(owner) = DictionaryOwner::of_dictionary(ts, key) else {
        return;
    };

    for lookup in ctx.layouts.layout(owner) {
        match instantiate_lookup(ts, lookup, generic) {
            Ok(SlotTarget::Value(value)) => b.emit_natural(value as i64),
            Ok(target @ SlotTarget::Node(..)) => {
                match target
                    .existing(ctx.env, ctx.factory)
                    .and_then(|id| ctx.marked_symbol(id))
                {
                    Some(sym) => b.emit_pointer_reloc(sym),
                    None => {
                        trace!(%key, %lookup, "dictionary slot target unmarked");
                        b.emit_zero_pointer();
                    }
                }
            }
            Ok(SlotTarget::Null) => b.emit_zero_pointer(),
            Err(e) => {
                trace!(%key, %lookup, error = %e, "dictionary slot unresolvable");
                b.emit_zero_pointer();
            }
        }
    }
}

pub fn emit_type_dictionary(ctx: &mut EmitContext, id: NodeId, ty: TypeId) -> ObjectData {
    let mut b = ctx.node_builder(id, Section::Data);
    let generic = GenericContext::for_type(ctx.ts(), ty);

    emit_slots(ctx, &mut b, &ArtifactKey::TypeDictionary(ty), &generic);
    b.build()
}

pub fn emit_method_dictionary(
    ctx: &mut EmitContext,
    id: NodeId,
    method: MethodId,
) -> ObjectData {
    let ts = ctx.ts();
    let mut b = ctx.builder(Section::Data);

    b.emit_u32(method_hash_code(ts, method));
    if ctx.ptr() == PointerSize::Eight {
        b.emit_u32(0);
    }

    b.define_symbol(ctx.factory.node_symbol(id));

    let generic = GenericContext::for_method(ts, method);
    emit_slots(ctx, &mut b, &ArtifactKey::MethodDictionary(method), &generic);
    b.build()
}
