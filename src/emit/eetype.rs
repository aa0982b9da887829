// Type descriptor emission
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


//! Runtime type descriptors ("EETypes").
//!
//! A type descriptor is laid out as follows,
//!   where `ptr` denotes a target pointer:
//!
//! | Field                  | Size          | Present                  |
//! |------------------------|---------------|--------------------------|
//! | GC descriptor          | variable      | constructed with refs    |
//! | component size         | `u16`         | always                   |
//! | flags                  | `u16`         | always                   |
//! | base size              | `u32`         | always                   |
//! | related type           | `ptr`         | always (may be null)     |
//! | vtable slot count      | `u16`         | always                   |
//! | interface count        | `u16`         | always                   |
//! | hash code              | `u32`         | always                   |
//! | vtable                 | `ptr` × slots | constructed              |
//! | interface map          | `ptr` × count | always                   |
//! | finalizer              | `ptr`         | [`flags::HAS_FINALIZER`] |
//! | optional fields        | `ptr`         | [`flags::OPTIONAL_FIELDS`] |
//! | nullable type argument | `ptr`         | nullable types           |
//! | optional fields blob   | variable      | [`flags::OPTIONAL_FIELDS`] |
//!
//! The symbol of the descriptor follows the GC descriptor,
//!   which is read backwards from it.
//!
//! All three [`TypeFlavor`]s share this routine;
//!   necessary descriptors omit their vtable and report no slots,
//!   and generic definition descriptors carry little more than their
//!     flags and hash code.

use super::{
    gcdesc,
    optional::{rare, value_type_field_padding, OptionalField, OptionalFields},
    EmitContext,
};
use crate::{
    deps::{vtable_entry, vtable_layout},
    graph::{ArtifactKey, NodeId, TypeFlavor},
    obj::{ObjectData, RelocKind, Section},
    session::PointerSize,
    ts::{MethodId, TypeCategory, TypeId, TypeSystem, TypeSystemExt},
};

/// Bits of the descriptor flags field.
pub mod flags {
    /// [`super::TypeKind`] occupies the low bits.
    pub const KIND_MASK: u16 = 0x0003;
    pub const RELATED_TYPE_VIA_IAT: u16 = 0x0004;
    pub const VALUE_TYPE: u16 = 0x0008;
    pub const HAS_FINALIZER: u16 = 0x0010;
    pub const HAS_POINTERS: u16 = 0x0020;
    pub const GENERIC_VARIANCE: u16 = 0x0080;
    pub const OPTIONAL_FIELDS: u16 = 0x0100;
    pub const IS_INTERFACE: u16 = 0x0200;
    pub const IS_GENERIC: u16 = 0x0400;

    /// Element type code is stored above this bit.
    pub const COR_ELEMENT_TYPE_SHIFT: u16 = 11;
}

/// Kind recorded in the low bits of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TypeKind {
    Canonical = 0,

    /// Arrays and pointers.
    Parameterized = 2,
    GenericTypeDef = 3,
}

/// Element type code recorded for every array type.
pub const ARRAY_ELEMENT_TYPE: u8 = 0x14;

/// Element type code of unmanaged pointers.
pub const PTR_ELEMENT_TYPE: u8 = 0x0F;

/// Bytes of an empty string:
///   descriptor and header pointers,
///   length,
///   and terminator.
fn string_base_size(ptr: PointerSize) -> u32 {
    2 * ptr.bytes() + 4 + 2
}

/// Size of an instance of `ty` excluding any array or string
///   components.
pub fn base_size(ts: &dyn TypeSystem, ptr: PointerSize, ty: TypeId) -> u32 {
    let p = ptr.bytes();

    let size = match ts.category(ty) {
        TypeCategory::String => return string_base_size(ptr),
        TypeCategory::Pointer => return 0,
        TypeCategory::SzArray => 3 * p,
        TypeCategory::MdArray(rank) => 3 * p + 8 * rank,
        _ if ts.is_value_type(ty) => 2 * p + ts.instance_byte_count(ty),
        _ => p + ts.instance_byte_count(ty),
    };

    ptr.align(size).max(3 * p)
}

/// Size of each array element,
///   or of each character of a string.
pub fn component_size(ts: &dyn TypeSystem, ptr: PointerSize, ty: TypeId) -> u16 {
    match ts.category(ty) {
        TypeCategory::String => 2,
        TypeCategory::SzArray | TypeCategory::MdArray(_) => {
            match ts.element_type(ty) {
                Some(elem) if ts.is_value_type(elem) => {
                    ts.instance_byte_count(elem) as u16
                }
                Some(_) => ptr.bytes() as u16,
                None => 0,
            }
        }
        _ => 0,
    }
}

fn kind(ts: &dyn TypeSystem, ty: TypeId, flavor: TypeFlavor) -> TypeKind {
    match ts.category(ty) {
        _ if flavor == TypeFlavor::GenericDefinition => TypeKind::GenericTypeDef,
        TypeCategory::SzArray | TypeCategory::MdArray(_) | TypeCategory::Pointer => {
            TypeKind::Parameterized
        }
        _ => TypeKind::Canonical,
    }
}

fn cor_element_type(ts: &dyn TypeSystem, ty: TypeId) -> u8 {
    let cat = ts.category(ty);

    match cat.underlying_primitive() {
        Some(prim) => prim.cor_element_type(),
        None if cat.is_array() => ARRAY_ELEMENT_TYPE,
        None if cat == TypeCategory::Pointer => PTR_ELEMENT_TYPE,
        None => 0,
    }
}

/// Vtable slot of the implementation of `method` on `ty`,
///   where `method` may be an interface method.
fn slot_index(
    ts: &dyn TypeSystem,
    ty: TypeId,
    vtable: &[MethodId],
    method: MethodId,
) -> Option<u32> {
    let target = match ts.is_interface(ts.method(method).owner) {
        true => ts.resolve_interface_method(ty, method)?,
        false => method,
    };

    let slot = ts.slot_defining_method(target);
    vtable.iter().position(|&m| m == slot).map(|i| i as u32)
}

/// Compute the optional fields of a descriptor.
fn optional_fields(
    ctx: &mut EmitContext,
    id: NodeId,
    ty: TypeId,
    vtable: Option<&[MethodId]>,
) -> OptionalFields {
    let ts = ctx.ts();
    let ptr = ctx.ptr();
    let mut fields = OptionalFields::new();

    if ctx.env.options.target.requires_align8()
        && ts.instance_field_alignment(ty) > 4
    {
        fields.add_rare_flags(rare::REQUIRES_ALIGN8);
    }

    if ts.has_static_constructor(ty) {
        fields.add_rare_flags(rare::HAS_CCTOR);
    }

    if ts.is_hfa(ty) {
        fields.add_rare_flags(rare::IS_HFA);
    }

    if ts.is_nullable(ty) {
        fields.add_rare_flags(rare::IS_NULLABLE);

        let value = ts
            .fields(ty)
            .into_iter()
            .map(|f| ts.field(f))
            .find(|f| !f.is_static && f.name == "value");

        if let Some(value) = value {
            fields.set(OptionalField::NullableValueOffset, value.offset.saturating_sub(1));
        }
    }

    if let (Some(vtable), Some((is_inst, get_impl))) = (vtable, ts.icastable_methods(ty)) {
        fields.add_rare_flags(rare::ICASTABLE);

        if let Some(slot) = slot_index(ts, ty, vtable, is_inst) {
            fields.set(OptionalField::ICastableIsInstSlot, slot);
        }
        if let Some(slot) = slot_index(ts, ty, vtable, get_impl) {
            fields.set(OptionalField::ICastableGetImplTypeSlot, slot);
        }
    }

    if ctx.factory.graph().node(id).caps().track_dispatch_map {
        let map = ArtifactKey::InterfaceDispatchMap(ty);
        let index = ctx.ext_index_of(&map);
        fields.set(OptionalField::DispatchMap, index);
    }

    if ts.is_value_type(ty) {
        let padding = value_type_field_padding(
            ts.value_type_field_padding(ty),
            ts.instance_field_alignment(ty),
            ptr.bytes(),
        );

        if let Some(padding) = padding {
            fields.set(OptionalField::ValueTypeFieldPadding, padding);
        }
    }

    fields
}

/// Emit the descriptor of `ty` for node `id`.
pub fn emit(
    ctx: &mut EmitContext,
    id: NodeId,
    ty: TypeId,
    flavor: TypeFlavor,
) -> ObjectData {
    let ts = ctx.ts();
    let ptr = ctx.ptr();
    let env = ctx.env;
    let symbol = ctx.factory.node_symbol(id);
    let caps = ctx.factory.graph().node(id).caps();

    let mut b = ctx.builder(Section::Data);

    if flavor == TypeFlavor::GenericDefinition {
        let mut bits = TypeKind::GenericTypeDef as u16 | flags::IS_GENERIC;
        if ts.is_interface(ty) {
            bits |= flags::IS_INTERFACE;
        }

        b.define_symbol(symbol);
        b.emit_u16(0);
        b.emit_u16(bits);
        b.emit_u32(0);
        b.emit_zero_pointer();
        b.emit_u16(0);
        b.emit_u16(0);
        b.emit_u32(ts.hash_code(ty));
        return b.build();
    }

    let constructed = flavor == TypeFlavor::Constructed;
    let base = base_size(ts, ptr, ty);

    if constructed {
        gcdesc::emit_type_descriptor(&mut b, ts, ty, base);
    }

    let symbol_offset = b.offset();
    b.define_symbol(symbol);

    let vtable = caps
        .emit_vtable
        .then(|| vtable_layout(env, ctx.factory, ty));
    let ifaces = ts.runtime_interfaces(ty);
    let finalizer = ts.finalizer(ty).filter(|_| constructed);
    let nullable_arg = match ts.is_nullable(ty) {
        true => ts.instantiation(ty).first().copied(),
        false => None,
    };
    let optional = optional_fields(ctx, id, ty, vtable.as_deref());

    let mut bits = kind(ts, ty, flavor) as u16
        | ((cor_element_type(ts, ty) as u16) << flags::COR_ELEMENT_TYPE_SHIFT);

    for (cond, flag) in [
        (ts.is_value_type(ty), flags::VALUE_TYPE),
        (finalizer.is_some(), flags::HAS_FINALIZER),
        (gcdesc::has_gc_pointers(ts, ty), flags::HAS_POINTERS),
        (ts.has_variance(ty), flags::GENERIC_VARIANCE),
        (!optional.is_empty(), flags::OPTIONAL_FIELDS),
        (ts.is_interface(ty), flags::IS_INTERFACE),
        (!ts.instantiation(ty).is_empty(), flags::IS_GENERIC),
    ] {
        if cond {
            bits |= flag;
        }
    }

    b.emit_u16(component_size(ts, ptr, ty));
    b.emit_u16(bits);
    b.emit_u32(base);

    let related = match ts.element_type(ty) {
        Some(elem) => Some(ArtifactKey::necessary_type(elem)),
        None => ts.base_type(ty).map(|base| match constructed {
            true => ArtifactKey::constructed_type(base),
            false => ArtifactKey::necessary_type(base),
        }),
    };

    match related {
        Some(key) => b.emit_pointer_reloc(ctx.symbol_of(&key)),
        None => b.emit_zero_pointer(),
    }

    b.emit_u16(vtable.as_ref().map_or(0, Vec::len) as u16);
    b.emit_u16(ifaces.len() as u16);
    b.emit_u32(ts.hash_code(ty));

    for &slot in vtable.iter().flatten() {
        match ts.find_virtual_target(ty, slot) {
            Some(target) if !ts.method(target).is_abstract => {
                b.emit_pointer_reloc(ctx.symbol_of(&vtable_entry(env, ty, target)))
            }
            _ => b.emit_zero_pointer(),
        }
    }

    for &iface in &ifaces {
        b.emit_pointer_reloc(ctx.symbol_of(&ArtifactKey::necessary_type(iface)));
    }

    if let Some(fin) = finalizer {
        b.emit_pointer_reloc(ctx.symbol_of(&ArtifactKey::method_body(fin)));
    }

    let blob = optional.encode();

    if !blob.is_empty() {
        let trailing = match nullable_arg {
            Some(_) => 2,
            None => 1,
        };
        let blob_offset = b.offset() + trailing * ptr.bytes();

        b.emit_reloc(
            RelocKind::Pointer,
            symbol,
            (blob_offset - symbol_offset) as i64,
        );
    }

    if let Some(arg) = nullable_arg {
        b.emit_pointer_reloc(ctx.symbol_of(&ArtifactKey::necessary_type(arg)));
    }

    b.emit_bytes(&blob);
    b.build()
}

#[cfg(test)]
mod test;
