// GC descriptors
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


//! GC descriptors describing where an object holds GC references.
//!
//! A GC descriptor immediately precedes the type descriptor it belongs
//!   to and is read by the collector _backwards_ from the type descriptor
//!   pointer,
//!     so the last value emitted is the first value read.
//!
//! For ordinary objects the descriptor is a list of _series_,
//!   each a run of consecutive pointer-sized cells holding references:
//!
//! ```text
//! [size(n) - base] [offset(n)] ... [size(1) - base] [offset(1)] [n]
//! ```
//!
//! where sizes and offsets are in bytes from the start of the object and
//!   every value is pointer-sized.
//! Storing sizes relative to the base size allows the same series to
//!   describe arrays,
//!     whose size varies with their length.
//!
//! Arrays of value types containing references instead repeat a pattern
//!   per element,
//!     encoded as pairs of half-pointer-sized values
//!     `(pointer cells, bytes to skip)`
//!   followed by the offset of the first reference and the _negated_
//!   number of pairs.

use crate::{
    obj::ObjectDataBuilder,
    session::PointerSize,
    ts::{TypeCategory, TypeId, TypeSystem, TypeSystemExt},
};

/// Whether instances of `ty` contain GC references.
///
/// For arrays this considers the elements.
pub fn has_gc_pointers(ts: &dyn TypeSystem, ty: TypeId) -> bool {
    match ts.category(ty) {
        TypeCategory::SzArray | TypeCategory::MdArray(_) => ts
            .element_type(ty)
            .map_or(false, |elem| is_gc_slot(ts, elem)),
        TypeCategory::Class | TypeCategory::Struct => fields_have_pointers(ts, ty),
        _ => false,
    }
}

/// Whether a field or element of type `ty` holds or contains references.
pub fn is_gc_slot(ts: &dyn TypeSystem, ty: TypeId) -> bool {
    ts.is_reference(ty)
        || (ts.category(ty) == TypeCategory::Struct && fields_have_pointers(ts, ty))
}

fn fields_have_pointers(ts: &dyn TypeSystem, ty: TypeId) -> bool {
    ts.base_chain(ty).any(|t| {
        ts.fields(t).into_iter().any(|f| {
            let field = ts.field(f);
            !field.is_static && is_gc_slot(ts, field.ty)
        })
    })
}

/// Mark the cells of `map` holding references within the instance fields
///   of `ty`,
///     whose data begins `base` bytes into the cells.
fn mark_fields(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    ty: TypeId,
    base: u32,
    map: &mut Vec<bool>,
) {
    for t in ts.base_chain(ty) {
        for f in ts.fields(t) {
            let field = ts.field(f);
            if field.is_static {
                continue;
            }

            let offset = base + field.offset;

            if ts.is_reference(field.ty) {
                let cell = (offset / ptr.bytes()) as usize;

                if map.len() <= cell {
                    map.resize(cell + 1, false);
                }
                map[cell] = true;
            } else if ts.category(field.ty) == TypeCategory::Struct {
                mark_fields(ts, ptr, field.ty, offset, map);
            }
        }
    }
}

/// Reference cells of an instance of `ty`,
///   where cell `0` holds the type descriptor pointer.
pub fn instance_pointer_map(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    ty: TypeId,
) -> Vec<bool> {
    let mut map = Vec::new();

    // Boxed value types begin their data after the descriptor pointer.
    let base = match ts.is_value_type(ty) {
        true => ptr.bytes(),
        false => 0,
    };

    mark_fields(ts, ptr, ty, base, &mut map);
    map
}

/// Reference cells within a single value of the value type `ty`.
pub fn value_pointer_map(ts: &dyn TypeSystem, ptr: PointerSize, ty: TypeId) -> Vec<bool> {
    let cells = (ts.instance_byte_count(ty) / ptr.bytes()) as usize;
    let mut map = vec![false; cells];

    mark_fields(ts, ptr, ty, 0, &mut map);
    map
}

/// Emit the GC descriptor of `ty`,
///   whose type descriptor reports `base_size`.
///
/// Nothing is emitted for types without references.
pub fn emit_type_descriptor(
    builder: &mut ObjectDataBuilder,
    ts: &dyn TypeSystem,
    ty: TypeId,
    base_size: u32,
) {
    let ptr = builder.pointer_size();

    if !has_gc_pointers(ts, ty) {
        return;
    }

    match ts.element_type(ty).filter(|_| ts.is_array(ty)) {
        Some(elem) if ts.is_reference(elem) => {
            emit_reference_array(builder, base_size)
        }
        Some(elem) => emit_value_array(
            builder,
            &value_pointer_map(ts, ptr, elem),
            base_size,
        ),
        None => emit_series(builder, &instance_pointer_map(ts, ptr, ty), base_size),
    }
}

/// Emit the standard series descriptor for the reference cells of
///   `map`.
///
/// Nothing is emitted if `map` has no references.
pub fn emit_series(builder: &mut ObjectDataBuilder, map: &[bool], base_size: u32) {
    let ptr = builder.pointer_size().bytes() as i64;
    let series = runs(map);

    if series.is_empty() {
        return;
    }

    for &(start, len) in series.iter().rev() {
        builder.emit_natural(len as i64 * ptr - base_size as i64);
        builder.emit_natural(start as i64 * ptr);
    }

    builder.emit_natural(series.len() as i64);
}

/// Every element is a reference,
///   forming a single series beginning just past the array length.
fn emit_reference_array(builder: &mut ObjectDataBuilder, base_size: u32) {
    let ptr = builder.pointer_size().bytes() as i64;

    builder.emit_natural(-(base_size as i64));
    builder.emit_natural(base_size as i64 - ptr);
    builder.emit_natural(1);
}

/// Elements begin one pointer before `base_size` for both single- and
///   multi-dimensional arrays.
fn emit_value_array(builder: &mut ObjectDataBuilder, elem_map: &[bool], base_size: u32) {
    let ptr = builder.pointer_size().bytes() as i64;
    let first_elem = base_size as i64 - ptr;
    let leading = elem_map.iter().take_while(|&&cell| !cell).count();

    // (pointer cells, non-pointer cells) beginning at the first pointer
    //   cell of an element and ending at the first pointer cell of the
    //   next.
    let mut pairs = Vec::new();
    let mut i = leading;

    while i < elem_map.len() {
        let pointers = elem_map[i..].iter().take_while(|&&cell| cell).count();
        i += pointers;
        let skip = elem_map[i..].iter().take_while(|&&cell| !cell).count();
        i += skip;

        pairs.push((pointers, skip));
    }

    if let Some(last) = pairs.last_mut() {
        last.1 += leading;
    }

    for &(pointers, skip) in pairs.iter().rev() {
        builder.emit_half_natural(pointers as i32);
        builder.emit_half_natural((skip as i64 * ptr) as i32);
    }

    builder.emit_natural(first_elem + leading as i64 * ptr);
    builder.emit_natural(-(pairs.len() as i64));
}

/// `(start, length)` of each run of set cells,
///   in ascending order.
fn runs(map: &[bool]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut i = 0;

    while i < map.len() {
        if !map[i] {
            i += 1;
            continue;
        }

        let len = map[i..].iter().take_while(|&&cell| cell).count();
        runs.push((i, len));
        i += len;
    }

    runs
}
