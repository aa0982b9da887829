// Tests for runtime type descriptors
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


use super::*;
use crate::{
    emit::{
        optional::OptionalFields,
        test::{compile, PTR},
    },
    ts::{
        universe::{Universe, UniverseBuilder},
        PrimitiveKind, Variance,
    },
};

/// Size of the fixed descriptor header with 8-byte pointers.
const HEADER: u32 = 24;

/// ```text
/// System.Object
///   Animal { virtual Speak }
///     Dog : Animal { override Speak }
/// Point { int X; int Y }
/// Pair (struct) { int tag; long value }
/// Init { static .cctor }
/// List<T>
/// ```
struct Sample {
    ts: Universe,
    object: TypeId,
    int: TypeId,
    string: TypeId,
    animal: TypeId,
    dog: TypeId,
    point: TypeId,
    pair: TypeId,
    init: TypeId,
    list: TypeId,
    dog_speak: MethodId,
}

fn sample() -> Sample {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let int = b.primitive("System.Int32", PrimitiveKind::I4);
    let long = b.primitive("System.Int64", PrimitiveKind::I8);
    let string = b.define(TypeCategory::String, "System.String");

    let animal = b.class("Animal");
    let speak = b.method(animal, "Speak").virtual_slot().build();

    let dog = b.class("Dog");
    b.extends(dog, animal);
    let dog_speak = b.method(dog, "Speak").overriding(speak).build();

    let point = b.class("Point");
    b.field(point, "X", int);
    b.field(point, "Y", int);

    let pair = b.structure("Pair");
    b.field(pair, "tag", int);
    b.field(pair, "value", long);

    let init = b.class("Init");
    b.method(init, ".cctor").static_method().build();

    let list = b.class("List`1");
    b.generic(list, &[Variance::NonVariant]);

    Sample {
        ts: b.finish(),
        object,
        int,
        string,
        animal,
        dog,
        point,
        pair,
        init,
        list,
        dog_speak,
    }
}

#[test]
fn base_sizes_include_header_and_are_pointer_aligned() {
    let s = sample();
    let ts = &s.ts;

    // header + descriptor + two ints
    assert_eq!(24, base_size(ts, PTR, s.point));

    // boxed header + descriptor + padded fields
    assert_eq!(32, base_size(ts, PTR, s.pair));

    assert_eq!(22, base_size(ts, PTR, s.string));
    assert_eq!(24, base_size(ts, PTR, ts.sz_array(s.int)));

    // Nothing is ever smaller than three pointers.
    assert_eq!(24, base_size(ts, PTR, s.object));
}

#[test]
fn component_sizes_follow_element_types() {
    let s = sample();
    let ts = &s.ts;

    assert_eq!(2, component_size(ts, PTR, s.string));
    assert_eq!(4, component_size(ts, PTR, ts.sz_array(s.int)));
    assert_eq!(8, component_size(ts, PTR, ts.sz_array(s.object)));
    assert_eq!(16, component_size(ts, PTR, ts.sz_array(s.pair)));
    assert_eq!(0, component_size(ts, PTR, s.point));
}

#[test]
fn simple_class_header() {
    let s = sample();
    let key = ArtifactKey::constructed_type(s.point);
    let out = compile(&s.ts, &Default::default(), &[key.clone()]);

    assert_eq!(0, out.u16_at(&key, 0));
    assert_eq!(0, out.u16_at(&key, 2));
    assert_eq!(24, out.u32_at(&key, 4));

    // No base type.
    assert_eq!(0, out.u64_at(&key, 8));

    assert_eq!((0, 0), (out.u16_at(&key, 16), out.u16_at(&key, 18)));
    assert_eq!(s.ts.hash_code(s.point), out.u32_at(&key, 20));
}

#[test]
fn necessary_descriptor_has_no_vtable() {
    let s = sample();
    let key = ArtifactKey::necessary_type(s.dog);
    let out = compile(&s.ts, &Default::default(), &[key.clone()]);

    assert_eq!(0, out.u16_at(&key, 16));
    assert_eq!(
        out.address(&ArtifactKey::necessary_type(s.animal)),
        out.u64_at(&key, 8),
    );
    assert!(!out.is_emitted(&ArtifactKey::method_body(s.dog_speak)));
}

#[test]
fn constructed_descriptor_fills_vtable() {
    let s = sample();
    let key = ArtifactKey::constructed_type(s.dog);
    let out = compile(&s.ts, &Default::default(), &[key.clone()]);

    assert_eq!(1, out.u16_at(&key, 16));
    assert_eq!(
        out.address(&ArtifactKey::constructed_type(s.animal)),
        out.u64_at(&key, 8),
    );
    assert_eq!(
        out.address(&ArtifactKey::method_body(s.dog_speak)),
        out.u64_at(&key, HEADER),
    );
}

#[test]
fn primitive_descriptor_records_element_type() {
    let s = sample();
    let key = ArtifactKey::necessary_type(s.int);
    let out = compile(&s.ts, &Default::default(), &[key.clone()]);

    let bits = out.u16_at(&key, 2);

    assert_eq!(TypeKind::Canonical as u16, bits & flags::KIND_MASK);
    assert_ne!(0, bits & flags::VALUE_TYPE);
    assert_eq!(
        PrimitiveKind::I4.cor_element_type() as u16,
        bits >> flags::COR_ELEMENT_TYPE_SHIFT,
    );

    // 4-byte alignment differs from the pointer size.
    assert_ne!(0, bits & flags::OPTIONAL_FIELDS);
}

#[test]
fn optional_fields_follow_the_descriptor() {
    let s = sample();
    let key = ArtifactKey::constructed_type(s.init);
    let out = compile(&s.ts, &Default::default(), &[key.clone()]);

    assert_ne!(0, out.u16_at(&key, 2) & flags::OPTIONAL_FIELDS);

    // The pointer itself is the last thing before the blob.
    let blob_at = HEADER + 8;
    assert_eq!(
        out.address(&key) + blob_at as u64,
        out.u64_at(&key, HEADER),
    );

    let mut expected = OptionalFields::new();
    expected.add_rare_flags(rare::HAS_CCTOR);
    let expected = expected.encode();

    assert_eq!(&expected[..], out.bytes(&key, blob_at, expected.len()));
}

#[test]
fn generic_definition_descriptor() {
    let s = sample();
    let key = ArtifactKey::generic_definition(s.list);
    let out = compile(&s.ts, &Default::default(), &[key.clone()]);

    assert_eq!(
        TypeKind::GenericTypeDef as u16 | flags::IS_GENERIC,
        out.u16_at(&key, 2),
    );
    assert_eq!(s.ts.hash_code(s.list), out.u32_at(&key, 20));
}
