// Tests for custom attribute decoding
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
    session::{Options, PointerSize, SingleModuleGroup},
    ts::universe::{Universe, UniverseBuilder},
};

const PTR: PointerSize = PointerSize::Eight;

/// Hand-assembled attribute blob.
struct Blob(Vec<u8>);

impl Blob {
    fn new() -> Self {
        Self(vec![0x01, 0x00])
    }

    fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    fn u16(mut self, v: u16) -> Self {
        self.0.extend(v.to_le_bytes());
        self
    }

    fn u32(mut self, v: u32) -> Self {
        self.0.extend(v.to_le_bytes());
        self
    }

    fn string(mut self, s: &str) -> Self {
        match s.len() {
            len if len < 0x80 => self.0.push(len as u8),
            len => self.0.extend([0x80 | (len >> 8) as u8, len as u8]),
        }
        self.0.extend(s.as_bytes());
        self
    }

    fn build(self) -> Vec<u8> {
        self.0
    }
}

struct Sample {
    ts: Universe,
    foo: TypeId,
    bar: TypeId,
    my_attr: TypeId,
    ctor: MethodId,
    set_target: MethodId,
    annotated: TypeId,
    object_ctor: MethodId,
}

/// ```text
/// MyAttr {
///   .ctor(string, Type, int);
///   Type Target { set; }
///   Type ReadOnly { get; }
/// }
/// BoxAttr { .ctor(object, int[]) }
/// ```
fn sample(blobs: Vec<(bool, Vec<u8>)>) -> Sample {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let string = b.define(TypeCategory::String, "System.String");
    let int = b.primitive("System.Int32", PrimitiveKind::I4);
    let int_array = b.sz_array(int);

    let type_ty = b.class("System.Type");
    b.extends(type_ty, object);

    let foo = b.class("Foo");
    b.extends(foo, object);
    let bar = b.class("Bar");
    b.extends(bar, object);

    let my_attr = b.class("MyAttr");
    b.extends(my_attr, object);
    let ctor = b
        .method(my_attr, ".ctor")
        .params(&[string, type_ty, int])
        .build();
    let set_target = b.method(my_attr, "set_Target").params(&[type_ty]).build();
    b.property(my_attr, "Target", Some(set_target));
    b.property(my_attr, "ReadOnly", None);

    let box_attr = b.class("BoxAttr");
    b.extends(box_attr, object);
    let object_ctor = b
        .method(box_attr, ".ctor")
        .params(&[object, int_array])
        .build();

    let annotated = b.class("Annotated");
    b.extends(annotated, object);

    for (boxed, blob) in blobs {
        let ctor = if boxed { object_ctor } else { ctor };
        b.attribute(AttributeTarget::Type(annotated), Some(ctor), blob);
    }

    Sample {
        ts: b.finish(),
        foo,
        bar,
        my_attr,
        ctor,
        set_target,
        annotated,
        object_ctor,
    }
}

fn my_attr_blob() -> Blob {
    Blob::new().string("hi").string("Foo").u32(42)
}

fn attribute(s: &Sample, index: usize) -> CustomAttribute {
    s.ts.custom_attributes(AttributeTarget::Type(s.annotated))
        .remove(index)
}

#[test]
fn decodes_fixed_and_named_arguments() {
    let blob = my_attr_blob()
        .u16(1)
        .u8(NAMED_PROPERTY)
        .u8(code::TYPE)
        .string("Target")
        .string("Bar")
        .build();
    let s = sample(vec![(false, blob)]);

    assert_eq!(
        Ok(DecodedAttribute {
            constructor: s.ctor,
            fixed: vec![
                AttributeValue::String(Some("hi".into())),
                AttributeValue::Type(Some(s.foo)),
                AttributeValue::Primitive(PrimitiveKind::I4, 42),
            ],
            named: vec![NamedArgument {
                kind: NamedKind::Property,
                name: "Target".into(),
                value: AttributeValue::Type(Some(s.bar)),
            }],
        }),
        decode(&s.ts, &attribute(&s, 0)),
    );
}

#[test]
fn decodes_null_and_boxed_values() {
    let blob = Blob::new()
        .u8(0x08)
        .u32(7)
        .u32(NULL_ARRAY)
        .u16(1)
        .u8(NAMED_FIELD)
        .u8(code::STRING)
        .string("Note")
        .u8(NULL_STRING)
        .build();
    let s = sample(vec![(true, blob)]);

    assert_eq!(
        Ok(DecodedAttribute {
            constructor: s.object_ctor,
            fixed: vec![
                AttributeValue::Primitive(PrimitiveKind::I4, 7),
                AttributeValue::Array(None),
            ],
            named: vec![NamedArgument {
                kind: NamedKind::Field,
                name: "Note".into(),
                value: AttributeValue::String(None),
            }],
        }),
        decode(&s.ts, &attribute(&s, 0)),
    );
}

#[test]
fn decodes_arrays_and_long_strings() {
    let long = "x".repeat(200);
    let blob = Blob::new()
        .u8(code::STRING)
        .string(&long)
        .u32(2)
        .u32(1)
        .u32(2)
        .u16(0)
        .build();
    let s = sample(vec![(true, blob)]);

    let decoded = decode(&s.ts, &attribute(&s, 0)).unwrap();

    assert_eq!(AttributeValue::String(Some(long)), decoded.fixed[0]);
    assert_eq!(
        AttributeValue::Array(Some(vec![
            AttributeValue::Primitive(PrimitiveKind::I4, 1),
            AttributeValue::Primitive(PrimitiveKind::I4, 2),
        ])),
        decoded.fixed[1],
    );
}

#[test]
fn rejects_bad_prolog() {
    let s = sample(vec![(false, vec![0x02, 0x00])]);

    assert_eq!(
        Err(DecodeError::BadProlog(0x0002)),
        decode(&s.ts, &attribute(&s, 0)),
    );
}

#[test]
fn rejects_truncated_blob() {
    let blob = Blob::new().string("hi").string("Foo").u8(42).build();
    let s = sample(vec![(false, blob)]);

    assert_eq!(
        Err(DecodeError::UnexpectedEnd),
        decode(&s.ts, &attribute(&s, 0)),
    );
}

#[test]
fn rejects_missing_constructor() {
    let s = sample(vec![]);
    let attr = CustomAttribute {
        constructor: None,
        blob: my_attr_blob().u16(0).build(),
    };

    assert_eq!(Err(DecodeError::MissingConstructor), decode(&s.ts, &attr));
}

fn dependencies(s: &Sample) -> (NodeFactory, Vec<ArtifactKey>) {
    let options = Options::default().with_custom_attribute_scan(true);
    let group = SingleModuleGroup::default();
    let env = Env::new(&s.ts, &options, &group);
    let mut factory = NodeFactory::new();

    let deps = attribute_dependencies(env, &mut factory, AttributeTarget::Type(s.annotated));
    let keys = deps
        .into_iter()
        .map(|(id, _)| factory.graph().key(id).clone())
        .collect();

    (factory, keys)
}

#[test]
fn attribute_requires_constructor_type_and_typeof_arguments() {
    let blob = my_attr_blob()
        .u16(1)
        .u8(NAMED_PROPERTY)
        .u8(code::TYPE)
        .string("Target")
        .string("Bar")
        .build();
    let s = sample(vec![(false, blob)]);

    let (_, keys) = dependencies(&s);

    assert_eq!(
        vec![
            ArtifactKey::method_body(s.ctor),
            ArtifactKey::constructed_type(s.my_attr),
            ArtifactKey::method_body(s.set_target),
            ArtifactKey::necessary_type(s.foo),
            ArtifactKey::necessary_type(s.bar),
        ],
        keys,
    );
}

#[test]
fn property_without_setter_contributes_nothing() {
    let blob = my_attr_blob()
        .u16(1)
        .u8(NAMED_PROPERTY)
        .u8(code::TYPE)
        .string("ReadOnly")
        .u8(NULL_STRING)
        .build();
    let s = sample(vec![(false, blob)]);

    let (_, keys) = dependencies(&s);

    assert_eq!(
        vec![
            ArtifactKey::method_body(s.ctor),
            ArtifactKey::constructed_type(s.my_attr),
            ArtifactKey::necessary_type(s.foo),
        ],
        keys,
    );
}

// A bad attribute must not take its neighbors down with it.
#[test]
fn undecodable_attribute_is_skipped_alone() {
    let unknown_property = my_attr_blob()
        .u16(1)
        .u8(NAMED_PROPERTY)
        .u8(code::TYPE)
        .string("Missing")
        .string("Bar")
        .build();
    let unresolved = Blob::new().string("hi").string("Nope").u32(0).u16(0).build();
    let good = my_attr_blob().u16(0).build();

    let s = sample(vec![
        (false, unknown_property),
        (false, unresolved),
        (false, good),
    ]);

    assert_eq!(
        Err(DecodeError::UnknownProperty("Missing".into())),
        decode(&s.ts, &attribute(&s, 0)).and_then(|d| required_keys(&s.ts, &d)),
    );
    assert_eq!(
        Err(DecodeError::UnresolvedType("Nope".into())),
        decode(&s.ts, &attribute(&s, 1)),
    );

    let (factory, keys) = dependencies(&s);

    assert_eq!(
        vec![
            ArtifactKey::method_body(s.ctor),
            ArtifactKey::constructed_type(s.my_attr),
            ArtifactKey::necessary_type(s.foo),
        ],
        keys,
    );

    // Nothing on behalf of the bad attributes was created.
    assert!(factory.graph().node_count() == 3);
}
