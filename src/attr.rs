// Custom attribute decoding
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


//! Custom attribute blobs and the dependencies they introduce.
//!
//! An attribute that survives into the compiled program may be
//!   instantiated at runtime through reflection,
//!     which requires its constructor,
//!     its type,
//!     the types named by `typeof` arguments,
//!     and the setters of any properties it assigns.
//! All of these are found by decoding the attribute's value blob,
//!   whose grammar is:
//!
//! ```text
//! blob    := 0x0001 fixed* u16(count) named*
//! named   := (0x53 | 0x54) type-code SerString(name) value
//! string  := 0xFF | compressed(len) utf8
//! array   := u32(0xFFFFFFFF) | u32(count) value*
//! ```
//!
//! Fixed arguments are typed by the parameters of the constructor;
//!   named arguments and arguments of type `object` carry a type code.
//!
//! Metadata is not trusted.
//! A blob that fails to decode,
//!   or that names something that cannot be loaded,
//!   causes only that one attribute to be skipped
//!     (with a warning);
//!   it never fails the compilation.

use crate::{
    graph::{ArtifactKey, Env, NodeFactory, NodeId, Reason},
    ts::{
        AttributeTarget, CustomAttribute, MethodId, PrimitiveKind, TypeCategory,
        TypeId, TypeSystem, TypeSystemExt,
    },
};
use std::{error::Error, fmt::Display};
use tracing::warn;

const PROLOG: u16 = 0x0001;
const NULL_STRING: u8 = 0xFF;
const NULL_ARRAY: u32 = 0xFFFF_FFFF;

const NAMED_FIELD: u8 = 0x53;
const NAMED_PROPERTY: u8 = 0x54;

/// Type codes of tagged values.
mod code {
    pub const CLASS: u8 = 0x12;
    pub const STRING: u8 = 0x0E;
    pub const SZ_ARRAY: u8 = 0x1D;
    pub const TYPE: u8 = 0x50;
    pub const BOXED: u8 = 0x51;
    pub const ENUM: u8 = 0x55;
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// A custom attribute blob could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The attribute's constructor could not be resolved.
    MissingConstructor,

    /// The blob does not begin with the expected prolog.
    BadProlog(u16),

    /// The blob ended in the middle of a value.
    UnexpectedEnd,

    /// An element type or type code that may not appear in a blob.
    InvalidElementType(u8),

    /// A serialized type name does not name a known type.
    UnresolvedType(String),

    /// A named argument assigns a property that does not exist.
    UnknownProperty(String),

    /// A string is not valid UTF-8.
    InvalidString,
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingConstructor => write!(f, "unresolved attribute constructor"),
            Self::BadProlog(prolog) => {
                write!(f, "bad attribute prolog {prolog:#06x}")
            }
            Self::UnexpectedEnd => write!(f, "unexpected end of attribute blob"),
            Self::InvalidElementType(ty) => {
                write!(f, "invalid element type {ty:#04x} in attribute blob")
            }
            Self::UnresolvedType(name) => write!(f, "unresolved type `{name}`"),
            Self::UnknownProperty(name) => {
                write!(f, "attribute has no property `{name}`")
            }
            Self::InvalidString => write!(f, "attribute string is not UTF-8"),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Raw little-endian bits of a primitive or enum value.
    Primitive(PrimitiveKind, u64),
    String(Option<String>),
    Type(Option<TypeId>),
    Array(Option<Vec<AttributeValue>>),
}

impl AttributeValue {
    /// Types named by `typeof` within this value.
    fn referenced_types(&self, out: &mut Vec<TypeId>) {
        match self {
            Self::Type(Some(ty)) => out.push(*ty),
            Self::Array(Some(items)) => {
                items.iter().for_each(|v| v.referenced_types(out))
            }
            _ => (),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKind {
    Field,
    Property,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedArgument {
    pub kind: NamedKind,
    pub name: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttribute {
    pub constructor: MethodId,
    pub fixed: Vec<AttributeValue>,
    pub named: Vec<NamedArgument>,
}

/// Shape of a value to be read,
///   derived either from a parameter type or from a type code.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueKind {
    Primitive(PrimitiveKind),
    String,
    Type,
    Boxed,
    Array(Box<ValueKind>),
}

struct Decoder<'a> {
    ts: &'a dyn TypeSystem,
    blob: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn bytes(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::UnexpectedEnd)?;
        let bytes = self.blob.get(self.pos..end).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn uint(&mut self, n: usize) -> DecodeResult<u64> {
        let bytes = self.bytes(n)?;

        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// ECMA-335 compressed unsigned integer,
    ///   which is big-endian.
    fn compressed(&mut self) -> DecodeResult<u32> {
        let first = self.u8()? as u32;

        match first {
            b if b & 0x80 == 0 => Ok(b),
            b if b & 0xC0 == 0x80 => Ok(((b & 0x3F) << 8) | self.u8()? as u32),
            b if b & 0xE0 == 0xC0 => {
                let rest = self.bytes(3)?;
                Ok(((b & 0x1F) << 24)
                    | (rest[0] as u32) << 16
                    | (rest[1] as u32) << 8
                    | rest[2] as u32)
            }
            b => Err(DecodeError::InvalidElementType(b as u8)),
        }
    }

    fn ser_string(&mut self) -> DecodeResult<Option<String>> {
        if self.blob.get(self.pos) == Some(&NULL_STRING) {
            self.pos += 1;
            return Ok(None);
        }

        let len = self.compressed()? as usize;
        let bytes = self.bytes(len)?;

        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| DecodeError::InvalidString)
    }

    fn resolve_name(&mut self) -> DecodeResult<Option<TypeId>> {
        match self.ser_string()? {
            None => Ok(None),
            Some(name) => match self.ts.resolve_type_name(&name) {
                Some(ty) => Ok(Some(ty)),
                None => Err(DecodeError::UnresolvedType(name)),
            },
        }
    }

    /// Shape of a value of the parameter type `ty`.
    fn kind_of_type(&self, ty: TypeId) -> DecodeResult<ValueKind> {
        let ts = self.ts;

        match ts.category(ty) {
            TypeCategory::Primitive(k) | TypeCategory::Enum(k) => {
                Ok(ValueKind::Primitive(k))
            }
            TypeCategory::String => Ok(ValueKind::String),
            TypeCategory::SzArray => {
                let elem = ts.element_type(ty).ok_or(DecodeError::UnexpectedEnd)?;
                Ok(ValueKind::Array(Box::new(self.kind_of_type(elem)?)))
            }
            TypeCategory::Class if ts.name(ty) == "System.Type" => Ok(ValueKind::Type),
            TypeCategory::Class if ts.base_type(ty).is_none() => Ok(ValueKind::Boxed),
            _ => Err(DecodeError::InvalidElementType(code::CLASS)),
        }
    }

    /// Shape of a tagged value.
    fn kind_of_code(&mut self) -> DecodeResult<ValueKind> {
        match self.u8()? {
            code::STRING => Ok(ValueKind::String),
            code::TYPE => Ok(ValueKind::Type),
            code::BOXED => Ok(ValueKind::Boxed),
            code::SZ_ARRAY => Ok(ValueKind::Array(Box::new(self.kind_of_code()?))),
            code::ENUM => {
                let ty = self
                    .resolve_name()?
                    .ok_or(DecodeError::InvalidElementType(code::ENUM))?;

                match self.ts.category(ty).underlying_primitive() {
                    Some(k) => Ok(ValueKind::Primitive(k)),
                    None => Err(DecodeError::InvalidElementType(code::ENUM)),
                }
            }
            c => primitive_of_code(c)
                .map(ValueKind::Primitive)
                .ok_or(DecodeError::InvalidElementType(c)),
        }
    }

    fn value(&mut self, kind: &ValueKind) -> DecodeResult<AttributeValue> {
        match kind {
            ValueKind::Primitive(k) => {
                let size = primitive_size(*k)?;
                Ok(AttributeValue::Primitive(*k, self.uint(size)?))
            }
            ValueKind::String => Ok(AttributeValue::String(self.ser_string()?)),
            ValueKind::Type => Ok(AttributeValue::Type(self.resolve_name()?)),
            ValueKind::Boxed => {
                let inner = self.kind_of_code()?;
                self.value(&inner)
            }
            ValueKind::Array(elem) => {
                let count = self.uint(4)? as u32;

                if count == NULL_ARRAY {
                    return Ok(AttributeValue::Array(None));
                }

                (0..count)
                    .map(|_| self.value(elem))
                    .collect::<DecodeResult<Vec<_>>>()
                    .map(|items| AttributeValue::Array(Some(items)))
            }
        }
    }
}

fn primitive_of_code(code: u8) -> Option<PrimitiveKind> {
    use PrimitiveKind::*;

    [Boolean, Char, I1, U1, I2, U2, I4, U4, I8, U8, R4, R8]
        .into_iter()
        .find(|k| k.cor_element_type() == code)
}

/// Serialized size of a primitive.
///
/// Native-sized integers cannot appear in a blob.
fn primitive_size(k: PrimitiveKind) -> DecodeResult<usize> {
    use PrimitiveKind::*;

    match k {
        Boolean | I1 | U1 => Ok(1),
        Char | I2 | U2 => Ok(2),
        I4 | U4 | R4 => Ok(4),
        I8 | U8 | R8 => Ok(8),
        I | U => Err(DecodeError::InvalidElementType(k.cor_element_type())),
    }
}

/// Decode the value blob of an attribute.
pub fn decode(ts: &dyn TypeSystem, attr: &CustomAttribute) -> DecodeResult<DecodedAttribute> {
    let constructor = attr.constructor.ok_or(DecodeError::MissingConstructor)?;
    let mut d = Decoder {
        ts,
        blob: &attr.blob,
        pos: 0,
    };

    let prolog = d.uint(2)? as u16;
    if prolog != PROLOG {
        return Err(DecodeError::BadProlog(prolog));
    }

    let fixed = ts
        .method_signature(constructor)
        .into_iter()
        .map(|param| {
            let kind = d.kind_of_type(param)?;
            d.value(&kind)
        })
        .collect::<DecodeResult<Vec<_>>>()?;

    let count = d.uint(2)?;
    let mut named = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let kind = match d.u8()? {
            NAMED_FIELD => NamedKind::Field,
            NAMED_PROPERTY => NamedKind::Property,
            other => return Err(DecodeError::InvalidElementType(other)),
        };

        let value_kind = d.kind_of_code()?;
        let name = d.ser_string()?.ok_or(DecodeError::InvalidString)?;
        let value = d.value(&value_kind)?;

        named.push(NamedArgument { kind, name, value });
    }

    Ok(DecodedAttribute {
        constructor,
        fixed,
        named,
    })
}

/// Setter of the property `name` of `ty` or of its nearest base
///   declaring it.
fn find_setter(
    ts: &dyn TypeSystem,
    ty: TypeId,
    name: &str,
) -> DecodeResult<Option<MethodId>> {
    ts.base_chain(ty)
        .find_map(|t| ts.property_setter(t, name))
        .ok_or_else(|| DecodeError::UnknownProperty(name.into()))
}

/// Keys required to instantiate a decoded attribute at runtime.
fn required_keys(
    ts: &dyn TypeSystem,
    attr: &DecodedAttribute,
) -> DecodeResult<Vec<(ArtifactKey, Reason)>> {
    let owner = ts.method(attr.constructor).owner;
    let mut keys = vec![
        (ArtifactKey::method_body(attr.constructor), "attribute constructor"),
        (ArtifactKey::constructed_type(owner), "attribute type"),
    ];

    let mut types = Vec::new();
    attr.fixed.iter().for_each(|v| v.referenced_types(&mut types));

    for arg in &attr.named {
        arg.value.referenced_types(&mut types);

        if arg.kind == NamedKind::Property {
            if let Some(setter) = find_setter(ts, owner, &arg.name)? {
                keys.push((ArtifactKey::method_body(setter), "attribute property"));
            }
        }
    }

    keys.extend(
        types
            .into_iter()
            .map(|ty| (ArtifactKey::necessary_type(ty), "typeof in attribute")),
    );

    Ok(keys)
}

/// Dependencies contributed by the custom attributes of `target`.
///
/// Each attribute contributes everything or nothing;
///   attributes that cannot be decoded or whose requirements cannot be
///   loaded are skipped with a warning.
pub fn attribute_dependencies(
    env: Env,
    factory: &mut NodeFactory,
    target: AttributeTarget,
) -> Vec<(NodeId, Reason)> {
    let ts = env.ts;
    let mut deps = Vec::new();

    for attr in ts.custom_attributes(target) {
        let keys = match decode(ts, &attr).and_then(|d| required_keys(ts, &d)) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(?target, error = %e, "skipping undecodable custom attribute");
                continue;
            }
        };

        let nodes = keys
            .into_iter()
            .map(|(key, reason)| {
                factory.get_or_create(env, key).map(|id| (id, reason))
            })
            .collect::<Result<Vec<_>, _>>();

        match nodes {
            Ok(nodes) => deps.extend(nodes),
            Err(e) => warn!(?target, error = %e, "skipping unloadable custom attribute"),
        }
    }

    deps
}

#[cfg(test)]
mod test;
