// Type system collaborator
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

//! Type system interface consumed by the dependency graph.
//!
//! The compiler core does not resolve metadata,
//!   parse IL,
//!   or lay out fields itself.
//! It instead queries an already-built type system through the
//!   [`TypeSystem`] trait using opaque [`TypeId`],
//!   [`MethodId`],
//!   and [`FieldId`] handles.
//! Implementations must be deterministic and,
//!   from the perspective of the core,
//!   side-effect-free:
//!     asking for the same instantiation twice must yield the same
//!     handle,
//!       though an implementation is free to create that handle lazily
//!       on first request.
//!
//! [`universe`] provides an in-memory implementation suitable for
//!   embedding and for tests.

pub mod cast;
pub mod universe;

use crate::session::PointerSize;
use std::fmt::{self, Display};

macro_rules! ts_handle {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub const fn from_index(index: u32) -> Self {
                Self(index)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

ts_handle!(
    /// Opaque handle to a type known to a [`TypeSystem`].
    ///
    /// Handles are only meaningful to the type system that produced them.
    TypeId,
    "type"
);

ts_handle!(
    /// Opaque handle to a method known to a [`TypeSystem`].
    MethodId,
    "method"
);

ts_handle!(
    /// Opaque handle to a field known to a [`TypeSystem`].
    FieldId,
    "field"
);

/// Primitive value types with a fixed runtime element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    I,
    U,
}

impl PrimitiveKind {
    /// Size of a value of this type in bytes.
    pub fn size(self, ptr: PointerSize) -> u32 {
        use PrimitiveKind::*;

        match self {
            Boolean | I1 | U1 => 1,
            Char | I2 | U2 => 2,
            I4 | U4 | R4 => 4,
            I8 | U8 | R8 => 8,
            I | U => ptr.bytes(),
        }
    }

    /// Element type code recorded in the upper bits of a type
    ///   descriptor's flags.
    pub fn cor_element_type(self) -> u8 {
        use PrimitiveKind::*;

        match self {
            Boolean => 0x02,
            Char => 0x03,
            I1 => 0x04,
            U1 => 0x05,
            I2 => 0x06,
            U2 => 0x07,
            I4 => 0x08,
            U4 => 0x09,
            I8 => 0x0A,
            U8 => 0x0B,
            R4 => 0x0C,
            R8 => 0x0D,
            I => 0x18,
            U => 0x19,
        }
    }

    /// Size used when deciding whether two integral element types are
    ///   interchangeable for array casting purposes.
    ///
    /// Non-integral types produce `0`,
    ///   which never matches.
    pub fn integral_match_size(self, ptr: PointerSize) -> u32 {
        use PrimitiveKind::*;

        match self {
            I1 | U1 => 1,
            I2 | U2 => 2,
            I4 | U4 => 4,
            I8 | U8 => 8,
            I | U => ptr.bytes(),
            Boolean | Char | R4 | R8 => 0,
        }
    }
}

/// Whether a generic parameter belongs to a type or a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericParamKind {
    Type,
    Method,
}

/// Broad classification of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    Class,
    Struct,
    Interface,
    Primitive(PrimitiveKind),
    Enum(PrimitiveKind),
    String,
    SzArray,
    /// Multi-dimensional array of the given rank.
    MdArray(u32),
    Pointer,
    ByRef,
    FunctionPointer,
    /// Positional generic parameter awaiting substitution.
    GenericParameter(GenericParamKind, u32),
    /// The universal stand-in for reference-type arguments in shared
    ///   code.
    Canon,
}

impl TypeCategory {
    pub fn is_array(self) -> bool {
        matches!(self, Self::SzArray | Self::MdArray(_))
    }

    pub fn is_value_type(self) -> bool {
        matches!(self, Self::Struct | Self::Primitive(_) | Self::Enum(_))
    }

    pub fn is_interface(self) -> bool {
        matches!(self, Self::Interface)
    }

    /// Whether instances are heap objects tracked by the GC.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Self::Class
                | Self::Interface
                | Self::String
                | Self::SzArray
                | Self::MdArray(_)
                | Self::Canon
        )
    }

    /// The primitive kind of a primitive or the underlying primitive of an
    ///   enum.
    pub fn underlying_primitive(self) -> Option<PrimitiveKind> {
        match self {
            Self::Primitive(kind) | Self::Enum(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Variance of a generic parameter of a type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variance {
    NonVariant,
    Covariant,
    Contravariant,
}

/// A field as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub owner: TypeId,
    pub name: String,
    pub ty: TypeId,
    /// Byte offset from the start of instance data
    ///   (or of the owning statics region for static fields).
    pub offset: u32,
    pub is_static: bool,
    pub is_thread_static: bool,
}

/// A method as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDesc {
    pub owner: TypeId,
    pub name: String,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub is_static: bool,
    pub is_constructor: bool,
    pub is_pinvoke: bool,
    /// Metadata token,
    ///   if the method has a definition in metadata.
    pub token: Option<u32>,
}

/// An entity that may carry custom attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeTarget {
    Type(TypeId),
    Method(MethodId),
    Field(FieldId),
}

/// A custom attribute prior to decoding.
///
/// `blob` is the raw value blob;
///   see [`crate::attr`] for its grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAttribute {
    pub constructor: Option<MethodId>,
    pub blob: Vec<u8>,
}

/// Query interface for an already-built type system.
///
/// See the [module-level documentation](self) for the contract.
pub trait TypeSystem {
    fn category(&self, ty: TypeId) -> TypeCategory;

    /// Fully qualified name of a type definition.
    ///
    /// For instantiations and parameterized types this is the name of the
    ///   definition or element;
    ///     structure is recovered through other queries.
    fn name(&self, ty: TypeId) -> String;

    fn base_type(&self, ty: TypeId) -> Option<TypeId>;

    /// Interfaces implemented by a type,
    ///   including those inherited,
    ///   in stable declaration order.
    fn runtime_interfaces(&self, ty: TypeId) -> Vec<TypeId>;

    /// Element type of an array,
    ///   or the target of a pointer or byref.
    fn element_type(&self, ty: TypeId) -> Option<TypeId>;

    /// Generic type definition of an instantiated type,
    ///   or the type itself.
    fn type_definition(&self, ty: TypeId) -> TypeId;

    /// Type arguments of an instantiated type.
    ///
    /// For a generic type definition these are its formal parameters.
    fn instantiation(&self, ty: TypeId) -> Vec<TypeId>;

    /// Whether this is an uninstantiated generic type definition.
    fn is_generic_definition(&self, ty: TypeId) -> bool;

    fn variance(&self, def: TypeId, index: usize) -> Variance;

    /// Every field declared by a type,
    ///   static and instance.
    fn fields(&self, ty: TypeId) -> Vec<FieldId>;

    fn field(&self, field: FieldId) -> FieldDesc;

    /// Size of instance field data in bytes,
    ///   excluding any object header.
    fn instance_byte_count(&self, ty: TypeId) -> u32;

    /// Bytes of padding the layout algorithm appended to a value type.
    fn value_type_field_padding(&self, _ty: TypeId) -> u32 {
        0
    }

    /// Alignment in bytes required by the instance fields of a type.
    fn instance_field_alignment(&self, ty: TypeId) -> u32;

    fn hash_code(&self, ty: TypeId) -> u32;

    /// Class constructor that must run before statics are accessed.
    fn static_constructor(&self, ty: TypeId) -> Option<MethodId>;

    fn finalizer(&self, ty: TypeId) -> Option<MethodId>;

    fn default_constructor(&self, ty: TypeId) -> Option<MethodId>;

    /// Every method declared by a type.
    fn methods(&self, ty: TypeId) -> Vec<MethodId>;

    /// Virtual methods that introduce a new vtable slot on `ty`,
    ///   in slot order.
    fn virtual_slots(&self, ty: TypeId) -> Vec<MethodId>;

    /// Most-derived implementation of `decl` on `ty`,
    ///   if any.
    fn find_virtual_target(&self, ty: TypeId, decl: MethodId)
        -> Option<MethodId>;

    /// Implementation of an interface method on `ty`,
    ///   if any.
    fn resolve_interface_method(
        &self,
        ty: TypeId,
        iface_method: MethodId,
    ) -> Option<MethodId>;

    fn is_nullable(&self, _ty: TypeId) -> bool {
        false
    }

    /// Whether a value type is a homogeneous floating-point aggregate.
    fn is_hfa(&self, _ty: TypeId) -> bool {
        false
    }

    /// Implementations of the `IsInstanceOfInterface` and `GetImplType`
    ///   methods for types implementing the runtime's castable
    ///   interface.
    fn icastable_methods(&self, _ty: TypeId) -> Option<(MethodId, MethodId)> {
        None
    }

    /// The pseudo-type holding module-level globals.
    fn is_module_type(&self, _ty: TypeId) -> bool {
        false
    }

    fn instantiate_type(&self, def: TypeId, args: &[TypeId]) -> TypeId;

    /// Replace generic parameters in `ty` with the provided arguments.
    fn substitute(
        &self,
        ty: TypeId,
        type_args: &[TypeId],
        method_args: &[TypeId],
    ) -> TypeId;

    /// Shared form of a type standing in for all instantiations whose
    ///   code may be compiled once.
    fn canonical_form(&self, ty: TypeId) -> TypeId;

    /// Whether any part of the type is the canonical stand-in.
    fn is_canonical_subtype(&self, ty: TypeId) -> bool;

    /// Whether any part of the type is an unsubstituted generic
    ///   parameter.
    fn is_runtime_determined(&self, ty: TypeId) -> bool;

    fn method(&self, method: MethodId) -> MethodDesc;

    /// Method type arguments of an instantiated generic method.
    ///
    /// For an uninstantiated generic method definition these are its
    ///   formal parameters;
    ///     for non-generic methods this is empty.
    fn method_instantiation(&self, method: MethodId) -> Vec<TypeId>;

    /// Uninstantiated generic method on the same owning type,
    ///   or the method itself.
    fn method_definition(&self, method: MethodId) -> MethodId;

    fn instantiate_method(&self, def: MethodId, args: &[TypeId]) -> MethodId;

    /// The same method on another instantiation of its owning type.
    fn method_on_type(&self, method: MethodId, owner: TypeId) -> MethodId;

    fn canonical_method(&self, method: MethodId) -> MethodId;

    /// Parameter types,
    ///   excluding `this`.
    fn method_signature(&self, method: MethodId) -> Vec<TypeId>;

    fn custom_attributes(&self, _target: AttributeTarget) -> Vec<CustomAttribute> {
        Vec::new()
    }

    /// Resolve a serialized type name as found in custom attribute blobs.
    fn resolve_type_name(&self, _name: &str) -> Option<TypeId> {
        None
    }

    /// Setter of a property declared directly on `ty`.
    ///
    /// The outer `Option` indicates whether the property exists;
    ///   the inner whether it has a setter.
    fn property_setter(
        &self,
        _ty: TypeId,
        _name: &str,
    ) -> Option<Option<MethodId>> {
        None
    }
}

/// Convenience queries derived from the primitive [`TypeSystem`]
///   operations.
pub trait TypeSystemExt: TypeSystem {
    fn is_value_type(&self, ty: TypeId) -> bool {
        self.category(ty).is_value_type()
    }

    fn is_interface(&self, ty: TypeId) -> bool {
        self.category(ty).is_interface()
    }

    fn has_static_constructor(&self, ty: TypeId) -> bool {
        self.static_constructor(ty).is_some()
    }

    fn is_array(&self, ty: TypeId) -> bool {
        self.category(ty).is_array()
    }

    fn is_reference(&self, ty: TypeId) -> bool {
        self.category(ty).is_reference()
    }

    /// Whether the method has its own generic arguments.
    fn is_generic_method(&self, method: MethodId) -> bool {
        !self.method_instantiation(method).is_empty()
    }

    /// Whether a method is both virtual and generic over its own
    ///   parameters.
    fn is_generic_virtual(&self, method: MethodId) -> bool {
        self.method(method).is_virtual && self.is_generic_method(method)
    }

    fn is_shared_method(&self, method: MethodId) -> bool {
        self.canonical_method(method) == method
            && (self.is_canonical_subtype(self.method(method).owner)
                || self
                    .method_instantiation(method)
                    .iter()
                    .any(|&t| self.is_canonical_subtype(t)))
    }

    /// Whether any generic parameter of the type definition is variant.
    fn has_variance(&self, ty: TypeId) -> bool {
        let def = self.type_definition(ty);

        (0..self.instantiation(ty).len())
            .any(|i| self.variance(def, i) != Variance::NonVariant)
    }

    /// Whether the type declares or inherits any generic virtual method.
    fn has_generic_virtual_methods(&self, ty: TypeId) -> bool {
        self.methods(ty).into_iter().any(|m| self.is_generic_virtual(m))
    }

    /// Walk the base type chain,
    ///   beginning with `ty` itself.
    fn base_chain(&self, ty: TypeId) -> BaseChain<'_, Self> {
        BaseChain {
            ts: self,
            next: Some(ty),
        }
    }

    /// The method that introduced the vtable slot occupied by `method`.
    ///
    /// Overrides resolve to the slot they override;
    ///   anything that does not occupy a slot of its owner is returned
    ///   unchanged.
    fn slot_defining_method(&self, method: MethodId) -> MethodId {
        let owner = self.method(method).owner;
        let chain = self.base_chain(owner).collect::<Vec<_>>();

        chain
            .into_iter()
            .rev()
            .flat_map(|t| self.virtual_slots(t))
            .find(|&slot| self.find_virtual_target(owner, slot) == Some(method))
            .unwrap_or(method)
    }

    /// Whether `ty` or any part of its instantiation contains `needle`
    ///   as a proper subterm.
    fn contains_type(&self, ty: TypeId, needle: TypeId) -> bool {
        self.instantiation(ty)
            .into_iter()
            .chain(self.element_type(ty))
            .any(|sub| sub == needle || self.contains_type(sub, needle))
    }
}

impl<T: TypeSystem + ?Sized> TypeSystemExt for T {}

/// Iterator over a type and its ancestors.
///
/// See [`TypeSystemExt::base_chain`].
pub struct BaseChain<'a, T: TypeSystem + ?Sized> {
    ts: &'a T,
    next: Option<TypeId>,
}

impl<'a, T: TypeSystem + ?Sized> Iterator for BaseChain<'a, T> {
    type Item = TypeId;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        self.next = self.ts.base_type(cur);
        Some(cur)
    }
}
