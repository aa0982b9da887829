// Artifact keys
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

//! Identity of dependency graph nodes.
//!
//! Every node is identified by an [`ArtifactKey`],
//!   which names the kind of artifact along with the type,
//!   method,
//!   or other value it is derived from.
//! Two requests for the same key always yield the same node;
//!   see [`NodeFactory`](super::factory::NodeFactory).

use super::NodeId;
use crate::ts::{MethodId, TypeId};
use std::fmt::{self, Display};

/// Which of the three forms of type descriptor a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeFlavor {
    /// Enough of a descriptor to identify the type for casting and
    ///   reflection,
    ///     without a vtable.
    ///
    /// Objects of this type are never allocated by compiled code.
    Necessary,

    /// A complete descriptor for a type whose instances may be
    ///   allocated.
    Constructed,

    /// Descriptor of an uninstantiated generic type definition.
    GenericDefinition,
}

/// Storage class of a type's statics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StaticsKind {
    /// Statics that contain no GC references.
    NonGc,

    /// Statics holding GC references or value types containing them.
    Gc,

    /// Per-thread statics.
    Thread,
}

impl StaticsKind {
    pub const ALL: [StaticsKind; 3] =
        [StaticsKind::NonGc, StaticsKind::Gc, StaticsKind::Thread];
}

impl Display for StaticsKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NonGc => write!(f, "non-GC"),
            Self::Gc => write!(f, "GC"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

/// Identity of a node of the dependency graph.
///
/// Keys are _requests_;
///   the factory may normalize a key before looking it up
///     (for example,
///       method bodies are keyed by their canonical form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKey {
    /// Runtime descriptor of a type.
    TypeDescriptor(TypeId, TypeFlavor),

    /// Compiled code of a method.
    ///
    /// The flag requests an unboxing stub for an instance method of a
    ///   value type rather than the method itself.
    MethodBody(MethodId, bool),

    /// A concrete instantiation of a method whose code is shared.
    ///
    /// Its dependencies are those of the shared code,
    ///   with every generic lookup resolved for this instantiation.
    /// It is never emitted.
    ShadowConcreteMethod(MethodId),

    /// The given vtable slot is called virtually somewhere in the
    ///   program.
    VirtualMethodUse(MethodId),

    /// Implementations of a generic virtual method that must be compiled
    ///   for each type that may receive the call.
    GvmDependencies(MethodId),

    /// Mapping from interface slots to vtable slots of a type.
    InterfaceDispatchMap(TypeId),

    /// The slots that a type introduces into the vtables of itself and
    ///   its subtypes.
    VtableSlice(TypeId),

    /// Generic dictionary of an exact type instantiation.
    TypeDictionary(TypeId),

    /// Generic dictionary of an exact method instantiation.
    MethodDictionary(MethodId),

    /// Storage for the statics of a type.
    Statics(TypeId, StaticsKind),

    /// Descriptor the runtime uses to allocate GC statics,
    ///   identified by the map of which pointer-sized cells hold
    ///   references.
    GcStaticDescriptor(Vec<bool>),

    /// Table of every marked statics base of the given kind.
    StaticsRegion(StaticsKind),

    /// Call site cell for interface dispatch.
    DispatchCell(MethodId),

    /// A pointer-sized cell holding the address of another node.
    Indirection(NodeId),

    /// A symbol defined outside of the object being compiled.
    ExternSymbol(String),

    /// Table of relative pointers through which native layout tables
    ///   refer to nodes.
    ExternalReferences,

    /// Hashtable mapping reflectable methods to their entry points.
    ReflectionInvokeMap,

    /// Hashtable mapping interface generic virtual methods to their
    ///   implementations.
    InterfaceGvmTable,
}

impl ArtifactKey {
    pub fn necessary_type(ty: TypeId) -> Self {
        Self::TypeDescriptor(ty, TypeFlavor::Necessary)
    }

    pub fn constructed_type(ty: TypeId) -> Self {
        Self::TypeDescriptor(ty, TypeFlavor::Constructed)
    }

    pub fn generic_definition(ty: TypeId) -> Self {
        Self::TypeDescriptor(ty, TypeFlavor::GenericDefinition)
    }

    pub fn method_body(method: MethodId) -> Self {
        Self::MethodBody(method, false)
    }

    pub fn unboxing_stub(method: MethodId) -> Self {
        Self::MethodBody(method, true)
    }

    pub fn extern_symbol<S: Into<String>>(name: S) -> Self {
        Self::ExternSymbol(name.into())
    }

    /// Short name of the kind of artifact,
    ///   independent of what it is derived from.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::TypeDescriptor(_, TypeFlavor::Necessary) => "necessary type",
            Self::TypeDescriptor(_, TypeFlavor::Constructed) => {
                "constructed type"
            }
            Self::TypeDescriptor(_, TypeFlavor::GenericDefinition) => {
                "generic definition"
            }
            Self::MethodBody(_, false) => "method body",
            Self::MethodBody(_, true) => "unboxing stub",
            Self::ShadowConcreteMethod(..) => "shadow concrete method",
            Self::VirtualMethodUse(..) => "virtual method use",
            Self::GvmDependencies(..) => "generic virtual method dependencies",
            Self::InterfaceDispatchMap(..) => "interface dispatch map",
            Self::VtableSlice(..) => "vtable slice",
            Self::TypeDictionary(..) => "type dictionary",
            Self::MethodDictionary(..) => "method dictionary",
            Self::Statics(..) => "statics",
            Self::GcStaticDescriptor(..) => "GC static descriptor",
            Self::StaticsRegion(..) => "statics region",
            Self::DispatchCell(..) => "interface dispatch cell",
            Self::Indirection(..) => "indirection cell",
            Self::ExternSymbol(..) => "external symbol",
            Self::ExternalReferences => "external references",
            Self::ReflectionInvokeMap => "reflection invoke map",
            Self::InterfaceGvmTable => "interface generic virtual method table",
        }
    }

    /// The type this artifact is derived from,
    ///   if any.
    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Self::TypeDescriptor(ty, _)
            | Self::InterfaceDispatchMap(ty)
            | Self::VtableSlice(ty)
            | Self::TypeDictionary(ty)
            | Self::Statics(ty, _) => Some(*ty),
            _ => None,
        }
    }

    /// The method this artifact is derived from,
    ///   if any.
    pub fn method_id(&self) -> Option<MethodId> {
        match self {
            Self::MethodBody(m, _)
            | Self::ShadowConcreteMethod(m)
            | Self::VirtualMethodUse(m)
            | Self::GvmDependencies(m)
            | Self::MethodDictionary(m)
            | Self::DispatchCell(m) => Some(*m),
            _ => None,
        }
    }
}

impl Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = self.kind_name();

        match self {
            Self::Statics(ty, sk) => write!(f, "{sk} {kind} of {ty}"),
            Self::StaticsRegion(sk) => write!(f, "{sk} {kind}"),
            Self::GcStaticDescriptor(map) => {
                write!(f, "{kind} ")?;
                map.iter()
                    .try_for_each(|&b| write!(f, "{}", if b { '1' } else { '0' }))
            }
            Self::Indirection(node) => {
                write!(f, "{kind} for node#{}", node.index())
            }
            Self::ExternSymbol(name) => write!(f, "{kind} `{name}`"),
            _ => match (self.type_id(), self.method_id()) {
                (Some(ty), _) => write!(f, "{kind} {ty}"),
                (_, Some(m)) => write!(f, "{kind} {m}"),
                _ => write!(f, "{kind}"),
            },
        }
    }
}
