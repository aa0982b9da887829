// Dependency graph node factory
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

//! Creation and interning of dependency graph nodes.
//!
//! The [`NodeFactory`] is the only way to obtain a [`NodeId`].
//! It guarantees that a given [`ArtifactKey`] always yields the same node
//!   for the life of the compilation,
//!     and that every node it hands out is valid:
//!       keys that could never be satisfied at runtime
//!         (e.g. a descriptor for a byref type)
//!       are rejected with a [`TypeLoadError`] at the time they are
//!       requested,
//!         attributed to the offending type or method.
//!
//! Some keys are normalized before lookup:
//!
//!   - method bodies are keyed by the canonical form of their method,
//!       since all instantiations sharing code share a body;
//!       and
//!   - virtual method uses are keyed by the canonical form of the method
//!       that introduced the slot,
//!         since it is the slot that is used,
//!           not any particular override.
//!
//! Nodes are cached per kind of key.

use super::{
    ArtifactKey, Capabilities, DependencyGraph, NodeId, StaticsKind,
    TypeFlavor,
};
use crate::{
    diagnose::{Annotate, AnnotatedEntity, Diagnostic, Entity},
    global,
    mangle::NameMangler,
    session::{CompilationGroup, Options, PointerSize},
    sym::{Interner, SymbolId},
    ts::{MethodId, TypeCategory, TypeId, TypeSystem, TypeSystemExt},
};
use fxhash::FxHashMap;
use std::{
    error::Error,
    fmt::{self, Debug, Display},
};
use tracing::trace;

pub type FactoryResult<T> = Result<T, TypeLoadError>;

/// Everything outside of the graph that node creation depends upon.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub ts: &'a dyn TypeSystem,
    pub options: &'a Options,
    pub group: &'a dyn CompilationGroup,
}

impl<'a> Env<'a> {
    pub fn new(
        ts: &'a dyn TypeSystem,
        options: &'a Options,
        group: &'a dyn CompilationGroup,
    ) -> Self {
        Self { ts, options, group }
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.options.pointer_size()
    }

    /// Whether the vtable slots introduced by `ty` are all emitted,
    ///   rather than only those proven to be used.
    pub fn full_vtable(&self, ty: TypeId) -> bool {
        self.options.full_analysis || self.group.full_vtable(ty)
    }
}

/// Why a key cannot be turned into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeLoadReason {
    /// An uninstantiated generic type or method was used where an
    ///   instantiation is required.
    GenericDefinition,

    /// A generic definition descriptor was requested for a type that is
    ///   not a generic definition.
    NotGenericDefinition,

    /// Byrefs cannot be boxed and so have no runtime descriptor.
    ByRef,

    /// Function pointers have no runtime descriptor.
    FunctionPointer,

    /// A bare generic parameter was used where a concrete type is
    ///   required.
    GenericParameter,

    /// A type containing unsubstituted generic parameters was used where
    ///   a concrete type is required.
    RuntimeDetermined,

    /// A type containing the canonical stand-in was used where an exact
    ///   type is required.
    CanonicalSubtype,

    /// The module pseudo-type cannot be instantiated at runtime.
    ModuleType,

    /// Multi-dimensional array rank exceeds what the runtime supports.
    ArrayRank(u32),

    /// Arrays of byrefs,
    ///   pointers,
    ///   or function pointers cannot be described.
    InvalidArrayElement,

    /// Array element size does not fit in a descriptor.
    ComponentSize(u32),

    /// Abstract methods have no body.
    AbstractMethod,

    /// Unboxing stubs exist only for instance methods of value types.
    NotUnboxable,

    /// Interface dispatch cells may only target interface methods.
    NotInterfaceMethod,
}

impl Display for TypeLoadReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::GenericDefinition => {
                write!(f, "generic definitions must be instantiated")
            }
            Self::NotGenericDefinition => {
                write!(f, "not a generic type definition")
            }
            Self::ByRef => write!(f, "byref types have no runtime descriptor"),
            Self::FunctionPointer => {
                write!(f, "function pointer types have no runtime descriptor")
            }
            Self::GenericParameter => {
                write!(f, "generic parameters must be substituted")
            }
            Self::RuntimeDetermined => {
                write!(f, "type contains unsubstituted generic parameters")
            }
            Self::CanonicalSubtype => {
                write!(f, "shared canonical form used where an exact type is required")
            }
            Self::ModuleType => {
                write!(f, "the module type cannot be loaded at runtime")
            }
            Self::ArrayRank(rank) => write!(
                f,
                "array rank {rank} exceeds maximum of {}",
                global::MAX_ARRAY_RANK,
            ),
            Self::InvalidArrayElement => write!(
                f,
                "arrays of byrefs, pointers, or function pointers are not supported",
            ),
            Self::ComponentSize(size) => write!(
                f,
                "array element size {size} exceeds maximum of {}",
                global::MAX_COMPONENT_SIZE,
            ),
            Self::AbstractMethod => write!(f, "abstract methods have no body"),
            Self::NotUnboxable => write!(
                f,
                "unboxing stubs require an instance method of a value type",
            ),
            Self::NotInterfaceMethod => {
                write!(f, "dispatch cells require an interface method")
            }
        }
    }
}

/// A key was requested that can never be satisfied.
///
/// This is attributed to the type or method that caused the failure,
///   which may be a component of the requested key rather than the key
///   itself
///     (e.g. the element type of an array).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLoadError {
    key: ArtifactKey,
    culprit: Entity,
    reason: TypeLoadReason,
}

impl TypeLoadError {
    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    pub fn culprit(&self) -> Entity {
        self.culprit
    }

    pub fn reason(&self) -> &TypeLoadReason {
        &self.reason
    }
}

impl Display for TypeLoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "failed to load {} while producing {}: {}",
            self.culprit, self.key, self.reason
        )
    }
}

impl Error for TypeLoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl Diagnostic for TypeLoadError {
    fn describe(&self) -> Vec<AnnotatedEntity> {
        vec![self.culprit.error(self.reason.to_string())]
    }
}

/// A validation failure prior to being associated with its key.
type Rejection = (Entity, TypeLoadReason);

/// Generate per-kind node caches and a constructor method for each kind
///   of [`ArtifactKey`].
///
/// Each `keyed` variant receives a map keyed by its fields;
///   `singleton` variants are cached in an [`Option`].
macro_rules! node_caches {
    (
        keyed {
            $($kind:ident($($field:ident: $ty:ty),+);)*
        }
        singleton { $($unit:ident),* $(,)? }
    ) => {paste::paste! {
        /// Nodes previously created,
        ///   by kind of key.
        #[derive(Debug, Default)]
        struct NodeCaches {
            $([<$kind:snake>]: FxHashMap<($($ty,)+), NodeId>,)*
            $([<$unit:snake>]: Option<NodeId>,)*
        }

        impl NodeCaches {
            fn get(&self, key: &ArtifactKey) -> Option<NodeId> {
                match key {
                    $(
                        ArtifactKey::$kind($($field),+) => self
                            .[<$kind:snake>]
                            .get(&($($field.clone(),)+))
                            .copied(),
                    )*
                    $(ArtifactKey::$unit => self.[<$unit:snake>],)*
                }
            }

            fn insert(&mut self, key: ArtifactKey, id: NodeId) {
                match key {
                    $(
                        ArtifactKey::$kind($($field),+) => {
                            self.[<$kind:snake>].insert(($($field,)+), id);
                        }
                    )*
                    $(ArtifactKey::$unit => self.[<$unit:snake>] = Some(id),)*
                }
            }

            fn len(&self) -> usize {
                0 $(+ self.[<$kind:snake>].len())*
                  $(+ self.[<$unit:snake>].is_some() as usize)*
            }
        }

        impl NodeFactory {
            $(
                #[doc = concat!(
                    "Node for [`ArtifactKey::", stringify!($kind), "`]."
                )]
                pub fn [<$kind:snake>](
                    &mut self,
                    env: Env,
                    $($field: $ty),+
                ) -> FactoryResult<NodeId> {
                    self.get_or_create(env, ArtifactKey::$kind($($field),+))
                }
            )*

            $(
                #[doc = concat!(
                    "Node for [`ArtifactKey::", stringify!($unit), "`]."
                )]
                pub fn [<$unit:snake>](
                    &mut self,
                    env: Env,
                ) -> FactoryResult<NodeId> {
                    self.get_or_create(env, ArtifactKey::$unit)
                }
            )*
        }
    }};
}

node_caches! {
    keyed {
        TypeDescriptor(ty: TypeId, flavor: TypeFlavor);
        MethodBody(method: MethodId, unboxing: bool);
        ShadowConcreteMethod(method: MethodId);
        VirtualMethodUse(method: MethodId);
        GvmDependencies(method: MethodId);
        InterfaceDispatchMap(ty: TypeId);
        VtableSlice(ty: TypeId);
        TypeDictionary(ty: TypeId);
        MethodDictionary(method: MethodId);
        Statics(ty: TypeId, kind: StaticsKind);
        GcStaticDescriptor(map: Vec<bool>);
        StaticsRegion(kind: StaticsKind);
        DispatchCell(method: MethodId);
        Indirection(target: NodeId);
        ExternSymbol(name: String);
    }
    singleton { ExternalReferences, ReflectionInvokeMap, InterfaceGvmTable }
}

/// Creates nodes and owns the [`DependencyGraph`] they live on.
pub struct NodeFactory {
    graph: DependencyGraph,
    interner: Interner,
    mangler: NameMangler,
    caches: NodeCaches,
}

impl Debug for NodeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[NodeFactory: {} cached, {:?}]", self.caches.len(), self.graph)
    }
}

impl Default for NodeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeFactory {
    pub fn new() -> Self {
        Self {
            graph: DependencyGraph::new(),
            interner: Interner::new(),
            mangler: NameMangler::new(),
            caches: NodeCaches::default(),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Mangled name of an interned symbol.
    pub fn symbol_name(&self, sym: SymbolId) -> &str {
        self.interner.lookup(sym)
    }

    pub fn node_symbol(&self, id: NodeId) -> SymbolId {
        self.graph.node(id).symbol()
    }

    pub fn necessary_type(&mut self, env: Env, ty: TypeId) -> FactoryResult<NodeId> {
        self.type_descriptor(env, ty, TypeFlavor::Necessary)
    }

    pub fn constructed_type(
        &mut self,
        env: Env,
        ty: TypeId,
    ) -> FactoryResult<NodeId> {
        self.type_descriptor(env, ty, TypeFlavor::Constructed)
    }

    /// Retrieve the node for `key`,
    ///   creating it if it does not yet exist.
    ///
    /// A key is validated only once,
    ///   when its node is created.
    pub fn get_or_create(
        &mut self,
        env: Env,
        key: ArtifactKey,
    ) -> FactoryResult<NodeId> {
        let key = normalize(env.ts, key);

        if let Some(id) = self.caches.get(&key) {
            return Ok(id);
        }

        validate(env, &key).map_err(|(culprit, reason)| TypeLoadError {
            key: key.clone(),
            culprit,
            reason,
        })?;

        let name = self.symbol_text(env, &key);
        let symbol = self.interner.intern(&name);
        let caps = capabilities(env, &key);

        let id = self.graph.add(key.clone(), symbol, caps);
        trace!(node = id.index(), %key, symbol = %name, "created node");

        self.caches.insert(key, id);
        Ok(id)
    }

    /// Retrieve the node for `key` only if it has already been created.
    pub fn existing(&self, env: Env, key: &ArtifactKey) -> Option<NodeId> {
        self.caches.get(&normalize(env.ts, key.clone()))
    }

    /// Whether the node for `key` exists and has been marked.
    pub fn is_marked(&self, env: Env, key: &ArtifactKey) -> bool {
        self.existing(env, key)
            .map_or(false, |id| self.graph.is_marked(id))
    }

    /// Symbol defined at the end of a node's data,
    ///   for nodes whose size must be known at runtime.
    pub fn end_symbol(&self, id: NodeId) -> Option<SymbolId> {
        let name = match self.graph.key(id) {
            ArtifactKey::StaticsRegion(kind) => {
                format!("__{}StaticRegionEnd", statics_prefix(*kind))
            }
            ArtifactKey::ReflectionInvokeMap => {
                "__method_to_entrypoint_map_End".into()
            }
            ArtifactKey::InterfaceGvmTable => "__interface_gvm_table_End".into(),
            _ => return None,
        };

        Some(self.interner.intern(&name))
    }

    /// Mangled name of the node for `key`.
    fn symbol_text(&mut self, env: Env, key: &ArtifactKey) -> String {
        use ArtifactKey::*;

        let ts = env.ts;
        let m = &mut self.mangler;

        match key {
            TypeDescriptor(ty, _) => format!("__EEType_{}", m.type_name(ts, *ty)),
            MethodBody(method, false) => m.method_name(ts, *method),
            MethodBody(method, true) => {
                format!("unbox_{}", m.method_name(ts, *method))
            }
            ShadowConcreteMethod(method) => format!(
                "__ShadowConcreteMethod_{}",
                m.method_name(ts, *method)
            ),
            VirtualMethodUse(method) => {
                format!("__VirtualMethodUse_{}", m.method_name(ts, *method))
            }
            GvmDependencies(method) => format!(
                "__GVMDependenciesNode_{}",
                m.method_name(ts, *method)
            ),
            InterfaceDispatchMap(ty) => {
                format!("__InterfaceDispatchMap_{}", m.type_name(ts, *ty))
            }
            VtableSlice(ty) => format!("__VTableSlice_{}", m.type_name(ts, *ty)),
            TypeDictionary(ty) => {
                format!("__GenericDict_{}", m.type_name(ts, *ty))
            }
            MethodDictionary(method) => {
                format!("__GenericDict_{}", m.method_name(ts, *method))
            }
            Statics(ty, kind) => format!(
                "__{}StaticBase_{}",
                statics_prefix(*kind),
                m.type_name(ts, *ty)
            ),
            GcStaticDescriptor(map) => gc_static_descriptor_name(map),
            StaticsRegion(kind) => {
                format!("__{}StaticRegionStart", statics_prefix(*kind))
            }
            DispatchCell(method) => format!(
                "__InterfaceDispatchCell_{}",
                m.method_name(ts, *method)
            ),
            Indirection(target) => format!(
                "__imp_{}",
                self.interner.lookup(self.graph.node(*target).symbol())
            ),
            ExternSymbol(name) => name.clone(),
            ExternalReferences => "__external_references".into(),
            ReflectionInvokeMap => "__method_to_entrypoint_map".into(),
            InterfaceGvmTable => "__interface_gvm_table".into(),
        }
    }
}

fn statics_prefix(kind: StaticsKind) -> &'static str {
    match kind {
        StaticsKind::NonGc => "NonGC",
        StaticsKind::Gc => "GC",
        StaticsKind::Thread => "Thread",
    }
}

/// Name of a GC static descriptor,
///   encoding its map as hex bytes
///     (least significant bit first)
///   followed by the number of cells.
fn gc_static_descriptor_name(map: &[bool]) -> String {
    let hex = map
        .chunks(8)
        .map(|chunk| {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| acc | ((b as u8) << i));
            format!("{byte:02x}")
        })
        .collect::<String>();

    format!("__GCStaticEEType_{hex}_{}", map.len())
}

fn normalize(ts: &dyn TypeSystem, key: ArtifactKey) -> ArtifactKey {
    match key {
        ArtifactKey::MethodBody(m, unboxing) => {
            ArtifactKey::MethodBody(ts.canonical_method(m), unboxing)
        }
        ArtifactKey::VirtualMethodUse(m) => ArtifactKey::VirtualMethodUse(
            ts.canonical_method(ts.slot_defining_method(m)),
        ),
        other => other,
    }
}

fn validate(env: Env, key: &ArtifactKey) -> Result<(), Rejection> {
    use ArtifactKey::*;

    let ts = env.ts;

    match key {
        TypeDescriptor(ty, TypeFlavor::GenericDefinition) => {
            match ts.is_generic_definition(*ty) {
                true => Ok(()),
                false => Err((Entity::Type(*ty), TypeLoadReason::NotGenericDefinition)),
            }
        }

        TypeDescriptor(ty, _)
        | InterfaceDispatchMap(ty)
        | TypeDictionary(ty)
        | Statics(ty, _) => check_type(ts, *ty, false),

        // Slots used through shared code belong to the canonical form.
        VtableSlice(ty) => check_type(ts, *ty, true),

        MethodBody(m, unboxing) => {
            check_method(ts, *m, true)?;
            let desc = ts.method(*m);

            if desc.is_abstract {
                Err((Entity::Method(*m), TypeLoadReason::AbstractMethod))
            } else if *unboxing && (desc.is_static || !ts.is_value_type(desc.owner))
            {
                Err((Entity::Method(*m), TypeLoadReason::NotUnboxable))
            } else {
                Ok(())
            }
        }

        VirtualMethodUse(m) | GvmDependencies(m) => check_method(ts, *m, true),

        ShadowConcreteMethod(m) | MethodDictionary(m) => {
            check_method(ts, *m, false)
        }

        DispatchCell(m) => {
            check_method(ts, *m, false)?;

            match ts.is_interface(ts.method(*m).owner) {
                true => Ok(()),
                false => Err((Entity::Method(*m), TypeLoadReason::NotInterfaceMethod)),
            }
        }

        GcStaticDescriptor(_)
        | StaticsRegion(_)
        | Indirection(_)
        | ExternSymbol(_)
        | ExternalReferences
        | ReflectionInvokeMap
        | InterfaceGvmTable => Ok(()),
    }
}

/// Whether `ty` may be described at runtime.
///
/// Shared canonical forms are permitted only if `allow_canonical`,
///   which is the case for the owners of shared code.
fn check_type(
    ts: &dyn TypeSystem,
    ty: TypeId,
    allow_canonical: bool,
) -> Result<(), Rejection> {
    let reject = |reason| Err((Entity::Type(ty), reason));

    match ts.category(ty) {
        TypeCategory::ByRef => return reject(TypeLoadReason::ByRef),
        TypeCategory::FunctionPointer => {
            return reject(TypeLoadReason::FunctionPointer)
        }
        TypeCategory::GenericParameter(..) => {
            return reject(TypeLoadReason::GenericParameter)
        }
        _ => (),
    }

    if ts.is_generic_definition(ty) {
        return reject(TypeLoadReason::GenericDefinition);
    }

    if ts.is_runtime_determined(ty) {
        return reject(TypeLoadReason::RuntimeDetermined);
    }

    if !allow_canonical && ts.is_canonical_subtype(ty) {
        return reject(TypeLoadReason::CanonicalSubtype);
    }

    if ts.is_module_type(ty) {
        return reject(TypeLoadReason::ModuleType);
    }

    match ts.category(ty) {
        cat @ (TypeCategory::SzArray | TypeCategory::MdArray(_)) => {
            if let TypeCategory::MdArray(rank) = cat {
                if rank > global::MAX_ARRAY_RANK {
                    return reject(TypeLoadReason::ArrayRank(rank));
                }
            }

            let Some(elem) = ts.element_type(ty) else {
                return Ok(());
            };

            if matches!(
                ts.category(elem),
                TypeCategory::ByRef
                    | TypeCategory::Pointer
                    | TypeCategory::FunctionPointer
            ) {
                return reject(TypeLoadReason::InvalidArrayElement);
            }

            if ts.is_value_type(elem) {
                let size = ts.instance_byte_count(elem);
                if size > global::MAX_COMPONENT_SIZE {
                    return reject(TypeLoadReason::ComponentSize(size));
                }
            }

            check_type(ts, elem, allow_canonical)
        }

        TypeCategory::Pointer => match ts.element_type(ty) {
            Some(elem) => check_type(ts, elem, allow_canonical),
            None => Ok(()),
        },

        _ => Ok(()),
    }
}

fn check_method(
    ts: &dyn TypeSystem,
    m: MethodId,
    allow_canonical: bool,
) -> Result<(), Rejection> {
    check_type(ts, ts.method(m).owner, allow_canonical)?;

    let args = ts.method_instantiation(m);
    let reject = |reason| Err((Entity::Method(m), reason));

    if !args.is_empty() && ts.method_definition(m) == m {
        return reject(TypeLoadReason::GenericDefinition);
    }

    for arg in args {
        if ts.is_runtime_determined(arg) {
            return reject(TypeLoadReason::RuntimeDetermined);
        }

        if !allow_canonical && ts.is_canonical_subtype(arg) {
            return reject(TypeLoadReason::CanonicalSubtype);
        }
    }

    Ok(())
}

fn capabilities(env: Env, key: &ArtifactKey) -> Capabilities {
    use ArtifactKey::*;

    let ts = env.ts;
    let none = Capabilities::default();
    let emittable = Capabilities {
        emittable: true,
        ..none
    };

    match key {
        TypeDescriptor(_, TypeFlavor::Necessary) => emittable,
        TypeDescriptor(ty, TypeFlavor::Constructed) => Capabilities {
            emit_vtable: true,
            track_dispatch_map: !ts.is_interface(*ty)
                && !ts.runtime_interfaces(*ty).is_empty(),
            has_conditional: true,
            ..emittable
        },
        TypeDescriptor(_, TypeFlavor::GenericDefinition) => Capabilities {
            is_definition: true,
            ..emittable
        },

        MethodBody(..) => Capabilities {
            needs_code: true,
            ..emittable
        },
        ShadowConcreteMethod(_) => Capabilities {
            needs_code: true,
            ..none
        },

        GvmDependencies(m) => Capabilities {
            has_dynamic: !ts.is_shared_method(*m),
            ..none
        },
        TypeDictionary(_) => Capabilities {
            has_conditional: true,
            ..emittable
        },

        VirtualMethodUse(_) | VtableSlice(_) => none,
        ExternSymbol(_) => Capabilities {
            is_extern: true,
            ..none
        },

        InterfaceDispatchMap(_)
        | MethodDictionary(_)
        | Statics(..)
        | GcStaticDescriptor(_)
        | StaticsRegion(_)
        | DispatchCell(_)
        | Indirection(_)
        | ExternalReferences
        | ReflectionInvokeMap
        | InterfaceGvmTable => emittable,
    }
}
