// Generic dictionaries and lookups
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

//! Generic dictionary lookups and dictionary layouts.
//!
//! Code shared between instantiations of a generic type or method is
//!   compiled once,
//!     against the _canonical form_ of its owner.
//! Anything the shared code needs to know about the exact instantiation it
//!   is running for
//!     (e.g. the descriptor of `T` in `new List<T>()`)
//!   is obtained at runtime by loading a slot from a _generic
//!   dictionary_.
//!
//! A [`GenericLookup`] describes what a slot holds in terms of the generic
//!   parameters of its context.
//! The layout of each dictionary is shared by every instantiation of the
//!   same canonical owner and is recorded by [`DictionaryLayouts`] as code
//!   is generated;
//!     requesting the same lookup twice yields the same slot.
//! Once marking has completed,
//!   layouts are closed and each exact dictionary is emitted by
//!   substituting the exact instantiation into every lookup of its
//!   layout
//!     (see [`instantiate_lookup`]).
//!
//! A lookup of `Foo<Foo<T>>` from within `Foo<T>` nests its context in an
//!   ever-larger instantiation.
//! The first nesting is materialized like any other lookup;
//!   lookups from a context that is already nested resolve against the
//!   canonical form of that context,
//!     which bounds a recursive generic to a finite number of
//!     artifacts.

use crate::{
    codegen::SlotAllocator,
    diagnose::{Annotate, AnnotatedEntity, Diagnostic, Entity},
    diagnostic_panic,
    global::DictSlotSize,
    graph::{
        factory::{Env, FactoryResult, NodeFactory, TypeLoadError},
        ArtifactKey, NodeId, StaticsKind,
    },
    ts::{MethodId, TypeId, TypeSystem, TypeSystemExt},
};
use fxhash::FxHashMap;
use std::{
    error::Error,
    fmt::{self, Display},
};
use tracing::debug;

/// What a dictionary slot holds,
///   expressed in terms of the generic parameters of its context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GenericLookup {
    /// Descriptor of a type.
    TypeHandle(TypeId),
    NonGcStaticBase(TypeId),
    GcStaticBase(TypeId),
    ThreadStaticBase(TypeId),

    /// Entry point of a method.
    MethodEntry(MethodId),

    /// Dictionary of an exact generic method instantiation.
    MethodDictionary(MethodId),

    /// Interface dispatch cell for a call to an interface method.
    VirtualDispatchCell(MethodId),

    /// Byte offset of the named instance field of a type.
    FieldOffset(TypeId, String),

    /// Entry point of the default constructor of a type,
    ///   or null if it has none.
    DefaultConstructor(TypeId),

    /// Descriptor used to allocate instances of a type.
    AllocObject(TypeId),
}

impl GenericLookup {
    /// Replace generic parameters within the lookup using `ctx`.
    pub fn substitute(&self, ts: &dyn TypeSystem, ctx: &GenericContext) -> Self {
        use GenericLookup::*;

        let ty = |t: &TypeId| ctx.substitute_type(ts, *t);
        let m = |m: &MethodId| ctx.substitute_method(ts, *m);

        match self {
            TypeHandle(t) => TypeHandle(ty(t)),
            NonGcStaticBase(t) => NonGcStaticBase(ty(t)),
            GcStaticBase(t) => GcStaticBase(ty(t)),
            ThreadStaticBase(t) => ThreadStaticBase(ty(t)),
            MethodEntry(x) => MethodEntry(m(x)),
            MethodDictionary(x) => MethodDictionary(m(x)),
            VirtualDispatchCell(x) => VirtualDispatchCell(m(x)),
            FieldOffset(t, name) => FieldOffset(ty(t), name.clone()),
            DefaultConstructor(t) => DefaultConstructor(ty(t)),
            AllocObject(t) => AllocObject(ty(t)),
        }
    }

    /// The type that the lookup is about,
    ///   or the owner of the method that it is about.
    pub fn subject_type(&self, ts: &dyn TypeSystem) -> TypeId {
        use GenericLookup::*;

        match self {
            TypeHandle(t)
            | NonGcStaticBase(t)
            | GcStaticBase(t)
            | ThreadStaticBase(t)
            | FieldOffset(t, _)
            | DefaultConstructor(t)
            | AllocObject(t) => *t,
            MethodEntry(m) | MethodDictionary(m) | VirtualDispatchCell(m) => {
                ts.method(*m).owner
            }
        }
    }

    /// Determine what an already-substituted lookup refers to.
    pub fn resolve(&self, ts: &dyn TypeSystem) -> Result<SlotTarget, LookupError> {
        use GenericLookup::*;
        use ReferenceKind::*;

        let subject = self.subject_type(ts);
        if ts.is_runtime_determined(subject) {
            return Err(LookupError::Unsubstituted(self.clone()));
        }

        let node = |key, kind| Ok(SlotTarget::Node(key, kind));
        let statics = |t, kind| node(ArtifactKey::Statics(t, kind), Indirect);

        match self {
            TypeHandle(t) => {
                node(ArtifactKey::necessary_type(*t), ConditionalIndirect)
            }
            AllocObject(t) => {
                node(ArtifactKey::constructed_type(*t), ConditionalIndirect)
            }
            NonGcStaticBase(t) => statics(*t, StaticsKind::NonGc),
            GcStaticBase(t) => statics(*t, StaticsKind::Gc),
            ThreadStaticBase(t) => statics(*t, StaticsKind::Thread),
            MethodEntry(m) => node(ArtifactKey::method_body(*m), Direct),
            MethodDictionary(m) => node(ArtifactKey::MethodDictionary(*m), Direct),

            VirtualDispatchCell(m) => match ts.is_interface(subject) {
                true => node(ArtifactKey::DispatchCell(*m), Direct),
                false => Err(LookupError::NotInterfaceMethod(*m)),
            },

            FieldOffset(t, name) => {
                if ts.is_canonical_subtype(*t) {
                    return Err(LookupError::CanonicalFieldOffset(*t));
                }

                ts.fields(*t)
                    .into_iter()
                    .map(|f| ts.field(f))
                    .find(|f| !f.is_static && &f.name == name)
                    .map(|f| SlotTarget::Value(f.offset as u64))
                    .ok_or_else(|| LookupError::NoSuchField(*t, name.clone()))
            }

            DefaultConstructor(t) => Ok(match ts.default_constructor(*t) {
                Some(ctor) => {
                    SlotTarget::Node(ArtifactKey::method_body(ctor), Direct)
                }
                None => SlotTarget::Null,
            }),
        }
    }
}

impl Display for GenericLookup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use GenericLookup::*;

        match self {
            TypeHandle(t) => write!(f, "type handle of {t}"),
            NonGcStaticBase(t) => write!(f, "non-GC static base of {t}"),
            GcStaticBase(t) => write!(f, "GC static base of {t}"),
            ThreadStaticBase(t) => write!(f, "thread static base of {t}"),
            MethodEntry(m) => write!(f, "entry point of {m}"),
            MethodDictionary(m) => write!(f, "dictionary of {m}"),
            VirtualDispatchCell(m) => write!(f, "dispatch cell for {m}"),
            FieldOffset(t, name) => write!(f, "offset of field `{name}` of {t}"),
            DefaultConstructor(t) => write!(f, "default constructor of {t}"),
            AllocObject(t) => write!(f, "allocator of {t}"),
        }
    }
}

/// How a slot refers to its target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// The slot holds the address of the target.
    Direct,

    /// The slot holds the address of a cell holding the address of the
    ///   target.
    Indirect,

    /// Direct unless the compilation group requires references to the
    ///   target type to go through an indirection cell.
    ConditionalIndirect,
}

/// The resolved content of a dictionary slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotTarget {
    Node(ArtifactKey, ReferenceKind),
    Value(u64),
    Null,
}

impl SlotTarget {
    /// Whether a reference of `kind` to `key` goes through an indirection
    ///   cell.
    fn indirect(env: Env, key: &ArtifactKey, kind: ReferenceKind) -> bool {
        match kind {
            ReferenceKind::Direct => false,
            ReferenceKind::Indirect => true,
            ReferenceKind::ConditionalIndirect => key
                .type_id()
                .map_or(false, |ty| env.group.requires_indirection(ty)),
        }
    }

    /// The node that the slot must point at,
    ///   creating it if necessary.
    ///
    /// Slots that are not pointers yield [`None`].
    pub fn materialize(
        &self,
        env: Env,
        factory: &mut NodeFactory,
    ) -> FactoryResult<Option<NodeId>> {
        let SlotTarget::Node(key, kind) = self else {
            return Ok(None);
        };

        let target = factory.get_or_create(env, key.clone())?;

        match Self::indirect(env, key, *kind) {
            true => factory.indirection(env, target).map(Some),
            false => Ok(Some(target)),
        }
    }

    /// Like [`Self::materialize`],
    ///   but only if every node involved already exists.
    pub fn existing(&self, env: Env, factory: &NodeFactory) -> Option<NodeId> {
        let SlotTarget::Node(key, kind) = self else {
            return None;
        };

        let target = factory.existing(env, key)?;

        match Self::indirect(env, key, *kind) {
            true => factory.existing(env, &ArtifactKey::Indirection(target)),
            false => Some(target),
        }
    }
}

/// Generic arguments available to lookups performed within an exact
///   type or method instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericContext {
    /// The exact type whose instantiation is providing the type
    ///   arguments.
    anchor: TypeId,
    type_args: Vec<TypeId>,
    method_args: Vec<TypeId>,
}

impl GenericContext {
    pub fn for_type(ts: &dyn TypeSystem, ty: TypeId) -> Self {
        Self {
            anchor: ty,
            type_args: ts.instantiation(ty),
            method_args: Vec::new(),
        }
    }

    pub fn for_method(ts: &dyn TypeSystem, method: MethodId) -> Self {
        let owner = ts.method(method).owner;

        Self {
            anchor: owner,
            type_args: ts.instantiation(owner),
            method_args: ts.method_instantiation(method),
        }
    }

    pub fn substitute_type(&self, ts: &dyn TypeSystem, ty: TypeId) -> TypeId {
        ts.substitute(ty, &self.type_args, &self.method_args)
    }

    pub fn substitute_method(
        &self,
        ts: &dyn TypeSystem,
        method: MethodId,
    ) -> MethodId {
        let owner = self.substitute_type(ts, ts.method(method).owner);
        let on = ts.method_on_type(ts.method_definition(method), owner);

        match ts.is_generic_method(method) {
            true => {
                let args = ts
                    .method_instantiation(method)
                    .into_iter()
                    .map(|a| self.substitute_type(ts, a))
                    .collect::<Vec<_>>();

                ts.instantiate_method(on, &args)
            }
            false => on,
        }
    }

    /// Whether `ty` is a strictly larger instantiation of the anchor's
    ///   own definition that contains the anchor.
    fn is_recursive(&self, ts: &dyn TypeSystem, ty: TypeId) -> bool {
        ty != self.anchor
            && !self.type_args.is_empty()
            && ts.type_definition(ty) == ts.type_definition(self.anchor)
            && ts.contains_type(ty, self.anchor)
    }

    /// Whether the anchor's arguments themselves instantiate the anchor's
    ///   definition
    ///     (e.g. `Foo<Foo<Bar>>`).
    fn is_self_nested(&self, ts: &dyn TypeSystem) -> bool {
        let def = ts.type_definition(self.anchor);

        self.type_args.iter().any(|&arg| nests(ts, arg, def))
    }

    /// The same context over the canonical form of the anchor.
    fn canonical(&self, ts: &dyn TypeSystem) -> Self {
        let anchor = ts.canonical_form(self.anchor);

        Self {
            anchor,
            type_args: ts.instantiation(anchor),
            method_args: self.method_args.clone(),
        }
    }
}

/// Whether `ty` is or contains an instantiation of `def`.
fn nests(ts: &dyn TypeSystem, ty: TypeId, def: TypeId) -> bool {
    let here = !ts.instantiation(ty).is_empty() && ts.type_definition(ty) == def;

    here || ts
        .instantiation(ty)
        .into_iter()
        .chain(ts.element_type(ty))
        .any(|sub| nests(ts, sub, def))
}

/// Substitute the exact instantiation of `ctx` into `lookup` and determine
///   what the resulting slot holds.
///
/// A lookup that nests the context within a larger instantiation of its
///   own definition is materialized exactly,
///     but only once:
///   if the context is itself such a nesting,
///     the slot is resolved against the canonical form of the context
///     instead.
/// Only shared code exists for canonical forms,
///   so the slot then holds a canonical method body or is null.
pub fn instantiate_lookup(
    ts: &dyn TypeSystem,
    lookup: &GenericLookup,
    ctx: &GenericContext,
) -> Result<SlotTarget, LookupError> {
    let exact = lookup.substitute(ts, ctx);
    let target = exact.resolve(ts)?;

    if !(ctx.is_recursive(ts, exact.subject_type(ts)) && ctx.is_self_nested(ts)) {
        return Ok(target);
    }

    let shared = lookup.substitute(ts, &ctx.canonical(ts));
    debug!(lookup = %exact, shared = %shared, "recursive lookup canonicalized");

    Ok(match shared.resolve(ts) {
        Ok(target @ SlotTarget::Node(ArtifactKey::MethodBody(..), _)) => target,
        _ => SlotTarget::Null,
    })
}

/// Owner of a dictionary layout.
///
/// Layouts are keyed by canonical forms,
///   since all exact instantiations sharing code share a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictionaryOwner {
    Type(TypeId),
    Method(MethodId),
}

impl DictionaryOwner {
    /// Dictionary through which shared code for `method` performs its
    ///   lookups,
    ///     or [`None`] if its code is not shared.
    ///
    /// Shared generic methods carry their own dictionary;
    ///   other shared methods use the dictionary of their owning type.
    pub fn for_method(ts: &dyn TypeSystem, method: MethodId) -> Option<Self> {
        if !ts.is_shared_method(method) {
            return None;
        }

        match ts.is_generic_method(method) {
            true => Some(Self::Method(method)),
            false => Some(Self::Type(ts.method(method).owner)),
        }
    }

    /// Layout owner of the exact dictionary for `key`,
    ///   if `key` is a dictionary.
    pub fn of_dictionary(ts: &dyn TypeSystem, key: &ArtifactKey) -> Option<Self> {
        match key {
            ArtifactKey::TypeDictionary(ty) => {
                Some(Self::Type(ts.canonical_form(*ty)))
            }
            ArtifactKey::MethodDictionary(m) => {
                Some(Self::Method(ts.canonical_method(*m)))
            }
            _ => None,
        }
    }
}

impl Display for DictionaryOwner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Type(ty) => write!(f, "dictionary of {ty}"),
            Self::Method(m) => write!(f, "dictionary of {m}"),
        }
    }
}

impl From<DictionaryOwner> for Entity {
    fn from(owner: DictionaryOwner) -> Self {
        match owner {
            DictionaryOwner::Type(ty) => Entity::Type(ty),
            DictionaryOwner::Method(m) => Entity::Method(m),
        }
    }
}

/// Slots of a single dictionary layout in allocation order.
#[derive(Debug, Default)]
struct Layout {
    slots: Vec<GenericLookup>,
    index: FxHashMap<GenericLookup, DictSlotSize>,
}

/// Layouts of every dictionary,
///   by owner.
///
/// Layouts only grow while open.
/// Once closed,
///   any attempt to allocate a slot is an internal error,
///     since code compiled afterward would refer to a slot that emitted
///     dictionaries do not contain.
#[derive(Debug, Default)]
pub struct DictionaryLayouts {
    layouts: FxHashMap<DictionaryOwner, Layout>,
    closed: bool,
}

impl DictionaryLayouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot holding `lookup` in the layout of `owner`,
    ///   allocating it if necessary.
    ///
    /// Panics
    /// ======
    /// If the layouts have been [closed](Self::close) and the slot does
    ///   not already exist.
    pub fn slot_for(
        &mut self,
        owner: DictionaryOwner,
        lookup: GenericLookup,
    ) -> DictSlotSize {
        if let Some(&slot) = self
            .layouts
            .get(&owner)
            .and_then(|layout| layout.index.get(&lookup))
        {
            return slot;
        }

        if self.closed {
            diagnostic_panic!(
                vec![
                    owner.internal_error("dictionary layout is already closed"),
                    owner.help(format!("while requesting a slot for {lookup}")),
                ],
                "slot requested from closed {owner}",
            );
        }

        let layout = self.layouts.entry(owner).or_default();
        let slot = layout.slots.len() as DictSlotSize;

        debug!(%owner, slot, %lookup, "dictionary layout grew");

        layout.index.insert(lookup.clone(), slot);
        layout.slots.push(lookup);
        slot
    }

    /// Prevent any further growth.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Slots of the layout of `owner` in slot order.
    pub fn layout(&self, owner: DictionaryOwner) -> &[GenericLookup] {
        self.layouts
            .get(&owner)
            .map(|layout| layout.slots.as_slice())
            .unwrap_or(&[])
    }
}

/// A [`SlotAllocator`] that also records every lookup it was asked for.
///
/// The recorded lookups become the dictionary dependencies of the
///   compiled method.
pub struct RecordingAllocator<'a> {
    layouts: &'a mut DictionaryLayouts,
    used: Vec<(GenericLookup, DictSlotSize)>,
}

impl<'a> RecordingAllocator<'a> {
    pub fn new(layouts: &'a mut DictionaryLayouts) -> Self {
        Self {
            layouts,
            used: Vec::new(),
        }
    }

    /// Lookups requested so far,
    ///   without duplicates,
    ///   in order of first request.
    pub fn into_used(self) -> Vec<(GenericLookup, DictSlotSize)> {
        self.used
    }
}

impl<'a> SlotAllocator for RecordingAllocator<'a> {
    fn slot_for(
        &mut self,
        owner: DictionaryOwner,
        lookup: GenericLookup,
    ) -> DictSlotSize {
        let slot = self.layouts.slot_for(owner, lookup.clone());

        if !self.used.iter().any(|(seen, _)| seen == &lookup) {
            self.used.push((lookup, slot));
        }

        slot
    }
}

/// Hash of an exact method instantiation,
///   used to prefix method dictionaries.
pub fn method_hash_code(ts: &dyn TypeSystem, method: MethodId) -> u32 {
    let desc = ts.method(method);
    let base = combine_hash(
        ts.hash_code(desc.owner),
        fxhash::hash32(desc.name.as_bytes()),
    );

    ts.method_instantiation(method)
        .into_iter()
        .fold(base, |h, arg| combine_hash(h, ts.hash_code(arg)))
}

fn combine_hash(h1: u32, h2: u32) -> u32 {
    (h1.rotate_left(5).wrapping_add(h1)) ^ h2
}

/// A dictionary lookup could not be resolved for an exact instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Dispatch cells may only be requested for interface methods.
    NotInterfaceMethod(MethodId),

    /// The lookup names an instance field that does not exist.
    NoSuchField(TypeId, String),

    /// Field offsets of canonical forms vary by instantiation and cannot
    ///   be looked up.
    CanonicalFieldOffset(TypeId),

    /// Generic parameters remain after substitution.
    Unsubstituted(GenericLookup),

    /// The target of the lookup cannot be loaded.
    TypeLoad(TypeLoadError),
}

impl Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotInterfaceMethod(m) => {
                write!(f, "dispatch cell requested for non-interface method {m}")
            }
            Self::NoSuchField(ty, name) => {
                write!(f, "{ty} has no instance field `{name}`")
            }
            Self::CanonicalFieldOffset(ty) => {
                write!(f, "field offsets of shared form {ty} are not fixed")
            }
            Self::Unsubstituted(lookup) => {
                write!(f, "{lookup} still contains generic parameters")
            }
            Self::TypeLoad(e) => Display::fmt(e, f),
        }
    }
}

impl Error for LookupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TypeLoad(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TypeLoadError> for LookupError {
    fn from(e: TypeLoadError) -> Self {
        Self::TypeLoad(e)
    }
}

impl Diagnostic for LookupError {
    fn describe(&self) -> Vec<AnnotatedEntity> {
        match self {
            Self::NotInterfaceMethod(m) => {
                vec![m.error("dispatch cells require an interface method")]
            }
            Self::NoSuchField(ty, name) => {
                vec![ty.error(format!("no instance field named `{name}`"))]
            }
            Self::CanonicalFieldOffset(ty) => vec![
                ty.error("field offset requested for shared canonical form"),
                ty.help("universal shared code is not supported"),
            ],
            Self::Unsubstituted(_) => {
                vec![Entity::Unknown.error(self.to_string())]
            }
            Self::TypeLoad(e) => e.describe(),
        }
    }
}
