// Dependency computation
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

//! What each kind of node depends upon.
//!
//! The marking engine knows nothing of types or methods;
//!   it asks a [`DependencySource`] for the dependencies of each node it
//!   marks.
//! [`DependencyContext`] is that source for a real compilation.
//! It computes dependencies from the node's [`ArtifactKey`] using one
//!   routine per kind of dependency,
//!     consulting the [`Capabilities`](crate::graph::Capabilities) that
//!     the factory assigned to the node where behavior differs between
//!     flavors of the same kind.
//!
//! Dependencies of method bodies are not known until their code has been
//!   generated,
//!     which also happens here:
//!       the [`Codegen`] collaborator is invoked for each method body
//!       awaiting code,
//!         and dictionary lookups performed by shared code are recorded
//!         into the [`DictionaryLayouts`] as they are requested.

use crate::{
    attr,
    codegen::{Codegen, CompileRequest},
    compilation::CompileError,
    emit::statics::statics_layout,
    generic::{
        instantiate_lookup, DictionaryLayouts, DictionaryOwner, GenericContext,
        RecordingAllocator,
    },
    graph::{
        factory::{Env, NodeFactory},
        ArtifactKey, ConditionalDependency, DependencyGraph, DependencySource,
        DynamicDependency, NodeId, Reason, StaticsKind, TypeFlavor,
    },
    ts::{
        cast::can_cast_to, AttributeTarget, MethodId, TypeId, TypeSystemExt,
    },
};

/// Runtime helper that every interface dispatch cell initially calls.
pub const INITIAL_DISPATCH_HELPER: &str = "RhpInitialDynamicInterfaceDispatch";

/// A type found to implement an interface generic virtual method.
///
/// These are discovered while marking and become entries of the
///   interface GVM table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GvmImplementation {
    /// Interface method being implemented.
    pub decl: MethodId,
    pub implementation: MethodId,

    /// Type on which the implementation was found.
    pub ty: TypeId,
}

type DepList = Vec<(NodeId, Reason)>;
type DepResult<T> = Result<T, CompileError>;

/// Key of the method body occupying a vtable slot of `ty` for `method`.
///
/// Value types receive an unboxing stub,
///   since their vtables are only ever reached through a boxed `this`.
pub fn vtable_entry(env: Env, ty: TypeId, method: MethodId) -> ArtifactKey {
    let ts = env.ts;
    let desc = ts.method(method);

    match ts.is_value_type(ty) && ts.is_value_type(desc.owner) && !desc.is_static {
        true => ArtifactKey::unboxing_stub(method),
        false => ArtifactKey::method_body(method),
    }
}

/// Vtable slots of `ty` in the order that they are laid out.
///
/// Slots introduced by base types come first.
/// A slot is present if the type introducing it receives a full vtable
///   or if the slot is known to be used.
pub fn vtable_layout(env: Env, factory: &NodeFactory, ty: TypeId) -> Vec<MethodId> {
    let ts = env.ts;
    let mut chain = ts.base_chain(ty).collect::<Vec<_>>();
    chain.reverse();

    chain
        .into_iter()
        .flat_map(|x| {
            let full = env.full_vtable(x);

            ts.virtual_slots(x).into_iter().filter(move |&slot| {
                full || factory
                    .is_marked(env, &ArtifactKey::VirtualMethodUse(slot))
            })
        })
        .collect()
}

/// [`DependencySource`] over a [`NodeFactory`].
pub struct DependencyContext<'a, 'b> {
    pub env: Env<'a>,
    pub factory: &'b mut NodeFactory,
    pub codegen: &'b mut dyn Codegen,
    pub layouts: &'b mut DictionaryLayouts,
    pub gvm_impls: &'b mut Vec<GvmImplementation>,
}

impl<'a, 'b> DependencyContext<'a, 'b> {
    fn node(&mut self, key: ArtifactKey) -> DepResult<NodeId> {
        Ok(self.factory.get_or_create(self.env, key)?)
    }

    fn push(
        &mut self,
        deps: &mut DepList,
        key: ArtifactKey,
        reason: Reason,
    ) -> DepResult<()> {
        let id = self.node(key)?;
        deps.push((id, reason));
        Ok(())
    }

    fn conditional(
        &mut self,
        conds: &mut Vec<ConditionalDependency>,
        target: ArtifactKey,
        condition: ArtifactKey,
        reason: Reason,
    ) -> DepResult<()> {
        conds.push(ConditionalDependency {
            target: self.node(target)?,
            condition: self.node(condition)?,
            reason,
        });
        Ok(())
    }

    fn necessary_type_deps(&mut self, ty: TypeId) -> DepResult<DepList> {
        let ts = self.env.ts;
        let mut deps = Vec::new();

        let related = match ts.element_type(ty) {
            Some(elem) => Some((elem, "element type")),
            None => ts.base_type(ty).map(|base| (base, "base type")),
        };

        if let Some((related, reason)) = related {
            self.push(&mut deps, ArtifactKey::necessary_type(related), reason)?;
        }

        for iface in ts.runtime_interfaces(ty) {
            self.push(
                &mut deps,
                ArtifactKey::necessary_type(iface),
                "interface map entry",
            )?;
        }

        self.nullable_dep(&mut deps, ty)?;

        Ok(deps)
    }

    fn nullable_dep(&mut self, deps: &mut DepList, ty: TypeId) -> DepResult<()> {
        let ts = self.env.ts;

        if !ts.is_nullable(ty) {
            return Ok(());
        }

        match ts.instantiation(ty).first() {
            Some(&arg) => self.push(
                deps,
                ArtifactKey::necessary_type(arg),
                "nullable type argument",
            ),
            None => Ok(()),
        }
    }

    fn constructed_type_deps(&mut self, id: NodeId, ty: TypeId) -> DepResult<DepList> {
        let env = self.env;
        let ts = env.ts;
        let mut deps = Vec::new();

        if let Some(base) = ts.base_type(ty) {
            self.push(&mut deps, ArtifactKey::constructed_type(base), "base type")?;
        }

        if let Some(elem) = ts.element_type(ty) {
            self.push(&mut deps, ArtifactKey::necessary_type(elem), "element type")?;
        }

        let ifaces = ts.runtime_interfaces(ty);
        for &iface in &ifaces {
            self.push(
                &mut deps,
                ArtifactKey::necessary_type(iface),
                "interface map entry",
            )?;
        }

        self.nullable_dep(&mut deps, ty)?;
        self.push(&mut deps, ArtifactKey::VtableSlice(ty), "vtable")?;

        for x in ts.base_chain(ty).collect::<Vec<_>>() {
            if env.full_vtable(x) {
                for slot in ts.virtual_slots(x) {
                    let Some(target) = ts.find_virtual_target(ty, slot) else {
                        continue;
                    };

                    if !ts.method(target).is_abstract {
                        self.push(
                            &mut deps,
                            vtable_entry(env, ty, target),
                            "full vtable slot",
                        )?;
                    }
                }
            }

            let args = ts.instantiation(x);
            if !args.is_empty()
                && !ts.is_generic_definition(x)
                && !ts.is_interface(x)
                && ts.canonical_form(x) != x
            {
                self.push(
                    &mut deps,
                    ArtifactKey::TypeDictionary(x),
                    "dictionary of shared base type",
                )?;
            }
        }

        // Which methods of a variant interface are reachable through a
        //   variant cast cannot be determined.
        for &iface in ifaces.iter().filter(|&&i| ts.has_variance(i)) {
            for slot in ts.virtual_slots(iface) {
                self.push(
                    &mut deps,
                    ArtifactKey::VirtualMethodUse(slot),
                    "variant interface slot",
                )?;
            }
        }

        if self.factory.graph().node(id).caps().track_dispatch_map {
            self.push(
                &mut deps,
                ArtifactKey::InterfaceDispatchMap(ty),
                "interface dispatch map",
            )?;
        }

        if let Some(fin) = ts.finalizer(ty) {
            self.push(&mut deps, ArtifactKey::method_body(fin), "finalizer")?;
        }

        if let Some((is_inst, get_impl)) = ts.icastable_methods(ty) {
            self.push(
                &mut deps,
                ArtifactKey::VirtualMethodUse(is_inst),
                "ICastable slot",
            )?;
            self.push(
                &mut deps,
                ArtifactKey::VirtualMethodUse(get_impl),
                "ICastable slot",
            )?;
        }

        self.attribute_deps(&mut deps, AttributeTarget::Type(ty));

        Ok(deps)
    }

    fn constructed_type_conditionals(
        &mut self,
        ty: TypeId,
    ) -> DepResult<Vec<ConditionalDependency>> {
        let env = self.env;
        let ts = env.ts;
        let mut conds = Vec::new();

        for x in ts.base_chain(ty).collect::<Vec<_>>() {
            if env.full_vtable(x) {
                continue;
            }

            for slot in ts.virtual_slots(x) {
                match ts.find_virtual_target(ty, slot) {
                    Some(target) if !ts.method(target).is_abstract => self.conditional(
                        &mut conds,
                        vtable_entry(env, ty, target),
                        ArtifactKey::VirtualMethodUse(slot),
                        "virtual slot is used",
                    )?,
                    _ => (),
                }
            }
        }

        if !env.full_vtable(ty) && !ts.is_interface(ty) {
            for iface in ts.runtime_interfaces(ty) {
                for slot in ts.virtual_slots(iface) {
                    let Some(target) = ts.resolve_interface_method(ty, slot) else {
                        continue;
                    };

                    if ts.method(target).is_abstract {
                        continue;
                    }

                    let used = ArtifactKey::VirtualMethodUse(slot);

                    self.conditional(
                        &mut conds,
                        vtable_entry(env, ty, target),
                        used.clone(),
                        "interface slot is used",
                    )?;
                    if ts.method(target).is_virtual {
                        self.conditional(
                            &mut conds,
                            ArtifactKey::VirtualMethodUse(
                                ts.slot_defining_method(target),
                            ),
                            used,
                            "implementation of used interface slot",
                        )?;
                    }
                }
            }
        }

        Ok(conds)
    }

    fn type_dictionary_conditionals(
        &mut self,
        ty: TypeId,
    ) -> DepResult<Vec<ConditionalDependency>> {
        let ts = self.env.ts;
        let mut conds = Vec::new();

        for cm in ts.methods(ts.canonical_form(ty)) {
            let desc = ts.method(cm);
            if desc.is_abstract || ts.is_generic_method(cm) {
                continue;
            }

            conds.push(ConditionalDependency {
                target: self.node(ArtifactKey::ShadowConcreteMethod(
                    ts.method_on_type(cm, ty),
                ))?,
                condition: self.node(ArtifactKey::method_body(cm))?,
                reason: "shared code requires exact dictionary",
            });
        }

        Ok(conds)
    }

    /// Whether `method` must be listed in the reflection invoke map.
    fn is_reflectable(&self, method: MethodId) -> bool {
        self.env.options.reflection_invoke_map && self.env.group.is_reflectable(method)
    }

    fn method_body_deps(
        &mut self,
        id: NodeId,
        method: MethodId,
        unboxing: bool,
    ) -> DepResult<Option<DepList>> {
        let env = self.env;
        let ts = env.ts;

        let Some(code) = self.factory.graph().node(id).code() else {
            return Ok(None);
        };

        let required = code.required_artifacts().cloned().collect::<Vec<_>>();
        let mut deps = Vec::new();

        for key in required {
            self.push(&mut deps, key, "referenced by code")?;
        }

        if unboxing {
            self.push(&mut deps, ArtifactKey::method_body(method), "unboxed target")?;
        }

        if self.is_reflectable(method) && !ts.is_shared_method(method) {
            let desc = ts.method(method);

            self.push(
                &mut deps,
                ArtifactKey::ReflectionInvokeMap,
                "reflectable method",
            )?;
            self.push(
                &mut deps,
                ArtifactKey::necessary_type(desc.owner),
                "owner of reflectable method",
            )?;

            for arg in ts.method_instantiation(method) {
                self.push(
                    &mut deps,
                    ArtifactKey::necessary_type(arg),
                    "instantiation of reflectable method",
                )?;
            }

            if ts.is_value_type(desc.owner) && !desc.is_static && !unboxing {
                self.push(
                    &mut deps,
                    ArtifactKey::unboxing_stub(method),
                    "reflection invokes through a boxed instance",
                )?;
            }
        }

        self.attribute_deps(&mut deps, AttributeTarget::Method(method));

        Ok(Some(deps))
    }

    fn shadow_deps(&mut self, method: MethodId) -> DepResult<Option<DepList>> {
        let env = self.env;
        let ts = env.ts;
        let canonical = ts.canonical_method(method);
        let body = self.node(ArtifactKey::method_body(canonical))?;

        let Some(code) = self.factory.graph().node(body).code() else {
            return Ok(None);
        };

        let lookups = code.lookups.clone();
        let ctx = GenericContext::for_method(ts, method);
        let mut deps = vec![(body, "shared code")];

        for (lookup, _) in lookups {
            let target = instantiate_lookup(ts, &lookup, &ctx)?;

            if let Some(node) = target.materialize(env, self.factory)? {
                deps.push((node, "dictionary lookup"));
            }
        }

        match DictionaryOwner::for_method(ts, canonical) {
            Some(DictionaryOwner::Method(_)) => self.push(
                &mut deps,
                ArtifactKey::MethodDictionary(method),
                "exact method dictionary",
            )?,
            Some(DictionaryOwner::Type(_)) => self.push(
                &mut deps,
                ArtifactKey::TypeDictionary(ts.method(method).owner),
                "exact type dictionary",
            )?,
            None => (),
        }

        Ok(Some(deps))
    }

    fn method_dictionary_deps(&mut self, method: MethodId) -> DepResult<DepList> {
        let ts = self.env.ts;
        let mut deps = Vec::new();

        self.push(
            &mut deps,
            ArtifactKey::ShadowConcreteMethod(method),
            "dictionary contents",
        )?;

        if self.is_reflectable(ts.canonical_method(method)) {
            self.push(
                &mut deps,
                ArtifactKey::ReflectionInvokeMap,
                "reflectable shared method",
            )?;
            self.push(
                &mut deps,
                ArtifactKey::necessary_type(ts.method(method).owner),
                "owner of reflectable method",
            )?;
        }

        Ok(deps)
    }

    fn gvm_deps(&mut self, method: MethodId) -> DepResult<DepList> {
        let ts = self.env.ts;
        let mut deps = Vec::new();

        if !ts.method(method).is_abstract {
            self.push(
                &mut deps,
                ArtifactKey::method_body(method),
                "generic virtual method instantiation",
            )?;

            if ts.canonical_method(method) != method {
                self.push(
                    &mut deps,
                    ArtifactKey::MethodDictionary(method),
                    "generic virtual method instantiation",
                )?;
            }
        }

        Ok(deps)
    }

    fn statics_deps(&mut self, ty: TypeId, kind: StaticsKind) -> DepResult<DepList> {
        let env = self.env;
        let ts = env.ts;
        let mut deps = Vec::new();

        if let Some(cctor) = ts.static_constructor(ty) {
            self.push(
                &mut deps,
                ArtifactKey::method_body(cctor),
                "class constructor",
            )?;
        }

        if kind != StaticsKind::NonGc {
            let layout = statics_layout(ts, env.pointer_size(), ty, kind);

            self.push(
                &mut deps,
                ArtifactKey::GcStaticDescriptor(layout.gc_map),
                "GC statics layout",
            )?;
            self.push(
                &mut deps,
                ArtifactKey::StaticsRegion(kind),
                "statics region",
            )?;
        }

        Ok(deps)
    }

    fn dispatch_cell_deps(&mut self, method: MethodId) -> DepResult<DepList> {
        let ts = self.env.ts;
        let mut deps = Vec::new();

        self.push(
            &mut deps,
            ArtifactKey::extern_symbol(INITIAL_DISPATCH_HELPER),
            "initial dispatch",
        )?;
        self.push(
            &mut deps,
            ArtifactKey::necessary_type(ts.method(method).owner),
            "dispatch cell interface",
        )?;
        self.push(
            &mut deps,
            ArtifactKey::VirtualMethodUse(method),
            "interface call",
        )?;

        Ok(deps)
    }

    /// Dependencies contributed by custom attributes,
    ///   if attribute scanning is enabled.
    fn attribute_deps(&mut self, deps: &mut DepList, target: AttributeTarget) {
        if self.env.options.scan_custom_attributes {
            deps.extend(attr::attribute_dependencies(self.env, self.factory, target));
        }
    }

    /// Scan newly constructed types for implementations of a generic
    ///   virtual method.
    fn scan_gvm(
        &mut self,
        method: MethodId,
        marked: &[NodeId],
    ) -> DepResult<Vec<DynamicDependency>> {
        let env = self.env;
        let ts = env.ts;
        let owner = ts.method(method).owner;
        let mut deps = Vec::new();

        let types = marked
            .iter()
            .filter_map(|&id| match self.factory.graph().key(id) {
                ArtifactKey::TypeDescriptor(ty, TypeFlavor::Constructed) => {
                    Some(*ty)
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        for ty in types {
            if ts.is_interface(owner) {
                if ts.is_interface(ty) {
                    continue;
                }

                let ifaces = ts.runtime_interfaces(ty);

                if ifaces.contains(&owner) {
                    if let Some(target) = ts.resolve_interface_method(ty, method) {
                        if !ts.method(target).is_abstract {
                            self.record_gvm(method, target, ty);

                            for (key, reason) in [
                                (ArtifactKey::InterfaceGvmTable, "interface GVM table"),
                                (ArtifactKey::necessary_type(owner), "GVM interface"),
                                (ArtifactKey::necessary_type(ty), "GVM implementing type"),
                                (ArtifactKey::GvmDependencies(target), "GVM implementation"),
                            ] {
                                deps.push(DynamicDependency::new(self.node(key)?, reason));
                            }
                        }
                    }
                }

                let def = ts.type_definition(owner);
                for iface in ifaces {
                    if iface != owner
                        && ts.type_definition(iface) == def
                        && can_cast_to(ts, env.pointer_size(), iface, owner)
                    {
                        let variant = ts.method_on_type(method, iface);
                        deps.push(DynamicDependency::new(
                            self.node(ArtifactKey::GvmDependencies(variant))?,
                            "variant GVM interface",
                        ));
                    }
                }
            } else if ts.base_chain(ty).any(|x| x == owner) {
                match ts.find_virtual_target(ty, method) {
                    Some(target) if target != method => {
                        deps.push(DynamicDependency::new(
                            self.node(ArtifactKey::GvmDependencies(target))?,
                            "GVM override",
                        ))
                    }
                    _ => (),
                }
            }
        }

        Ok(deps)
    }

    fn record_gvm(&mut self, decl: MethodId, implementation: MethodId, ty: TypeId) {
        let record = GvmImplementation {
            decl,
            implementation,
            ty,
        };

        if !self.gvm_impls.contains(&record) {
            self.gvm_impls.push(record);
        }
    }
}

impl<'a, 'b> DependencySource for DependencyContext<'a, 'b> {
    type Error = CompileError;

    fn graph(&self) -> &DependencyGraph {
        self.factory.graph()
    }

    fn graph_mut(&mut self) -> &mut DependencyGraph {
        self.factory.graph_mut()
    }

    fn static_dependencies(
        &mut self,
        node: NodeId,
    ) -> DepResult<Option<DepList>> {
        use ArtifactKey::*;

        let key = self.factory.graph().key(node).clone();

        let deps = match key {
            TypeDescriptor(ty, TypeFlavor::Necessary) => {
                self.necessary_type_deps(ty)?
            }
            TypeDescriptor(ty, TypeFlavor::Constructed) => {
                self.constructed_type_deps(node, ty)?
            }
            TypeDescriptor(_, TypeFlavor::GenericDefinition) => Vec::new(),

            MethodBody(m, unboxing) => {
                return self.method_body_deps(node, m, unboxing)
            }
            ShadowConcreteMethod(m) => return self.shadow_deps(m),

            VirtualMethodUse(m) => {
                let owner = self.env.ts.method(m).owner;
                vec![(self.node(VtableSlice(owner))?, "slot owner")]
            }
            GvmDependencies(m) => self.gvm_deps(m)?,
            TypeDictionary(_) => Vec::new(),
            MethodDictionary(m) => self.method_dictionary_deps(m)?,
            Statics(ty, kind) => self.statics_deps(ty, kind)?,
            DispatchCell(m) => self.dispatch_cell_deps(m)?,
            Indirection(target) => vec![(target, "indirection target")],

            ReflectionInvokeMap | InterfaceGvmTable => {
                vec![(self.node(ExternalReferences)?, "table references")]
            }

            // Type descriptors find their map by its index in the table.
            InterfaceDispatchMap(_) => {
                vec![(self.node(ExternalReferences)?, "dispatch map index")]
            }

            VtableSlice(_)
            | GcStaticDescriptor(_)
            | StaticsRegion(_)
            | ExternSymbol(_)
            | ExternalReferences => Vec::new(),
        };

        Ok(Some(deps))
    }

    fn conditional_dependencies(
        &mut self,
        node: NodeId,
    ) -> DepResult<Vec<ConditionalDependency>> {
        match self.factory.graph().key(node).clone() {
            ArtifactKey::TypeDescriptor(ty, TypeFlavor::Constructed) => {
                self.constructed_type_conditionals(ty)
            }
            ArtifactKey::TypeDictionary(ty) => {
                self.type_dictionary_conditionals(ty)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn search_dynamic_dependencies(
        &mut self,
        node: NodeId,
        marked: &[NodeId],
    ) -> DepResult<Vec<DynamicDependency>> {
        match self.factory.graph().key(node).clone() {
            ArtifactKey::GvmDependencies(m) => self.scan_gvm(m, marked),
            _ => Ok(Vec::new()),
        }
    }

    fn generate_code(&mut self, pending: &[NodeId]) -> DepResult<usize> {
        let env = self.env;
        let ts = env.ts;
        let mut count = 0;

        for &id in pending {
            let (target, method, unboxing) = match *self.factory.graph().key(id) {
                ArtifactKey::MethodBody(m, unboxing) => (id, m, unboxing),
                ArtifactKey::ShadowConcreteMethod(m) => {
                    let canonical = ts.canonical_method(m);
                    (self.node(ArtifactKey::method_body(canonical))?, canonical, false)
                }
                _ => continue,
            };

            if self.factory.graph().node(target).code().is_some() {
                continue;
            }

            let dictionary = DictionaryOwner::for_method(ts, method);
            let mut slots = RecordingAllocator::new(self.layouts);
            let result = self.codegen.compile(
                ts,
                CompileRequest::new(method, unboxing, dictionary, &mut slots),
            );
            let lookups = slots.into_used();

            let mut compiled = result?;
            compiled.check_relocs(method, env.pointer_size())?;
            compiled.lookups = lookups;

            self.factory.graph_mut().set_code(target, compiled);
            count += 1;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod test;
