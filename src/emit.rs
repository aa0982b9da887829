// Object data emission
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


//! Serialization of marked nodes into [`ObjectData`].
//!
//! Once marking has reached its fixed point,
//!   every marked emittable node is turned into a block of bytes with
//!   relocations against the symbols of other marked nodes.
//! Each kind of node has its own routine in a submodule;
//!   [`EmitContext::emit_node`] selects among them.
//!
//! Emission happens in one of two [`EmitMode`]s.
//! A _relocs-only_ pass produces every relocation a node would have
//!   without allocating anything that must be consistent across the
//!   whole object
//!     (most notably indices into the external reference table),
//!   and is used to verify that every relocation target is marked before
//!   anything is written.
//! The _final_ pass produces the actual contents.
//!
//! Relocations may only target marked nodes.
//! Requesting the symbol of a node that is not marked is an internal
//!   error:
//!     it means that a dependency was not reported to the graph.

pub mod dictionary;
pub mod dispatch;
pub mod eetype;
pub mod gcdesc;
pub mod method;
pub mod optional;
pub mod statics;

use crate::{
    deps::GvmImplementation,
    diagnose::Annotate,
    diagnostic_panic,
    generic::DictionaryLayouts,
    graph::{ArtifactKey, Env, NodeFactory, NodeId, TypeFlavor},
    native::tables,
    obj::{ObjectData, ObjectDataBuilder, Section},
    session::PointerSize,
    sym::SymbolId,
    ts::TypeSystem,
};
use fxhash::FxHashMap;

/// See the [module-level documentation](self).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    RelocsOnly,
    Final,
}

/// Everything that emission of a node may consult.
pub struct EmitContext<'a, 'b> {
    pub env: Env<'a>,
    pub factory: &'b NodeFactory,
    pub layouts: &'b DictionaryLayouts,
    pub gvm_impls: &'b [GvmImplementation],
    pub mode: EmitMode,

    /// Index of each symbol in the external reference table.
    ext_index: FxHashMap<SymbolId, u32>,
    ext_refs: Vec<SymbolId>,
}

impl<'a, 'b> EmitContext<'a, 'b> {
    pub fn new(
        env: Env<'a>,
        factory: &'b NodeFactory,
        layouts: &'b DictionaryLayouts,
        gvm_impls: &'b [GvmImplementation],
        mode: EmitMode,
    ) -> Self {
        Self {
            env,
            factory,
            layouts,
            gvm_impls,
            mode,
            ext_index: FxHashMap::default(),
            ext_refs: Vec::new(),
        }
    }

    pub fn ts(&self) -> &'a dyn TypeSystem {
        self.env.ts
    }

    pub fn ptr(&self) -> PointerSize {
        self.env.pointer_size()
    }

    pub fn builder(&self, section: Section) -> ObjectDataBuilder {
        ObjectDataBuilder::new(self.ptr(), section)
    }

    /// Whether the node for `key` exists and is marked.
    pub fn is_marked(&self, key: &ArtifactKey) -> bool {
        self.factory.is_marked(self.env, key)
    }

    /// The node that will be emitted in place of `id`,
    ///   if any.
    ///
    /// A necessary type descriptor is superseded by the constructed
    ///   descriptor of the same type when the latter is marked.
    pub fn emitted_node(&self, id: NodeId) -> Option<NodeId> {
        let graph = self.factory.graph();

        if let ArtifactKey::TypeDescriptor(ty, TypeFlavor::Necessary) = graph.key(id) {
            let constructed = ArtifactKey::constructed_type(*ty);

            if let Some(cid) = self.factory.existing(self.env, &constructed) {
                if graph.is_marked(cid) {
                    return Some(cid);
                }
            }
        }

        graph.is_marked(id).then_some(id)
    }

    /// Symbol of a marked node,
    ///   or [`None`] if the node is not marked.
    pub fn marked_symbol(&self, id: NodeId) -> Option<SymbolId> {
        self.emitted_node(id).map(|id| self.factory.node_symbol(id))
    }

    /// Symbol of a node that must be marked.
    ///
    /// Panics
    /// ======
    /// If the node is not marked.
    pub fn node_symbol(&self, id: NodeId) -> SymbolId {
        match self.marked_symbol(id) {
            Some(sym) => sym,
            None => diagnostic_panic!(
                vec![id.internal_error("relocation against this unmarked node")],
                "{} is referenced but was never marked",
                self.factory.graph().key(id),
            ),
        }
    }

    /// Symbol of the node for `key`,
    ///   which must be marked.
    ///
    /// Panics
    /// ======
    /// If there is no such node or it is not marked.
    pub fn symbol_of(&self, key: &ArtifactKey) -> SymbolId {
        let necessary_fallback = match key {
            ArtifactKey::TypeDescriptor(ty, TypeFlavor::Necessary) => {
                self.factory
                    .existing(self.env, &ArtifactKey::constructed_type(*ty))
            }
            _ => None,
        };

        match self.factory.existing(self.env, key).or(necessary_fallback) {
            Some(id) => self.node_symbol(id),
            None => diagnostic_panic!(
                vec![],
                "{key} is referenced but no node was ever created for it",
            ),
        }
    }

    /// Index of `symbol` in the external reference table,
    ///   allocating one if necessary.
    ///
    /// In relocs-only mode nothing is allocated and the index is `0`.
    pub fn ext_index(&mut self, symbol: SymbolId) -> u32 {
        if self.mode == EmitMode::RelocsOnly {
            return 0;
        }

        if let Some(&index) = self.ext_index.get(&symbol) {
            return index;
        }

        let index = self.ext_refs.len() as u32;
        self.ext_refs.push(symbol);
        self.ext_index.insert(symbol, index);
        index
    }

    /// External reference index of the node for `key`.
    pub fn ext_index_of(&mut self, key: &ArtifactKey) -> u32 {
        let symbol = self.symbol_of(key);
        self.ext_index(symbol)
    }

    /// Symbols of the external reference table,
    ///   in index order.
    pub fn external_references(&self) -> &[SymbolId] {
        &self.ext_refs
    }

    /// Builder with the node's own symbol defined at its start.
    pub fn node_builder(&self, id: NodeId, section: Section) -> ObjectDataBuilder {
        let mut builder = self.builder(section);
        builder.define_symbol(self.factory.node_symbol(id));
        builder
    }

    /// Serialize a marked node.
    ///
    /// Panics
    /// ======
    /// If the node is not emittable.
    pub fn emit_node(&mut self, id: NodeId) -> ObjectData {
        use ArtifactKey::*;

        match self.factory.graph().key(id).clone() {
            TypeDescriptor(ty, flavor) => eetype::emit(self, id, ty, flavor),
            MethodBody(..) => method::emit(self, id),
            InterfaceDispatchMap(ty) => dispatch::emit_dispatch_map(self, id, ty),
            DispatchCell(m) => dispatch::emit_dispatch_cell(self, id, m),
            Indirection(target) => dispatch::emit_indirection(self, id, target),
            TypeDictionary(ty) => dictionary::emit_type_dictionary(self, id, ty),
            MethodDictionary(m) => dictionary::emit_method_dictionary(self, id, m),
            Statics(ty, kind) => statics::emit_statics(self, id, ty, kind),
            GcStaticDescriptor(map) => statics::emit_gc_static_descriptor(self, id, &map),
            StaticsRegion(kind) => statics::emit_region(self, id, kind),
            ExternalReferences => tables::emit_external_references(self, id),
            ReflectionInvokeMap => tables::emit_invoke_map(self, id),
            InterfaceGvmTable => tables::emit_interface_gvm_table(self, id),

            key @ (ShadowConcreteMethod(_)
            | VirtualMethodUse(_)
            | GvmDependencies(_)
            | VtableSlice(_)
            | ExternSymbol(_)) => diagnostic_panic!(
                vec![id.internal_error("this node has no data")],
                "attempted to emit {key}",
            ),
        }
    }
}

#[cfg(test)]
mod test;
