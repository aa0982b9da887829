// Dependency graph
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

//! Dependency graph of everything that may end up in the object file.
//!
//! Compilation begins with a set of _roots_
//!   (e.g. the entry point)
//!   and discovers everything else by asking each reachable node what it
//!   depends upon.
//! Each node is an [`ArtifactKey`]:
//!   a type descriptor,
//!   a method body,
//!   a dictionary,
//!   and so on.
//! Some nodes are purely logical and are never written;
//!   they exist to record a fact that other nodes condition upon
//!     (e.g. "this vtable slot is called somewhere").
//!
//! There are three kinds of dependencies:
//!
//!   - _Static_ dependencies are known as soon as a node is marked,
//!       or as soon as its code has been generated;
//!   - _Conditional_ dependencies are marked only once both the node
//!       declaring them and a second _condition_ node are marked
//!         (e.g. a virtual method implementation is needed only if its
//!           type is constructed _and_ its slot is called);
//!       and
//!   - _Dynamic_ dependencies are discovered by scanning nodes that are
//!       marked after the declaring node
//!         (e.g. a generic virtual method must be instantiated for every
//!           type that may receive the call,
//!             including types that are discovered later).
//!
//! The [`mark`] module drives these to a fixed point.
//! Nodes are created by the [`factory`],
//!   which guarantees one node per key.
//!
//! Nodes are never removed from the graph,
//!   and a node,
//!     once marked,
//!     is never unmarked,
//!   so [`NodeId`]s remain valid for the life of the graph.

pub mod factory;
pub mod key;
pub mod mark;

pub use factory::{Env, FactoryResult, NodeFactory, TypeLoadError, TypeLoadReason};
pub use key::{ArtifactKey, StaticsKind, TypeFlavor};
pub use mark::{
    ConditionalDependency, DependencySource, DynamicDependency, MarkingEngine,
};

use crate::{
    codegen::CompiledMethod,
    diagnose::Annotate,
    diagnostic_panic, global,
    sym::SymbolId,
};
use fixedbitset::FixedBitSet;
use fxhash::FxHashMap;
use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
    Direction,
};
use std::fmt::Debug;

/// Index of a node on the [`DependencyGraph`].
pub type NodeId = NodeIndex<global::NodeIdSize>;

/// Human-readable justification for an edge.
///
/// Reasons are static strings so that recording them costs nothing more
///   than a pointer;
///     they are only ever read when explaining why something was
///     included.
pub type Reason = &'static str;

/// Behavior of a node that is fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The node is written to the object file.
    pub emittable: bool,

    /// The node is a type descriptor carrying a vtable.
    pub emit_vtable: bool,

    /// The node is a type descriptor that references an interface
    ///   dispatch map.
    pub track_dispatch_map: bool,

    /// The node describes a generic definition rather than a concrete
    ///   artifact.
    pub is_definition: bool,

    /// Static dependencies are not known until code has been generated.
    pub needs_code: bool,

    /// The node may have conditional dependencies.
    pub has_conditional: bool,

    /// The node must scan later-marked nodes for dynamic dependencies.
    pub has_dynamic: bool,

    /// The node's symbol is defined outside of the object file.
    pub is_extern: bool,
}

/// A node of the [`DependencyGraph`].
#[derive(Debug)]
pub struct Node {
    key: ArtifactKey,
    symbol: SymbolId,
    caps: Capabilities,
    code: Option<CompiledMethod>,
    finalized: bool,

    /// Number of marked nodes already scanned for dynamic dependencies.
    dynamic_cursor: usize,
}

impl Node {
    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Mangled name of this node in the object file.
    pub fn symbol(&self) -> SymbolId {
        self.symbol
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    /// Code generated for this node,
    ///   if any.
    pub fn code(&self) -> Option<&CompiledMethod> {
        self.code.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn dynamic_cursor(&self) -> usize {
        self.dynamic_cursor
    }
}

/// Why a node was first marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkReason {
    /// The node whose dependency caused the mark,
    ///   or [`None`] for roots.
    pub parent: Option<NodeId>,
    pub reason: Reason,
}

/// Nodes,
///   their dependency edges,
///   and the set of nodes marked as reachable.
///
/// Edges point from a node to what it depends upon.
pub struct DependencyGraph {
    graph: DiGraph<Node, Reason, global::NodeIdSize>,

    /// Nodes that have been marked,
    ///   indexed by [`NodeId`].
    marked: FixedBitSet,

    /// Marked nodes in the order that they were marked.
    ///
    /// This order is deterministic for a given set of inputs and is used
    ///   for both dynamic dependency scanning and emission.
    marked_order: Vec<NodeId>,

    /// The first reason each node was marked for.
    first_reason: FxHashMap<NodeId, MarkReason>,
}

impl Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[DependencyGraph: {} nodes ({} marked), {} edges]",
            self.graph.node_count(),
            self.marked_order.len(),
            self.graph.edge_count(),
        )
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::default(),
            marked: FixedBitSet::default(),
            marked_order: Vec::new(),
            first_reason: FxHashMap::default(),
        }
    }

    /// Add a node.
    ///
    /// This does not check for duplicate keys;
    ///   that is the responsibility of the
    ///   [`NodeFactory`](factory::NodeFactory).
    fn add(
        &mut self,
        key: ArtifactKey,
        symbol: SymbolId,
        caps: Capabilities,
    ) -> NodeId {
        let id = self.graph.add_node(Node {
            key,
            symbol,
            caps,
            code: None,
            finalized: false,
            dynamic_cursor: 0,
        });

        self.marked.grow(self.graph.node_count());
        id
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Retrieve a node.
    ///
    /// Panics
    /// ======
    /// If `id` was not produced by this graph.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.graph.node_weight(id) {
            Some(node) => node,
            None => missing_node(id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.graph.node_weight_mut(id) {
            Some(node) => node,
            None => missing_node(id),
        }
    }

    pub fn key(&self, id: NodeId) -> &ArtifactKey {
        self.node(id).key()
    }

    pub fn is_marked(&self, id: NodeId) -> bool {
        self.marked.contains(id.index())
    }

    /// Marked nodes in the order that they were marked.
    pub fn marked(&self) -> &[NodeId] {
        &self.marked_order
    }

    /// Mark a node as reachable.
    ///
    /// Returns `false` if the node was already marked,
    ///   in which case `parent` and `reason` are discarded.
    pub(crate) fn mark(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        reason: Reason,
    ) -> bool {
        if self.marked.put(id.index()) {
            return false;
        }

        self.marked_order.push(id);
        self.first_reason.insert(id, MarkReason { parent, reason });
        true
    }

    /// Record that `from` depends on `to`.
    pub(crate) fn add_edge(&mut self, from: NodeId, to: NodeId, reason: Reason) {
        self.graph.add_edge(from, to, reason);
    }

    /// Nodes that `id` depends upon,
    ///   along with the reason for each dependency.
    pub fn dependencies(
        &self,
        id: NodeId,
    ) -> impl Iterator<Item = (NodeId, Reason)> + '_ {
        self.graph
            .edges_directed(id, Direction::Outgoing)
            .map(|edge| (edge.target(), *edge.weight()))
    }

    /// Nodes that depend upon `id`.
    pub fn dependents(
        &self,
        id: NodeId,
    ) -> impl Iterator<Item = (NodeId, Reason)> + '_ {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
    }

    /// Why a node was first marked,
    ///   if it is marked.
    pub fn mark_reason(&self, id: NodeId) -> Option<MarkReason> {
        self.first_reason.get(&id).copied()
    }

    /// The chain of first mark reasons from `id` back to a root.
    ///
    /// The first element is `id` itself and the last is the root that
    ///   caused it to be marked.
    /// An unmarked node yields an empty chain.
    pub fn explain(&self, id: NodeId) -> Vec<(NodeId, Reason)> {
        let mut chain = Vec::new();
        let mut cur = Some(id);

        while let Some(node) = cur {
            let Some(MarkReason { parent, reason }) = self.mark_reason(node)
            else {
                break;
            };

            // Roots have no parent;
            //   a cycle here would mean a node was marked twice.
            if chain.iter().any(|&(seen, _)| seen == node) {
                break;
            }

            chain.push((node, reason));
            cur = parent;
        }

        chain
    }

    /// Attach generated code to a node.
    ///
    /// Panics
    /// ======
    /// If code was already attached;
    ///   each node is compiled at most once.
    pub(crate) fn set_code(&mut self, id: NodeId, code: CompiledMethod) {
        let node = self.node_mut(id);

        if node.code.is_some() {
            diagnostic_panic!(
                vec![id.internal_error("this node was compiled twice")],
                "code already generated for {}",
                node.key,
            );
        }

        node.code = Some(code);
    }

    /// Record that a node has been finalized into object data.
    ///
    /// Panics
    /// ======
    /// If the node was already finalized.
    pub(crate) fn finalize(&mut self, id: NodeId) {
        let node = self.node_mut(id);

        if node.finalized {
            diagnostic_panic!(
                vec![id.internal_error("this node was already finalized")],
                "{} finalized twice",
                node.key,
            );
        }

        node.finalized = true;
    }

    /// Advance the dynamic dependency cursor of a node.
    ///
    /// Panics
    /// ======
    /// If `to` is behind the current cursor,
    ///   which would cause nodes to be scanned twice.
    pub(crate) fn advance_cursor(&mut self, id: NodeId, to: usize) {
        let node = self.node_mut(id);

        if to < node.dynamic_cursor {
            diagnostic_panic!(
                vec![id.internal_error("dynamic dependency cursor regressed")],
                "cursor of {} moved from {} back to {to}",
                node.key,
                node.dynamic_cursor,
            );
        }

        node.dynamic_cursor = to;
    }
}

fn missing_node(id: NodeId) -> ! {
    diagnostic_panic!(
        vec![id.internal_error("this node is not on the graph")],
        "invalid node index {}",
        id.index(),
    )
}
