// Dependency graph marking
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

//! Marking of reachable nodes to a fixed point.
//!
//! The [`MarkingEngine`] owns only the bookkeeping necessary to drive
//!   marking;
//!     the graph itself and the knowledge of what each node depends upon
//!     are provided by a [`DependencySource`].
//!
//! Marking proceeds in rounds:
//!
//!   1. The static worklist is drained,
//!        marking each node and queueing its static dependencies.
//!      Nodes whose dependencies cannot be known until their code has
//!        been generated are set aside.
//!   2. If any nodes were set aside,
//!        their code is generated as a batch and their dependencies
//!        queued,
//!          after which we return to step 1.
//!   3. Every node with dynamic dependencies scans the nodes marked since
//!        its last scan.
//!      If this queued anything,
//!        we return to step 1.
//!   4. Conditional dependencies whose conditions have since been marked
//!        are queued.
//!      If this queued anything,
//!        we return to step 1.
//!
//! When a full round queues nothing,
//!   the graph has reached its fixed point.
//! Marking only ever adds to the set of marked nodes,
//!   so this is guaranteed to terminate for any finite set of keys.

use super::{DependencyGraph, NodeId, Reason};
use crate::{diagnose::Annotate, diagnostic_panic, session::Stats};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// A dependency that is marked only once `condition` is marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalDependency {
    pub target: NodeId,
    pub condition: NodeId,
    pub reason: Reason,
}

/// A dependency discovered while scanning newly marked nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicDependency {
    pub target: NodeId,

    /// If present,
    ///   the dependency is conditional upon this node.
    pub condition: Option<NodeId>,
    pub reason: Reason,
}

impl DynamicDependency {
    pub fn new(target: NodeId, reason: Reason) -> Self {
        Self {
            target,
            condition: None,
            reason,
        }
    }
}

/// Knowledge of what each node depends upon.
pub trait DependencySource {
    type Error;

    fn graph(&self) -> &DependencyGraph;
    fn graph_mut(&mut self) -> &mut DependencyGraph;

    /// Static dependencies of a marked node.
    ///
    /// This yields [`None`] if the dependencies cannot be determined
    ///   until code has been generated for the node,
    ///     in which case the node will be passed to
    ///     [`Self::generate_code`] and this method will be invoked again
    ///     afterward.
    fn static_dependencies(
        &mut self,
        node: NodeId,
    ) -> Result<Option<Vec<(NodeId, Reason)>>, Self::Error>;

    /// Conditional dependencies of a marked node.
    ///
    /// This is invoked once per node,
    ///   after its static dependencies.
    fn conditional_dependencies(
        &mut self,
        node: NodeId,
    ) -> Result<Vec<ConditionalDependency>, Self::Error>;

    /// Dependencies of `node` contributed by `marked`,
    ///   which are the nodes marked since the last time this node was
    ///   scanned.
    fn search_dynamic_dependencies(
        &mut self,
        node: NodeId,
        marked: &[NodeId],
    ) -> Result<Vec<DynamicDependency>, Self::Error>;

    /// Generate code for each of `pending`,
    ///   returning the number of methods compiled.
    fn generate_code(&mut self, pending: &[NodeId]) -> Result<usize, Self::Error>;
}

/// A node queued for marking.
#[derive(Debug, Clone, Copy)]
struct Pending {
    node: NodeId,
    parent: Option<NodeId>,
    reason: Reason,
}

/// Drives a [`DependencySource`] to a fixed point.
///
/// See the [module-level documentation](self) for the algorithm.
#[derive(Debug, Default)]
pub struct MarkingEngine {
    worklist: VecDeque<Pending>,

    /// Marked nodes awaiting code generation.
    awaiting_code: Vec<NodeId>,

    /// Marked nodes with dynamic dependencies.
    dynamic: Vec<NodeId>,

    /// Conditional dependencies of marked nodes whose conditions have not
    ///   yet been marked,
    ///     paired with the node that declared them.
    conditional: Vec<(NodeId, ConditionalDependency)>,
}

impl MarkingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a root.
    pub fn add_root(&mut self, node: NodeId, reason: Reason) {
        self.worklist.push_back(Pending {
            node,
            parent: None,
            reason,
        });
    }

    /// Whether there is no outstanding work.
    pub fn is_idle(&self) -> bool {
        self.worklist.is_empty() && self.awaiting_code.is_empty()
    }

    /// Mark until nothing further can be marked.
    ///
    /// This may be invoked again after adding more roots;
    ///   marking resumes from where it left off.
    pub fn run<S: DependencySource>(
        &mut self,
        src: &mut S,
        stats: &mut Stats,
    ) -> Result<(), S::Error> {
        loop {
            self.drain(src, stats)?;

            if !self.awaiting_code.is_empty() {
                self.generate_pending(src, stats)?;
                continue;
            }

            if self.dynamic_pass(src, stats)? {
                continue;
            }

            if self.conditional_pass(src, stats)? {
                continue;
            }

            debug!(
                marked = src.graph().marked().len(),
                nodes = src.graph().node_count(),
                "marking reached fixed point"
            );

            return Ok(());
        }
    }

    fn drain<S: DependencySource>(
        &mut self,
        src: &mut S,
        stats: &mut Stats,
    ) -> Result<(), S::Error> {
        let mut count = 0usize;

        while let Some(Pending {
            node,
            parent,
            reason,
        }) = self.worklist.pop_front()
        {
            if !src.graph_mut().mark(node, parent, reason) {
                continue;
            }

            count += 1;
            trace!(node = node.index(), key = %src.graph().key(node), reason, "marked");

            self.process(src, node, false)?;
        }

        stats.worklist_drains += 1;
        stats.nodes_marked += count;
        debug!(marked = count, "drained worklist");

        Ok(())
    }

    /// Queue the static dependencies of a newly marked node and register
    ///   its conditional and dynamic dependencies.
    ///
    /// If `require_deps`,
    ///   code has already been generated and the source is expected to
    ///   know the node's dependencies.
    fn process<S: DependencySource>(
        &mut self,
        src: &mut S,
        node: NodeId,
        require_deps: bool,
    ) -> Result<(), S::Error> {
        let deps = match src.static_dependencies(node)? {
            Some(deps) => deps,
            None if require_deps => diagnostic_panic!(
                vec![node.internal_error(
                    "dependencies still unknown after code generation"
                )],
                "no static dependencies for {}",
                src.graph().key(node),
            ),
            None => {
                self.awaiting_code.push(node);
                return Ok(());
            }
        };

        for (dep, reason) in deps {
            self.depend(src.graph_mut(), node, dep, reason);
        }

        let caps = src.graph().node(node).caps();

        if caps.has_conditional {
            let conds = src.conditional_dependencies(node)?;
            self.conditional
                .extend(conds.into_iter().map(|cond| (node, cond)));
        }

        if caps.has_dynamic {
            self.dynamic.push(node);
        }

        Ok(())
    }

    /// Record an edge and queue its target if it is not yet marked.
    fn depend(
        &mut self,
        graph: &mut DependencyGraph,
        from: NodeId,
        to: NodeId,
        reason: Reason,
    ) -> bool {
        graph.add_edge(from, to, reason);

        match graph.is_marked(to) {
            true => false,
            false => {
                self.worklist.push_back(Pending {
                    node: to,
                    parent: Some(from),
                    reason,
                });
                true
            }
        }
    }

    fn generate_pending<S: DependencySource>(
        &mut self,
        src: &mut S,
        stats: &mut Stats,
    ) -> Result<(), S::Error> {
        let pending = std::mem::take(&mut self.awaiting_code);

        let compiled = src.generate_code(&pending)?;
        stats.methods_compiled += compiled;
        debug!(pending = pending.len(), compiled, "generated code");

        for node in pending {
            self.process(src, node, true)?;
        }

        Ok(())
    }

    /// Scan newly marked nodes on behalf of each node with dynamic
    ///   dependencies.
    ///
    /// Returns whether anything was queued.
    fn dynamic_pass<S: DependencySource>(
        &mut self,
        src: &mut S,
        stats: &mut Stats,
    ) -> Result<bool, S::Error> {
        stats.dynamic_passes += 1;

        let mut queued = 0usize;
        let mut scanned = 0usize;

        for i in 0..self.dynamic.len() {
            let node = self.dynamic[i];
            let graph = src.graph();
            let end = graph.marked().len();
            let cursor = graph.node(node).dynamic_cursor();

            if cursor == end {
                continue;
            }

            let fresh = graph.marked()[cursor..end].to_vec();
            let deps = src.search_dynamic_dependencies(node, &fresh)?;
            src.graph_mut().advance_cursor(node, end);
            scanned += fresh.len();

            for dep in deps {
                match dep.condition {
                    None => {
                        queued += self.depend(
                            src.graph_mut(),
                            node,
                            dep.target,
                            dep.reason,
                        ) as usize;
                    }
                    Some(condition) => self.conditional.push((
                        node,
                        ConditionalDependency {
                            target: dep.target,
                            condition,
                            reason: dep.reason,
                        },
                    )),
                }
            }
        }

        debug!(nodes = self.dynamic.len(), scanned, queued, "dynamic pass");
        Ok(!self.worklist.is_empty())
    }

    /// Queue conditional dependencies whose conditions are now marked.
    ///
    /// Returns whether anything was queued.
    fn conditional_pass<S: DependencySource>(
        &mut self,
        src: &mut S,
        stats: &mut Stats,
    ) -> Result<bool, S::Error> {
        stats.conditional_passes += 1;

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.conditional)
            .into_iter()
            .partition(|(_, cond)| src.graph().is_marked(cond.condition));

        self.conditional = waiting;

        let mut queued = 0usize;
        for (from, cond) in ready.iter().copied() {
            queued +=
                self.depend(src.graph_mut(), from, cond.target, cond.reason) as usize;
        }

        debug!(
            satisfied = ready.len(),
            waiting = self.conditional.len(),
            queued,
            "conditional pass"
        );

        Ok(!self.worklist.is_empty())
    }
}

#[cfg(test)]
mod test;
