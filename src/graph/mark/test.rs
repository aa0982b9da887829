// Tests for dependency graph marking
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
    codegen::CompiledMethod,
    graph::{ArtifactKey, Capabilities},
    sym::Interner,
};
use fxhash::FxHashMap;

/// Dependencies declared ahead of time by name.
#[derive(Default)]
struct Toy {
    graph: DependencyGraph,
    interner: Interner,
    names: FxHashMap<&'static str, NodeId>,
    statics: FxHashMap<NodeId, Vec<NodeId>>,
    conditionals: FxHashMap<NodeId, Vec<(NodeId, NodeId)>>,

    /// For a dynamic node,
    ///   targets contributed by each later-marked node.
    dynamic: FxHashMap<NodeId, FxHashMap<NodeId, NodeId>>,

    scanned: Vec<(NodeId, Vec<NodeId>)>,
    fail_on: Option<NodeId>,
}

impl Toy {
    fn node(&mut self, name: &'static str, caps: Capabilities) -> NodeId {
        let id = self.graph.add(
            ArtifactKey::extern_symbol(name),
            self.interner.intern(name),
            caps,
        );
        self.names.insert(name, id);
        id
    }

    fn plain(&mut self, name: &'static str) -> NodeId {
        self.node(name, Capabilities::default())
    }

    fn needs(&mut self, from: NodeId, to: NodeId) {
        self.statics.entry(from).or_default().push(to);
    }
}

impl DependencySource for Toy {
    type Error = String;

    fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    fn static_dependencies(
        &mut self,
        node: NodeId,
    ) -> Result<Option<Vec<(NodeId, Reason)>>, String> {
        if self.fail_on == Some(node) {
            return Err(format!("cannot process node {}", node.index()));
        }

        let n = self.graph.node(node);
        if n.caps().needs_code && n.code().is_none() {
            return Ok(None);
        }

        Ok(Some(
            self.statics
                .get(&node)
                .into_iter()
                .flatten()
                .map(|&dep| (dep, "static"))
                .collect(),
        ))
    }

    fn conditional_dependencies(
        &mut self,
        node: NodeId,
    ) -> Result<Vec<ConditionalDependency>, String> {
        Ok(self
            .conditionals
            .get(&node)
            .into_iter()
            .flatten()
            .map(|&(target, condition)| ConditionalDependency {
                target,
                condition,
                reason: "conditional",
            })
            .collect())
    }

    fn search_dynamic_dependencies(
        &mut self,
        node: NodeId,
        marked: &[NodeId],
    ) -> Result<Vec<DynamicDependency>, String> {
        self.scanned.push((node, marked.to_vec()));

        let rules = self.dynamic.get(&node).cloned().unwrap_or_default();
        Ok(marked
            .iter()
            .filter_map(|m| rules.get(m))
            .map(|&target| DynamicDependency::new(target, "dynamic"))
            .collect())
    }

    fn generate_code(&mut self, pending: &[NodeId]) -> Result<usize, String> {
        for &node in pending {
            self.graph.set_code(node, CompiledMethod::new(vec![0xC3]));
        }

        Ok(pending.len())
    }
}

fn run(toy: &mut Toy, roots: &[NodeId]) -> Stats {
    let mut engine = MarkingEngine::new();
    let mut stats = Stats::default();

    for &root in roots {
        engine.add_root(root, "root");
    }

    engine.run(toy, &mut stats).expect("marking failed");
    assert!(engine.is_idle());
    stats
}

#[test]
fn static_dependencies_are_marked_transitively() {
    let mut toy = Toy::default();
    let a = toy.plain("a");
    let b = toy.plain("b");
    let c = toy.plain("c");
    let unreached = toy.plain("unreached");
    toy.needs(a, b);
    toy.needs(b, c);
    toy.needs(unreached, a);

    let stats = run(&mut toy, &[a]);

    assert_eq!(&[a, b, c], toy.graph.marked());
    assert!(!toy.graph.is_marked(unreached));
    assert_eq!(3, stats.nodes_marked);
    assert_eq!(
        vec![(c, "static"), (b, "static"), (a, "root")],
        toy.graph.explain(c),
    );
}

#[test]
fn cycles_terminate() {
    let mut toy = Toy::default();
    let a = toy.plain("a");
    let b = toy.plain("b");
    toy.needs(a, b);
    toy.needs(b, a);

    run(&mut toy, &[a]);

    assert_eq!(&[a, b], toy.graph.marked());
    assert_eq!(2, toy.graph.edge_count());
}

#[test]
fn code_is_generated_before_dependencies_are_known() {
    let mut toy = Toy::default();
    let code = Capabilities {
        needs_code: true,
        ..Default::default()
    };

    let main = toy.node("main", code);
    let callee = toy.node("callee", code);
    let data = toy.plain("data");
    toy.needs(main, callee);
    toy.needs(callee, data);

    let stats = run(&mut toy, &[main]);

    assert!(toy.graph.is_marked(data));
    assert!(toy.graph.node(main).code().is_some());
    assert!(toy.graph.node(callee).code().is_some());
    assert_eq!(2, stats.methods_compiled);
}

#[test]
fn conditional_dependency_requires_its_condition() {
    let mut toy = Toy::default();
    let cond_caps = Capabilities {
        has_conditional: true,
        ..Default::default()
    };

    let ty = toy.node("type", cond_caps);
    let slot_use = toy.plain("slot use");
    let caller = toy.plain("caller");
    let impl_ = toy.plain("impl");
    toy.conditionals.insert(ty, vec![(impl_, slot_use)]);
    toy.needs(caller, slot_use);

    // The type alone is not enough.
    run(&mut toy, &[ty]);
    assert!(!toy.graph.is_marked(impl_));

    let mut toy2 = Toy::default();
    let ty = toy2.node("type", cond_caps);
    let slot_use = toy2.plain("slot use");
    let caller = toy2.plain("caller");
    let impl_ = toy2.plain("impl");
    toy2.conditionals.insert(ty, vec![(impl_, slot_use)]);
    toy2.needs(caller, slot_use);

    // Order of discovery does not matter.
    run(&mut toy2, &[ty, caller]);
    assert!(toy2.graph.is_marked(impl_));
    assert_eq!(Some(ty), toy2.graph.mark_reason(impl_).and_then(|r| r.parent));
}

#[test]
fn dynamic_nodes_scan_each_marked_node_once() {
    let mut toy = Toy::default();
    let dyn_caps = Capabilities {
        has_dynamic: true,
        ..Default::default()
    };
    let cond_caps = Capabilities {
        has_conditional: true,
        ..Default::default()
    };

    let gvm = toy.node("gvm", dyn_caps);
    let early = toy.plain("early");
    let late_holder = toy.node("late holder", cond_caps);
    let late = toy.plain("late");
    let early_impl = toy.plain("early impl");
    let late_impl = toy.plain("late impl");

    toy.needs(gvm, early);
    toy.conditionals.insert(late_holder, vec![(late, early_impl)]);
    toy.dynamic.insert(
        gvm,
        [(early, early_impl), (late, late_impl)].into_iter().collect(),
    );

    let stats = run(&mut toy, &[gvm, late_holder]);

    // `late` is marked only after the dynamic pass marks `early impl`,
    //   and so must be found by a later scan.
    assert!(toy.graph.is_marked(early_impl));
    assert!(toy.graph.is_marked(late));
    assert!(toy.graph.is_marked(late_impl));
    assert!(stats.dynamic_passes >= 2);

    let scanned = toy
        .scanned
        .iter()
        .flat_map(|(_, nodes)| nodes.iter().copied())
        .collect::<Vec<_>>();

    let mut unique = scanned.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), scanned.len(), "a node was scanned twice");
    assert_eq!(toy.graph.marked().len(), toy.graph.node(gvm).dynamic_cursor());
}

#[test]
fn marking_resumes_with_new_roots() {
    let mut toy = Toy::default();
    let a = toy.plain("a");
    let b = toy.plain("b");
    let c = toy.plain("c");
    toy.needs(b, c);

    let mut engine = MarkingEngine::new();
    let mut stats = Stats::default();

    engine.add_root(a, "first");
    engine.run(&mut toy, &mut stats).expect("marking failed");
    assert_eq!(&[a], toy.graph.marked());

    engine.add_root(b, "second");
    engine.run(&mut toy, &mut stats).expect("marking failed");
    assert_eq!(&[a, b, c], toy.graph.marked());
}

#[test]
fn source_errors_abort_marking() {
    let mut toy = Toy::default();
    let a = toy.plain("a");
    let b = toy.plain("b");
    toy.needs(a, b);
    toy.fail_on = Some(b);

    let mut engine = MarkingEngine::new();
    let mut stats = Stats::default();
    engine.add_root(a, "root");

    assert_eq!(
        Err(format!("cannot process node {}", b.index())),
        engine.run(&mut toy, &mut stats),
    );
}
