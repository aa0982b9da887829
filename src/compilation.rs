// Compilation driver
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


//! Driver surface of the compiler core.
//!
//! A [`Compilation`] ties together the collaborators supplied by the
//!   embedder
//!     (the [`TypeSystem`],
//!       the [`CompilationGroup`] policy,
//!       and the [`Codegen`] backend)
//!   with the state owned by the core:
//!     the dependency graph,
//!     generic dictionary layouts,
//!     and the marking engine.
//!
//! Use proceeds in three steps:
//!
//!   1. [`Compilation::add_root`] for each entry point;
//!   2. [`Compilation::run_to_fixed_point`] to discover everything that
//!        the roots require;
//!        and
//!   3. [`Compilation::emit_all`] to hand every marked node to an
//!        [`ObjectWriter`].
//!
//! Steps 1 and 2 may be repeated;
//!   marking resumes from where it left off.
//! Once emission begins,
//!   dictionary layouts are closed and the graph must not grow further.

use crate::{
    codegen::{Codegen, CodegenError},
    deps::{DependencyContext, GvmImplementation},
    diagnose::{
        AnnotatedEntity, Annotate, Diagnostic, Entity, EntityResolver,
        EntityResolverError, Reporter, ResolvedEntity, TypeSystemResolver,
        VisualReporter,
    },
    emit::{EmitContext, EmitMode},
    generic::{DictionaryLayouts, LookupError},
    graph::{
        ArtifactKey, Env, MarkingEngine, NodeFactory, NodeId, Reason,
        TypeFlavor, TypeLoadError,
    },
    obj::{
        writer::{ObjectWriter, WriterError},
        ObjectData,
    },
    session::{CompilationGroup, Options, Session, Stats},
    ts::TypeSystem,
};
use std::{error::Error, fmt::Display};
use tracing::{debug, instrument};

pub type CompileResult<T> = Result<T, CompileError>;

/// A compilation could not be completed.
#[derive(Debug)]
pub enum CompileError {
    /// An artifact was requested that cannot exist at runtime.
    TypeLoad(TypeLoadError),

    /// The code generator failed to compile a method.
    Codegen(CodegenError),

    /// A generic lookup could not be resolved for an instantiation.
    Lookup(LookupError),

    /// The object writer rejected the emitted data.
    Writer(WriterError),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeLoad(e) => e.fmt(f),
            Self::Codegen(e) => e.fmt(f),
            Self::Lookup(e) => e.fmt(f),
            Self::Writer(e) => e.fmt(f),
        }
    }
}

impl Error for CompileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TypeLoad(e) => Some(e),
            Self::Codegen(e) => Some(e),
            Self::Lookup(e) => Some(e),
            Self::Writer(e) => Some(e),
        }
    }
}

impl From<TypeLoadError> for CompileError {
    fn from(e: TypeLoadError) -> Self {
        Self::TypeLoad(e)
    }
}

impl From<CodegenError> for CompileError {
    fn from(e: CodegenError) -> Self {
        Self::Codegen(e)
    }
}

impl From<LookupError> for CompileError {
    fn from(e: LookupError) -> Self {
        Self::Lookup(e)
    }
}

impl From<WriterError> for CompileError {
    fn from(e: WriterError) -> Self {
        Self::Writer(e)
    }
}

impl Diagnostic for CompileError {
    fn describe(&self) -> Vec<AnnotatedEntity> {
        match self {
            Self::TypeLoad(e) => e.describe(),
            Self::Codegen(e) => vec![e.method().error(e.to_string())],
            Self::Lookup(e) => e.describe(),
            Self::Writer(e) => vec![Entity::Unknown.error(e.to_string())],
        }
    }
}

/// State of a single ahead-of-time compilation.
///
/// See the [module-level documentation](self).
pub struct Compilation<'a> {
    session: Session,
    ts: &'a dyn TypeSystem,
    group: &'a dyn CompilationGroup,
    codegen: &'a mut dyn Codegen,
    factory: NodeFactory,
    layouts: DictionaryLayouts,
    gvm_impls: Vec<GvmImplementation>,
    engine: MarkingEngine,
}

impl<'a> Compilation<'a> {
    pub fn new(
        options: Options,
        ts: &'a dyn TypeSystem,
        group: &'a dyn CompilationGroup,
        codegen: &'a mut dyn Codegen,
    ) -> Self {
        Self {
            session: Session::new(options),
            ts,
            group,
            codegen,
            factory: NodeFactory::new(),
            layouts: DictionaryLayouts::new(),
            gvm_impls: Vec::new(),
            engine: MarkingEngine::new(),
        }
    }

    fn env(&self) -> Env<'_> {
        Env::new(self.ts, self.session.options(), self.group)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> &Stats {
        self.session.stats()
    }

    pub fn factory(&self) -> &NodeFactory {
        &self.factory
    }

    pub fn layouts(&self) -> &DictionaryLayouts {
        &self.layouts
    }

    /// Implementations of interface generic virtual methods discovered
    ///   so far.
    pub fn gvm_implementations(&self) -> &[GvmImplementation] {
        &self.gvm_impls
    }

    /// Queue `key` to be marked on the next
    ///   [`run_to_fixed_point`](Self::run_to_fixed_point).
    pub fn add_root(&mut self, key: ArtifactKey, reason: Reason) -> CompileResult<NodeId> {
        let env = Env::new(self.ts, self.session.options(), self.group);
        let id = self.factory.get_or_create(env, key)?;

        self.engine.add_root(id, reason);
        Ok(id)
    }

    /// The node for `key`,
    ///   if one has been created.
    pub fn node(&self, key: &ArtifactKey) -> Option<NodeId> {
        self.factory.existing(self.env(), key)
    }

    pub fn is_marked(&self, key: &ArtifactKey) -> bool {
        self.factory.is_marked(self.env(), key)
    }

    /// Keys of every marked node in the order that they were marked.
    pub fn marked_keys(&self) -> impl Iterator<Item = &ArtifactKey> + '_ {
        let graph = self.factory.graph();
        graph.marked().iter().map(move |&id| graph.key(id))
    }

    /// Mangled symbol name of a node.
    pub fn symbol_name(&self, id: NodeId) -> &str {
        self.factory.symbol_name(self.factory.node_symbol(id))
    }

    /// Mark everything reachable from the roots.
    #[instrument(skip(self))]
    pub fn run_to_fixed_point(&mut self) -> CompileResult<()> {
        let (options, stats) = self.session.parts_mut();
        let env = Env::new(self.ts, options, self.group);

        let mut ctx = DependencyContext {
            env,
            factory: &mut self.factory,
            codegen: &mut *self.codegen,
            layouts: &mut self.layouts,
            gvm_impls: &mut self.gvm_impls,
        };

        self.engine.run(&mut ctx, stats)
    }

    /// Why `id` was marked,
    ///   as a chain of first-mark reasons ending at a root.
    pub fn explain(&self, id: NodeId) -> Vec<(NodeId, Reason)> {
        self.factory.graph().explain(id)
    }

    /// Marked nodes that produce object data,
    ///   in the order that they were marked.
    ///
    /// A necessary type descriptor superseded by its constructed
    ///   counterpart produces nothing.
    fn emittable(&self) -> Vec<NodeId> {
        let env = self.env();
        let graph = self.factory.graph();

        graph
            .marked()
            .iter()
            .copied()
            .filter(|&id| graph.node(id).caps().emittable)
            .filter(|&id| match graph.key(id) {
                ArtifactKey::TypeDescriptor(ty, TypeFlavor::Necessary) => !self
                    .factory
                    .is_marked(env, &ArtifactKey::constructed_type(*ty)),
                _ => true,
            })
            .collect()
    }

    /// Serialize a single marked node.
    ///
    /// Panics
    /// ======
    /// If the node was already finalized,
    ///   either by this method or by [`Self::emit_all`].
    pub fn finalize(&mut self, id: NodeId) -> ObjectData {
        self.factory.graph_mut().finalize(id);

        let env = Env::new(self.ts, self.session.options(), self.group);
        let mut ctx = EmitContext::new(
            env,
            &self.factory,
            &self.layouts,
            &self.gvm_impls,
            EmitMode::Final,
        );

        ctx.emit_node(id)
    }

    /// Write every marked node.
    ///
    /// Every relocation of every node is first produced in
    ///   [relocs-only](EmitMode::RelocsOnly) mode,
    ///     which panics if any of them targets a node that was never
    ///     marked,
    ///   before anything reaches `writer`.
    /// The external reference table is written last,
    ///   after every table that allocates indices in it.
    #[instrument(skip_all)]
    pub fn emit_all(&mut self, writer: &mut dyn ObjectWriter) -> CompileResult<()> {
        self.layouts.close();

        let nodes = self.emittable();
        let (tables, ext_refs): (Vec<&NodeId>, Vec<&NodeId>) = nodes
            .iter()
            .partition(|&&id| *self.factory.graph().key(id) != ArtifactKey::ExternalReferences);

        for &id in &nodes {
            self.factory.graph_mut().finalize(id);
        }

        let env = Env::new(self.ts, self.session.options(), self.group);

        let mut preflight = EmitContext::new(
            env,
            &self.factory,
            &self.layouts,
            &self.gvm_impls,
            EmitMode::RelocsOnly,
        );

        for &id in &tables {
            preflight.emit_node(*id);
        }

        let mut ctx = EmitContext::new(
            env,
            &self.factory,
            &self.layouts,
            &self.gvm_impls,
            EmitMode::Final,
        );

        for &id in tables.iter().chain(&ext_refs) {
            writer.emit(ctx.emit_node(*id))?;
        }

        let graph = self.factory.graph();
        let externs = graph
            .marked()
            .iter()
            .filter(|&&id| graph.node(id).caps().is_extern)
            .map(|&id| graph.node(id).symbol())
            .collect::<Vec<_>>();

        for &sym in &externs {
            writer.declare_extern(sym);
        }

        debug!(
            nodes = nodes.len(),
            externs = externs.len(),
            external_references = ctx.external_references().len(),
            "emitted object data"
        );

        writer.finish()?;
        Ok(())
    }

    /// Resolver able to describe graph nodes in addition to types,
    ///   methods,
    ///   and fields.
    pub fn resolver(&self) -> NodeResolver<'_> {
        NodeResolver {
            ts: TypeSystemResolver::new(self.ts),
            factory: &self.factory,
        }
    }

    /// Render `err` for the user,
    ///   naming the entities it describes.
    pub fn report(&self, err: &CompileError) -> String {
        VisualReporter::new(self.resolver()).render(err).to_string()
    }
}

/// [`EntityResolver`] for diagnostics referencing graph nodes.
pub struct NodeResolver<'c> {
    ts: TypeSystemResolver<'c>,
    factory: &'c NodeFactory,
}

impl<'c> EntityResolver for NodeResolver<'c> {
    fn resolve(&self, entity: Entity) -> Result<ResolvedEntity, EntityResolverError> {
        match entity {
            Entity::Node(id) if id.index() < self.factory.graph().node_count() => {
                let key = self.factory.graph().key(id);

                let name = match (key.type_id(), key.method_id()) {
                    (Some(ty), _) => self.ts.resolve(ty.into())?.name().to_string(),
                    (_, Some(m)) => self.ts.resolve(m.into())?.name().to_string(),
                    _ => key.to_string(),
                };

                Ok(ResolvedEntity::new(entity, key.kind_name(), name))
            }
            Entity::Node(_) => Err(EntityResolverError::Unsupported(entity)),
            other => self.ts.resolve(other),
        }
    }
}

#[cfg(test)]
mod test;
