// Native layout tables
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


//! Runtime lookup tables written in the native format.
//!
//! Tables do not embed addresses directly.
//! Every node that a table refers to is instead given an index into the
//!   [external reference table](emit_external_references),
//!     a list of 32-bit relative pointers,
//!   and the table stores that index as a compressed integer.
//! Indices are allocated as tables are emitted,
//!   so the external reference table must be emitted after every table
//!   that uses it.

use super::{NativeWriter, VertexId};
use crate::{
    diagnose::Annotate,
    diagnostic_panic,
    emit::{EmitContext, EmitMode},
    graph::{ArtifactKey, NodeId},
    obj::{ObjectData, ObjectDataBuilder, RelocKind, Section},
    sym::SymbolId,
    ts::{MethodId, TypeSystemExt},
};
use tracing::debug;

/// Flags leading each reflection invoke map entry.
pub mod invoke_flags {
    pub const HAS_VIRTUAL_INVOKE: u32 = 0x01;
    pub const IS_GENERIC_METHOD: u32 = 0x02;
    pub const HAS_METADATA_HANDLE: u32 = 0x04;
    pub const IS_DEFAULT_CONSTRUCTOR: u32 = 0x08;
    pub const REQUIRES_INST_ARG: u32 = 0x10;
    pub const HAS_ENTRYPOINT: u32 = 0x20;
}

fn end_symbol(ctx: &EmitContext, id: NodeId) -> SymbolId {
    match ctx.factory.end_symbol(id) {
        Some(sym) => sym,
        None => diagnostic_panic!(
            vec![id.internal_error("table without an end symbol")],
            "no end symbol for {}",
            ctx.factory.graph().key(id),
        ),
    }
}

/// Write `blob` followed by the table's end symbol.
fn finish_table(
    mut b: ObjectDataBuilder,
    blob: &[u8],
    end: SymbolId,
) -> ObjectData {
    b.emit_bytes(blob);
    b.define_symbol(end);
    b.build()
}

pub fn emit_external_references(ctx: &mut EmitContext, id: NodeId) -> ObjectData {
    let mut b = ctx.node_builder(id, Section::ReadOnly).with_alignment(4);

    if ctx.mode == EmitMode::RelocsOnly {
        return b.build();
    }

    for &sym in ctx.external_references() {
        b.emit_reloc(RelocKind::RelPtr32, sym, 0);
    }

    debug!(count = ctx.external_references().len(), "external references");
    b.build()
}

/// A method exposed to reflection.
struct InvokeEntry {
    method: MethodId,

    /// Node providing the entry point,
    ///   if the method has compiled code.
    body: Option<NodeId>,

    /// Exact dictionary of a shared instantiation.
    dictionary: Option<NodeId>,
}

fn invoke_entries(ctx: &EmitContext) -> Vec<InvokeEntry> {
    let ts = ctx.ts();
    let env = ctx.env;
    let graph = ctx.factory.graph();
    let reflectable =
        |m| env.options.reflection_invoke_map && env.group.is_reflectable(m);

    graph
        .marked()
        .iter()
        .filter_map(|&node| match *graph.key(node) {
            ArtifactKey::MethodBody(m, false)
                if reflectable(m) && !ts.is_shared_method(m) =>
            {
                Some(InvokeEntry {
                    method: m,
                    body: Some(node),
                    dictionary: None,
                })
            }

            ArtifactKey::MethodDictionary(m)
                if reflectable(ts.canonical_method(m)) =>
            {
                let canonical = ArtifactKey::method_body(ts.canonical_method(m));

                Some(InvokeEntry {
                    method: m,
                    body: ctx
                        .factory
                        .existing(env, &canonical)
                        .filter(|&id| graph.is_marked(id)),
                    dictionary: Some(node),
                })
            }

            _ => None,
        })
        .collect()
}

pub fn emit_invoke_map(ctx: &mut EmitContext, id: NodeId) -> ObjectData {
    use invoke_flags::*;

    let ts = ctx.ts();
    let b = ctx.node_builder(id, Section::ReadOnly);
    let end = end_symbol(ctx, id);

    let mut w = NativeWriter::new();
    let tables = w.new_section();
    let data = w.new_section();
    let table = w.hashtable();
    w.place(tables, table);

    let entries = invoke_entries(ctx);

    for entry in &entries {
        let m = entry.method;
        let desc = ts.method(m);
        let generic = ts.is_generic_method(m);

        let mut bits = 0;
        if entry.body.is_some() {
            bits |= HAS_ENTRYPOINT;
        }
        if desc.is_virtual {
            bits |= HAS_VIRTUAL_INVOKE;
        }
        if generic {
            bits |= IS_GENERIC_METHOD;
        }
        if desc.token.is_some() {
            bits |= HAS_METADATA_HANDLE;
        }
        if desc.is_constructor && !desc.is_static && ts.method_signature(m).is_empty() {
            bits |= IS_DEFAULT_CONSTRUCTOR;
        }
        if entry.dictionary.is_some() {
            bits |= REQUIRES_INST_ARG;
        }

        let mut items = vec![w.unsigned(bits)];

        items.push(match desc.token {
            Some(token) => w.unsigned(token),
            None => w.string(&desc.name),
        });

        let owner = ctx.ext_index_of(&ArtifactKey::necessary_type(desc.owner));
        items.push(w.unsigned(owner));

        if let Some(body) = entry.body {
            // Reflection calls on value types go through a boxed `this`.
            let stub = ArtifactKey::unboxing_stub(m);
            let sym = match ts.is_value_type(desc.owner)
                && !desc.is_static
                && entry.dictionary.is_none()
                && ctx.is_marked(&stub)
            {
                true => ctx.symbol_of(&stub),
                false => ctx.node_symbol(body),
            };

            items.push(w.unsigned(ctx.ext_index(sym)));
        }

        if generic {
            match entry.dictionary {
                Some(dict) => {
                    let sym = ctx.node_symbol(dict);
                    items.push(w.unsigned(ctx.ext_index(sym)));
                }
                None => {
                    let args = ts.method_instantiation(m);
                    items.push(w.unsigned(args.len() as u32));

                    for arg in args {
                        let index = ctx.ext_index_of(&ArtifactKey::necessary_type(arg));
                        items.push(w.unsigned(index));
                    }
                }
            }
        }

        let vertex = w.tuple(items);
        w.place(data, vertex);
        w.append(table, ts.hash_code(ts.canonical_form(desc.owner)), vertex);
    }

    debug!(entries = entries.len(), "reflection invoke map");
    finish_table(b, &w.save(), end)
}

pub fn emit_interface_gvm_table(ctx: &mut EmitContext, id: NodeId) -> ObjectData {
    let ts = ctx.ts();
    let b = ctx.node_builder(id, Section::ReadOnly);
    let end = end_symbol(ctx, id);

    let mut w = NativeWriter::new();
    let tables = w.new_section();
    let data = w.new_section();
    let table = w.hashtable();
    w.place(tables, table);

    // Group implementations by declaration,
    //   preserving the order in which declarations were first seen.
    let mut groups: Vec<(MethodId, Vec<(MethodId, _)>)> = Vec::new();
    for imp in ctx.gvm_impls {
        match groups.iter_mut().find(|(decl, _)| *decl == imp.decl) {
            Some((_, impls)) => impls.push((imp.implementation, imp.ty)),
            None => groups.push((imp.decl, vec![(imp.implementation, imp.ty)])),
        }
    }

    for (decl, impls) in &groups {
        let iface = ts.method(*decl).owner;

        let index = ctx.ext_index_of(&ArtifactKey::necessary_type(iface));
        let mut items = vec![w.unsigned(index)];
        items.push(method_handle(ctx, &mut w, *decl));
        items.push(w.unsigned(impls.len() as u32));

        for &(implementation, ty) in impls {
            let index = ctx.ext_index_of(&ArtifactKey::necessary_type(ty));
            items.push(w.unsigned(index));
            items.push(method_handle(ctx, &mut w, implementation));
        }

        let vertex = w.tuple(items);
        w.place(data, vertex);
        w.append(table, ts.hash_code(iface), vertex);
    }

    debug!(
        declarations = groups.len(),
        implementations = ctx.gvm_impls.len(),
        "interface GVM table"
    );
    finish_table(b, &w.save(), end)
}

/// Reference to a method by metadata token where one exists,
///   and otherwise by name.
///
/// Tokens are tagged in their low bit to distinguish the two.
fn method_handle(ctx: &EmitContext, w: &mut NativeWriter, method: MethodId) -> VertexId {
    let desc = ctx.ts().method(method);

    match desc.token {
        Some(token) => w.unsigned(token << 1 | 1),
        None => {
            let items = vec![w.unsigned(0), w.string(&desc.name)];
            w.tuple(items)
        }
    }
}
