// Symbol name mangling
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

//! Mangled names for types and methods.
//!
//! Every node of the dependency graph is identified in the object file by
//!   a symbol derived from the type or method it represents.
//! Those symbols must be valid identifiers for every object file format
//!   and assembler we target,
//!     so names are sanitized to `[A-Za-z0-9_]`
//!       (prefixing a leading digit with `_`),
//!   and structure that would otherwise be lost by sanitization is
//!   expressed using a small nested syntax:
//!
//!   - instantiations are written `Def<A__B>`;
//!   - single-dimensional arrays `Elem__<Array>`,
//!       and multi-dimensional arrays `Elem__<ArrayRankN>`;
//!   - pointers `Elem<Pointer>` and byrefs `Elem<ByRef>`;
//!   - methods `Owner__Name`,
//!       followed by `<A__B>` for instantiated generic methods.
//!
//! Sanitization is lossy,
//!   so two distinct definitions may produce the same name.
//! The first definition to claim a name keeps it and later ones receive
//!   a `_N` suffix,
//!     with `N` counting up from `0` until the name is unique.
//! Methods are disambiguated the same way,
//!   but only among the methods of the same owning type,
//!   since the owner is already part of the method's name.
//!
//! Names are memoized for the life of the [`NameMangler`],
//!   so a given type or method always mangles to the same name within a
//!   compilation.

use crate::ts::{MethodId, TypeCategory, TypeId, TypeSystem};
use fxhash::{FxHashMap, FxHashSet};

/// Produces and memoizes mangled names.
#[derive(Debug, Default)]
pub struct NameMangler {
    /// Mangled names of type definitions
    ///   (after disambiguation).
    definitions: FxHashMap<TypeId, String>,

    /// Every definition name handed out so far.
    claimed: FxHashSet<String>,

    /// Mangled names of fully constructed types.
    types: FxHashMap<TypeId, String>,

    /// Disambiguated method names keyed by typical method definition.
    method_names: FxHashMap<MethodId, String>,

    /// Fully mangled method names.
    methods: FxHashMap<MethodId, String>,
}

impl NameMangler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mangled name of a type.
    pub fn type_name(&mut self, ts: &dyn TypeSystem, ty: TypeId) -> String {
        if let Some(name) = self.types.get(&ty) {
            return name.clone();
        }

        let name = self.compute_type_name(ts, ty);
        self.types.insert(ty, name.clone());
        name
    }

    fn compute_type_name(&mut self, ts: &dyn TypeSystem, ty: TypeId) -> String {
        match ts.category(ty) {
            TypeCategory::SzArray => {
                let elem = self.element_name(ts, ty);
                format!("{elem}__<Array>")
            }
            TypeCategory::MdArray(rank) => {
                let elem = self.element_name(ts, ty);
                format!("{elem}__<ArrayRank{rank}>")
            }
            TypeCategory::Pointer => {
                let elem = self.element_name(ts, ty);
                format!("{elem}<Pointer>")
            }
            TypeCategory::ByRef => {
                let elem = self.element_name(ts, ty);
                format!("{elem}<ByRef>")
            }
            _ => {
                let def = ts.type_definition(ty);
                let def_name = self.definition_name(ts, def);

                match def == ty {
                    true => def_name,
                    false => {
                        let args = ts.instantiation(ty);
                        format!("{def_name}<{}>", self.join(ts, &args))
                    }
                }
            }
        }
    }

    fn element_name(&mut self, ts: &dyn TypeSystem, ty: TypeId) -> String {
        match ts.element_type(ty) {
            Some(elem) => self.type_name(ts, elem),
            None => sanitize(&ts.name(ty)),
        }
    }

    fn join(&mut self, ts: &dyn TypeSystem, args: &[TypeId]) -> String {
        args.iter()
            .map(|&arg| self.type_name(ts, arg))
            .collect::<Vec<_>>()
            .join("__")
    }

    fn definition_name(&mut self, ts: &dyn TypeSystem, def: TypeId) -> String {
        if let Some(name) = self.definitions.get(&def) {
            return name.clone();
        }

        let name = disambiguate(&self.claimed, sanitize(&ts.name(def)));
        self.claimed.insert(name.clone());
        self.definitions.insert(def, name.clone());
        name
    }

    /// Mangled name of a method,
    ///   qualified by its owning type.
    pub fn method_name(&mut self, ts: &dyn TypeSystem, method: MethodId) -> String {
        if let Some(name) = self.methods.get(&method) {
            return name.clone();
        }

        let desc = ts.method(method);
        let owner = self.type_name(ts, desc.owner);
        let unqualified = self.unqualified_method_name(ts, method);

        let name = match ts.method_definition(method) == method {
            true => format!("{owner}__{unqualified}"),
            false => {
                let args = ts.method_instantiation(method);
                format!("{owner}__{unqualified}<{}>", self.join(ts, &args))
            }
        };

        self.methods.insert(method, name.clone());
        name
    }

    /// Name of a method disambiguated among the methods of the typical
    ///   definition of its owner.
    fn unqualified_method_name(
        &mut self,
        ts: &dyn TypeSystem,
        method: MethodId,
    ) -> String {
        let owner = ts.type_definition(ts.method(method).owner);
        let typical = self.typical_method(ts, method);

        if let Some(name) = self.method_names.get(&typical) {
            return name.clone();
        }

        // All methods of the owner are named at once so that the suffixes
        //   depend only on declaration order,
        //     not on the order in which methods are requested.
        let mut seen = FxHashSet::default();
        for m in ts.methods(owner) {
            let name = disambiguate(&seen, sanitize(&ts.method(m).name));
            seen.insert(name.clone());
            self.method_names.insert(m, name);
        }

        self.method_names
            .get(&typical)
            .cloned()
            .unwrap_or_else(|| sanitize(&ts.method(method).name))
    }

    /// The method on the owner's type definition corresponding to
    ///   `method`.
    fn typical_method(&self, ts: &dyn TypeSystem, method: MethodId) -> MethodId {
        let def = ts.method_definition(method);
        let owner = ts.type_definition(ts.method(def).owner);

        ts.method_on_type(def, owner)
    }
}

/// Replace every character outside of `[A-Za-z0-9_]` with `_`,
///   prefixing the result with `_` if it would otherwise begin with a
///   digit.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        out.push('_');
    }

    out.extend(name.chars().map(|c| match c {
        'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => c,
        _ => '_',
    }));

    out
}

fn disambiguate(taken: &FxHashSet<String>, name: String) -> String {
    if !taken.contains(&name) {
        return name;
    }

    let mut n = 0;
    loop {
        let candidate = format!("{name}_{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
