// In-memory type system
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

//! An in-memory [`TypeSystem`].
//!
//! A [`Universe`] is populated up front using a [`UniverseBuilder`].
//! Instantiations,
//!   parameterized types,
//!   and methods on instantiated types are created lazily on first
//!   request and memoized,
//!     so that the same request always yields the same handle.
//!
//! Field layout is sequential in declaration order with natural
//!   alignment.
//! Reference types begin their instance data after the type descriptor
//!   pointer,
//!     so their instance byte count includes it;
//!   value types do not.
//!
//! ```
//! use aotc::session::PointerSize;
//! use aotc::ts::{universe::UniverseBuilder, PrimitiveKind, TypeSystem};
//!
//! let mut b = UniverseBuilder::new(PointerSize::Eight);
//! let int = b.primitive("System.Int32", PrimitiveKind::I4);
//! let point = b.structure("Point");
//! b.field(point, "X", int);
//! b.field(point, "Y", int);
//!
//! let ts = b.finish();
//! assert_eq!(8, ts.instance_byte_count(point));
//! ```

use super::{
    AttributeTarget, CustomAttribute, FieldDesc, FieldId, GenericParamKind,
    MethodDesc, MethodId, PrimitiveKind, TypeCategory, TypeId, TypeSystem,
    Variance,
};
use crate::session::PointerSize;
use fxhash::FxHashMap;
use std::cell::RefCell;

#[derive(Debug, Clone)]
struct TypeData {
    category: TypeCategory,
    name: String,
    def: TypeId,
    args: Vec<TypeId>,
    element: Option<TypeId>,
    base: Option<TypeId>,
    interfaces: Vec<TypeId>,
    variance: Vec<Variance>,
    fields: Vec<FieldId>,
    methods: Vec<MethodId>,
    finalizer: Option<MethodId>,
    nullable: bool,
    hfa: bool,
    module: bool,
    padding: u32,
    icastable: Option<(MethodId, MethodId)>,
    properties: Vec<(String, Option<MethodId>)>,
}

impl TypeData {
    fn new(id: TypeId, category: TypeCategory, name: String) -> Self {
        Self {
            category,
            name,
            def: id,
            args: Vec::new(),
            element: None,
            base: None,
            interfaces: Vec::new(),
            variance: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            finalizer: None,
            nullable: false,
            hfa: false,
            module: false,
            padding: 0,
            icastable: None,
            properties: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct MethodData {
    owner: TypeId,
    name: String,
    is_virtual: bool,
    is_abstract: bool,
    is_static: bool,
    is_pinvoke: bool,
    token: Option<u32>,
    def: MethodId,
    typical: MethodId,
    args: Vec<TypeId>,
    overrides: Option<MethodId>,
    implements: Vec<MethodId>,
    params: Vec<TypeId>,
}

#[derive(Debug, Clone)]
struct FieldData {
    owner: TypeId,
    name: String,
    ty: TypeId,
    is_static: bool,
    is_thread_static: bool,
}

#[derive(Debug, Clone, Default)]
struct Layout {
    instance_bytes: u32,
    align: u32,
    offsets: FxHashMap<FieldId, u32>,
}

/// Storage shared by the builder and the finished universe.
#[derive(Debug)]
struct Tables {
    ptr: PointerSize,
    canon: TypeId,
    array_base: Option<TypeId>,
    array_interfaces: Vec<TypeId>,
    types: Vec<TypeData>,
    methods: Vec<MethodData>,
    fields: Vec<FieldData>,
    insts: FxHashMap<(TypeId, Vec<TypeId>), TypeId>,
    arrays: FxHashMap<(TypeId, Option<u32>), TypeId>,
    indirections: FxHashMap<(TypeId, bool), TypeId>,
    generic_params: FxHashMap<(GenericParamKind, u32), TypeId>,
    method_insts: FxHashMap<(MethodId, Vec<TypeId>), MethodId>,
    methods_on: FxHashMap<(MethodId, TypeId), MethodId>,
    layouts: FxHashMap<TypeId, Layout>,
}

impl Tables {
    fn new(ptr: PointerSize) -> Self {
        let canon = TypeId::from_index(0);

        Self {
            ptr,
            canon,
            array_base: None,
            array_interfaces: Vec::new(),
            types: vec![TypeData::new(
                canon,
                TypeCategory::Canon,
                "System.__Canon".into(),
            )],
            methods: Vec::new(),
            fields: Vec::new(),
            insts: Default::default(),
            arrays: Default::default(),
            indirections: Default::default(),
            generic_params: Default::default(),
            method_insts: Default::default(),
            methods_on: Default::default(),
            layouts: Default::default(),
        }
    }

    fn ty(&self, ty: TypeId) -> &TypeData {
        &self.types[ty.index()]
    }

    fn ty_mut(&mut self, ty: TypeId) -> &mut TypeData {
        &mut self.types[ty.index()]
    }

    fn m(&self, method: MethodId) -> &MethodData {
        &self.methods[method.index()]
    }

    fn push_type(&mut self, category: TypeCategory, name: String) -> TypeId {
        let id = TypeId::from_index(self.types.len() as u32);
        self.types.push(TypeData::new(id, category, name));
        id
    }

    fn push_method(&mut self, data: MethodData) -> MethodId {
        let id = MethodId::from_index(self.methods.len() as u32);
        self.methods.push(data);
        id
    }

    fn push_field(&mut self, data: FieldData) -> FieldId {
        let id = FieldId::from_index(self.fields.len() as u32);
        let owner = data.owner;
        self.fields.push(data);
        self.ty_mut(owner).fields.push(id);
        id
    }

    fn generic_param(&mut self, kind: GenericParamKind, index: u32) -> TypeId {
        if let Some(&id) = self.generic_params.get(&(kind, index)) {
            return id;
        }

        let name = match kind {
            GenericParamKind::Type => format!("T{index}"),
            GenericParamKind::Method => format!("M{index}"),
        };

        let id = self
            .push_type(TypeCategory::GenericParameter(kind, index), name);
        self.generic_params.insert((kind, index), id);
        id
    }

    fn array(&mut self, elem: TypeId, rank: Option<u32>) -> TypeId {
        if let Some(&id) = self.arrays.get(&(elem, rank)) {
            return id;
        }

        let (category, suffix) = match rank {
            None => (TypeCategory::SzArray, "[]".to_string()),
            Some(r) => (
                TypeCategory::MdArray(r),
                format!("[{}]", ",".repeat(r.saturating_sub(1) as usize)),
            ),
        };

        let name = format!("{}{}", self.ty(elem).name, suffix);
        let id = self.push_type(category, name);
        self.arrays.insert((elem, rank), id);

        let base = self.array_base;
        let ifaces = match rank {
            None => self
                .array_interfaces
                .clone()
                .into_iter()
                .map(|def| self.instantiate(def, &[elem]))
                .collect(),
            Some(_) => Vec::new(),
        };

        let data = self.ty_mut(id);
        data.element = Some(elem);
        data.base = base;
        data.interfaces = ifaces;

        id
    }

    fn indirection(&mut self, elem: TypeId, byref: bool) -> TypeId {
        if let Some(&id) = self.indirections.get(&(elem, byref)) {
            return id;
        }

        let (category, suffix) = match byref {
            true => (TypeCategory::ByRef, "&"),
            false => (TypeCategory::Pointer, "*"),
        };

        let name = format!("{}{}", self.ty(elem).name, suffix);
        let id = self.push_type(category, name);
        self.ty_mut(id).element = Some(elem);
        self.indirections.insert((elem, byref), id);
        id
    }

    fn instantiate(&mut self, def: TypeId, args: &[TypeId]) -> TypeId {
        let def = self.ty(def).def;

        if self.ty(def).args == args {
            return def;
        }

        let key = (def, args.to_vec());
        if let Some(&id) = self.insts.get(&key) {
            return id;
        }

        let src = self.ty(def).clone();
        let id = self.push_type(src.category, src.name.clone());
        self.insts.insert(key, id);

        let base = src.base.map(|b| self.subst(b, args, &[]));
        let interfaces = src
            .interfaces
            .iter()
            .map(|&i| self.subst(i, args, &[]))
            .collect();

        {
            let data = self.ty_mut(id);
            data.def = def;
            data.args = args.to_vec();
            data.base = base;
            data.interfaces = interfaces;
            data.variance = src.variance.clone();
            data.nullable = src.nullable;
            data.hfa = src.hfa;
            data.padding = src.padding;
            data.properties = src.properties.clone();
        }

        for f in src.fields {
            let fdata = self.fields[f.index()].clone();
            let fty = self.subst(fdata.ty, args, &[]);

            self.push_field(FieldData {
                owner: id,
                ty: fty,
                ..fdata
            });
        }

        let finalizer = src.finalizer.map(|m| self.method_on(m, id));
        let icastable = src
            .icastable
            .map(|(a, b)| (self.method_on(a, id), self.method_on(b, id)));

        let data = self.ty_mut(id);
        data.finalizer = finalizer;
        data.icastable = icastable;

        id
    }

    fn subst(
        &mut self,
        ty: TypeId,
        targs: &[TypeId],
        margs: &[TypeId],
    ) -> TypeId {
        let data = self.ty(ty);
        let category = data.category;

        match category {
            TypeCategory::GenericParameter(kind, index) => {
                let args = match kind {
                    GenericParamKind::Type => targs,
                    GenericParamKind::Method => margs,
                };

                args.get(index as usize).copied().unwrap_or(ty)
            }

            TypeCategory::SzArray | TypeCategory::MdArray(_) => {
                let rank = match category {
                    TypeCategory::MdArray(r) => Some(r),
                    _ => None,
                };
                let elem = data.element.unwrap_or(ty);
                let sub = self.subst(elem, targs, margs);
                self.array(sub, rank)
            }

            TypeCategory::Pointer | TypeCategory::ByRef => {
                let byref = category == TypeCategory::ByRef;
                let elem = data.element.unwrap_or(ty);
                let sub = self.subst(elem, targs, margs);
                self.indirection(sub, byref)
            }

            _ if !data.args.is_empty() => {
                let def = data.def;
                let args = data.args.clone();
                let subbed = args
                    .into_iter()
                    .map(|a| self.subst(a, targs, margs))
                    .collect::<Vec<_>>();

                self.instantiate(def, &subbed)
            }

            _ => ty,
        }
    }

    fn is_reference(&self, ty: TypeId) -> bool {
        self.ty(ty).category.is_reference()
    }

    fn canonical_arg(&mut self, ty: TypeId) -> TypeId {
        match self.ty(ty).category {
            TypeCategory::GenericParameter(..) => ty,
            _ if self.is_reference(ty) => self.canon,
            _ => self.canonical(ty),
        }
    }

    fn canonical(&mut self, ty: TypeId) -> TypeId {
        let data = self.ty(ty);
        let category = data.category;

        match category {
            TypeCategory::SzArray | TypeCategory::MdArray(_) => {
                let rank = match category {
                    TypeCategory::MdArray(r) => Some(r),
                    _ => None,
                };
                let elem = data.element.unwrap_or(ty);
                let sub = self.canonical_arg(elem);
                self.array(sub, rank)
            }

            _ if !data.args.is_empty() && data.def != ty => {
                let def = data.def;
                let args = data.args.clone();
                let canon = args
                    .into_iter()
                    .map(|a| self.canonical_arg(a))
                    .collect::<Vec<_>>();

                self.instantiate(def, &canon)
            }

            _ => ty,
        }
    }

    fn any_part(&self, ty: TypeId, pred: &dyn Fn(&TypeData) -> bool) -> bool {
        let data = self.ty(ty);

        pred(data)
            || data.args.iter().any(|&a| a != ty && self.any_part(a, pred))
            || data.element.map_or(false, |e| self.any_part(e, pred))
    }

    fn methods_of(&mut self, ty: TypeId) -> Vec<MethodId> {
        let def = self.ty(ty).def;

        if def == ty {
            return self.ty(ty).methods.clone();
        }

        self.ty(def)
            .methods
            .clone()
            .into_iter()
            .map(|m| self.method_on(m, ty))
            .collect()
    }

    fn method_on(&mut self, method: MethodId, owner: TypeId) -> MethodId {
        let data = self.m(method);
        let typical = data.typical;
        let inst_args =
            (data.def != method).then(|| data.args.clone()).unwrap_or_default();

        let on = if self.m(typical).owner == owner {
            typical
        } else if let Some(&id) = self.methods_on.get(&(typical, owner)) {
            id
        } else {
            let src = self.m(typical).clone();
            let targs = self.ty(owner).args.clone();
            let params = src
                .params
                .iter()
                .map(|&p| self.subst(p, &targs, &[]))
                .collect();

            let id = MethodId::from_index(self.methods.len() as u32);
            self.push_method(MethodData {
                owner,
                def: id,
                params,
                ..src
            });
            self.methods_on.insert((typical, owner), id);
            id
        };

        match inst_args.is_empty() {
            true => on,
            false => self.instantiate_method(on, &inst_args),
        }
    }

    fn instantiate_method(&mut self, def: MethodId, args: &[TypeId]) -> MethodId {
        let def = self.m(def).def;

        if self.m(def).args == args {
            return def;
        }

        let key = (def, args.to_vec());
        if let Some(&id) = self.method_insts.get(&key) {
            return id;
        }

        let src = self.m(def).clone();
        let targs = self.ty(src.owner).args.clone();
        let params = src
            .params
            .iter()
            .map(|&p| self.subst(p, &targs, args))
            .collect();

        let id = self.push_method(MethodData {
            args: args.to_vec(),
            params,
            ..src
        });
        self.method_insts.insert(key, id);
        id
    }

    fn canonical_method(&mut self, method: MethodId) -> MethodId {
        let data = self.m(method).clone();
        let owner = self.canonical(data.owner);
        let on = self.method_on(data.typical, owner);

        match data.def != method {
            true => {
                let args = data
                    .args
                    .into_iter()
                    .map(|a| self.canonical_arg(a))
                    .collect::<Vec<_>>();
                self.instantiate_method(on, &args)
            }
            false => on,
        }
    }

    fn field_size(&mut self, ty: TypeId) -> (u32, u32) {
        let ptr = self.ptr.bytes();

        match self.ty(ty).category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                let size = kind.size(self.ptr);
                (size, size)
            }
            TypeCategory::Struct => {
                let layout = self.layout(ty);
                (layout.instance_bytes, layout.align)
            }
            _ => (ptr, ptr),
        }
    }

    fn layout(&mut self, ty: TypeId) -> Layout {
        if let Some(layout) = self.layouts.get(&ty) {
            return layout.clone();
        }

        let ptr = self.ptr.bytes();
        let data = self.ty(ty).clone();

        let (mut cur, mut align) = match data.category {
            TypeCategory::Struct => (0, 1),
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                let size = kind.size(self.ptr);
                (size, size)
            }
            TypeCategory::String => (ptr + 4, ptr),
            _ => match data.base {
                Some(base) => (self.layout(base).instance_bytes, ptr),
                None => (ptr, ptr),
            },
        };

        let mut offsets = FxHashMap::default();
        let (mut statics, mut gc_statics, mut thread_statics) = (0, 0, 0);

        for f in data.fields {
            let fdata = self.fields[f.index()].clone();
            let (size, falign) = self.field_size(fdata.ty);

            if fdata.is_static {
                let boxed = self.is_reference(fdata.ty)
                    || self.struct_has_pointers(fdata.ty);

                let region = match (fdata.is_thread_static, boxed) {
                    (true, _) => &mut thread_statics,
                    (false, true) => &mut gc_statics,
                    (false, false) => &mut statics,
                };

                let size = if boxed { ptr } else { size };
                let falign = if boxed { ptr } else { falign.max(1) };

                *region = align_to(*region, falign);
                offsets.insert(f, *region);
                *region += size;
                continue;
            }

            cur = align_to(cur, falign.max(1));
            offsets.insert(f, cur);
            cur += size;
            align = align.max(falign.min(ptr));
        }

        let instance_bytes = match data.category {
            TypeCategory::Struct => align_to(cur.max(1), align) + data.padding,
            _ => cur,
        };

        let layout = Layout {
            instance_bytes,
            align,
            offsets,
        };

        self.layouts.insert(ty, layout.clone());
        layout
    }

    fn struct_has_pointers(&mut self, ty: TypeId) -> bool {
        if self.ty(ty).category != TypeCategory::Struct {
            return false;
        }

        self.ty(ty).fields.clone().into_iter().any(|f| {
            let fdata = self.fields[f.index()].clone();
            !fdata.is_static
                && (self.is_reference(fdata.ty)
                    || self.struct_has_pointers(fdata.ty))
        })
    }

    fn hash(&self, ty: TypeId) -> u32 {
        let data = self.ty(ty);

        let base = match data.element {
            Some(elem) => {
                let rank = match data.category {
                    TypeCategory::MdArray(r) => r,
                    TypeCategory::SzArray => 1,
                    TypeCategory::Pointer => 0x4000,
                    _ => 0x8000,
                };
                combine_hash(self.hash(elem), rank)
            }
            None => fxhash::hash32(data.name.as_bytes()),
        };

        match data.def != ty {
            true => data
                .args
                .iter()
                .fold(base, |h, &a| combine_hash(h, self.hash(a))),
            false => base,
        }
    }

    fn runtime_interfaces(&mut self, ty: TypeId) -> Vec<TypeId> {
        let data = self.ty(ty).clone();
        let mut ifaces = match data.base {
            Some(base) => self.runtime_interfaces(base),
            None => Vec::new(),
        };

        for iface in data.interfaces {
            for inherited in self.runtime_interfaces(iface) {
                if !ifaces.contains(&inherited) {
                    ifaces.push(inherited);
                }
            }

            if !ifaces.contains(&iface) {
                ifaces.push(iface);
            }
        }

        ifaces
    }

    fn chain(&self, ty: TypeId) -> Vec<TypeId> {
        let mut chain = vec![ty];
        let mut cur = ty;

        while let Some(base) = self.ty(cur).base {
            chain.push(base);
            cur = base;
        }

        chain
    }

    fn inst_args_of(&self, method: MethodId) -> Option<Vec<TypeId>> {
        let data = self.m(method);
        (data.def != method).then(|| data.args.clone())
    }

    fn with_inst(&mut self, found: MethodId, args: Option<Vec<TypeId>>) -> MethodId {
        match args {
            Some(args) => self.instantiate_method(found, &args),
            None => found,
        }
    }

    fn find_virtual_target(
        &mut self,
        ty: TypeId,
        decl: MethodId,
    ) -> Option<MethodId> {
        let typical = self.m(self.m(decl).def).typical;
        let slot = self.m(typical).overrides.unwrap_or(typical);
        let args = self.inst_args_of(decl);

        for t in self.chain(ty) {
            for m in self.methods_of(t) {
                let typical = self.m(m).typical;

                if typical == slot || self.m(typical).overrides == Some(slot) {
                    return Some(self.with_inst(m, args));
                }
            }
        }

        None
    }

    fn resolve_interface_method(
        &mut self,
        ty: TypeId,
        iface_method: MethodId,
    ) -> Option<MethodId> {
        let slot = self.m(self.m(iface_method).def).typical;
        let args = self.inst_args_of(iface_method);
        let (name, arity) = {
            let data = self.m(slot);
            (data.name.clone(), data.params.len())
        };

        let chain = self.chain(ty);

        for &t in &chain {
            for m in self.methods_of(t) {
                let typical = self.m(m).typical;

                if self.m(typical).implements.contains(&slot) {
                    return Some(self.with_inst(m, args));
                }
            }
        }

        for &t in &chain {
            for m in self.methods_of(t) {
                let data = self.m(m);

                if data.is_virtual
                    && !data.is_static
                    && data.name == name
                    && data.params.len() == arity
                    && !self.ty(data.owner).category.is_interface()
                {
                    return Some(self.with_inst(m, args));
                }
            }
        }

        None
    }
}

fn align_to(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

fn combine_hash(h1: u32, h2: u32) -> u32 {
    (h1.rotate_left(5).wrapping_add(h1)) ^ h2
}

/// Populates a [`Universe`].
///
/// Definitions must be complete before [`UniverseBuilder::finish`];
///   only derived entities
///     (instantiations, arrays, methods on instantiations)
///     are created afterward.
pub struct UniverseBuilder {
    tables: Tables,
    attributes: FxHashMap<AttributeTarget, Vec<CustomAttribute>>,
    names: FxHashMap<String, TypeId>,
}

impl UniverseBuilder {
    pub fn new(ptr: PointerSize) -> Self {
        Self {
            tables: Tables::new(ptr),
            attributes: Default::default(),
            names: Default::default(),
        }
    }

    /// Define a new type.
    pub fn define(&mut self, category: TypeCategory, name: &str) -> TypeId {
        let id = self.tables.push_type(category, name.into());
        self.names.insert(name.into(), id);
        id
    }

    pub fn class(&mut self, name: &str) -> TypeId {
        self.define(TypeCategory::Class, name)
    }

    pub fn structure(&mut self, name: &str) -> TypeId {
        self.define(TypeCategory::Struct, name)
    }

    pub fn interface(&mut self, name: &str) -> TypeId {
        self.define(TypeCategory::Interface, name)
    }

    pub fn primitive(&mut self, name: &str, kind: PrimitiveKind) -> TypeId {
        self.define(TypeCategory::Primitive(kind), name)
    }

    pub fn canon(&self) -> TypeId {
        self.tables.canon
    }

    pub fn type_param(&mut self, index: u32) -> TypeId {
        self.tables.generic_param(GenericParamKind::Type, index)
    }

    pub fn method_param(&mut self, index: u32) -> TypeId {
        self.tables.generic_param(GenericParamKind::Method, index)
    }

    pub fn sz_array(&mut self, elem: TypeId) -> TypeId {
        self.tables.array(elem, None)
    }

    pub fn md_array(&mut self, elem: TypeId, rank: u32) -> TypeId {
        self.tables.array(elem, Some(rank))
    }

    pub fn pointer(&mut self, elem: TypeId) -> TypeId {
        self.tables.indirection(elem, false)
    }

    pub fn byref(&mut self, elem: TypeId) -> TypeId {
        self.tables.indirection(elem, true)
    }

    pub fn instantiate(&mut self, def: TypeId, args: &[TypeId]) -> TypeId {
        self.tables.instantiate(def, args)
    }

    pub fn extends(&mut self, ty: TypeId, base: TypeId) {
        self.tables.ty_mut(ty).base = Some(base);
    }

    pub fn implements(&mut self, ty: TypeId, iface: TypeId) {
        self.tables.ty_mut(ty).interfaces.push(iface);
    }

    /// Make `ty` a generic definition with parameters of the given
    ///   variance,
    ///     returning the formal parameter types.
    pub fn generic(&mut self, ty: TypeId, variance: &[Variance]) -> Vec<TypeId> {
        let params = (0..variance.len() as u32)
            .map(|i| self.type_param(i))
            .collect::<Vec<_>>();

        let data = self.tables.ty_mut(ty);
        data.args = params.clone();
        data.variance = variance.to_vec();
        params
    }

    fn add_field(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
        is_static: bool,
        is_thread_static: bool,
    ) -> FieldId {
        self.tables.push_field(FieldData {
            owner,
            name: name.into(),
            ty,
            is_static,
            is_thread_static,
        })
    }

    pub fn field(&mut self, owner: TypeId, name: &str, ty: TypeId) -> FieldId {
        self.add_field(owner, name, ty, false, false)
    }

    pub fn static_field(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
    ) -> FieldId {
        self.add_field(owner, name, ty, true, false)
    }

    pub fn thread_static_field(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
    ) -> FieldId {
        self.add_field(owner, name, ty, true, true)
    }

    pub fn method(&mut self, owner: TypeId, name: &str) -> MethodBuilder<'_> {
        MethodBuilder {
            builder: self,
            data: MethodData {
                owner,
                name: name.into(),
                is_virtual: false,
                is_abstract: false,
                is_static: false,
                is_pinvoke: false,
                token: None,
                def: MethodId::from_index(0),
                typical: MethodId::from_index(0),
                args: Vec::new(),
                overrides: None,
                implements: Vec::new(),
                params: Vec::new(),
            },
        }
    }

    pub fn finalizer(&mut self, ty: TypeId, method: MethodId) {
        self.tables.ty_mut(ty).finalizer = Some(method);
    }

    pub fn nullable(&mut self, ty: TypeId) {
        self.tables.ty_mut(ty).nullable = true;
    }

    pub fn hfa(&mut self, ty: TypeId) {
        self.tables.ty_mut(ty).hfa = true;
    }

    pub fn module_type(&mut self, ty: TypeId) {
        self.tables.ty_mut(ty).module = true;
    }

    pub fn padding(&mut self, ty: TypeId, bytes: u32) {
        self.tables.ty_mut(ty).padding = bytes;
    }

    pub fn icastable(&mut self, ty: TypeId, is_inst: MethodId, get_impl: MethodId) {
        self.tables.ty_mut(ty).icastable = Some((is_inst, get_impl));
    }

    pub fn property(&mut self, ty: TypeId, name: &str, setter: Option<MethodId>) {
        self.tables
            .ty_mut(ty)
            .properties
            .push((name.into(), setter));
    }

    pub fn attribute(
        &mut self,
        target: AttributeTarget,
        constructor: Option<MethodId>,
        blob: Vec<u8>,
    ) {
        self.attributes
            .entry(target)
            .or_default()
            .push(CustomAttribute { constructor, blob });
    }

    /// Base type of every array type.
    pub fn array_base(&mut self, ty: TypeId) {
        self.tables.array_base = Some(ty);
    }

    /// Generic interface definition implemented by single-dimensional
    ///   arrays over their element type.
    pub fn array_interface(&mut self, def: TypeId) {
        self.tables.array_interfaces.push(def);
    }

    pub fn finish(self) -> Universe {
        Universe {
            tables: RefCell::new(self.tables),
            attributes: self.attributes,
            names: self.names,
        }
    }
}

/// Fluent definition of a method.
///
/// See [`UniverseBuilder::method`].
pub struct MethodBuilder<'b> {
    builder: &'b mut UniverseBuilder,
    data: MethodData,
}

impl<'b> MethodBuilder<'b> {
    /// Introduce a new virtual slot.
    pub fn virtual_slot(mut self) -> Self {
        self.data.is_virtual = true;
        self
    }

    /// Introduce a new abstract virtual slot.
    pub fn abstract_slot(mut self) -> Self {
        self.data.is_virtual = true;
        self.data.is_abstract = true;
        self
    }

    /// Override the slot introduced by `decl`
    ///   (or the slot `decl` itself overrides).
    pub fn overriding(mut self, decl: MethodId) -> Self {
        let tables = &self.builder.tables;
        let slot = tables.m(decl).overrides.unwrap_or(tables.m(decl).typical);

        self.data.is_virtual = true;
        self.data.overrides = Some(slot);
        self
    }

    /// Explicitly implement an interface method.
    pub fn implementing(mut self, iface_method: MethodId) -> Self {
        self.data.is_virtual = true;
        self.data.implements.push(iface_method);
        self
    }

    pub fn static_method(mut self) -> Self {
        self.data.is_static = true;
        self
    }

    pub fn pinvoke(mut self) -> Self {
        self.data.is_pinvoke = true;
        self
    }

    pub fn token(mut self, token: u32) -> Self {
        self.data.token = Some(token);
        self
    }

    pub fn params(mut self, params: &[TypeId]) -> Self {
        self.data.params = params.to_vec();
        self
    }

    /// Make this a generic method with `count` method type parameters.
    pub fn generic(mut self, count: u32) -> Self {
        self.data.args = (0..count)
            .map(|i| self.builder.method_param(i))
            .collect();
        self
    }

    pub fn build(self) -> MethodId {
        let tables = &mut self.builder.tables;
        let owner = self.data.owner;
        let id = MethodId::from_index(tables.methods.len() as u32);

        tables.push_method(MethodData {
            def: id,
            typical: id,
            ..self.data
        });
        tables.ty_mut(owner).methods.push(id);
        id
    }
}

/// A populated in-memory type system.
///
/// See the [module-level documentation](self).
#[derive(Debug)]
pub struct Universe {
    tables: RefCell<Tables>,
    attributes: FxHashMap<AttributeTarget, Vec<CustomAttribute>>,
    names: FxHashMap<String, TypeId>,
}

impl Universe {
    pub fn canon(&self) -> TypeId {
        self.tables.borrow().canon
    }

    pub fn sz_array(&self, elem: TypeId) -> TypeId {
        self.tables.borrow_mut().array(elem, None)
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.names.get(name).copied()
    }
}

impl TypeSystem for Universe {
    fn category(&self, ty: TypeId) -> TypeCategory {
        self.tables.borrow().ty(ty).category
    }

    fn name(&self, ty: TypeId) -> String {
        self.tables.borrow().ty(ty).name.clone()
    }

    fn base_type(&self, ty: TypeId) -> Option<TypeId> {
        self.tables.borrow().ty(ty).base
    }

    fn runtime_interfaces(&self, ty: TypeId) -> Vec<TypeId> {
        self.tables.borrow_mut().runtime_interfaces(ty)
    }

    fn element_type(&self, ty: TypeId) -> Option<TypeId> {
        self.tables.borrow().ty(ty).element
    }

    fn type_definition(&self, ty: TypeId) -> TypeId {
        self.tables.borrow().ty(ty).def
    }

    fn instantiation(&self, ty: TypeId) -> Vec<TypeId> {
        self.tables.borrow().ty(ty).args.clone()
    }

    fn is_generic_definition(&self, ty: TypeId) -> bool {
        let tables = self.tables.borrow();
        let data = tables.ty(ty);
        data.def == ty && !data.args.is_empty()
    }

    fn variance(&self, def: TypeId, index: usize) -> Variance {
        let tables = self.tables.borrow();
        let def = tables.ty(def).def;

        tables
            .ty(def)
            .variance
            .get(index)
            .copied()
            .unwrap_or(Variance::NonVariant)
    }

    fn fields(&self, ty: TypeId) -> Vec<FieldId> {
        self.tables.borrow().ty(ty).fields.clone()
    }

    fn field(&self, field: FieldId) -> FieldDesc {
        let mut tables = self.tables.borrow_mut();
        let data = tables.fields[field.index()].clone();
        let layout = tables.layout(data.owner);

        FieldDesc {
            owner: data.owner,
            name: data.name,
            ty: data.ty,
            offset: layout.offsets.get(&field).copied().unwrap_or(0),
            is_static: data.is_static,
            is_thread_static: data.is_thread_static,
        }
    }

    fn instance_byte_count(&self, ty: TypeId) -> u32 {
        self.tables.borrow_mut().layout(ty).instance_bytes
    }

    fn value_type_field_padding(&self, ty: TypeId) -> u32 {
        self.tables.borrow().ty(ty).padding
    }

    fn instance_field_alignment(&self, ty: TypeId) -> u32 {
        self.tables.borrow_mut().layout(ty).align
    }

    fn hash_code(&self, ty: TypeId) -> u32 {
        self.tables.borrow().hash(ty)
    }

    fn static_constructor(&self, ty: TypeId) -> Option<MethodId> {
        let mut tables = self.tables.borrow_mut();

        tables.methods_of(ty).into_iter().find(|&m| {
            let data = tables.m(m);
            data.is_static && data.name == ".cctor"
        })
    }

    fn finalizer(&self, ty: TypeId) -> Option<MethodId> {
        let tables = self.tables.borrow();

        tables
            .chain(ty)
            .into_iter()
            .find_map(|t| tables.ty(t).finalizer)
    }

    fn default_constructor(&self, ty: TypeId) -> Option<MethodId> {
        let mut tables = self.tables.borrow_mut();

        tables.methods_of(ty).into_iter().find(|&m| {
            let data = tables.m(m);
            !data.is_static && data.name == ".ctor" && data.params.is_empty()
        })
    }

    fn methods(&self, ty: TypeId) -> Vec<MethodId> {
        self.tables.borrow_mut().methods_of(ty)
    }

    fn virtual_slots(&self, ty: TypeId) -> Vec<MethodId> {
        let mut tables = self.tables.borrow_mut();

        tables
            .methods_of(ty)
            .into_iter()
            .filter(|&m| {
                let data = tables.m(m);
                data.is_virtual && data.overrides.is_none() && data.args.is_empty()
            })
            .collect()
    }

    fn find_virtual_target(
        &self,
        ty: TypeId,
        decl: MethodId,
    ) -> Option<MethodId> {
        self.tables.borrow_mut().find_virtual_target(ty, decl)
    }

    fn resolve_interface_method(
        &self,
        ty: TypeId,
        iface_method: MethodId,
    ) -> Option<MethodId> {
        self.tables
            .borrow_mut()
            .resolve_interface_method(ty, iface_method)
    }

    fn is_nullable(&self, ty: TypeId) -> bool {
        self.tables.borrow().ty(ty).nullable
    }

    fn is_hfa(&self, ty: TypeId) -> bool {
        self.tables.borrow().ty(ty).hfa
    }

    fn icastable_methods(&self, ty: TypeId) -> Option<(MethodId, MethodId)> {
        self.tables.borrow().ty(ty).icastable
    }

    fn is_module_type(&self, ty: TypeId) -> bool {
        self.tables.borrow().ty(ty).module
    }

    fn instantiate_type(&self, def: TypeId, args: &[TypeId]) -> TypeId {
        self.tables.borrow_mut().instantiate(def, args)
    }

    fn substitute(
        &self,
        ty: TypeId,
        type_args: &[TypeId],
        method_args: &[TypeId],
    ) -> TypeId {
        self.tables.borrow_mut().subst(ty, type_args, method_args)
    }

    fn canonical_form(&self, ty: TypeId) -> TypeId {
        self.tables.borrow_mut().canonical(ty)
    }

    fn is_canonical_subtype(&self, ty: TypeId) -> bool {
        self.tables
            .borrow()
            .any_part(ty, &|d| d.category == TypeCategory::Canon)
    }

    fn is_runtime_determined(&self, ty: TypeId) -> bool {
        self.tables.borrow().any_part(ty, &|d| {
            matches!(d.category, TypeCategory::GenericParameter(..))
        })
    }

    fn method(&self, method: MethodId) -> MethodDesc {
        let tables = self.tables.borrow();
        let data = tables.m(method);

        MethodDesc {
            owner: data.owner,
            name: data.name.clone(),
            is_virtual: data.is_virtual,
            is_abstract: data.is_abstract,
            is_static: data.is_static,
            is_constructor: data.name == ".ctor",
            is_pinvoke: data.is_pinvoke,
            token: data.token,
        }
    }

    fn method_instantiation(&self, method: MethodId) -> Vec<TypeId> {
        self.tables.borrow().m(method).args.clone()
    }

    fn method_definition(&self, method: MethodId) -> MethodId {
        self.tables.borrow().m(method).def
    }

    fn instantiate_method(&self, def: MethodId, args: &[TypeId]) -> MethodId {
        self.tables.borrow_mut().instantiate_method(def, args)
    }

    fn method_on_type(&self, method: MethodId, owner: TypeId) -> MethodId {
        self.tables.borrow_mut().method_on(method, owner)
    }

    fn canonical_method(&self, method: MethodId) -> MethodId {
        self.tables.borrow_mut().canonical_method(method)
    }

    fn method_signature(&self, method: MethodId) -> Vec<TypeId> {
        self.tables.borrow().m(method).params.clone()
    }

    fn custom_attributes(&self, target: AttributeTarget) -> Vec<CustomAttribute> {
        let target = match target {
            AttributeTarget::Type(ty) => {
                AttributeTarget::Type(self.type_definition(ty))
            }
            other => other,
        };

        self.attributes.get(&target).cloned().unwrap_or_default()
    }

    fn resolve_type_name(&self, name: &str) -> Option<TypeId> {
        self.lookup(name)
    }

    fn property_setter(
        &self,
        ty: TypeId,
        name: &str,
    ) -> Option<Option<MethodId>> {
        let mut tables = self.tables.borrow_mut();
        let (_, setter) = tables
            .ty(ty)
            .properties
            .iter()
            .find(|(pname, _)| pname == name)
            .cloned()?;

        Some(setter.map(|s| tables.method_on(s, ty)))
    }
}
