// Tests for object data emission
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


use super::{
    dispatch::{dispatch_map_entries, interface_slot},
    statics::statics_layout,
    *,
};
use crate::{
    codegen::ScriptedCodegen,
    compilation::Compilation,
    deps::INITIAL_DISPATCH_HELPER,
    emit::dispatch::DispatchMapEntry,
    graph::StaticsKind,
    obj::writer::MemoryObjectWriter,
    session::{Options, SingleModuleGroup},
    ts::{
        universe::{Universe, UniverseBuilder},
        MethodId, PrimitiveKind, TypeId,
    },
};

pub(super) const PTR: PointerSize = PointerSize::Eight;

/// Result of compiling a set of roots and emitting everything marked.
pub(super) struct Emitted {
    pub w: MemoryObjectWriter,
    symbols: FxHashMap<ArtifactKey, SymbolId>,
}

impl Emitted {
    /// Symbol of the marked node for `key`.
    pub fn symbol(&self, key: &ArtifactKey) -> SymbolId {
        match self.symbols.get(key) {
            Some(&sym) => sym,
            None => panic!("{key} was not marked"),
        }
    }

    /// Whether `key` was marked and defined in the object.
    pub fn is_emitted(&self, key: &ArtifactKey) -> bool {
        self.symbols
            .get(key)
            .map_or(false, |&sym| self.w.is_defined(sym))
    }

    pub fn address(&self, key: &ArtifactKey) -> u64 {
        self.w.address(self.symbol(key)).unwrap()
    }

    pub fn bytes(&self, key: &ArtifactKey, offset: u32, len: usize) -> &[u8] {
        self.w.bytes_at(self.symbol(key), offset, len).unwrap()
    }

    /// Bytes preceding the symbol of `key`.
    pub fn bytes_before(&self, key: &ArtifactKey, back: u32, len: usize) -> &[u8] {
        let (section, at) = self.w.location(self.symbol(key)).unwrap();
        let start = (at - back) as usize;

        &self.w.section(section)[start..start + len]
    }

    pub fn u16_at(&self, key: &ArtifactKey, offset: u32) -> u16 {
        u16::from_le_bytes(self.bytes(key, offset, 2).try_into().unwrap())
    }

    pub fn u32_at(&self, key: &ArtifactKey, offset: u32) -> u32 {
        u32::from_le_bytes(self.bytes(key, offset, 4).try_into().unwrap())
    }

    pub fn u64_at(&self, key: &ArtifactKey, offset: u32) -> u64 {
        u64::from_le_bytes(self.bytes(key, offset, 8).try_into().unwrap())
    }
}

/// Mark everything reachable from `roots` and emit it.
pub(super) fn compile(
    ts: &Universe,
    group: &SingleModuleGroup,
    roots: &[ArtifactKey],
) -> Emitted {
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(Options::default(), ts, group, &mut codegen);

    for key in roots {
        c.add_root(key.clone(), "test root").unwrap();
    }

    c.run_to_fixed_point().unwrap();

    let mut w = MemoryObjectWriter::new(PTR);
    c.emit_all(&mut w).unwrap();

    let graph = c.factory().graph();
    let symbols = graph
        .marked()
        .iter()
        .map(|&id| (graph.key(id).clone(), graph.node(id).symbol()))
        .collect();

    Emitted { w, symbols }
}

/// ```text
/// Animal { virtual Speak }
///   Dog : Animal, IRun { override Speak; Run }
/// IRun { abstract Run }
/// Point { int X }
/// ```
struct Sample {
    ts: Universe,
    dog: TypeId,
    irun: TypeId,
    point: TypeId,
    speak: MethodId,
    dog_run: MethodId,
    run: MethodId,
}

fn sample() -> Sample {
    let mut b = UniverseBuilder::new(PTR);
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    let irun = b.interface("IRun");
    let run = b.method(irun, "Run").abstract_slot().build();

    let animal = b.class("Animal");
    let speak = b.method(animal, "Speak").virtual_slot().build();

    let dog = b.class("Dog");
    b.extends(dog, animal);
    b.implements(dog, irun);
    b.method(dog, "Speak").overriding(speak).build();
    let dog_run = b.method(dog, "Run").implementing(run).build();

    let point = b.class("Point");
    b.field(point, "X", int);

    Sample {
        ts: b.finish(),
        dog,
        irun,
        point,
        speak,
        dog_run,
        run,
    }
}

#[test]
fn constructed_descriptor_supersedes_necessary() {
    let s = sample();
    let necessary = ArtifactKey::necessary_type(s.point);
    let constructed = ArtifactKey::constructed_type(s.point);

    let out = compile(
        &s.ts,
        &Default::default(),
        &[necessary.clone(), constructed.clone()],
    );

    assert!(out.is_emitted(&constructed));
    assert!(!out.is_emitted(&necessary));
}

#[test]
#[should_panic(expected = "internal error")]
fn relocation_against_unmarked_node_panics() {
    let s = sample();
    let options = Options::default();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(options.clone(), &s.ts, &group, &mut codegen);

    // Created but never marked.
    let id = c
        .add_root(ArtifactKey::constructed_type(s.point), "test root")
        .unwrap();

    let env = Env::new(&s.ts, &options, &group);
    let ctx = EmitContext::new(
        env,
        c.factory(),
        c.layouts(),
        c.gvm_implementations(),
        EmitMode::Final,
    );

    ctx.node_symbol(id);
}

#[test]
fn external_indices_are_allocated_only_when_final() {
    let s = sample();
    let options = Options::default();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(options.clone(), &s.ts, &group, &mut codegen);

    let a = c
        .add_root(ArtifactKey::constructed_type(s.point), "test root")
        .unwrap();
    let b = c
        .add_root(ArtifactKey::constructed_type(s.dog), "test root")
        .unwrap();

    let env = Env::new(&s.ts, &options, &group);
    let (sa, sb) = (c.factory().node_symbol(a), c.factory().node_symbol(b));

    let mut preflight = EmitContext::new(
        env,
        c.factory(),
        c.layouts(),
        c.gvm_implementations(),
        EmitMode::RelocsOnly,
    );
    assert_eq!((0, 0), (preflight.ext_index(sa), preflight.ext_index(sb)));
    assert!(preflight.external_references().is_empty());

    let mut ctx = EmitContext::new(
        env,
        c.factory(),
        c.layouts(),
        c.gvm_implementations(),
        EmitMode::Final,
    );
    assert_eq!(0, ctx.ext_index(sa));
    assert_eq!(1, ctx.ext_index(sb));
    assert_eq!(0, ctx.ext_index(sa));
    assert_eq!(&[sa, sb], ctx.external_references());
}

#[test]
fn dispatch_map_locates_implementation_slots() {
    let s = sample();

    assert_eq!(
        vec![DispatchMapEntry {
            interface_index: 0,
            interface_slot: 0,
            implementation_slot: 1,
        }],
        dispatch_map_entries(&s.ts, s.dog, &[s.speak, s.dog_run]),
    );

    // An implementation without a vtable slot cannot be dispatched to.
    assert_eq!(
        Vec::<DispatchMapEntry>::new(),
        dispatch_map_entries(&s.ts, s.dog, &[s.speak]),
    );
}

#[test]
fn emitted_dispatch_map_points_into_vtable() {
    let s = sample();
    let dog = ArtifactKey::constructed_type(s.dog);
    let map = ArtifactKey::InterfaceDispatchMap(s.dog);

    let out = compile(&s.ts, &Default::default(), &[dog.clone()]);

    assert!(out.is_emitted(&map));
    assert_eq!(1, out.u32_at(&map, 0));
    assert_eq!((0, 0), (out.u16_at(&map, 4), out.u16_at(&map, 6)));

    let slot = out.u16_at(&map, 8) as u32;
    let slots = out.u16_at(&dog, 16) as u32;
    assert!(slot < slots);

    // Vtable follows the fixed header.
    assert_eq!(
        out.address(&ArtifactKey::method_body(s.dog_run)),
        out.u64_at(&dog, 24 + slot * 8),
    );
}

#[test]
fn interface_methods_occupy_their_declared_slot() {
    let s = sample();

    assert_eq!(0, interface_slot(&s.ts, s.run));
}

#[test]
#[should_panic(expected = "internal error: no interface slot")]
fn interface_method_without_slot_is_internal_error() {
    let mut b = UniverseBuilder::new(PTR);
    let irun = b.interface("IRun");
    b.method(irun, "Run").abstract_slot().build();
    let create = b.method(irun, "Create").static_method().build();
    let ts = b.finish();

    interface_slot(&ts, create);
}

#[test]
fn dispatch_cell_starts_at_initial_helper() {
    let s = sample();
    let cell = ArtifactKey::DispatchCell(s.run);
    let helper = ArtifactKey::extern_symbol(INITIAL_DISPATCH_HELPER);
    let group = SingleModuleGroup {
        lazy_vtables: true,
        ..Default::default()
    };

    let out = compile(&s.ts, &group, &[cell.clone()]);

    let (section, at) = out.w.location(out.symbol(&cell)).unwrap();
    assert!(out.w.is_extern(out.symbol(&helper)));
    assert!(out
        .w
        .imports()
        .contains(&(section, at, out.symbol(&helper))));

    // Interface descriptor tagged in its low bit,
    //   then the slot.
    assert_eq!(
        out.address(&ArtifactKey::necessary_type(s.irun)) + 1,
        out.u64_at(&cell, 8),
    );
    assert_eq!(0, out.u64_at(&cell, 16));
}

/// ```text
/// Config { static int count; static object name; static .cctor }
/// ```
fn statics_sample() -> (Universe, TypeId, MethodId) {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    let config = b.class("Config");
    b.static_field(config, "count", int);
    b.static_field(config, "name", object);
    let cctor = b.method(config, ".cctor").static_method().build();

    (b.finish(), config, cctor)
}

#[test]
fn non_gc_statics_carry_class_constructor_context() {
    let (ts, config, cctor) = statics_sample();
    let statics = ArtifactKey::Statics(config, StaticsKind::NonGc);

    let out = compile(&ts, &Default::default(), &[statics.clone()]);

    let cctor_addr = out.address(&ArtifactKey::method_body(cctor));
    assert_eq!(
        &cctor_addr.to_le_bytes()[..],
        out.bytes_before(&statics, 16, 8),
    );
    assert_eq!(&[0; 8][..], out.bytes_before(&statics, 8, 8));

    let layout = statics_layout(&ts, PTR, config, StaticsKind::NonGc);
    assert_eq!(&vec![0; layout.size as usize][..], out.bytes(&statics, 0, 8));
}

#[test]
fn gc_statics_are_listed_in_their_region() {
    let (ts, config, _) = statics_sample();
    let statics = ArtifactKey::Statics(config, StaticsKind::Gc);
    let region = ArtifactKey::StaticsRegion(StaticsKind::Gc);
    let layout = statics_layout(&ts, PTR, config, StaticsKind::Gc);
    let desc = ArtifactKey::GcStaticDescriptor(layout.gc_map.clone());

    let out = compile(&ts, &Default::default(), &[statics.clone()]);

    assert_eq!(vec![true], layout.gc_map);
    assert_eq!(out.address(&desc) + 1, out.u64_at(&statics, 0));
    assert_eq!(out.address(&statics), out.u64_at(&region, 0));
    assert!(!out.is_emitted(&ArtifactKey::StaticsRegion(StaticsKind::NonGc)));
}
