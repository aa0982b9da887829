// Tests for dependency computation
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
    codegen::{CodegenError, Script, ScriptedCodegen},
    generic::GenericLookup,
    graph::MarkingEngine,
    session::{Options, PointerSize, SingleModuleGroup, Stats},
    ts::{
        universe::{Universe, UniverseBuilder},
        PrimitiveKind, TypeSystem, Variance,
    },
};

const PTR: PointerSize = PointerSize::Eight;

/// ```text
/// Object { virtual ToString }
///   Animal : Object { virtual Speak }
///     Dog : Animal, IRun { override Speak; Run }
///   ValueType : Object
///     Point : ValueType { override ToString }
///   List<T> : Object { Add(T) }
///   Impl : Object, IGvm { Gvm<M> }
/// IRun { abstract Run }
/// IGvm { abstract Gvm<M> }
/// ```
struct Sample {
    ts: Universe,
    object: TypeId,
    foo: TypeId,
    bar: TypeId,
    int: TypeId,
    animal: TypeId,
    dog: TypeId,
    point: TypeId,
    list: TypeId,
    t: TypeId,
    imp: TypeId,
    to_string: MethodId,
    speak: MethodId,
    dog_speak: MethodId,
    run: MethodId,
    dog_run: MethodId,
    point_to_string: MethodId,
    add: MethodId,
    gvm: MethodId,
    main: MethodId,
}

fn sample() -> Sample {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let to_string = b.method(object, "ToString").virtual_slot().build();
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    let foo = b.class("Foo");
    b.extends(foo, object);
    let bar = b.class("Bar");
    b.extends(bar, object);

    let irun = b.interface("IRun");
    let run = b.method(irun, "Run").abstract_slot().build();

    let animal = b.class("Animal");
    b.extends(animal, object);
    let speak = b.method(animal, "Speak").virtual_slot().build();

    let dog = b.class("Dog");
    b.extends(dog, animal);
    b.implements(dog, irun);
    let dog_speak = b.method(dog, "Speak").overriding(speak).build();
    let dog_run = b.method(dog, "Run").implementing(run).build();

    let valuetype = b.class("System.ValueType");
    b.extends(valuetype, object);
    let point = b.structure("Point");
    b.extends(point, valuetype);
    b.field(point, "X", int);
    let point_to_string = b.method(point, "ToString").overriding(to_string).build();

    let list = b.class("List`1");
    b.extends(list, object);
    let t = b.generic(list, &[Variance::NonVariant])[0];
    let add = b.method(list, "Add").params(&[t]).build();

    let igvm = b.interface("IGvm");
    let gvm = b.method(igvm, "Gvm").abstract_slot().generic(1).build();
    let imp = b.class("Impl");
    b.extends(imp, object);
    b.implements(imp, igvm);
    b.method(imp, "Gvm").implementing(gvm).generic(1).build();

    let program = b.class("Program");
    b.extends(program, object);
    let main = b.method(program, "Main").static_method().build();

    Sample {
        ts: b.finish(),
        object,
        foo,
        bar,
        int,
        animal,
        dog,
        point,
        list,
        t,
        imp,
        to_string,
        speak,
        dog_speak,
        run,
        dog_run,
        point_to_string,
        add,
        gvm,
        main,
    }
}

/// Everything needed to drive a [`DependencyContext`] to a fixed point.
struct Harness {
    s: Sample,
    options: Options,
    group: SingleModuleGroup,
    factory: NodeFactory,
    codegen: ScriptedCodegen,
    layouts: DictionaryLayouts,
    gvm_impls: Vec<GvmImplementation>,
    engine: MarkingEngine,
    stats: Stats,
}

impl Harness {
    fn new(lazy_vtables: bool) -> Self {
        Self {
            s: sample(),
            options: Options::default(),
            group: SingleModuleGroup {
                lazy_vtables,
                ..Default::default()
            },
            factory: NodeFactory::new(),
            codegen: ScriptedCodegen::new(PTR.bytes()),
            layouts: DictionaryLayouts::new(),
            gvm_impls: Vec::new(),
            engine: MarkingEngine::new(),
            stats: Stats::default(),
        }
    }

    fn root(&mut self, key: ArtifactKey) {
        let env = Env::new(&self.s.ts, &self.options, &self.group);
        let id = self.factory.get_or_create(env, key).unwrap();
        self.engine.add_root(id, "test root");
    }

    fn run(&mut self) -> Result<(), CompileError> {
        let env = Env::new(&self.s.ts, &self.options, &self.group);
        let mut ctx = DependencyContext {
            env,
            factory: &mut self.factory,
            codegen: &mut self.codegen,
            layouts: &mut self.layouts,
            gvm_impls: &mut self.gvm_impls,
        };

        self.engine.run(&mut ctx, &mut self.stats)
    }

    fn marked(&self, key: ArtifactKey) -> bool {
        let env = Env::new(&self.s.ts, &self.options, &self.group);
        self.factory.is_marked(env, &key)
    }

    fn layout(&self, ty: TypeId) -> Vec<MethodId> {
        let env = Env::new(&self.s.ts, &self.options, &self.group);
        vtable_layout(env, &self.factory, ty)
    }
}

#[test]
fn constructed_type_requires_constructed_base_chain() {
    let mut h = Harness::new(false);
    let (dog, animal, object) = (h.s.dog, h.s.animal, h.s.object);

    h.root(ArtifactKey::constructed_type(dog));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::constructed_type(animal)));
    assert!(h.marked(ArtifactKey::constructed_type(object)));
    assert!(h.marked(ArtifactKey::necessary_type(h.s.ts.runtime_interfaces(dog)[0])));
}

#[test]
fn full_vtables_require_every_implementation() {
    let mut h = Harness::new(false);
    let (dog, dog_speak, dog_run) = (h.s.dog, h.s.dog_speak, h.s.dog_run);

    h.root(ArtifactKey::constructed_type(dog));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::method_body(dog_speak)));
    assert!(h.marked(ArtifactKey::method_body(dog_run)));
    assert!(h.marked(ArtifactKey::method_body(h.s.to_string)));
    assert_eq!(
        vec![h.s.to_string, h.s.speak, dog_run],
        h.layout(dog),
    );
}

#[test]
fn lazy_vtable_slots_await_use() {
    let mut h = Harness::new(true);
    let (dog, speak, dog_speak) = (h.s.dog, h.s.speak, h.s.dog_speak);

    h.root(ArtifactKey::constructed_type(dog));
    h.run().unwrap();

    assert!(!h.marked(ArtifactKey::method_body(dog_speak)));
    assert_eq!(Vec::<MethodId>::new(), h.layout(dog));

    // A call through the slot arrives later.
    h.root(ArtifactKey::VirtualMethodUse(speak));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::method_body(dog_speak)));
    assert!(!h.marked(ArtifactKey::method_body(h.s.to_string)));
    assert_eq!(vec![speak], h.layout(dog));
}

#[test]
fn use_of_overriding_method_is_use_of_its_slot() {
    let mut h = Harness::new(true);
    let (dog, dog_speak) = (h.s.dog, h.s.dog_speak);

    h.root(ArtifactKey::constructed_type(dog));
    h.root(ArtifactKey::VirtualMethodUse(dog_speak));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::VirtualMethodUse(h.s.speak)));
    assert!(h.marked(ArtifactKey::method_body(dog_speak)));
}

#[test]
fn lazy_interface_implementations_await_use() {
    let mut h = Harness::new(true);
    let (dog, run, dog_run) = (h.s.dog, h.s.run, h.s.dog_run);

    h.root(ArtifactKey::constructed_type(dog));
    h.run().unwrap();
    assert!(!h.marked(ArtifactKey::method_body(dog_run)));

    h.root(ArtifactKey::VirtualMethodUse(run));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::method_body(dog_run)));

    // The implementing slot is itself in use so that it is present in
    //   the vtable for the dispatch map to refer to.
    assert!(h.marked(ArtifactKey::VirtualMethodUse(dog_run)));
    assert!(h.layout(dog).contains(&dog_run));
}

#[test]
fn conditional_dependencies_require_construction() {
    let mut h = Harness::new(true);
    let (speak, dog_speak) = (h.s.speak, h.s.dog_speak);

    // Slot used,
    //   but no type ever constructed.
    h.root(ArtifactKey::VirtualMethodUse(speak));
    h.run().unwrap();

    assert!(!h.marked(ArtifactKey::method_body(dog_speak)));
}

#[test]
fn value_type_vtables_use_unboxing_stubs() {
    let mut h = Harness::new(false);
    let (point, pts) = (h.s.point, h.s.point_to_string);

    h.root(ArtifactKey::constructed_type(point));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::unboxing_stub(pts)));
    assert!(h.marked(ArtifactKey::method_body(pts)));
}

#[test]
fn unboxing_stub_entry_only_for_value_type_methods() {
    let h = Harness::new(false);
    let env = Env::new(&h.s.ts, &h.options, &h.group);

    assert_eq!(
        ArtifactKey::unboxing_stub(h.s.point_to_string),
        vtable_entry(env, h.s.point, h.s.point_to_string),
    );
    assert_eq!(
        ArtifactKey::method_body(h.s.to_string),
        vtable_entry(env, h.s.point, h.s.to_string),
    );
    assert_eq!(
        ArtifactKey::method_body(h.s.dog_speak),
        vtable_entry(env, h.s.dog, h.s.dog_speak),
    );
}

#[test]
fn code_references_become_dependencies() {
    let mut h = Harness::new(false);
    let (main, dog) = (h.s.main, h.s.dog);

    h.codegen
        .script(main, Script::default().reloc(ArtifactKey::constructed_type(dog)));

    h.root(ArtifactKey::method_body(main));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::constructed_type(dog)));
    assert_eq!(1, h.codegen.compiled().iter().filter(|&&m| m == main).count());
    assert!(h.stats.methods_compiled >= 1);
}

#[test]
fn each_method_is_compiled_once() {
    let mut h = Harness::new(false);
    let main = h.s.main;

    h.root(ArtifactKey::method_body(main));
    h.run().unwrap();
    h.root(ArtifactKey::method_body(main));
    h.run().unwrap();

    assert_eq!(vec![main], h.codegen.compiled());
}

#[test]
fn codegen_failure_aborts_marking() {
    let mut h = Harness::new(false);
    let main = h.s.main;

    h.codegen.script(main, Script::default().fail("bad IL"));
    h.root(ArtifactKey::method_body(main));

    assert!(matches!(h.run(), Err(CompileError::Codegen(_))));
}

#[test]
fn malformed_relocations_are_rejected_before_emission() {
    // Two pointer-sized relocations at 0 and 8 and a trailing return,
    //   with a third relocation placed at:
    for offset in [
        // the middle of the first,
        4,
        // the same offset as the first,
        0,
        // or past the end of the code.
        16,
    ] {
        let mut h = Harness::new(false);
        let main = h.s.main;
        let foo = ArtifactKey::constructed_type(h.s.foo);
        let bar = ArtifactKey::constructed_type(h.s.bar);

        h.codegen.script(
            main,
            Script::default().reloc(foo.clone()).reloc(bar).reloc_at(offset, foo),
        );
        h.root(ArtifactKey::method_body(main));

        match h.run() {
            Err(CompileError::Codegen(CodegenError::BadRelocation(m, at))) => {
                assert_eq!((main, offset), (m, at));
            }
            other => panic!("unexpected result {other:?}"),
        }

        let env = Env::new(&h.s.ts, &h.options, &h.group);
        let body = h.factory.existing(env, &ArtifactKey::method_body(main));
        assert!(body.and_then(|id| h.factory.graph().node(id).code()).is_none());
    }
}

#[test]
fn shared_code_is_compiled_once_per_canonical_form() {
    let mut h = Harness::new(false);
    let ts = &h.s.ts;
    let list_foo = ts.instantiate_type(h.s.list, &[h.s.foo]);
    let list_bar = ts.instantiate_type(h.s.list, &[h.s.bar]);
    let add_foo = ts.method_on_type(h.s.add, list_foo);
    let add_bar = ts.method_on_type(h.s.add, list_bar);
    let canonical = ts.canonical_method(add_foo);
    let t = h.s.t;

    h.codegen
        .script(canonical, Script::default().lookup(GenericLookup::TypeHandle(t)));

    h.root(ArtifactKey::ShadowConcreteMethod(add_foo));
    h.root(ArtifactKey::ShadowConcreteMethod(add_bar));
    h.run().unwrap();

    assert_eq!(vec![canonical], h.codegen.compiled());
    assert!(h.marked(ArtifactKey::method_body(canonical)));

    // Each exact instantiation pulls in its own lookup target.
    assert!(h.marked(ArtifactKey::necessary_type(h.s.foo)));
    assert!(h.marked(ArtifactKey::necessary_type(h.s.bar)));
    assert!(h.marked(ArtifactKey::TypeDictionary(list_foo)));
    assert!(h.marked(ArtifactKey::TypeDictionary(list_bar)));

    let owner = DictionaryOwner::Type(h.s.ts.canonical_form(list_foo));
    assert_eq!(&[GenericLookup::TypeHandle(t)], h.layouts.layout(owner));
}

#[test]
fn constructed_instantiation_requires_its_dictionary() {
    let mut h = Harness::new(false);
    let ts = &h.s.ts;
    let list_foo = ts.instantiate_type(h.s.list, &[h.s.foo]);
    let add_foo = ts.method_on_type(h.s.add, list_foo);
    let canonical = ts.canonical_method(add_foo);

    h.root(ArtifactKey::constructed_type(list_foo));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::TypeDictionary(list_foo)));

    // The dictionary is not populated until the shared code is reachable.
    assert!(!h.marked(ArtifactKey::ShadowConcreteMethod(add_foo)));

    h.root(ArtifactKey::method_body(canonical));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::ShadowConcreteMethod(add_foo)));
}

#[test]
fn generic_virtual_methods_follow_late_types() {
    let mut h = Harness::new(false);
    let ts = &h.s.ts;
    let decl = ts.instantiate_method(h.s.gvm, &[h.s.int]);
    let imp = h.s.imp;

    h.root(ArtifactKey::GvmDependencies(decl));
    h.run().unwrap();
    assert!(h.gvm_impls.is_empty());

    // The implementing type is discovered after the call site.
    h.root(ArtifactKey::constructed_type(imp));
    h.run().unwrap();

    let implementation = h.s.ts.resolve_interface_method(imp, decl).unwrap();

    assert_eq!(
        vec![GvmImplementation {
            decl,
            implementation,
            ty: imp,
        }],
        h.gvm_impls,
    );
    assert!(h.marked(ArtifactKey::method_body(implementation)));
    assert!(h.marked(ArtifactKey::InterfaceGvmTable));
    assert!(h.marked(ArtifactKey::ExternalReferences));
}

#[test]
fn generic_virtual_methods_ignore_unrelated_types() {
    let mut h = Harness::new(false);
    let decl = h.s.ts.instantiate_method(h.s.gvm, &[h.s.int]);
    let dog = h.s.dog;

    h.root(ArtifactKey::GvmDependencies(decl));
    h.root(ArtifactKey::constructed_type(dog));
    h.run().unwrap();

    assert!(h.gvm_impls.is_empty());
    assert!(!h.marked(ArtifactKey::InterfaceGvmTable));
}

#[test]
fn dispatch_cells_require_initial_helper() {
    let mut h = Harness::new(true);
    let run = h.s.run;

    h.root(ArtifactKey::DispatchCell(run));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::extern_symbol(INITIAL_DISPATCH_HELPER)));
    assert!(h.marked(ArtifactKey::VirtualMethodUse(run)));
}

#[test]
fn reflectable_methods_populate_invoke_map() {
    let mut h = Harness::new(false);
    let pts = h.s.point_to_string;
    h.group.reflectable.push(pts);

    h.root(ArtifactKey::method_body(pts));
    h.run().unwrap();

    assert!(h.marked(ArtifactKey::ReflectionInvokeMap));
    assert!(h.marked(ArtifactKey::necessary_type(h.s.point)));

    // Invocation goes through a boxed instance.
    assert!(h.marked(ArtifactKey::unboxing_stub(pts)));
}

#[test]
fn invoke_map_can_be_disabled() {
    let mut h = Harness::new(false);
    let pts = h.s.point_to_string;
    h.group.reflectable.push(pts);
    h.options = Options::default().with_reflection_invoke_map(false);

    h.root(ArtifactKey::method_body(pts));
    h.run().unwrap();

    assert!(!h.marked(ArtifactKey::ReflectionInvokeMap));
}
