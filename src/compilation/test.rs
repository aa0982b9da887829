// Tests for the compilation driver
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
    codegen::{Script, ScriptedCodegen},
    diagnose::{Entity, EntityResolver},
    graph::TypeLoadReason,
    obj::writer::MemoryObjectWriter,
    session::{PointerSize, SingleModuleGroup},
    ts::{
        universe::{Universe, UniverseBuilder},
        MethodId, PrimitiveKind, TypeId,
    },
};

const PTR: PointerSize = PointerSize::Eight;

/// ```text
/// Point { int X; int Y; .ctor }
/// Program { static Main }
/// ```
///
/// `Point` has no base type so that nothing beyond what `Main` mentions
///   becomes reachable.
struct Sample {
    ts: Universe,
    int: TypeId,
    point: TypeId,
    ctor: MethodId,
    main: MethodId,
}

fn sample() -> Sample {
    let mut b = UniverseBuilder::new(PTR);
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    let point = b.class("Point");
    b.field(point, "X", int);
    b.field(point, "Y", int);
    let ctor = b.method(point, ".ctor").build();

    let program = b.class("Program");
    let main = b.method(program, "Main").static_method().build();

    Sample {
        ts: b.finish(),
        int,
        point,
        ctor,
        main,
    }
}

fn main_script(s: &Sample) -> ScriptedCodegen {
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    codegen.script(
        s.main,
        Script::default()
            .reloc(ArtifactKey::constructed_type(s.point))
            .reloc(ArtifactKey::method_body(s.ctor)),
    );
    codegen
}

#[test]
fn point_program_emits_exactly_what_main_references() -> CompileResult<()> {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = main_script(&s);
    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);

    let main = c.add_root(ArtifactKey::method_body(s.main), "entry point")?;
    c.run_to_fixed_point()?;

    let point = c.node(&ArtifactKey::constructed_type(s.point)).unwrap();
    let ctor = c.node(&ArtifactKey::method_body(s.ctor)).unwrap();

    let mut w = MemoryObjectWriter::new(PTR);
    c.emit_all(&mut w)?;

    let mut emitted = w.symbols().to_vec();
    emitted.sort();

    let mut expected = [point, ctor, main]
        .map(|id| c.factory().node_symbol(id))
        .to_vec();
    expected.sort();

    assert_eq!(expected, emitted);

    // The first relocation of `Main` now holds the address of the
    //   descriptor.
    let point_addr = w.address(c.factory().node_symbol(point)).unwrap();
    let main_sym = c.factory().node_symbol(main);
    assert_eq!(
        Some(&point_addr.to_le_bytes()[..]),
        w.bytes_at(main_sym, 0, 8),
    );

    assert_eq!(2, c.stats().methods_compiled);
    assert!(!c.is_marked(&ArtifactKey::necessary_type(s.int)));

    Ok(())
}

#[test]
fn explain_walks_back_to_the_root() -> CompileResult<()> {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = main_script(&s);
    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);

    let main = c.add_root(ArtifactKey::method_body(s.main), "entry point")?;
    c.run_to_fixed_point()?;

    let ctor = c.node(&ArtifactKey::method_body(s.ctor)).unwrap();

    assert_eq!(
        vec![(ctor, "referenced by code"), (main, "entry point")],
        c.explain(ctor),
    );

    Ok(())
}

#[test]
fn marking_resumes_with_new_roots() -> CompileResult<()> {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);

    c.add_root(ArtifactKey::method_body(s.main), "entry point")?;
    c.run_to_fixed_point()?;
    assert!(!c.is_marked(&ArtifactKey::method_body(s.ctor)));

    c.add_root(ArtifactKey::method_body(s.ctor), "late root")?;
    c.run_to_fixed_point()?;
    assert!(c.is_marked(&ArtifactKey::method_body(s.ctor)));

    let keys = c.marked_keys().cloned().collect::<Vec<_>>();
    assert_eq!(
        vec![
            ArtifactKey::method_body(s.main),
            ArtifactKey::method_body(s.ctor),
        ],
        keys,
    );

    Ok(())
}

#[test]
#[should_panic(expected = "internal error")]
fn finalizing_twice_panics() {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);

    let main = c
        .add_root(ArtifactKey::method_body(s.main), "entry point")
        .unwrap();
    c.run_to_fixed_point().unwrap();

    let _ = c.finalize(main);
    let _ = c.finalize(main);
}

#[test]
#[should_panic(expected = "internal error")]
fn emit_after_finalize_panics() {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);

    let main = c
        .add_root(ArtifactKey::method_body(s.main), "entry point")
        .unwrap();
    c.run_to_fixed_point().unwrap();

    let _ = c.finalize(main);
    let _ = c.emit_all(&mut MemoryObjectWriter::new(PTR));
}

#[test]
fn roots_that_cannot_exist_are_rejected() {
    let mut b = UniverseBuilder::new(PTR);
    let int = b.primitive("System.Int32", PrimitiveKind::I4);
    let byref = b.byref(int);
    let ts = b.finish();

    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(Options::default(), &ts, &group, &mut codegen);

    match c.add_root(ArtifactKey::constructed_type(byref), "boxed byref") {
        Err(CompileError::TypeLoad(e)) => {
            assert!(matches!(e.reason(), TypeLoadReason::ByRef));
            assert_eq!(Entity::Type(byref), e.culprit());
        }
        other => panic!("expected type load error, got {other:?}"),
    }

    assert_eq!(0, c.factory().graph().marked().len());
}

#[test]
fn codegen_failure_names_the_method() {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    codegen.script(s.main, Script::default().fail("bad IL"));

    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);
    c.add_root(ArtifactKey::method_body(s.main), "entry point")
        .unwrap();

    match c.run_to_fixed_point() {
        Err(e @ CompileError::Codegen(_)) => {
            let described = e.describe();
            assert_eq!(1, described.len());
            assert!(e.to_string().contains("bad IL"));

            let CompileError::Codegen(inner) = e else { unreachable!() };
            assert_eq!(s.main, inner.method());
        }
        other => panic!("expected codegen error, got {other:?}"),
    }
}

#[test]
fn resolver_names_graph_nodes() -> CompileResult<()> {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = main_script(&s);
    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);

    c.add_root(ArtifactKey::method_body(s.main), "entry point")?;
    c.run_to_fixed_point()?;

    let key = ArtifactKey::constructed_type(s.point);
    let point = c.node(&key).unwrap();
    let resolved = c.resolver().resolve(Entity::Node(point)).unwrap();

    assert_eq!("Point", resolved.name());
    assert_eq!(key.kind_name(), resolved.kind());

    // Types still resolve through the type system.
    let ty = c.resolver().resolve(Entity::Type(s.int)).unwrap();
    assert_eq!("System.Int32", ty.name());

    Ok(())
}

#[test]
fn reports_name_the_failing_method() {
    let s = sample();
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    codegen.script(s.main, Script::default().fail("bad IL"));

    let mut c = Compilation::new(Options::default(), &s.ts, &group, &mut codegen);
    c.add_root(ArtifactKey::method_body(s.main), "entry point")
        .unwrap();

    let err = c.run_to_fixed_point().unwrap_err();
    let report = c.report(&err);

    assert!(report.starts_with("error: "), "{report}");
    assert!(report.contains("  --> method `Program::Main`"), "{report}");
}
