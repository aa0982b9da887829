// Emission scenarios
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


use aotc::{
    codegen::{Script, ScriptedCodegen},
    compilation::{Compilation, CompileResult},
    graph::ArtifactKey,
    obj::writer::MemoryObjectWriter,
    session::{Options, PointerSize, SingleModuleGroup},
    sym::SymbolId,
    ts::{universe::UniverseBuilder, PrimitiveKind, TypeId},
};

const PTR: PointerSize = PointerSize::Eight;

/// Pointer-sized signed value `back` bytes before `sym`.
fn natural_before(w: &MemoryObjectWriter, sym: SymbolId, back: u32) -> i64 {
    let (section, offset) = w.location(sym).unwrap();
    let at = (offset - back) as usize;
    let bytes = &w.section(section)[at..at + 8];

    i64::from_le_bytes(bytes.try_into().unwrap())
}

/// 32-bit signed value `back` bytes before `sym`.
fn half_before(w: &MemoryObjectWriter, sym: SymbolId, back: u32) -> i32 {
    let (section, offset) = w.location(sym).unwrap();
    let at = (offset - back) as usize;
    let bytes = &w.section(section)[at..at + 4];

    i32::from_le_bytes(bytes.try_into().unwrap())
}

/// Compile constructed descriptors for each of `roots` and return the
///   symbol of each.
fn descriptors(
    ts: &aotc::ts::universe::Universe,
    roots: &[TypeId],
) -> CompileResult<(MemoryObjectWriter, Vec<SymbolId>)> {
    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    let mut c = Compilation::new(Options::default(), ts, &group, &mut codegen);

    for &ty in roots {
        c.add_root(ArtifactKey::constructed_type(ty), "allocation")?;
    }
    c.run_to_fixed_point()?;

    let mut w = MemoryObjectWriter::new(PTR);
    c.emit_all(&mut w)?;

    let syms = roots
        .iter()
        .map(|&ty| {
            let id = c.node(&ArtifactKey::constructed_type(ty)).unwrap();
            c.factory().node_symbol(id)
        })
        .collect();

    Ok((w, syms))
}

#[test]
fn gc_series_describe_reference_fields() -> CompileResult<()> {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    // Cells: [descriptor, a, n, b, c]
    let rec = b.class("Rec");
    b.field(rec, "a", object);
    b.field(rec, "n", int);
    b.field(rec, "b", object);
    b.field(rec, "c", object);
    let ts = b.finish();

    let (w, syms) = descriptors(&ts, &[rec])?;
    let sym = syms[0];
    let base_size = 48;

    assert_eq!(2, natural_before(&w, sym, 8));

    // Series are read in ascending order walking backwards.
    assert_eq!(8, natural_before(&w, sym, 16));
    assert_eq!(8 - base_size, natural_before(&w, sym, 24));
    assert_eq!(24, natural_before(&w, sym, 32));
    assert_eq!(16 - base_size, natural_before(&w, sym, 40));

    Ok(())
}

#[test]
fn types_without_references_have_no_gc_descriptor() -> CompileResult<()> {
    let mut b = UniverseBuilder::new(PTR);
    let int = b.primitive("System.Int32", PrimitiveKind::I4);
    let point = b.class("Point");
    b.field(point, "X", int);
    b.field(point, "Y", int);
    let ts = b.finish();

    let (w, syms) = descriptors(&ts, &[point])?;
    let (_, offset) = w.location(syms[0]).unwrap();

    assert_eq!(0, offset);

    Ok(())
}

#[test]
fn reference_arrays_form_a_single_series() -> CompileResult<()> {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let objects = b.sz_array(object);
    let ts = b.finish();

    let (w, syms) = descriptors(&ts, &[objects])?;
    let sym = syms[0];

    assert_eq!(1, natural_before(&w, sym, 8));
    assert_eq!(16, natural_before(&w, sym, 16));
    assert_eq!(-24, natural_before(&w, sym, 24));

    Ok(())
}

#[test]
fn struct_arrays_repeat_element_references() -> CompileResult<()> {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    // Element cells: [tag] [obj]
    let pair = b.structure("Pair");
    b.field(pair, "tag", int);
    b.field(pair, "obj", object);
    let pairs = b.sz_array(pair);
    let ts = b.finish();

    let (w, syms) = descriptors(&ts, &[pairs])?;
    let sym = syms[0];

    // [descriptor] [length] then elements of two cells each.
    let first_elem = 16;
    let elem_size = 16;

    assert_eq!(-1, natural_before(&w, sym, 8));
    assert_eq!(first_elem + 8, natural_before(&w, sym, 16));

    // One reference, then skip to the reference of the next element.
    let (refs, skip) = (half_before(&w, sym, 24), half_before(&w, sym, 20));
    assert_eq!(1, refs);
    assert_eq!(8, skip);
    assert_eq!(elem_size, refs * 8 + skip);

    Ok(())
}

/// ```text
/// System.Object { virtual ToString }
/// Point : System.Object { int X; .ctor; override ToString }
/// Program { static Main }
/// ```
#[test]
fn point_program_end_to_end() -> CompileResult<()> {
    let mut b = UniverseBuilder::new(PTR);
    let object = b.class("System.Object");
    let to_string = b.method(object, "ToString").virtual_slot().build();
    let int = b.primitive("System.Int32", PrimitiveKind::I4);

    let point = b.class("Point");
    b.extends(point, object);
    b.field(point, "X", int);
    let ctor = b.method(point, ".ctor").build();
    let point_to_string = b.method(point, "ToString").overriding(to_string).build();

    let unused = b.class("Unused");
    b.extends(unused, object);

    let program = b.class("Program");
    let main = b.method(program, "Main").static_method().build();
    let ts = b.finish();

    let group = SingleModuleGroup::default();
    let mut codegen = ScriptedCodegen::new(PTR.bytes());
    codegen.script(
        main,
        Script::default()
            .reloc(ArtifactKey::constructed_type(point))
            .reloc(ArtifactKey::method_body(ctor)),
    );

    let mut c = Compilation::new(Options::default(), &ts, &group, &mut codegen);
    let root = c.add_root(ArtifactKey::method_body(main), "entry point")?;
    c.run_to_fixed_point()?;

    // Full vtables pull in every override of a constructed type.
    for m in [main, ctor, point_to_string, to_string] {
        assert!(c.is_marked(&ArtifactKey::method_body(m)));
    }
    assert_eq!(4, c.stats().methods_compiled);
    assert!(c.node(&ArtifactKey::constructed_type(unused)).is_none());

    let point_desc = c.node(&ArtifactKey::constructed_type(point)).unwrap();
    let chain = c.explain(point_desc);
    assert_eq!(Some(&(root, "entry point")), chain.last());

    let mut w = MemoryObjectWriter::new(PTR);
    c.emit_all(&mut w)?;

    let node_sym = |key: &ArtifactKey| c.factory().node_symbol(c.node(key).unwrap());
    let point_sym = node_sym(&ArtifactKey::constructed_type(point));
    let object_sym = node_sym(&ArtifactKey::constructed_type(object));
    let override_sym = node_sym(&ArtifactKey::method_body(point_to_string));
    let main_sym = node_sym(&ArtifactKey::method_body(main));
    let ctor_sym = node_sym(&ArtifactKey::method_body(ctor));

    let addr = |sym| w.address(sym).unwrap().to_le_bytes();

    // Related type,
    //   then the single inherited slot filled with the override.
    assert_eq!(Some(&addr(object_sym)[..]), w.bytes_at(point_sym, 8, 8));
    assert_eq!(1, u16::from_le_bytes(
        w.bytes_at(point_sym, 16, 2).unwrap().try_into().unwrap()
    ));
    assert_eq!(Some(&addr(override_sym)[..]), w.bytes_at(point_sym, 24, 8));

    // Main refers to both the descriptor and the constructor.
    assert_eq!(Some(&addr(point_sym)[..]), w.bytes_at(main_sym, 0, 8));
    assert_eq!(Some(&addr(ctor_sym)[..]), w.bytes_at(main_sym, 8, 8));

    assert!(w.imports().is_empty());

    Ok(())
}
