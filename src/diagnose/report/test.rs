// Diagnostic system rendering tests
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
    diagnose::{Annotate, HandleResolver},
    ts::{MethodId, TypeId},
};
use std::{error::Error, fmt::Display};

#[derive(Debug)]
struct StubError(String, Vec<AnnotatedEntity<'static>>);

impl Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for StubError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl Diagnostic for StubError {
    fn describe(&self) -> Vec<AnnotatedEntity> {
        self.1.clone()
    }
}

macro_rules! assert_report {
    ($msg:expr, $aents:expr, $expected:expr) => {
        let mut sut = VisualReporter::new(HandleResolver);

        assert_eq!(
            sut.render(&StubError($msg.into(), $aents)).to_string(),
            $expected,
        );
    };
}

#[test]
fn no_entities() {
    assert_report!("no entities", vec![], "error: no entities\n");
}

#[test]
fn single_labeled_entity() {
    let ty = TypeId::from_index(5);

    assert_report!(
        "bad type",
        vec![ty.error("cannot be constructed")],
        "\
error: bad type
  --> type `?` (type#5)
   = error: cannot be constructed
"
    );
}

#[test]
fn adjacent_sections_for_same_entity_are_squashed() {
    let ty = TypeId::from_index(1);
    let m = MethodId::from_index(2);

    assert_report!(
        "squashed",
        vec![ty.error("first"), ty.help("second"), m.note("third")],
        "\
error: squashed
  --> type `?` (type#1)
   = error: first
   = help: second
  --> method `?` (method#2)
   = note: third
"
    );
}

#[test]
fn report_level_is_most_severe_section() {
    let ty = TypeId::from_index(1);
    let desc = StubError(
        "internal".into(),
        vec![ty.note("a"), ty.internal_error("b")],
    );

    let mut sut = VisualReporter::new(HandleResolver);
    let report = sut.render(&desc);

    assert_eq!(Level::InternalError, report.level());
    assert!(report.to_string().starts_with("internal error: internal\n"));
}

#[test]
fn unknown_entity_renders_without_resolution() {
    assert_report!(
        "lost",
        vec![Entity::Unknown.mark_error()],
        "\
error: lost
  --> <unknown>
"
    );
}
