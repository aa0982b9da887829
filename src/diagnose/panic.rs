// Internal consistency panics
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


//! Panics for violated internal invariants.
//!
//! User errors are returned as [`Diagnostic`]s.
//! The dependency graph additionally relies on invariants that no input
//!   can break
//!     (a node is finalized once,
//!       a relocation targets a marked node,
//!       a closed dictionary layout does not grow);
//!   if one of those does not hold,
//!     the compiler itself is wrong and the object file it would produce
//!     cannot be trusted.
//!
//! [`diagnostic_panic!`] aborts in that case.
//! It accepts the same [`AnnotatedEntity`]s that [`Diagnostic::describe`]
//!   produces so that the panic message names the types,
//!     methods,
//!     and nodes involved.
//! There is no type system available while panicking,
//!   so entities are rendered by their raw handles using
//!   [`HandleResolver`].
//!
//! Every message begins with `internal error:`,
//!   which is what tests match on.

use super::{
    AnnotatedEntity, Diagnostic, HandleResolver, Level, Reporter, VisualReporter,
};
use std::{
    cell::Cell,
    error::Error,
    fmt::{self, Debug, Display},
};

#[cfg(doc)]
use crate::diagnostic_panic;

const BANNER: &str = "\
!!! This is a bug in the compiler, not in the program being compiled.
!!! Compilation was aborted rather than produce a corrupt object file.
!!! Please report it along with the entities listed above.";

/// Summary and entities of an internal error.
///
/// The entities are taken when the error is described,
///   so it renders only once.
pub struct InternalError<'a> {
    summary: String,
    entities: Cell<Vec<AnnotatedEntity<'a>>>,
}

impl<'a> InternalError<'a> {
    pub fn new(summary: String, entities: Vec<AnnotatedEntity<'a>>) -> Self {
        Self {
            summary,
            entities: Cell::new(entities),
        }
    }
}

impl<'a> Debug for InternalError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InternalError({:?})", self.summary)
    }
}

impl<'a> Display for InternalError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

impl<'a> Error for InternalError<'a> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl<'a> Diagnostic for InternalError<'a> {
    fn describe(&self) -> Vec<AnnotatedEntity> {
        self.entities.take()
    }
}

/// Render the message of an internal error panic.
///
/// This is public only for the expansion of [`diagnostic_panic!`].
pub fn render(entities: Vec<AnnotatedEntity>, summary: String) -> String {
    let err = InternalError::new(summary, entities);
    let mut report = VisualReporter::new(HandleResolver).render(&err);

    report.escalate(Level::InternalError);
    format!("{report}{BANNER}")
}

/// Panic with a report naming the entities involved in a violated
///   internal invariant.
///
/// The first argument is a `Vec<AnnotatedEntity>`;
///   the remaining arguments are formatted like [`panic!`].
#[macro_export]
macro_rules! diagnostic_panic {
    ($entities:expr, $($fmt:tt)*) => {
        panic!(
            "{}",
            $crate::diagnose::panic::render($entities, format!($($fmt)*)),
        )
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{diagnose::Annotate, ts::TypeId};

    #[test]
    fn message_is_an_internal_error_naming_entities() {
        let ty = TypeId::from_index(3);
        let msg = render(vec![ty.note("involved")], "broken".into());

        assert!(msg.starts_with("internal error: broken\n"));
        assert!(msg.contains("  --> type `?` (type#3)\n   = note: involved\n"));
        assert!(msg.ends_with(BANNER));
    }

    #[test]
    fn entities_are_rendered_once() {
        let ty = TypeId::from_index(1);
        let err = InternalError::new("once".into(), vec![ty.mark_error()]);

        assert_eq!(1, err.describe().len());
        assert!(err.describe().is_empty());
    }

    #[should_panic = "internal error: node 7 is gone"]
    #[test]
    fn macro_formats_its_summary() {
        let n = 7;
        diagnostic_panic!(vec![], "node {n} is gone");
    }
}
