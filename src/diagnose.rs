// Diagnostic system
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

//! Diagnostic system for error reporting.
//!
//! Errors produced by the compiler are attributed to the [`Entity`] that
//!   caused them:
//!     a type,
//!     a method,
//!     a field,
//!     or a node of the dependency graph.
//! An entity is a cheap handle;
//!   turning it into something a human can read requires the type system
//!   or the graph,
//!     which is the job of an [`EntityResolver`].
//! Resolution is deferred until a report is actually rendered,
//!   since the happy path of the compiler never needs it.

mod report;
mod resolver;

pub mod panic;

pub use report::{Reporter, VisualReporter};
pub use resolver::{
    EntityResolver, EntityResolverError, HandleResolver, ResolvedEntity,
    TypeSystemResolver,
};

use crate::{
    graph::NodeId,
    ts::{FieldId, MethodId, TypeId},
};
use std::{
    borrow::Cow,
    error::Error,
    fmt::{self, Display},
};

/// Diagnostic report.
///
/// This describes an error condition or other special event using a series
///   of [`Entity`]s to describe the source, cause, and circumstances around
///   an event.
pub trait Diagnostic: Error + Sized {
    /// Produce a series of [`AnnotatedEntity`]s describing the source and
    ///   circumstances of the diagnostic event.
    fn describe(&self) -> Vec<AnnotatedEntity>;
}

/// Something to which a diagnostic may be attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Entity {
    Type(TypeId),
    Method(MethodId),
    Field(FieldId),
    Node(NodeId),

    /// The diagnostic cannot be attributed to anything in particular.
    #[default]
    Unknown,
}

impl Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Type(ty) => Display::fmt(ty, f),
            Self::Method(m) => Display::fmt(m, f),
            Self::Field(fld) => Display::fmt(fld, f),
            Self::Node(node) => write!(f, "node#{}", node.index()),
            Self::Unknown => write!(f, "<unknown>"),
        }
    }
}

impl From<TypeId> for Entity {
    fn from(ty: TypeId) -> Self {
        Self::Type(ty)
    }
}

impl From<MethodId> for Entity {
    fn from(m: MethodId) -> Self {
        Self::Method(m)
    }
}

impl From<FieldId> for Entity {
    fn from(fld: FieldId) -> Self {
        Self::Field(fld)
    }
}

impl From<NodeId> for Entity {
    fn from(node: NodeId) -> Self {
        Self::Node(node)
    }
}

/// Severity of a report or of one of its annotations.
///
/// Variants are ordered from most to least severe,
///   so the severity of a report is the minimum over its annotations.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub enum Level {
    /// A violated invariant of the compiler itself.
    InternalError,

    /// The program being compiled cannot be compiled as written.
    #[default]
    Error,

    Note,
    Help,
}

impl Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InternalError => "internal error",
            Self::Error => "error",
            Self::Note => "note",
            Self::Help => "help",
        })
    }
}

/// Text accompanying an annotated [`Entity`].
///
/// Most labels are string literals;
///   formatted labels are owned.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Label<'a>(Cow<'a, str>);

impl<'a> Display for Label<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'a> From<String> for Label<'a> {
    fn from(s: String) -> Self {
        Self(Cow::Owned(s))
    }
}

impl<'a> From<&'a str> for Label<'a> {
    fn from(s: &'a str) -> Self {
        Self(Cow::Borrowed(s))
    }
}

/// An [`Entity`] as it participates in a diagnostic.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AnnotatedEntity<'l> {
    pub entity: Entity,
    pub level: Level,
    pub label: Option<Label<'l>>,
}

/// Annotation of anything convertible into an [`Entity`].
///
/// This lets errors describe themselves tersely:
///
/// ```
/// # use aotc::{diagnose::Annotate, ts::TypeId};
/// let ty = TypeId::from_index(0);
/// let desc = vec![ty.error("cannot be loaded"), ty.help("try a class")];
/// # assert_eq!(2, desc.len());
/// ```
pub trait Annotate: Into<Entity> {
    fn annotate<'l>(self, level: Level, label: Option<Label<'l>>) -> AnnotatedEntity<'l> {
        AnnotatedEntity {
            entity: self.into(),
            level,
            label,
        }
    }

    fn internal_error<'l, L: Into<Label<'l>>>(self, label: L) -> AnnotatedEntity<'l> {
        self.annotate(Level::InternalError, Some(label.into()))
    }

    fn error<'l, L: Into<Label<'l>>>(self, label: L) -> AnnotatedEntity<'l> {
        self.annotate(Level::Error, Some(label.into()))
    }

    /// An error with nothing to say beyond the entity itself.
    fn mark_error(self) -> AnnotatedEntity<'static> {
        self.annotate(Level::Error, None)
    }

    fn note<'l, L: Into<Label<'l>>>(self, label: L) -> AnnotatedEntity<'l> {
        self.annotate(Level::Note, Some(label.into()))
    }

    fn help<'l, L: Into<Label<'l>>>(self, label: L) -> AnnotatedEntity<'l> {
        self.annotate(Level::Help, Some(label.into()))
    }
}

impl<E: Into<Entity>> Annotate for E {}
