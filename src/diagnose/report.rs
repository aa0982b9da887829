// Diagnostic system rendering
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

//! Rendering of diagnostic information.
//!
//! A report is a heading line followed by one section per described
//!   entity:
//!
//! ```text
//! error: cannot produce a type descriptor
//!   --> type `System.Int32&` (type#4)
//!    = error: byref types have no runtime descriptor
//! ```

// `write!` with an explicit `\n` is used throughout rather than `writeln!`.

use super::{
    resolver::{EntityResolver, EntityResolverError, ResolvedEntity},
    AnnotatedEntity, Diagnostic, Entity, Label, Level,
};
use std::fmt::{self, Display};

pub trait Reporter {
    /// Produce a [`Report`] for `diagnostic`,
    ///   to be rendered with [`Display`].
    ///
    /// This cannot fail.
    /// An entity that cannot be resolved is rendered by its handle with a
    ///   note explaining why.
    fn render<'d, D: Diagnostic>(&mut self, diagnostic: &'d D)
        -> Report<'d, D>;
}

/// Render a diagnostic report with one section per described entity.
pub struct VisualReporter<R: EntityResolver> {
    resolver: R,
}

impl<R: EntityResolver> VisualReporter<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

impl<R: EntityResolver> Reporter for VisualReporter<R> {
    fn render<'d, D: Diagnostic>(
        &mut self,
        diagnostic: &'d D,
    ) -> Report<'d, D> {
        let sections = diagnostic
            .describe()
            .into_iter()
            .map(|AnnotatedEntity { entity, level, label }| {
                let elabel = label.map(|label| EntityLabel(level, label));

                let heading = match self.resolver.resolve(entity) {
                    Ok(resolved) => Heading::Resolved(resolved),
                    Err(e) => Heading::Unresolved(entity, e),
                };

                Section::new(heading, elabel)
            })
            .collect::<Vec<_>>();

        let mut report = Report::empty(diagnostic);
        report.extend(sections);
        report
    }
}

#[derive(Debug)]
pub struct Report<'d, D: Diagnostic> {
    msg: &'d D,
    secs: Vec<Section<'d>>,
    level: Level,
}

impl<'d, D: Diagnostic> Report<'d, D> {
    fn empty(msg: &'d D) -> Self {
        Self {
            msg,
            secs: Vec::new(),
            level: Level::default(),
        }
    }

    /// Most severe level of any section in the report.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Report at least as severely as `level`,
    ///   regardless of the levels of its sections.
    pub fn escalate(&mut self, level: Level) {
        self.level = self.level.min(level);
    }
}

impl<'d, D: Diagnostic> Extend<Section<'d>> for Report<'d, D> {
    fn extend<T: IntoIterator<Item = Section<'d>>>(&mut self, secs: T) {
        for sec in secs {
            self.level = self.level.min(sec.level);

            // Add the section if it cannot be squashed into the previous.
            let remain = sec.maybe_squash_into(self.secs.last_mut());
            self.secs.extend(remain);
        }
    }
}

impl<'d, D: Diagnostic> Display for Report<'d, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{level}: {msg}\n", level = self.level, msg = self.msg)?;
        self.secs.iter().try_for_each(|sec| sec.fmt(f))
    }
}

/// A section of a [`Report`] describing an [`Entity`].
///
/// Consecutive annotations of the same [`Entity`] share one section.
/// An entity annotated again later gets a new section.
#[derive(Debug, PartialEq, Eq)]
pub struct Section<'d> {
    heading: Heading,
    labels: Vec<EntityLabel<'d>>,
    level: Level,
}

impl<'d> Section<'d> {
    fn new(heading: Heading, olabel: Option<EntityLabel<'d>>) -> Self {
        let level = olabel.as_ref().map(|l| l.0).unwrap_or_default();
        let mut labels = heading.system_labels();
        labels.extend(olabel);

        Self {
            heading,
            labels,
            level,
        }
    }

    /// Merge into `extend` if both describe the same [`Entity`],
    ///   otherwise give `self` back.
    fn maybe_squash_into(
        self,
        extend: Option<&mut Section<'d>>,
    ) -> Option<Self> {
        match extend {
            Some(extend_sec)
                if self.heading.entity() == extend_sec.heading.entity() =>
            {
                extend_sec.level = extend_sec.level.min(self.level);
                extend_sec.labels.extend(
                    self.labels
                        .into_iter()
                        .filter(|l| !l.is_system()),
                );
                None
            }

            _ => Some(self),
        }
    }
}

impl<'d> Display for Section<'d> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  --> {heading}\n", heading = self.heading)?;

        for label in self.labels.iter() {
            write!(f, "{label}\n")?;
        }

        Ok(())
    }
}

/// Heading describing a (hopefully resolved) entity.
#[derive(Debug, PartialEq, Eq)]
enum Heading {
    Resolved(ResolvedEntity),
    Unresolved(Entity, EntityResolverError),
}

impl Heading {
    fn entity(&self) -> Entity {
        match self {
            Self::Resolved(resolved) => resolved.entity(),
            Self::Unresolved(entity, _) => *entity,
        }
    }

    /// Labels explaining why the entity could not be resolved.
    fn system_labels(&self) -> Vec<EntityLabel<'static>> {
        match self {
            Self::Unresolved(_, EntityResolverError::Unknown) => vec![],
            Self::Unresolved(_, e) => vec![EntityLabel(
                Level::Help,
                format!(
                    "unable to describe this entity: {e}"
                )
                .into(),
            )],
            Self::Resolved(_) => vec![],
        }
    }
}

impl Display for Heading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(resolved) => Display::fmt(resolved, f),
            Self::Unresolved(entity, _) => Display::fmt(entity, f),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct EntityLabel<'l>(Level, Label<'l>);

impl<'l> EntityLabel<'l> {
    fn is_system(&self) -> bool {
        self.0 == Level::Help
            && self.1.to_string().starts_with("unable to describe")
    }
}

impl<'l> Display for EntityLabel<'l> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(level, label) = self;
        write!(f, "   = {level}: {label}")
    }
}

#[cfg(test)]
mod test;
