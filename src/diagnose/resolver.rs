// Diagnostic entity resolution
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

//! Resolve [`Entity`]s into human-readable descriptions.
//!
//! An [`Entity`] is an opaque handle that is cheap to store in errors.
//! Only when a diagnostic is rendered do we ask the type system
//!   (or the dependency graph)
//!   what the handle actually refers to.

use super::Entity;
use crate::ts::{TypeCategory, TypeId, TypeSystem};
use std::{error::Error, fmt::Display};

/// Resolves [`Entity`]s into descriptions suitable for display.
pub trait EntityResolver {
    fn resolve(
        &self,
        entity: Entity,
    ) -> Result<ResolvedEntity, EntityResolverError>;
}

/// An [`Entity`] resolved into something a human can read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    entity: Entity,
    kind: &'static str,
    name: String,
}

impl ResolvedEntity {
    pub fn new<S: Into<String>>(
        entity: Entity,
        kind: &'static str,
        name: S,
    ) -> Self {
        Self {
            entity,
            kind,
            name: name.into(),
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for ResolvedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} `{}` ({})", self.kind, self.name, self.entity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityResolverError {
    /// The resolver has no knowledge of this kind of entity.
    Unsupported(Entity),

    /// The entity has no useful description.
    Unknown,
}

impl Display for EntityResolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported(entity) => {
                write!(f, "no description is available for {entity}")
            }
            Self::Unknown => write!(f, "unknown entity"),
        }
    }
}

impl Error for EntityResolverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

/// Resolver that renders only the raw handle of each entity.
///
/// This is used by panics,
///   which have no access to the type system.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleResolver;

impl EntityResolver for HandleResolver {
    fn resolve(
        &self,
        entity: Entity,
    ) -> Result<ResolvedEntity, EntityResolverError> {
        match entity {
            Entity::Unknown => Err(EntityResolverError::Unknown),
            Entity::Type(_) => Ok(ResolvedEntity::new(entity, "type", "?")),
            Entity::Method(_) => {
                Ok(ResolvedEntity::new(entity, "method", "?"))
            }
            Entity::Field(_) => Ok(ResolvedEntity::new(entity, "field", "?")),
            Entity::Node(_) => Ok(ResolvedEntity::new(entity, "node", "?")),
        }
    }
}

/// Resolve types,
///   methods,
///   and fields by name using a [`TypeSystem`].
///
/// Graph nodes are not known to the type system and will fail to resolve.
pub struct TypeSystemResolver<'a> {
    ts: &'a dyn TypeSystem,
}

impl<'a> TypeSystemResolver<'a> {
    pub fn new(ts: &'a dyn TypeSystem) -> Self {
        Self { ts }
    }

    /// Render a type including its instantiation and parameterization.
    pub fn type_name(&self, ty: TypeId) -> String {
        let ts = self.ts;

        match ts.category(ty) {
            TypeCategory::SzArray | TypeCategory::MdArray(_)
            | TypeCategory::Pointer | TypeCategory::ByRef => {
                // The name of a parameterized type is already rendered by
                //   the type system from its element.
                ts.name(ty)
            }
            _ => {
                let args = ts.instantiation(ty);

                match args.is_empty() || ts.is_generic_definition(ty) {
                    true => ts.name(ty),
                    false => format!(
                        "{}<{}>",
                        ts.name(ty),
                        args.iter()
                            .map(|&a| self.type_name(a))
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                }
            }
        }
    }
}

impl<'a> EntityResolver for TypeSystemResolver<'a> {
    fn resolve(
        &self,
        entity: Entity,
    ) -> Result<ResolvedEntity, EntityResolverError> {
        match entity {
            Entity::Type(ty) => {
                Ok(ResolvedEntity::new(entity, "type", self.type_name(ty)))
            }
            Entity::Method(m) => {
                let desc = self.ts.method(m);
                let name =
                    format!("{}::{}", self.type_name(desc.owner), desc.name);

                Ok(ResolvedEntity::new(entity, "method", name))
            }
            Entity::Field(fld) => {
                let desc = self.ts.field(fld);
                let name =
                    format!("{}::{}", self.type_name(desc.owner), desc.name);

                Ok(ResolvedEntity::new(entity, "field", name))
            }
            Entity::Node(_) => Err(EntityResolverError::Unsupported(entity)),
            Entity::Unknown => Err(EntityResolverError::Unknown),
        }
    }
}
