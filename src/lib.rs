// Ahead-of-time compiler core
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


//! Dependency analysis and object emission for an ahead-of-time compiler
//!   of managed code.
//!
//! Given a [type system](ts::TypeSystem) describing the program,
//!   a [code generator](codegen::Codegen),
//!   and a set of roots
//!     (typically the entry point),
//!   a [`Compilation`](compilation::Compilation) determines the minimal
//!   set of runtime artifacts that the program requires:
//!     type descriptors,
//!     compiled method bodies,
//!     generic dictionaries,
//!     static storage,
//!     interface dispatch cells,
//!     and runtime lookup tables.
//! These are discovered by marking a [dependency graph](graph) to a fixed
//!   point and are then [emitted](emit) as relocatable
//!   [object data](obj) with [mangled](mangle) symbol names.
//!
//! The embedder supplies the type system,
//!   the code generator,
//!   and the [object writer](obj::writer::ObjectWriter);
//!     reference implementations of each
//!       ([`ts::universe`],
//!         [`codegen::ScriptedCodegen`],
//!         and [`obj::writer::MemoryObjectWriter`])
//!     are provided for testing.

// We build docs for private items.
#![allow(rustdoc::private_intra_doc_links)]

pub mod global;

#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod diagnose;

pub mod attr;
pub mod codegen;
pub mod compilation;
pub mod deps;
pub mod emit;
pub mod generic;
pub mod graph;
pub mod mangle;
pub mod native;
pub mod obj;
pub mod session;
pub mod sym;
pub mod ts;
