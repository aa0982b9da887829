// Global constants across the entirety of AOTC
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

//! Sizes and limits shared by every compilation.
//!
//! These are compile-time constants of the compiler itself,
//!   fixed by the formats the runtime reads
//!     or by the width of our own handles.
//! Keeping them in one place lets a change in one subsystem be checked
//!   against the others
//!     (see the assertion at the bottom of this file).
//!
//! Import the module and write `global::NodeIdSize` rather than
//!   importing members,
//!     so that uses of these values stand out.
//!
//! Anything that varies between two compilations belongs in
//!   [`crate::session`] instead.

use std::num;

/// A size capable of representing every node of a single compilation's
///   dependency graph.
///
/// Every artifact that could conceivably be emitted receives a node,
///   including purely logical ones that are never written,
///   so this must accommodate far more than the number of symbols in the
///   final object file.
pub type NodeIdSize = u32;

/// A size capable of representing every interned symbol name of a
///   compilation.
///
/// This must be ≥ [`NodeIdSize`],
///   since every node has a mangled name.
pub type SymbolIdSize = u32;

/// A non-zero equivalent of [`SymbolIdSize`].
pub type NonZeroSymbolIdSize = num::NonZeroU32;

/// A size capable of representing every slot of a single generic
///   dictionary.
pub type DictSlotSize = u32;

/// Maximum rank of a multi-dimensional array for which a type descriptor
///   may be produced.
///
/// The runtime stores array bounds inline after the length,
///   and its loader rejects anything larger.
pub const MAX_ARRAY_RANK: u32 = 32;

/// Maximum array component size representable in a type descriptor.
///
/// Component sizes are stored in a 16-bit field.
pub const MAX_COMPONENT_SIZE: u32 = 0xFFFF;

/// Maximum number of vtable slots or interfaces representable in a type
///   descriptor.
pub const MAX_DESCRIPTOR_COUNT: usize = u16::MAX as usize;

assert_eq_size!(NodeIdSize, SymbolIdSize);
