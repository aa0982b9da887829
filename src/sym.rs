// String interning for symbol names
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

//! Interned symbol names.
//!
//! Every emitted artifact is identified in the object file by a mangled
//!   name,
//!     and the same name is compared many times over the course of a
//!     compilation
//!       (duplicate detection,
//!         relocation resolution,
//!         and deterministic ordering).
//! Names are therefore interned once into an arena and referred to
//!   thereafter by a [`SymbolId`],
//!     which is a 32-bit integer that is cheap to copy,
//!       compare,
//!       and hash.
//!
//! Unlike a global interner,
//!   each [`Interner`] is owned by a single compilation,
//!   so [`SymbolId`]s from different compilations must never be mixed.
//!
//! ```
//! use aotc::sym::Interner;
//!
//! let interner = Interner::new();
//!
//! let a = interner.intern("__EEType_Point");
//! let b = interner.intern(&"__EEType_Point".to_string());
//! let c = interner.intern("__EEType_Line");
//!
//! assert_eq!(a, b);
//! assert_ne!(a, c);
//! assert_eq!(2, interner.len());
//! assert_eq!("__EEType_Line", interner.lookup(c));
//! ```

use crate::global;
use bumpalo::Bump;
use fxhash::FxHashMap;
use std::{
    cell::RefCell,
    fmt::{self, Display},
};

/// Unique identifier for an interned string.
///
/// This is a non-zero value so that `Option<SymbolId>` is the same size
///   as [`SymbolId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(global::NonZeroSymbolIdSize);

assert_eq_size!(Option<SymbolId>, SymbolId);

impl SymbolId {
    pub fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sym#{}", self.0)
    }
}

/// Arena-backed string interner.
///
/// The interner employs interior mutability so that names may be interned
///   through a shared reference while other parts of the compilation hold
///   references to already-interned strings.
pub struct Interner {
    /// Storage for interned strings.
    arena: Bump,

    /// Interned strings by [`SymbolId`].
    ///
    /// The first index is always populated during initialization to
    ///   ensure that no [`SymbolId`] is `0`.
    ///
    /// These slices point into `arena` and must never be exposed with a
    ///   lifetime outliving `self`.
    strings: RefCell<Vec<&'static str>>,

    map: RefCell<FxHashMap<&'static str, SymbolId>>,
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Interner {
    pub fn new() -> Self {
        Self {
            arena: Bump::new(),
            strings: RefCell::new(vec![""]),
            map: RefCell::new(FxHashMap::default()),
        }
    }

    /// Intern a string slice or return an existing [`SymbolId`].
    pub fn intern(&self, value: &str) -> SymbolId {
        let mut map = self.map.borrow_mut();

        if let Some(sym) = map.get(value) {
            return *sym;
        }

        let mut strings = self.strings.borrow_mut();
        let id = next_symbol_id(strings.len());
        let clone = self.copy_slice_into_arena(value);

        map.insert(clone, id);
        strings.push(clone);

        id
    }

    /// Retrieve an existing intern without interning.
    pub fn intern_soft(&self, value: &str) -> Option<SymbolId> {
        self.map.borrow().get(value).copied()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.map.borrow().contains_key(value)
    }

    /// Number of unique interned strings.
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the string associated with a symbol.
    ///
    /// Symbols are only produced by [`Interner::intern`],
    ///   so a symbol from this interner always resolves.
    /// A symbol from another interner may resolve to an unrelated string
    ///   or to the empty string.
    pub fn lookup(&self, sym: SymbolId) -> &str {
        self.strings
            .borrow()
            .get(sym.as_usize())
            .copied()
            .unwrap_or_default()
    }

    fn copy_slice_into_arena(&self, value: &str) -> &'static str {
        let copy = self.arena.alloc_str(value);

        // The arena is never reset and lives as long as `self`;
        //   the `'static` lifetime never escapes this type.
        unsafe { &*(copy as *const str) }
    }
}

fn next_symbol_id(len: usize) -> SymbolId {
    let index = global::SymbolIdSize::try_from(len)
        .ok()
        .and_then(global::NonZeroSymbolIdSize::new);

    match index {
        Some(nz) => SymbolId(nz),
        None => crate::diagnostic_panic!(
            vec![],
            "SymbolId range exhausted after {len} symbols",
        ),
    }
}
