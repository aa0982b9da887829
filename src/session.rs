// Compilation session configuration and state
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

//! Per-compilation configuration and counters.
//!
//! Everything that may differ between two compilations running in the
//!   same process lives here rather than in [`crate::global`],
//!     so that concurrent compilations
//!       (e.g. in tests)
//!       cannot observe one another.
//!
//! A [`Session`] is owned by a
//!   [`Compilation`](crate::compilation::Compilation) and threaded by
//!   reference through the marking engine and emitters.

use crate::ts::{MethodId, TypeId};
use std::fmt::{self, Display};

/// Size of a target pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PointerSize {
    Four,
    #[default]
    Eight,
}

impl PointerSize {
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Round `value` up to the next multiple of the pointer size.
    pub const fn align(self, value: u32) -> u32 {
        let ptr = self.bytes();
        (value + ptr - 1) & !(ptr - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Arch {
    #[default]
    X64,
    X86,
    Arm,
    Arm64,
}

/// Target machine description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target {
    pub arch: Arch,
    pub pointer_size: PointerSize,
}

impl Target {
    pub fn new(arch: Arch) -> Self {
        let pointer_size = match arch {
            Arch::X64 | Arch::Arm64 => PointerSize::Eight,
            Arch::X86 | Arch::Arm => PointerSize::Four,
        };

        Self { arch, pointer_size }
    }

    /// Whether 8-byte aligned fields require 8-byte aligned objects.
    pub fn requires_align8(&self) -> bool {
        matches!(self.arch, Arch::Arm)
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ({}-byte pointers)", self.arch, self.pointer_size.bytes())
    }
}

/// Compilation options.
///
/// Options are set once before roots are added and are never mutated
///   during marking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub target: Target,

    /// Produce full vtables for every constructed type regardless of what
    ///   the [`CompilationGroup`] requests.
    pub full_analysis: bool,

    /// Add dependencies required to make custom attributes usable at
    ///   runtime.
    pub scan_custom_attributes: bool,

    /// Record reflectable methods in the reflection invoke map.
    pub reflection_invoke_map: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            target: Target::default(),
            full_analysis: false,
            scan_custom_attributes: false,
            reflection_invoke_map: true,
        }
    }
}

impl Options {
    pub fn with_target(self, target: Target) -> Self {
        Self { target, ..self }
    }

    pub fn with_full_analysis(self, full_analysis: bool) -> Self {
        Self {
            full_analysis,
            ..self
        }
    }

    pub fn with_custom_attribute_scan(self, scan: bool) -> Self {
        Self {
            scan_custom_attributes: scan,
            ..self
        }
    }

    pub fn with_reflection_invoke_map(self, enabled: bool) -> Self {
        Self {
            reflection_invoke_map: enabled,
            ..self
        }
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.target.pointer_size
    }
}

/// Counters collected while driving the marking engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Number of times the static worklist was drained.
    pub worklist_drains: usize,

    /// Number of passes over nodes with dynamic dependencies.
    pub dynamic_passes: usize,

    /// Number of passes over nodes with conditional dependencies.
    pub conditional_passes: usize,

    pub nodes_marked: usize,
    pub methods_compiled: usize,
}

/// State of a single compilation.
#[derive(Debug, Default)]
pub struct Session {
    options: Options,
    stats: Stats,
}

impl Session {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            stats: Stats::default(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.options.pointer_size()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    /// Options alongside mutable counters,
    ///   for callers that must consult one while updating the other.
    pub(crate) fn parts_mut(&mut self) -> (&Options, &mut Stats) {
        (&self.options, &mut self.stats)
    }
}

/// Policy describing the set of code being compiled together.
///
/// This is supplied by the driver.
pub trait CompilationGroup {
    /// Whether constructed descriptors for `ty` should carry every vtable
    ///   slot rather than only those proven to be used.
    fn full_vtable(&self, ty: TypeId) -> bool;

    /// Whether a reference to `ty` from shared code must go through an
    ///   indirection cell because it lives outside of this group.
    fn requires_indirection(&self, ty: TypeId) -> bool;

    /// Whether `method` should be invokable through reflection.
    fn is_reflectable(&self, method: MethodId) -> bool;
}

/// Everything is compiled into a single module.
#[derive(Debug, Clone, Default)]
pub struct SingleModuleGroup {
    /// Emit only the vtable slots proven to be used.
    pub lazy_vtables: bool,

    /// Types considered to be outside of this module.
    pub external_types: Vec<TypeId>,

    /// Methods exposed to reflection.
    pub reflectable: Vec<MethodId>,
}

impl CompilationGroup for SingleModuleGroup {
    fn full_vtable(&self, _ty: TypeId) -> bool {
        !self.lazy_vtables
    }

    fn requires_indirection(&self, ty: TypeId) -> bool {
        self.external_types.contains(&ty)
    }

    fn is_reflectable(&self, method: MethodId) -> bool {
        self.reflectable.contains(&method)
    }
}
