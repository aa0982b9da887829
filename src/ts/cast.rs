// Static castability between types
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

//! Compile-time mirror of the runtime's cast rules.
//!
//! The dependency graph needs to know whether an object of one type could
//!   be observed as another
//!     (e.g. to decide which generic virtual method implementations a
//!       marked type could be asked for).
//! These rules must agree with the runtime bit for bit,
//!   including the quirk that arrays of integral types are castable to
//!   arrays and generic collection interfaces of other integral types of
//!   the same size
//!     (an `int[]` is an `IList<uint>`).

use super::{TypeCategory, TypeId, TypeSystem, TypeSystemExt, Variance};
use crate::session::PointerSize;

/// Variance rule applied to a single generic argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgVariance {
    NonVariant,
    Covariant,
    Contravariant,

    /// Covariance extended with integral size equivalence,
    ///   used for the generic interfaces implemented by arrays.
    ArrayCovariant,
}

impl From<Variance> for ArgVariance {
    fn from(v: Variance) -> Self {
        match v {
            Variance::NonVariant => Self::NonVariant,
            Variance::Covariant => Self::Covariant,
            Variance::Contravariant => Self::Contravariant,
        }
    }
}

/// Whether a value of type `source` may be cast to `target`.
pub fn can_cast_to(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    source: TypeId,
    target: TypeId,
) -> bool {
    assignable(ts, ptr, source, target, true, false)
}

fn assignable(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    source: TypeId,
    target: TypeId,
    boxed_source: bool,
    allow_size_equivalence: bool,
) -> bool {
    if source == target {
        return true;
    }

    let scat = ts.category(source);
    let tcat = ts.category(target);

    // Unboxed value types are only assignable to themselves,
    //   modulo integral size equivalence.
    if scat.is_value_type() && !boxed_source {
        return allow_size_equivalence && size_equivalent(ptr, scat, tcat);
    }

    if tcat.is_interface() && implements(ts, ptr, source, target) {
        return true;
    }

    if scat.is_array() {
        if let (Some(selem), Some(telem)) =
            (ts.element_type(source), ts.element_type(target))
        {
            if tcat == scat {
                return element_assignable(ts, ptr, selem, telem);
            }
        }
    }

    // Parameterized types never derive from anything else.
    if matches!(
        scat,
        TypeCategory::Pointer | TypeCategory::ByRef | TypeCategory::FunctionPointer
    ) {
        return false;
    }

    ts.base_chain(source).skip(1).any(|base| base == target)
}

/// Array elements are compared with array covariance:
///   reference elements follow ordinary assignability while value type
///   elements must match exactly or by integral size.
fn element_assignable(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    source: TypeId,
    target: TypeId,
) -> bool {
    if source == target {
        return true;
    }

    let scat = ts.category(source);
    let tcat = ts.category(target);

    match (scat.is_value_type(), tcat.is_value_type()) {
        (true, true) => size_equivalent(ptr, scat, tcat),
        (false, false) => assignable(ts, ptr, source, target, false, false),
        _ => false,
    }
}

fn size_equivalent(ptr: PointerSize, a: TypeCategory, b: TypeCategory) -> bool {
    match (a.underlying_primitive(), b.underlying_primitive()) {
        (Some(a), Some(b)) => {
            let size = a.integral_match_size(ptr);
            size != 0 && size == b.integral_match_size(ptr)
        }
        _ => false,
    }
}

fn implements(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    source: TypeId,
    target: TypeId,
) -> bool {
    let tdef = ts.type_definition(target);
    let source_is_array = ts.category(source) == TypeCategory::SzArray;

    ts.runtime_interfaces(source).into_iter().any(|iface| {
        iface == target
            || (ts.type_definition(iface) == tdef
                && compatible_via_variance(
                    ts,
                    ptr,
                    iface,
                    target,
                    source_is_array,
                ))
    })
}

/// Whether two instantiations of the same generic definition are
///   compatible through the variance of its parameters.
fn compatible_via_variance(
    ts: &dyn TypeSystem,
    ptr: PointerSize,
    source: TypeId,
    target: TypeId,
    array_rules: bool,
) -> bool {
    let def = ts.type_definition(target);
    let sargs = ts.instantiation(source);
    let targs = ts.instantiation(target);

    if sargs.len() != targs.len() {
        return false;
    }

    sargs.iter().zip(targs.iter()).enumerate().all(|(i, (&s, &t))| {
        let variance = match (array_rules, ArgVariance::from(ts.variance(def, i))) {
            (true, ArgVariance::NonVariant | ArgVariance::Covariant) => {
                ArgVariance::ArrayCovariant
            }
            (_, other) => other,
        };

        match variance {
            ArgVariance::NonVariant => s == t,
            ArgVariance::Covariant => {
                s == t || (ts.is_reference(s) && assignable(ts, ptr, s, t, false, false))
            }
            ArgVariance::Contravariant => {
                s == t || (ts.is_reference(t) && assignable(ts, ptr, t, s, false, false))
            }
            ArgVariance::ArrayCovariant => element_assignable(ts, ptr, s, t),
        }
    })
}
