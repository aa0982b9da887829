// Type descriptor optional fields
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


//! Rarely present type descriptor fields.
//!
//! Fields that most types do not need are kept out of the fixed part of
//!   the type descriptor and stored in a compact blob referenced by the
//!   descriptor's optional-fields pointer.
//! Each present field is written as a tag byte holding its
//!   [`OptionalField`] index,
//!     with the high bit set on the last field,
//!   followed by the field's value as a compressed unsigned integer
//!   (see [`crate::native`]).

use crate::native::encode_unsigned;

/// Index of an optional field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OptionalField {
    RareFlags = 0,
    ICastableIsInstSlot = 1,

    /// Index of the interface dispatch map within the external
    ///   reference table.
    DispatchMap = 2,

    ValueTypeFieldPadding = 3,

    /// Offset of the value within a nullable type,
    ///   less one.
    NullableValueOffset = 4,

    ICastableGetImplTypeSlot = 5,
}

impl OptionalField {
    pub const COUNT: usize = 6;

    pub const ALL: [OptionalField; Self::COUNT] = [
        Self::RareFlags,
        Self::ICastableIsInstSlot,
        Self::DispatchMap,
        Self::ValueTypeFieldPadding,
        Self::NullableValueOffset,
        Self::ICastableGetImplTypeSlot,
    ];
}

/// Bits of the [`OptionalField::RareFlags`] field.
pub mod rare {
    /// Instances must be 8-byte aligned.
    pub const REQUIRES_ALIGN8: u32 = 0x0001;
    pub const ICASTABLE: u32 = 0x0002;
    pub const IS_NULLABLE: u32 = 0x0004;
    pub const HAS_CCTOR: u32 = 0x0020;

    /// Homogeneous floating-point aggregate.
    pub const IS_HFA: u32 = 0x0100;
}

/// Set of optional field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionalFields {
    values: [Option<u32>; OptionalField::COUNT],
}

impl OptionalFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: OptionalField, value: u32) {
        self.values[field as usize] = Some(value);
    }

    pub fn get(&self, field: OptionalField) -> Option<u32> {
        self.values[field as usize]
    }

    /// Set bits of the rare flags field,
    ///   creating it if necessary.
    pub fn add_rare_flags(&mut self, flags: u32) {
        let cur = self.get(OptionalField::RareFlags).unwrap_or(0);
        self.set(OptionalField::RareFlags, cur | flags);
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Encoded blob,
    ///   which is empty if no field is present.
    pub fn encode(&self) -> Vec<u8> {
        let present = OptionalField::ALL
            .iter()
            .filter_map(|&field| self.get(field).map(|value| (field, value)))
            .collect::<Vec<_>>();

        let mut out = Vec::new();

        for (i, &(field, value)) in present.iter().enumerate() {
            let last = match i + 1 == present.len() {
                true => 0x80,
                false => 0,
            };

            out.push(field as u8 | last);
            encode_unsigned(&mut out, value);
        }

        out
    }
}

/// Value of [`OptionalField::ValueTypeFieldPadding`],
///   or [`None`] if the default of no padding with pointer alignment
///   applies.
pub fn value_type_field_padding(padding: u32, alignment: u32, ptr: u32) -> Option<u32> {
    if padding == 0 && alignment == ptr {
        return None;
    }

    let low = padding & 0x7;
    let high = (padding & !0x7) >> 3;
    let log2_align = alignment.max(1).trailing_zeros();

    Some(low | (high << 8) | (log2_align << 3))
}
