// Native format reader for tests
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


//! Decoding of blobs produced by [`NativeWriter`](super::NativeWriter).
//!
//! The runtime owns the real reader;
//!   this one exists to verify what the writer produces.

/// A view over a native format blob.
pub struct NativeReader<'a> {
    data: &'a [u8],
}

impl<'a> NativeReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn u8(&self, at: usize) -> u32 {
        self.data[at] as u32
    }

    fn u16(&self, at: usize) -> u32 {
        u16::from_le_bytes([self.data[at], self.data[at + 1]]) as u32
    }

    fn u32(&self, at: usize) -> u32 {
        let d = &self.data[at..at + 4];
        u32::from_le_bytes([d[0], d[1], d[2], d[3]])
    }

    /// Decode an unsigned value at `at`,
    ///   returning it along with the offset following it.
    pub fn unsigned(&self, at: usize) -> (u32, usize) {
        let b = self.u8(at);

        if b & 0b1 == 0 {
            (b >> 1, at + 1)
        } else if b & 0b10 == 0 {
            (self.u16(at) >> 2, at + 2)
        } else if b & 0b100 == 0 {
            ((b >> 3) | (self.u16(at + 1) << 5), at + 3)
        } else if b & 0b1000 == 0 {
            (self.u32(at) >> 4, at + 4)
        } else {
            (self.u32(at + 1), at + 5)
        }
    }

    pub fn signed(&self, at: usize) -> (i32, usize) {
        let b = self.u8(at);

        if b & 0b1 == 0 {
            ((b as u8 as i8 >> 1) as i32, at + 1)
        } else if b & 0b10 == 0 {
            ((self.u16(at) as u16 as i16 >> 2) as i32, at + 2)
        } else if b & 0b100 == 0 {
            let raw = (b >> 3) | (self.u16(at + 1) << 5);
            // Sign-extend from 21 bits.
            (((raw << 11) as i32) >> 11, at + 3)
        } else if b & 0b1000 == 0 {
            ((self.u32(at) as i32) >> 4, at + 4)
        } else {
            (self.u32(at + 1) as i32, at + 5)
        }
    }

    pub fn string(&self, at: usize) -> (String, usize) {
        let (len, start) = self.unsigned(at);
        let end = start + len as usize;

        (String::from_utf8_lossy(&self.data[start..end]).into_owned(), end)
    }

    /// Offsets of every vertex in the hashtable at `at` whose entry hash
    ///   matches `hash`,
    ///     in the order that they are stored.
    pub fn lookup(&self, at: usize, hash: u32) -> Vec<usize> {
        let header = self.u8(at);
        let buckets = 1u32 << (header >> 2);
        let index_size = header & 0b11;
        let bucket = ((hash >> 8) & (buckets - 1)) as usize;

        let bucket_offset = |i: usize| {
            let pos = at + 1 + i * (1 << index_size);
            at + match index_size {
                0 => self.u8(pos),
                1 => self.u16(pos),
                _ => self.u32(pos),
            } as usize
        };

        let (mut cur, end) = (bucket_offset(bucket), bucket_offset(bucket + 1));
        let mut found = Vec::new();

        while cur < end {
            let low = self.u8(cur);
            let (rel, next) = self.signed(cur + 1);

            if low == hash & 0xFF {
                found.push((cur as i64 + rel as i64) as usize);
            }

            cur = next;
        }

        found
    }

    /// Every `(low hash byte, target offset)` entry of the hashtable at
    ///   `at`.
    pub fn entries(&self, at: usize) -> Vec<(u8, usize)> {
        let header = self.u8(at);
        let buckets = 1usize << (header >> 2);
        let index_size = header & 0b11;
        let first = at + 1 + (buckets + 1) * (1 << index_size);
        let last_pos = at + 1 + buckets * (1 << index_size);
        let end = at + match index_size {
            0 => self.u8(last_pos),
            1 => self.u16(last_pos),
            _ => self.u32(last_pos),
        } as usize;

        let mut cur = first;
        let mut found = Vec::new();

        while cur < end {
            let low = self.u8(cur) as u8;
            let (rel, next) = self.signed(cur + 1);
            found.push((low, (cur as i64 + rel as i64) as usize));
            cur = next;
        }

        found
    }
}
