// Native metadata format
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


//! Writer for the compact native metadata format read by the runtime.
//!
//! Runtime metadata tables
//!   (see [`tables`])
//!   are graphs of _vertices_:
//!     compressed integers,
//!     strings,
//!     tuples of other vertices,
//!     and bucketed hashtables whose entries point at other vertices.
//! A [`NativeWriter`] holds these vertices in an arena and lays them out
//!   into a single blob on [`NativeWriter::save`].
//!
//! Hashtable entries refer to their targets by relative offset,
//!   and the size of a compressed offset depends on its magnitude,
//!     which in turn depends on the size of everything between the entry
//!     and its target.
//! Layout is therefore iterative:
//!
//!   1. an initial pass assigns offsets assuming nothing about targets;
//!   2. up to [`MAX_SHRINK_PASSES`] further passes re-encode every vertex
//!        using the offsets of the previous pass until nothing moves;
//!        and
//!   3. if that fails to converge,
//!        passes continue while forbidding any vertex from shrinking,
//!        which guarantees termination since vertices can only grow.
//!
//! Identical integer,
//!   string,
//!   and tuple vertices are unified so that each is written at most once.
//!
//! Compressed integers
//! ===================
//! An unsigned value is encoded in one to five bytes,
//!   the number of trailing one bits of the first byte giving the
//!   length:
//!
//! | Range       | Encoding                          |
//! |-------------|-----------------------------------|
//! | `< 2^7`     | `u8`: `v << 1`                    |
//! | `< 2^14`    | `u16`: `v << 2 \| 0b1`            |
//! | `< 2^21`    | `u8`: `v << 3 \| 0b11`; `u16`: `v >> 5` |
//! | `< 2^28`    | `u32`: `v << 4 \| 0b111`          |
//! | otherwise   | `u8`: `0b1111`; `u32`: `v`        |
//!
//! Signed values use the same scheme on the two's complement
//!   representation with ranges halved.

pub mod reader;
pub mod tables;

use fxhash::FxHashMap;
use std::fmt::Display;
use tracing::debug;

/// Number of passes permitted to shrink vertices before they are only
///   permitted to grow.
pub const MAX_SHRINK_PASSES: usize = 10;

/// Average number of entries per hashtable bucket.
pub const HASHTABLE_FILL_FACTOR: usize = 13;

/// Index of a vertex within a [`NativeWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(u32);

impl VertexId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vertex #{}", self.0)
    }
}

/// Index of a section within a [`NativeWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId(usize);

/// Contents of a vertex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vertex {
    Unsigned(u32),
    Signed(i32),

    /// Length-prefixed UTF-8.
    String(String),

    /// Children written inline,
    ///   one after another.
    Tuple(Vec<VertexId>),

    Hashtable(VertexHashtable),
}

/// A bucketed hashtable of `(hash, vertex)` entries.
///
/// Entries are sorted by bucket and then by the low byte of their hash.
/// Each entry is that low byte followed by the signed offset of its
///   target vertex relative to the entry itself;
///     targets must therefore be placed in a section.
///
/// The table begins with a header byte
///   `(log2(buckets) << 2) | entryIndexSize`
///   followed by `buckets + 1` offsets of the first entry of each bucket
///   relative to the start of the table,
///     each of `1 << entryIndexSize` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexHashtable {
    entries: Vec<(u32, VertexId)>,
}

impl VertexHashtable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of buckets for the current number of entries.
    ///
    /// This is always a power of two.
    pub fn bucket_count(&self) -> u32 {
        let quotient = (self.entries.len() / HASHTABLE_FILL_FACTOR) as u32;

        match quotient {
            0 => 1,
            q => 1 << (31 - q.leading_zeros()),
        }
    }

    /// Entries in the order that they are written.
    fn sorted(&self) -> Vec<(u32, VertexId)> {
        let buckets = self.bucket_count();
        let mask = ((buckets - 1) << 8) | 0xFF;

        let mut entries = self.entries.clone();
        entries.sort_by_key(|&(hash, _)| hash & mask);
        entries
    }
}

/// Layout phase of [`NativeWriter::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Shrinking,
    Growing,
}

/// Builder and serializer of native format blobs.
///
/// See the [module-level documentation](self).
#[derive(Debug, Default)]
pub struct NativeWriter {
    vertices: Vec<Vertex>,

    /// Unification of identical vertices.
    unified: FxHashMap<Vertex, VertexId>,

    sections: Vec<Vec<VertexId>>,

    /// Offset of each placed vertex from the start of the blob.
    offsets: Vec<Option<u32>>,

    /// Size of each placed vertex as of the last pass.
    sizes: Vec<u32>,
}

impl NativeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new section.
    ///
    /// Sections are laid out in the order that they are created.
    pub fn new_section(&mut self) -> SectionId {
        self.sections.push(Vec::new());
        SectionId(self.sections.len() - 1)
    }

    /// Place a vertex at the end of a section so that it may be the
    ///   target of hashtable entries.
    ///
    /// Placing a vertex that is already placed does nothing.
    pub fn place(&mut self, section: SectionId, vertex: VertexId) {
        if self.is_placed(vertex) {
            return;
        }

        self.offsets[vertex.index()] = Some(0);
        self.sections[section.0].push(vertex);
    }

    pub fn is_placed(&self, vertex: VertexId) -> bool {
        self.offsets[vertex.index()].is_some()
    }

    fn add(&mut self, vertex: Vertex) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(vertex);
        self.offsets.push(None);
        self.sizes.push(0);
        id
    }

    fn unify(&mut self, vertex: Vertex) -> VertexId {
        if let Some(&id) = self.unified.get(&vertex) {
            return id;
        }

        let id = self.add(vertex.clone());
        self.unified.insert(vertex, id);
        id
    }

    pub fn unsigned(&mut self, value: u32) -> VertexId {
        self.unify(Vertex::Unsigned(value))
    }

    pub fn signed(&mut self, value: i32) -> VertexId {
        self.unify(Vertex::Signed(value))
    }

    pub fn string(&mut self, value: &str) -> VertexId {
        self.unify(Vertex::String(value.into()))
    }

    pub fn tuple(&mut self, items: Vec<VertexId>) -> VertexId {
        self.unify(Vertex::Tuple(items))
    }

    /// Create an empty hashtable.
    ///
    /// Hashtables are never unified.
    pub fn hashtable(&mut self) -> VertexId {
        self.add(Vertex::Hashtable(VertexHashtable::default()))
    }

    /// Add an entry to a hashtable.
    ///
    /// Panics
    /// ======
    /// If `table` is not a hashtable.
    pub fn append(&mut self, table: VertexId, hash: u32, vertex: VertexId) {
        match &mut self.vertices[table.index()] {
            Vertex::Hashtable(ht) => ht.entries.push((hash, vertex)),
            other => crate::diagnostic_panic!(
                vec![],
                "{table} is not a hashtable: {other:?}",
            ),
        }
    }

    /// Offset of a placed vertex within the blob produced by the most
    ///   recent [`Self::save`].
    pub fn offset_of(&self, vertex: VertexId) -> Option<u32> {
        self.offsets[vertex.index()]
    }

    /// Lay out every section and produce the blob.
    pub fn save(&mut self) -> Vec<u8> {
        let mut phase = Phase::Initial;
        let mut passes = 0usize;

        loop {
            let (blob, moved) = self.pass(phase);
            passes += 1;

            if !moved && phase != Phase::Initial {
                debug!(passes, ?phase, size = blob.len(), "native layout converged");
                return blob;
            }

            phase = match phase {
                Phase::Initial => Phase::Shrinking,
                Phase::Shrinking if passes > MAX_SHRINK_PASSES => Phase::Growing,
                other => other,
            };
        }
    }

    /// Encode every placed vertex using the offsets of the previous pass.
    ///
    /// Returns the blob and whether any offset changed.
    fn pass(&mut self, phase: Phase) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut moved = false;

        for section in 0..self.sections.len() {
            for i in 0..self.sections[section].len() {
                let id = self.sections[section][i];
                let start = out.len() as u32;

                if self.offsets[id.index()] != Some(start) {
                    moved = true;
                    self.offsets[id.index()] = Some(start);
                }

                self.encode(&mut out, id, phase);

                let size = out.len() as u32 - start;
                let prev = self.sizes[id.index()];

                if phase == Phase::Growing && size < prev {
                    out.resize((start + prev) as usize, 0);
                }

                self.sizes[id.index()] = out.len() as u32 - start;
                moved |= self.sizes[id.index()] != prev;
            }
        }

        (out, moved)
    }

    fn encode(&self, out: &mut Vec<u8>, id: VertexId, phase: Phase) {
        match &self.vertices[id.index()] {
            Vertex::Unsigned(v) => encode_unsigned(out, *v),
            Vertex::Signed(v) => encode_signed(out, *v),
            Vertex::String(s) => {
                encode_unsigned(out, s.len() as u32);
                out.extend_from_slice(s.as_bytes());
            }
            Vertex::Tuple(items) => {
                for &item in items {
                    self.encode(out, item, phase);
                }
            }
            Vertex::Hashtable(ht) => self.encode_hashtable(out, ht, phase),
        }
    }

    fn encode_hashtable(&self, out: &mut Vec<u8>, ht: &VertexHashtable, phase: Phase) {
        let start = out.len();
        let buckets = ht.bucket_count();
        let entries = ht.sorted();

        // Entries are encoded separately first since their size
        //   determines the width of the bucket offsets.
        let (index_size, table_len, starts, body) = (0..3u8)
            .find_map(|index_size| {
                let table_len = 1 + (buckets as usize + 1) * (1 << index_size);
                let (body, starts) = self.encode_entries(
                    start + table_len,
                    buckets,
                    &entries,
                    phase,
                );

                let last = table_len + body.len();
                let fits = match index_size {
                    0 => last <= u8::MAX as usize,
                    1 => last <= u16::MAX as usize,
                    _ => true,
                };

                fits.then_some((index_size, table_len, starts, body))
            })
            .unwrap_or_default();

        out.push(((buckets.trailing_zeros() as u8) << 2) | index_size);

        for bucket_start in starts
            .into_iter()
            .chain(std::iter::once(body.len()))
            .map(|s| (table_len + s) as u32)
        {
            match index_size {
                0 => out.push(bucket_start as u8),
                1 => out.extend((bucket_start as u16).to_le_bytes()),
                _ => out.extend(bucket_start.to_le_bytes()),
            }
        }

        out.extend(body);
    }

    /// Encode hashtable entries as though they began at `base`,
    ///   returning the entries and the start of each bucket relative to
    ///   the first entry.
    fn encode_entries(
        &self,
        base: usize,
        buckets: u32,
        entries: &[(u32, VertexId)],
        phase: Phase,
    ) -> (Vec<u8>, Vec<usize>) {
        let mut body = Vec::new();
        let mut starts = Vec::with_capacity(buckets as usize);
        let mut iter = entries.iter().peekable();

        for bucket in 0..buckets {
            starts.push(body.len());

            while let Some(&&(hash, target)) =
                iter.peek().filter(|(h, _)| (h >> 8) & (buckets - 1) == bucket)
            {
                iter.next();

                let here = (base + body.len()) as i64;
                let there = match (phase, self.offsets[target.index()]) {
                    (Phase::Initial, _) => here,
                    (_, Some(offset)) => offset as i64,
                    (_, None) => crate::diagnostic_panic!(
                        vec![],
                        "hashtable entry refers to unplaced {target}",
                    ),
                };

                body.push(hash as u8);
                encode_signed(&mut body, (there - here) as i32);
            }
        }

        (body, starts)
    }
}

/// Append the compressed encoding of an unsigned value.
pub fn encode_unsigned(out: &mut Vec<u8>, v: u32) {
    if v < 1 << 7 {
        out.push((v << 1) as u8);
    } else if v < 1 << 14 {
        out.extend(((v << 2) as u16 | 0b1).to_le_bytes());
    } else if v < 1 << 21 {
        out.push((v << 3) as u8 | 0b11);
        out.extend(((v >> 5) as u16).to_le_bytes());
    } else if v < 1 << 28 {
        out.extend(((v << 4) | 0b111).to_le_bytes());
    } else {
        out.push(0b1111);
        out.extend(v.to_le_bytes());
    }
}

/// Append the compressed encoding of a signed value.
pub fn encode_signed(out: &mut Vec<u8>, v: i32) {
    let fits = |bits: u32| v >= -(1 << (bits - 1)) && v < 1 << (bits - 1);
    let u = v as u32;

    if fits(7) {
        out.push((u << 1) as u8);
    } else if fits(14) {
        out.extend(((u << 2) as u16 | 0b1).to_le_bytes());
    } else if fits(21) {
        out.push((u << 3) as u8 | 0b11);
        out.extend(((u >> 5) as u16).to_le_bytes());
    } else if fits(28) {
        out.extend(((u << 4) | 0b111).to_le_bytes());
    } else {
        out.push(0b1111);
        out.extend(u.to_le_bytes());
    }
}

#[cfg(test)]
mod test;
