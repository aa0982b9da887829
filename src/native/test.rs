// Tests for the native metadata format
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


use super::{reader::NativeReader, *};

fn unsigned_bytes(v: u32) -> Vec<u8> {
    let mut out = Vec::new();
    encode_unsigned(&mut out, v);
    out
}

fn signed_bytes(v: i32) -> Vec<u8> {
    let mut out = Vec::new();
    encode_signed(&mut out, v);
    out
}

#[test]
fn unsigned_encoding_lengths() {
    assert_eq!(vec![0x00], unsigned_bytes(0));
    assert_eq!(vec![0xFE], unsigned_bytes(127));
    assert_eq!(vec![0x01, 0x02], unsigned_bytes(128));
    assert_eq!(3, unsigned_bytes(1 << 14).len());
    assert_eq!(4, unsigned_bytes(1 << 21).len());
    assert_eq!(vec![0x0F, 0xFF, 0xFF, 0xFF, 0xFF], unsigned_bytes(u32::MAX));
}

#[test]
fn signed_encoding_lengths() {
    assert_eq!(vec![0x7E], signed_bytes(63));
    assert_eq!(vec![0x80], signed_bytes(-64));
    assert_eq!(2, signed_bytes(64).len());
    assert_eq!(2, signed_bytes(-65).len());
    assert_eq!(3, signed_bytes(-(1 << 13) - 1).len());
    assert_eq!(5, signed_bytes(i32::MIN).len());
}

#[test]
fn compressed_values_decode_at_each_boundary() {
    for v in [0, 127, 128, 16383, 16384, (1 << 21) - 1, 1 << 21, 1 << 28, u32::MAX] {
        let bytes = unsigned_bytes(v);
        assert_eq!((v, bytes.len()), NativeReader::new(&bytes).unsigned(0));
    }

    for v in [0, -1, 63, -64, 64, -8193, 1 << 20, -(1 << 27), i32::MAX, i32::MIN] {
        let bytes = signed_bytes(v);
        assert_eq!((v, bytes.len()), NativeReader::new(&bytes).signed(0));
    }
}

#[test]
fn identical_vertices_are_unified() {
    let mut w = NativeWriter::new();

    let a = w.unsigned(5);
    let b = w.unsigned(5);
    let s1 = w.string("Foo");
    let s2 = w.string("Foo");
    let t1 = w.tuple(vec![a, s1]);
    let t2 = w.tuple(vec![b, s2]);

    assert_eq!(a, b);
    assert_eq!(s1, s2);
    assert_eq!(t1, t2);
    assert_ne!(w.unsigned(5), w.signed(5));

    // Hashtables are distinct even when empty.
    assert_ne!(w.hashtable(), w.hashtable());
}

#[test]
fn placing_twice_writes_once() {
    let mut w = NativeWriter::new();
    let section = w.new_section();
    let v = w.string("only once");

    w.place(section, v);
    w.place(section, v);

    assert_eq!(10, w.save().len());
}

#[test]
fn tuples_are_written_inline() {
    let mut w = NativeWriter::new();
    let section = w.new_section();
    let (one, two) = (w.unsigned(1), w.unsigned(200));
    let tuple = w.tuple(vec![one, two]);
    w.place(section, tuple);

    let blob = w.save();
    let r = NativeReader::new(&blob);
    let (first, next) = r.unsigned(0);
    let (second, end) = r.unsigned(next);

    assert_eq!((1, 200, blob.len()), (first, second, end));
}

#[test]
fn hashtable_bucket_count_follows_fill_factor() {
    let mut ht = VertexHashtable::default();
    assert_eq!(1, ht.bucket_count());

    ht.entries = vec![(0, VertexId(0)); 12];
    assert_eq!(1, ht.bucket_count());

    ht.entries = vec![(0, VertexId(0)); 26];
    assert_eq!(2, ht.bucket_count());

    ht.entries = vec![(0, VertexId(0)); 13 * 5];
    assert_eq!(4, ht.bucket_count());
}

#[test]
fn hashtable_entries_find_their_targets() {
    let mut w = NativeWriter::new();
    let tables = w.new_section();
    let data = w.new_section();
    let table = w.hashtable();
    w.place(tables, table);

    let mut expected = Vec::new();
    for i in 0..40u32 {
        let target = w.string(&format!("entry {i}"));
        w.place(data, target);
        w.append(table, i.wrapping_mul(0x9E37_79B9), target);
        expected.push((i.wrapping_mul(0x9E37_79B9), target));
    }

    let blob = w.save();
    let r = NativeReader::new(&blob);

    for (hash, target) in expected {
        let offset = w.offset_of(target).unwrap() as usize;
        assert!(r.lookup(0, hash).contains(&offset), "{hash:#x}");
    }
}

#[test]
fn hashtable_entries_are_sorted_by_bucket_then_low_byte() {
    let mut w = NativeWriter::new();
    let section = w.new_section();
    let table = w.hashtable();
    w.place(section, table);

    let hashes = [0x0103, 0x0001, 0x0102, 0x0002];
    for (i, &hash) in hashes.iter().enumerate() {
        let v = w.unsigned(i as u32);
        w.place(section, v);
        w.append(table, hash, v);
    }

    let blob = w.save();
    let lows = NativeReader::new(&blob)
        .entries(0)
        .into_iter()
        .map(|(low, _)| low)
        .collect::<Vec<_>>();

    // A single bucket,
    //   so only the low byte matters.
    assert_eq!(vec![0x01, 0x02, 0x02, 0x03], lows);
    assert_eq!(0, blob[0] >> 2);
}

#[test]
fn large_tables_widen_bucket_offsets() {
    let mut w = NativeWriter::new();
    let tables = w.new_section();
    let data = w.new_section();
    let table = w.hashtable();
    w.place(tables, table);

    for i in 0..2000u32 {
        let v = w.unsigned(i + 1000);
        w.place(data, v);
        w.append(table, i, v);
    }

    let blob = w.save();
    let r = NativeReader::new(&blob);

    assert_ne!(0, blob[0] & 0b11);
    assert_eq!(2000, r.entries(0).len());

    let target = r.lookup(0, 1999);
    assert_eq!(1, target.len());
    assert_eq!(2999, r.unsigned(target[0]).0);
}

#[test]
fn empty_writer_saves_nothing() {
    let mut w = NativeWriter::new();
    w.new_section();

    assert!(w.save().is_empty());
}
