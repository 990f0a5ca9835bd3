//! Sparse bitmaps.
//!
//! A bitmap's address space is partitioned into fixed chunks; every touched
//! chunk is one compound-key record, keyed by its chunk index (big-endian, so
//! chunks sort in address order). Chunk value layout:
//!
//! ```text
//! [population count: u16 LE][flags: u8][payload]
//! ```
//!
//! A chunk whose population is below [`COMPACT_THRESHOLD`] stores the
//! offsets of its set bits as `u16`s (flag bit 0 set); denser chunks store
//! the raw bytes. This bounds the worst case at one raw chunk while keeping
//! sparse regions small. Reported bitmap length derives from the highest
//! touched chunk index.

use super::{build_key, TypeTag};
use crate::error::Result;
use crate::map::SortedMap;
use crate::ops::{MutationSet, OpFlags, Operation, Record, WorkerContext};
use crate::util;

pub const BYTES_PER_CHUNK: u64 = 1024;
pub const BITS_PER_CHUNK: u64 = BYTES_PER_CHUNK * 8;

const HEADER_SIZE: usize = 3;
const FLAG_COMPACT: u8 = 1;
/// Populations below this are stored as set-bit offsets.
const COMPACT_THRESHOLD: u16 = (BYTES_PER_CHUNK / 2) as u16;

fn header(value: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([value[0], value[1]]), value[2])
}

/// Read one bit straight out of an encoded chunk value.
fn bit_in_value(value: &[u8], chunk_bit: u64) -> u8 {
    let (_, flags) = header(value);
    if flags & FLAG_COMPACT != 0 {
        let payload = &value[HEADER_SIZE..];
        for pair in payload.chunks_exact(2) {
            if u16::from_le_bytes([pair[0], pair[1]]) as u64 == chunk_bit {
                return 1;
            }
        }
        0
    } else {
        let byte = value[HEADER_SIZE + (chunk_bit / 8) as usize];
        (byte >> (7 - chunk_bit % 8)) & 1
    }
}

/// Expand an encoded chunk into `chunk` (raw bytes), returning the
/// population count.
fn decode_chunk(value: &[u8], chunk: &mut Vec<u8>) -> u16 {
    chunk.clear();
    chunk.resize(BYTES_PER_CHUNK as usize, 0);
    let (count, flags) = header(value);
    if flags & FLAG_COMPACT != 0 {
        for pair in value[HEADER_SIZE..].chunks_exact(2) {
            let bit = u16::from_le_bytes([pair[0], pair[1]]) as u64;
            chunk[(bit / 8) as usize] |= 1 << (7 - bit % 8);
        }
    } else {
        chunk.copy_from_slice(&value[HEADER_SIZE..HEADER_SIZE + BYTES_PER_CHUNK as usize]);
    }
    count
}

/// Encode a raw chunk, choosing the compact offset form for sparse
/// populations.
fn encode_chunk(chunk: &[u8], count: u16, out: &mut Vec<u8>) {
    out.clear();
    out.extend_from_slice(&count.to_le_bytes());
    if count < COMPACT_THRESHOLD {
        out.push(FLAG_COMPACT);
        for (i, &byte) in chunk.iter().enumerate() {
            let mut b = byte;
            while b != 0 {
                let lead = b.leading_zeros() as u64;
                let bit = i as u64 * 8 + lead;
                out.extend_from_slice(&(bit as u16).to_le_bytes());
                b &= !(1 << (7 - lead));
            }
        }
    } else {
        out.push(0);
        out.extend_from_slice(chunk);
    }
}

struct SetBit {
    ckey: Vec<u8>,
    chunk_bit: u64,
    bit: bool,
    prior: u8,
    chunk: Vec<u8>,
    scratch: Vec<u8>,
}

impl Operation for SetBit {
    fn key(&self) -> &[u8] {
        &self.ckey
    }

    fn flags(&self) -> OpFlags {
        // the chunk key is fully known, so this is an exact-match operation
        OpFlags::default()
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        let count = match &found {
            Some(rec) => decode_chunk(rec.value(), &mut self.chunk),
            None => {
                self.chunk.clear();
                self.chunk.resize(BYTES_PER_CHUNK as usize, 0);
                0
            }
        };

        let byte = (self.chunk_bit / 8) as usize;
        let mask = 1u8 << (7 - self.chunk_bit % 8);
        self.prior = u8::from(self.chunk[byte] & mask != 0);

        if (self.prior == 1) == self.bit {
            // no change; nothing to write
            return true;
        }

        let new_count = if self.bit {
            self.chunk[byte] |= mask;
            count + 1
        } else {
            self.chunk[byte] &= !mask;
            count - 1
        };

        if new_count == 0 {
            out.push_delete(&self.ckey);
            return true;
        }

        encode_chunk(&self.chunk, new_count, &mut self.scratch);
        out.push_put(&self.ckey, &self.scratch, 0);
        true
    }
}

struct GetBit {
    ckey: Vec<u8>,
    chunk_bit: u64,
    bit: u8,
}

impl Operation for GetBit {
    fn key(&self) -> &[u8] {
        &self.ckey
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            read_only: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, _out: &mut MutationSet) -> bool {
        match found {
            Some(rec) => {
                self.bit = bit_in_value(rec.value(), self.chunk_bit);
                true
            }
            None => false,
        }
    }
}

fn chunk_key(key: &[u8], chunk_index: u64) -> Vec<u8> {
    let mut ckey = Vec::new();
    build_key(
        &mut ckey,
        TypeTag::SparseBitmap,
        key,
        &chunk_index.to_be_bytes(),
    );
    ckey
}

fn bitmap_prefix(key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::new();
    build_key(&mut prefix, TypeTag::SparseBitmap, key, b"");
    let end = util::key_successor(&prefix, prefix.len()).expect("prefix never all-0xff");
    (prefix, end)
}

/// Set the bit at `offset` to `bit`, returning its prior value.
pub fn set_bit(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    offset: u64,
    bit: bool,
) -> Result<u8> {
    let _guard = map.key_locks().write(key);
    let mut op = SetBit {
        ckey: chunk_key(key, offset / BITS_PER_CHUNK),
        chunk_bit: offset % BITS_PER_CHUNK,
        bit,
        prior: 0,
        chunk: Vec::new(),
        scratch: Vec::new(),
    };
    map.execute(&mut op, ctx)?;
    Ok(op.prior)
}

/// Read the bit at `offset`. Untouched regions read as 0.
pub fn get_bit(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], offset: u64) -> Result<u8> {
    let _guard = map.key_locks().read(key);
    let mut op = GetBit {
        ckey: chunk_key(key, offset / BITS_PER_CHUNK),
        chunk_bit: offset % BITS_PER_CHUNK,
        bit: 0,
    };
    if map.execute(&mut op, ctx)? {
        Ok(op.bit)
    } else {
        Ok(0)
    }
}

/// Total number of set bits in the bitmap; every chunk header carries its
/// population, so this is a header scan.
pub fn bit_count(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8]) -> Result<u64> {
    let _guard = map.key_locks().read(key);
    let (prefix, end) = bitmap_prefix(key);
    let mut total = 0u64;
    map.scan_range(ctx, &prefix, &end, |_k, value, _e| {
        let (count, _) = header(value);
        total += u64::from(count);
    })?;
    Ok(total)
}

/// Reported bitmap length in bytes: one full chunk for every chunk up to and
/// including the highest touched one. Zero when no bits are set.
pub fn strlen(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8]) -> Result<u64> {
    let _guard = map.key_locks().read(key);
    let (prefix, end) = bitmap_prefix(key);
    let mut last_index: Option<u64> = None;
    map.scan_range(ctx, &prefix, &end, |k, _value, _e| {
        let sub = &k[prefix.len()..];
        if sub.len() == 8 {
            last_index = Some(u64::from_be_bytes(sub.try_into().unwrap()));
        }
    })?;
    Ok(match last_index {
        Some(index) => (index + 1) * BYTES_PER_CHUNK,
        None => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (SortedMap, WorkerContext) {
        (SortedMap::with_defaults(), WorkerContext::new())
    }

    #[test]
    fn chunk_encoding_round_trips() {
        let mut chunk = vec![0u8; BYTES_PER_CHUNK as usize];
        // sparse population: compact form
        chunk[0] = 0b1000_0001;
        chunk[100] = 0b0000_0001;
        let mut encoded = Vec::new();
        encode_chunk(&chunk, 3, &mut encoded);
        assert_eq!(encoded[2] & FLAG_COMPACT, FLAG_COMPACT);
        assert!(encoded.len() < HEADER_SIZE + BYTES_PER_CHUNK as usize);

        let mut back = Vec::new();
        assert_eq!(decode_chunk(&encoded, &mut back), 3);
        assert_eq!(back, chunk);
        assert_eq!(bit_in_value(&encoded, 0), 1);
        assert_eq!(bit_in_value(&encoded, 7), 1);
        assert_eq!(bit_in_value(&encoded, 807), 1);
        assert_eq!(bit_in_value(&encoded, 8), 0);

        // dense population: raw form
        let dense = vec![0xffu8; BYTES_PER_CHUNK as usize];
        encode_chunk(&dense, (BYTES_PER_CHUNK * 8) as u16, &mut encoded);
        assert_eq!(encoded[2] & FLAG_COMPACT, 0);
        assert_eq!(decode_chunk(&encoded, &mut back), (BYTES_PER_CHUNK * 8) as u16);
        assert_eq!(back, dense);
    }

    #[test]
    fn set_get_clear_single_bit() {
        let (map, mut ctx) = fixture();
        assert_eq!(set_bit(&map, &mut ctx, b"bm", 12345, true).unwrap(), 0);
        assert_eq!(get_bit(&map, &mut ctx, b"bm", 12345).unwrap(), 1);
        assert_eq!(get_bit(&map, &mut ctx, b"bm", 12346).unwrap(), 0);

        // clearing a set bit reports the prior 1, an unset bit reports 0
        assert_eq!(set_bit(&map, &mut ctx, b"bm", 12345, false).unwrap(), 1);
        assert_eq!(set_bit(&map, &mut ctx, b"bm", 12345, false).unwrap(), 0);
        assert_eq!(get_bit(&map, &mut ctx, b"bm", 12345).unwrap(), 0);
    }

    #[test]
    fn counts_across_chunks() {
        let (map, mut ctx) = fixture();
        let offsets = [0u64, 1, BITS_PER_CHUNK - 1, BITS_PER_CHUNK, BITS_PER_CHUNK * 7 + 13];
        for &o in &offsets {
            assert_eq!(set_bit(&map, &mut ctx, b"bm", o, true).unwrap(), 0);
        }
        assert_eq!(bit_count(&map, &mut ctx, b"bm").unwrap(), offsets.len() as u64);

        assert_eq!(set_bit(&map, &mut ctx, b"bm", 1, false).unwrap(), 1);
        assert_eq!(bit_count(&map, &mut ctx, b"bm").unwrap(), offsets.len() as u64 - 1);
    }

    #[test]
    fn strlen_follows_highest_chunk() {
        let (map, mut ctx) = fixture();
        assert_eq!(strlen(&map, &mut ctx, b"bm").unwrap(), 0);

        set_bit(&map, &mut ctx, b"bm", 5, true).unwrap();
        assert_eq!(strlen(&map, &mut ctx, b"bm").unwrap(), BYTES_PER_CHUNK);

        let offset = BITS_PER_CHUNK * 42 + 7;
        set_bit(&map, &mut ctx, b"bm", offset, true).unwrap();
        let expected = (offset / BITS_PER_CHUNK) * BYTES_PER_CHUNK + BYTES_PER_CHUNK;
        assert_eq!(strlen(&map, &mut ctx, b"bm").unwrap(), expected);
    }

    #[test]
    fn emptied_chunks_disappear() {
        let (map, mut ctx) = fixture();
        set_bit(&map, &mut ctx, b"bm", 100, true).unwrap();
        set_bit(&map, &mut ctx, b"bm", 100, false).unwrap();
        assert_eq!(strlen(&map, &mut ctx, b"bm").unwrap(), 0);
        assert_eq!(bit_count(&map, &mut ctx, b"bm").unwrap(), 0);
    }

    #[test]
    fn dense_chunk_transitions_to_raw_and_back() {
        let (map, mut ctx) = fixture();
        let n = u64::from(COMPACT_THRESHOLD) + 10;
        for i in 0..n {
            set_bit(&map, &mut ctx, b"bm", i * 2, true).unwrap();
        }
        assert_eq!(bit_count(&map, &mut ctx, b"bm").unwrap(), n);
        for i in 0..n {
            assert_eq!(get_bit(&map, &mut ctx, b"bm", i * 2).unwrap(), 1);
            assert_eq!(get_bit(&map, &mut ctx, b"bm", i * 2 + 1).unwrap(), 0);
        }
        // thin it back below the threshold
        for i in 0..n {
            assert_eq!(set_bit(&map, &mut ctx, b"bm", i * 2, false).unwrap(), 1);
        }
        assert_eq!(bit_count(&map, &mut ctx, b"bm").unwrap(), 0);
    }
}
