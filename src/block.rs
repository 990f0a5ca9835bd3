//! Data blocks: bounded, sorted runs of records, compressed at rest.
//!
//! A block's payload is a contiguous byte run of records in ascending key
//! order. Record layout:
//!
//! ```text
//! [key len: u16 LE][key bytes][value len: u32 LE][expire ms: u64 LE][value bytes]
//! ```
//!
//! Payloads at or above the codec threshold are kept compressed while the
//! block is at rest. Shared-lock readers decompress into per-worker scratch
//! without touching the block; exclusive writers unpack in place, mutate and
//! re-pack.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

use crate::arena::{Arena, PackedBuf, Segment};
use crate::codec::{Codec, CodecError};
use crate::error::Result;

const KEY_LEN_SIZE: usize = 2;
const VALUE_HEADER_SIZE: usize = 4 + 8; // value len + expire

/// Parsed location of one record inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    pub offset: usize,
    pub key_start: usize,
    pub key_len: usize,
    pub value_start: usize,
    pub value_len: usize,
    pub expire: u64,
}

impl RecordInfo {
    pub fn end(&self) -> usize {
        self.value_start + self.value_len
    }

    pub fn total_len(&self) -> usize {
        self.end() - self.offset
    }

    pub fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.key_start..self.key_start + self.key_len]
    }

    pub fn value<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.value_start..self.end()]
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expire != 0 && self.expire <= now
    }
}

/// Parse the record starting at `offset`. The payload is trusted engine
/// state; malformed lengths are a logic error, not an input error.
pub fn record_at(data: &[u8], offset: usize) -> RecordInfo {
    let key_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
    let key_start = offset + KEY_LEN_SIZE;
    let header = key_start + key_len;
    let value_len = u32::from_le_bytes(data[header..header + 4].try_into().unwrap()) as usize;
    let expire = u64::from_le_bytes(data[header + 4..header + 12].try_into().unwrap());
    let value_start = header + VALUE_HEADER_SIZE;
    assert!(value_start + value_len <= data.len(), "corrupt record");
    RecordInfo {
        offset,
        key_start,
        key_len,
        value_start,
        value_len,
        expire,
    }
}

/// Iterate records in payload order.
pub fn records(data: &[u8]) -> impl Iterator<Item = RecordInfo> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset >= data.len() {
            return None;
        }
        let rec = record_at(data, offset);
        offset = rec.end();
        Some(rec)
    })
}

/// Greatest live record with key `<=` lookup key, if any.
pub fn find_floor(data: &[u8], key: &[u8], now: u64) -> Option<RecordInfo> {
    let mut best = None;
    for rec in records(data) {
        if rec.key(data) > key {
            break;
        }
        if !rec.is_expired(now) {
            best = Some(rec);
        }
    }
    best
}

/// Live record with exactly the lookup key, if any.
pub fn find_exact(data: &[u8], key: &[u8], now: u64) -> Option<RecordInfo> {
    for rec in records(data) {
        let rkey = rec.key(data);
        if rkey == key {
            return (!rec.is_expired(now)).then_some(rec);
        }
        if rkey > key {
            break;
        }
    }
    None
}

enum Payload {
    Raw(Segment),
    Packed { buf: PackedBuf, raw_len: u32 },
}

/// A bounded sorted container of records; the unit of compression, splitting
/// and locking.
pub struct DataBlock {
    payload: Payload,
    count: u32,
    /// Key this block is registered under in the map index. Unchanged for
    /// the block's lifetime; the leftmost (sentinel) block uses the empty key.
    anchor: Vec<u8>,
    /// Set when the block has been removed from the index; lookups that raced
    /// with the removal retry.
    detached: bool,
    /// Serializes relaxed-mode in-place writers against each other.
    inplace_gate: Mutex<()>,
}

impl DataBlock {
    pub fn new(arena: &Arc<Arena>, anchor: Vec<u8>) -> Self {
        Self {
            payload: Payload::Raw(arena.acquire()),
            count: 0,
            anchor,
            detached: false,
            inplace_gate: Mutex::new(()),
        }
    }

    pub fn anchor(&self) -> &[u8] {
        &self.anchor
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.payload, Payload::Packed { .. })
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub(crate) fn inplace_gate(&self) -> &Mutex<()> {
        &self.inplace_gate
    }

    /// Uncompressed payload size.
    pub fn raw_len(&self) -> usize {
        match &self.payload {
            Payload::Raw(seg) => seg.len(),
            Payload::Packed { raw_len, .. } => *raw_len as usize,
        }
    }

    /// The working segment. Callers must have unpacked the block first.
    pub(crate) fn segment(&self) -> &Segment {
        match &self.payload {
            Payload::Raw(seg) => seg,
            Payload::Packed { .. } => unreachable!("block accessed while packed"),
        }
    }

    pub(crate) fn segment_mut(&mut self) -> &mut Segment {
        match &mut self.payload {
            Payload::Raw(seg) => seg,
            Payload::Packed { .. } => unreachable!("block mutated while packed"),
        }
    }

    /// Decompress in place so the payload can be mutated.
    pub fn unpack(&mut self, codec: &Codec, arena: &Arc<Arena>) -> Result<()> {
        let Payload::Packed { buf, raw_len } = &self.payload else {
            return Ok(());
        };
        let raw_len = *raw_len as usize;
        let mut seg = arena.acquire();
        seg.resize(raw_len);
        let n = codec.decompress(buf.bytes(), seg.bytes_mut())?;
        if n != raw_len {
            return Err(CodecError::Decompress(format!(
                "expected {raw_len} bytes, got {n}"
            ))
            .into());
        }
        self.payload = Payload::Raw(seg);
        Ok(())
    }

    /// Compress the payload for storage at rest, when it is large enough and
    /// compression actually shrinks it.
    pub fn pack(&mut self, codec: &Codec, arena: &Arc<Arena>, scratch: &mut Vec<u8>) -> Result<()> {
        let Payload::Raw(seg) = &self.payload else {
            return Ok(());
        };
        let data = seg.bytes();
        if !codec.is_enabled() || data.len() < codec.threshold() {
            return Ok(());
        }
        scratch.resize(codec.max_compressed_len(data.len()), 0);
        let n = codec.compress(data, scratch)?;
        if n < data.len() {
            trace!(raw = data.len(), packed = n, "block packed");
            let raw_len = data.len() as u32;
            let buf = arena.store_packed(&scratch[..n]);
            self.payload = Payload::Packed { buf, raw_len };
        }
        Ok(())
    }

    /// Read-only view of the payload: the segment itself when raw, a
    /// decompressed copy in `scratch` when packed. Never mutates the block.
    pub fn view<'a>(&'a self, codec: &Codec, scratch: &'a mut Vec<u8>) -> Result<&'a [u8]> {
        match &self.payload {
            Payload::Raw(seg) => Ok(seg.bytes()),
            Payload::Packed { buf, raw_len } => {
                let raw_len = *raw_len as usize;
                scratch.resize(raw_len, 0);
                let n = codec.decompress(buf.bytes(), &mut scratch[..])?;
                if n != raw_len {
                    return Err(CodecError::Decompress(format!(
                        "expected {raw_len} bytes, got {n}"
                    ))
                    .into());
                }
                Ok(&scratch[..raw_len])
            }
        }
    }

    /// Insert or overwrite a record. The block must be unpacked.
    pub fn insert(&mut self, key: &[u8], value: &[u8], expire: u64) {
        debug_assert!(key.len() <= u16::MAX as usize);
        let key_len = (key.len() as u16).to_le_bytes();
        let mut header = [0u8; VALUE_HEADER_SIZE];
        header[..4].copy_from_slice(&(value.len() as u32).to_le_bytes());
        header[4..].copy_from_slice(&expire.to_le_bytes());
        let parts: [&[u8]; 4] = [&key_len, key, &header, value];

        let (offset, existing) = {
            let data = self.segment().bytes();
            let mut offset = data.len();
            let mut existing = None;
            for rec in records(data) {
                let rkey = rec.key(data);
                if rkey == key {
                    existing = Some(rec);
                    offset = rec.offset;
                    break;
                }
                if rkey > key {
                    offset = rec.offset;
                    break;
                }
            }
            (offset, existing)
        };

        match existing {
            Some(rec) => {
                let old_len = rec.total_len();
                self.segment_mut().replace_at(offset, old_len, &parts);
            }
            None => {
                self.segment_mut().insert_at(offset, &parts);
                self.count += 1;
            }
        }
    }

    /// Remove the record with exactly `key`. Returns whether one was removed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let found = {
            let data = self.segment().bytes();
            let mut found = None;
            for rec in records(data) {
                let rkey = rec.key(data);
                if rkey == key {
                    found = Some((rec.offset, rec.total_len()));
                    break;
                }
                if rkey > key {
                    break;
                }
            }
            found
        };
        if let Some((offset, len)) = found {
            self.segment_mut().remove_at(offset, len);
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// Whether this block has outgrown `capacity` and holds enough records
    /// to divide. A single oversized record never splits.
    pub fn should_split(&self, capacity: usize) -> bool {
        self.raw_len() > capacity && self.count >= 2
    }

    /// Split off the upper half into a new block. Both halves are non-empty.
    /// The block must be unpacked.
    pub fn split(&mut self, arena: &Arc<Arena>) -> DataBlock {
        debug_assert!(self.count >= 2);
        let (cut, left_count, right_anchor) = {
            let data = self.segment().bytes();
            let half = data.len() / 2;
            let mut cut = 0;
            let mut left_count = 0;
            for rec in records(data) {
                if rec.offset > 0 && rec.offset >= half {
                    cut = rec.offset;
                    break;
                }
                left_count += 1;
            }
            if cut == 0 {
                // everything below the midpoint: keep the last record right
                let last = records(data).last().expect("non-empty block");
                cut = last.offset;
                left_count = self.count - 1;
            }
            let first_right = record_at(data, cut);
            (cut, left_count, first_right.key(data).to_vec())
        };

        let mut right = DataBlock::new(arena, right_anchor);
        {
            let data = self.segment().bytes();
            right.segment_mut().fill_from(&data[cut..]);
        }
        right.count = self.count - left_count;
        self.segment_mut().truncate(cut);
        self.count = left_count;
        trace!(
            left = self.count,
            right = right.count,
            "block split"
        );
        right
    }
}
