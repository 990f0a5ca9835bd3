//! Set members packed multiple-per-record.
//!
//! Same compound-key scheme as hashes, with member-only entries:
//!
//! ```text
//! [elem count: u16 LE][(member len uvint)(member)]*
//! ```

use super::{build_key, has_prefix, prefix_len, TypeTag};
use crate::error::Result;
use crate::map::SortedMap;
use crate::ops::{MutationSet, OpFlags, Operation, Record, WorkerContext};
use crate::util::{self, read_uvarint, write_uvarint};

const COUNT_SIZE: usize = 2;

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    member_start: usize,
    member_len: usize,
}

impl Entry {
    fn end(&self) -> usize {
        self.member_start + self.member_len
    }

    fn member<'a>(&self, blob: &'a [u8]) -> &'a [u8] {
        &blob[self.member_start..self.end()]
    }
}

fn blob_count(blob: &[u8]) -> u16 {
    if blob.len() < COUNT_SIZE {
        return 0;
    }
    u16::from_le_bytes([blob[0], blob[1]])
}

fn entries(blob: &[u8]) -> impl Iterator<Item = Entry> + '_ {
    let mut offset = COUNT_SIZE.min(blob.len());
    std::iter::from_fn(move || {
        if offset >= blob.len() {
            return None;
        }
        let (member_len, n) = read_uvarint(&blob[offset..]).expect("corrupt packed set value");
        let entry = Entry {
            offset,
            member_start: offset + n,
            member_len: member_len as usize,
        };
        offset = entry.end();
        Some(entry)
    })
}

enum MemberSlot {
    Found(Entry),
    InsertAt(usize),
}

fn find_member(blob: &[u8], member: &[u8]) -> MemberSlot {
    for entry in entries(blob) {
        let m = entry.member(blob);
        if m == member {
            return MemberSlot::Found(entry);
        }
        if m > member {
            return MemberSlot::InsertAt(entry.offset);
        }
    }
    MemberSlot::InsertAt(blob.len().max(COUNT_SIZE))
}

struct SetAdd<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    member: &'a [u8],
    expire: u64,
    max_packed_value: usize,
    scratch: Vec<u8>,
    added: bool,
}

impl Operation for SetAdd<'_> {
    fn key(&self) -> &[u8] {
        &self.ckey
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            floor_key: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        match found {
            Some(rec) if has_prefix(rec.key(), &self.ckey[..self.prefix_len]) => {
                let blob = rec.value();
                let insert_at = match find_member(blob, self.member) {
                    MemberSlot::Found(_) => {
                        self.added = false;
                        return true;
                    }
                    MemberSlot::InsertAt(offset) => offset,
                };
                self.added = true;

                let count = blob_count(blob) + 1;
                self.scratch.clear();
                self.scratch.extend_from_slice(&count.to_le_bytes());
                self.scratch.extend_from_slice(&blob[COUNT_SIZE..insert_at]);
                write_uvarint(&mut self.scratch, self.member.len() as u32);
                self.scratch.extend_from_slice(self.member);
                self.scratch.extend_from_slice(&blob[insert_at..]);

                if self.scratch.len() <= self.max_packed_value {
                    out.push_put(rec.key(), &self.scratch, rec.expire());
                    return true;
                }

                // divide the overgrown record into two adjacent ones
                let total = self.scratch.len();
                let mut cut = None;
                let mut left_count = 0u16;
                for entry in entries(&self.scratch) {
                    if entry.offset > COUNT_SIZE && entry.offset >= total / 2 {
                        cut = Some(entry);
                        break;
                    }
                    left_count += 1;
                }
                let cut = match cut {
                    Some(entry) => entry,
                    None => {
                        let last = entries(&self.scratch).last().expect("non-empty packed value");
                        left_count = count - 1;
                        last
                    }
                };
                let right_count = count - left_count;

                let mut left = Vec::with_capacity(cut.offset);
                left.extend_from_slice(&left_count.to_le_bytes());
                left.extend_from_slice(&self.scratch[COUNT_SIZE..cut.offset]);

                let mut right = Vec::with_capacity(total - cut.offset + COUNT_SIZE);
                right.extend_from_slice(&right_count.to_le_bytes());
                right.extend_from_slice(&self.scratch[cut.offset..]);

                let mut right_key =
                    Vec::with_capacity(self.prefix_len + cut.member_len);
                right_key.extend_from_slice(&self.ckey[..self.prefix_len]);
                right_key.extend_from_slice(cut.member(&self.scratch));

                out.push_put(rec.key(), &left, rec.expire());
                out.push_put(&right_key, &right, rec.expire());
                true
            }
            _ => {
                self.scratch.clear();
                self.scratch.extend_from_slice(&1u16.to_le_bytes());
                write_uvarint(&mut self.scratch, self.member.len() as u32);
                self.scratch.extend_from_slice(self.member);
                out.push_put(&self.ckey[..self.prefix_len], &self.scratch, self.expire);
                self.added = true;
                true
            }
        }
    }
}

struct SetIsMember<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    member: &'a [u8],
}

impl Operation for SetIsMember<'_> {
    fn key(&self) -> &[u8] {
        &self.ckey
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            floor_key: true,
            read_only: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, _out: &mut MutationSet) -> bool {
        let Some(rec) = found else {
            return false;
        };
        if !has_prefix(rec.key(), &self.ckey[..self.prefix_len]) {
            return false;
        }
        matches!(find_member(rec.value(), self.member), MemberSlot::Found(_))
    }
}

struct SetRemove<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    member: &'a [u8],
    scratch: Vec<u8>,
}

impl Operation for SetRemove<'_> {
    fn key(&self) -> &[u8] {
        &self.ckey
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            floor_key: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        let Some(rec) = found else {
            return false;
        };
        if !has_prefix(rec.key(), &self.ckey[..self.prefix_len]) {
            return false;
        }
        let blob = rec.value();
        let MemberSlot::Found(entry) = find_member(blob, self.member) else {
            return false;
        };

        let count = blob_count(blob) - 1;
        if count == 0 && rec.key().len() > self.prefix_len {
            out.push_delete(rec.key());
            return true;
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&count.to_le_bytes());
        self.scratch.extend_from_slice(&blob[COUNT_SIZE..entry.offset]);
        self.scratch.extend_from_slice(&blob[entry.end()..]);
        out.push_put(rec.key(), &self.scratch, rec.expire());
        true
    }
}

fn set_key(key: &[u8], member: &[u8]) -> (Vec<u8>, usize) {
    let mut ckey = Vec::new();
    build_key(&mut ckey, TypeTag::Set, key, member);
    (ckey, prefix_len(key.len()))
}

/// Add `member` to the set at `key`. Returns whether it was newly added.
pub fn sadd(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], member: &[u8]) -> Result<bool> {
    let _guard = map.key_locks().write(key);
    let (ckey, prefix_len) = set_key(key, member);
    let mut op = SetAdd {
        ckey,
        prefix_len,
        member,
        expire: 0,
        max_packed_value: map.config().max_packed_value,
        scratch: Vec::new(),
        added: false,
    };
    map.execute(&mut op, ctx)?;
    Ok(op.added)
}

pub fn sismember(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    member: &[u8],
) -> Result<bool> {
    let _guard = map.key_locks().read(key);
    let (ckey, prefix_len) = set_key(key, member);
    let mut op = SetIsMember {
        ckey,
        prefix_len,
        member,
    };
    map.execute(&mut op, ctx)
}

/// Remove `member` from the set at `key`. Returns whether it existed.
pub fn srem(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], member: &[u8]) -> Result<bool> {
    let _guard = map.key_locks().write(key);
    let (ckey, prefix_len) = set_key(key, member);
    let mut op = SetRemove {
        ckey,
        prefix_len,
        member,
        scratch: Vec::new(),
    };
    map.execute(&mut op, ctx)
}

/// Number of members in the set at `key`.
pub fn scard(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8]) -> Result<u64> {
    let _guard = map.key_locks().read(key);
    let mut prefix = Vec::new();
    build_key(&mut prefix, TypeTag::Set, key, b"");
    let end = util::key_successor(&prefix, prefix.len()).expect("prefix never all-0xff");

    let mut total = 0u64;
    map.scan_range(ctx, &prefix, &end, |_k, value, _e| {
        total += u64::from(blob_count(value));
    })?;
    Ok(total)
}
