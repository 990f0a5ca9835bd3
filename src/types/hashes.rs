//! Hash fields packed multiple-per-record.
//!
//! A hash's fields are stored in sorted runs, several per record, under
//! compound keys. The head record is keyed by the bare compound prefix; every
//! later record is keyed by the prefix plus its first field, so one floor-key
//! search locates the record any field belongs to. Packed value layout:
//!
//! ```text
//! [elem count: u16 LE][(field len uvint)(value len uvint)(field)(value)]*
//! ```
//!
//! A record that outgrows `max_packed_value` divides into two adjacent
//! records, which is the operation framework's two-mutation case.

use super::{build_key, has_prefix, prefix_len, TypeTag};
use crate::error::{Error, Result};
use crate::map::SortedMap;
use crate::ops::{MutationOptions, MutationSet, OpFlags, Operation, Record, WorkerContext};
use crate::util::{self, read_uvarint, write_uvarint};

const COUNT_SIZE: usize = 2;

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    field_start: usize,
    field_len: usize,
    value_start: usize,
    value_len: usize,
}

impl Entry {
    fn end(&self) -> usize {
        self.value_start + self.value_len
    }

    fn field<'a>(&self, blob: &'a [u8]) -> &'a [u8] {
        &blob[self.field_start..self.field_start + self.field_len]
    }

    fn value<'a>(&self, blob: &'a [u8]) -> &'a [u8] {
        &blob[self.value_start..self.end()]
    }
}

fn blob_count(blob: &[u8]) -> u16 {
    if blob.len() < COUNT_SIZE {
        return 0;
    }
    u16::from_le_bytes([blob[0], blob[1]])
}

fn parse_entry(blob: &[u8], offset: usize) -> Entry {
    let (field_len, n) = read_uvarint(&blob[offset..]).expect("corrupt packed hash value");
    let (value_len, m) = read_uvarint(&blob[offset + n..]).expect("corrupt packed hash value");
    let field_start = offset + n + m;
    Entry {
        offset,
        field_start,
        field_len: field_len as usize,
        value_start: field_start + field_len as usize,
        value_len: value_len as usize,
    }
}

fn entries(blob: &[u8]) -> impl Iterator<Item = Entry> + '_ {
    let mut offset = COUNT_SIZE.min(blob.len());
    std::iter::from_fn(move || {
        if offset >= blob.len() {
            return None;
        }
        let entry = parse_entry(blob, offset);
        offset = entry.end();
        Some(entry)
    })
}

fn encode_entry(out: &mut Vec<u8>, field: &[u8], value: &[u8]) {
    write_uvarint(out, field.len() as u32);
    write_uvarint(out, value.len() as u32);
    out.extend_from_slice(field);
    out.extend_from_slice(value);
}

enum FieldSlot {
    Found(Entry),
    InsertAt(usize),
}

/// Binary contract of the packed layout is linear; the runs are small by
/// construction, so a walk is the search.
fn find_field(blob: &[u8], field: &[u8]) -> FieldSlot {
    for entry in entries(blob) {
        let f = entry.field(blob);
        if f == field {
            return FieldSlot::Found(entry);
        }
        if f > field {
            return FieldSlot::InsertAt(entry.offset);
        }
    }
    FieldSlot::InsertAt(blob.len().max(COUNT_SIZE))
}

/// Rebuild `blob` with `field` set to `value` and stage the result: one put
/// when the record still fits, a two-record split otherwise.
#[allow(clippy::too_many_arguments)]
fn stage_upsert(
    out: &mut MutationSet,
    scratch: &mut Vec<u8>,
    record_key: &[u8],
    prefix: &[u8],
    blob: &[u8],
    slot: &FieldSlot,
    field: &[u8],
    value: &[u8],
    expire: u64,
    max_packed_value: usize,
) {
    scratch.clear();
    let (count, replaced_end) = match slot {
        FieldSlot::Found(entry) => (blob_count(blob), entry.end()),
        FieldSlot::InsertAt(offset) => (blob_count(blob) + 1, *offset),
    };
    let insert_at = match slot {
        FieldSlot::Found(entry) => entry.offset,
        FieldSlot::InsertAt(offset) => *offset,
    };

    scratch.extend_from_slice(&count.to_le_bytes());
    if blob.len() >= COUNT_SIZE {
        scratch.extend_from_slice(&blob[COUNT_SIZE..insert_at]);
    }
    encode_entry(scratch, field, value);
    if blob.len() >= COUNT_SIZE {
        scratch.extend_from_slice(&blob[replaced_end..]);
    }

    if scratch.len() <= max_packed_value {
        out.push_put(record_key, scratch, expire);
        return;
    }

    // Divide into two adjacent records, both non-empty. The left half keeps
    // the record key; the right half is keyed by its first field.
    let total = scratch.len();
    let mut cut = None;
    let mut left_count = 0u16;
    for entry in entries(scratch) {
        if entry.offset > COUNT_SIZE && entry.offset >= total / 2 {
            cut = Some(entry);
            break;
        }
        left_count += 1;
    }
    let cut = match cut {
        Some(entry) => entry,
        None => {
            // all mass below the midpoint: keep the last entry right
            let last = entries(scratch).last().expect("non-empty packed value");
            left_count = count - 1;
            last
        }
    };
    let right_count = count - left_count;

    let mut left = Vec::with_capacity(cut.offset);
    left.extend_from_slice(&left_count.to_le_bytes());
    left.extend_from_slice(&scratch[COUNT_SIZE..cut.offset]);

    let mut right = Vec::with_capacity(total - cut.offset + COUNT_SIZE);
    right.extend_from_slice(&right_count.to_le_bytes());
    right.extend_from_slice(&scratch[cut.offset..]);

    let mut right_key = Vec::with_capacity(prefix.len() + cut.field_len);
    right_key.extend_from_slice(prefix);
    right_key.extend_from_slice(cut.field(scratch));

    out.push_put(record_key, &left, expire);
    out.push_put(&right_key, &right, expire);
}

struct HashSet<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    field: &'a [u8],
    value: &'a [u8],
    opts: MutationOptions,
    expire: u64,
    max_packed_value: usize,
    scratch: Vec<u8>,
    added: bool,
}

impl Operation for HashSet<'_> {
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
                let slot = find_field(blob, self.field);
                if matches!(slot, FieldSlot::Found(_)) && self.opts == MutationOptions::IfAbsent {
                    return false;
                }
                self.added = matches!(slot, FieldSlot::InsertAt(_));
                stage_upsert(
                    out,
                    &mut self.scratch,
                    rec.key(),
                    &self.ckey[..self.prefix_len],
                    blob,
                    &slot,
                    self.field,
                    self.value,
                    rec.expire(),
                    self.max_packed_value,
                );
                true
            }
            _ => {
                // no record of this hash yet: create the head record
                self.scratch.clear();
                self.scratch.extend_from_slice(&1u16.to_le_bytes());
                encode_entry(&mut self.scratch, self.field, self.value);
                out.push_put(&self.ckey[..self.prefix_len], &self.scratch, self.expire);
                self.added = true;
                true
            }
        }
    }
}

struct HashGet<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    field: &'a [u8],
    buf: &'a mut [u8],
    value_len: Option<usize>,
}

impl Operation for HashGet<'_> {
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
        let blob = rec.value();
        let FieldSlot::Found(entry) = find_field(blob, self.field) else {
            return false;
        };
        self.value_len = Some(entry.value_len);
        if entry.value_len <= self.buf.len() {
            self.buf[..entry.value_len].copy_from_slice(entry.value(blob));
        }
        true
    }
}

struct HashDelete<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    field: &'a [u8],
    scratch: Vec<u8>,
}

impl Operation for HashDelete<'_> {
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
        let FieldSlot::Found(entry) = find_field(blob, self.field) else {
            return false;
        };

        let count = blob_count(blob) - 1;
        if count == 0 && rec.key().len() > self.prefix_len {
            // a non-head record with no fields left disappears entirely
            out.push_delete(rec.key());
            return true;
        }

        // rewrite without the entry; an emptied head record stays as the
        // collection marker and is reused by later inserts
        self.scratch.clear();
        self.scratch.extend_from_slice(&count.to_le_bytes());
        self.scratch.extend_from_slice(&blob[COUNT_SIZE..entry.offset]);
        self.scratch.extend_from_slice(&blob[entry.end()..]);
        out.push_put(rec.key(), &self.scratch, rec.expire());
        true
    }
}

struct HashIncrBy<'a> {
    ckey: Vec<u8>,
    prefix_len: usize,
    field: &'a [u8],
    delta: i64,
    expire: u64,
    max_packed_value: usize,
    scratch: Vec<u8>,
    result: i64,
}

impl Operation for HashIncrBy<'_> {
    fn key(&self) -> &[u8] {
        &self.ckey
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            floor_key: true,
            update_in_place: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        let prefix = self.ckey[..self.prefix_len].to_vec();

        match found {
            Some(mut rec) if has_prefix(rec.key(), &prefix) => {
                let slot = find_field(rec.value(), self.field);
                match &slot {
                    FieldSlot::Found(entry) => {
                        if entry.value_len != 8 {
                            return false;
                        }
                        let current =
                            i64::from_le_bytes(entry.value(rec.value()).try_into().unwrap());
                        self.result = current.wrapping_add(self.delta);
                        // fixed-width counter: patched in place, zero mutations
                        rec.write_value(entry.value_start, &self.result.to_le_bytes())
                    }
                    FieldSlot::InsertAt(_) => {
                        self.result = self.delta;
                        stage_upsert(
                            out,
                            &mut self.scratch,
                            rec.key(),
                            &prefix,
                            rec.value(),
                            &slot,
                            self.field,
                            &self.delta.to_le_bytes(),
                            rec.expire(),
                            self.max_packed_value,
                        );
                        true
                    }
                }
            }
            _ => {
                self.result = self.delta;
                self.scratch.clear();
                self.scratch.extend_from_slice(&1u16.to_le_bytes());
                encode_entry(&mut self.scratch, self.field, &self.delta.to_le_bytes());
                out.push_put(&prefix, &self.scratch, self.expire);
                true
            }
        }
    }
}

fn hash_key(key: &[u8], field: &[u8]) -> (Vec<u8>, usize) {
    let mut ckey = Vec::new();
    build_key(&mut ckey, TypeTag::Hash, key, field);
    (ckey, prefix_len(key.len()))
}

/// Set `field` to `value` in the hash at `key`, creating the hash when
/// absent. Returns whether the field was newly added.
pub fn hset(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    field: &[u8],
    value: &[u8],
) -> Result<bool> {
    hset_with(map, ctx, key, field, value, MutationOptions::None)
}

/// `hset` with only-if-absent support (HSETNX). Returns whether the field
/// was written.
pub fn hset_with(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    field: &[u8],
    value: &[u8],
    opts: MutationOptions,
) -> Result<bool> {
    let _guard = map.key_locks().write(key);
    let (ckey, prefix_len) = hash_key(key, field);
    let mut op = HashSet {
        ckey,
        prefix_len,
        field,
        value,
        opts,
        expire: 0,
        max_packed_value: map.config().max_packed_value,
        scratch: Vec::new(),
        added: false,
    };
    if !map.execute(&mut op, ctx)? {
        return Ok(false);
    }
    Ok(op.added)
}

/// Copy the value of `field` into `buf`, reporting its full size. A size
/// larger than `buf.len()` means nothing was copied.
pub fn hget(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    field: &[u8],
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let _guard = map.key_locks().read(key);
    let (ckey, prefix_len) = hash_key(key, field);
    let mut op = HashGet {
        ckey,
        prefix_len,
        field,
        buf,
        value_len: None,
    };
    if map.execute(&mut op, ctx)? {
        Ok(op.value_len)
    } else {
        Ok(None)
    }
}

/// Remove `field` from the hash at `key`. Returns whether it existed.
pub fn hdel(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], field: &[u8]) -> Result<bool> {
    let _guard = map.key_locks().write(key);
    let (ckey, prefix_len) = hash_key(key, field);
    let mut op = HashDelete {
        ckey,
        prefix_len,
        field,
        scratch: Vec::new(),
    };
    map.execute(&mut op, ctx)
}

pub fn hexists(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], field: &[u8]) -> Result<bool> {
    let mut probe = [0u8; 0];
    Ok(hget(map, ctx, key, field, &mut probe)?.is_some())
}

/// Increment the 8-byte counter stored at `field`, initializing an absent
/// field to the delta. Fails on values of any other width.
pub fn hincr_by(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    field: &[u8],
    delta: i64,
) -> Result<i64> {
    let _guard = map.key_locks().write(key);
    let (ckey, prefix_len) = hash_key(key, field);
    let mut op = HashIncrBy {
        ckey,
        prefix_len,
        field,
        delta,
        expire: 0,
        max_packed_value: map.config().max_packed_value,
        scratch: Vec::new(),
        result: 0,
    };
    if map.execute(&mut op, ctx)? {
        Ok(op.result)
    } else {
        Err(Error::InvalidArgument(
            "hash field is not a fixed-width counter".into(),
        ))
    }
}

/// Number of fields in the hash at `key`.
pub fn hlen(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8]) -> Result<u64> {
    let _guard = map.key_locks().read(key);
    let mut prefix = Vec::new();
    build_key(&mut prefix, TypeTag::Hash, key, b"");
    let end = util::key_successor(&prefix, prefix.len()).expect("prefix never all-0xff");

    let mut total = 0u64;
    map.scan_range(ctx, &prefix, &end, |_k, value, _e| {
        total += u64::from(blob_count(value));
    })?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn fixture() -> (SortedMap, WorkerContext) {
        (SortedMap::with_defaults(), WorkerContext::new())
    }

    /// Small record cap to force record splits quickly.
    fn tight_fixture() -> (SortedMap, WorkerContext) {
        let config = Config {
            max_packed_value: 64,
            ..Config::default()
        };
        (SortedMap::new(config).unwrap(), WorkerContext::new())
    }

    fn get_vec(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        let mut buf = [0u8; 256];
        hget(map, ctx, key, field, &mut buf).unwrap().map(|n| buf[..n].to_vec())
    }

    #[test]
    fn set_get_delete_field() {
        let (map, mut ctx) = fixture();
        assert!(hset(&map, &mut ctx, b"h", b"name", b"alice").unwrap());
        assert!(!hset(&map, &mut ctx, b"h", b"name", b"bob").unwrap()); // overwrite
        assert_eq!(get_vec(&map, &mut ctx, b"h", b"name").unwrap(), b"bob");

        assert!(hdel(&map, &mut ctx, b"h", b"name").unwrap());
        assert!(!hdel(&map, &mut ctx, b"h", b"name").unwrap());
        assert!(get_vec(&map, &mut ctx, b"h", b"name").is_none());
    }

    #[test]
    fn hsetnx_only_writes_absent_fields() {
        let (map, mut ctx) = fixture();
        assert!(hset_with(&map, &mut ctx, b"h", b"f", b"1", MutationOptions::IfAbsent).unwrap());
        assert!(!hset_with(&map, &mut ctx, b"h", b"f", b"2", MutationOptions::IfAbsent).unwrap());
        assert_eq!(get_vec(&map, &mut ctx, b"h", b"f").unwrap(), b"1");
    }

    #[test]
    fn fields_pack_into_shared_records() {
        let (map, mut ctx) = fixture();
        for i in 0..50u32 {
            let field = format!("field-{i:03}");
            let value = format!("value-{i}");
            hset(&map, &mut ctx, b"big", field.as_bytes(), value.as_bytes()).unwrap();
        }
        assert_eq!(hlen(&map, &mut ctx, b"big").unwrap(), 50);
        for i in 0..50u32 {
            let field = format!("field-{i:03}");
            let value = format!("value-{i}");
            assert_eq!(
                get_vec(&map, &mut ctx, b"big", field.as_bytes()).unwrap(),
                value.as_bytes()
            );
        }
    }

    #[test]
    fn records_split_and_stay_reachable() {
        let (map, mut ctx) = tight_fixture();
        for i in 0..40u32 {
            let field = format!("f{i:04}");
            hset(&map, &mut ctx, b"h", field.as_bytes(), b"0123456789").unwrap();
        }
        assert_eq!(hlen(&map, &mut ctx, b"h").unwrap(), 40);
        for i in 0..40u32 {
            let field = format!("f{i:04}");
            assert_eq!(
                get_vec(&map, &mut ctx, b"h", field.as_bytes()).unwrap(),
                b"0123456789"
            );
        }
        // out-of-order reinsert still finds its record after splits
        hset(&map, &mut ctx, b"h", b"f0000", b"updated").unwrap();
        assert_eq!(get_vec(&map, &mut ctx, b"h", b"f0000").unwrap(), b"updated");
    }

    #[test]
    fn hashes_are_isolated_from_neighbors() {
        let (map, mut ctx) = fixture();
        hset(&map, &mut ctx, b"user:1", b"field", b"one").unwrap();
        // floor search from user:2's compound keys lands on user:1's records;
        // the prefix check must reject them
        assert!(get_vec(&map, &mut ctx, b"user:2", b"field").is_none());
        assert!(!hexists(&map, &mut ctx, b"user:2", b"field").unwrap());
        assert!(!hdel(&map, &mut ctx, b"user:2", b"field").unwrap());
        assert_eq!(hlen(&map, &mut ctx, b"user:2").unwrap(), 0);
    }

    #[test]
    fn hincr_by_mutation_counts() {
        let (map, mut ctx) = fixture();
        assert_eq!(hincr_by(&map, &mut ctx, b"stats", b"hits", 5).unwrap(), 5);
        assert_eq!(hincr_by(&map, &mut ctx, b"stats", b"hits", 3).unwrap(), 8);
        assert_eq!(hincr_by(&map, &mut ctx, b"stats", b"hits", -10).unwrap(), -2);

        let raw = get_vec(&map, &mut ctx, b"stats", b"hits").unwrap();
        assert_eq!(raw, (-2i64).to_le_bytes());
    }

    #[test]
    fn hincr_by_rejects_non_counters() {
        let (map, mut ctx) = fixture();
        hset(&map, &mut ctx, b"h", b"text", b"abc").unwrap();
        assert!(hincr_by(&map, &mut ctx, b"h", b"text", 1).is_err());
    }

    #[test]
    fn hincr_stages_one_mutation_on_init_and_none_in_place() {
        use crate::ops::Mutations;

        let (ckey, prefix_len) = hash_key(b"h", b"n");
        let mut op = HashIncrBy {
            ckey: ckey.clone(),
            prefix_len,
            field: b"n",
            delta: 5,
            expire: 0,
            max_packed_value: 512,
            scratch: Vec::new(),
            result: 0,
        };

        // absent field: initialized with exactly one put
        let mut out = MutationSet::new();
        assert!(op.execute(None, &mut out));
        assert_eq!(out.len(), 1);
        let Mutations::One(m) = out.mutations() else {
            panic!("expected one mutation");
        };
        let head_value = out.value_of(&m).to_vec();
        let head_key = out.key_of(&m).to_vec();
        assert_eq!(head_key, &ckey[..prefix_len]);

        // existing field: patched in place, zero additional mutations
        op.delta = 3;
        let mut blob = head_value;
        let mut out = MutationSet::new();
        let rec = Record::exclusive(&head_key, &mut blob, 0);
        assert!(op.execute(Some(rec), &mut out));
        assert_eq!(out.len(), 0);
        assert_eq!(op.result, 8);

        let FieldSlot::Found(entry) = find_field(&blob, b"n") else {
            panic!("field must exist");
        };
        assert_eq!(entry.value(&blob), 8i64.to_le_bytes());
    }

    #[test]
    fn emptied_head_record_is_reused() {
        let (map, mut ctx) = fixture();
        hset(&map, &mut ctx, b"h", b"only", b"v").unwrap();
        assert!(hdel(&map, &mut ctx, b"h", b"only").unwrap());
        assert_eq!(hlen(&map, &mut ctx, b"h").unwrap(), 0);

        assert!(hset(&map, &mut ctx, b"h", b"again", b"v2").unwrap());
        assert_eq!(get_vec(&map, &mut ctx, b"h", b"again").unwrap(), b"v2");
        assert_eq!(hlen(&map, &mut ctx, b"h").unwrap(), 1);
    }
}
