//! String commands over plain records.
//!
//! Strings are stored one record per logical key under the `String` type
//! tag. The set/get family is built directly on the base operations; range
//! reads and get-and-delete get their own operations here.

use bytes::Bytes;

use super::{build_key, TypeTag};
use crate::error::{Error, Result};
use crate::map::SortedMap;
use crate::ops::basic::{CopyGet, Increment, Put};
use crate::ops::{MutationOptions, MutationSet, OpFlags, Operation, Record, WorkerContext};

fn string_key(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    build_key(&mut buf, TypeTag::String, key, b"");
    buf
}

/// Store `value` under `key`. Honors only-if-exists / only-if-absent and
/// keep-expiration. Returns whether the write was applied.
pub fn set(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    value: &[u8],
    expire: u64,
    opts: MutationOptions,
    keep_ttl: bool,
) -> Result<bool> {
    let _guard = map.key_locks().write(key);
    let ckey = string_key(key);
    let mut op = Put::new(&ckey, value, expire)
        .options(opts)
        .keep_expire(keep_ttl);
    map.execute(&mut op, ctx)
}

/// Fetch the string stored under `key`.
pub fn get(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8]) -> Result<Option<Bytes>> {
    let _guard = map.key_locks().read(key);
    let ckey = string_key(key);
    map.get(ctx, &ckey)
}

/// Copy the string under `key` into `buf`, reporting its full size. A size
/// larger than `buf.len()` means nothing was copied; retry with a larger
/// buffer.
pub fn get_into(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let _guard = map.key_locks().read(key);
    let ckey = string_key(key);
    let mut op = CopyGet::new(&ckey, buf);
    if map.execute(&mut op, ctx)? {
        Ok(op.value_len())
    } else {
        Ok(None)
    }
}

/// Atomically overwrite `key` and report the previous value through `prev`.
/// Returns the previous size, `None` when the key was absent.
pub fn get_set(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    value: &[u8],
    expire: u64,
    prev: &mut [u8],
) -> Result<Option<usize>> {
    let _guard = map.key_locks().write(key);
    let ckey = string_key(key);
    let mut op = Put::new(&ckey, value, expire).fetch_previous(prev);
    map.execute(&mut op, ctx)?;
    Ok(op.prev_len())
}

/// Atomically fetch and delete. Returns the deleted value's size, copied
/// into `buf` when it fits.
pub fn get_del(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let _guard = map.key_locks().write(key);
    let ckey = string_key(key);
    let mut op = GetDel::new(&ckey, buf);
    if map.execute(&mut op, ctx)? {
        Ok(op.value_len)
    } else {
        Ok(None)
    }
}

/// Remove the string under `key`.
pub fn del(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8]) -> Result<bool> {
    let _guard = map.key_locks().write(key);
    let ckey = string_key(key);
    map.delete(ctx, &ckey)
}

/// Substring read with Redis offset semantics: negative offsets count from
/// the end, out-of-range offsets clamp to the value, nothing is mutated.
/// Returns the range size, `None` when the key is absent.
pub fn get_range(
    map: &SortedMap,
    ctx: &mut WorkerContext,
    key: &[u8],
    from: Option<i64>,
    to: Option<i64>,
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let _guard = map.key_locks().read(key);
    let ckey = string_key(key);
    let mut op = GetRange::new(&ckey, from, to, buf);
    if map.execute(&mut op, ctx)? {
        Ok(op.range_len)
    } else {
        Ok(None)
    }
}

/// Increment the 8-byte counter stored under `key`, initializing an absent
/// one to the delta. Fails on values of any other size.
pub fn incr_by(map: &SortedMap, ctx: &mut WorkerContext, key: &[u8], delta: i64) -> Result<i64> {
    let _guard = map.key_locks().write(key);
    let ckey = string_key(key);
    let mut op = Increment::new(&ckey, delta);
    if map.execute(&mut op, ctx)? {
        Ok(op.result())
    } else {
        Err(Error::InvalidArgument(
            "value is not a fixed-width counter".into(),
        ))
    }
}

/// Fetch-and-delete in one atomic step.
struct GetDel<'a> {
    key: &'a [u8],
    buf: &'a mut [u8],
    value_len: Option<usize>,
}

impl<'a> GetDel<'a> {
    fn new(key: &'a [u8], buf: &'a mut [u8]) -> Self {
        Self {
            key,
            buf,
            value_len: None,
        }
    }
}

impl Operation for GetDel<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        let Some(rec) = found else {
            return false;
        };
        let value = rec.value();
        self.value_len = Some(value.len());
        if value.len() <= self.buf.len() {
            self.buf[..value.len()].copy_from_slice(value);
        }
        out.push_delete(self.key);
        true
    }
}

/// Clamped range read.
struct GetRange<'a> {
    key: &'a [u8],
    from: Option<i64>,
    to: Option<i64>,
    buf: &'a mut [u8],
    range_len: Option<usize>,
}

impl<'a> GetRange<'a> {
    fn new(key: &'a [u8], from: Option<i64>, to: Option<i64>, buf: &'a mut [u8]) -> Self {
        Self {
            key,
            from,
            to,
            buf,
            range_len: None,
        }
    }
}

impl Operation for GetRange<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            read_only: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, _out: &mut MutationSet) -> bool {
        let Some(rec) = found else {
            return false;
        };
        let value = rec.value();
        let len = value.len() as i64;

        let mut from = self.from.unwrap_or(0);
        let mut to = self.to.unwrap_or(len - 1);
        if from < 0 {
            from += len;
        }
        if to < 0 {
            to += len;
        }
        if from < 0 {
            from = 0;
        }
        if from > len - 1 || to < 0 || from > to.min(len - 1) {
            self.range_len = Some(0);
            return true;
        }
        let to = to.min(len - 1);

        let n = (to - from + 1) as usize;
        self.range_len = Some(n);
        if n <= self.buf.len() {
            self.buf[..n].copy_from_slice(&value[from as usize..=to as usize]);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (SortedMap, WorkerContext) {
        (SortedMap::with_defaults(), WorkerContext::new())
    }

    #[test]
    fn set_get_del_round_trip() {
        let (map, mut ctx) = fixture();
        assert!(set(&map, &mut ctx, b"greeting", b"hello", 0, MutationOptions::None, false).unwrap());
        let got = get(&map, &mut ctx, b"greeting").unwrap().unwrap();
        assert_eq!(&got[..], b"hello");
        assert!(del(&map, &mut ctx, b"greeting").unwrap());
        assert!(get(&map, &mut ctx, b"greeting").unwrap().is_none());
    }

    #[test]
    fn string_and_hash_keyspaces_are_disjoint() {
        let (map, mut ctx) = fixture();
        set(&map, &mut ctx, b"k", b"string", 0, MutationOptions::None, false).unwrap();
        assert!(crate::types::hashes::hget(&map, &mut ctx, b"k", b"f", &mut [0u8; 8])
            .unwrap()
            .is_none());
    }

    #[test]
    fn set_preconditions() {
        let (map, mut ctx) = fixture();
        assert!(!set(&map, &mut ctx, b"k", b"v", 0, MutationOptions::IfExists, false).unwrap());
        assert!(set(&map, &mut ctx, b"k", b"v", 0, MutationOptions::IfAbsent, false).unwrap());
        assert!(!set(&map, &mut ctx, b"k", b"v2", 0, MutationOptions::IfAbsent, false).unwrap());
        assert!(set(&map, &mut ctx, b"k", b"v3", 0, MutationOptions::IfExists, false).unwrap());
    }

    #[test]
    fn set_keep_ttl_preserves_expiration() {
        let (map, mut ctx) = fixture();
        let expire = crate::util::now_millis() + 60_000;
        set(&map, &mut ctx, b"k", b"v1", expire, MutationOptions::None, false).unwrap();
        // overwrite with keep_ttl and no expiration of its own
        set(&map, &mut ctx, b"k", b"v2", 0, MutationOptions::None, true).unwrap();

        let mut seen_expire = 0;
        let ckey = string_key(b"k");
        let mut probe_end = ckey.clone();
        probe_end.push(0);
        map.scan_range(&mut ctx, &ckey, &probe_end, |_k, _v, e| seen_expire = e)
            .unwrap();
        assert_eq!(seen_expire, expire);
    }

    #[test]
    fn get_set_returns_previous() {
        let (map, mut ctx) = fixture();
        let mut prev = [0u8; 16];
        assert_eq!(get_set(&map, &mut ctx, b"k", b"new", 0, &mut prev).unwrap(), None);
        let n = get_set(&map, &mut ctx, b"k", b"newer", 0, &mut prev)
            .unwrap()
            .unwrap();
        assert_eq!(&prev[..n], b"new");
    }

    #[test]
    fn get_del_removes_and_reports() {
        let (map, mut ctx) = fixture();
        set(&map, &mut ctx, b"k", b"payload", 0, MutationOptions::None, false).unwrap();
        let mut buf = [0u8; 16];
        let n = get_del(&map, &mut ctx, b"k", &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"payload");
        assert!(get(&map, &mut ctx, b"k").unwrap().is_none());
        assert_eq!(get_del(&map, &mut ctx, b"k", &mut buf).unwrap(), None);
    }

    #[test]
    fn get_range_clamps_offsets() {
        let (map, mut ctx) = fixture();
        set(&map, &mut ctx, b"k", b"Hello World", 0, MutationOptions::None, false).unwrap();
        let mut buf = [0u8; 32];

        let n = get_range(&map, &mut ctx, b"k", Some(0), Some(4), &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"Hello");

        let n = get_range(&map, &mut ctx, b"k", Some(-5), None, &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"World");

        // end clamps to the value length
        let n = get_range(&map, &mut ctx, b"k", Some(6), Some(10_000), &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"World");

        // inverted and out-of-range reads are empty, not errors
        assert_eq!(
            get_range(&map, &mut ctx, b"k", Some(8), Some(2), &mut buf).unwrap(),
            Some(0)
        );
        assert_eq!(
            get_range(&map, &mut ctx, b"k", Some(100), Some(200), &mut buf).unwrap(),
            Some(0)
        );
        assert_eq!(
            get_range(&map, &mut ctx, b"missing", None, None, &mut buf).unwrap(),
            None
        );
    }

    #[test]
    fn incr_by_initializes_and_updates() {
        let (map, mut ctx) = fixture();
        assert_eq!(incr_by(&map, &mut ctx, b"hits", 5).unwrap(), 5);
        assert_eq!(incr_by(&map, &mut ctx, b"hits", -2).unwrap(), 3);

        set(&map, &mut ctx, b"text", b"abc", 0, MutationOptions::None, false).unwrap();
        assert!(incr_by(&map, &mut ctx, b"text", 1).is_err());
    }
}
