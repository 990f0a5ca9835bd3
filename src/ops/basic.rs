//! Base operations backing the map's direct API. Every one of them goes
//! through the same atomic execute pipeline as the type extensions.

use bytes::Bytes;

use super::{MutationOptions, MutationSet, OpFlags, Operation, Record};

/// Exact-key store with optional preconditions, keep-expiration and
/// previous-value capture.
pub struct Put<'a> {
    key: &'a [u8],
    value: &'a [u8],
    expire: u64,
    opts: MutationOptions,
    keep_expire: bool,
    prev_buf: Option<&'a mut [u8]>,
    prev_len: Option<usize>,
}

impl<'a> Put<'a> {
    pub fn new(key: &'a [u8], value: &'a [u8], expire: u64) -> Self {
        Self {
            key,
            value,
            expire,
            opts: MutationOptions::None,
            keep_expire: false,
            prev_buf: None,
            prev_len: None,
        }
    }

    pub fn options(mut self, opts: MutationOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn keep_expire(mut self, keep: bool) -> Self {
        self.keep_expire = keep;
        self
    }

    /// Capture the previous value into `buf` before overwriting. Copied only
    /// when it fits; `prev_len` always reports the full size.
    pub fn fetch_previous(mut self, buf: &'a mut [u8]) -> Self {
        self.prev_buf = Some(buf);
        self
    }

    /// Size of the overwritten value, when one existed.
    pub fn prev_len(&self) -> Option<usize> {
        self.prev_len
    }
}

impl Operation for Put<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        let exists = found.is_some();
        match self.opts {
            MutationOptions::IfExists if !exists => return false,
            MutationOptions::IfAbsent if exists => return false,
            _ => {}
        }

        let mut expire = self.expire;
        if let Some(rec) = &found {
            self.prev_len = Some(rec.value_len());
            if let Some(buf) = self.prev_buf.as_deref_mut() {
                let value = rec.value();
                if value.len() <= buf.len() {
                    buf[..value.len()].copy_from_slice(value);
                }
            }
            if self.keep_expire {
                expire = rec.expire();
            }
        }

        out.push_put(self.key, self.value, expire);
        true
    }
}

/// Exact-key read into an owned buffer.
pub struct Fetch<'a> {
    key: &'a [u8],
    value: Vec<u8>,
}

impl<'a> Fetch<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        Self {
            key,
            value: Vec::new(),
        }
    }

    pub fn into_value(self) -> Bytes {
        Bytes::from(self.value)
    }
}

impl Operation for Fetch<'_> {
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
        match found {
            Some(rec) => {
                self.value.extend_from_slice(rec.value());
                true
            }
            None => false,
        }
    }
}

/// Exact-key read into a caller buffer. The full value size is always
/// reported; bytes are copied only when they fit, never truncated.
pub struct CopyGet<'a> {
    key: &'a [u8],
    buf: &'a mut [u8],
    value_len: Option<usize>,
}

impl<'a> CopyGet<'a> {
    pub fn new(key: &'a [u8], buf: &'a mut [u8]) -> Self {
        Self {
            key,
            buf,
            value_len: None,
        }
    }

    pub fn value_len(&self) -> Option<usize> {
        self.value_len
    }
}

impl Operation for CopyGet<'_> {
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
        match found {
            Some(rec) => {
                let value = rec.value();
                self.value_len = Some(value.len());
                if value.len() <= self.buf.len() {
                    self.buf[..value.len()].copy_from_slice(value);
                }
                true
            }
            None => false,
        }
    }
}

/// Exact-key existence probe.
pub struct Probe<'a> {
    key: &'a [u8],
}

impl<'a> Probe<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        Self { key }
    }
}

impl Operation for Probe<'_> {
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
        found.is_some()
    }
}

/// Exact-key delete.
pub struct Delete<'a> {
    key: &'a [u8],
}

impl<'a> Delete<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        Self { key }
    }
}

impl Operation for Delete<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        if found.is_none() {
            return false;
        }
        out.push_delete(self.key);
        true
    }
}

/// Fixed-width 8-byte counter increment.
///
/// Mutates an existing counter in place (zero mutations) or initializes an
/// absent one with a single put. Fails on a value of any other size.
pub struct Increment<'a> {
    key: &'a [u8],
    delta: i64,
    expire: u64,
    result: i64,
}

impl<'a> Increment<'a> {
    pub fn new(key: &'a [u8], delta: i64) -> Self {
        Self {
            key,
            delta,
            expire: 0,
            result: 0,
        }
    }

    pub fn expire(mut self, expire: u64) -> Self {
        self.expire = expire;
        self
    }

    /// Counter value after the increment.
    pub fn result(&self) -> i64 {
        self.result
    }
}

impl Operation for Increment<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            update_in_place: true,
            ..OpFlags::default()
        }
    }

    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool {
        match found {
            Some(mut rec) => {
                if rec.value_len() != 8 {
                    return false;
                }
                let current = i64::from_le_bytes(rec.value().try_into().unwrap());
                self.result = current.wrapping_add(self.delta);
                rec.write_value(0, &self.result.to_le_bytes())
            }
            None => {
                self.result = self.delta;
                out.push_put(self.key, &self.delta.to_le_bytes(), self.expire);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::SortedMap;
    use crate::ops::WorkerContext;

    #[test]
    fn increment_initializes_then_updates_in_place() {
        let map = SortedMap::with_defaults();
        let mut ctx = WorkerContext::new();

        let mut op = Increment::new(b"counter", 5);
        assert!(map.execute(&mut op, &mut ctx).unwrap());
        assert_eq!(op.result(), 5);

        let mut op = Increment::new(b"counter", 3);
        assert!(map.execute(&mut op, &mut ctx).unwrap());
        assert_eq!(op.result(), 8);

        let got = map.get(&mut ctx, b"counter").unwrap().unwrap();
        assert_eq!(&got[..], &8i64.to_le_bytes());
    }

    #[test]
    fn increment_rejects_non_counter_values() {
        let map = SortedMap::with_defaults();
        let mut ctx = WorkerContext::new();
        map.put(&mut ctx, b"text", b"not a counter", 0).unwrap();

        let mut op = Increment::new(b"text", 1);
        assert!(!map.execute(&mut op, &mut ctx).unwrap());
    }

    #[test]
    fn put_reports_previous_value() {
        let map = SortedMap::with_defaults();
        let mut ctx = WorkerContext::new();
        map.put(&mut ctx, b"k", b"before", 0).unwrap();

        let mut prev = [0u8; 16];
        let mut op = Put::new(b"k", b"after", 0).fetch_previous(&mut prev);
        assert!(map.execute(&mut op, &mut ctx).unwrap());
        assert_eq!(op.prev_len(), Some(6));
        assert_eq!(&prev[..6], b"before");
    }

    #[test]
    fn put_previous_value_never_truncates() {
        let map = SortedMap::with_defaults();
        let mut ctx = WorkerContext::new();
        map.put(&mut ctx, b"k", b"a value too large", 0).unwrap();

        let mut prev = [0u8; 4];
        let mut op = Put::new(b"k", b"next", 0).fetch_previous(&mut prev);
        assert!(map.execute(&mut op, &mut ctx).unwrap());
        // size reported, buffer untouched
        assert_eq!(op.prev_len(), Some(17));
        assert_eq!(prev, [0u8; 4]);
    }
}
