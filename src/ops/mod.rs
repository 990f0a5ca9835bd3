//! The atomic read-modify-write framework.
//!
//! Every data-type command is expressed as an [`Operation`]: the map locates
//! one record by exact or floor-key search, hands the operation a view of it
//! (or `None`), and atomically applies whatever the operation stages in its
//! [`MutationSet`]: nothing, one put/delete, or a split into two adjacent
//! records. Returning `false` aborts with no mutation applied; that is the
//! normal outcome for absent records and failed preconditions, not an error.

pub mod basic;

use crate::arena::Segment;

/// Caller-set contract fields of an operation, read once per dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpFlags {
    /// Locate the greatest stored key `<=` the lookup key instead of an
    /// exact match. Required by compound-key extensions whose exact stored
    /// key is unknown to the caller.
    pub floor_key: bool,

    /// The operation stages no mutations and needs no in-place access; it
    /// may run under the shared block lock.
    pub read_only: bool,

    /// The operation may rewrite value bytes directly in the located record
    /// without changing their length, staging zero mutations.
    pub update_in_place: bool,
}

/// Write preconditions shared by set-style operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationOptions {
    #[default]
    None,
    /// Apply only when the record does not exist.
    IfAbsent,
    /// Apply only when the record already exists.
    IfExists,
}

pub trait Operation {
    /// Lookup key. For type extensions this is the full compound key.
    fn key(&self) -> &[u8];

    fn flags(&self) -> OpFlags {
        OpFlags::default()
    }

    /// Run against the located record. `found` is `None` when no live record
    /// matched (NOT_FOUND); operations must branch on it explicitly.
    ///
    /// Return `true` to commit staged mutations, `false` to abort with
    /// nothing applied.
    fn execute(&mut self, found: Option<Record<'_>>, out: &mut MutationSet) -> bool;
}

enum ValueAccess<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
    /// Relaxed in-place mode: the value lives in a segment we only hold a
    /// shared reference to.
    Racy {
        segment: &'a Segment,
        offset: usize,
        len: usize,
    },
}

/// View of the record located for an operation.
pub struct Record<'a> {
    key: &'a [u8],
    expire: u64,
    value: ValueAccess<'a>,
}

impl<'a> Record<'a> {
    pub(crate) fn shared(key: &'a [u8], value: &'a [u8], expire: u64) -> Self {
        Self {
            key,
            expire,
            value: ValueAccess::Shared(value),
        }
    }

    pub(crate) fn exclusive(key: &'a [u8], value: &'a mut [u8], expire: u64) -> Self {
        Self {
            key,
            expire,
            value: ValueAccess::Exclusive(value),
        }
    }

    pub(crate) fn racy(
        key: &'a [u8],
        segment: &'a Segment,
        offset: usize,
        len: usize,
        expire: u64,
    ) -> Self {
        Self {
            key,
            expire,
            value: ValueAccess::Racy {
                segment,
                offset,
                len,
            },
        }
    }

    pub fn key(&self) -> &[u8] {
        self.key
    }

    pub fn expire(&self) -> u64 {
        self.expire
    }

    pub fn value(&self) -> &[u8] {
        match &self.value {
            ValueAccess::Shared(v) => v,
            ValueAccess::Exclusive(v) => v,
            ValueAccess::Racy {
                segment,
                offset,
                len,
            } => &segment.bytes()[*offset..*offset + *len],
        }
    }

    pub fn value_len(&self) -> usize {
        self.value().len()
    }

    /// Overwrite `src.len()` value bytes at `offset` in place.
    ///
    /// Only granted to operations flagged `update_in_place`; returns `false`
    /// when the record was located for read-only access or the write would
    /// fall outside the value.
    pub fn write_value(&mut self, offset: usize, src: &[u8]) -> bool {
        match &mut self.value {
            ValueAccess::Shared(_) => false,
            ValueAccess::Exclusive(v) => {
                if offset + src.len() > v.len() {
                    return false;
                }
                v[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            ValueAccess::Racy {
                segment,
                offset: base,
                len,
            } => {
                if offset + src.len() > *len {
                    return false;
                }
                // SAFETY: the map holds this block's in-place writer gate for
                // the duration of execute(); see Segment::write_in_place_racy.
                unsafe { segment.write_in_place_racy(*base + offset, src) };
                true
            }
        }
    }
}

/// Kind of a staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Put,
    Delete,
}

/// One staged mutation; key and value bytes live in the owning
/// [`MutationSet`]'s buffer.
#[derive(Debug, Clone, Copy)]
pub struct MutationDesc {
    pub kind: MutationKind,
    key: (u32, u32),
    value: (u32, u32),
    pub expire: u64,
}

/// The 0/1/2-mutation outcome of an operation.
#[derive(Debug, Clone, Copy)]
pub enum Mutations {
    None,
    One(MutationDesc),
    Two(MutationDesc, MutationDesc),
}

/// Staging area for an operation's output, reused across calls.
pub struct MutationSet {
    buf: Vec<u8>,
    staged: Mutations,
}

impl Default for MutationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationSet {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            staged: Mutations::None,
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.staged = Mutations::None;
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.staged, Mutations::None)
    }

    pub fn len(&self) -> usize {
        match self.staged {
            Mutations::None => 0,
            Mutations::One(_) => 1,
            Mutations::Two(..) => 2,
        }
    }

    fn stage(&mut self, desc: MutationDesc) {
        self.staged = match self.staged {
            Mutations::None => Mutations::One(desc),
            Mutations::One(first) => Mutations::Two(first, desc),
            Mutations::Two(..) => panic!("operation staged more than two mutations"),
        };
    }

    fn intern(&mut self, bytes: &[u8]) -> (u32, u32) {
        let start = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        (start, bytes.len() as u32)
    }

    pub fn push_put(&mut self, key: &[u8], value: &[u8], expire: u64) {
        assert!(
            key.len() <= crate::error::MAX_KEY_LEN,
            "mutation key exceeds maximum length"
        );
        let key = self.intern(key);
        let value = self.intern(value);
        self.stage(MutationDesc {
            kind: MutationKind::Put,
            key,
            value,
            expire,
        });
    }

    pub fn push_delete(&mut self, key: &[u8]) {
        let key = self.intern(key);
        self.stage(MutationDesc {
            kind: MutationKind::Delete,
            key,
            value: (0, 0),
            expire: 0,
        });
    }

    pub fn mutations(&self) -> Mutations {
        self.staged
    }

    pub fn key_of(&self, desc: &MutationDesc) -> &[u8] {
        let (start, len) = desc.key;
        &self.buf[start as usize..(start + len) as usize]
    }

    pub fn value_of(&self, desc: &MutationDesc) -> &[u8] {
        let (start, len) = desc.value;
        &self.buf[start as usize..(start + len) as usize]
    }
}

/// Per-worker scratch state, created once at worker startup and passed
/// through every call so the hot path stays allocation-free.
pub struct WorkerContext {
    /// Decompression target for shared-lock block views.
    pub(crate) view_scratch: Vec<u8>,
    /// Compression target when a block is re-packed.
    pub(crate) pack_scratch: Vec<u8>,
    /// Staged operation output.
    pub(crate) mutations: MutationSet,
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerContext {
    pub fn new() -> Self {
        Self {
            view_scratch: Vec::new(),
            pack_scratch: Vec::new(),
            mutations: MutationSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_set_stages_zero_one_two() {
        let mut set = MutationSet::new();
        assert!(set.is_empty());

        set.push_put(b"k1", b"v1", 0);
        match set.mutations() {
            Mutations::One(m) => {
                assert_eq!(set.key_of(&m), b"k1");
                assert_eq!(set.value_of(&m), b"v1");
                assert_eq!(m.kind, MutationKind::Put);
            }
            other => panic!("expected one mutation, got {other:?}"),
        }

        set.push_delete(b"k2");
        match set.mutations() {
            Mutations::Two(a, b) => {
                assert_eq!(a.kind, MutationKind::Put);
                assert_eq!(b.kind, MutationKind::Delete);
                assert_eq!(set.key_of(&b), b"k2");
            }
            other => panic!("expected two mutations, got {other:?}"),
        }

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    #[should_panic(expected = "more than two mutations")]
    fn third_mutation_panics() {
        let mut set = MutationSet::new();
        set.push_put(b"a", b"1", 0);
        set.push_put(b"b", b"2", 0);
        set.push_put(b"c", b"3", 0);
    }

    #[test]
    fn record_write_value_respects_access() {
        let mut value = *b"12345678";
        let mut rec = Record::exclusive(b"k", &mut value, 0);
        assert!(rec.write_value(0, &[9u8; 8]));
        assert!(!rec.write_value(4, &[0u8; 8]));

        let shared = [1u8, 2, 3];
        let mut rec = Record::shared(b"k", &shared, 0);
        assert!(!rec.write_value(0, &[0]));
    }
}
