//! Data-type extensions over the sorted map.
//!
//! Each extension encodes a logical collection as compound-key records:
//!
//! ```text
//! [type tag: u8][logical key len: u32 BE][logical key][sub-element]
//! ```
//!
//! A floor-key search on `(tag, key, sub-element)` lands on the nearest
//! stored sub-record; because floor search can land on a lexicographically
//! smaller unrelated key, every operation validates the compound prefix
//! before trusting the hit. A hit whose key length equals the prefix exactly
//! is the collection's head record and is accepted.

pub mod hashes;
pub mod sets;
pub mod sparse;
pub mod strings;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::hash::{Hash, Hasher};

/// Type tag byte, the fixed-width separator between key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    String = 1,
    Hash = 2,
    Set = 3,
    SparseBitmap = 4,
}

/// Bytes preceding the logical key in a compound key: tag + key length.
pub(crate) const PREFIX_OVERHEAD: usize = 1 + 4;

/// Assemble a compound key into `buf` (cleared first).
pub(crate) fn build_key(buf: &mut Vec<u8>, tag: TypeTag, key: &[u8], sub: &[u8]) {
    buf.clear();
    buf.reserve(PREFIX_OVERHEAD + key.len() + sub.len());
    buf.push(tag as u8);
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(sub);
}

/// Length of the compound prefix (everything before the sub-element) for a
/// logical key of `key_len` bytes.
pub(crate) fn prefix_len(key_len: usize) -> usize {
    PREFIX_OVERHEAD + key_len
}

/// Validate that a floor hit belongs to the collection identified by
/// `prefix`. Equal length means the head record; shorter or differing keys
/// are foreign and read as NOT_FOUND.
pub(crate) fn has_prefix(found_key: &[u8], prefix: &[u8]) -> bool {
    found_key.len() >= prefix.len() && &found_key[..prefix.len()] == prefix
}

/// The sub-element portion of a compound key.
pub(crate) fn sub_element<'a>(found_key: &'a [u8], prefix: &[u8]) -> &'a [u8] {
    &found_key[prefix.len()..]
}

/// Striped read/write locks over logical keys. Front-end functions that
/// issue several operations or scans for one collection hold its stripe so
/// the whole command is atomic per key.
pub struct KeyLocks {
    stripes: Box<[RwLock<()>]>,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| RwLock::new(())).collect();
        Self { stripes }
    }

    fn stripe(&self, key: &[u8]) -> &RwLock<()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    pub fn read(&self, key: &[u8]) -> RwLockReadGuard<'_, ()> {
        self.stripe(key).read()
    }

    pub fn write(&self, key: &[u8]) -> RwLockWriteGuard<'_, ()> {
        self.stripe(key).write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_keys_group_by_collection() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        build_key(&mut a, TypeTag::Hash, b"user:1", b"alpha");
        build_key(&mut b, TypeTag::Hash, b"user:1", b"beta");
        let mut prefix = Vec::new();
        build_key(&mut prefix, TypeTag::Hash, b"user:1", b"");

        assert!(a < b);
        assert!(has_prefix(&a, &prefix));
        assert!(has_prefix(&b, &prefix));
        assert_eq!(sub_element(&a, &prefix), b"alpha");
    }

    #[test]
    fn prefix_boundary_cases() {
        let mut prefix = Vec::new();
        build_key(&mut prefix, TypeTag::Hash, b"user:1", b"");

        // exact-length hit: the head record, accepted
        assert!(has_prefix(&prefix.clone(), &prefix));

        // shorter key: rejected
        assert!(!has_prefix(&prefix[..prefix.len() - 1], &prefix));

        // same length, different tail byte: rejected
        let mut other = prefix.clone();
        *other.last_mut().unwrap() ^= 1;
        assert!(!has_prefix(&other, &prefix));

        // different collection of the same logical key: rejected
        let mut set_prefix = Vec::new();
        build_key(&mut set_prefix, TypeTag::Set, b"user:1", b"");
        assert!(!has_prefix(&set_prefix, &prefix));
    }

    #[test]
    fn different_tags_never_collide() {
        let mut hash_key = Vec::new();
        let mut set_key = Vec::new();
        build_key(&mut hash_key, TypeTag::Hash, b"k", b"member");
        build_key(&mut set_key, TypeTag::Set, b"k", b"member");
        assert_ne!(hash_key, set_key);
    }

    #[test]
    fn key_locks_stripe_consistently() {
        let locks = KeyLocks::new(8);
        let g1 = locks.read(b"some-key");
        let g2 = locks.read(b"some-key");
        drop((g1, g2));
        let _w = locks.write(b"some-key");
    }
}
