//! Owning allocator for block memory.
//!
//! Blocks never touch raw addresses: the arena hands out [`Segment`]s
//! (pooled, growable working buffers for uncompressed payloads) and
//! [`PackedBuf`]s (exact-size storage for compressed payloads). Both return
//! their bytes to the arena's accounting when dropped, so
//! `allocated_memory()` always reflects what the map currently holds.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Engine-wide allocation counters, across all maps in the process.
pub struct MemoryStats {
    allocated: AtomicUsize,
}

static GLOBAL_STATS: Lazy<MemoryStats> = Lazy::new(|| MemoryStats {
    allocated: AtomicUsize::new(0),
});

/// Total bytes currently held by every arena in the process.
pub fn global_allocated() -> usize {
    GLOBAL_STATS.allocated.load(Ordering::Relaxed)
}

const MAX_POOLED_SEGMENTS: usize = 64;

pub struct Arena {
    segment_size: usize,
    pool: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

impl Arena {
    pub fn new(segment_size: usize) -> Arc<Self> {
        Arc::new(Self {
            segment_size,
            pool: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Bytes currently charged to this arena.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn charge(&self, n: usize) {
        self.allocated.fetch_add(n, Ordering::Relaxed);
        GLOBAL_STATS.allocated.fetch_add(n, Ordering::Relaxed);
    }

    fn credit(&self, n: usize) {
        self.allocated.fetch_sub(n, Ordering::Relaxed);
        GLOBAL_STATS.allocated.fetch_sub(n, Ordering::Relaxed);
    }

    /// Acquire a working segment for an uncompressed block payload.
    pub fn acquire(self: &Arc<Self>) -> Segment {
        let buf = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.segment_size));
        self.charge(buf.capacity());
        Segment {
            buf: UnsafeCell::new(buf),
            arena: Arc::clone(self),
        }
    }

    /// Store an exact-size compressed payload.
    pub fn store_packed(self: &Arc<Self>, bytes: &[u8]) -> PackedBuf {
        self.charge(bytes.len());
        PackedBuf {
            data: bytes.to_vec().into_boxed_slice(),
            arena: Arc::clone(self),
        }
    }

    fn release_segment(&self, mut buf: Vec<u8>) {
        self.credit(buf.capacity());
        if buf.capacity() >= self.segment_size {
            let mut pool = self.pool.lock();
            if pool.len() < MAX_POOLED_SEGMENTS {
                buf.clear();
                // Returned to the pool uncharged; re-charged on acquire.
                pool.push(buf);
            }
        }
    }
}

/// Growable working buffer for one block's uncompressed payload.
///
/// The payload lives in an `UnsafeCell` so the relaxed in-place fast path can
/// write fixed-width values through a shared reference while readers hold the
/// shared block lock. All other access goes through `&`/`&mut` methods with
/// the usual borrow rules; see [`Segment::write_in_place_racy`].
pub struct Segment {
    buf: UnsafeCell<Vec<u8>>,
    arena: Arc<Arena>,
}

// A Segment is only reached through its owning block's RwLock. The racy
// in-place path is the single documented exception and is bounds-checked.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: mutation requires `&mut self` everywhere except the relaxed
        // in-place path, whose torn-read hazard is documented at the config
        // flag. No &mut aliases can exist while `&self` methods run.
        unsafe { (*self.buf.get()).as_slice() }
    }

    fn vec_mut(&mut self) -> &mut Vec<u8> {
        self.buf.get_mut()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.vec_mut().as_mut_slice()
    }

    /// Replace the whole payload.
    pub fn fill_from(&mut self, src: &[u8]) {
        self.reserve_for(src.len());
        let v = self.vec_mut();
        v.clear();
        v.extend_from_slice(src);
    }

    /// Resize to `len` (zero-filling), for use as a decompression target.
    pub fn resize(&mut self, len: usize) {
        self.reserve_for(len);
        self.vec_mut().resize(len, 0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.vec_mut().truncate(len);
    }

    /// Insert `parts` contiguously at `offset`, shifting the tail right.
    pub fn insert_at(&mut self, offset: usize, parts: &[&[u8]]) {
        let extra: usize = parts.iter().map(|p| p.len()).sum();
        let old_len = self.len();
        assert!(offset <= old_len, "segment insert out of bounds");
        self.reserve_for(old_len + extra);

        let v = self.vec_mut();
        v.resize(old_len + extra, 0);
        v.copy_within(offset..old_len, offset + extra);
        let mut at = offset;
        for part in parts {
            v[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
    }

    /// Remove `len` bytes starting at `offset`, shifting the tail left.
    pub fn remove_at(&mut self, offset: usize, len: usize) {
        let old_len = self.len();
        assert!(offset + len <= old_len, "segment remove out of bounds");
        let v = self.vec_mut();
        v.copy_within(offset + len..old_len, offset);
        v.truncate(old_len - len);
    }

    /// Replace `old_len` bytes at `offset` with `parts`.
    pub fn replace_at(&mut self, offset: usize, old_len: usize, parts: &[&[u8]]) {
        self.remove_at(offset, old_len);
        self.insert_at(offset, parts);
    }

    /// Write `src` at `offset` through a shared reference.
    ///
    /// # Safety
    ///
    /// Caller must hold at least the shared lock of the owning block and the
    /// block's in-place writer gate, so no two writers overlap. Concurrent
    /// readers may observe a torn value; that is the documented contract of
    /// the relaxed in-place mode.
    pub unsafe fn write_in_place_racy(&self, offset: usize, src: &[u8]) {
        let v = &mut *self.buf.get();
        assert!(offset + src.len() <= v.len(), "in-place write out of bounds");
        std::ptr::copy_nonoverlapping(src.as_ptr(), v.as_mut_ptr().add(offset), src.len());
    }

    /// Grow the backing buffer, keeping the arena's byte accounting current.
    fn reserve_for(&mut self, needed_len: usize) {
        let v = self.buf.get_mut();
        if needed_len > v.capacity() {
            let before = v.capacity();
            v.reserve(needed_len - v.len());
            let grown = v.capacity() - before;
            self.arena.charge(grown);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let buf = std::mem::take(self.buf.get_mut());
        self.arena.release_segment(buf);
    }
}

/// Exact-size storage for a compressed block payload.
pub struct PackedBuf {
    data: Box<[u8]>,
    arena: Arc<Arena>,
}

impl PackedBuf {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for PackedBuf {
    fn drop(&mut self) {
        self.arena.credit(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_follows_segments() {
        let arena = Arena::new(1024);
        assert_eq!(arena.allocated(), 0);

        let mut seg = arena.acquire();
        assert_eq!(arena.allocated(), 1024);

        seg.fill_from(&[7u8; 100]);
        assert_eq!(seg.len(), 100);
        assert_eq!(arena.allocated(), 1024);

        // growth past the pooled capacity is charged
        seg.resize(5000);
        assert!(arena.allocated() >= 5000);

        drop(seg);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn packed_buffers_charge_exact_size() {
        let arena = Arena::new(1024);
        let packed = arena.store_packed(&[1, 2, 3, 4]);
        assert_eq!(arena.allocated(), 4);
        assert_eq!(packed.bytes(), &[1, 2, 3, 4]);
        drop(packed);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn segments_are_pooled() {
        let arena = Arena::new(256);
        let seg = arena.acquire();
        drop(seg);
        assert_eq!(arena.pool.lock().len(), 1);
        let _seg = arena.acquire();
        assert_eq!(arena.pool.lock().len(), 0);
    }

    #[test]
    fn insert_remove_replace() {
        let arena = Arena::new(256);
        let mut seg = arena.acquire();
        seg.fill_from(b"hello world");
        seg.insert_at(5, &[b",", b" dear"]);
        assert_eq!(seg.bytes(), b"hello, dear world");
        seg.remove_at(5, 6);
        assert_eq!(seg.bytes(), b"hello world");
        seg.replace_at(6, 5, &[b"rust"]);
        assert_eq!(seg.bytes(), b"hello rust");
    }
}
