//! The sorted map: an ordered index of data blocks and the execution engine
//! for atomic operations.
//!
//! Every call follows the same pipeline: locate the block whose anchor key is
//! the floor of the lookup key, search for the record inside it, dispatch to
//! the operation, apply its 0/1/2 staged mutations, then split and re-pack as
//! needed. All of it happens while the target block is held (exclusively for
//! writes, shared for reads), so no operation ever observes a partially
//! applied mutation set.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info};

use crate::arena::Arena;
use crate::block::{self, DataBlock};
use crate::codec::Codec;
use crate::config::Config;
use crate::error::{Error, Result, MAX_KEY_LEN};
use crate::ops::basic::{CopyGet, Delete, Fetch, Probe, Put};
use crate::ops::{
    MutationDesc, MutationKind, MutationOptions, MutationSet, Mutations, Operation, Record,
    WorkerContext,
};
use crate::types::KeyLocks;
use crate::util;

type BlockRef = Arc<RwLock<DataBlock>>;

/// Ordered, block-structured, compressed key-value store.
pub struct SortedMap {
    index: RwLock<BTreeMap<Vec<u8>, BlockRef>>,
    arena: Arc<Arena>,
    codec: Codec,
    config: Config,
    key_locks: KeyLocks,
}

impl SortedMap {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let arena = Arena::new(config.block_capacity);
        let codec = Codec::new(
            config.codec,
            config.codec_level,
            config.compression_threshold,
        );

        // The sentinel block anchors the empty key so every floor lookup
        // finds a block. It is never removed.
        let sentinel: BlockRef = Arc::new(RwLock::new(DataBlock::new(&arena, Vec::new())));
        let mut index = BTreeMap::new();
        index.insert(Vec::new(), sentinel);

        info!(codec = ?config.codec, block_capacity = config.block_capacity, "sorted map created");
        let key_locks = KeyLocks::new(config.key_lock_stripes);
        Ok(Self {
            index: RwLock::new(index),
            arena,
            codec,
            config,
            key_locks,
        })
    }

    pub fn with_defaults() -> Self {
        // the default configuration always validates
        Self::new(Config::default()).expect("default config")
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn key_locks(&self) -> &KeyLocks {
        &self.key_locks
    }

    /// Bytes currently held for block payloads.
    pub fn allocated_memory(&self) -> usize {
        self.arena.allocated()
    }

    /// Average codec ratio over everything compressed so far.
    pub fn compression_ratio(&self) -> f64 {
        self.codec.ratio()
    }

    pub fn block_count(&self) -> usize {
        self.index.read().len()
    }

    /// Execute one atomic operation. `Ok(false)` is the normal outcome for
    /// absent records and failed preconditions; `Err` is reserved for codec
    /// failures, which abort the operation with nothing applied.
    pub fn execute<O: Operation + ?Sized>(
        &self,
        op: &mut O,
        ctx: &mut WorkerContext,
    ) -> Result<bool> {
        if op.key().len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLarge(op.key().len()));
        }
        let now = util::now_millis();
        let flags = op.flags();
        ctx.mutations.clear();

        let mut force_exclusive = false;
        loop {
            let block = self.floor_block(op.key());

            let shared = flags.read_only
                || (flags.update_in_place && self.config.relaxed_in_place && !force_exclusive);

            if shared {
                let guard = block.read();
                if guard.is_detached() || !self.is_current(&block, op.key()) {
                    continue;
                }
                if flags.update_in_place && guard.is_packed() {
                    // a packed payload cannot be patched through a shared lock
                    force_exclusive = true;
                    continue;
                }

                let WorkerContext {
                    view_scratch,
                    mutations,
                    ..
                } = ctx;
                let data = guard.view(&self.codec, view_scratch)?;
                let found = if flags.floor_key {
                    block::find_floor(data, op.key(), now)
                } else {
                    block::find_exact(data, op.key(), now)
                };

                let ok = match found {
                    None => op.execute(None, mutations),
                    Some(info) if flags.update_in_place => {
                        // Relaxed in-place: serialize against other in-place
                        // writers; readers may observe torn values, as
                        // documented at `Config::relaxed_in_place`.
                        let _gate = guard.inplace_gate().lock();
                        let rec = Record::racy(
                            info.key(data),
                            guard.segment(),
                            info.value_start,
                            info.value_len,
                            info.expire,
                        );
                        op.execute(Some(rec), mutations)
                    }
                    Some(info) => {
                        let rec = Record::shared(info.key(data), info.value(data), info.expire);
                        op.execute(Some(rec), mutations)
                    }
                };

                if flags.update_in_place && !mutations.is_empty() {
                    // the operation needs real mutations (e.g. counter
                    // initialization); redo under the exclusive lock
                    mutations.clear();
                    force_exclusive = true;
                    continue;
                }
                debug_assert!(mutations.is_empty());
                return Ok(ok);
            }

            let mut guard = block.write();
            if guard.is_detached() || !self.is_current(&block, op.key()) {
                continue;
            }
            guard.unpack(&self.codec, &self.arena)?;

            let WorkerContext {
                mutations,
                pack_scratch,
                ..
            } = ctx;

            let found = {
                let data = guard.segment().bytes();
                if flags.floor_key {
                    block::find_floor(data, op.key(), now)
                } else {
                    block::find_exact(data, op.key(), now)
                }
            };

            let ok = match found {
                None => op.execute(None, mutations),
                Some(info) if flags.update_in_place => {
                    let bytes = guard.segment_mut().bytes_mut();
                    let (head, tail) = bytes.split_at_mut(info.value_start);
                    let key = &head[info.key_start..info.key_start + info.key_len];
                    let value = &mut tail[..info.value_len];
                    let rec = Record::exclusive(key, value, info.expire);
                    op.execute(Some(rec), mutations)
                }
                Some(info) => {
                    let data = guard.segment().bytes();
                    let rec = Record::shared(info.key(data), info.value(data), info.expire);
                    op.execute(Some(rec), mutations)
                }
            };

            if !ok {
                return Ok(false);
            }

            match mutations.mutations() {
                Mutations::None => {}
                Mutations::One(m) => Self::apply(&mut guard, mutations, &m),
                Mutations::Two(a, b) => {
                    Self::apply(&mut guard, mutations, &a);
                    Self::apply(&mut guard, mutations, &b);
                }
            }

            if guard.is_empty() && !guard.anchor().is_empty() {
                guard.detach();
                let mut idx = self.index.write();
                idx.remove(guard.anchor());
                debug!(blocks = idx.len(), "empty block removed");
            } else {
                if guard.should_split(self.config.block_capacity) {
                    let mut right = guard.split(&self.arena);
                    right.pack(&self.codec, &self.arena, pack_scratch)?;
                    let anchor = right.anchor().to_vec();
                    let mut idx = self.index.write();
                    idx.insert(anchor, Arc::new(RwLock::new(right)));
                    debug!(blocks = idx.len(), "block split");
                }
                guard.pack(&self.codec, &self.arena, pack_scratch)?;
            }
            return Ok(true);
        }
    }

    /// Store `value` under `key`. Overwrites any previous record.
    pub fn put(&self, ctx: &mut WorkerContext, key: &[u8], value: &[u8], expire: u64) -> Result<()> {
        let mut op = Put::new(key, value, expire);
        self.execute(&mut op, ctx)?;
        Ok(())
    }

    /// Conditional store honoring only-if-exists / only-if-absent and
    /// keep-expiration semantics. Returns whether the write was applied.
    pub fn put_with(
        &self,
        ctx: &mut WorkerContext,
        key: &[u8],
        value: &[u8],
        expire: u64,
        opts: MutationOptions,
        keep_expire: bool,
    ) -> Result<bool> {
        let mut op = Put::new(key, value, expire).options(opts).keep_expire(keep_expire);
        self.execute(&mut op, ctx)
    }

    /// Fetch the value stored under `key`, or `None` when absent or expired.
    pub fn get(&self, ctx: &mut WorkerContext, key: &[u8]) -> Result<Option<Bytes>> {
        let mut op = Fetch::new(key);
        if self.execute(&mut op, ctx)? {
            Ok(Some(op.into_value()))
        } else {
            Ok(None)
        }
    }

    /// Copy the value for `key` into `buf`, returning its full size. A result
    /// larger than `buf.len()` means nothing was copied and the caller should
    /// retry with a larger buffer.
    pub fn get_into(
        &self,
        ctx: &mut WorkerContext,
        key: &[u8],
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        let mut op = CopyGet::new(key, buf);
        if self.execute(&mut op, ctx)? {
            Ok(op.value_len())
        } else {
            Ok(None)
        }
    }

    pub fn exists(&self, ctx: &mut WorkerContext, key: &[u8]) -> Result<bool> {
        let mut op = Probe::new(key);
        self.execute(&mut op, ctx)
    }

    /// Remove the record under `key`. Returns whether one existed.
    pub fn delete(&self, ctx: &mut WorkerContext, key: &[u8]) -> Result<bool> {
        let mut op = Delete::new(key);
        self.execute(&mut op, ctx)
    }

    /// Read-only fold over live records with keys in `[start, end)`.
    ///
    /// The scan locks one block at a time, so it is weakly consistent with
    /// respect to concurrent writers of other key ranges; within one
    /// collection, the type extensions serialize scans against mutations via
    /// the per-key locks.
    pub fn scan_range<F>(
        &self,
        ctx: &mut WorkerContext,
        start: &[u8],
        end: &[u8],
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8], u64),
    {
        let now = util::now_millis();
        let mut cursor: Option<Vec<u8>> = None; // anchor of the last visited block
        let mut resume: Vec<u8> = start.to_vec(); // first key not yet reported

        loop {
            let block = {
                let idx = self.index.read();
                let entry = match &cursor {
                    None => idx
                        .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
                        .next_back(),
                    Some(prev) => idx
                        .range::<[u8], _>((Bound::Excluded(prev.as_slice()), Bound::Unbounded))
                        .next(),
                };
                match entry {
                    Some((anchor, _)) if cursor.is_some() && anchor.as_slice() >= end => None,
                    Some((anchor, block)) => Some((anchor.clone(), Arc::clone(block))),
                    None => None,
                }
            };
            let Some((anchor, block)) = block else {
                return Ok(());
            };

            let guard = block.read();
            if !guard.is_detached() {
                let data = guard.view(&self.codec, &mut ctx.view_scratch)?;
                for rec in block::records(data) {
                    let key = rec.key(data);
                    if key >= end {
                        break;
                    }
                    if key < resume.as_slice() || rec.is_expired(now) {
                        continue;
                    }
                    f(key, rec.value(data), rec.expire);
                    resume.clear();
                    resume.extend_from_slice(key);
                    resume.push(0); // successor: skip this exact key next time
                }
            }
            drop(guard);
            cursor = Some(anchor);
        }
    }

    fn floor_block(&self, key: &[u8]) -> BlockRef {
        let idx = self.index.read();
        idx.range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, b)| Arc::clone(b))
            .expect("sentinel block always present")
    }

    /// Re-check, while holding the block's lock, that it is still the floor
    /// block for `key`. A concurrent split may have inserted a closer one.
    fn is_current(&self, block: &BlockRef, key: &[u8]) -> bool {
        let idx = self.index.read();
        idx.range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, b)| Arc::ptr_eq(b, block))
            .unwrap_or(false)
    }

    fn apply(block: &mut DataBlock, set: &MutationSet, m: &MutationDesc) {
        match m.kind {
            MutationKind::Put => block.insert(set.key_of(m), set.value_of(m), m.expire),
            MutationKind::Delete => {
                block.remove(set.key_of(m));
            }
        }
    }
}
