//! OpalDB: embedded compressed sorted key-value engine.
//!
//! This crate provides the storage core that a Redis-compatible server sits
//! on: an ordered byte-key map organized into fixed-capacity blocks that are
//! compressed at rest, with an atomic read-modify-write operation protocol
//! that every data-type command is built on.
//!
//! # Architecture
//!
//! - Arena-owned block memory with opaque handles, no raw addresses
//! - Per-block reader/writer locks; one operation per record at a time
//! - Pluggable none/lz4/zstd codecs with running ratio statistics
//! - Compound-key encoding so one floor-key search locates any field of a
//!   hash, member of a set, or chunk of a sparse bitmap

/// Owning allocator for block payloads
pub mod arena;

/// Data blocks: sorted record runs, the unit of compression and locking
pub mod block;

/// Compression codecs
pub mod codec;

/// Configuration management
pub mod config;

/// Error types and result alias
pub mod error;

/// The sorted map engine
pub mod map;

/// The atomic operation framework
pub mod ops;

/// Data-type extensions: strings, hashes, sets, sparse bitmaps
pub mod types;

/// Byte-level helpers
pub mod util;

pub use codec::CodecKind;
pub use config::Config;
pub use error::{Error, Result};
pub use map::SortedMap;
pub use ops::{MutationOptions, Operation, WorkerContext};
