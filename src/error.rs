use thiserror::Error;

use crate::codec::CodecError;

/// Maximum stored key length. Record headers carry key lengths as `u16`.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

#[derive(Error, Debug)]
pub enum Error {
    /// The compressor reported insufficient destination capacity or corrupt
    /// input. Fatal to the in-flight operation, never partially applied.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    #[error("key length {0} exceeds maximum of {MAX_KEY_LEN}")]
    KeyTooLarge(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
