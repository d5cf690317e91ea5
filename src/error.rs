use crate::hash::Key;
use thiserror::Error;

pub type BitResult<T> = Result<T, BitError>;

/// the six error kinds surfaced anywhere in this crate.
///
/// callers match on this rather than treat errors as opaque causes.
#[derive(Error, Debug)]
pub enum BitError {
    #[error("object not found: {0}")]
    NotFound(Key),

    #[error("corrupt data: {reason}")]
    Corrupt { reason: String },

    #[error("unsupported version: found {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("resource exhausted")]
    ResourceExhausted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {reason}")]
    Codec { reason: String },
}

impl BitError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        BitError::Corrupt { reason: reason.into() }
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        BitError::Codec { reason: reason.into() }
    }

    /// true if recovering (the core only ever retries once, after an
    /// aggressive free-everything eviction pass) is worth attempting.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, BitError::ResourceExhausted)
    }
}
