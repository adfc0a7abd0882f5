//! Error kinds surfaced by the scanning and caching engine.
//!
//! Only [`ScanError::ContainerUnreadable`] and [`ScanError::Cancelled`] ever
//! reach the caller of `open_module`; decode and cache failures are recovered
//! inside the cache manager and show up as an incomplete index or a forced
//! rescan instead.

use thiserror::Error;

use crate::record::ClassRecord;

/// Failure to turn one class file into a [`ClassRecord`].
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The header could not be read: bad magic, truncation before the
    /// interface table, unsupported major version or a broken constant pool.
    #[error("malformed class: {reason}")]
    MalformedClass { reason: String },

    /// The header decoded but a later section is corrupt. The partial record
    /// holds everything decoded before the failure.
    #[error("incomplete class {}: {reason}", partial.name)]
    IncompleteClass {
        partial: Box<ClassRecord>,
        reason: String,
    },
}

impl DecodeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedClass {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::MalformedClass { reason } | Self::IncompleteClass { reason, .. } => reason,
        }
    }
}

/// Errors reported by the engine, the cache manager and the query engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("container unreadable: {path}: {reason}")]
    ContainerUnreadable { path: String, reason: String },

    #[error("cache entry corrupt for {key}: {reason}")]
    CacheCorrupt { key: String, reason: String },

    #[error("unknown reference type: {name}")]
    UnknownReferenceType { name: String },

    #[error("scan of {path} cancelled")]
    Cancelled { path: String },
}

impl ScanError {
    pub fn unreadable(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::ContainerUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by a [`crate::store::CacheStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache store backend error: {0}")]
    Backend(String),

    #[error("cache store is read-only")]
    ReadOnly,
}

impl From<heed::Error> for StoreError {
    fn from(err: heed::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors raised while encoding or decoding a persisted index blob.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("blob too short ({0} bytes)")]
    Truncated(usize),

    #[error("bad blob magic")]
    BadMagic,

    #[error("unsupported blob version {found} (expected {expected})")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("blob payload error: {0}")]
    Payload(#[from] bincode::Error),
}

pub type ScanResult<T> = Result<T, ScanError>;
