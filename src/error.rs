//! Error types for flatdb operations.
//!
//! Every fallible operation returns [`Error`]; each variant maps onto a
//! stable [`ErrorCode`] that the handle also records as its last-error
//! field, so embedders porting from result-code APIs can keep their
//! error-dispatch tables.

use std::io;
use thiserror::Error;

/// Result type for flatdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error from the underlying file or mapping.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested key does not exist.
    #[error("key not found")]
    NotFound,

    /// An insert-only store found the key already present.
    #[error("key already exists")]
    Exists,

    /// The on-disk structure is inconsistent: a bad status tag, a chain
    /// that points at itself, or a record length running past end of file.
    #[error("database corrupted: {0}")]
    Corrupt(String),

    /// A lock could not be acquired, or the lock table was misused.
    #[error("lock failure: {0}")]
    Lock(String),

    /// An allocation request could not be represented or satisfied.
    #[error("allocation failure: {0}")]
    Oom(String),

    /// A mutation was attempted through a read-only handle.
    #[error("database opened read-only")]
    ReadOnly,

    /// An open-time parameter or argument was invalid.
    #[error("invalid parameter: {0}")]
    Invalid(String),
}

/// Stable code for each error class, mirrored into the handle's
/// last-error field after every public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    Io,
    NotFound,
    Exists,
    Corrupt,
    Lock,
    Oom,
    ReadOnly,
    Invalid,
}

impl Error {
    /// Returns the stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::Io,
            Error::NotFound => ErrorCode::NotFound,
            Error::Exists => ErrorCode::Exists,
            Error::Corrupt(_) => ErrorCode::Corrupt,
            Error::Lock(_) => ErrorCode::Lock,
            Error::Oom(_) => ErrorCode::Oom,
            Error::ReadOnly => ErrorCode::ReadOnly,
            Error::Invalid(_) => ErrorCode::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_distinct_code() {
        let codes = [
            Error::Io(io::Error::new(io::ErrorKind::Other, "x")).code(),
            Error::NotFound.code(),
            Error::Exists.code(),
            Error::Corrupt("t".into()).code(),
            Error::Lock("t".into()).code(),
            Error::Oom("t".into()).code(),
            Error::ReadOnly.code(),
            Error::Invalid("t".into()).code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn io_errors_convert() {
        let e: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.code(), ErrorCode::Io);
    }
}
