//! Error types for blockio
//!
//! One error enum covers the image layer: configuration problems surface
//! before any store round-trip, store failures carry the remote status, and
//! `Internal` is reserved for impossible states.

use thiserror::Error;

/// Common result type for blockio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blockio
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Inconsistent configuration (striping, feature dependencies)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Feature bit outside the supported universe
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Numeric parameter outside its domain
    #[error("{what} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    /// Referenced pool or object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Object or directory entry already exists
    #[error("already exists: {0}")]
    Conflict(String),

    /// Store transport or class-method failure
    #[error("store I/O error: {0}")]
    StoreIo(String),

    /// Assertion or impossible state; fatal
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a conflict error
    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    /// Create a store I/O error
    pub fn store_io(msg: impl Into<String>) -> Self {
        Self::StoreIo(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error signals a bug rather than an operational failure
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::not_found("rbd_directory").is_not_found());
        assert!(!Error::store_io("timed out").is_not_found());
    }

    #[test]
    fn test_fatal_predicate() {
        assert!(Error::internal("unreachable state").is_fatal());
        assert!(!Error::conflict("rbd_id.img1").is_fatal());
    }

    #[test]
    fn test_out_of_range_display() {
        let err = Error::OutOfRange {
            what: "order",
            value: 26,
            min: 12,
            max: 25,
        };
        assert_eq!(err.to_string(), "order out of range: 26 not in [12, 25]");
    }
}
