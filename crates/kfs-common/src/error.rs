//! Error types for the KFS metaserver
//!
//! One taxonomy covers validation errors (surfaced to the client as
//! negative errno values), policy errors (surfaced as the KFS-specific
//! 1000-range codes), and durability errors (fatal).

use crate::types::{EALLOCFAILED, EBADCKSUM, EBADVERS, EDATAUNAVAIL, ELEASEEXPIRED, ESERVERBUSY};
use thiserror::Error;

/// Common result type for metaserver operations.
pub type Result<T> = std::result::Result<T, MetaError>;

/// Common error type for the metaserver core.
#[derive(Debug, Error)]
pub enum MetaError {
    // Validation errors: bad request arguments, surfaced but not logged.
    #[error("no such entry")]
    NoSuchEntry,

    #[error("entry already exists")]
    Exists,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no space for placement: have {available}, need {required}")]
    NoSpace { available: usize, required: usize },

    #[error("no reachable replica for chunk")]
    HostUnreachable,

    // Policy errors: the client retries.
    #[error("stale chunk version")]
    BadVersion,

    #[error("lease expired")]
    LeaseExpired,

    #[error("replica checksum mismatch")]
    BadChecksum,

    #[error("all replicas unreachable")]
    DataUnavailable,

    #[error("server busy")]
    ServerBusy,

    #[error("chunk allocation failed")]
    AllocFailed,

    // Durability and recovery errors: fatal at the call site that owns them.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("malformed request: {0}")]
    BadRequest(String),
}

impl MetaError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Whether the client is expected to retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerBusy | Self::AllocFailed | Self::DataUnavailable
        )
    }

    /// The integer carried on the wire `Status:` line.
    ///
    /// Validation errors map to negative errno values; KFS-specific policy
    /// errors use their 1000-range codes directly.
    #[must_use]
    pub fn to_status(&self) -> i32 {
        match self {
            Self::NoSuchEntry => -libc_errno::ENOENT,
            Self::Exists => -libc_errno::EEXIST,
            Self::NotDir => -libc_errno::ENOTDIR,
            Self::IsDir => -libc_errno::EISDIR,
            Self::NotEmpty => -libc_errno::ENOTEMPTY,
            Self::Invalid(_) | Self::BadRequest(_) => -libc_errno::EINVAL,
            Self::NoSpace { .. } => -libc_errno::ENOSPC,
            Self::HostUnreachable => -libc_errno::EHOSTUNREACH,
            Self::Io(_) | Self::Corrupt(_) => -libc_errno::EIO,
            Self::BadVersion => EBADVERS,
            Self::LeaseExpired => ELEASEEXPIRED,
            Self::BadChecksum => EBADCKSUM,
            Self::DataUnavailable => EDATAUNAVAIL,
            Self::ServerBusy => ESERVERBUSY,
            Self::AllocFailed => EALLOCFAILED,
        }
    }
}

/// The handful of errno values the protocol surfaces, kept here so the
/// crate does not depend on libc for six integers.
mod libc_errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOTEMPTY: i32 = 39;
    pub const EHOSTUNREACH: i32 = 113;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(MetaError::NoSuchEntry.to_status(), -2);
        assert_eq!(MetaError::Exists.to_status(), -17);
        assert_eq!(MetaError::LeaseExpired.to_status(), 1001);
        assert_eq!(MetaError::AllocFailed.to_status(), 1005);
    }

    #[test]
    fn test_retryable() {
        assert!(MetaError::AllocFailed.is_retryable());
        assert!(MetaError::ServerBusy.is_retryable());
        assert!(!MetaError::NoSuchEntry.is_retryable());
    }
}
