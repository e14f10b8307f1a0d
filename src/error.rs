//! Error types for the allocator and extended-attribute engine
//!
//! Every variant maps to exactly one errno via [`Error::errno`]. The match is
//! exhaustive so a new variant does not compile until it has one.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No resource group can satisfy a reservation, or an EA block is full
    #[error("no space left on device")]
    NoSpace,

    /// Named attribute does not exist
    #[error("no such attribute")]
    NoData,

    /// Create-only set of an attribute that already exists
    #[error("attribute exists")]
    Exists,

    /// Name or value outside the size limits, or a caller buffer too small
    #[error("result out of range: {0}")]
    Range(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Immutable or append-only inode
    #[error("operation not permitted")]
    NotPermitted,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("disk quota exceeded")]
    QuotaExceeded,

    /// On-disk or in-core metadata contradicts itself
    #[error("consistency error at block {block}: {detail}")]
    Consistency { block: u64, detail: String },

    /// The filesystem withdrew after a consistency fault
    #[error("filesystem withdrawn")]
    Withdrawn,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn consistency(block: u64, detail: impl Into<String>) -> Self {
        Error::Consistency {
            block,
            detail: detail.into(),
        }
    }

    /// POSIX errno equivalent, as a front end would report it
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoSpace => libc::ENOSPC,
            Error::NoData => libc::ENODATA,
            Error::Exists => libc::EEXIST,
            Error::Range(_) => libc::ERANGE,
            Error::Invalid(_) => libc::EINVAL,
            Error::NotPermitted => libc::EPERM,
            Error::Unsupported(_) => libc::EOPNOTSUPP,
            Error::QuotaExceeded => libc::EDQUOT,
            Error::Consistency { .. } => libc::EIO,
            Error::Withdrawn => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency { .. } | Error::Withdrawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(Error::NoData.errno(), libc::ENODATA);
        assert_eq!(Error::Range("x".into()).errno(), libc::ERANGE);
        assert_eq!(Error::Unsupported("repack".into()).errno(), libc::EOPNOTSUPP);
        assert_eq!(Error::consistency(7, "bad").errno(), libc::EIO);
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Error::from(io).errno(), libc::ENOENT);
    }

    #[test]
    fn test_display_names_block() {
        let err = Error::consistency(1234, "bitmap state");
        assert!(err.to_string().contains("1234"));
        assert!(err.is_consistency());
        assert!(!Error::NoSpace.is_consistency());
    }
}
