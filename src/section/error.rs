//! Error types
//!
//! Only caller mistakes and exhausted limits are surfaced. Recoverable I/O
//! failures are absorbed by the clean protocol and consistency violations
//! stop the process.

use thiserror::Error;

use crate::section::config::ConfigError;
use crate::section::object::ObjectId;

/// Errors returned by the section manager
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// No live object with this id
    #[error("unknown backing object {0:?}")]
    UnknownObject(ObjectId),

    /// Object is being created or deleted and takes no new references
    #[error("backing object {0:?} is being created or deleted")]
    ObjectUnavailable(ObjectId),

    /// Page index outside the object
    #[error("page {page} is outside backing object {object:?}")]
    PageOutOfRange { object: ObjectId, page: u64 },

    /// Page lies in a shard whose storage was released while unmapped
    #[error("page {page} of backing object {object:?} is not mapped")]
    NotMapped { object: ObjectId, page: u64 },

    /// Commit charge could not be reserved
    #[error("commit limit reached reserving {0} pages")]
    CommitLimit(u64),

    /// Page frame database has no free frames
    #[error("no free page frames")]
    OutOfFrames,

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Worker thread could not be started
    #[error("failed to spawn the dereference worker: {0}")]
    WorkerSpawn(String),
}

/// Result alias for section manager operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Completion status of a file write or flush acquisition
///
/// A status is a value, not an error: the clean protocol decides what each
/// one means for the object being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Write completed
    Success,
    /// File system lock held elsewhere
    FileLockConflict,
    /// Another write to the same range is in flight
    WriteInProgress,
    /// Non-retryable failure
    Failed(i32),
}

impl IoStatus {
    /// Check for success
    pub fn is_success(self) -> bool {
        self == IoStatus::Success
    }

    /// Transient statuses worth retrying
    pub fn is_retryable(self) -> bool {
        matches!(self, IoStatus::FileLockConflict | IoStatus::WriteInProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_status_classes() {
        assert!(IoStatus::Success.is_success());
        assert!(IoStatus::FileLockConflict.is_retryable());
        assert!(IoStatus::WriteInProgress.is_retryable());
        assert!(!IoStatus::Failed(-5).is_retryable());
        assert!(!IoStatus::Failed(-5).is_success());
    }

    #[test]
    fn test_error_display() {
        let err = LifecycleError::CommitLimit(12);
        assert_eq!(err.to_string(), "commit limit reached reserving 12 pages");

        let err: LifecycleError = ConfigError::ZeroLockWindow.into();
        assert!(matches!(err, LifecycleError::InvalidConfig(_)));
    }
}
