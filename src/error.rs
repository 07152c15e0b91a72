//! Defines the POSIX-facing error type returned by every filesystem operation.

use crate::store::StoreError;

/// Result of filesystem operations.
pub type Result<T> = std::result::Result<T, FsError>;

/// POSIX errors surfaced by the operation layer.
///
/// Backend failures never escape as-is: the store layer reports
/// [`StoreError`] and the record and lock layers translate it into one of
/// these variants before it reaches a caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// No such file or directory. The file or directory name
    /// specified does not exist.
    #[error("no such file or directory")]
    NoEntry,
    /// File exists. The file specified already exists.
    #[error("file exists")]
    Exist,
    /// Permission denied. The caller does not have the correct
    /// permission to perform the requested operation.
    #[error("permission denied")]
    Access,
    /// Not owner. The operation was not allowed because the caller
    /// is either not a privileged user (root) or not the owner of
    /// the target of the operation.
    #[error("operation not permitted")]
    Permission,
    /// Invalid argument, for example a directory operation on a
    /// non-directory record.
    #[error("invalid argument")]
    InvalidArgument,
    /// The caller specified a directory in a non-directory operation.
    #[error("is a directory")]
    IsDir,
    /// The caller specified a non-directory in a directory operation.
    #[error("not a directory")]
    NotDir,
    /// An attempt was made to remove or replace a directory that was
    /// not empty.
    #[error("directory not empty")]
    NotEmpty,
    /// A name or path in an operation exceeded the configured limits.
    #[error("file name too long")]
    NameTooLong,
    /// Operation is not supported.
    #[error("operation not supported")]
    NotSupported,
    /// A lock could not be acquired within the retry budget.
    #[error("resource temporarily unavailable")]
    Again,
    /// A conflicting lock is already registered for this file.
    #[error("device or resource busy")]
    Busy,
    /// A hard error: backend failure, exhausted optimistic retries or
    /// a corrupt record.
    #[error("input/output error")]
    IO,
}

impl FsError {
    /// The errno value delivered to the kernel binding.
    pub fn errno(self) -> i32 {
        match self {
            FsError::Permission => 1,
            FsError::NoEntry => 2,
            FsError::IO => 5,
            FsError::Again => 11,
            FsError::Access => 13,
            FsError::Busy => 16,
            FsError::Exist => 17,
            FsError::NotDir => 20,
            FsError::IsDir => 21,
            FsError::InvalidArgument => 22,
            FsError::NameTooLong => 36,
            FsError::NotEmpty => 39,
            FsError::NotSupported => 95,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => FsError::NoEntry,
            StoreError::AlreadyExists => FsError::Exist,
            // A conditional failure that reaches this conversion was not
            // absorbed by a retry loop, so it is a hard error.
            StoreError::ConditionFailed => FsError::IO,
            StoreError::Transient(_) => FsError::IO,
        }
    }
}
