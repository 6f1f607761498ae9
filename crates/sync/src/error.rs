//! Sync Error Types
//!
//! Operation-level failures. Per-file failures during a transfer are not
//! returned as errors; they are collected into the report (see
//! [`TransferFailure`](crate::TransferFailure)) so one bad file does not
//! abort its siblings.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// ### Input Errors (never retried)
/// - [`ErrorKind::Validation`]
/// - [`ErrorKind::PathOutsideDirectory`]
///
/// ### Operational Errors
/// - [`ErrorKind::Cancelled`]
/// - [`ErrorKind::ManifestUpload`]
/// - [`ErrorKind::InsufficientDiskSpace`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Hash`]
/// - [`ErrorKind::Storage`]
/// - [`ErrorKind::Io`]
/// - [`ErrorKind::Permissions`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("invalid input: {_0}")]
    Validation(#[error(not(source))] String),
    /// A manifest path would be written outside the download directory.
    #[display("{path} resolves outside of {}", root.display())]
    PathOutsideDirectory { path: String, root: PathBuf },
    #[display("operation cancelled")]
    Cancelled,
    /// The manifest document itself could not be stored. Blobs may have been
    /// uploaded, but nothing references them yet.
    #[display("failed to upload manifest {_0}")]
    ManifestUpload(#[error(not(source))] String),
    #[display("{required} bytes needed but only {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },
    #[display("could not hash file")]
    Hash,
    #[display("storage backend error")]
    Storage,
    #[display("local file error at {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    #[display("could not set permissions on {}", _0.display())]
    Permissions(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Io(_))
    }
}
