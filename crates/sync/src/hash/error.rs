//! Error types for the [`hash`](super) module.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A hashing error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for hashing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single file could not be hashed or opened for upload. None of these
/// are worth retrying.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    #[display("not a regular file: {}", _0.display())]
    NotAFile(#[error(not(source))] PathBuf),
    /// The path, or a link along it, resolves outside the allowed root, or
    /// was swapped for a symlink while being opened.
    #[display("symlink escapes its root: {}", _0.display())]
    SymlinkEscape(#[error(not(source))] PathBuf),
    #[display("I/O error reading {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
}
