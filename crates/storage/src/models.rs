//! Storage models.

use std::path::PathBuf;
use time::OffsetDateTime;

/// Object metadata returned by storage backends.
///
/// Used for listing and for `stat`-style existence checks. Object stores do
/// not preserve the local file's modification time; `modified` is when the
/// object was last written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the storage root
    pub path: PathBuf,
    /// Object size in bytes
    pub size: u64,
    /// Last written timestamp
    pub modified: OffsetDateTime,
}
impl ObjectInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: impl Into<OffsetDateTime>) -> Self {
        Self {
            path: path.into(),
            size,
            modified: modified.into(),
        }
    }
}
