//! SQLite caches that let repeat transfers skip work.
//!
//! Neither cache is a source of truth. If the database file is deleted or
//! corrupt, the next run re-hashes files and re-checks remote objects and
//! ends up with the same result, only slower.
//!
//! # Contents
//! - [`HashCache`]: content hash of a local file, keyed by absolute path and
//!   algorithm, trusted only while the file's size and mtime are unchanged.
//! - [`ExistenceCache`]: object keys confirmed present in remote storage,
//!   trusted for [`ExistenceCache::DEFAULT_TTL`].

mod db;
pub mod error;
mod existence;
mod hash;

pub use crate::db::Database;
pub use crate::existence::ExistenceCache;
pub use crate::hash::{CachedHash, FileStamp, HashCache, HashEffort, HashEntry};
