//! Persistent cache of local file content hashes.

use crate::Database;
use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use jattach_manifest::HashAlgorithm;
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

/// What the file looked like on disk when it was hashed. A cached hash is
/// only trusted while the current stamp is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    /// Modification time, nanoseconds since the Unix epoch.
    pub mtime_ns: i128,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub path: PathBuf,
    pub algorithm: HashAlgorithm,
    pub hash: String,
    pub stamp: FileStamp,
    pub cached_at: UtcDateTime,
}

/// Whether a hash came from the cache or had to be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEffort {
    Cached,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHash {
    pub hash: String,
    pub effort: HashEffort,
}

#[derive(sqlx::FromRow)]
struct HashRow {
    file_path: String,
    hash_algorithm: String,
    file_hash: String,
    mtime_ns: i64,
    file_size: i64,
    cached_at: i64,
}
impl TryFrom<&HashEntry> for HashRow {
    type Error = Error;
    fn try_from(entry: &HashEntry) -> Result<Self> {
        Ok(Self {
            file_path: path_key(&entry.path)?,
            hash_algorithm: entry.algorithm.as_str().to_string(),
            file_hash: entry.hash.clone(),
            mtime_ns: i64::try_from(entry.stamp.mtime_ns).or_raise(|| ErrorKind::InvalidData("modification time"))?,
            file_size: i64::try_from(entry.stamp.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            cached_at: entry.cached_at.unix_timestamp(),
        })
    }
}
impl TryFrom<HashRow> for HashEntry {
    type Error = Error;
    fn try_from(row: HashRow) -> Result<Self> {
        Ok(Self {
            path: PathBuf::from(row.file_path),
            algorithm: HashAlgorithm::from_name(&row.hash_algorithm)
                .ok_or_raise(|| ErrorKind::InvalidData("hash algorithm"))?,
            hash: row.file_hash,
            stamp: FileStamp {
                mtime_ns: i128::from(row.mtime_ns),
                size: u64::try_from(row.file_size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            },
            cached_at: UtcDateTime::from_unix_timestamp(row.cached_at)
                .or_raise(|| ErrorKind::InvalidData("cache timestamp"))?,
        })
    }
}

fn path_key(path: &Path) -> Result<String> {
    Ok(path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
}

/// Maps (absolute path, algorithm) to the hash of the file's content as of
/// a given [`FileStamp`].
///
/// Writes are single upserts, so concurrent writers of the same key resolve
/// last-write-wins.
#[derive(Debug, Clone)]
pub struct HashCache {
    pool: SqlitePool,
}
impl From<&Database> for HashCache {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

impl HashCache {
    /// Fetch the cached entry regardless of whether it is still fresh.
    pub async fn get(&self, path: &Path, algorithm: HashAlgorithm) -> Result<Option<HashEntry>> {
        let row: Option<HashRow> = sqlx::query_as(include_str!("../queries/hash_get.sql"))
            .bind(path_key(path)?)
            .bind(algorithm.as_str())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(HashEntry::try_from).transpose()
    }

    /// Insert or replace an entry.
    pub async fn put(&self, entry: &HashEntry) -> Result<()> {
        let row = HashRow::try_from(entry)?;
        sqlx::query(include_str!("../queries/hash_upsert.sql"))
            .bind(row.file_path)
            .bind(row.hash_algorithm)
            .bind(row.file_hash)
            .bind(row.mtime_ns)
            .bind(row.file_size)
            .bind(row.cached_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Delete entries not refreshed since `cutoff`. Returns how many went.
    pub async fn evict_before(&self, cutoff: UtcDateTime) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/hash_evict.sql"))
            .bind(cutoff.unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    /// Return the cached hash if `stamp` still matches, otherwise run
    /// `compute` and remember its result.
    ///
    /// Cache failures are logged and treated as a miss; only `compute`'s own
    /// error is returned.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        path: &Path,
        algorithm: HashAlgorithm,
        stamp: FileStamp,
        compute: F,
    ) -> std::result::Result<CachedHash, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<String, E>>,
    {
        match self.get(path, algorithm).await {
            Ok(Some(entry)) if entry.stamp == stamp => {
                tracing::trace!(path = %path.display(), "hash cache hit");
                return Ok(CachedHash {
                    hash: entry.hash,
                    effort: HashEffort::Cached,
                });
            },
            Ok(_) => {},
            Err(error) => tracing::warn!(path = %path.display(), error = ?error, "hash cache lookup failed"),
        }
        let hash = compute().await?;
        let entry = HashEntry {
            path: path.to_path_buf(),
            algorithm,
            hash,
            stamp,
            cached_at: UtcDateTime::now(),
        };
        if let Err(error) = self.put(&entry).await {
            tracing::warn!(path = %path.display(), error = ?error, "hash cache update failed");
        }
        Ok(CachedHash {
            hash: entry.hash,
            effort: HashEffort::Computed,
        })
    }
}
