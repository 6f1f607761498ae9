//! Content hashing of local files.
//!
//! [`hash_file`] always reads the file; [`Hasher`] goes through the
//! [`HashCache`] first and only reads files whose size or mtime changed.
//! Both resolve symlinks and refuse anything that lands outside the allowed
//! root.

pub mod error;
mod file;

pub use self::file::{FileDigest, VerifiedFile, hash_file, open_verified};
pub(crate) use self::file::micros;
use self::error::{ErrorKind, Result};
use exn::ResultExt;
use jattach_cache::{HashCache, HashEffort};
use jattach_manifest::HashAlgorithm;
use std::path::{Path, PathBuf};

/// A digest and whether it had to be computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digested {
    pub digest: FileDigest,
    pub effort: HashEffort,
}

/// Hashes files, reusing cached hashes for files that have not changed.
#[derive(Debug, Clone)]
pub struct Hasher {
    alg: HashAlgorithm,
    cache: Option<HashCache>,
}

impl Hasher {
    pub fn new(alg: HashAlgorithm, cache: Option<HashCache>) -> Self {
        Self { alg, cache }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.alg
    }

    /// Digest one file.
    ///
    /// The file is opened (and verified) once; its size and mtime decide
    /// whether the cached hash is still good, and on a miss the same handle
    /// is read, so a file swapped mid-way cannot poison the cache.
    pub async fn digest(&self, path: &Path, allowed_root: Option<&Path>) -> Result<Digested> {
        let file = open_blocking(path, allowed_root).await?;
        let (size, mtime, stamp) = (file.size(), file.mtime_micros(), file.stamp());
        let resolved = file.resolved().to_path_buf();
        let alg = self.alg;
        let compute = move || read_blocking(file, alg);
        let (hash, effort) = match &self.cache {
            Some(cache) => {
                let cached = cache.get_or_compute(&resolved, alg, stamp, compute).await?;
                (cached.hash, cached.effort)
            },
            None => (compute().await?, HashEffort::Computed),
        };
        Ok(Digested {
            digest: FileDigest { hash, size, mtime },
            effort,
        })
    }
}

/// [`open_verified`] on the blocking pool.
pub(crate) async fn open_blocking(path: &Path, allowed_root: Option<&Path>) -> Result<VerifiedFile> {
    let (owned, root) = (path.to_path_buf(), allowed_root.map(Path::to_path_buf));
    tokio::task::spawn_blocking(move || open_verified(&owned, root.as_deref()))
        .await
        .or_raise(|| ErrorKind::Io(path.to_path_buf()))?
}

async fn read_blocking(file: VerifiedFile, alg: HashAlgorithm) -> Result<String> {
    let path: PathBuf = file.resolved().to_path_buf();
    tokio::task::spawn_blocking(move || file.hash(alg)).await.or_raise(|| ErrorKind::Io(path))?
}

/// Read a whole verified file, off the async runtime.
pub(crate) async fn read_all(file: VerifiedFile) -> Result<Vec<u8>> {
    let resolved = file.resolved().to_path_buf();
    tokio::task::spawn_blocking(move || file.into_bytes()).await.or_raise(|| ErrorKind::Io(resolved))?
}
