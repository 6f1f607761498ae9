use crate::hash::Hasher;
use crate::layout::Layout;
use crate::permissions::{self, PermissionSetter};
use crate::retry::RetryPolicy;
use jattach_cache::{Database, ExistenceCache, HashCache};
use jattach_manifest::HashAlgorithm;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// S3 multipart chunk size; the small/large split is a multiple of it.
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Limits and policies for hashing and transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub hash_alg: HashAlgorithm,
    pub hash_concurrency: usize,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    /// Blobs up to this size are uploaded concurrently; larger ones go one
    /// at a time after all small ones.
    pub small_file_threshold: u64,
    pub retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            hash_alg: HashAlgorithm::default(),
            hash_concurrency: 8,
            upload_concurrency: 10,
            download_concurrency: 10,
            small_file_threshold: CHUNK_SIZE * 20,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything an operation needs besides its inputs.
///
/// Caches are optional: without them every file is hashed and every blob is
/// checked remotely, which is slower but produces the same result.
#[derive(Debug, Clone)]
pub struct Context {
    pub layout: Layout,
    pub settings: TransferSettings,
    pub cancel: CancellationToken,
    pub hashes: Option<HashCache>,
    pub existence: Option<ExistenceCache>,
    pub permissions: Arc<dyn PermissionSetter>,
}

impl Context {
    /// A context with no caches and the host's default permission policy.
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            settings: TransferSettings::default(),
            cancel: CancellationToken::new(),
            hashes: None,
            existence: None,
            permissions: permissions::host_default(),
        }
    }

    pub fn with_settings(mut self, settings: TransferSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use both caches backed by `db`.
    pub fn with_caches(mut self, db: &Database) -> Self {
        self.hashes = Some(HashCache::from(db));
        self.existence = Some(ExistenceCache::from(db));
        self
    }

    pub fn with_existence_cache(mut self, cache: ExistenceCache) -> Self {
        self.existence = Some(cache);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionSetter>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn hasher(&self) -> Hasher {
        Hasher::new(self.settings.hash_alg, self.hashes.clone())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
