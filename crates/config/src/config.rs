use crate::error::{ErrorKind, Result};
use directories::BaseDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use jattach_cache::{Database, ExistenceCache};
use jattach_storage::backend::{LocalBackend, S3Backend};
use jattach_storage::BackendHandle;
use jattach_sync::download::{ConflictResolution, DownloadOptions};
use jattach_sync::{CHUNK_SIZE, Context, Layout, RetryPolicy, TransferSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "JATTACH_";
const DATABASE_FILE: &str = "cache.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub download: DownloadConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Defaults to `~/.deadline/job_attachments`.
    pub directory: Option<PathBuf>,
    pub existence_ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            existence_ttl_days: 30,
        }
    }
}

impl CacheConfig {
    pub fn directory(&self) -> Result<PathBuf> {
        if let Some(directory) = &self.directory {
            return Ok(directory.clone());
        }
        let base = BaseDirs::new().ok_or_raise(|| ErrorKind::NoHomeDirectory)?;
        Ok(base.home_dir().join(".deadline").join("job_attachments"))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.directory()?.join(DATABASE_FILE))
    }

    pub fn existence_ttl(&self) -> time::Duration {
        time::Duration::days(i64::from(self.existence_ttl_days))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub hash_concurrency: usize,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    /// Blobs up to this many multipart chunks are uploaded concurrently.
    pub small_file_threshold_multiplier: u64,
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let defaults = TransferSettings::default();
        Self {
            hash_concurrency: defaults.hash_concurrency,
            upload_concurrency: defaults.upload_concurrency,
            download_concurrency: defaults.download_concurrency,
            small_file_threshold_multiplier: defaults.small_file_threshold / CHUNK_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: u64::try_from(defaults.base_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(defaults.max_delay.as_millis()).unwrap_or(u64::MAX),
            backoff_multiplier: defaults.backoff_multiplier,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

/// How downloads treat files that already exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conflict {
    Skip,
    #[default]
    Overwrite,
    CreateCopy,
}

impl From<Conflict> for ConflictResolution {
    fn from(conflict: Conflict) -> Self {
        match conflict {
            Conflict::Skip => Self::Skip,
            Conflict::Overwrite => Self::Overwrite,
            Conflict::CreateCopy => Self::CreateCopy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub conflict_resolution: Conflict,
    pub check_disk_capacity: bool,
    /// Share downloaded files with this POSIX group instead of keeping them
    /// owner-only.
    pub group: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            conflict_resolution: Conflict::default(),
            check_disk_capacity: true,
            group: None,
        }
    }
}

impl DownloadConfig {
    pub fn options(&self) -> DownloadOptions {
        DownloadOptions {
            conflict: self.conflict_resolution.into(),
            check_disk_capacity: self.check_disk_capacity,
        }
    }
}

/// Where blobs and manifests are stored: a bucket, or a directory for farms
/// sharing a filesystem.
#[derive(derive_more::Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix under which `Data/` and `Manifests/` live.
    pub root_prefix: String,
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// For S3-compatible services.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    #[debug(skip)]
    pub secret_access_key: Option<String>,
    /// Use this directory as the store instead of a bucket.
    pub local_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_prefix: "DeadlineCloud".to_string(),
            bucket: None,
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            local_root: None,
        }
    }
}

impl StorageConfig {
    pub fn layout(&self) -> Layout {
        Layout::new(&self.root_prefix)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| exn::Exn::from(ErrorKind::Invalid(message.to_string()));
        if self.bucket.is_some() && self.local_root.is_some() {
            return Err(invalid("storage.bucket and storage.local_root are mutually exclusive"));
        }
        if self.bucket.is_some() && self.region.is_none() {
            return Err(invalid("storage.region is required with storage.bucket"));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(invalid("storage.access_key_id and storage.secret_access_key go together"));
        }
        if self.local_root.as_deref().is_some_and(|root| !root.is_absolute()) {
            return Err(invalid("storage.local_root must be absolute"));
        }
        Ok(())
    }

    /// Build the configured backend.
    ///
    /// # Errors
    /// [`ErrorKind::Invalid`] when neither a bucket nor a local root is
    /// configured, or a bucket lacks credentials; [`ErrorKind::Storage`] when
    /// the backend itself refuses the settings.
    pub async fn backend(&self) -> Result<BackendHandle> {
        self.validate()?;
        let invalid = |message: &str| exn::Exn::from(ErrorKind::Invalid(message.to_string()));
        let backend: BackendHandle = match (&self.local_root, &self.bucket) {
            (Some(root), _) => Arc::new(LocalBackend::new("local", root).or_raise(|| ErrorKind::Storage)?),
            (None, Some(bucket)) => {
                let region = self
                    .region
                    .clone()
                    .ok_or_raise(|| ErrorKind::Invalid("storage.region is required with storage.bucket".to_string()))?;
                let (Some(key_id), Some(secret)) = (&self.access_key_id, &self.secret_access_key) else {
                    return Err(invalid("storage.access_key_id and storage.secret_access_key are required with a bucket"));
                };
                let backend = S3Backend::new(
                    bucket.clone(),
                    bucket.clone(),
                    None,
                    region,
                    self.endpoint.clone(),
                    key_id.clone(),
                    secret.clone(),
                )
                .await
                .or_raise(|| ErrorKind::Storage)?;
                Arc::new(backend)
            },
            (None, None) => return Err(invalid("set storage.bucket or storage.local_root")),
        };
        tracing::debug!(name = backend.name(), identity = %backend.identity(), "storage backend ready");
        Ok(backend)
    }
}

impl Config {
    /// Defaults, then `file` (format chosen by extension) if given, then the
    /// environment. The result is validated.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
                Some("json") => figment.merge(Json::file_exact(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| exn::Exn::from(ErrorKind::Invalid(message.to_string()));
        let transfer = &self.transfer;
        if transfer.hash_concurrency == 0 || transfer.upload_concurrency == 0 || transfer.download_concurrency == 0 {
            return Err(invalid("concurrency limits must be at least 1"));
        }
        if transfer.small_file_threshold_multiplier == 0 {
            return Err(invalid("transfer.small_file_threshold_multiplier must be at least 1"));
        }
        let retry = &transfer.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("transfer.retry.max_attempts must be at least 1"));
        }
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return Err(invalid("transfer.retry.backoff_multiplier must be at least 1.0"));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(invalid("transfer.retry.max_delay_ms is below base_delay_ms"));
        }
        if self.cache.existence_ttl_days == 0 {
            return Err(invalid("cache.existence_ttl_days must be at least 1"));
        }
        if self.storage.root_prefix.trim_matches('/').is_empty() {
            return Err(invalid("storage.root_prefix must not be empty"));
        }
        if self.download.group.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("download.group must not be empty"));
        }
        self.storage.validate()
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        let transfer = &self.transfer;
        TransferSettings {
            hash_concurrency: transfer.hash_concurrency,
            upload_concurrency: transfer.upload_concurrency,
            download_concurrency: transfer.download_concurrency,
            small_file_threshold: CHUNK_SIZE.saturating_mul(transfer.small_file_threshold_multiplier),
            retry: RetryPolicy::from(&transfer.retry),
            ..TransferSettings::default()
        }
    }

    /// Build a [`Context`] from this configuration, opening the cache
    /// database if caching is enabled.
    pub async fn context(&self) -> Result<Context> {
        let mut ctx = Context::new(self.storage.layout()).with_settings(self.transfer_settings());
        if self.cache.enabled {
            let path = self.cache.database_path()?;
            let db = Database::connect_or_recover(&path).await.or_raise(|| ErrorKind::Cache)?;
            tracing::debug!(path = %path.display(), "opened cache database");
            ctx = ctx
                .with_caches(&db)
                .with_existence_cache(ExistenceCache::from(&db).with_ttl(self.cache.existence_ttl()));
        }
        #[cfg(unix)]
        if let Some(group) = &self.download.group {
            use jattach_sync::permissions::PosixPermissions;
            ctx = ctx.with_permissions(std::sync::Arc::new(PosixPermissions::default().with_group(group)));
        }
        #[cfg(not(unix))]
        if self.download.group.is_some() {
            tracing::warn!("download.group only applies to POSIX hosts; ignoring");
        }
        Ok(ctx)
    }
}
