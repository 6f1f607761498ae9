//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface over the content-addressed store: a local directory (useful for
//! shared filesystems and tests), S3-compatible services, or an in-memory
//! mock.

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::Result;
use crate::models::ObjectInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

type ObjectInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send + 'a>>;

/// Owned async byte source, for moving objects without holding them in
/// memory.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + 'static>>;

enum WalkEntry {
    Object(ObjectInfo),
    Descend(PathBuf),
    Skip,
}

/// Unified interface for storage backends.
///
/// All storage operations are asynchronous; uploads and downloads run many
/// of them concurrently against the same handle, so implementations must be
/// safe to share behind an [`Arc`](std::sync::Arc).
///
/// # Key Handling
/// All keys are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use jattach_storage::{backend::StorageBackend, error::Result};
///
/// async fn fetch_blob(backend: &dyn StorageBackend, hash: &str) -> Result<Option<Vec<u8>>> {
///     let key = Path::new("Root/Data").join(format!("{hash}.xxh128"));
///     if backend.exists(&key).await? {
///         Ok(Some(backend.read(&key).await?))
///     } else {
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Where the objects actually live, e.g. `s3://bucket/prefix`.
    ///
    /// Two handles with equal identities see the same objects, whatever
    /// their names. Anything caching remote state must key on this.
    fn identity(&self) -> String;

    /// List all objects matching an optional prefix.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`] before
    /// returning.
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<ObjectInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream object metadata matching an optional prefix.
    ///
    /// Yields results incrementally. If a prefix is provided, only objects
    /// whose keys start with the prefix (component-wise) are returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use jattach_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(Some(Path::new("Root/Manifests")));
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.path.display(), info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a>;

    /// Check if an object exists.
    ///
    /// This is the "HEAD" of the upload path: a positive answer means the
    /// blob does not need to be written again.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read object contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open an object for streaming reads.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist. The default implementation buffers the whole object
    /// through [`read()`](Self::read).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use tokio::io::AsyncReadExt;
    /// # use jattach_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut reader = backend.reader(Path::new("Root/Data/abc.xxh128")).await?;
    /// let mut chunk = vec![0; 8192];
    /// while reader.read(&mut chunk).await.map_err(jattach_storage::error::ErrorKind::Io)? > 0 {
    ///     // ...
    /// }
    /// # Ok(())
    /// # }
    /// ```
    async fn reader(&self, path: &Path) -> Result<ByteReader> {
        let data = self.read(path).await?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    /// Write object contents, replacing any existing object at that key.
    ///
    /// # Notes
    /// - Implementations should create intermediate "directories" as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Stream exactly `size` bytes from `source` into an object, replacing
    /// any existing object at that key.
    ///
    /// A source yielding fewer or more bytes than `size` is an error and
    /// leaves no object behind. The default implementation buffers the
    /// whole object and hands it to [`write()`](Self::write).
    async fn write_stream(&self, path: &Path, mut source: ByteReader, size: u64) -> Result<()> {
        let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
        source.read_to_end(&mut data).await.map_err(crate::error::ErrorKind::Io)?;
        check_streamed_size(path, data.len() as u64, size)?;
        self.write(path, &data).await
    }

    /// Delete an object.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Get object metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<ObjectInfo>;
}

/// A stream that ends early, or runs on, is not the object the caller meant.
fn check_streamed_size(path: &Path, actual: u64, expected: u64) -> Result<()> {
    if actual != expected {
        exn::bail!(crate::error::ErrorKind::BackendError(format!(
            "{}: source yielded {actual} bytes, expected {expected}",
            path.display()
        )));
    }
    Ok(())
}
