//! Directory-backed object store.
//!
//! Keys map onto paths below a root directory. Handy for render farms that
//! share a network filesystem instead of an object store, and for exercising
//! the sync engine end-to-end in tests.

use super::{ByteReader, ObjectInfoStream, WalkEntry, check_streamed_size};
use crate::error::ErrorKind;
use crate::{ObjectInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

/// Suffix for in-flight writes; readers never see half-written objects.
const PARTIAL_SUFFIX: &str = ".partial";

/// Object store rooted at a local directory.
///
/// # Examples
///
/// ```no_run
/// use jattach_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("shared", "/mnt/farm/attachments")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new directory-backed store, creating `root` if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only happens once at construction, not worth an async constructor.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        if !absolute.is_absolute() {
            exn::bail!(ErrorKind::BackendError(format!(
                "attempting to get relative key of non-absolute path `{:?}`",
                absolute
            )))
        }
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        Ok(validate_path(relative)?)
    }

    fn partial_path(abs_path: &Path) -> PathBuf {
        let mut partial = abs_path.as_os_str().to_owned();
        partial.push(PARTIAL_SUFFIX);
        PathBuf::from(partial)
    }

    /// Create parent directories and hand back the in-flight path.
    async fn prepare_write(&self, path: &Path) -> Result<(PathBuf, PathBuf)> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        let partial = Self::partial_path(&abs_path);
        Ok((abs_path, partial))
    }

    async fn commit_write(partial: &Path, abs_path: &Path, path: &Path) -> Result<()> {
        if let Err(e) = fs::rename(partial, abs_path).await {
            let _ = fs::remove_file(partial).await;
            exn::bail!(Self::map_io_error(e, path));
        }
        Ok(())
    }

    fn object_info(key: &Path, metadata: Metadata) -> Result<ObjectInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        Ok(ObjectInfo::new(key, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Pulled out of the stream loop so errors can be `?`-propagated here and
    /// yielded once there.
    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == &PARTIAL_SUFFIX[1..]) {
            return Ok(WalkEntry::Skip);
        }
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Descend into ancestors of the prefix as well as its children.
            return match prefix {
                Some(pfx) if !relative.starts_with(pfx) && !pfx.starts_with(&relative) => Ok(WalkEntry::Skip),
                _ => Ok(WalkEntry::Descend(path)),
            };
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::Object(Self::object_info(&relative, metadata)?));
        }
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        // Walk from the parent of the prefix so a prefix naming an object
        // (or nothing yet) does not error. Matching is component-wise: the
        // prefix "Root/Data" matches "Root/Data/x" but not "Root/Database/x".
        let start_dir = validated_prefix
            .as_ref()
            .map(|prefix| self.root.join(prefix).parent().unwrap_or(&self.root).to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Listing a prefix that doesn't exist is empty, same as S3.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::Object(info)) => yield Ok(info),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        match fs::metadata(&abs_path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(exn::Exn::from(Self::map_io_error(e, path))),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn reader(&self, path: &Path) -> Result<ByteReader> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::pin(file))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let (abs_path, partial) = self.prepare_write(path).await?;
        fs::write(&partial, data).await.map_err(|e| Self::map_io_error(e, path))?;
        Self::commit_write(&partial, &abs_path, path).await
    }

    async fn write_stream(&self, path: &Path, mut source: ByteReader, size: u64) -> Result<()> {
        let (abs_path, partial) = self.prepare_write(path).await?;
        let copied = async {
            let mut file = fs::File::create(&partial).await.map_err(|e| Self::map_io_error(e, path))?;
            let copied = tokio::io::copy(&mut source, &mut file).await.map_err(|e| Self::map_io_error(e, path))?;
            file.flush().await.map_err(|e| Self::map_io_error(e, path))?;
            check_streamed_size(path, copied, size)
        };
        if let Err(e) = copied.await {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }
        Self::commit_write(&partial, &abs_path, path).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn stat(&self, path: &Path) -> Result<ObjectInfo> {
        let key = validate_path(path)?;
        let metadata = fs::metadata(self.root.join(&key)).await.map_err(|e| Self::map_io_error(e, path))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(key));
        }
        Self::object_info(&key, metadata)
    }
}
