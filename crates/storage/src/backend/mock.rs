//! In-memory storage backend for testing.

use super::ObjectInfoStream;
use crate::error::{ErrorKind, Result};
use crate::models::ObjectInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use time::UtcDateTime;
use tokio::sync::RwLock;

use crate::StorageBackend;

/// In-memory storage backend for testing.
///
/// Objects are stored in a `HashMap` behind a [`RwLock`]. Every call is
/// counted so tests can assert how many round trips an operation cost, and
/// transient failures can be queued to exercise retry paths.
///
/// # Examples
///
/// ```
/// use jattach_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("Root/Data/abc.xxh128", b"blob"),
/// ]);
/// assert!(backend.exists(Path::new("Root/Data/abc.xxh128")).await?);
/// assert_eq!(backend.exists_count(), 1);
///
/// backend.fail_next_writes(1);
/// assert!(backend.write(Path::new("Root/Data/def.xxh128"), b"x").await.is_err());
/// backend.write(Path::new("Root/Data/def.xxh128"), b"x").await?;
/// assert_eq!(backend.write_count(), 2);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    root: Option<String>,
    storage: RwLock<HashMap<PathBuf, (UtcDateTime, Vec<u8>)>>,
    writes: AtomicUsize,
    reads: AtomicUsize,
    exists_calls: AtomicUsize,
    failing_writes: AtomicUsize,
    denied: std::sync::RwLock<HashSet<PathBuf>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects.
    ///
    /// Panics if any key fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            root: None,
            storage: RwLock::new(map),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            exists_calls: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            denied: std::sync::RwLock::new(HashSet::new()),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pretend to be rooted somewhere, so two mocks sharing a name can still
    /// be told apart by [`identity`](StorageBackend::identity).
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// The next `n` calls to [`write`](StorageBackend::write) fail with a
    /// retryable network error before touching storage.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Every write to `key` fails with [`ErrorKind::PermissionDenied`].
    pub fn deny_writes_to(&self, key: impl AsRef<Path>) {
        let Ok(validated) = validate_path(key.as_ref()) else {
            panic!("MockBackend::deny_writes_to: invalid path {}", key.as_ref().display());
        };
        if let Ok(mut denied) = self.denied.write() {
            denied.insert(validated);
        }
    }

    /// Number of write calls, including ones that failed.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of read calls, including ones that failed.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of existence checks.
    pub fn exists_count(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    /// Every stored key, sorted.
    pub async fn keys(&self) -> Vec<PathBuf> {
        let mut keys: Vec<_> = self.storage.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn is_denied(&self, path: &Path) -> bool {
        self.denied.read().map(|denied| denied.contains(path)).unwrap_or(false)
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> String {
        format!("mock://{}", self.root.as_deref().unwrap_or(&self.name))
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot under the read lock, then drop it before yielding.
            let entries: Vec<ObjectInfo> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| match &validated_prefix {
                        Some(pfx) => path.starts_with(pfx),
                        None => true,
                    })
                    .map(|(path, (inserted, data))| ObjectInfo::new(path.clone(), data.len() as u64, *inserted))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let path = validate_path(path)?;
        let (_inserted, data) =
            self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(data)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let path = validate_path(path)?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok();
        if injected {
            exn::bail!(ErrorKind::Network(format!("injected failure writing {}", path.display())));
        }
        if self.is_denied(&path) {
            exn::bail!(ErrorKind::PermissionDenied(path));
        }
        self.storage.write().await.insert(path, (UtcDateTime::now(), data.to_vec()));
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn stat(&self, path: &Path) -> Result<ObjectInfo> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let (inserted, data) = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(ObjectInfo::new(path.clone(), data.len() as u64, *inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let backend = MockBackend::default();
        backend.write(Path::new("Data/abc.xxh128"), b"hello").await.unwrap();
        assert_eq!(backend.read(Path::new("Data/abc.xxh128")).await.unwrap(), b"hello");
        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.read_count(), 1);
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read(Path::new("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MockBackend::with_files([("file", Vec::from(*b"data"))]);
        backend.delete(Path::new("file")).await.unwrap();
        assert!(!backend.exists(Path::new("file")).await.unwrap());
        let err = backend.delete(Path::new("file")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat() {
        let backend = MockBackend::default();
        backend.write(Path::new("Data/abc.xxh128"), b"12345").await.unwrap();
        let info = backend.stat(Path::new("Data/abc.xxh128")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("Data/abc.xxh128"));
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MockBackend::with_files([
            ("Root/Data/a.xxh128", Vec::from(*b"a")),
            ("Root/Data/b.xxh128", Vec::from(*b"b")),
            ("Root/Manifests/m_input", Vec::from(*b"c")),
        ]);
        let files = backend.list(Some(Path::new("Root/Data"))).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let backend = MockBackend::default();
        backend.fail_next_writes(2);
        for _ in 0..2 {
            let err = backend.write(Path::new("k"), b"v").await.unwrap_err();
            assert!(err.is_retryable());
        }
        backend.write(Path::new("k"), b"v").await.unwrap();
        assert_eq!(backend.write_count(), 3);
        assert_eq!(backend.keys().await, vec![PathBuf::from("k")]);
    }

    #[tokio::test]
    async fn test_denied_writes_are_permanent() {
        let backend = MockBackend::default();
        backend.deny_writes_to("Root/Data/bad.xxh128");
        for _ in 0..3 {
            let err = backend.write(Path::new("Root/Data/bad.xxh128"), b"v").await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::PermissionDenied(_)));
        }
        backend.write(Path::new("Root/Data/good.xxh128"), b"v").await.unwrap();
    }

    #[test]
    fn test_identity() {
        assert_eq!(MockBackend::default().identity(), "mock://mock");
        let a = MockBackend::default().with_name("farm").with_root("bucket-a");
        let b = MockBackend::default().with_name("farm").with_root("bucket-b");
        assert_ne!(a.identity(), b.identity());
    }

    #[tokio::test]
    async fn test_default_streaming_goes_through_read_and_write() {
        let backend = MockBackend::default();
        let source: crate::backend::ByteReader = Box::pin(std::io::Cursor::new(b"hello".to_vec()));
        backend.write_stream(Path::new("k"), source, 5).await.unwrap();
        assert_eq!(backend.write_count(), 1);
        let mut reader = backend.reader(Path::new("k")).await.unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut contents).await.unwrap();
        assert_eq!(contents, b"hello");
        assert_eq!(backend.read_count(), 1);

        let short: crate::backend::ByteReader = Box::pin(std::io::Cursor::new(b"hi".to_vec()));
        assert!(backend.write_stream(Path::new("j"), short, 5).await.is_err());
        assert_eq!(backend.keys().await, vec![PathBuf::from("k")]);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let backend = MockBackend::default();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../escape"), b"bad").await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
