//! Materializing a manifest into a local directory.
//!
//! Eager downloads fetch every blob, write it under the target directory,
//! restore its mtime and lock it down with the context's
//! [`PermissionSetter`](crate::permissions::PermissionSetter). Lazy downloads
//! hand the manifest to a [`VirtualMount`] and fetch nothing themselves.

use crate::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::permissions::PermissionSetter;
use crate::progress::{SummaryStatistics, TransferFailure};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use jattach_manifest::{HashAlgorithm, Manifest, ManifestPath};
use jattach_storage::BackendHandle;
use jattach_storage::error::ErrorKind as StorageErrorKind;
use jattach_storage::ByteReader;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

/// Downloads land here first and are renamed into place once complete.
const PARTIAL_SUFFIX: &str = ".partial";

/// What to do when a file about to be downloaded already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the local file.
    Skip,
    #[default]
    Overwrite,
    /// Download next to it as `name (1).ext`, `name (2).ext`, ...
    CreateCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub conflict: ConflictResolution,
    /// Refuse to start when the target volume cannot hold the manifest.
    pub check_disk_capacity: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            conflict: ConflictResolution::default(),
            check_disk_capacity: true,
        }
    }
}

/// Something that can present a manifest as a directory without
/// downloading it up front (a FUSE or ProjFS mount, for example).
#[async_trait]
pub trait VirtualMount: std::fmt::Debug + Send + Sync {
    async fn mount(&self, manifest: &Manifest, target: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum DownloadMode {
    Eager,
    Lazy(Arc<dyn VirtualMount>),
}

/// Progress events emitted by [`download_stream`].
#[derive(Debug)]
pub enum DownloadEvent {
    Started { files: u64, bytes: u64 },
    Downloaded { path: PathBuf, bytes: u64 },
    /// The file existed and [`ConflictResolution::Skip`] kept it.
    Skipped { path: PathBuf, bytes: u64 },
    Failed { failure: TransferFailure, bytes: u64 },
    /// The manifest was handed to the virtual mount.
    Mounted,
    Complete,
}

/// The result of [`download`].
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Local paths written, which differ from the manifest path for
    /// [`ConflictResolution::CreateCopy`].
    pub downloaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<TransferFailure>,
    pub mounted: bool,
    pub stats: SummaryStatistics,
}

/// Join a manifest path onto `root` without letting it climb out.
pub(crate) fn resolve_within(root: &Path, path: &str) -> Result<PathBuf> {
    let outside = || {
        Error::from(ErrorKind::PathOutsideDirectory {
            path: path.to_string(),
            root: root.to_path_buf(),
        })
    };
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            },
            Component::CurDir => {},
            Component::ParentDir if depth > 0 => {
                resolved.pop();
                depth -= 1;
            },
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(outside()),
        }
    }
    if depth == 0 {
        return Err(outside());
    }
    Ok(resolved)
}

/// Every manifest path must land strictly inside `root`.
fn ensure_paths_within(root: &Path, manifest: &Manifest) -> Result<()> {
    for entry in manifest.paths() {
        resolve_within(root, &entry.path)?;
    }
    Ok(())
}

fn from_micros(micros: i64) -> SystemTime {
    let offset = Duration::from_micros(micros.unsigned_abs());
    if micros >= 0 { UNIX_EPOCH + offset } else { UNIX_EPOCH - offset }
}

/// Whether anything sits at `path`. A dangling symlink counts.
fn occupied(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Create a new file at `path`, owner-only from the start. Fails if
/// anything, a symlink included, is already there.
fn create_exclusive(path: &Path) -> std::io::Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600).custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
    }
    options.open(path)
}

/// `shot.exr` -> `shot (1).exr`, `shot (2).exr`, ... Claims the first free
/// name by creating it, so concurrent downloads never pick the same copy.
fn claim_copy(path: &Path) -> Result<PathBuf> {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    let mut counter = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{stem} ({counter}){extension}"));
        match create_exclusive(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io(candidate)),
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut partial = destination.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    PathBuf::from(partial)
}

#[cfg(unix)]
fn available_space(target: &Path) -> Result<Option<u64>> {
    let Some(existing) = target.ancestors().find(|p| p.exists()) else {
        return Ok(None);
    };
    let stats = nix::sys::statvfs::statvfs(existing).or_raise(|| ErrorKind::Io(existing.to_path_buf()))?;
    #[allow(clippy::unnecessary_cast)]
    Ok(Some(stats.blocks_available() as u64 * stats.fragment_size() as u64))
}

#[cfg(not(unix))]
fn available_space(_target: &Path) -> Result<Option<u64>> {
    Ok(None)
}

fn check_disk_capacity(target: &Path, required: u64) -> Result<()> {
    match available_space(target)? {
        Some(available) if available < required => {
            exn::bail!(ErrorKind::InsufficientDiskSpace { required, available })
        },
        Some(_) => Ok(()),
        None => {
            tracing::debug!(target = %target.display(), "disk capacity unknown; not checking");
            Ok(())
        },
    }
}

/// Create each missing directory between `root` and `dir`, applying the
/// directory permission policy to the ones this call created.
fn create_dirs(root: &Path, dir: &Path, permissions: &dyn PermissionSetter) -> Result<()> {
    let Ok(relative) = dir.strip_prefix(root) else {
        exn::bail!(ErrorKind::Io(dir.to_path_buf()));
    };
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match std::fs::create_dir(&current) {
            Ok(()) => permissions.apply_to_dir(&current)?,
            // Concurrent downloads race to create shared parents.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io(current.clone())),
        }
    }
    Ok(())
}

/// An open `.partial` file waiting for its content.
struct Target {
    destination: PathBuf,
    partial: PathBuf,
    file: File,
    /// A [`ConflictResolution::CreateCopy`] name was reserved for it.
    claimed: bool,
}

/// Decide where `destination` is written and open its partial file, or
/// return `None` when the existing file is kept. Blocking.
fn prepare(
    root: &Path,
    destination: PathBuf,
    conflict: ConflictResolution,
    permissions: &dyn PermissionSetter,
) -> Result<Option<Target>> {
    let parent = destination.parent().unwrap_or(root).to_path_buf();
    create_dirs(root, &parent, permissions)?;
    // The manifest path was checked lexically up front; this catches a parent
    // that became a symlink since.
    let real_parent = std::fs::canonicalize(&parent).or_raise(|| ErrorKind::Io(parent.clone()))?;
    if !real_parent.starts_with(root) {
        exn::bail!(ErrorKind::PathOutsideDirectory {
            path: destination.display().to_string(),
            root: root.to_path_buf(),
        });
    }
    let (destination, claimed) = match (occupied(&destination), conflict) {
        (true, ConflictResolution::Skip) => return Ok(None),
        (true, ConflictResolution::CreateCopy) => (claim_copy(&destination)?, true),
        // Renaming over a symlink replaces the link, never its target.
        (true, ConflictResolution::Overwrite) | (false, _) => (destination, false),
    };
    let partial = partial_path(&destination);
    // Left over from an interrupted run. A symlink here is unlinked, not followed.
    match std::fs::remove_file(&partial) {
        Ok(()) => tracing::debug!(partial = %partial.display(), "removed stale partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e).or_raise(|| ErrorKind::Io(partial.clone())),
    }
    let file = create_exclusive(&partial).or_raise(|| ErrorKind::Io(partial.clone()))?;
    Ok(Some(Target {
        destination,
        partial,
        file,
        claimed,
    }))
}

/// Stamp the mtime, apply permissions and move the partial file into place.
/// Blocking.
fn finish(file: File, partial: &Path, destination: &Path, mtime: i64, permissions: &dyn PermissionSetter) -> Result<()> {
    let io_error = || ErrorKind::Io(destination.to_path_buf());
    file.set_modified(from_micros(mtime)).or_raise(io_error)?;
    drop(file);
    permissions.apply_to_file(partial)?;
    std::fs::rename(partial, destination).or_raise(io_error)
}

/// Stream `source` into the target's partial file chunk by chunk, then put
/// it in place.
async fn write_target(
    file: File,
    partial: &Path,
    destination: &Path,
    mut source: ByteReader,
    entry: &ManifestPath,
    permissions: Arc<dyn PermissionSetter>,
) -> Result<()> {
    let io_error = || ErrorKind::Io(destination.to_path_buf());
    let mut file = tokio::fs::File::from_std(file);
    let copied = tokio::io::copy(&mut source, &mut file).await.or_raise(io_error)?;
    if copied != entry.size {
        exn::bail!(ErrorKind::Validation(format!(
            "{}: blob holds {copied} bytes, manifest says {}",
            entry.path, entry.size
        )));
    }
    file.flush().await.or_raise(io_error)?;
    let file = file.into_std().await;
    let (owned_partial, owned_destination, mtime) = (partial.to_path_buf(), destination.to_path_buf(), entry.mtime);
    tokio::task::spawn_blocking(move || finish(file, &owned_partial, &owned_destination, mtime, permissions.as_ref()))
        .await
        .or_raise(io_error)?
}

/// Fetch a blob, falling back to the extension-less key older uploads used.
async fn fetch(backend: &BackendHandle, ctx: &Context, entry: &ManifestPath, alg: HashAlgorithm) -> Result<ByteReader> {
    let retry = &ctx.settings.retry;
    let key = ctx.layout.data_key(&entry.hash, alg);
    match retry.run(&key, || backend.reader(Path::new(&key))).await {
        Ok(reader) => Ok(reader),
        Err(e) if matches!(&*e, StorageErrorKind::NotFound(_)) => {
            let legacy = ctx.layout.legacy_data_key(&entry.hash);
            tracing::debug!(key, legacy, "blob missing; trying legacy key");
            retry.run(&legacy, || backend.reader(Path::new(&legacy))).await.or_raise(|| ErrorKind::Storage)
        },
        Err(e) => Err(e).or_raise(|| ErrorKind::Storage),
    }
}

enum Outcome {
    Written(PathBuf),
    Kept(PathBuf),
}

async fn download_file_inner(
    backend: &BackendHandle,
    ctx: &Context,
    root: &Path,
    entry: &ManifestPath,
    alg: HashAlgorithm,
    options: DownloadOptions,
) -> Result<Outcome> {
    let destination = resolve_within(root, &entry.path)?;
    let prepared = {
        let (owned_root, owned_destination, permissions) =
            (root.to_path_buf(), destination.clone(), Arc::clone(&ctx.permissions));
        tokio::task::spawn_blocking(move || {
            prepare(&owned_root, owned_destination, options.conflict, permissions.as_ref())
        })
        .await
        .or_raise(|| ErrorKind::Io(destination.clone()))??
    };
    let Some(Target {
        destination,
        partial,
        file,
        claimed,
    }) = prepared
    else {
        return Ok(Outcome::Kept(destination));
    };

    let written = match fetch(backend, ctx, entry, alg).await {
        Ok(source) => write_target(file, &partial, &destination, source, entry, Arc::clone(&ctx.permissions)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&partial).await;
        if claimed {
            let _ = tokio::fs::remove_file(&destination).await;
        }
        return Err(e);
    }
    Ok(Outcome::Written(destination))
}

async fn download_file(
    backend: &BackendHandle,
    ctx: &Context,
    root: &Path,
    entry: &ManifestPath,
    alg: HashAlgorithm,
    options: DownloadOptions,
) -> DownloadEvent {
    match download_file_inner(backend, ctx, root, entry, alg, options).await {
        Ok(Outcome::Written(path)) => DownloadEvent::Downloaded { path, bytes: entry.size },
        Ok(Outcome::Kept(path)) => DownloadEvent::Skipped { path, bytes: entry.size },
        Err(error) => {
            tracing::warn!(path = %entry.path, error = ?error, "download failed");
            DownloadEvent::Failed {
                failure: TransferFailure {
                    path: entry.path.clone(),
                    key: ctx.layout.data_key(&entry.hash, alg),
                    error,
                },
                bytes: entry.size,
            }
        },
    }
}

/// Streams [`DownloadEvent`]s while materializing `manifest` under
/// `target_dir`.
///
/// Every path is checked to stay inside `target_dir` before anything is
/// fetched. After cancellation the directory may be partially written and
/// must not be trusted.
pub fn download_stream<'a>(
    backend: &'a BackendHandle,
    ctx: &'a Context,
    manifest: &'a Manifest,
    target_dir: &'a Path,
    mode: DownloadMode,
    options: DownloadOptions,
) -> impl Stream<Item = Result<DownloadEvent>> + 'a {
    stream!({
        if !target_dir.is_absolute() {
            yield Err(Error::from(ErrorKind::Validation(format!("{} is not absolute", target_dir.display()))));
            return;
        }
        if let Err(e) = ensure_paths_within(target_dir, manifest) {
            yield Err(e);
            return;
        }
        yield Ok(DownloadEvent::Started {
            files: manifest.len() as u64,
            bytes: manifest.total_size(),
        });
        if let DownloadMode::Lazy(mount) = mode {
            match mount.mount(manifest, target_dir).await {
                Ok(()) => {
                    yield Ok(DownloadEvent::Mounted);
                    yield Ok(DownloadEvent::Complete);
                },
                Err(e) => yield Err(e),
            }
            return;
        }
        if options.check_disk_capacity {
            if let Err(e) = check_disk_capacity(target_dir, manifest.total_size()) {
                yield Err(e);
                return;
            }
        }
        let root = match std::fs::create_dir_all(target_dir)
            .and_then(|()| std::fs::canonicalize(target_dir))
            .or_raise(|| ErrorKind::Io(target_dir.to_path_buf()))
        {
            Ok(root) => root,
            Err(e) => {
                yield Err(e);
                return;
            },
        };

        let alg = manifest.hash_alg();
        let mut queue = manifest.paths().iter().map(|entry| download_file(backend, ctx, &root, entry, alg, options));
        let mut processing = FuturesUnordered::new();
        if !ctx.is_cancelled() {
            processing.extend(queue.by_ref().take(ctx.settings.download_concurrency.max(1)));
        }
        while let Some(event) = processing.next().await {
            yield Ok(event);
            if !ctx.is_cancelled() {
                processing.extend(queue.next());
            }
        }
        if ctx.is_cancelled() {
            yield Err(Error::from(ErrorKind::Cancelled));
            return;
        }
        yield Ok(DownloadEvent::Complete);
    })
}

/// Materialize `manifest` under `target_dir`, collecting the outcome.
///
/// # Errors
/// [`ErrorKind::Validation`] for a relative target,
/// [`ErrorKind::PathOutsideDirectory`], [`ErrorKind::InsufficientDiskSpace`],
/// [`ErrorKind::Cancelled`], or the mount's own error in lazy mode. Individual
/// file failures end up in [`DownloadReport::failed`].
pub async fn download(
    backend: &BackendHandle,
    ctx: &Context,
    manifest: &Manifest,
    target_dir: &Path,
    mode: DownloadMode,
    options: DownloadOptions,
) -> Result<DownloadReport> {
    let started = Instant::now();
    let mut report = DownloadReport::default();
    let events = download_stream(backend, ctx, manifest, target_dir, mode, options);
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event? {
            DownloadEvent::Downloaded { path, bytes } => {
                report.stats.processed(bytes);
                report.downloaded.push(path);
            },
            DownloadEvent::Skipped { path, bytes } => {
                report.stats.skipped(bytes);
                report.skipped.push(path);
            },
            DownloadEvent::Failed { failure, bytes } => {
                report.stats.failed(bytes);
                report.failed.push(failure);
            },
            DownloadEvent::Mounted => report.mounted = true,
            DownloadEvent::Started { .. } | DownloadEvent::Complete => {},
        }
    }
    report.stats.total_time = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Unchanged;
    use crate::{Layout, RetryPolicy, TransferSettings};
    use jattach_storage::backend::MockBackend;
    use rstest::rstest;
    use std::sync::Mutex;

    const MTIME: i64 = 1_700_000_000_123_456;

    fn ctx() -> Context {
        let settings = TransferSettings {
            retry: RetryPolicy::none(),
            ..TransferSettings::default()
        };
        Context::new(Layout::new("Root")).with_settings(settings).with_permissions(Arc::new(Unchanged))
    }

    fn entry(path: &str, contents: &str) -> ManifestPath {
        let hash = HashAlgorithm::Xxh128.hash_bytes(contents.as_bytes());
        ManifestPath::new(path, hash, contents.len() as u64, MTIME)
    }

    fn fixture(files: &[(&str, &str)]) -> (BackendHandle, Manifest) {
        let layout = Layout::new("Root");
        let entries: Vec<_> = files.iter().map(|(path, contents)| entry(path, contents)).collect();
        let blobs: Vec<_> = files
            .iter()
            .zip(&entries)
            .map(|((_, contents), e)| (layout.data_key(&e.hash, HashAlgorithm::Xxh128), contents.to_string()))
            .collect();
        let backend: BackendHandle = Arc::new(MockBackend::with_files(blobs));
        (backend, Manifest::new(HashAlgorithm::Xxh128, entries))
    }

    fn options(conflict: ConflictResolution) -> DownloadOptions {
        DownloadOptions {
            conflict,
            check_disk_capacity: false,
        }
    }

    #[tokio::test]
    async fn test_eager_download_restores_content_and_mtime() {
        let (backend, manifest) = fixture(&[("a.txt", "hello"), ("renders/b.exr", "pixels")]);
        let dir = tempfile::tempdir().unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(report.downloaded.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(std::fs::read_to_string(dir.path().join("renders/b.exr")).unwrap(), "pixels");
        let modified = std::fs::metadata(dir.path().join("a.txt")).unwrap().modified().unwrap();
        assert_eq!(crate::hash::micros(modified), MTIME);
        assert_eq!(report.stats.processed_bytes, 11);
    }

    #[rstest]
    #[case("../escape.txt")]
    #[case("a/../../escape.txt")]
    #[case("/etc/passwd")]
    #[case(".")]
    fn test_resolve_within_rejects(#[case] path: &str) {
        let err = resolve_within(Path::new("/jobs/session"), path).unwrap_err();
        assert!(matches!(&*err, ErrorKind::PathOutsideDirectory { .. }));
    }

    #[test]
    fn test_resolve_within_normalizes() {
        assert_eq!(resolve_within(Path::new("/jobs/s"), "a/./b/../c.txt").unwrap(), Path::new("/jobs/s/a/c.txt"));
    }

    #[tokio::test]
    async fn test_escaping_path_fails_before_fetching() {
        let (backend, _) = fixture(&[("a.txt", "hello")]);
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [entry("a.txt", "hello"), entry("../evil.txt", "hello")]);
        let dir = tempfile::tempdir().unwrap();
        let err = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::PathOutsideDirectory { .. }));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_relative_target_is_rejected() {
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let err = download(&backend, &ctx(), &manifest, Path::new("relative"), DownloadMode::Eager, DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }

    #[rstest]
    #[case(ConflictResolution::Skip, "local", None)]
    #[case(ConflictResolution::Overwrite, "hello", None)]
    #[case(ConflictResolution::CreateCopy, "local", Some("a (1).txt"))]
    #[tokio::test]
    async fn test_conflicts(#[case] conflict: ConflictResolution, #[case] original: &str, #[case] copy: Option<&str>) {
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "local").unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(conflict))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), original);
        if let Some(copy) = copy {
            assert_eq!(std::fs::read_to_string(dir.path().join(copy)).unwrap(), "hello");
        }
        assert_eq!(report.skipped.len(), usize::from(conflict == ConflictResolution::Skip));
    }

    #[test]
    fn test_claim_copy_reserves_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.exr");
        std::fs::write(&path, "0").unwrap();
        std::fs::write(dir.path().join("shot (1).exr"), "1").unwrap();
        let first = claim_copy(&path).unwrap();
        assert_eq!(first, dir.path().join("shot (2).exr"));
        assert!(first.exists());
        // A second download racing for a copy gets the next name.
        assert_eq!(claim_copy(&path).unwrap(), dir.path().join("shot (3).exr"));
    }

    #[tokio::test]
    async fn test_concurrent_copies_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.exr");
        std::fs::write(&path, "0").unwrap();
        let claims: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                tokio::task::spawn_blocking(move || claim_copy(&path).unwrap())
            })
            .collect();
        let mut names = Vec::new();
        for claim in claims {
            names.push(claim.await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn test_short_blob_leaves_no_file_behind() {
        let hash = HashAlgorithm::Xxh128.hash_bytes(b"hello");
        let key = Layout::new("Root").data_key(&hash, HashAlgorithm::Xxh128);
        let backend: BackendHandle = Arc::new(MockBackend::with_files([(key, "hel")]));
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [ManifestPath::new("a.txt", hash, 5, MTIME)]);
        let dir = tempfile::tempdir().unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(ConflictResolution::Overwrite))
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(&*report.failed[0].error, ErrorKind::Validation(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_copy_releases_its_name() {
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [entry("a.txt", "gone")]);
        let backend: BackendHandle = Arc::new(MockBackend::default());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "local").unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(ConflictResolution::CreateCopy))
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(!dir.path().join("a (1).txt").exists());
        assert!(!dir.path().join("a (1).txt.partial").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "local");
    }

    #[cfg(unix)]
    #[rstest]
    #[case(ConflictResolution::Overwrite, "a.txt")]
    #[case(ConflictResolution::CreateCopy, "a (1).txt")]
    #[tokio::test]
    async fn test_symlinked_destination_never_writes_through(
        #[case] conflict: ConflictResolution,
        #[case] written: &str,
    ) {
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, "precious").unwrap();
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("a.txt")).unwrap();

        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(conflict))
            .await
            .unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
        let written = dir.path().join(written);
        assert!(std::fs::symlink_metadata(&written).unwrap().file_type().is_file());
        assert_eq!(std::fs::read_to_string(&written).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dangling_symlink_counts_as_existing() {
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("a.txt")).unwrap();

        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(ConflictResolution::Skip))
            .await
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(!victim.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_partial_symlink_is_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, "precious").unwrap();
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("a.txt.partial")).unwrap();

        download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(ConflictResolution::Overwrite))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
        assert!(!dir.path().join("a.txt.partial").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_files_are_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        // `Unchanged` applies nothing afterwards; the mode comes from creation.
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let dir = tempfile::tempdir().unwrap();
        download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, DownloadOptions::default())
            .await
            .unwrap();
        let mode = std::fs::metadata(dir.path().join("a.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_legacy_key_fallback() {
        let hash = HashAlgorithm::Xxh128.hash_bytes(b"old");
        let backend: BackendHandle = Arc::new(MockBackend::with_files([(format!("Root/Data/{hash}"), "old")]));
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [ManifestPath::new("old.txt", hash, 3, MTIME)]);
        let dir = tempfile::tempdir().unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(ConflictResolution::Overwrite))
            .await
            .unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(std::fs::read_to_string(dir.path().join("old.txt")).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_missing_blob_is_a_per_file_failure() {
        let (backend, _) = fixture(&[("a.txt", "hello")]);
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [entry("a.txt", "hello"), entry("b.txt", "gone")]);
        let dir = tempfile::tempdir().unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Eager, options(ConflictResolution::Overwrite))
            .await
            .unwrap();
        assert_eq!(report.downloaded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "b.txt");
        assert!(matches!(&*report.failed[0].error, ErrorKind::Storage));
    }

    #[derive(Debug, Default)]
    struct RecordingMount {
        mounted: Mutex<Vec<(usize, PathBuf)>>,
    }

    #[async_trait]
    impl VirtualMount for RecordingMount {
        async fn mount(&self, manifest: &Manifest, target: &Path) -> Result<()> {
            if let Ok(mut mounted) = self.mounted.lock() {
                mounted.push((manifest.len(), target.to_path_buf()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lazy_mode_fetches_nothing() {
        let mock = Arc::new(MockBackend::default());
        let backend: BackendHandle = mock.clone();
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [entry("a.txt", "hello")]);
        let mount = Arc::new(RecordingMount::default());
        let dir = tempfile::tempdir().unwrap();
        let report = download(&backend, &ctx(), &manifest, dir.path(), DownloadMode::Lazy(mount.clone()), DownloadOptions::default())
            .await
            .unwrap();
        assert!(report.mounted);
        assert_eq!(mock.read_count(), 0);
        assert_eq!(*mount.mounted.lock().unwrap(), [(1, dir.path().to_path_buf())]);
    }

    #[tokio::test]
    async fn test_cancelled_download() {
        let (backend, manifest) = fixture(&[("a.txt", "hello")]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let dir = tempfile::tempdir().unwrap();
        let err = download(&backend, &ctx, &manifest, dir.path(), DownloadMode::Eager, DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));
    }

    #[test]
    fn test_disk_capacity() {
        let dir = tempfile::tempdir().unwrap();
        check_disk_capacity(dir.path(), 1).unwrap();
        if cfg!(unix) {
            let err = check_disk_capacity(&dir.path().join("not/yet/created"), u64::MAX).unwrap_err();
            assert!(matches!(&*err, ErrorKind::InsufficientDiskSpace { .. }));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use crate::permissions::PosixPermissions;
        use std::os::unix::fs::PermissionsExt;

        let (backend, manifest) = fixture(&[("sub/a.txt", "hello")]);
        let ctx = ctx().with_permissions(Arc::new(PosixPermissions::default()));
        let dir = tempfile::tempdir().unwrap();
        download(&backend, &ctx, &manifest, dir.path(), DownloadMode::Eager, DownloadOptions::default())
            .await
            .unwrap();
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&dir.path().join("sub/a.txt")), 0o600);
        assert_eq!(mode(&dir.path().join("sub")), 0o700);
    }
}
