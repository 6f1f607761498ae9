//! Building a manifest from a directory tree.

use crate::Context;
use crate::error::{ErrorKind, Result};
use crate::progress::SummaryStatistics;
use exn::ResultExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use jattach_cache::HashEffort;
use jattach_manifest::{GlobFilter, Manifest, ManifestPath};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

/// A manifest of a directory plus what it cost to build.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub manifest: Manifest,
    /// Hashed files count as processed, cache hits as skipped.
    pub stats: SummaryStatistics,
}

/// A file selected for the manifest, not yet hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    /// Root-relative, `/`-separated.
    pub relative: String,
    pub absolute: PathBuf,
}

/// Turn a root-relative path into its manifest form.
pub(crate) fn manifest_path_of(relative: &Path) -> Result<String> {
    jattach_storage::key_of(relative)
        .or_raise(|| ErrorKind::Validation(format!("unusable path {}", relative.display())))
}

/// What [`discover`] does with a symlink that resolves outside the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escapes {
    Fail,
    Skip,
}

/// Walk `dir` and collect every file the filter accepts, with paths relative
/// to `root` (which must contain `dir`). Blocking.
///
/// Directory symlinks are never descended into. A file symlink is kept only
/// if it resolves inside `root`.
pub(crate) fn discover(dir: &Path, root: &Path, globs: &GlobFilter, escapes: Escapes) -> Result<Vec<Candidate>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.or_raise(|| ErrorKind::Io(dir.to_path_buf()))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            let target = match std::fs::canonicalize(entry.path()) {
                Ok(target) => target,
                Err(error) => {
                    tracing::debug!(path = %entry.path().display(), %error, "skipping dangling symlink");
                    continue;
                },
            };
            if !target.starts_with(root) && escapes == Escapes::Skip {
                tracing::info!(path = %entry.path().display(), "skipping symlink that resolves outside the root");
                continue;
            }
            if !target.starts_with(root) {
                exn::bail!(ErrorKind::Validation(format!(
                    "symlink {} resolves outside of {}",
                    entry.path().display(),
                    root.display()
                )));
            }
            if target.is_dir() {
                tracing::debug!(path = %entry.path().display(), "skipping directory symlink");
                continue;
            }
        } else if !file_type.is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).or_raise(|| ErrorKind::Io(entry.path().to_path_buf()))?;
        let relative = manifest_path_of(relative)?;
        if globs.matches(&relative) {
            found.push(Candidate {
                relative,
                absolute: entry.into_path(),
            });
        }
    }
    Ok(found)
}

/// Hash `candidates` concurrently (through the hash cache) into manifest
/// entries. Stops scheduling and fails with [`ErrorKind::Cancelled`] when the
/// context is cancelled.
pub(crate) async fn digest_all(
    ctx: &Context,
    root: &Path,
    candidates: Vec<Candidate>,
) -> Result<(Vec<ManifestPath>, SummaryStatistics)> {
    let hasher = ctx.hasher();
    let limit = ctx.settings.hash_concurrency.max(1);
    let mut stats = SummaryStatistics::default();
    let mut entries = Vec::with_capacity(candidates.len());

    let mut pending = candidates.into_iter().map(|candidate| {
        let hasher = &hasher;
        async move {
            let digested = hasher.digest(&candidate.absolute, Some(root)).await;
            (candidate, digested)
        }
    });
    let mut processing = FuturesUnordered::new();
    processing.extend(pending.by_ref().take(limit));
    while let Some((candidate, digested)) = processing.next().await {
        let digested = digested.or_raise(|| ErrorKind::Hash)?;
        match digested.effort {
            HashEffort::Computed => stats.processed(digested.digest.size),
            HashEffort::Cached => stats.skipped(digested.digest.size),
        }
        tracing::trace!(path = %candidate.relative, hash = %digested.digest.hash, "hashed");
        entries.push(ManifestPath::new(
            candidate.relative,
            digested.digest.hash,
            digested.digest.size,
            digested.digest.mtime,
        ));
        if ctx.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        processing.extend(pending.next());
    }
    Ok((entries, stats))
}

/// Build the manifest of every file under `root` that `globs` accepts.
pub async fn snapshot(ctx: &Context, root: &Path, globs: &GlobFilter) -> Result<Snapshot> {
    let started = Instant::now();
    if !root.is_dir() {
        exn::bail!(ErrorKind::Validation(format!("{} is not a directory", root.display())));
    }
    let root = std::fs::canonicalize(root).or_raise(|| ErrorKind::Io(root.to_path_buf()))?;
    if ctx.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }

    let (walk_root, walk_globs) = (root.clone(), globs.clone());
    let candidates = tokio::task::spawn_blocking(move || discover(&walk_root, &walk_root, &walk_globs, Escapes::Fail))
        .await
        .or_raise(|| ErrorKind::Io(root.clone()))??;
    tracing::debug!(root = %root.display(), files = candidates.len(), "discovered files");

    let (entries, mut stats) = digest_all(ctx, &root, candidates).await?;
    stats.total_time = started.elapsed();
    let manifest = Manifest::new(ctx.settings.hash_alg, entries);
    tracing::info!(
        root = %root.display(),
        files = manifest.len(),
        bytes = manifest.total_size(),
        hashed = stats.processed_files,
        cached = stats.skipped_files,
        "snapshot complete"
    );
    Ok(Snapshot { manifest, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Layout;
    use jattach_cache::Database;
    use jattach_manifest::{HashAlgorithm, diff};

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        dir
    }

    fn ctx() -> Context {
        Context::new(Layout::new("Root"))
    }

    #[tokio::test]
    async fn test_two_identical_files() {
        let dir = tree(&[("a.txt", "hello"), ("b.txt", "hello")]);
        let snapshot = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap();
        let manifest = snapshot.manifest;
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.total_size(), 10);
        assert_eq!(manifest.paths()[0].path, "a.txt");
        assert_eq!(manifest.paths()[1].path, "b.txt");
        assert_eq!(manifest.paths()[0].hash, manifest.paths()[1].hash);
        assert_eq!(manifest.paths()[0].hash, HashAlgorithm::Xxh128.hash_bytes(b"hello"));
        assert_eq!(snapshot.stats.processed_files, 2);
    }

    #[tokio::test]
    async fn test_nested_paths_are_posix() {
        let dir = tree(&[("renders/shot_01/frame.exr", "pixels")]);
        let snapshot = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap();
        assert_eq!(snapshot.manifest.paths()[0].path, "renders/shot_01/frame.exr");
    }

    #[tokio::test]
    async fn test_globs_filter() {
        let dir = tree(&[("a.txt", "a"), ("b.txt", "b"), ("c.dat", "c")]);
        let globs = GlobFilter::new(&["*.txt"], &["b.*"]).unwrap();
        let snapshot = snapshot(&ctx(), dir.path(), &globs).await.unwrap();
        let paths: Vec<_> = snapshot.manifest.paths().iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, ["a.txt"]);
    }

    #[tokio::test]
    async fn test_unchanged_tree_diffs_empty() {
        let db = Database::connect_in_memory().await.unwrap();
        let ctx = ctx().with_caches(&db);
        let dir = tree(&[("a.txt", "hello"), ("sub/b.txt", "world")]);
        let first = snapshot(&ctx, dir.path(), &GlobFilter::all()).await.unwrap();
        let second = snapshot(&ctx, dir.path(), &GlobFilter::all()).await.unwrap();
        assert!(diff(&first.manifest, &second.manifest).is_empty());
        assert_eq!(second.stats.skipped_files, 2);
        assert_eq!(second.stats.processed_files, 0);
    }

    #[tokio::test]
    async fn test_modified_file_shows_in_diff() {
        let dir = tree(&[("a.txt", "hello"), ("b.txt", "hello")]);
        let before = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap().manifest;
        std::fs::write(dir.path().join("b.txt"), "world").unwrap();
        let after = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap().manifest;
        let changed = diff(&before, &after);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed.paths()[0].path, "b.txt");
        assert_eq!(changed.paths()[0].hash, HashAlgorithm::Xxh128.hash_bytes(b"world"));
    }

    #[tokio::test]
    async fn test_root_must_be_directory() {
        let dir = tree(&[("a.txt", "hello")]);
        for root in [dir.path().join("a.txt"), dir.path().join("missing")] {
            let err = snapshot(&ctx(), &root, &GlobFilter::all()).await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap();
        assert!(snapshot.manifest.is_empty());
        assert_eq!(snapshot.manifest.total_size(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tree(&[("a.txt", "hello")]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = snapshot(&ctx, dir.path(), &GlobFilter::all()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_escaping_symlink_fails() {
        let outside = tree(&[("secret.txt", "secret")]);
        let dir = tree(&[("a.txt", "hello")]);
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt")).unwrap();
        let err = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_internal_symlinks() {
        let dir = tree(&[("real/a.txt", "hello")]);
        std::os::unix::fs::symlink(dir.path().join("real/a.txt"), dir.path().join("alias.txt")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("linked_dir")).unwrap();
        let snapshot = snapshot(&ctx(), dir.path(), &GlobFilter::all()).await.unwrap();
        let paths: Vec<_> = snapshot.manifest.paths().iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, ["alias.txt", "real/a.txt"]);
    }
}
