//! Capturing the files a job produced.
//!
//! Output directories are re-walked after the job ran. A file whose mtime
//! still matches the baseline (the input manifest, usually) is assumed
//! untouched and never read; everything else is hashed, and only files whose
//! content actually differs from the baseline make it into the capture.

use crate::Context;
use crate::error::{ErrorKind, Result};
use crate::hash::micros;
use crate::progress::SummaryStatistics;
use crate::snapshot::{Candidate, Escapes, digest_all, discover};
use crate::upload::{UploadReport, upload};
use exn::ResultExt;
use jattach_manifest::{GlobFilter, Manifest};
use jattach_storage::BackendHandle;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// The changed outputs, as a manifest relative to the asset root.
#[derive(Debug, Clone)]
pub struct Capture {
    pub manifest: Manifest,
    pub stats: SummaryStatistics,
}

/// Files found in the output directories, split by the mtime pre-filter.
#[derive(Debug, Default)]
struct Scan {
    changed: Vec<Candidate>,
    /// Sizes of files skipped because their mtime matched the baseline.
    unchanged: Vec<u64>,
}

/// Canonical output directories inside `root`. Missing ones and ones that
/// resolve elsewhere are logged and left out.
fn output_dirs_within(root: &Path, output_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::with_capacity(output_dirs.len());
    for dir in output_dirs {
        let joined = root.join(dir);
        match std::fs::canonicalize(&joined) {
            Ok(resolved) if !resolved.is_dir() => {
                tracing::info!(dir = %joined.display(), "output path is not a directory; skipping");
            },
            Ok(resolved) if !resolved.starts_with(root) => {
                tracing::info!(dir = %joined.display(), root = %root.display(), "output directory outside the asset root; skipping");
            },
            Ok(resolved) => found.push(resolved),
            Err(error) => tracing::info!(dir = %joined.display(), %error, "output directory missing; skipping"),
        }
    }
    found
}

/// Walk the output directories and apply the mtime pre-filter. Blocking.
fn scan(root: &Path, output_dirs: &[PathBuf], baseline: Option<&Manifest>) -> Result<Scan> {
    let mut scan = Scan::default();
    for dir in output_dirs_within(root, output_dirs) {
        for candidate in discover(&dir, root, &GlobFilter::all(), Escapes::Skip)? {
            let previous = baseline.and_then(|b| b.get(&candidate.relative));
            let Some(previous) = previous else {
                scan.changed.push(candidate);
                continue;
            };
            let metadata =
                std::fs::metadata(&candidate.absolute).or_raise(|| ErrorKind::Io(candidate.absolute.clone()))?;
            let modified = metadata.modified().or_raise(|| ErrorKind::Io(candidate.absolute.clone()))?;
            if micros(modified) == previous.mtime {
                tracing::trace!(path = %candidate.relative, "mtime unchanged");
                scan.unchanged.push(metadata.len());
            } else {
                scan.changed.push(candidate);
            }
        }
    }
    Ok(scan)
}

/// Capture what changed under `output_dirs` (relative to `asset_root`)
/// compared to `baseline`. Without a baseline every file is captured.
pub async fn capture_outputs(
    ctx: &Context,
    asset_root: &Path,
    output_dirs: &[impl AsRef<Path>],
    baseline: Option<&Manifest>,
) -> Result<Capture> {
    let started = Instant::now();
    if output_dirs.is_empty() {
        return Ok(Capture {
            manifest: Manifest::empty(ctx.settings.hash_alg),
            stats: SummaryStatistics::default(),
        });
    }
    let root = std::fs::canonicalize(asset_root).or_raise(|| {
        ErrorKind::Validation(format!("asset root {} is not accessible", asset_root.display()))
    })?;
    if ctx.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }

    let dirs: Vec<PathBuf> = output_dirs.iter().map(|d| d.as_ref().to_path_buf()).collect();
    let (scan_root, scan_baseline) = (root.clone(), baseline.cloned());
    let found = tokio::task::spawn_blocking(move || scan(&scan_root, &dirs, scan_baseline.as_ref()))
        .await
        .or_raise(|| ErrorKind::Io(root.clone()))??;

    let (hashed, mut stats) = digest_all(ctx, &root, found.changed).await?;
    for size in found.unchanged {
        stats.skipped(size);
    }
    let mut entries = Vec::with_capacity(hashed.len());
    for entry in hashed {
        match baseline.and_then(|b| b.get(&entry.path)) {
            Some(previous) if previous.hash == entry.hash => {
                tracing::debug!(path = %entry.path, "touched but unchanged");
            },
            _ => entries.push(entry),
        }
    }
    stats.total_time = started.elapsed();
    let manifest = Manifest::new(ctx.settings.hash_alg, entries);
    tracing::info!(root = %root.display(), files = manifest.len(), bytes = manifest.total_size(), "captured outputs");
    Ok(Capture { manifest, stats })
}

/// [`capture_outputs`], then upload the capture to `manifest_key`. Returns
/// `None` when nothing changed, in which case nothing is written.
pub async fn sync_outputs(
    backend: &BackendHandle,
    ctx: &Context,
    asset_root: &Path,
    output_dirs: &[impl AsRef<Path>],
    baseline: Option<&Manifest>,
    manifest_key: &str,
) -> Result<Option<UploadReport>> {
    let capture = capture_outputs(ctx, asset_root, output_dirs, baseline).await?;
    if capture.manifest.is_empty() {
        tracing::info!(root = %asset_root.display(), "no outputs changed; nothing to upload");
        return Ok(None);
    }
    upload(backend, ctx, &capture.manifest, asset_root, manifest_key).await.map(Some)
}
