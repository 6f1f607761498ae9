//! Uploading a manifest's content and then the manifest itself.
//!
//! Every distinct hash is one blob at [`Layout::data_key`](crate::Layout::data_key).
//! A blob is only sent when neither the existence cache nor the store
//! already has it. The manifest document goes last: once it exists, every
//! blob it references must exist too.

use crate::error::{Error, ErrorKind, Result};
use crate::{CHUNK_SIZE, Context};
use crate::hash;
use crate::progress::{SummaryStatistics, TransferFailure};
use async_stream::stream;
use exn::ResultExt;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use jattach_manifest::Manifest;
use jattach_storage::BackendHandle;
use jattach_storage::error::ErrorKind as StorageErrorKind;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Why a blob was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The existence cache vouched for it; no remote call was made.
    Cached,
    /// The store reported it already present.
    AlreadyStored,
}

/// Progress events emitted by [`upload_stream`].
///
/// [`Started`](Self::Started) comes first, then one event per blob, then
/// either [`ManifestWritten`](Self::ManifestWritten) or
/// [`ManifestSkipped`](Self::ManifestSkipped), then
/// [`Complete`](Self::Complete). A fatal error ends the stream early.
#[derive(Debug)]
pub enum UploadEvent {
    Started { blobs: u64, bytes: u64 },
    Uploaded { key: String, bytes: u64 },
    Skipped { key: String, bytes: u64, reason: SkipReason },
    Failed { failure: TransferFailure, bytes: u64 },
    ManifestWritten(String),
    /// Some blobs failed, so the manifest was withheld.
    ManifestSkipped,
    Complete,
}

/// The result of [`upload`].
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Keys of blobs that were sent.
    pub uploaded: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub failed: Vec<TransferFailure>,
    /// Set only when the manifest document was stored.
    pub manifest_key: Option<String>,
    pub stats: SummaryStatistics,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.manifest_key.is_some()
    }
}

#[derive(Debug, Clone)]
struct Blob {
    key: String,
    size: u64,
    /// First manifest path carrying this hash.
    path: String,
    source: PathBuf,
}

/// One blob per distinct hash, in hash order.
fn blobs(ctx: &Context, manifest: &Manifest, root: &Path) -> Vec<Blob> {
    let mut by_hash: BTreeMap<&str, Blob> = BTreeMap::new();
    for entry in manifest.paths() {
        by_hash.entry(entry.hash.as_str()).or_insert_with(|| Blob {
            key: ctx.layout.data_key(&entry.hash, manifest.hash_alg()),
            size: entry.size,
            path: entry.path.clone(),
            source: root.join(&entry.path),
        });
    }
    by_hash.into_values().collect()
}

/// Entries are keyed on where the store lives, not on what it is called.
fn existence_key(backend: &BackendHandle, key: &str) -> String {
    format!("{}/{key}", backend.identity())
}

async fn upload_blob(backend: &BackendHandle, ctx: &Context, root: &Path, blob: Blob) -> UploadEvent {
    match upload_blob_inner(backend, ctx, root, &blob).await {
        Ok(Some(reason)) => UploadEvent::Skipped {
            key: blob.key,
            bytes: blob.size,
            reason,
        },
        Ok(None) => UploadEvent::Uploaded {
            key: blob.key,
            bytes: blob.size,
        },
        Err(error) => {
            tracing::warn!(key = %blob.key, path = %blob.path, error = ?error, "blob upload failed");
            UploadEvent::Failed {
                failure: TransferFailure {
                    path: blob.path,
                    key: blob.key,
                    error,
                },
                bytes: blob.size,
            }
        },
    }
}

/// `Ok(Some(_))` when the blob did not need sending, `Ok(None)` once sent.
async fn upload_blob_inner(
    backend: &BackendHandle,
    ctx: &Context,
    root: &Path,
    blob: &Blob,
) -> Result<Option<SkipReason>> {
    let seen_key = existence_key(backend, &blob.key);
    if let Some(existence) = &ctx.existence
        && existence.has_seen(&seen_key).await
    {
        return Ok(Some(SkipReason::Cached));
    }
    let key = Path::new(&blob.key);
    let retry = &ctx.settings.retry;
    let stored = retry.run(&blob.key, || backend.exists(key)).await.or_raise(|| ErrorKind::Storage)?;
    if !stored {
        let file = hash::open_blocking(&blob.source, Some(root)).await.or_raise(|| ErrorKind::Hash)?;
        let size = file.size();
        if size != blob.size {
            exn::bail!(ErrorKind::Validation(format!(
                "{} is {size} bytes, manifest says {}; changed since it was hashed?",
                blob.path, blob.size
            )));
        }
        if size > CHUNK_SIZE {
            let file = &file;
            retry
                .run(&blob.key, move || async move {
                    let source = file.rewound().map_err(StorageErrorKind::Io)?;
                    backend.write_stream(key, Box::pin(source), size).await
                })
                .await
                .or_raise(|| ErrorKind::Storage)?;
        } else {
            let bytes = hash::read_all(file).await.or_raise(|| ErrorKind::Hash)?;
            retry.run(&blob.key, || backend.write(key, &bytes)).await.or_raise(|| ErrorKind::Storage)?;
        }
        tracing::debug!(key = %blob.key, bytes = blob.size, "uploaded blob");
    }
    if let Some(existence) = &ctx.existence {
        existence.mark_seen(&seen_key).await;
    }
    Ok(stored.then_some(SkipReason::AlreadyStored))
}

/// Streams [`UploadEvent`]s while uploading the content of `manifest` (read
/// from under `source_root`) and then `manifest` itself to `manifest_key`.
///
/// Blobs up to the small file threshold run concurrently, larger ones one at
/// a time afterwards. A blob failure is reported and its siblings carry on;
/// failing to store the manifest is fatal.
pub fn upload_stream<'a>(
    backend: &'a BackendHandle,
    ctx: &'a Context,
    manifest: &'a Manifest,
    source_root: &'a Path,
    manifest_key: &'a str,
) -> impl Stream<Item = Result<UploadEvent>> + 'a {
    stream!({
        if !source_root.is_dir() {
            yield Err(Error::from(ErrorKind::Validation(format!("{} is not a directory", source_root.display()))));
            return;
        }
        let root = match std::fs::canonicalize(source_root).or_raise(|| ErrorKind::Io(source_root.to_path_buf())) {
            Ok(root) => root,
            Err(e) => {
                yield Err(e);
                return;
            },
        };
        let (small, large): (Vec<_>, Vec<_>) =
            blobs(ctx, manifest, &root).into_iter().partition(|blob| blob.size <= ctx.settings.small_file_threshold);
        let bytes: u64 = small.iter().chain(&large).map(|blob| blob.size).sum();
        yield Ok(UploadEvent::Started {
            blobs: (small.len() + large.len()) as u64,
            bytes,
        });

        let mut failures = 0usize;
        let mut queue = small.into_iter().map(|blob| upload_blob(backend, ctx, &root, blob));
        let mut processing = FuturesUnordered::new();
        if !ctx.is_cancelled() {
            processing.extend(queue.by_ref().take(ctx.settings.upload_concurrency.max(1)));
        }
        while let Some(event) = processing.next().await {
            if matches!(event, UploadEvent::Failed { .. }) {
                failures += 1;
            }
            yield Ok(event);
            // In-flight uploads finish; nothing new starts once cancelled.
            if !ctx.is_cancelled() {
                processing.extend(queue.next());
            }
        }
        for blob in large {
            if ctx.is_cancelled() {
                break;
            }
            let event = upload_blob(backend, ctx, &root, blob).await;
            if matches!(event, UploadEvent::Failed { .. }) {
                failures += 1;
            }
            yield Ok(event);
        }
        if ctx.is_cancelled() {
            yield Err(Error::from(ErrorKind::Cancelled));
            return;
        }

        if failures > 0 {
            tracing::warn!(failures, manifest = manifest_key, "not writing manifest: some blobs failed");
            yield Ok(UploadEvent::ManifestSkipped);
        } else {
            let document = manifest.encode();
            let written = ctx
                .settings
                .retry
                .run(manifest_key, || backend.write(Path::new(manifest_key), document.as_bytes()))
                .await
                .or_raise(|| ErrorKind::ManifestUpload(manifest_key.to_string()));
            match written {
                Ok(()) => {
                    tracing::info!(key = manifest_key, entries = manifest.len(), "uploaded manifest");
                    yield Ok(UploadEvent::ManifestWritten(manifest_key.to_string()));
                },
                Err(e) => {
                    yield Err(e);
                    return;
                },
            }
        }
        yield Ok(UploadEvent::Complete);
    })
}

/// Upload `manifest`'s content and then the manifest, collecting the outcome.
///
/// # Errors
/// [`ErrorKind::Validation`] for a bad source root, [`ErrorKind::Cancelled`],
/// or [`ErrorKind::ManifestUpload`]. Blob failures are not errors; they end
/// up in [`UploadReport::failed`].
pub async fn upload(
    backend: &BackendHandle,
    ctx: &Context,
    manifest: &Manifest,
    source_root: &Path,
    manifest_key: &str,
) -> Result<UploadReport> {
    let started = Instant::now();
    let mut report = UploadReport::default();
    let events = upload_stream(backend, ctx, manifest, source_root, manifest_key);
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event? {
            UploadEvent::Uploaded { key, bytes } => {
                report.stats.processed(bytes);
                report.uploaded.push(key);
            },
            UploadEvent::Skipped { key, bytes, reason } => {
                report.stats.skipped(bytes);
                report.skipped.push((key, reason));
            },
            UploadEvent::Failed { failure, bytes } => {
                report.stats.failed(bytes);
                report.failed.push(failure);
            },
            UploadEvent::ManifestWritten(key) => report.manifest_key = Some(key),
            UploadEvent::Started { .. } | UploadEvent::ManifestSkipped | UploadEvent::Complete => {},
        }
    }
    report.stats.total_time = started.elapsed();
    Ok(report)
}
