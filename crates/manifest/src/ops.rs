//! Set operations over manifests.

use crate::error::{ErrorKind, Result};
use crate::model::{Manifest, ManifestPath};
use derive_more::Display;
use std::collections::HashMap;

/// How an entry relates to a base manifest.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    #[display("new")]
    New,
    #[display("modified")]
    Modified,
    #[display("unchanged")]
    Unchanged,
    #[display("deleted")]
    Deleted,
}

/// Entries of `new` that are absent from `base` or whose content hash
/// differs. Modification times are ignored; deletions are not represented.
///
/// ```
/// use jattach_manifest::{diff, HashAlgorithm, Manifest, ManifestPath};
/// let base = Manifest::new(HashAlgorithm::Xxh128, [ManifestPath::new("a.txt", "aa", 5, 1)]);
/// let new = Manifest::new(HashAlgorithm::Xxh128, [
///     ManifestPath::new("a.txt", "aa", 5, 99),
///     ManifestPath::new("b.txt", "bb", 5, 1),
/// ]);
/// let changes = diff(&base, &new);
/// assert_eq!(changes.len(), 1);
/// assert_eq!(changes.paths()[0].path, "b.txt");
/// ```
pub fn diff(base: &Manifest, new: &Manifest) -> Manifest {
    let changed = new
        .paths()
        .iter()
        .filter(|entry| base.get(&entry.path).is_none_or(|previous| previous.hash != entry.hash))
        .cloned();
    Manifest::new(new.hash_alg(), changed)
}

/// Classify every path in either manifest against `base`.
///
/// Entries present in `new` are reported with their `new` metadata in
/// canonical order, followed by entries only in `base` as
/// [`FileStatus::Deleted`].
pub fn compare(base: &Manifest, new: &Manifest) -> Vec<(FileStatus, ManifestPath)> {
    let mut differences: Vec<(FileStatus, ManifestPath)> = new
        .paths()
        .iter()
        .map(|entry| {
            let status = match base.get(&entry.path) {
                None => FileStatus::New,
                Some(previous) if previous.hash != entry.hash => FileStatus::Modified,
                Some(_) => FileStatus::Unchanged,
            };
            (status, entry.clone())
        })
        .collect();
    differences.extend(
        base.paths()
            .iter()
            .filter(|entry| new.get(&entry.path).is_none())
            .map(|entry| (FileStatus::Deleted, entry.clone())),
    );
    differences
}

/// Overlay manifests in order; for a path present in several, the last one
/// wins. Returns `None` for an empty input.
///
/// Used to lay job outputs over job inputs before materializing them.
pub fn merge<'a>(manifests: impl IntoIterator<Item = &'a Manifest>) -> Result<Option<Manifest>> {
    let mut manifests = manifests.into_iter();
    let Some(first) = manifests.next() else {
        return Ok(None);
    };
    let hash_alg = first.hash_alg();
    let mut merged: HashMap<&str, &ManifestPath> = first.paths().iter().map(|p| (p.path.as_str(), p)).collect();
    for manifest in manifests {
        if manifest.hash_alg() != hash_alg {
            exn::bail!(ErrorKind::HashAlgorithmMismatch {
                expected: hash_alg,
                found: manifest.hash_alg(),
            });
        }
        merged.extend(manifest.paths().iter().map(|p| (p.path.as_str(), p)));
    }
    Ok(Some(Manifest::new(hash_alg, merged.into_values().cloned())))
}
