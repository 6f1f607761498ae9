use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Manifest document format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManifestVersion {
    #[default]
    #[serde(rename = "2023-03-03")]
    V2023_03_03,
}
impl ManifestVersion {
    /// Human-readable list for error messages.
    pub const SUPPORTED: &'static str = "2023-03-03";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2023_03_03 => "2023-03-03",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "2023-03-03" => Some(Self::V2023_03_03),
            _ => None,
        }
    }
}
impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file in a manifest.
///
/// Field order is alphabetical so that serialization emits sorted keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestPath {
    /// Hex digest of the file content.
    pub hash: String,
    /// Modification time, microseconds since the Unix epoch.
    pub mtime: i64,
    /// Root-relative POSIX path.
    pub path: String,
    pub size: u64,
}
impl ManifestPath {
    pub fn new(path: impl Into<String>, hash: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            hash: hash.into(),
            mtime,
            path: path.into(),
            size,
        }
    }
}

/// Orders paths by their UTF-16 code units, as canonical JSON (RFC 8785)
/// requires. Differs from byte order only above the Basic Multilingual Plane.
pub(crate) fn canonical_order(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

/// A snapshot of files under one root: what exists, how big it is, and what
/// its content hashes to.
///
/// Manifests are immutable. Every constructor de-duplicates entries by path
/// (the last occurrence wins), keeps them in canonical order, and derives
/// `total_size` from the entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    version: ManifestVersion,
    hash_alg: HashAlgorithm,
    total_size: u64,
    paths: Vec<ManifestPath>,
}

impl Manifest {
    /// Build a manifest in the current format.
    ///
    /// ```
    /// use jattach_manifest::{HashAlgorithm, Manifest, ManifestPath};
    /// let manifest = Manifest::new(HashAlgorithm::Xxh128, [
    ///     ManifestPath::new("b.txt", "bbbb", 5, 0),
    ///     ManifestPath::new("a.txt", "aaaa", 5, 0),
    ///     ManifestPath::new("b.txt", "cccc", 7, 0),
    /// ]);
    /// assert_eq!(manifest.len(), 2);
    /// assert_eq!(manifest.total_size(), 12);
    /// assert_eq!(manifest.paths()[0].path, "a.txt");
    /// ```
    pub fn new(hash_alg: HashAlgorithm, paths: impl IntoIterator<Item = ManifestPath>) -> Self {
        Self::with_version(ManifestVersion::default(), hash_alg, paths)
    }

    /// A manifest with no entries.
    pub fn empty(hash_alg: HashAlgorithm) -> Self {
        Self::new(hash_alg, [])
    }

    pub(crate) fn with_version(
        version: ManifestVersion,
        hash_alg: HashAlgorithm,
        paths: impl IntoIterator<Item = ManifestPath>,
    ) -> Self {
        let unique: BTreeMap<String, ManifestPath> = paths.into_iter().map(|p| (p.path.clone(), p)).collect();
        let mut paths: Vec<ManifestPath> = unique.into_values().collect();
        paths.sort_by(|a, b| canonical_order(&a.path, &b.path));
        let total_size = paths.iter().map(|p| p.size).sum();
        Self {
            version,
            hash_alg,
            total_size,
            paths,
        }
    }

    pub fn version(&self) -> ManifestVersion {
        self.version
    }

    pub fn hash_alg(&self) -> HashAlgorithm {
        self.hash_alg
    }

    /// Sum of all entry sizes, in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Entries in canonical order.
    pub fn paths(&self) -> &[ManifestPath] {
        &self.paths
    }

    pub fn into_paths(self) -> Vec<ManifestPath> {
        self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Look up an entry by its root-relative path.
    pub fn get(&self, path: &str) -> Option<&ManifestPath> {
        self.paths
            .binary_search_by(|entry| canonical_order(&entry.path, path))
            .ok()
            .map(|index| &self.paths[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_size_and_dedup() {
        let manifest = Manifest::new(
            HashAlgorithm::Xxh128,
            [
                ManifestPath::new("a.txt", "h1", 5, 1),
                ManifestPath::new("b.txt", "h1", 5, 2),
                ManifestPath::new("a.txt", "h2", 9, 3),
            ],
        );
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.total_size(), 14);
        assert_eq!(manifest.get("a.txt").map(|p| p.hash.as_str()), Some("h2"));
        assert!(manifest.get("c.txt").is_none());
    }

    #[test]
    fn test_canonical_order_is_utf16() {
        // U+1F600 encodes as the surrogate pair 0xD83D 0xDE00, so it sorts
        // before U+FF5E even though its code point is larger.
        let high = "\u{1F600}";
        let bmp = "\u{FF5E}";
        assert_eq!(canonical_order(high, bmp), Ordering::Less);
        let manifest = Manifest::new(
            HashAlgorithm::Xxh128,
            [ManifestPath::new(bmp, "a", 1, 0), ManifestPath::new(high, "b", 1, 0)],
        );
        assert_eq!(manifest.paths()[0].path, high);
        assert!(manifest.get(bmp).is_some());
        assert!(manifest.get(high).is_some());
    }

    #[test]
    fn test_empty() {
        let manifest = Manifest::empty(HashAlgorithm::Xxh128);
        assert!(manifest.is_empty());
        assert_eq!(manifest.total_size(), 0);
        assert_eq!(manifest.version(), ManifestVersion::V2023_03_03);
    }
}
