//! Canonical JSON encoding of manifests.
//!
//! The encoding is byte-stable: keys sorted, no insignificant whitespace,
//! every non-ASCII character escaped as `\uXXXX`, and paths in UTF-16 order.
//! Identical manifests always serialize to identical bytes, so a manifest's
//! own hash can be used to name it.

use crate::error::{ErrorKind, Result};
use crate::hash::HashAlgorithm;
use crate::model::{Manifest, ManifestPath, ManifestVersion};
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::ser::{Formatter, Serializer};
use std::io::{self, Write};
use std::path::Path;

/// Wire shape. Field order is alphabetical, matching the sorted-key output.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRef<'a> {
    hash_alg: HashAlgorithm,
    manifest_version: ManifestVersion,
    paths: &'a [ManifestPath],
    total_size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    hash_alg: HashAlgorithm,
    manifest_version: ManifestVersion,
    paths: Vec<ManifestPath>,
    total_size: u64,
}

/// Compact output with non-ASCII escaped, like Python's `ensure_ascii`.
/// The trait's default methods are already the compact layout.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..index])?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}

impl Manifest {
    /// Serialize to canonical JSON.
    ///
    /// ```
    /// use jattach_manifest::{HashAlgorithm, Manifest, ManifestPath};
    /// let manifest = Manifest::new(HashAlgorithm::Xxh128, [ManifestPath::new("café.txt", "ab12", 3, 7)]);
    /// assert_eq!(
    ///     manifest.encode(),
    ///     r#"{"hashAlg":"xxh128","manifestVersion":"2023-03-03","paths":[{"hash":"ab12","mtime":7,"path":"caf\u00e9.txt","size":3}],"totalSize":3}"#,
    /// );
    /// ```
    pub fn encode(&self) -> String {
        let document = DocumentRef {
            hash_alg: self.hash_alg(),
            manifest_version: self.version(),
            paths: self.paths(),
            total_size: self.total_size(),
        };
        let mut buffer = Vec::with_capacity(64 + self.len() * 96);
        let mut serializer = Serializer::with_formatter(&mut buffer, AsciiFormatter);
        // Serializing plain strings and integers into a Vec cannot fail.
        if let Err(e) = document.serialize(&mut serializer) {
            tracing::error!(error = %e, "manifest serialization failed");
        }
        // The formatter only ever emits ASCII.
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Parse and validate a manifest document.
    ///
    /// Rejects unknown versions, missing or mistyped fields, and hashes that
    /// are not ASCII alphanumeric. `totalSize` is recomputed from the entries.
    pub fn decode(input: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(input).or_raise(|| ErrorKind::Decode("not JSON".into()))?;
        let version = value
            .get("manifestVersion")
            .ok_or_raise(|| ErrorKind::Decode("missing required field `manifestVersion`".into()))?;
        let version_name = version.as_str().unwrap_or_default();
        if ManifestVersion::from_name(version_name).is_none() {
            exn::bail!(ErrorKind::UnsupportedVersion(version.to_string().trim_matches('"').to_string()));
        }
        let document: Document = serde_json::from_value(value).map_err(|e| ErrorKind::Decode(e.to_string()))?;
        for entry in &document.paths {
            if entry.hash.is_empty() || !entry.hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
                exn::bail!(ErrorKind::InvalidHash {
                    path: entry.path.clone(),
                    hash: entry.hash.clone(),
                });
            }
        }
        let manifest = Self::with_version(document.manifest_version, document.hash_alg, document.paths);
        if manifest.total_size() != document.total_size {
            tracing::warn!(
                declared = document.total_size,
                computed = manifest.total_size(),
                "manifest totalSize does not match its entries"
            );
        }
        Ok(manifest)
    }

    /// Write the canonical encoding to a local file, creating parent
    /// directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file_error = |source| ErrorKind::File {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(file_error)?;
        }
        std::fs::write(path, self.encode()).map_err(file_error)?;
        Ok(())
    }

    /// Read and decode a manifest from a local file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|source| ErrorKind::File {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hello_manifest() -> Manifest {
        let hash = HashAlgorithm::Xxh128.hash_bytes(b"hello");
        Manifest::new(
            HashAlgorithm::Xxh128,
            [
                ManifestPath::new("b.txt", hash.clone(), 5, 1_700_000_000_000_001),
                ManifestPath::new("a.txt", hash, 5, 1_700_000_000_000_000),
            ],
        )
    }

    #[test]
    fn test_encode_is_canonical() {
        let manifest = hello_manifest();
        let hash = HashAlgorithm::Xxh128.hash_bytes(b"hello");
        let expected = format!(
            concat!(
                r#"{{"hashAlg":"xxh128","manifestVersion":"2023-03-03","paths":["#,
                r#"{{"hash":"{h}","mtime":1700000000000000,"path":"a.txt","size":5}},"#,
                r#"{{"hash":"{h}","mtime":1700000000000001,"path":"b.txt","size":5}}"#,
                r#"],"totalSize":10}}"#
            ),
            h = hash
        );
        assert_eq!(manifest.encode(), expected);
    }

    #[test]
    fn test_encode_escapes_non_ascii() {
        let manifest = Manifest::new(HashAlgorithm::Xxh128, [ManifestPath::new("dir/\u{1F600}\"é", "ab", 1, 0)]);
        let encoded = manifest.encode();
        assert!(encoded.is_ascii());
        assert!(encoded.contains(r#""path":"dir/\ud83d\ude00\"\u00e9""#));
        assert_eq!(Manifest::decode(&encoded).unwrap(), manifest);
    }

    #[test]
    fn test_decode_recomputes_total_size() {
        let input = r#"{"hashAlg":"xxh128","manifestVersion":"2023-03-03","paths":[{"hash":"abc","mtime":1,"path":"x","size":4}],"totalSize":999}"#;
        let manifest = Manifest::decode(input).unwrap();
        assert_eq!(manifest.total_size(), 4);
    }

    #[rstest]
    #[case::not_json("{nope", "Decode")]
    #[case::missing_version(r#"{"hashAlg":"xxh128","paths":[],"totalSize":0}"#, "Decode")]
    #[case::unknown_version(r#"{"hashAlg":"xxh128","manifestVersion":"2022-06-06","paths":[],"totalSize":0}"#, "UnsupportedVersion")]
    #[case::unknown_algorithm(r#"{"hashAlg":"md5","manifestVersion":"2023-03-03","paths":[],"totalSize":0}"#, "Decode")]
    #[case::missing_size(r#"{"hashAlg":"xxh128","manifestVersion":"2023-03-03","paths":[{"hash":"a","mtime":1,"path":"x"}],"totalSize":0}"#, "Decode")]
    #[case::bad_hash(r#"{"hashAlg":"xxh128","manifestVersion":"2023-03-03","paths":[{"hash":"../x","mtime":1,"path":"x","size":1}],"totalSize":1}"#, "InvalidHash")]
    fn test_decode_rejects(#[case] input: &str, #[case] expected: &str) {
        let err = Manifest::decode(input).unwrap_err();
        let kind = match &*err {
            ErrorKind::Decode(_) => "Decode",
            ErrorKind::UnsupportedVersion(_) => "UnsupportedVersion",
            ErrorKind::InvalidHash { .. } => "InvalidHash",
            _ => "other",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("manifests/nested/root_input");
        let manifest = hello_manifest();
        manifest.write_to(&path).unwrap();
        assert_eq!(Manifest::read_from(&path).unwrap(), manifest);
        let err = Manifest::read_from(&temp_dir.path().join("missing")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::File { .. }));
    }
}
