//! Hash algorithms used to address content.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::{Xxh3, xxh3_128};

/// Supported hashing algorithms for file content.
///
/// The serialized name doubles as the file extension of blobs in the
/// content-addressed store (`Data/{hash}.xxh128`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "xxh128")]
    Xxh128,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xxh128 => "xxh128",
        }
    }

    /// Parse the serialized name, as stored in caches and blob keys.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xxh128" => Some(Self::Xxh128),
            _ => None,
        }
    }

    /// Hash an in-memory buffer, returning the lowercase hex digest.
    ///
    /// ```
    /// use jattach_manifest::HashAlgorithm;
    /// let digest = HashAlgorithm::Xxh128.hash_bytes(b"hello");
    /// assert_eq!(digest.len(), 32);
    /// assert_eq!(digest, HashAlgorithm::Xxh128.hash_bytes(b"hello"));
    /// ```
    pub fn hash_bytes(&self, data: &[u8]) -> String {
        match self {
            Self::Xxh128 => format!("{:032x}", xxh3_128(data)),
        }
    }

    /// Start an incremental hash for data that arrives in chunks.
    pub fn hasher(&self) -> ContentHasher {
        match self {
            Self::Xxh128 => ContentHasher::Xxh128(Box::default()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher; feed with [`update`](Self::update) and consume with
/// [`finish`](Self::finish). Produces the same digest as
/// [`HashAlgorithm::hash_bytes`] over the concatenated input.
pub enum ContentHasher {
    // Boxed, the xxh3 state is a few hundred bytes.
    Xxh128(Box<Xxh3>),
}

impl ContentHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Xxh128(state) => state.update(chunk),
        }
    }

    pub fn finish(self) -> String {
        match self {
            Self::Xxh128(state) => format!("{:032x}", state.digest128()),
        }
    }
}
