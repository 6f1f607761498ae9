//! Asset manifests: the content-addressed description of a directory tree.
//!
//! A [`Manifest`] lists every file under a root with its content hash, size
//! and modification time. Manifests are exchanged as canonical JSON so that
//! equal manifests are byte-identical.

mod codec;
pub mod error;
mod filter;
mod hash;
mod model;
mod ops;

pub use crate::filter::{DEFAULT_INCLUDE, GlobConfig, GlobFilter};
pub use crate::hash::{ContentHasher, HashAlgorithm};
pub use crate::model::{Manifest, ManifestPath, ManifestVersion};
pub use crate::ops::{FileStatus, compare, diff, merge};
