//! Object store abstraction for job attachments.
//!
//! Blobs and manifests live in a remote object store addressed by slash
//! separated keys. The [`StorageBackend`] trait is the only thing the sync
//! engine talks to; which store sits behind it is a construction-time choice.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::{ByteReader, StorageBackend};
pub use crate::models::ObjectInfo;
pub use crate::path::{key_of, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
