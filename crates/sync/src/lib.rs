//! Moving job attachments between local disk and the object store.
//!
//! [`snapshot`](snapshot::snapshot) turns a directory into a manifest,
//! [`upload`](upload::upload) stores its content and then the manifest,
//! [`download`](download::download) materializes a manifest under a target
//! directory, and [`capture_outputs`](capture::capture_outputs) finds what a
//! job changed. Everything takes a [`Context`] carrying the key layout, caches,
//! limits and the cancellation token.

pub mod capture;
mod context;
pub mod download;
pub mod error;
pub mod hash;
mod layout;
pub mod permissions;
mod progress;
mod retry;
pub mod snapshot;
pub mod upload;

pub use crate::context::{CHUNK_SIZE, Context, TransferSettings};
pub use crate::layout::{Layout, OutputTarget};
pub use crate::progress::{SummaryStatistics, TransferFailure};
pub use crate::retry::RetryPolicy;
