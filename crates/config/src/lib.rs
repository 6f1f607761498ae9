//! Layered configuration for job attachments.
//!
//! Built-in defaults, then an optional TOML/YAML/JSON file, then `JATTACH_`
//! environment variables (`__` separates nested keys, so
//! `JATTACH_TRANSFER__UPLOAD_CONCURRENCY=4` sets `transfer.upload_concurrency`).

mod config;
pub mod error;

pub use crate::config::{CacheConfig, Config, Conflict, DownloadConfig, RetryConfig, StorageConfig, TransferConfig};
