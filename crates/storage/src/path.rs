//! Key validation and security utilities.
//!
//! Object keys are handled as relative [`Path`]s so that the local backend can
//! map them straight onto the filesystem, and remote backends can join their
//! components with `/`.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a storage key for security and correctness.
/// Ensures that keys don't escape the storage root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use jattach_storage::validate_path;
/// // Valid keys
/// assert!(validate_path("Root/Data/0123abcd.xxh128").is_ok());
/// assert!(validate_path("a/../Data/blob").is_ok()); // (never leaves store root)
/// // Invalid keys
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err()); // (leaves store root)
/// assert!(validate_path("a\0b").is_err());
/// // Keys get resolved
/// assert_eq!(
///     validate_path("wrong/../Root/./Manifests//x_input/").unwrap(),
///     Path::new("Root/Manifests/x_input")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Validates a key and renders it as a `/` separated string, the form object
/// stores and the existence cache expect regardless of host platform.
///
/// ```
/// use jattach_storage::key_of;
/// assert_eq!(key_of("Root//Data/./abc.xxh128").unwrap(), "Root/Data/abc.xxh128");
/// assert!(key_of("../abc").is_err());
/// ```
pub fn key_of(path: impl AsRef<Path>) -> Result<String> {
    let validated = validate(path)?;
    let mut parts = Vec::new();
    for component in validated.components() {
        let Some(part) = component.as_os_str().to_str() else {
            exn::bail!(ErrorKind::InvalidPath(validated.clone()));
        };
        parts.push(part);
    }
    Ok(parts.join("/"))
}
