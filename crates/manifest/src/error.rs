use crate::hash::HashAlgorithm;
use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Document is not valid JSON or does not have the manifest shape.
    #[display("manifest could not be decoded: {_0}")]
    Decode(#[error(not(source))] String),
    #[display("unknown manifest version `{_0}` (supported: {})", crate::ManifestVersion::SUPPORTED)]
    UnsupportedVersion(#[error(not(source))] String),
    #[display("hash `{hash}` for path `{path}` is not alphanumeric")]
    InvalidHash { path: String, hash: String },
    #[display("cannot combine manifests hashed with {expected} and {found}")]
    HashAlgorithmMismatch { expected: HashAlgorithm, found: HashAlgorithm },
    #[display("invalid glob pattern `{_0}`")]
    InvalidGlob(#[error(not(source))] String),
    #[display("glob input cannot be deserialized as JSON: {_0}")]
    GlobInput(#[error(not(source))] String),
    #[display("manifest file {}: {source}", path.display())]
    File { path: PathBuf, source: IoError },
}
