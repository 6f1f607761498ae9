use crate::hash::error::{ErrorKind, Result};
use exn::ResultExt;
use jattach_cache::FileStamp;
use jattach_manifest::HashAlgorithm;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const CHUNK_SIZE: usize = 64 * 1024;

/// Content hash plus the size and modification time it was taken at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hash: String,
    pub size: u64,
    /// Microseconds since the Unix epoch.
    pub mtime: i64,
}

/// An open regular file that is known to live inside its allowed root.
///
/// Size and modification time come from the open handle, not from a separate
/// `stat`, so they describe exactly the bytes that will be read.
#[derive(Debug)]
pub struct VerifiedFile {
    file: File,
    resolved: PathBuf,
    size: u64,
    modified: SystemTime,
}

impl VerifiedFile {
    /// The canonical path that was opened.
    pub fn resolved(&self) -> &Path {
        &self.resolved
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Modification time in microseconds since the Unix epoch.
    pub fn mtime_micros(&self) -> i64 {
        micros(self.modified)
    }

    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            mtime_ns: nanos(self.modified),
            size: self.size,
        }
    }

    /// Stream the whole file through the hasher. Blocking.
    pub fn hash(mut self, alg: HashAlgorithm) -> Result<String> {
        let mut hasher = alg.hasher();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = match self.file.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).or_raise(|| ErrorKind::Io(self.resolved.clone())),
            };
            hasher.update(&buffer[..read]);
        }
        Ok(hasher.finish())
    }

    /// A second async handle on the same open file, rewound to the start.
    /// Every retry of a streamed upload reads the file that was verified,
    /// never whatever the path points at by then.
    pub fn rewound(&self) -> io::Result<tokio::fs::File> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(tokio::fs::File::from_std(file))
    }

    /// Read the whole file into memory. Blocking.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(usize::try_from(self.size).unwrap_or_default());
        self.file.read_to_end(&mut bytes).or_raise(|| ErrorKind::Io(self.resolved.clone()))?;
        Ok(bytes)
    }
}

pub(crate) fn micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_micros()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_micros()).map(|m| -m).unwrap_or(i64::MIN),
    }
}

fn nanos(time: SystemTime) -> i128 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i128::try_from(after.as_nanos()).unwrap_or(i128::MAX),
        Err(before) => i128::try_from(before.duration().as_nanos()).map(|n| -n).unwrap_or(i128::MIN),
    }
}

fn classify(error: io::Error, path: &Path) -> crate::hash::error::Error {
    #[cfg(unix)]
    if error.raw_os_error() == Some(nix::errno::Errno::ELOOP as i32) {
        return exn::Exn::from(error).raise(ErrorKind::SymlinkEscape(path.to_path_buf()));
    }
    let kind = match error.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
        _ => ErrorKind::Io(path.to_path_buf()),
    };
    exn::Exn::from(error).raise(kind)
}

#[cfg(unix)]
fn open_no_follow(resolved: &Path, path: &Path) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits())
        .open(resolved)
        .map_err(|e| classify(e, path))
}

#[cfg(not(unix))]
fn open_no_follow(resolved: &Path, path: &Path) -> Result<File> {
    let file = File::open(resolved).map_err(|e| classify(e, path))?;
    // No atomic no-follow open here; re-check that the path we opened was
    // not replaced by a link in the meantime.
    let metadata = std::fs::symlink_metadata(resolved).map_err(|e| classify(e, path))?;
    if metadata.file_type().is_symlink() {
        exn::bail!(ErrorKind::SymlinkEscape(path.to_path_buf()));
    }
    Ok(file)
}

/// Resolve `path`, make sure it stays under `allowed_root` (when given) and
/// open it without following a final symlink. Blocking.
pub fn open_verified(path: &Path, allowed_root: Option<&Path>) -> Result<VerifiedFile> {
    let resolved = std::fs::canonicalize(path).map_err(|e| classify(e, path))?;
    if let Some(root) = allowed_root {
        let root = std::fs::canonicalize(root).map_err(|e| classify(e, root))?;
        if !resolved.starts_with(&root) {
            tracing::warn!(path = %path.display(), resolved = %resolved.display(), "refusing to read outside root");
            exn::bail!(ErrorKind::SymlinkEscape(path.to_path_buf()));
        }
    }
    let file = open_no_follow(&resolved, path)?;
    let metadata = file.metadata().map_err(|e| classify(e, path))?;
    if !metadata.is_file() {
        exn::bail!(ErrorKind::NotAFile(path.to_path_buf()));
    }
    let modified = metadata.modified().map_err(|e| classify(e, path))?;
    Ok(VerifiedFile {
        file,
        resolved,
        size: metadata.len(),
        modified,
    })
}

/// Hash a single file without consulting any cache.
pub async fn hash_file(path: &Path, allowed_root: Option<&Path>, alg: HashAlgorithm) -> Result<FileDigest> {
    let path = path.to_path_buf();
    let root = allowed_root.map(Path::to_path_buf);
    let join_path = path.clone();
    tokio::task::spawn_blocking(move || {
        let file = open_verified(&path, root.as_deref())?;
        let (size, mtime) = (file.size(), file.mtime_micros());
        let hash = file.hash(alg)?;
        Ok(FileDigest { hash, size, mtime })
    })
    .await
    .or_raise(|| ErrorKind::Io(join_path))?
}
