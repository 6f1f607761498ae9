//! Access control for downloaded files.
//!
//! Downloaded assets are restricted to the invoking user by default. The
//! engine only ever calls [`PermissionSetter`]; which implementation it gets
//! is decided when the [`Context`](crate::Context) is built, usually via
//! [`host_default`].

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// Applies the download permission policy to a single path.
///
/// Called from blocking tasks; implementations may do synchronous I/O.
pub trait PermissionSetter: Debug + Send + Sync {
    fn apply_to_file(&self, path: &Path) -> Result<()>;
    fn apply_to_dir(&self, path: &Path) -> Result<()>;
}

/// The setter matching the host OS, with owner-only defaults.
pub fn host_default() -> Arc<dyn PermissionSetter> {
    #[cfg(unix)]
    {
        Arc::new(PosixPermissions::default())
    }
    #[cfg(not(unix))]
    {
        Arc::new(WindowsPermissions::for_current_user())
    }
}

/// Leaves permissions as created: owner-only for downloaded files, the
/// process umask for directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unchanged;

impl PermissionSetter for Unchanged {
    fn apply_to_file(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn apply_to_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Sets an explicit mode, and optionally hands group ownership to a shared
/// group (OR-ing extra bits in for it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixPermissions {
    pub file_mode: u32,
    pub dir_mode: u32,
    pub group: Option<GroupAccess>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAccess {
    pub name: String,
    pub file_bits: u32,
    pub dir_bits: u32,
}

impl Default for PosixPermissions {
    fn default() -> Self {
        Self {
            file_mode: 0o600,
            dir_mode: 0o700,
            group: None,
        }
    }
}

impl PosixPermissions {
    /// Share with `group`: read/write on files, full access on directories.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(GroupAccess {
            name: group.into(),
            file_bits: 0o060,
            dir_bits: 0o070,
        });
        self
    }

    fn effective_mode(&self, is_dir: bool) -> u32 {
        let (base, extra) = match (&self.group, is_dir) {
            (Some(group), true) => (self.dir_mode, group.dir_bits),
            (Some(group), false) => (self.file_mode, group.file_bits),
            (None, true) => (self.dir_mode, 0),
            (None, false) => (self.file_mode, 0),
        };
        base | extra
    }

    #[cfg(unix)]
    fn apply(&self, path: &Path, is_dir: bool) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(group) = &self.group {
            let found = nix::unistd::Group::from_name(&group.name)
                .or_raise(|| ErrorKind::Permissions(path.to_path_buf()))?;
            let Some(found) = found else {
                tracing::warn!(group = %group.name, "no such group");
                exn::bail!(ErrorKind::Permissions(path.to_path_buf()));
            };
            nix::unistd::chown(path, None, Some(found.gid))
                .or_raise(|| ErrorKind::Permissions(path.to_path_buf()))?;
        }
        let mode = self.effective_mode(is_dir);
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .or_raise(|| ErrorKind::Permissions(path.to_path_buf()))
    }

    #[cfg(not(unix))]
    fn apply(&self, path: &Path, _is_dir: bool) -> Result<()> {
        exn::bail!(ErrorKind::Permissions(path.to_path_buf()))
    }
}

impl PermissionSetter for PosixPermissions {
    fn apply_to_file(&self, path: &Path) -> Result<()> {
        self.apply(path, false)
    }

    fn apply_to_dir(&self, path: &Path) -> Result<()> {
        self.apply(path, true)
    }
}

/// Grants full control to a single account and removes inherited ACL
/// entries, using `icacls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsPermissions {
    pub user: String,
}

impl WindowsPermissions {
    pub fn for_current_user() -> Self {
        Self {
            user: std::env::var("USERNAME").unwrap_or_default(),
        }
    }

    fn arguments(&self, path: &Path, is_dir: bool) -> Vec<std::ffi::OsString> {
        // (OI)(CI) makes the grant inherit into files later created inside.
        let grant = if is_dir { format!("{}:(OI)(CI)F", self.user) } else { format!("{}:F", self.user) };
        vec![path.as_os_str().to_owned(), "/inheritance:r".into(), "/grant:r".into(), grant.into()]
    }

    fn apply(&self, path: &Path, is_dir: bool) -> Result<()> {
        if self.user.is_empty() {
            exn::bail!(ErrorKind::Validation("no Windows user to grant access to".into()));
        }
        let status = std::process::Command::new("icacls")
            .args(self.arguments(path, is_dir))
            .stdout(std::process::Stdio::null())
            .status()
            .or_raise(|| ErrorKind::Permissions(path.to_path_buf()))?;
        if !status.success() {
            tracing::warn!(path = %path.display(), ?status, "icacls failed");
            exn::bail!(ErrorKind::Permissions(path.to_path_buf()));
        }
        Ok(())
    }
}

impl PermissionSetter for WindowsPermissions {
    fn apply_to_file(&self, path: &Path) -> Result<()> {
        self.apply(path, false)
    }

    fn apply_to_dir(&self, path: &Path) -> Result<()> {
        self.apply(path, true)
    }
}
