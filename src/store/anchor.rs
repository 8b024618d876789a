// Root anchors
//
// Each backing tree is opened exactly once at startup as an O_DIRECTORY
// descriptor. All later path resolution for that tree is relative to it.

use super::StoreRole;
use crate::error::{MirrorError, Result};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct RootAnchor {
    root: PathBuf,
    fd: OwnedFd,
}

impl RootAnchor {
    pub fn open(role: StoreRole, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(root)
            .map_err(|source| {
                if source.raw_os_error() == Some(libc::ENOTDIR) {
                    MirrorError::AnchorNotDirectory { role, path: root.to_path_buf() }
                } else {
                    MirrorError::Anchor { role, path: root.to_path_buf(), source }
                }
            })?;

        tracing::debug!("Opened {} root anchor at {}", role, root.display());

        Ok(Self { root: root.to_path_buf(), fd: OwnedFd::from(file) })
    }

    /// The path the anchor was opened from. Informational only: nothing
    /// resolves through it after startup.
    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl AsFd for RootAnchor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
