// FUSE mount management
//
// Provides functions to mount a mirrored filesystem via FUSE.

use super::FuseAdapter;
use crate::config::FuseConfig;
use crate::error::MirrorError;
use crate::oracle::MirrorFs;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Mount options for FUSE filesystem
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Allow other users to access the filesystem
    pub allow_other: bool,

    /// Allow root to access the filesystem
    pub allow_root: bool,

    /// Filesystem name (for mtab)
    pub fsname: Option<String>,

    /// Auto-unmount on process exit
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            fsname: Some("mirrorfs".to_string()),
            auto_unmount: false,
        }
    }
}

impl From<&FuseConfig> for MountOptions {
    fn from(config: &FuseConfig) -> Self {
        Self {
            allow_other: config.allow_other,
            allow_root: config.allow_root,
            fsname: Some(config.fsname.clone()).filter(|name| !name.is_empty()),
            auto_unmount: config.auto_unmount,
        }
    }
}

impl MountOptions {
    /// Convert to fuser mount options
    fn to_fuser_options(&self) -> Vec<fuser::MountOption> {
        let mut options = Vec::new();

        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }

        if self.allow_root {
            options.push(fuser::MountOption::AllowRoot);
        }

        if let Some(ref fsname) = self.fsname {
            options.push(fuser::MountOption::FSName(fsname.clone()));
        }

        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }

        options
    }
}

fn check_mountpoint(mountpoint: &Path) -> std::result::Result<(), MirrorError> {
    if !mountpoint.exists() {
        return Err(MirrorError::MountPointMissing(mountpoint.to_path_buf()));
    }

    if !mountpoint.is_dir() {
        return Err(MirrorError::MountPointNotDirectory(mountpoint.to_path_buf()));
    }

    Ok(())
}

/// Mount and serve in the calling thread until the filesystem is unmounted.
pub fn mount(fs: Arc<MirrorFs>, mountpoint: impl AsRef<Path>, options: &MountOptions) -> Result<()> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;

    tracing::info!(
        "Mounting {} (primary) / {} (mirror) at {}",
        fs.primary().root().display(),
        fs.mirror().root().display(),
        mountpoint.display()
    );

    fuser::mount2(FuseAdapter::new(fs), mountpoint, &options.to_fuser_options())
        .map_err(MirrorError::Mount)
        .context("Failed to mount filesystem")?;

    tracing::info!("Filesystem unmounted");

    Ok(())
}

/// Mount in a background thread.
///
/// # Returns
/// A session handle that keeps the filesystem mounted until dropped
pub fn spawn(
    fs: Arc<MirrorFs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;

    let session = fuser::spawn_mount2(FuseAdapter::new(fs), mountpoint, &options.to_fuser_options())
        .map_err(MirrorError::Mount)
        .context("Failed to mount filesystem")?;

    tracing::info!("Filesystem mounted at {}", mountpoint.display());

    Ok(session)
}
