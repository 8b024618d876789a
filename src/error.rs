use crate::store::StoreRole;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Startup and mount errors. Per-operation failures never surface here: they
/// are plain errno values handed back to the kernel.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Could not open {role} root {}: {source}", path.display())]
    Anchor {
        role: StoreRole,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{role} root is not a directory: {}", path.display())]
    AnchorNotDirectory { role: StoreRole, path: PathBuf },

    #[error("Mount point does not exist: {}", .0.display())]
    MountPointMissing(PathBuf),

    #[error("Mount point is not a directory: {}", .0.display())]
    MountPointNotDirectory(PathBuf),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Mount failed: {0}")]
    Mount(#[source] io::Error),
}
