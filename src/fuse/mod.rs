// FUSE interface implementation
//
// Exposes a MirrorFs to the kernel as a mountable POSIX filesystem.

pub mod adapter;
pub mod mount;

pub use adapter::FuseAdapter;
pub use mount::{MountOptions, mount, spawn};
