// Backing-store attribute and directory entry types

use nix::sys::stat::FileStat;
use std::ffi::OsString;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File type as reported by `st_mode` or a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
    Unknown,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => EntryKind::RegularFile,
            libc::S_IFDIR => EntryKind::Directory,
            libc::S_IFLNK => EntryKind::Symlink,
            libc::S_IFBLK => EntryKind::BlockDevice,
            libc::S_IFCHR => EntryKind::CharDevice,
            libc::S_IFIFO => EntryKind::NamedPipe,
            libc::S_IFSOCK => EntryKind::Socket,
            _ => EntryKind::Unknown,
        }
    }

    pub fn from_dirent(kind: nix::dir::Type) -> Self {
        match kind {
            nix::dir::Type::File => EntryKind::RegularFile,
            nix::dir::Type::Directory => EntryKind::Directory,
            nix::dir::Type::Symlink => EntryKind::Symlink,
            nix::dir::Type::BlockDevice => EntryKind::BlockDevice,
            nix::dir::Type::CharacterDevice => EntryKind::CharDevice,
            nix::dir::Type::Fifo => EntryKind::NamedPipe,
            nix::dir::Type::Socket => EntryKind::Socket,
        }
    }
}

/// Stat fields captured from one backing store.
///
/// Every field of `struct stat` the engine or the FUSE reply needs is kept
/// here, including the ones reconciliation deliberately ignores (device,
/// inode, block counts, timestamps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    /// Full `st_mode`: type and permission bits.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub ino: u64,
    pub dev: u64,
    pub rdev: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attr {
    pub fn from_stat(st: &FileStat) -> Self {
        Self {
            kind: EntryKind::from_mode(st.st_mode),
            mode: st.st_mode,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size.max(0) as u64,
            ino: st.st_ino,
            dev: st.st_dev,
            rdev: st.st_rdev,
            blocks: st.st_blocks.max(0) as u64,
            blksize: st.st_blksize as u32,
            atime: to_system_time(st.st_atime, st.st_atime_nsec),
            mtime: to_system_time(st.st_mtime, st.st_mtime_nsec),
            ctime: to_system_time(st.st_ctime, st.st_ctime_nsec),
        }
    }

    /// Permission bits including setuid, setgid and sticky.
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One entry of a directory listing. `.` and `..` are never included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}
