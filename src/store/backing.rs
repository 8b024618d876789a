// Backing-store primitives
//
// One BackingStore per tree. Each method issues exactly one native call (or a
// short fixed sequence, for listing) against the root anchor and reports the
// raw outcome. No retries, no interpretation: reconciliation happens above.

use super::anchor::RootAnchor;
use super::attr::{Attr, DirEntry, EntryKind};
use super::path::VirtualPath;
use super::StoreRole;
use crate::error::Result;
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag, readlinkat, renameat};
use nix::sys::stat::{
    FchmodatFlags, Mode, UtimensatFlags, fchmodat, fstatat, mkdirat, utimensat,
};
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{
    AccessFlags, Gid, LinkatFlags, Uid, UnlinkatFlags, faccessat, fchownat, fdatasync, fsync,
    linkat, symlinkat, unlinkat,
};
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of a single native call: a value or the errno it failed with.
pub type Observation<T> = std::result::Result<T, Errno>;

/// How one timestamp of a utimens request should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Omit,
    Now,
    At(SystemTime),
}

impl SetTime {
    fn to_timespec(self) -> TimeSpec {
        match self {
            SetTime::Omit => TimeSpec::UTIME_OMIT,
            SetTime::Now => TimeSpec::UTIME_NOW,
            SetTime::At(t) => match t.duration_since(UNIX_EPOCH) {
                Ok(d) => TimeSpec::from_duration(d),
                Err(before) => -TimeSpec::from_duration(before.duration()),
            },
        }
    }
}

#[derive(Debug)]
pub struct BackingStore {
    anchor: RootAnchor,
}

impl BackingStore {
    pub fn new(anchor: RootAnchor) -> Self {
        Self { anchor }
    }

    /// Anchor a store at `root`, which must be an existing directory.
    pub fn open_root(role: StoreRole, root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(RootAnchor::open(role, root)?))
    }

    pub fn root(&self) -> &Path {
        self.anchor.path()
    }

    pub fn stat(&self, path: &VirtualPath) -> Observation<Attr> {
        let st = fstatat(self.anchor.as_fd(), path.relative(), AtFlags::AT_SYMLINK_NOFOLLOW)?;
        Ok(Attr::from_stat(&st))
    }

    pub fn access(&self, path: &VirtualPath, mask: i32) -> Observation<()> {
        let flags = AccessFlags::from_bits_truncate(mask);
        faccessat(self.anchor.as_fd(), path.relative(), flags, AtFlags::empty())
    }

    pub fn readlink(&self, path: &VirtualPath) -> Observation<OsString> {
        readlinkat(self.anchor.as_fd(), path.relative())
    }

    /// List a directory, excluding `.` and `..`, sorted by name.
    ///
    /// Entries whose type the filesystem does not report are typed with a
    /// non-following stat relative to the directory.
    pub fn list_dir(&self, path: &VirtualPath) -> Observation<Vec<DirEntry>> {
        let mut dir = Dir::openat(
            self.anchor.as_fd(),
            path.relative(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            let name = entry.file_name().to_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            let name = OsStr::from_bytes(name).to_os_string();
            let kind = match entry.file_type() {
                Some(t) => EntryKind::from_dirent(t),
                None => {
                    let child = path.relative().join(&name);
                    match fstatat(self.anchor.as_fd(), child.as_path(), AtFlags::AT_SYMLINK_NOFOLLOW) {
                        Ok(st) => EntryKind::from_mode(st.st_mode),
                        Err(_) => EntryKind::Unknown,
                    }
                }
            };
            entries.push(DirEntry { name, kind });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn mkdir(&self, path: &VirtualPath, mode: u32) -> Observation<()> {
        mkdirat(self.anchor.as_fd(), path.relative(), Mode::from_bits_truncate(mode))
    }

    pub fn symlink(&self, target: &Path, link: &VirtualPath) -> Observation<()> {
        symlinkat(target, self.anchor.as_fd(), link.relative())
    }

    pub fn unlink(&self, path: &VirtualPath) -> Observation<()> {
        unlinkat(self.anchor.as_fd(), path.relative(), UnlinkatFlags::NoRemoveDir)
    }

    pub fn rmdir(&self, path: &VirtualPath) -> Observation<()> {
        unlinkat(self.anchor.as_fd(), path.relative(), UnlinkatFlags::RemoveDir)
    }

    pub fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Observation<()> {
        renameat(self.anchor.as_fd(), from.relative(), self.anchor.as_fd(), to.relative())
    }

    /// Hard link within this tree. Both names resolve against this store's
    /// own anchor.
    pub fn link(&self, existing: &VirtualPath, new: &VirtualPath) -> Observation<()> {
        linkat(
            self.anchor.as_fd(),
            existing.relative(),
            self.anchor.as_fd(),
            new.relative(),
            LinkatFlags::empty(),
        )
    }

    pub fn chmod(&self, path: &VirtualPath, mode: u32) -> Observation<()> {
        fchmodat(
            self.anchor.as_fd(),
            path.relative(),
            Mode::from_bits_truncate(mode),
            FchmodatFlags::FollowSymlink,
        )
    }

    pub fn chown(&self, path: &VirtualPath, uid: Option<u32>, gid: Option<u32>) -> Observation<()> {
        fchownat(
            self.anchor.as_fd(),
            path.relative(),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )
    }

    pub fn utimens(&self, path: &VirtualPath, atime: SetTime, mtime: SetTime) -> Observation<()> {
        utimensat(
            self.anchor.as_fd(),
            path.relative(),
            &atime.to_timespec(),
            &mtime.to_timespec(),
            UtimensatFlags::NoFollowSymlink,
        )
    }

    /// Truncate by path: open for writing, resize, close.
    pub fn truncate(&self, path: &VirtualPath, size: u64) -> Observation<()> {
        let fd = nix::fcntl::openat(
            self.anchor.as_fd(),
            path.relative(),
            OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        self.ftruncate(&fd, size)
    }

    /// Open an existing entry with the caller's flags.
    pub fn open(&self, path: &VirtualPath, flags: i32) -> Observation<OwnedFd> {
        nix::fcntl::openat(
            self.anchor.as_fd(),
            path.relative(),
            OFlag::from_bits_retain(flags) | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
    }

    /// Create and open a file. `O_CREAT` is always added to `flags`.
    pub fn create(&self, path: &VirtualPath, flags: i32, mode: u32) -> Observation<OwnedFd> {
        nix::fcntl::openat(
            self.anchor.as_fd(),
            path.relative(),
            OFlag::from_bits_retain(flags) | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(mode),
        )
    }

    /// Positional read of up to `size` bytes. Short reads are returned as is.
    pub fn read_at(&self, fd: &OwnedFd, size: usize, offset: i64) -> Observation<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let n = pread(fd.as_fd(), &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_at(&self, fd: &OwnedFd, data: &[u8], offset: i64) -> Observation<usize> {
        pwrite(fd.as_fd(), data, offset)
    }

    pub fn ftruncate(&self, fd: &OwnedFd, size: u64) -> Observation<()> {
        let len = i64::try_from(size).map_err(|_| Errno::EFBIG)?;
        nix::unistd::ftruncate(fd, len)
    }

    pub fn fsync(&self, fd: &OwnedFd, datasync: bool) -> Observation<()> {
        if datasync { fdatasync(fd.as_fd()) } else { fsync(fd.as_fd()) }
    }

    /// Close a descriptor and report the close result.
    pub fn close(&self, fd: OwnedFd) -> Observation<()> {
        let raw = fd.into_raw_fd();
        // SAFETY: `raw` came from an OwnedFd that was just given up, so nothing
        // else owns or will close it.
        Errno::result(unsafe { libc::close(raw) }).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BackingStore::open_root(StoreRole::Primary, dir.path()).unwrap();
        (dir, store)
    }

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[test]
    fn test_stat_root_and_missing() {
        let (_dir, store) = setup();
        assert!(store.stat(&VirtualPath::root()).unwrap().is_dir());
        assert_eq!(store.stat(&vp("/missing")), Err(Errno::ENOENT));
    }

    #[test]
    fn test_stat_does_not_follow_symlinks() {
        let (dir, store) = setup();
        std::os::unix::fs::symlink("nowhere", dir.path().join("dangling")).unwrap();
        let attr = store.stat(&vp("/dangling")).unwrap();
        assert_eq!(attr.kind, EntryKind::Symlink);
    }

    #[test]
    fn test_mkdir_list_rmdir() {
        let (dir, store) = setup();
        store.mkdir(&vp("/d"), 0o755).unwrap();
        fs::write(dir.path().join("d/b"), b"").unwrap();
        fs::write(dir.path().join("d/a"), b"").unwrap();
        store.mkdir(&vp("/d/sub"), 0o755).unwrap();

        let entries = store.list_dir(&vp("/d")).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["a", "b", "sub"]);
        assert_eq!(entries[2].kind, EntryKind::Directory);
        assert_eq!(entries[0].kind, EntryKind::RegularFile);

        assert_eq!(store.rmdir(&vp("/d")), Err(Errno::ENOTEMPTY));
        store.rmdir(&vp("/d/sub")).unwrap();
    }

    #[test]
    fn test_list_dir_on_file_fails() {
        let (dir, store) = setup();
        fs::write(dir.path().join("f"), b"").unwrap();
        assert_eq!(store.list_dir(&vp("/f")), Err(Errno::ENOTDIR));
    }

    #[test]
    fn test_symlink_and_readlink() {
        let (_dir, store) = setup();
        store.symlink(Path::new("../target"), &vp("/l")).unwrap();
        assert_eq!(store.readlink(&vp("/l")).unwrap(), OsString::from("../target"));
        assert_eq!(store.symlink(Path::new("x"), &vp("/l")), Err(Errno::EEXIST));
    }

    #[test]
    fn test_unlink_rename_link() {
        let (dir, store) = setup();
        fs::write(dir.path().join("a"), b"data").unwrap();

        store.link(&vp("/a"), &vp("/b")).unwrap();
        assert_eq!(store.stat(&vp("/a")).unwrap().nlink, 2);

        store.rename(&vp("/b"), &vp("/c")).unwrap();
        assert_eq!(store.stat(&vp("/b")), Err(Errno::ENOENT));

        store.unlink(&vp("/c")).unwrap();
        assert_eq!(store.stat(&vp("/a")).unwrap().nlink, 1);
        assert_eq!(store.unlink(&vp("/c")), Err(Errno::ENOENT));
    }

    #[test]
    fn test_chmod_and_utimens() {
        let (dir, store) = setup();
        fs::write(dir.path().join("f"), b"").unwrap();

        store.chmod(&vp("/f"), 0o600).unwrap();
        assert_eq!(store.stat(&vp("/f")).unwrap().perm(), 0o600);

        let when = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        store.utimens(&vp("/f"), SetTime::Omit, SetTime::At(when)).unwrap();
        assert_eq!(store.stat(&vp("/f")).unwrap().mtime, when);
    }

    #[test]
    fn test_chown_to_self_is_noop() {
        let (dir, store) = setup();
        fs::write(dir.path().join("f"), b"").unwrap();
        let attr = store.stat(&vp("/f")).unwrap();
        store.chown(&vp("/f"), Some(attr.uid), Some(attr.gid)).unwrap();
        store.chown(&vp("/f"), None, None).unwrap();
    }

    #[test]
    fn test_create_write_read_truncate_close() {
        let (_dir, store) = setup();
        let fd = store.create(&vp("/f"), libc::O_RDWR, 0o644).unwrap();

        assert_eq!(store.write_at(&fd, b"hello world", 0).unwrap(), 11);
        assert_eq!(store.read_at(&fd, 5, 6).unwrap(), b"world");
        assert_eq!(store.read_at(&fd, 100, 0).unwrap(), b"hello world");
        assert!(store.read_at(&fd, 10, 100).unwrap().is_empty());

        store.ftruncate(&fd, 5).unwrap();
        store.fsync(&fd, false).unwrap();
        store.fsync(&fd, true).unwrap();
        store.close(fd).unwrap();
        assert_eq!(store.stat(&vp("/f")).unwrap().size, 5);

        store.truncate(&vp("/f"), 0).unwrap();
        assert_eq!(store.stat(&vp("/f")).unwrap().size, 0);
    }

    #[test]
    fn test_open_missing_and_exclusive_create() {
        let (_dir, store) = setup();
        assert_eq!(store.open(&vp("/none"), libc::O_RDONLY).unwrap_err(), Errno::ENOENT);

        let fd = store.create(&vp("/x"), libc::O_WRONLY | libc::O_EXCL, 0o644).unwrap();
        store.close(fd).unwrap();
        assert_eq!(
            store.create(&vp("/x"), libc::O_WRONLY | libc::O_EXCL, 0o644).unwrap_err(),
            Errno::EEXIST
        );
    }

    #[test]
    fn test_access() {
        let (dir, store) = setup();
        fs::write(dir.path().join("f"), b"").unwrap();
        store.access(&vp("/f"), libc::F_OK).unwrap();
        assert_eq!(store.access(&vp("/nope"), libc::F_OK), Err(Errno::ENOENT));
    }

    #[test]
    fn test_set_time_conversion() {
        assert_eq!(SetTime::Omit.to_timespec(), TimeSpec::UTIME_OMIT);
        assert_eq!(SetTime::Now.to_timespec(), TimeSpec::UTIME_NOW);
        let t = UNIX_EPOCH + std::time::Duration::new(42, 7);
        assert_eq!(SetTime::At(t).to_timespec(), TimeSpec::new(42, 7));
    }
}
