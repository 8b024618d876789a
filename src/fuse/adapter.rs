// FUSE adapter - bridges inode-based fuser callbacks to the path-based MirrorFs
//
// The adapter keeps an inode <-> virtual path map, resolves every callback to
// one or two virtual paths, calls the dispatcher and encodes the reply.
// Nothing is cached on the kernel side: entry and attribute TTLs are zero.

use crate::oracle::MirrorFs;
use crate::store::{Attr, EntryKind, SetTime, VirtualPath};
use fuser::{
    FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use nix::errno::Errno;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TTL: Duration = Duration::ZERO;

/// Inode 1 is the root.
const ROOT_INODE: u64 = 1;

pub struct FuseAdapter {
    fs: Arc<MirrorFs>,
    inode_map: InodeMap,
}

/// Manages inode <-> virtual path bidirectional mapping
struct InodeMap {
    inode_to_path: HashMap<u64, VirtualPath>,
    path_to_inode: HashMap<VirtualPath, u64>,
    next_inode: u64,
}

impl InodeMap {
    fn new() -> Self {
        let mut map = Self {
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        map.insert(ROOT_INODE, VirtualPath::root());
        map
    }

    fn insert(&mut self, inode: u64, path: VirtualPath) {
        self.inode_to_path.insert(inode, path.clone());
        self.path_to_inode.insert(path, inode);
    }

    fn get_or_create(&mut self, path: &VirtualPath) -> u64 {
        if let Some(&inode) = self.path_to_inode.get(path) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.insert(inode, path.clone());
        inode
    }

    fn get_path(&self, inode: u64) -> Option<&VirtualPath> {
        self.inode_to_path.get(&inode)
    }

    fn remove_path(&mut self, path: &VirtualPath) {
        if let Some(inode) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&inode);
        }
    }

    /// Re-key `from` and everything below it onto `to`. Whatever was mapped
    /// at or below `to` is dropped first, since the rename replaced it.
    fn rename(&mut self, from: &VirtualPath, to: &VirtualPath) {
        let replaced: Vec<VirtualPath> =
            self.path_to_inode.keys().filter(|p| p.is_within(to)).cloned().collect();
        for path in replaced {
            self.remove_path(&path);
        }

        let moved: Vec<(VirtualPath, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| p.is_within(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, inode) in moved {
            if let Some(new) = old.rebase(from, to) {
                self.path_to_inode.remove(&old);
                self.insert(inode, new);
            }
        }
    }
}

impl FuseAdapter {
    pub fn new(fs: Arc<MirrorFs>) -> Self {
        Self { fs, inode_map: InodeMap::new() }
    }

    fn get_path(&self, inode: u64) -> Result<VirtualPath, Errno> {
        self.inode_map.get_path(inode).cloned().ok_or(Errno::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<VirtualPath, Errno> {
        let name = name.to_str().ok_or(Errno::EINVAL)?;
        self.get_path(parent)?.join(name)
    }

    /// Fresh attributes for `path`, with the inode assigned by this adapter.
    fn entry_attr(&mut self, path: &VirtualPath) -> Result<fuser::FileAttr, Errno> {
        let attr = self.fs.getattr(path)?;
        let inode = self.inode_map.get_or_create(path);
        Ok(to_fuse_attr(&attr, inode))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        path: &VirtualPath,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<(), Errno> {
        if let Some(mode) = mode {
            self.fs.chmod(path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.fs.chown(path, uid, gid)?;
        }
        if let Some(size) = size {
            self.fs.truncate(path, fh, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.fs.utimens(path, to_set_time(atime), to_set_time(mtime))?;
        }
        Ok(())
    }
}

fn to_set_time(time: Option<TimeOrNow>) -> SetTime {
    match time {
        None => SetTime::Omit,
        Some(TimeOrNow::Now) => SetTime::Now,
        Some(TimeOrNow::SpecificTime(t)) => SetTime::At(t),
    }
}

fn to_fuse_kind(kind: EntryKind) -> FuseFileType {
    match kind {
        EntryKind::RegularFile | EntryKind::Unknown => FuseFileType::RegularFile,
        EntryKind::Directory => FuseFileType::Directory,
        EntryKind::Symlink => FuseFileType::Symlink,
        EntryKind::BlockDevice => FuseFileType::BlockDevice,
        EntryKind::CharDevice => FuseFileType::CharDevice,
        EntryKind::NamedPipe => FuseFileType::NamedPipe,
        EntryKind::Socket => FuseFileType::Socket,
    }
}

fn to_fuse_attr(attr: &Attr, inode: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: inode,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: UNIX_EPOCH,
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm(),
        nlink: attr.nlink as u32,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev as u32,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn errno(e: Errno) -> libc::c_int {
    e as libc::c_int
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!(
            "Mirroring {} onto {}",
            self.fs.primary().root().display(),
            self.fs.mirror().root().display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.fs.handles().len();
        if open > 0 {
            tracing::warn!("FUSE filesystem destroyed with {} open handles", open);
        } else {
            tracing::info!("FUSE filesystem destroyed");
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.child_path(parent, name).and_then(|path| self.entry_attr(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.get_path(ino).and_then(|path| self.fs.getattr(&path));
        match result {
            Ok(attr) => reply.attr(&TTL, &to_fuse_attr(&attr, ino)),
            Err(e) => reply.error(errno(e)),
        }
    }

    /// Applies mode, ownership, size and timestamps in that order, each as
    /// its own mirrored operation, then answers with fresh attributes.
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.get_path(ino).and_then(|path| {
            self.apply_setattr(&path, mode, uid, gid, size, atime, mtime, fh)?;
            self.fs.getattr(&path)
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &to_fuse_attr(&attr, ino)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.get_path(ino).and_then(|path| self.fs.readlink(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.mkdir(&path, mode, umask)?;
            self.entry_attr(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.unlink(&path)?;
            Ok(path)
        });
        match result {
            Ok(path) => {
                self.inode_map.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.rmdir(&path)?;
            Ok(path)
        });
        match result {
            Ok(path) => {
                self.inode_map.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, link_name).and_then(|path| {
            self.fs.symlink(target, &path)?;
            self.entry_attr(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.fs.rename(&from, &to, flags)?;
            Ok((from, to))
        });
        match result {
            Ok((from, to)) => {
                self.inode_map.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.get_path(ino).and_then(|existing| {
            let new = self.child_path(newparent, newname)?;
            self.fs.link(&existing, &new)?;
            self.entry_attr(&new)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.get_path(ino).and_then(|path| self.fs.open(&path, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.get_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };

        let entries = match self.fs.readdir(&path, offset) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };

        let parent_inode = self.inode_map.get_or_create(&path.parent());
        let mut all_entries = vec![
            (ino, FuseFileType::Directory, OsStr::new(".").to_os_string()),
            (parent_inode, FuseFileType::Directory, OsStr::new("..").to_os_string()),
        ];

        for entry in entries {
            // Names that are not valid virtual paths cannot be looked up later.
            let child = match entry.name.to_str().map(|n| path.join(n)) {
                Some(Ok(child)) => child,
                _ => continue,
            };
            let inode = self.inode_map.get_or_create(&child);
            all_entries.push((inode, to_fuse_kind(entry.kind), entry.name));
        }

        for (i, (inode, kind, name)) in all_entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*inode, (i + 1) as i64, *kind, name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.get_path(ino).and_then(|path| self.fs.access(&path, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };

        let fh = match self.fs.create(&path, flags, mode, umask) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };

        match self.entry_attr(&path) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => {
                // The kernel never learns about this handle, so close it here.
                let _ = self.fs.release(fh);
                reply.error(errno(e));
            }
        }
    }
}
