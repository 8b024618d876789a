// Differential dispatcher
//
// Every operation runs the same primitive on the primary store and then on
// the mirror store, reconciles the two observations, reports divergences and
// hands back the primary's result.

use super::divergence::{DivergenceHandler, DivergenceRecord};
use super::handles::{HandleError, HandleSession, HandleTable};
use super::verdict::{AttrSubset, ByteMatch, Descriptor, EntrySet, Exact, Reconcile, judge, render};
use crate::config::MirrorConfig;
use crate::error::Result;
use crate::store::{
    Attr, BackingStore, DirEntry, Observation, SetTime, StoreRole, VirtualPath,
};
use nix::errno::Errno;
use std::ffi::OsString;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct MirrorFs {
    primary: BackingStore,
    mirror: BackingStore,
    handles: HandleTable,
    handler: Arc<dyn DivergenceHandler>,
    trace: bool,
}

impl MirrorFs {
    pub fn new(
        primary: BackingStore,
        mirror: BackingStore,
        handler: Arc<dyn DivergenceHandler>,
        config: &MirrorConfig,
    ) -> Self {
        Self {
            primary,
            mirror,
            handles: HandleTable::new(config.max_open_handles),
            handler,
            trace: config.trace_operations,
        }
    }

    /// Open both root anchors and build the dispatcher over them.
    pub fn open_roots(
        primary_root: impl AsRef<Path>,
        mirror_root: impl AsRef<Path>,
        handler: Arc<dyn DivergenceHandler>,
        config: &MirrorConfig,
    ) -> Result<Self> {
        let primary = BackingStore::open_root(StoreRole::Primary, primary_root)?;
        let mirror = BackingStore::open_root(StoreRole::Mirror, mirror_root)?;
        Ok(Self::new(primary, mirror, handler, config))
    }

    pub fn primary(&self) -> &BackingStore {
        &self.primary
    }

    pub fn mirror(&self) -> &BackingStore {
        &self.mirror
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    fn trace_op(&self, operation: &'static str, args: fmt::Arguments<'_>) {
        if self.trace {
            info!(target: "mirrorfs::ops", operation, "{}", args);
        }
    }

    /// Judge a pair of observations. Returns both values when both stores
    /// succeeded, the primary's errno when both failed, and `EIO` when only
    /// one side failed (in which case both observations are dropped).
    fn reconcile<T, R>(
        &self,
        operation: &'static str,
        paths: &[&VirtualPath],
        rule: &R,
        primary: Observation<T>,
        mirror: Observation<T>,
    ) -> Observation<(T, T)>
    where
        T: fmt::Debug,
        R: Reconcile<T>,
    {
        let judgement = judge(rule, &primary, &mirror);

        if judgement.verdict.is_divergence() {
            let record = DivergenceRecord {
                operation,
                paths: paths.iter().map(|p| p.to_string()).collect(),
                verdict: judgement.verdict,
                primary: render(rule, &primary),
                mirror: render(rule, &mirror),
                detail: judgement.detail,
            };
            error!(
                operation,
                paths = ?record.paths,
                verdict = %record.verdict,
                primary = %record.primary,
                mirror = %record.mirror,
                detail = %record.detail,
                "Divergence detected"
            );
            self.handler.on_divergence(&record);
        } else if self.trace {
            debug!(target: "mirrorfs::ops", operation, "Stores agree");
        }

        if judgement.verdict.is_fatal() {
            return Err(Errno::EIO);
        }

        match (primary, mirror) {
            (Ok(p), Ok(m)) => Ok((p, m)),
            (Err(errno), _) => Err(errno),
            (Ok(_), Err(_)) => Err(Errno::EIO),
        }
    }

    /// Run a path-level primitive on both stores.
    fn dual<T, R, F>(
        &self,
        operation: &'static str,
        paths: &[&VirtualPath],
        rule: &R,
        primitive: F,
    ) -> Observation<(T, T)>
    where
        T: fmt::Debug,
        R: Reconcile<T>,
        F: Fn(&BackingStore) -> Observation<T>,
    {
        let primary = primitive(&self.primary);
        let mirror = primitive(&self.mirror);
        self.reconcile(operation, paths, rule, primary, mirror)
    }

    /// Run a descriptor-level primitive on both halves of an open session.
    fn dual_session<T, R, F>(
        &self,
        operation: &'static str,
        fh: u64,
        rule: &R,
        primitive: F,
    ) -> Observation<T>
    where
        T: fmt::Debug,
        R: Reconcile<T>,
        F: Fn(&BackingStore, &OwnedFd) -> Observation<T>,
    {
        let session = self.handles.lookup(fh).map_err(|e| e.to_errno())?;
        let primary = primitive(&self.primary, session.primary());
        let mirror = primitive(&self.mirror, session.mirror());
        self.reconcile(operation, &[session.path()], rule, primary, mirror).map(|(p, _)| p)
    }

    pub fn getattr(&self, path: &VirtualPath) -> Observation<Attr> {
        self.trace_op("getattr", format_args!("{}", path));
        self.dual("getattr", &[path], &AttrSubset, |s| s.stat(path)).map(|(p, _)| p)
    }

    pub fn access(&self, path: &VirtualPath, mask: i32) -> Observation<()> {
        self.trace_op("access", format_args!("{} mask={:#o}", path, mask));
        self.dual("access", &[path], &Exact, |s| s.access(path, mask)).map(drop)
    }

    pub fn readlink(&self, path: &VirtualPath) -> Observation<OsString> {
        self.trace_op("readlink", format_args!("{}", path));
        self.dual("readlink", &[path], &Exact, |s| s.readlink(path)).map(|(p, _)| p)
    }

    /// List a directory. The listing is compared when read from the start.
    /// Continuation reads (`offset > 0`) come from the primary alone and do
    /// not re-validate the mirror.
    pub fn readdir(&self, path: &VirtualPath, offset: i64) -> Observation<Vec<DirEntry>> {
        self.trace_op("readdir", format_args!("{} offset={}", path, offset));
        if offset > 0 {
            return self.primary.list_dir(path);
        }
        self.dual("readdir", &[path], &EntrySet, |s| s.list_dir(path)).map(|(p, _)| p)
    }

    pub fn mkdir(&self, path: &VirtualPath, mode: u32, umask: u32) -> Observation<()> {
        self.trace_op("mkdir", format_args!("{} mode={:#o}", path, mode));
        let mode = mode & !umask;
        self.dual("mkdir", &[path], &Exact, |s| s.mkdir(path, mode)).map(drop)
    }

    pub fn symlink(&self, target: &Path, link: &VirtualPath) -> Observation<()> {
        self.trace_op("symlink", format_args!("{} -> {}", link, target.display()));
        self.dual("symlink", &[link], &Exact, |s| s.symlink(target, link)).map(drop)
    }

    pub fn unlink(&self, path: &VirtualPath) -> Observation<()> {
        self.trace_op("unlink", format_args!("{}", path));
        self.dual("unlink", &[path], &Exact, |s| s.unlink(path)).map(drop)
    }

    pub fn rmdir(&self, path: &VirtualPath) -> Observation<()> {
        self.trace_op("rmdir", format_args!("{}", path));
        self.dual("rmdir", &[path], &Exact, |s| s.rmdir(path)).map(drop)
    }

    /// Rename. Any `flags` (exchange, no-replace) are refused without
    /// touching either store.
    pub fn rename(&self, from: &VirtualPath, to: &VirtualPath, flags: u32) -> Observation<()> {
        self.trace_op("rename", format_args!("{} -> {} flags={:#x}", from, to, flags));
        if flags != 0 {
            return Err(Errno::EINVAL);
        }
        self.dual("rename", &[from, to], &Exact, |s| s.rename(from, to)).map(drop)
    }

    pub fn link(&self, existing: &VirtualPath, new: &VirtualPath) -> Observation<()> {
        self.trace_op("link", format_args!("{} -> {}", new, existing));
        self.dual("link", &[existing, new], &Exact, |s| s.link(existing, new)).map(drop)
    }

    pub fn chmod(&self, path: &VirtualPath, mode: u32) -> Observation<()> {
        self.trace_op("chmod", format_args!("{} mode={:#o}", path, mode));
        self.dual("chmod", &[path], &Exact, |s| s.chmod(path, mode)).map(drop)
    }

    pub fn chown(&self, path: &VirtualPath, uid: Option<u32>, gid: Option<u32>) -> Observation<()> {
        self.trace_op("chown", format_args!("{} uid={:?} gid={:?}", path, uid, gid));
        self.dual("chown", &[path], &Exact, |s| s.chown(path, uid, gid)).map(drop)
    }

    pub fn utimens(&self, path: &VirtualPath, atime: SetTime, mtime: SetTime) -> Observation<()> {
        self.trace_op("utimens", format_args!("{} atime={:?} mtime={:?}", path, atime, mtime));
        self.dual("utimens", &[path], &Exact, |s| s.utimens(path, atime, mtime)).map(drop)
    }

    /// Truncate through an open handle when one is given, otherwise by path.
    pub fn truncate(&self, path: &VirtualPath, fh: Option<u64>, size: u64) -> Observation<()> {
        self.trace_op("truncate", format_args!("{} fh={:?} size={}", path, fh, size));
        match fh {
            Some(fh) => self.dual_session("truncate", fh, &Exact, |s, fd| s.ftruncate(fd, size)),
            None => self.dual("truncate", &[path], &Exact, |s| s.truncate(path, size)).map(drop),
        }
    }

    pub fn open(&self, path: &VirtualPath, flags: i32) -> Observation<u64> {
        self.trace_op("open", format_args!("{} flags={:#o}", path, flags));
        if self.handles.is_full() {
            warn!("Refusing open of {}: handle table full", path);
            return Err(Errno::EMFILE);
        }
        let (primary, mirror) = self.dual("open", &[path], &Descriptor, |s| s.open(path, flags))?;
        self.register(path, primary, mirror)
    }

    pub fn create(&self, path: &VirtualPath, flags: i32, mode: u32, umask: u32) -> Observation<u64> {
        self.trace_op("create", format_args!("{} flags={:#o} mode={:#o}", path, flags, mode));
        if self.handles.is_full() {
            warn!("Refusing create of {}: handle table full", path);
            return Err(Errno::EMFILE);
        }
        let mode = mode & !umask;
        let (primary, mirror) =
            self.dual("create", &[path], &Descriptor, |s| s.create(path, flags, mode))?;
        self.register(path, primary, mirror)
    }

    fn register(&self, path: &VirtualPath, primary: OwnedFd, mirror: OwnedFd) -> Observation<u64> {
        let handle = primary.as_raw_fd() as u64;
        let session = HandleSession::new(primary, mirror, path.clone());
        match self.handles.insert(handle, session) {
            Ok(()) => Ok(handle),
            Err(HandleError::Duplicate(handle)) => {
                error!(handle, path = %path, "Handle already mapped while its descriptor was open");
                std::process::abort();
            }
            Err(e) => {
                warn!("Could not register {}: {}", path, e);
                Err(e.to_errno())
            }
        }
    }

    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Observation<Vec<u8>> {
        self.trace_op("read", format_args!("fh={} offset={} size={}", fh, offset, size));
        self.dual_session("read", fh, &ByteMatch, |s, fd| s.read_at(fd, size as usize, offset))
    }

    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Observation<usize> {
        self.trace_op("write", format_args!("fh={} offset={} len={}", fh, offset, data.len()));
        self.dual_session("write", fh, &Exact, |s, fd| s.write_at(fd, data, offset))
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Observation<()> {
        self.trace_op("fsync", format_args!("fh={} datasync={}", fh, datasync));
        self.dual_session("fsync", fh, &Exact, |s, fd| s.fsync(fd, datasync))
    }

    /// Close both descriptors of a session, mirror first, and compare the
    /// close results. Calls still using the session finish before it is
    /// closed.
    pub fn release(&self, fh: u64) -> Observation<()> {
        self.trace_op("release", format_args!("fh={}", fh));
        let session = reclaim(self.handles.remove(fh).map_err(|e| e.to_errno())?);

        let path = session.path().clone();
        let (primary, mirror) = session.into_fds();
        let mirror = self.mirror.close(mirror);
        let primary = self.primary.close(primary);
        self.reconcile("release", &[&path], &Exact, primary, mirror).map(drop)
    }
}

/// Wait for the last outstanding reference to a removed session. Once a
/// session leaves the table no new references can be taken, so this only
/// waits for calls already in flight.
fn reclaim(mut session: Arc<HandleSession>) -> HandleSession {
    loop {
        match Arc::try_unwrap(session) {
            Ok(session) => return session,
            Err(shared) => {
                debug!("Waiting for in-flight calls on {}", shared.path());
                session = shared;
                std::thread::yield_now();
            }
        }
    }
}
