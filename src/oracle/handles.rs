// File handle correlation table
//
// Maps the handle exposed to the kernel (the primary descriptor number) to the
// open session on both stores.

use crate::store::VirtualPath;
use nix::errno::Errno;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    #[error("Handle table full ({0} open)")]
    Exhausted(usize),

    #[error("Handle {0} is already mapped")]
    Duplicate(u64),

    #[error("Unknown handle {0}")]
    Unknown(u64),
}

impl HandleError {
    pub fn to_errno(&self) -> Errno {
        match self {
            HandleError::Exhausted(_) => Errno::EMFILE,
            HandleError::Duplicate(_) => Errno::EIO,
            HandleError::Unknown(_) => Errno::EBADF,
        }
    }
}

/// One open file on both stores.
///
/// Field order matters: dropping a session closes the mirror descriptor
/// before the primary one.
#[derive(Debug)]
pub struct HandleSession {
    mirror: OwnedFd,
    primary: OwnedFd,
    path: VirtualPath,
}

impl HandleSession {
    pub fn new(primary: OwnedFd, mirror: OwnedFd, path: VirtualPath) -> Self {
        Self { mirror, primary, path }
    }

    /// The handle this session is exposed under.
    pub fn handle(&self) -> u64 {
        self.primary.as_raw_fd() as u64
    }

    pub fn primary(&self) -> &OwnedFd {
        &self.primary
    }

    pub fn mirror(&self) -> &OwnedFd {
        &self.mirror
    }

    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    /// Give up both descriptors, primary first.
    pub fn into_fds(self) -> (OwnedFd, OwnedFd) {
        (self.primary, self.mirror)
    }
}

pub struct HandleTable {
    capacity: usize,
    sessions: RwLock<HashMap<u64, Arc<HandleSession>>>,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, sessions: RwLock::new(HashMap::new()) }
    }

    /// Map `handle` to `session`. On error the session is dropped, which
    /// closes both of its descriptors.
    pub fn insert(&self, handle: u64, session: HandleSession) -> Result<(), HandleError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(&handle) {
            return Err(HandleError::Duplicate(handle));
        }
        if sessions.len() >= self.capacity {
            return Err(HandleError::Exhausted(sessions.len()));
        }
        sessions.insert(handle, Arc::new(session));
        Ok(())
    }

    pub fn lookup(&self, handle: u64) -> Result<Arc<HandleSession>, HandleError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(&handle).cloned().ok_or(HandleError::Unknown(handle))
    }

    pub fn remove(&self, handle: u64) -> Result<Arc<HandleSession>, HandleError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&handle).ok_or(HandleError::Unknown(handle))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn session(dir: &tempfile::TempDir, name: &str) -> HandleSession {
        let p = File::create(dir.path().join(format!("{}.p", name))).unwrap();
        let m = File::create(dir.path().join(format!("{}.m", name))).unwrap();
        HandleSession::new(OwnedFd::from(p), OwnedFd::from(m), VirtualPath::parse(&format!("/{}", name)).unwrap())
    }

    #[test]
    fn test_insert_lookup_remove() {
        let dir = tempfile::tempdir().unwrap();
        let table = HandleTable::new(4);
        let s = session(&dir, "a");
        let handle = s.handle();

        table.insert(handle, s).unwrap();
        assert_eq!(table.len(), 1);

        let found = table.lookup(handle).unwrap();
        assert_eq!(found.path().as_str(), "/a");
        assert_eq!(found.handle(), handle);
        drop(found);

        table.remove(handle).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.lookup(handle).unwrap_err(), HandleError::Unknown(handle));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = HandleTable::new(4);
        let first = session(&dir, "a");
        let handle = first.handle();
        table.insert(handle, first).unwrap();

        let err = table.insert(handle, session(&dir, "b")).unwrap_err();
        assert_eq!(err, HandleError::Duplicate(handle));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(handle).unwrap().path().as_str(), "/a");
    }

    #[test]
    fn test_capacity_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let table = HandleTable::new(2);
        for name in ["a", "b"] {
            let s = session(&dir, name);
            table.insert(s.handle(), s).unwrap();
        }
        assert!(table.is_full());

        let extra = session(&dir, "c");
        let err = table.insert(extra.handle(), extra).unwrap_err();
        assert_eq!(err, HandleError::Exhausted(2));
        assert_eq!(err.to_errno(), Errno::EMFILE);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unknown_handle_maps_to_ebadf() {
        let table = HandleTable::new(1);
        assert_eq!(table.remove(77).unwrap_err().to_errno(), Errno::EBADF);
    }

    #[test]
    fn test_concurrent_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(HandleTable::new(64));
        let sessions: Vec<_> = (0..16).map(|i| session(&dir, &format!("f{}", i))).collect();

        std::thread::scope(|scope| {
            for s in sessions {
                let table = table.clone();
                scope.spawn(move || {
                    let handle = s.handle();
                    table.insert(handle, s).unwrap();
                    assert!(table.lookup(handle).is_ok());
                });
            }
        });
        assert_eq!(table.len(), 16);
    }
}
