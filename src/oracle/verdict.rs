// Reconciliation rules
//
// A rule decides whether two successful observations agree. Error handling
// (both failed, one failed) is the same for every operation and lives in
// `judge`.

use crate::store::{Attr, DirEntry, EntryKind, Observation};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

/// Outcome of comparing one primary and one mirror observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    /// Both succeeded with different values, or both failed with different
    /// error codes.
    Mismatch,
    /// Exactly one side failed.
    Asymmetric,
}

impl Verdict {
    pub fn is_divergence(&self) -> bool {
        !matches!(self, Verdict::Match)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Verdict::Asymmetric)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Match => write!(f, "match"),
            Verdict::Mismatch => write!(f, "mismatch"),
            Verdict::Asymmetric => write!(f, "asymmetric"),
        }
    }
}

/// Type-specific agreement rule for successful observations.
pub trait Reconcile<T: fmt::Debug> {
    /// `None` when the values agree, otherwise a description of what differs.
    fn compare(&self, primary: &T, mirror: &T) -> Option<String>;

    fn render(&self, value: &T) -> String {
        format!("{:?}", value)
    }
}

/// Plain equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exact;

impl<T: PartialEq + fmt::Debug> Reconcile<T> for Exact {
    fn compare(&self, primary: &T, mirror: &T) -> Option<String> {
        (primary != mirror).then(|| format!("{:?} != {:?}", primary, mirror))
    }
}

/// Attribute comparison over the fields two independent trees are expected
/// to agree on: full mode, link count, owner, group and, outside
/// directories, size.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrSubset;

impl Reconcile<Attr> for AttrSubset {
    fn compare(&self, primary: &Attr, mirror: &Attr) -> Option<String> {
        let mut diffs = Vec::new();
        if primary.mode != mirror.mode {
            diffs.push(format!("mode: {:#o} != {:#o}", primary.mode, mirror.mode));
        }
        if primary.nlink != mirror.nlink {
            diffs.push(format!("nlink: {} != {}", primary.nlink, mirror.nlink));
        }
        if primary.uid != mirror.uid {
            diffs.push(format!("uid: {} != {}", primary.uid, mirror.uid));
        }
        if primary.gid != mirror.gid {
            diffs.push(format!("gid: {} != {}", primary.gid, mirror.gid));
        }
        // Directory sizes depend on the filesystem's on-disk layout.
        if !primary.is_dir() && primary.size != mirror.size {
            diffs.push(format!("size: {} != {}", primary.size, mirror.size));
        }

        if diffs.is_empty() { None } else { Some(diffs.join(", ")) }
    }

    fn render(&self, attr: &Attr) -> String {
        format!(
            "mode={:#o} nlink={} uid={} gid={} size={}",
            attr.mode, attr.nlink, attr.uid, attr.gid, attr.size
        )
    }
}

/// Read results: same length and same bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteMatch;

impl Reconcile<Vec<u8>> for ByteMatch {
    fn compare(&self, primary: &Vec<u8>, mirror: &Vec<u8>) -> Option<String> {
        if primary.len() != mirror.len() {
            return Some(format!("length: {} != {}", primary.len(), mirror.len()));
        }
        primary
            .iter()
            .zip(mirror.iter())
            .position(|(p, m)| p != m)
            .map(|at| format!("content differs at byte {}", at))
    }

    fn render(&self, data: &Vec<u8>) -> String {
        format!("{} bytes", data.len())
    }
}

/// Open and create: any descriptor on each side is agreement.
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor;

impl Reconcile<OwnedFd> for Descriptor {
    fn compare(&self, _primary: &OwnedFd, _mirror: &OwnedFd) -> Option<String> {
        None
    }

    fn render(&self, fd: &OwnedFd) -> String {
        format!("fd {}", fd.as_raw_fd())
    }
}

/// Directory listings: unordered set equality of `(name, kind)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntrySet;

impl EntrySet {
    fn keys(entries: &[DirEntry]) -> BTreeSet<(OsString, EntryKind)> {
        entries.iter().map(|e| (e.name.clone(), e.kind)).collect()
    }
}

impl Reconcile<Vec<DirEntry>> for EntrySet {
    fn compare(&self, primary: &Vec<DirEntry>, mirror: &Vec<DirEntry>) -> Option<String> {
        let p = Self::keys(primary);
        let m = Self::keys(mirror);
        if p == m {
            return None;
        }

        let only_primary: Vec<_> = p.difference(&m).map(describe_entry).collect();
        let only_mirror: Vec<_> = m.difference(&p).map(describe_entry).collect();
        Some(format!(
            "only in primary: [{}]; only in mirror: [{}]",
            only_primary.join(", "),
            only_mirror.join(", ")
        ))
    }

    fn render(&self, entries: &Vec<DirEntry>) -> String {
        format!("{} entries", entries.len())
    }
}

fn describe_entry((name, kind): &(OsString, EntryKind)) -> String {
    format!("{} ({:?})", name.to_string_lossy(), kind)
}

/// Verdict plus a description of the disagreement, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgement {
    pub verdict: Verdict,
    pub detail: String,
}

/// Compare one observation from each store.
pub fn judge<T, R>(rule: &R, primary: &Observation<T>, mirror: &Observation<T>) -> Judgement
where
    T: fmt::Debug,
    R: Reconcile<T> + ?Sized,
{
    match (primary, mirror) {
        (Ok(p), Ok(m)) => match rule.compare(p, m) {
            None => Judgement { verdict: Verdict::Match, detail: String::new() },
            Some(detail) => Judgement { verdict: Verdict::Mismatch, detail },
        },
        (Err(p), Err(m)) if p == m => Judgement { verdict: Verdict::Match, detail: String::new() },
        (Err(p), Err(m)) => {
            Judgement { verdict: Verdict::Mismatch, detail: format!("errno: {} != {}", p, m) }
        }
        (Ok(_), Err(m)) => Judgement {
            verdict: Verdict::Asymmetric,
            detail: format!("only the mirror failed ({})", m),
        },
        (Err(p), Ok(_)) => Judgement {
            verdict: Verdict::Asymmetric,
            detail: format!("only the primary failed ({})", p),
        },
    }
}

/// Render an observation for a divergence record.
pub fn render<T, R>(rule: &R, observation: &Observation<T>) -> String
where
    T: fmt::Debug,
    R: Reconcile<T> + ?Sized,
{
    match observation {
        Ok(value) => format!("ok: {}", rule.render(value)),
        Err(errno) => format!("error: {}", errno),
    }
}
