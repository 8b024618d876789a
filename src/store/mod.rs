// Backing store layer
//
// Thin, uninterpreted access to one directory tree through a root anchor.

pub mod anchor;
pub mod attr;
pub mod backing;
pub mod path;

pub use anchor::RootAnchor;
pub use attr::{Attr, DirEntry, EntryKind};
pub use backing::{BackingStore, Observation, SetTime};
pub use path::VirtualPath;

use std::fmt;

/// Which of the two trees an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreRole {
    /// The tree whose results are returned to the caller.
    Primary,
    /// The tree every operation is replayed against for comparison.
    Mirror,
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRole::Primary => write!(f, "primary"),
            StoreRole::Mirror => write!(f, "mirror"),
        }
    }
}
