// Virtual path normalization
//
// FUSE delivers absolute paths. Every backing-store primitive resolves its
// path relative to a root anchor, so the root maps to "." and everything else
// loses its leading separator.

use nix::errno::Errno;
use std::fmt;
use std::path::Path;

const MAX_PATH_LENGTH: usize = 4096;
const MAX_FILENAME_LENGTH: usize = 255;

/// An absolute, normalized path inside the mirrored filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath {
    absolute: String,
}

impl VirtualPath {
    /// The root of the mirrored filesystem.
    pub fn root() -> Self {
        Self { absolute: "/".to_string() }
    }

    /// Parse and normalize an absolute path.
    ///
    /// Repeated and trailing separators are collapsed. `.` and `..`
    /// components are rejected. A parsed path never resolves outside the
    /// anchor it is used with.
    pub fn parse(path: &str) -> Result<Self, Errno> {
        if path.is_empty() || path.contains('\0') || !path.starts_with('/') {
            return Err(Errno::EINVAL);
        }

        if path.len() > MAX_PATH_LENGTH {
            return Err(Errno::ENAMETOOLONG);
        }

        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for part in &parts {
            validate_component(part)?;
        }

        if parts.is_empty() {
            return Ok(Self::root());
        }

        Ok(Self { absolute: format!("/{}", parts.join("/")) })
    }

    /// Append a single directory entry name.
    pub fn join(&self, name: &str) -> Result<Self, Errno> {
        if name.contains('/') || name.contains('\0') {
            return Err(Errno::EINVAL);
        }
        validate_component(name)?;

        let absolute = if self.is_root() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.absolute, name)
        };

        if absolute.len() > MAX_PATH_LENGTH {
            return Err(Errno::ENAMETOOLONG);
        }

        Ok(Self { absolute })
    }

    pub fn as_str(&self) -> &str {
        &self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute == "/"
    }

    /// Anchor-relative form used with the `*at` syscalls.
    pub fn relative(&self) -> &Path {
        if self.is_root() { Path::new(".") } else { Path::new(&self.absolute[1..]) }
    }

    /// The containing directory. The root is its own parent.
    pub fn parent(&self) -> VirtualPath {
        match self.absolute.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self { absolute: self.absolute[..idx].to_string() },
        }
    }

    /// True when `self` equals `ancestor` or lies somewhere below it.
    pub fn is_within(&self, ancestor: &VirtualPath) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.absolute
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Re-root `self` from `from` onto `to`. Returns `None` when `self` is
    /// not within `from`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<VirtualPath> {
        if !self.is_within(from) {
            return None;
        }
        if self == from {
            return Some(to.clone());
        }

        let rest = if from.is_root() {
            &self.absolute[1..]
        } else {
            &self.absolute[from.absolute.len() + 1..]
        };
        let absolute =
            if to.is_root() { format!("/{}", rest) } else { format!("{}/{}", to.absolute, rest) };
        Some(VirtualPath { absolute })
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute)
    }
}

fn validate_component(part: &str) -> Result<(), Errno> {
    if part.is_empty() || part == "." || part == ".." {
        return Err(Errno::EINVAL);
    }
    if part.len() > MAX_FILENAME_LENGTH {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(())
}
