// mirrorfs - differential FUSE filesystem
//
// Every operation is executed against a primary and a mirror directory tree;
// the two outcomes are compared before the primary's result is returned.

pub mod config;
pub mod error;
pub mod fuse;
pub mod oracle;
pub mod store;

pub use error::{MirrorError, Result};
