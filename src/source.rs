//! Stable identity for a source file, used as one of the fingerprint inputs.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `(device, inode, modification time, size)` — stable as long as the file
/// is not replaced; two reads of the same path produce an unequal
/// `SourceIdentity` if (and only if) the file underneath changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceIdentity {
    pub device: u64,
    pub inode: u64,
    pub mtime_nanos: i64,
    pub size: u64,
}

impl SourceIdentity {
    pub fn for_path(path: &Path) -> Result<Self, SourceError> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            device: meta.dev(),
            inode: meta.ino(),
            mtime_nanos: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            size: meta.size(),
        })
    }
}
