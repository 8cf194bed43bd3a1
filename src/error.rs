//! Crate-wide error taxonomy and its mapping onto filesystem errno values.

use thiserror::Error;

use crate::cache::CacheError;
use crate::catalog::CatalogError;
use crate::coordinator::CoordinatorError;
use crate::drivers::DriverError;

/// Errors surfaced across component boundaries.
///
/// Each variant corresponds to one of the error kinds in the engine's error
/// taxonomy; `to_errno` is the single place that taxonomy is translated into
/// values a `fuser::Filesystem` reply can use.
#[derive(Error, Debug)]
pub enum AudioFsError {
    #[error("source file unavailable: {0}")]
    SourceUnavailable(String),
    #[error("driver failure: {0}")]
    DriverFailure(#[from] DriverError),
    #[error("cache I/O failure: {0}")]
    CacheIoFailure(#[from] CacheError),
    #[error("cannot reserve cache space: {0}")]
    Budget(String),
    #[error("build cancelled")]
    Cancelled,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not permitted: read-only filesystem")]
    NotPermitted,
}

impl From<CoordinatorError> for AudioFsError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Cache(c) => AudioFsError::CacheIoFailure(c),
            CoordinatorError::Driver(d) => AudioFsError::DriverFailure(d),
            CoordinatorError::Cancelled => AudioFsError::Cancelled,
            CoordinatorError::ObservedFailure(msg) => AudioFsError::DriverFailure(DriverError::ProcessFailed {
                program: "build".to_string(),
                detail: msg,
            }),
        }
    }
}

impl From<CatalogError> for AudioFsError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(p) => AudioFsError::NotFound(p),
            CatalogError::Io(e) => AudioFsError::SourceUnavailable(e.to_string()),
            CatalogError::Source(e) => AudioFsError::SourceUnavailable(e.to_string()),
        }
    }
}

impl AudioFsError {
    /// Map this error onto the `libc` errno value `fuser` expects in a reply.
    pub fn to_errno(&self) -> i32 {
        match self {
            AudioFsError::SourceUnavailable(_) => libc::EIO,
            AudioFsError::DriverFailure(_) => libc::EIO,
            AudioFsError::CacheIoFailure(_) => libc::EIO,
            AudioFsError::Budget(_) => libc::ENOSPC,
            AudioFsError::Cancelled => libc::EINTR,
            AudioFsError::NotFound(_) => libc::ENOENT,
            AudioFsError::NotPermitted => libc::EROFS,
        }
    }
}
