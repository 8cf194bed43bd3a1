//! Drivers turn a source description into bytes written to a cache slot.
//!
//! Every driver is a pure function of `(source identity, parameters)`: given
//! the same inputs it must always produce byte-identical output, because the
//! coordinator and cache store key entries on a fingerprint computed from
//! exactly those inputs.

mod mp3_encode;
mod ogg_encode;
mod split_track;

pub use mp3_encode::Mp3EncodeDriver;
pub use ogg_encode::OggEncodeDriver;
pub use split_track::SplitTrackDriver;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::cue::CueError;
use crate::flac_meta::FlacMetaError;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CUE sheet error: {0}")]
    Cue(#[from] CueError),
    #[error("FLAC metadata error: {0}")]
    FlacMeta(#[from] FlacMetaError),
    #[error("failed to run {program}: {detail}")]
    ProcessFailed { program: String, detail: String },
    #[error("tag writing failed: {0}")]
    Tag(String),
    #[error("track {0} not found in CUE sheet")]
    TrackNotFound(u32),
}

/// What a driver needs to locate its input audio.
#[derive(Debug, Clone)]
pub enum BuildSource {
    /// The whole source file is the input (Mp3Encode, OggEncode).
    WholeFile { flac_path: PathBuf },
    /// One track out of a cue-sheeted album (SplitTrack).
    CueTrack {
        flac_path: PathBuf,
        cue_path: PathBuf,
        track_number: u32,
    },
}

impl BuildSource {
    pub fn flac_path(&self) -> &Path {
        match self {
            BuildSource::WholeFile { flac_path } => flac_path,
            BuildSource::CueTrack { flac_path, .. } => flac_path,
        }
    }
}

/// A driver fingerprints, estimates, and materializes one derived file kind.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable identifier, the first component of every fingerprint this
    /// driver produces (e.g. `"mp3encode"`).
    fn id(&self) -> &'static str;

    /// Bumped whenever this driver's output format changes in a way that
    /// must invalidate previously-cached entries.
    fn version_tag(&self) -> &'static str;

    /// Canonical byte encoding of this driver's parameter tuple (bitrate,
    /// track number, ...), folded into the fingerprint alongside source
    /// identity so distinct parameterizations never collide.
    fn fingerprint_parameters(&self, source: &BuildSource) -> Vec<u8>;

    /// An upper bound on the final output size, used for virtual `stat`
    /// results before the real build has completed. Must never understate
    /// the eventual size once the build commits.
    async fn estimate_size(&self, source: &BuildSource) -> Result<u64, DriverError>;

    /// Produce the derived file's bytes at `sink_path`. The coordinator owns
    /// lifecycle (only one build per fingerprint runs at a time); the driver
    /// just has to write a correct, complete file or return an error and
    /// leave nothing usable behind.
    async fn run_to_sink(&self, source: &BuildSource, sink_path: &Path) -> Result<(), DriverError>;
}

/// Runs a child process to completion, mapping a non-zero exit or spawn
/// failure into a single `DriverError` variant.
pub(crate) async fn run_checked(mut command: tokio::process::Command, program: &str) -> Result<(), DriverError> {
    let output = command
        .output()
        .await
        .map_err(|e| DriverError::ProcessFailed {
            program: program.to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(DriverError::ProcessFailed {
            program: program.to_string(),
            detail: format!(
                "exit status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }

    Ok(())
}
