//! Mount-time configuration.
//!
//! Every mount is configured by its argv, injected once at startup into a
//! plain record. No config file, no keyring, no process-wide mutable
//! singleton.

use std::path::PathBuf;

/// Configuration shared by all three filesystem binaries.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Root of the source tree being projected.
    pub source_dir: PathBuf,
    /// Where the derived filesystem is mounted.
    pub mount_point: PathBuf,
    /// Directory holding cached derived files.
    pub cache_dir: PathBuf,
    /// Cache budget in bytes.
    pub cache_budget_bytes: u64,
    /// Target bitrate in kbit/s for lossy drivers. Ignored by SplitTrack.
    pub bitrate_kbps: u32,
    /// Entries below this size are never evicted by the size maintainer.
    pub min_evictable_size_bytes: u64,
    /// Optional path to mirror eviction log lines to, in addition to `tracing`.
    pub eviction_log_path: Option<PathBuf>,
    /// File extensions (without the dot) hidden from the derived view.
    pub non_audio_extensions: Vec<String>,
    /// Separator used between a zero-padded track number and its title.
    pub track_name_separator: String,
}

impl MountConfig {
    pub fn default_non_audio_extensions() -> Vec<String> {
        vec![
            "cue".to_string(),
            "log".to_string(),
            "m3u".to_string(),
            "nfo".to_string(),
            "jpg".to_string(),
            "jpeg".to_string(),
            "png".to_string(),
        ]
    }

    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("audiofs")
    }
}
