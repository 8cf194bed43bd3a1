//! Shared argv parsing for the mount binaries.
//!
//! Each binary (`splittrackfs`, `mp3fs`, `oggfs`) takes the same core flags;
//! only the default bitrate and whether `--bitrate` is meaningful differ.

use std::path::PathBuf;

use crate::config::MountConfig;

#[derive(Debug)]
pub struct CliError(pub String);

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse the common mount flags, returning a [`MountConfig`].
///
/// `program_name` and `supports_bitrate` only affect usage text and the
/// default bitrate; positional args are always `<source-dir> <mount-point>`.
pub fn parse_args(
    args: &[String],
    default_bitrate_kbps: u32,
) -> Result<MountConfig, CliError> {
    let mut cache_dir = MountConfig::default_cache_dir();
    let mut cache_budget_bytes: u64 = 1024 * 1024 * 1024; // 1 GiB
    let mut bitrate_kbps = default_bitrate_kbps;
    let mut min_evictable_size_bytes: u64 = 0;
    let mut eviction_log_path: Option<PathBuf> = None;

    let mut i = 1;
    let mut positional = Vec::new();
    while i < args.len() {
        match args[i].as_str() {
            "--cache-dir" => {
                cache_dir = PathBuf::from(require_value(args, &mut i, "--cache-dir")?);
            }
            "--cache-budget-bytes" => {
                let v = require_value(args, &mut i, "--cache-budget-bytes")?;
                cache_budget_bytes = v
                    .parse()
                    .map_err(|_| CliError(format!("invalid --cache-budget-bytes value: {v}")))?;
            }
            "--bitrate" => {
                let v = require_value(args, &mut i, "--bitrate")?;
                bitrate_kbps = v
                    .parse()
                    .map_err(|_| CliError(format!("invalid --bitrate value: {v}")))?;
            }
            "--min-evictable-size-bytes" => {
                let v = require_value(args, &mut i, "--min-evictable-size-bytes")?;
                min_evictable_size_bytes = v
                    .parse()
                    .map_err(|_| CliError(format!("invalid --min-evictable-size-bytes value: {v}")))?;
            }
            "--eviction-log" => {
                eviction_log_path = Some(PathBuf::from(require_value(args, &mut i, "--eviction-log")?));
            }
            other if other.starts_with("--") => {
                return Err(CliError(format!("unknown argument: {other}")));
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    if positional.len() != 2 {
        return Err(CliError(
            "expected exactly two positional arguments: <source-dir> <mount-point>".to_string(),
        ));
    }
    let source_dir = PathBuf::from(&positional[0]);
    let mount_point = PathBuf::from(&positional[1]);

    Ok(MountConfig {
        source_dir,
        mount_point,
        cache_dir,
        cache_budget_bytes,
        bitrate_kbps,
        min_evictable_size_bytes,
        eviction_log_path,
        non_audio_extensions: MountConfig::default_non_audio_extensions(),
        track_name_separator: " - ".to_string(),
    })
}

fn require_value<'a>(
    args: &'a [String],
    i: &mut usize,
    flag: &str,
) -> Result<&'a str, CliError> {
    if *i + 1 >= args.len() {
        return Err(CliError(format!("{flag} requires a value")));
    }
    let v = args[*i + 1].as_str();
    *i += 2;
    Ok(v)
}

pub fn print_usage(program_name: &str, supports_bitrate: bool) {
    eprintln!("Usage:");
    if supports_bitrate {
        eprintln!(
            "  {program_name} [--bitrate KBPS] [--cache-dir DIR] [--cache-budget-bytes N] \\"
        );
    } else {
        eprintln!("  {program_name} [--cache-dir DIR] [--cache-budget-bytes N] \\");
    }
    eprintln!("      [--min-evictable-size-bytes N] [--eviction-log PATH] <source-dir> <mount-point>");
}
