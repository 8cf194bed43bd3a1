//! Projects one track out of a cue-sheeted FLAC album as a standalone FLAC
//! file, using the system `flac` and `metaflac` binaries.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::cue::{self, CueSheet, CueTrack};
use crate::flac_meta;

use super::{run_checked, BuildSource, Driver, DriverError};

pub struct SplitTrackDriver;

#[async_trait]
impl Driver for SplitTrackDriver {
    fn id(&self) -> &'static str {
        "splittrack"
    }

    fn version_tag(&self) -> &'static str {
        "v1"
    }

    fn fingerprint_parameters(&self, source: &BuildSource) -> Vec<u8> {
        match source {
            BuildSource::CueTrack { track_number, .. } => track_number.to_le_bytes().to_vec(),
            BuildSource::WholeFile { .. } => Vec::new(),
        }
    }

    async fn estimate_size(&self, source: &BuildSource) -> Result<u64, DriverError> {
        let (sheet, track) = load_track(source).await?;
        let album_headers = flac_meta::read_headers(source.flac_path())?;
        let album_duration_ms = album_headers.stream_info.duration_ms().max(1);
        let track_duration_ms = track_duration_ms(&sheet, track, album_duration_ms);

        let album_file_size = tokio::fs::metadata(source.flac_path()).await?.len();
        let proportional = (album_file_size as u128 * track_duration_ms as u128) / album_duration_ms as u128;

        // Headers and frame-boundary rounding make a per-track file slightly
        // larger than a strict proportional slice; pad generously so the
        // virtual stat never has to shrink once the real build lands.
        let padded = (proportional as u64).saturating_mul(103) / 100 + 8192;
        Ok(padded)
    }

    async fn run_to_sink(&self, source: &BuildSource, sink_path: &Path) -> Result<(), DriverError> {
        let (sheet, track) = load_track(source).await?;
        let album_headers = flac_meta::read_headers(source.flac_path())?;
        let album_duration_ms = album_headers.stream_info.duration_ms().max(1);
        let track_duration_ms = track_duration_ms(&sheet, track, album_duration_ms);

        let skip = format_flac_time(track.start_time_ms);
        let until = format_flac_time(track.start_time_ms + track_duration_ms);

        let flac_path = source.flac_path().to_path_buf();
        let sink_path_owned = sink_path.to_path_buf();

        extract_and_reencode(&flac_path, &skip, &until, &sink_path_owned).await?;
        tag_track(&sink_path_owned, &flac_path, &sheet, track).await?;

        Ok(())
    }
}

/// `flac --decode --stdout --skip=<start> --until=<end>` piped into a
/// second `flac` encode, rather than a single skip/until pass over the
/// whole album file, so the re-encode sees only the track's own samples
/// and produces a self-contained per-track FLAC stream.
async fn extract_and_reencode(
    flac_path: &Path,
    skip: &str,
    until: &str,
    sink_path: &Path,
) -> Result<(), DriverError> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut decode = Command::new("flac")
        .arg("--silent")
        .arg("--decode")
        .arg("--stdout")
        .arg(format!("--skip={skip}"))
        .arg(format!("--until={until}"))
        .arg(flac_path)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| DriverError::ProcessFailed {
            program: "flac --decode".to_string(),
            detail: e.to_string(),
        })?;

    let decode_stdout = decode.stdout.take().expect("flac stdout was piped");

    let mut encode = Command::new("flac")
        .arg("--silent")
        .arg("--force")
        .arg("-o")
        .arg(sink_path)
        .arg("-")
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| DriverError::ProcessFailed {
            program: "flac --encode".to_string(),
            detail: e.to_string(),
        })?;

    let mut encode_stdin = encode.stdin.take().expect("flac stdin was piped");

    let copy_task = tokio::spawn(async move {
        let mut reader = decode_stdout;
        tokio::io::copy(&mut reader, &mut encode_stdin).await?;
        encode_stdin.shutdown().await
    });

    let decode_status = decode.wait().await.map_err(|e| DriverError::ProcessFailed {
        program: "flac --decode".to_string(),
        detail: e.to_string(),
    })?;
    copy_task.await.expect("pipe copy task panicked").map_err(|e| DriverError::ProcessFailed {
        program: "flac decode|encode pipe".to_string(),
        detail: e.to_string(),
    })?;
    let encode_status = encode.wait().await.map_err(|e| DriverError::ProcessFailed {
        program: "flac --encode".to_string(),
        detail: e.to_string(),
    })?;

    if !decode_status.success() {
        return Err(DriverError::ProcessFailed {
            program: "flac --decode".to_string(),
            detail: format!("exit status {:?}", decode_status.code()),
        });
    }
    if !encode_status.success() {
        return Err(DriverError::ProcessFailed {
            program: "flac --encode".to_string(),
            detail: format!("exit status {:?}", encode_status.code()),
        });
    }

    Ok(())
}

async fn load_track(source: &BuildSource) -> Result<(CueSheet, CueTrack), DriverError> {
    let (cue_path, track_number) = match source {
        BuildSource::CueTrack {
            cue_path,
            track_number,
            ..
        } => (cue_path.clone(), *track_number),
        BuildSource::WholeFile { .. } => {
            return Err(DriverError::TrackNotFound(0));
        }
    };

    let sheet = tokio::task::spawn_blocking(move || cue::parse_cue_file(&cue_path))
        .await
        .expect("cue parse task panicked")?;

    let track = sheet
        .tracks
        .iter()
        .find(|t| t.number == track_number)
        .cloned()
        .ok_or(DriverError::TrackNotFound(track_number))?;

    Ok((sheet, track))
}

fn track_duration_ms(sheet: &CueSheet, track: &CueTrack, album_duration_ms: u64) -> u64 {
    let end = track.end_time_ms.unwrap_or(album_duration_ms);
    let _ = sheet;
    end.saturating_sub(track.start_time_ms)
}

/// `flac --skip/--until` accept `[[mm:]ss[.sss]]`; render whole milliseconds
/// as `mm:ss.sss`.
fn format_flac_time(ms: u64) -> String {
    let minutes = ms / 60_000;
    let rem_ms = ms % 60_000;
    let seconds = rem_ms / 1000;
    let fraction = rem_ms % 1000;
    format!("{minutes}:{seconds:02}.{fraction:03}")
}

async fn tag_track(sink_path: &Path, source_flac_path: &Path, sheet: &CueSheet, track: &CueTrack) -> Result<(), DriverError> {
    let artist = track.performer.clone().unwrap_or_else(|| sheet.performer.clone());
    let source_tags = crate::tags::read_source_tags(source_flac_path);
    let album = source_tags.album.unwrap_or_else(|| sheet.title.clone());

    let mut command = Command::new("metaflac");
    command
        .arg("--remove-tag=TITLE")
        .arg("--remove-tag=ARTIST")
        .arg("--remove-tag=ALBUM")
        .arg("--remove-tag=TRACKNUMBER")
        .arg(format!("--set-tag=TITLE={}", track.title))
        .arg(format!("--set-tag=ARTIST={artist}"))
        .arg(format!("--set-tag=ALBUM={album}"))
        .arg(format!("--set-tag=TRACKNUMBER={}", track.number))
        .arg(sink_path);
    run_checked(command, "metaflac").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sub_minute_time() {
        assert_eq!(format_flac_time(0), "0:00.000");
        assert_eq!(format_flac_time(1_234), "0:01.234");
    }

    #[test]
    fn formats_multi_minute_time() {
        assert_eq!(format_flac_time(3 * 60_000 + 12_500), "3:12.500");
    }

    #[test]
    fn track_duration_falls_back_to_album_end() {
        let sheet = CueSheet {
            title: "Album".to_string(),
            performer: "Artist".to_string(),
            tracks: vec![],
        };
        let track = CueTrack {
            number: 1,
            title: "Only Track".to_string(),
            performer: None,
            start_time_ms: 1_000,
            end_time_ms: None,
        };
        assert_eq!(track_duration_ms(&sheet, &track, 5_000), 4_000);
    }
}
