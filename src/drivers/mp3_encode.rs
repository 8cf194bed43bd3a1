//! Transcodes a whole FLAC file to MP3 by piping the system `flac` decoder
//! into `lame`, then stamps the result with ID3v2 tags read from the source.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{BuildSource, Driver, DriverError};

pub struct Mp3EncodeDriver {
    pub bitrate_kbps: u32,
}

#[async_trait]
impl Driver for Mp3EncodeDriver {
    fn id(&self) -> &'static str {
        "mp3encode"
    }

    fn version_tag(&self) -> &'static str {
        "v1"
    }

    fn fingerprint_parameters(&self, _source: &BuildSource) -> Vec<u8> {
        self.bitrate_kbps.to_le_bytes().to_vec()
    }

    async fn estimate_size(&self, source: &BuildSource) -> Result<u64, DriverError> {
        let duration_ms = duration_ms_of(source.flac_path()).await?;
        let bits_per_ms = self.bitrate_kbps as u128 * 1000 / 1000;
        let estimated_bytes = (bits_per_ms * duration_ms as u128) / 8;
        let tag_bytes = estimated_id3_bytes(source.flac_path());
        // Container overhead and VBR-adjacent padding from lame, plus the
        // ID3v2 tag prepended after encoding (`write_tags`, below); a long
        // comment field would otherwise push the real file past a bare
        // bitrate-only estimate.
        Ok((estimated_bytes as u64).saturating_mul(102) / 100 + 4096 + tag_bytes)
    }

    async fn run_to_sink(&self, source: &BuildSource, sink_path: &Path) -> Result<(), DriverError> {
        let flac_path = source.flac_path().to_path_buf();
        let bitrate = self.bitrate_kbps;

        let mut decode = Command::new("flac")
            .arg("--silent")
            .arg("--decode")
            .arg("--stdout")
            .arg(&flac_path)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::ProcessFailed {
                program: "flac".to_string(),
                detail: e.to_string(),
            })?;

        let decode_stdout = decode.stdout.take().expect("flac stdout was piped");

        let mut encode = Command::new("lame")
            .arg("--silent")
            .arg("--cbr")
            .arg("-b")
            .arg(bitrate.to_string())
            .arg("-")
            .arg(sink_path)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::ProcessFailed {
                program: "lame".to_string(),
                detail: e.to_string(),
            })?;

        let mut encode_stdin = encode.stdin.take().expect("lame stdin was piped");

        let copy_task = tokio::spawn(async move {
            let mut reader = decode_stdout;
            tokio::io::copy(&mut reader, &mut encode_stdin).await?;
            encode_stdin.shutdown().await
        });

        let decode_status = decode.wait().await.map_err(|e| DriverError::ProcessFailed {
            program: "flac".to_string(),
            detail: e.to_string(),
        })?;
        copy_task.await.expect("pipe copy task panicked").map_err(|e| DriverError::ProcessFailed {
            program: "flac|lame pipe".to_string(),
            detail: e.to_string(),
        })?;
        let encode_status = encode.wait().await.map_err(|e| DriverError::ProcessFailed {
            program: "lame".to_string(),
            detail: e.to_string(),
        })?;

        if !decode_status.success() {
            return Err(DriverError::ProcessFailed {
                program: "flac".to_string(),
                detail: format!("exit status {:?}", decode_status.code()),
            });
        }
        if !encode_status.success() {
            return Err(DriverError::ProcessFailed {
                program: "lame".to_string(),
                detail: format!("exit status {:?}", encode_status.code()),
            });
        }

        write_tags(&flac_path, sink_path).await
    }
}

async fn duration_ms_of(flac_path: &Path) -> Result<u64, DriverError> {
    let headers = crate::flac_meta::read_headers(flac_path)?;
    Ok(headers.stream_info.duration_ms())
}

/// Upper bound on the ID3v2 tag `write_tags` will prepend, from the same
/// source tag text `write_tags` itself reads. Doubled for UTF-16 frame
/// encoding and padded for per-frame headers, so a source with a long
/// comment field can never push the real file past this estimate.
fn estimated_id3_bytes(flac_path: &Path) -> u64 {
    let tags = crate::tags::read_source_tags(flac_path);
    let text_len: usize = [
        tags.title.as_deref(),
        tags.artist.as_deref(),
        tags.album.as_deref(),
        tags.track_number.as_deref(),
        tags.date.as_deref(),
        tags.genre.as_deref(),
        tags.comment.as_deref(),
    ]
    .iter()
    .filter_map(|f| *f)
    .map(|s| s.len())
    .sum();

    (text_len as u64).saturating_mul(2) + 512
}

async fn write_tags(flac_path: &Path, mp3_path: &Path) -> Result<(), DriverError> {
    let flac_path = flac_path.to_path_buf();
    let mp3_path = mp3_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), DriverError> {
        let source_tags = crate::tags::read_source_tags(&flac_path);

        let mut tag = id3::Tag::new();
        if let Some(title) = source_tags.title {
            tag.set_title(title);
        }
        if let Some(artist) = source_tags.artist {
            tag.set_artist(artist);
        }
        if let Some(album) = source_tags.album {
            tag.set_album(album);
        }
        if let Some(track) = source_tags.track_number.and_then(|t| t.parse::<u32>().ok()) {
            tag.set_track(track);
        }
        if let Some(date) = source_tags.date.and_then(|d| d.parse::<i32>().ok()) {
            tag.set_year(date);
        }
        if let Some(genre) = source_tags.genre {
            tag.set_genre(genre);
        }
        if let Some(comment) = source_tags.comment {
            tag.add_frame(id3::frame::Comment {
                lang: "eng".to_string(),
                description: String::new(),
                text: comment,
            });
        }

        tag.write_to_path(&mp3_path, id3::Version::Id3v24)
            .map_err(|e| DriverError::Tag(e.to_string()))
    })
    .await
    .expect("tag write task panicked")
}
