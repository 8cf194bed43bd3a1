//! Transcodes a whole FLAC file to Ogg Vorbis by piping the system `flac`
//! decoder into `oggenc`. Unlike the MP3 path, `oggenc` accepts Vorbis
//! comment fields directly as flags, so there is no separate tag-writing
//! pass.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::tags::read_source_tags;

use super::{BuildSource, Driver, DriverError};

pub struct OggEncodeDriver {
    pub bitrate_kbps: u32,
}

#[async_trait]
impl Driver for OggEncodeDriver {
    fn id(&self) -> &'static str {
        "oggencode"
    }

    fn version_tag(&self) -> &'static str {
        "v1"
    }

    fn fingerprint_parameters(&self, _source: &BuildSource) -> Vec<u8> {
        self.bitrate_kbps.to_le_bytes().to_vec()
    }

    async fn estimate_size(&self, source: &BuildSource) -> Result<u64, DriverError> {
        let headers = crate::flac_meta::read_headers(source.flac_path())?;
        let duration_ms = headers.stream_info.duration_ms();
        let estimated_bytes = (self.bitrate_kbps as u128 * duration_ms as u128) / 8;
        // Vorbis framing overhead; oggenc's nominal-bitrate target is an
        // average, so pad further than the MP3 path's fixed-bitrate case.
        Ok((estimated_bytes as u64).saturating_mul(108) / 100 + 8192)
    }

    async fn run_to_sink(&self, source: &BuildSource, sink_path: &Path) -> Result<(), DriverError> {
        let flac_path = source.flac_path().to_path_buf();
        let tags = read_source_tags(&flac_path);
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

        let mut encode_command = Command::new("oggenc");
        encode_command
            .arg("--quiet")
            .arg("-b")
            .arg(bitrate.to_string())
            .arg("-o")
            .arg(sink_path);
        if let Some(title) = &tags.title {
            encode_command.arg("--title").arg(title);
        }
        if let Some(artist) = &tags.artist {
            encode_command.arg("--artist").arg(artist);
        }
        if let Some(album) = &tags.album {
            encode_command.arg("--album").arg(album);
        }
        if let Some(track) = &tags.track_number {
            encode_command.arg("--tracknum").arg(track);
        }
        if let Some(date) = &tags.date {
            encode_command.arg("--date").arg(date);
        }
        if let Some(genre) = &tags.genre {
            encode_command.arg("--genre").arg(genre);
        }
        if let Some(comment) = &tags.comment {
            encode_command.arg("--comment").arg(format!("COMMENT={comment}"));
        }
        encode_command.arg("-").stdin(Stdio::piped());

        let mut encode = encode_command.spawn().map_err(|e| DriverError::ProcessFailed {
            program: "oggenc".to_string(),
            detail: e.to_string(),
        })?;

        let mut encode_stdin = encode.stdin.take().expect("oggenc stdin was piped");

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
            program: "flac|oggenc pipe".to_string(),
            detail: e.to_string(),
        })?;
        let encode_status = encode.wait().await.map_err(|e| DriverError::ProcessFailed {
            program: "oggenc".to_string(),
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
                program: "oggenc".to_string(),
                detail: format!("exit status {:?}", encode_status.code()),
            });
        }

        Ok(())
    }
}
