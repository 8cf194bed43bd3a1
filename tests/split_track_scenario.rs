//! End-to-end check that a 4-track CUE sheet projects into a virtual
//! directory whose entries are correctly named and whose track time ranges,
//! taken from the CUE sheet, are strictly increasing, non-overlapping, and
//! cover the whole synthetic source file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use audiofs::catalog::{EntryKind, Projection, VirtualCatalog};
use audiofs::cue;
use audiofs::drivers::{BuildSource, Driver, DriverError};
use audiofs::flac_meta;

struct UnusedDriver;

#[async_trait]
impl Driver for UnusedDriver {
    fn id(&self) -> &'static str {
        "unused"
    }
    fn version_tag(&self) -> &'static str {
        "v1"
    }
    fn fingerprint_parameters(&self, _source: &BuildSource) -> Vec<u8> {
        Vec::new()
    }
    async fn estimate_size(&self, _source: &BuildSource) -> Result<u64, DriverError> {
        Ok(0)
    }
    async fn run_to_sink(&self, _source: &BuildSource, _sink_path: &Path) -> Result<(), DriverError> {
        panic!("enumeration alone must never invoke the driver");
    }
}

fn synthetic_flac(sample_rate: u32, total_samples: u64) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(b"fLaC");

    let header: u32 = 0x8000_0000 | 34u32;
    data.extend_from_slice(&header.to_be_bytes());
    data.extend_from_slice(&[0u8; 10]);

    let channels: u32 = 2;
    let bits_per_sample: u32 = 16;
    let sample_rate_bits = (sample_rate & 0xF_FFFF) << 4;
    let channels_bits = ((channels - 1) & 0x07) << 1;
    let bps_high_bit = ((bits_per_sample - 1) >> 4) & 0x01;
    let word = sample_rate_bits | channels_bits | bps_high_bit;
    data.extend_from_slice(&word.to_be_bytes()[1..4]);

    let bps_low_4 = (((bits_per_sample - 1) as u8) & 0x0F) << 4;
    let total_samples_high_4 = ((total_samples >> 32) & 0x0F) as u8;
    data.push(bps_low_4 | total_samples_high_4);

    let low_32 = (total_samples & 0xFFFF_FFFF) as u32;
    data.extend_from_slice(&low_32.to_be_bytes());
    data.extend_from_slice(&[0u8; 16]);

    data
}

#[tokio::test]
async fn four_track_album_expands_with_contiguous_non_overlapping_ranges() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();

    let sample_rate = 44_100;
    let total_seconds = 12 * 60; // a 12-minute album, four 3-minute tracks
    let total_samples = sample_rate as u64 * total_seconds as u64;
    tokio::fs::write(root.join("Album.flac"), synthetic_flac(sample_rate, total_samples))
        .await
        .unwrap();

    let cue_body = r#"PERFORMER "Four Piece"
TITLE "Quarters"
FILE "Album.flac" WAVE
  TRACK 01 AUDIO
    TITLE "First"
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    TITLE "Second"
    INDEX 01 03:00:00
  TRACK 03 AUDIO
    TITLE "Third"
    INDEX 01 06:00:00
  TRACK 04 AUDIO
    TITLE "Fourth"
    INDEX 01 09:00:00
"#;
    tokio::fs::write(root.join("Album.cue"), cue_body).await.unwrap();

    let cache = audiofs::cache::CacheStore::open(root.join(".cache")).await.unwrap();
    let catalog = VirtualCatalog::new(
        root.clone(),
        Arc::new(UnusedDriver),
        Projection::SplitTrack,
        vec!["cue".to_string(), "cache".to_string()],
        " - ".to_string(),
        cache,
    );

    let top = catalog.readdir(Path::new("")).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].name, "Album");
    assert_eq!(top[0].kind, EntryKind::Directory);

    let tracks = catalog.readdir(Path::new("Album")).await.unwrap();
    assert_eq!(tracks.len(), 4);
    let expected_names = ["01 - First.flac", "02 - Second.flac", "03 - Third.flac", "04 - Fourth.flac"];
    for (entry, expected) in tracks.iter().zip(expected_names.iter()) {
        assert_eq!(&entry.name, expected);
        assert_eq!(entry.kind, EntryKind::File);
    }

    let sheet = cue::parse_cue_file(&root.join("Album.cue")).unwrap();
    assert_eq!(sheet.tracks.len(), 4);

    let headers = flac_meta::read_headers(&root.join("Album.flac")).unwrap();
    let album_duration_ms = headers.stream_info.duration_ms();

    let mut previous_end = 0u64;
    for track in &sheet.tracks {
        assert_eq!(track.start_time_ms, previous_end, "track {} must start exactly where the previous one ended", track.number);
        let end = track.end_time_ms.unwrap_or(album_duration_ms);
        assert!(end > track.start_time_ms, "track {} must have positive duration", track.number);
        previous_end = end;
    }
    assert_eq!(previous_end, album_duration_ms, "tracks must cover the whole file with no gap at the end");
}
