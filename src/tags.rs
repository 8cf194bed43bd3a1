//! Reads the metadata tags already attached to a source FLAC file, so
//! derived MP3/Ogg files inherit title/artist/album instead of arriving
//! untagged.

use std::path::Path;

use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

#[derive(Debug, Clone, Default)]
pub struct SourceTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track_number: Option<String>,
    pub date: Option<String>,
    pub genre: Option<String>,
    pub comment: Option<String>,
}

/// Best-effort tag read; any failure to open or probe the file just yields
/// an empty tag set rather than failing the whole build.
pub fn read_source_tags(flac_path: &Path) -> SourceTags {
    let mut tags = SourceTags::default();

    let file = match std::fs::File::open(flac_path) {
        Ok(f) => f,
        Err(_) => return tags,
    };
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("flac");

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(_) => return tags,
    };

    let mut format = probed.format;
    if let Some(revision) = format.metadata().current() {
        apply_revision(&mut tags, revision);
    }

    tags
}

fn apply_revision(tags: &mut SourceTags, revision: &symphonia::core::meta::MetadataRevision) {
    for tag in revision.tags() {
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => tags.title = Some(tag.value.to_string()),
            Some(StandardTagKey::Artist) => tags.artist = Some(tag.value.to_string()),
            Some(StandardTagKey::Album) => tags.album = Some(tag.value.to_string()),
            Some(StandardTagKey::TrackNumber) => tags.track_number = Some(tag.value.to_string()),
            Some(StandardTagKey::Date) => tags.date = Some(tag.value.to_string()),
            Some(StandardTagKey::Genre) => tags.genre = Some(tag.value.to_string()),
            Some(StandardTagKey::Comment) => tags.comment = Some(tag.value.to_string()),
            _ => {}
        }
    }
}
