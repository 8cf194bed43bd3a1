//! Lazily derives a read-only directory tree from the source tree by
//! applying one of the two projection rules, without invoking any encoder.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::{CacheStore, ProbeResult};
use crate::cue::{self, CueSheet};
use crate::drivers::{BuildSource, Driver};
use crate::fingerprint::Fingerprint;
use crate::source::{SourceError, SourceIdentity};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source identity error: {0}")]
    Source(#[from] SourceError),
}

/// How a source tree turns into the derived tree; picked once per mounted
/// binary, never mixed.
#[derive(Debug, Clone, Copy)]
pub enum Projection {
    /// `.flac` + sibling `.cue` → a directory of per-track `.flac` files.
    SplitTrack,
    /// `.flac` → a single file with a different extension.
    Transcode { output_extension: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// What a resolved virtual path turns out to be.
#[derive(Debug, Clone)]
pub enum ProjectedEntry {
    Directory,
    /// A file the relevant driver must generate.
    Derived(BuildSource),
    /// A file whose bytes are the source bytes, unchanged.
    PassThrough(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DirListing {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub struct VirtualAttr {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
}

/// Internal resolution context: either a literal source directory, or the
/// exploded view of one `.flac`+`.cue` pair under `SplitTrack`.
enum Context {
    SourceDir(PathBuf),
    Album { flac_path: PathBuf, cue_path: PathBuf },
}

pub struct VirtualCatalog {
    source_root: PathBuf,
    driver: Arc<dyn Driver>,
    projection: Projection,
    non_audio_extensions: HashSet<String>,
    track_name_separator: String,
    size_memo: Mutex<HashMap<PathBuf, u64>>,
    cache: CacheStore,
}

impl VirtualCatalog {
    pub fn new(
        source_root: PathBuf,
        driver: Arc<dyn Driver>,
        projection: Projection,
        non_audio_extensions: Vec<String>,
        track_name_separator: String,
        cache: CacheStore,
    ) -> Self {
        VirtualCatalog {
            source_root,
            driver,
            projection,
            non_audio_extensions: non_audio_extensions.into_iter().map(|e| e.to_lowercase()).collect(),
            track_name_separator,
            size_memo: Mutex::new(HashMap::new()),
            cache,
        }
    }

    pub async fn lookup(&self, virtual_path: &Path) -> Result<ProjectedEntry, CatalogError> {
        let (ctx, leaf) = self.resolve_parent(virtual_path).await?;
        match leaf {
            None => Ok(ProjectedEntry::Directory),
            Some(name) => self.lookup_in_context(&ctx, &name).await,
        }
    }

    pub async fn readdir(&self, virtual_path: &Path) -> Result<Vec<DirListing>, CatalogError> {
        let ctx = self.resolve_full(virtual_path).await?;
        self.list_context(&ctx).await
    }

    pub async fn getattr(&self, virtual_path: &Path) -> Result<VirtualAttr, CatalogError> {
        let entry = self.lookup(virtual_path).await?;
        self.attr_for(virtual_path, &entry).await
    }

    /// Called by the filesystem adapter once a build completes, so the next
    /// `getattr` reports the true size instead of the estimate.
    pub async fn note_built(&self, virtual_path: &Path, true_size: u64) {
        let mut memo = self.size_memo.lock().await;
        memo.insert(virtual_path.to_path_buf(), true_size);
    }

    async fn attr_for(&self, virtual_path: &Path, entry: &ProjectedEntry) -> Result<VirtualAttr, CatalogError> {
        match entry {
            ProjectedEntry::Directory => {
                let source_dir = self.best_effort_source_dir(virtual_path);
                let meta = tokio::fs::metadata(&source_dir).await.ok();
                let mtime = meta.as_ref().and_then(|m| m.modified().ok()).unwrap_or(SystemTime::now());
                Ok(VirtualAttr {
                    kind: EntryKind::Directory,
                    size: 0,
                    mode: 0o555,
                    mtime,
                    ctime: mtime,
                    atime: mtime,
                })
            }
            ProjectedEntry::PassThrough(path) => {
                let meta = tokio::fs::metadata(path).await?;
                let mtime = meta.modified().unwrap_or(SystemTime::now());
                Ok(VirtualAttr {
                    kind: EntryKind::File,
                    size: meta.len(),
                    mode: 0o444,
                    mtime,
                    ctime: mtime,
                    atime: mtime,
                })
            }
            ProjectedEntry::Derived(source) => {
                let meta = tokio::fs::metadata(source.flac_path()).await?;
                let mtime = meta.modified().unwrap_or(SystemTime::now());

                let size = self.derived_size(virtual_path, source).await?;

                let identity = SourceIdentity::for_path(source.flac_path())?;
                let fp = Fingerprint::compute(
                    self.driver.id(),
                    self.driver.version_tag(),
                    &self.driver.fingerprint_parameters(source),
                    identity,
                );
                let atime = self.cache.last_access(fp).await.unwrap_or(mtime);

                Ok(VirtualAttr {
                    kind: EntryKind::File,
                    size,
                    mode: 0o444,
                    mtime,
                    ctime: mtime,
                    atime,
                })
            }
        }
    }

    async fn derived_size(&self, virtual_path: &Path, source: &BuildSource) -> Result<u64, CatalogError> {
        if let Some(size) = self.size_memo.lock().await.get(virtual_path).copied() {
            return Ok(size);
        }

        let identity = SourceIdentity::for_path(source.flac_path())?;
        let fp = Fingerprint::compute(
            self.driver.id(),
            self.driver.version_tag(),
            &self.driver.fingerprint_parameters(source),
            identity,
        );

        if let ProbeResult::Ready { len, .. } = self.cache.probe(fp).await {
            self.note_built(virtual_path, len).await;
            return Ok(len);
        }

        self.driver
            .estimate_size(source)
            .await
            .map_err(|e| CatalogError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    /// Best-effort path back to a literal directory for attribute purposes;
    /// exploded SplitTrack album directories have no literal counterpart, so
    /// their containing directory is used instead.
    fn best_effort_source_dir(&self, virtual_path: &Path) -> PathBuf {
        self.source_root.join(virtual_path)
    }

    async fn resolve_full(&self, virtual_path: &Path) -> Result<Context, CatalogError> {
        let (parent_ctx, leaf) = self.resolve_parent(virtual_path).await?;
        match leaf {
            None => Ok(parent_ctx),
            Some(name) => match self.lookup_in_context(&parent_ctx, &name).await? {
                ProjectedEntry::Directory => match &self.projection {
                    Projection::SplitTrack => {
                        // Only an album expansion can be a directory that
                        // isn't a literal source directory.
                        if let Some((flac_path, cue_path)) = self.album_pair_for(&parent_ctx, &name).await? {
                            Ok(Context::Album { flac_path, cue_path })
                        } else {
                            Ok(Context::SourceDir(self.child_source_dir(&parent_ctx, &name)))
                        }
                    }
                    Projection::Transcode { .. } => Ok(Context::SourceDir(self.child_source_dir(&parent_ctx, &name))),
                },
                _ => Err(CatalogError::NotFound(virtual_path.display().to_string())),
            },
        }
    }

    fn child_source_dir(&self, ctx: &Context, name: &str) -> PathBuf {
        match ctx {
            Context::SourceDir(dir) => dir.join(name),
            Context::Album { .. } => self.source_root.clone(),
        }
    }

    /// Walks every component of `virtual_path` except the last, returning
    /// the resolved context of the parent directory plus the final
    /// component (or `None` if `virtual_path` is the root).
    async fn resolve_parent(&self, virtual_path: &Path) -> Result<(Context, Option<String>), CatalogError> {
        let components: Vec<String> = virtual_path
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if components.is_empty() {
            return Ok((Context::SourceDir(self.source_root.clone()), None));
        }

        let mut ctx = Context::SourceDir(self.source_root.clone());
        for name in &components[..components.len() - 1] {
            ctx = match self.lookup_in_context(&ctx, name).await? {
                ProjectedEntry::Directory => match &self.projection {
                    Projection::SplitTrack => {
                        if let Some((flac_path, cue_path)) = self.album_pair_for(&ctx, name).await? {
                            Context::Album { flac_path, cue_path }
                        } else {
                            Context::SourceDir(self.child_source_dir(&ctx, name))
                        }
                    }
                    Projection::Transcode { .. } => Context::SourceDir(self.child_source_dir(&ctx, name)),
                },
                _ => return Err(CatalogError::NotFound(virtual_path.display().to_string())),
            };
        }

        Ok((ctx, components.last().cloned()))
    }

    /// If `name` (looked up inside `ctx`) names a `SplitTrack` album
    /// expansion, return its backing `.flac`/`.cue` pair.
    async fn album_pair_for(&self, ctx: &Context, name: &str) -> Result<Option<(PathBuf, PathBuf)>, CatalogError> {
        let Context::SourceDir(dir) = ctx else {
            return Ok(None);
        };
        let flac_path = dir.join(format!("{name}.flac"));
        let cue_path = dir.join(format!("{name}.cue"));
        if tokio::fs::metadata(&flac_path).await.is_ok() && tokio::fs::metadata(&cue_path).await.is_ok() {
            Ok(Some((flac_path, cue_path)))
        } else {
            Ok(None)
        }
    }

    async fn lookup_in_context(&self, ctx: &Context, name: &str) -> Result<ProjectedEntry, CatalogError> {
        let listing = self.list_context(ctx).await?;
        if !listing.iter().any(|e| e.name == name) {
            return Err(CatalogError::NotFound(name.to_string()));
        }

        match ctx {
            Context::Album { flac_path, cue_path } => {
                let sheet = parse_cue(cue_path).await?;
                let track_number = track_number_for_name(&sheet, &self.track_name_separator, name)
                    .ok_or_else(|| CatalogError::NotFound(name.to_string()))?;
                Ok(ProjectedEntry::Derived(BuildSource::CueTrack {
                    flac_path: flac_path.clone(),
                    cue_path: cue_path.clone(),
                    track_number,
                }))
            }
            Context::SourceDir(dir) => {
                let child_path = dir.join(name);
                let is_dir = tokio::fs::metadata(&child_path).await.map(|m| m.is_dir()).unwrap_or(false);

                if is_dir {
                    return Ok(ProjectedEntry::Directory);
                }

                match &self.projection {
                    Projection::SplitTrack => {
                        if self.album_pair_for(ctx, name).await?.is_some() {
                            return Ok(ProjectedEntry::Directory);
                        }
                        Ok(ProjectedEntry::PassThrough(child_path))
                    }
                    Projection::Transcode { output_extension } => {
                        if let Some(stem) = strip_extension(name, output_extension) {
                            let flac_path = dir.join(format!("{stem}.flac"));
                            if tokio::fs::metadata(&flac_path).await.is_ok() {
                                return Ok(ProjectedEntry::Derived(BuildSource::WholeFile { flac_path }));
                            }
                        }
                        Ok(ProjectedEntry::PassThrough(child_path))
                    }
                }
            }
        }
    }

    async fn list_context(&self, ctx: &Context) -> Result<Vec<DirListing>, CatalogError> {
        match ctx {
            Context::Album { cue_path, .. } => {
                let sheet = parse_cue(cue_path).await?;
                Ok(sheet
                    .tracks
                    .iter()
                    .map(|t| DirListing {
                        name: track_file_name(t, &self.track_name_separator),
                        kind: EntryKind::File,
                    })
                    .collect())
            }
            Context::SourceDir(dir) => self.list_source_dir(dir).await,
        }
    }

    async fn list_source_dir(&self, dir: &Path) -> Result<Vec<DirListing>, CatalogError> {
        let dir = dir.to_path_buf();
        let non_audio = self.non_audio_extensions.clone();
        let projection = self.projection;

        let raw_entries = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<(String, bool)>> {
            let mut out = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type()?.is_dir();
                out.push((name, is_dir));
            }
            Ok(out)
        })
        .await
        .expect("directory scan task panicked")?;

        let has_cue_sibling = |stem: &str| raw_entries.iter().any(|(n, is_dir)| !is_dir && n == &format!("{stem}.cue"));

        let mut listing = Vec::new();
        for (name, is_dir) in &raw_entries {
            if name.starts_with('.') || is_hidden(&non_audio, name) {
                continue;
            }

            if *is_dir {
                listing.push(DirListing {
                    name: name.clone(),
                    kind: EntryKind::Directory,
                });
                continue;
            }

            let ext = extension_of(name);
            if ext.as_deref() == Some("flac") {
                let stem = strip_extension(name, "flac").unwrap_or_else(|| name.clone());
                match projection {
                    Projection::SplitTrack => {
                        if has_cue_sibling(&stem) {
                            listing.push(DirListing {
                                name: stem,
                                kind: EntryKind::Directory,
                            });
                        } else {
                            listing.push(DirListing {
                                name: name.clone(),
                                kind: EntryKind::File,
                            });
                        }
                    }
                    Projection::Transcode { output_extension } => {
                        listing.push(DirListing {
                            name: format!("{stem}.{output_extension}"),
                            kind: EntryKind::File,
                        });
                    }
                }
            } else {
                listing.push(DirListing {
                    name: name.clone(),
                    kind: EntryKind::File,
                });
            }
        }

        Ok(listing)
    }
}

async fn parse_cue(cue_path: &Path) -> Result<CueSheet, CatalogError> {
    let cue_path = cue_path.to_path_buf();
    tokio::task::spawn_blocking(move || cue::parse_cue_file(&cue_path))
        .await
        .expect("cue parse task panicked")
        .map_err(|e| CatalogError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))
}

fn is_hidden(non_audio_extensions: &HashSet<String>, name: &str) -> bool {
    match extension_of(name) {
        Some(ext) => non_audio_extensions.contains(&ext),
        None => false,
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name).extension().map(|e| e.to_string_lossy().to_lowercase())
}

fn strip_extension(name: &str, ext: &str) -> Option<String> {
    name.strip_suffix(&format!(".{ext}")).map(|s| s.to_string())
}

fn track_file_name(track: &crate::cue::CueTrack, separator: &str) -> String {
    format!("{:02}{separator}{}.flac", track.number, sanitize_for_filename(&track.title))
}

fn track_number_for_name(sheet: &CueSheet, separator: &str, name: &str) -> Option<u32> {
    sheet
        .tracks
        .iter()
        .find(|t| track_file_name(t, separator) == name)
        .map(|t| t.number)
}

/// Replaces characters that are awkward or illegal in filenames (path
/// separators, control characters, and the handful of glyphs that trip up
/// FAT/NTFS-formatted external drives this derived tree is often copied
/// onto) with `_`.
fn sanitize_for_filename(input: &str) -> String {
    static UNSAFE_CHARS: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = UNSAFE_CHARS.get_or_init(|| Regex::new(r#"[/\\:\*\?"<>\|\x00-\x1f]"#).unwrap());
    re.replace_all(input, "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::drivers::DriverError;
    use tempfile::TempDir;

    struct FakeDriver;

    #[async_trait]
    impl Driver for FakeDriver {
        fn id(&self) -> &'static str {
            "fake"
        }
        fn version_tag(&self) -> &'static str {
            "v1"
        }
        fn fingerprint_parameters(&self, _source: &BuildSource) -> Vec<u8> {
            Vec::new()
        }
        async fn estimate_size(&self, _source: &BuildSource) -> Result<u64, DriverError> {
            Ok(1234)
        }
        async fn run_to_sink(&self, _source: &BuildSource, sink_path: &Path) -> Result<(), DriverError> {
            tokio::fs::write(sink_path, b"x").await?;
            Ok(())
        }
    }

    async fn setup_transcode(dir: &TempDir) -> (VirtualCatalog, PathBuf) {
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join("Track.flac"), b"not really flac").await.unwrap();
        tokio::fs::write(root.join("liner.jpg"), b"image").await.unwrap();
        let cache = CacheStore::open(root.join(".cache")).await.unwrap();
        let catalog = VirtualCatalog::new(
            root.clone(),
            Arc::new(FakeDriver),
            Projection::Transcode { output_extension: "mp3" },
            vec!["jpg".to_string(), "cache".to_string()],
            " - ".to_string(),
            cache,
        );
        (catalog, root)
    }

    #[tokio::test]
    async fn transcode_projects_flac_to_configured_extension() {
        let dir = TempDir::new().unwrap();
        let (catalog, _root) = setup_transcode(&dir).await;

        let listing = catalog.readdir(Path::new("")).await.unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.clone()).collect();
        assert!(names.contains(&"Track.mp3".to_string()));
        assert!(!names.contains(&"liner.jpg".to_string()));
    }

    #[tokio::test]
    async fn transcode_lookup_resolves_to_derived_entry() {
        let dir = TempDir::new().unwrap();
        let (catalog, root) = setup_transcode(&dir).await;

        let entry = catalog.lookup(Path::new("Track.mp3")).await.unwrap();
        match entry {
            ProjectedEntry::Derived(BuildSource::WholeFile { flac_path }) => {
                assert_eq!(flac_path, root.join("Track.flac"));
            }
            other => panic!("expected derived whole-file entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn split_track_expands_cue_paired_flac_into_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join("Album.flac"), b"not really flac").await.unwrap();
        tokio::fs::write(
            root.join("Album.cue"),
            b"PERFORMER \"Band\"\nTITLE \"Album\"\nFILE \"Album.flac\" WAVE\n  TRACK 01 AUDIO\n    TITLE \"One\"\n    INDEX 01 00:00:00\n  TRACK 02 AUDIO\n    TITLE \"Two\"\n    INDEX 01 02:00:00\n",
        )
        .await
        .unwrap();

        let cache = CacheStore::open(root.join(".cache")).await.unwrap();
        let catalog = VirtualCatalog::new(
            root.clone(),
            Arc::new(FakeDriver),
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
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].name, "01 - One.flac");
        assert_eq!(tracks[1].name, "02 - Two.flac");

        let entry = catalog.lookup(Path::new("Album/01 - One.flac")).await.unwrap();
        match entry {
            ProjectedEntry::Derived(BuildSource::CueTrack { track_number, .. }) => assert_eq!(track_number, 1),
            other => panic!("expected cue track entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn estimated_size_is_replaced_after_note_built() {
        let dir = TempDir::new().unwrap();
        let (catalog, _root) = setup_transcode(&dir).await;

        let attr_before = catalog.getattr(Path::new("Track.mp3")).await.unwrap();
        assert_eq!(attr_before.size, 1234);

        catalog.note_built(Path::new("Track.mp3"), 9000).await;
        let attr_after = catalog.getattr(Path::new("Track.mp3")).await.unwrap();
        assert_eq!(attr_after.size, 9000);
    }
}
