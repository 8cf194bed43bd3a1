//! The cache store: a flat directory of content-addressed derived files.
//!
//! Metadata (length, last-access, pin count, state) lives in memory and is
//! seeded lazily from `stat` of each cache file; publication is a single
//! rename within the cache directory, so a reader never observes a
//! half-written file (it only ever opens entries already reported `ready`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::fingerprint::Fingerprint;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("entry for {0} is already building or ready")]
    AlreadyReserved(Fingerprint),
    #[error("entry for {0} is not ready")]
    NotReady(Fingerprint),
    #[error("entry for {0} is pinned and cannot be evicted")]
    Pinned(Fingerprint),
    #[error("no such entry: {0}")]
    NoSuchEntry(Fingerprint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Building,
    Ready,
    Evicting,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    state: EntryState,
    path: PathBuf,
    size_bytes: u64,
    last_access: SystemTime,
    pin_count: u32,
}

/// Result of [`CacheStore::probe`].
#[derive(Debug, Clone)]
pub enum ProbeResult {
    Absent,
    Building,
    Ready { path: PathBuf, len: u64 },
}

/// Exclusive ownership of a not-yet-promoted cache file.
///
/// Returned by [`CacheStore::reserve`]; must be consumed by exactly one of
/// [`CacheStore::promote`] or [`CacheStore::abandon`].
#[derive(Debug)]
pub struct BuildSlot {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
}

/// A pinned, readable reference to a ready entry.
///
/// Must be consumed by [`CacheStore::release`] once the caller is done
/// reading, or the entry can never be evicted (I3).
#[derive(Debug)]
pub struct CacheHandle {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub len: u64,
}

/// A ready entry as seen by the size maintainer's eviction scan.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_access: SystemTime,
    pub pinned: bool,
}

struct Inner {
    cache_dir: PathBuf,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    process_nonce: u64,
    slot_counter: AtomicU64,
}

/// On-disk, size-bounded, content-addressed store of derived files.
#[derive(Clone)]
pub struct CacheStore(Arc<Inner>);

impl CacheStore {
    /// Open (or create) a cache store rooted at `cache_dir`.
    ///
    /// Leftover `.partial-*` files from a previous crashed process are
    /// unlinked: no build ticket exists to own them, so they can never be
    /// promoted and are dead weight.
    pub async fn open(cache_dir: PathBuf) -> Result<Self, CacheError> {
        fs::create_dir_all(&cache_dir).await?;

        let mut entries = HashMap::new();
        let mut read_dir = fs::read_dir(&cache_dir).await?;
        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.contains(".partial-") {
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("CacheStore: failed to remove stale partial file {}: {}", path.display(), e);
                } else {
                    info!("CacheStore: removed stale partial file {}", path.display());
                }
                continue;
            }

            let Some(fingerprint) = parse_fingerprint_filename(name) else {
                continue;
            };

            match dir_entry.metadata().await {
                Ok(meta) => {
                    entries.insert(
                        fingerprint,
                        CacheEntry {
                            state: EntryState::Ready,
                            path,
                            size_bytes: meta.len(),
                            last_access: meta.accessed().unwrap_or(SystemTime::now()),
                            pin_count: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!("CacheStore: failed to stat {}: {}", path.display(), e);
                }
            }
        }

        info!("CacheStore: loaded {} ready entries from {}", entries.len(), cache_dir.display());

        Ok(CacheStore(Arc::new(Inner {
            cache_dir,
            entries: Mutex::new(entries),
            process_nonce: rand::random(),
            slot_counter: AtomicU64::new(0),
        })))
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.0.cache_dir
    }

    pub async fn probe(&self, fp: Fingerprint) -> ProbeResult {
        let entries = self.0.entries.lock().await;
        match entries.get(&fp) {
            None => ProbeResult::Absent,
            Some(e) if e.state == EntryState::Building => ProbeResult::Building,
            Some(e) if e.state == EntryState::Ready => ProbeResult::Ready {
                path: e.path.clone(),
                len: e.size_bytes,
            },
            // `evicting` is a transient in-lock state; from a caller's
            // perspective it is indistinguishable from `absent`.
            Some(_) => ProbeResult::Absent,
        }
    }

    /// Atomically transition `absent -> building` and hand back an exclusive
    /// writer path. Fails if a concurrent reserver already won the race.
    pub async fn reserve(&self, fp: Fingerprint) -> Result<BuildSlot, CacheError> {
        let mut entries = self.0.entries.lock().await;
        if entries.contains_key(&fp) {
            return Err(CacheError::AlreadyReserved(fp));
        }

        let nonce = self.0.slot_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .0
            .cache_dir
            .join(format!("{}.partial-{:x}-{}", fp, self.0.process_nonce, nonce));

        entries.insert(
            fp,
            CacheEntry {
                state: EntryState::Building,
                path: temp_path.clone(),
                size_bytes: 0,
                last_access: SystemTime::now(),
                pin_count: 0,
            },
        );

        debug!("CacheStore: reserved build slot for {} at {}", fp, temp_path.display());
        Ok(BuildSlot {
            fingerprint: fp,
            path: temp_path,
        })
    }

    /// Rename the finished temp file into place and transition to `ready`.
    pub async fn promote(&self, slot: BuildSlot) -> Result<(PathBuf, u64), CacheError> {
        let meta = fs::metadata(&slot.path).await?;
        let final_path = self.0.cache_dir.join(slot.fingerprint.to_hex());

        fs::rename(&slot.path, &final_path).await?;

        let mut entries = self.0.entries.lock().await;
        entries.insert(
            slot.fingerprint,
            CacheEntry {
                state: EntryState::Ready,
                path: final_path.clone(),
                size_bytes: meta.len(),
                last_access: SystemTime::now(),
                pin_count: 0,
            },
        );

        info!("CacheStore: promoted {} ({} bytes)", slot.fingerprint, meta.len());
        Ok((final_path, meta.len()))
    }

    /// Unlink the partial file and return the entry to `absent`.
    pub async fn abandon(&self, slot: BuildSlot) -> Result<(), CacheError> {
        if let Err(e) = fs::remove_file(&slot.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("CacheStore: failed to remove abandoned partial {}: {}", slot.path.display(), e);
            }
        }
        let mut entries = self.0.entries.lock().await;
        entries.remove(&slot.fingerprint);
        debug!("CacheStore: abandoned build slot for {}", slot.fingerprint);
        Ok(())
    }

    /// Pin a ready entry and hand back a readable handle.
    pub async fn acquire(&self, fp: Fingerprint) -> Result<CacheHandle, CacheError> {
        let mut entries = self.0.entries.lock().await;
        let entry = entries.get_mut(&fp).ok_or(CacheError::NotReady(fp))?;
        if entry.state != EntryState::Ready {
            return Err(CacheError::NotReady(fp));
        }
        entry.pin_count += 1;
        entry.last_access = SystemTime::now();
        Ok(CacheHandle {
            fingerprint: fp,
            path: entry.path.clone(),
            len: entry.size_bytes,
        })
    }

    /// Release one unit of pin held by `handle`.
    pub async fn release(&self, handle: CacheHandle) {
        let mut entries = self.0.entries.lock().await;
        if let Some(entry) = entries.get_mut(&handle.fingerprint) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }

    /// Evict a ready, unpinned entry. Fails if it is pinned or not ready.
    pub async fn evict(&self, fp: Fingerprint) -> Result<(), CacheError> {
        let path = {
            let mut entries = self.0.entries.lock().await;
            let entry = entries.get_mut(&fp).ok_or(CacheError::NoSuchEntry(fp))?;
            if entry.state != EntryState::Ready {
                return Err(CacheError::NoSuchEntry(fp));
            }
            if entry.pin_count > 0 {
                return Err(CacheError::Pinned(fp));
            }
            entry.state = EntryState::Evicting;
            entry.path.clone()
        };

        // Unlink happens outside the lock.
        fs::remove_file(&path).await?;

        let mut entries = self.0.entries.lock().await;
        entries.remove(&fp);
        Ok(())
    }

    /// Last-access time of a ready entry, for `atime` reporting. `None` if
    /// the entry is not `ready`.
    pub async fn last_access(&self, fp: Fingerprint) -> Option<SystemTime> {
        let entries = self.0.entries.lock().await;
        entries
            .get(&fp)
            .filter(|e| e.state == EntryState::Ready)
            .map(|e| e.last_access)
    }

    /// Total bytes held by `ready` entries.
    pub async fn ready_bytes(&self) -> u64 {
        let entries = self.0.entries.lock().await;
        entries
            .values()
            .filter(|e| e.state == EntryState::Ready)
            .map(|e| e.size_bytes)
            .sum()
    }

    /// Snapshot of all `ready` entries, for the size maintainer's scan.
    pub async fn ready_entries(&self) -> Vec<EntrySnapshot> {
        let entries = self.0.entries.lock().await;
        entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Ready)
            .map(|(fp, e)| EntrySnapshot {
                fingerprint: *fp,
                path: e.path.clone(),
                size_bytes: e.size_bytes,
                last_access: e.last_access,
                pinned: e.pin_count > 0,
            })
            .collect()
    }
}

fn parse_fingerprint_filename(name: &str) -> Option<Fingerprint> {
    if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(name, &mut bytes).ok()?;
    Some(Fingerprint::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceIdentity;
    use tempfile::TempDir;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::compute(
            "test",
            "v1",
            &n.to_le_bytes(),
            SourceIdentity {
                device: 1,
                inode: 1,
                mtime_nanos: 1,
                size: n,
            },
        )
    }

    #[tokio::test]
    async fn cold_reserve_promote_acquire_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
        let f = fp(1);

        assert!(matches!(store.probe(f).await, ProbeResult::Absent));

        let slot = store.reserve(f).await.unwrap();
        assert!(matches!(store.probe(f).await, ProbeResult::Building));

        fs::write(&slot.path, b"hello").await.unwrap();
        let (path, len) = store.promote(slot).await.unwrap();
        assert_eq!(len, 5);
        assert!(path.exists());

        match store.probe(f).await {
            ProbeResult::Ready { len, .. } => assert_eq!(len, 5),
            other => panic!("expected Ready, got {other:?}"),
        }

        let handle = store.acquire(f).await.unwrap();
        assert_eq!(handle.len, 5);
        store.release(handle).await;
    }

    #[tokio::test]
    async fn reserve_twice_loses_race() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
        let f = fp(2);

        let _slot = store.reserve(f).await.unwrap();
        let err = store.reserve(f).await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyReserved(_)));
    }

    #[tokio::test]
    async fn abandon_returns_to_absent() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
        let f = fp(3);

        let slot = store.reserve(f).await.unwrap();
        fs::write(&slot.path, b"partial").await.unwrap();
        store.abandon(slot).await.unwrap();

        assert!(matches!(store.probe(f).await, ProbeResult::Absent));
        // reserve should succeed again
        let slot2 = store.reserve(f).await.unwrap();
        store.abandon(slot2).await.unwrap();
    }

    #[tokio::test]
    async fn evict_refuses_pinned_entry() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
        let f = fp(4);

        let slot = store.reserve(f).await.unwrap();
        fs::write(&slot.path, b"data").await.unwrap();
        store.promote(slot).await.unwrap();

        let handle = store.acquire(f).await.unwrap();
        let err = store.evict(f).await.unwrap_err();
        assert!(matches!(err, CacheError::Pinned(_)));

        store.release(handle).await;
        store.evict(f).await.unwrap();
        assert!(matches!(store.probe(f).await, ProbeResult::Absent));
    }

    #[tokio::test]
    async fn startup_recovery_removes_stale_partials_and_loads_ready() {
        let dir = TempDir::new().unwrap();
        let f = fp(5);
        fs::write(dir.path().join(format!("{}.partial-dead-0", f)), b"stale")
            .await
            .unwrap();
        fs::write(dir.path().join(f.to_hex()), b"ready-bytes")
            .await
            .unwrap();

        let store = CacheStore::open(dir.path().to_path_buf()).await.unwrap();

        match store.probe(f).await {
            ProbeResult::Ready { len, .. } => assert_eq!(len, 11),
            other => panic!("expected Ready, got {other:?}"),
        }

        let mut read_dir = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = read_dir.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert!(!names.iter().any(|n| n.contains(".partial-")));
    }
}
