//! Periodically evicts least-recently-used, unpinned cache entries to keep
//! the store under its configured byte budget.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::fingerprint::Fingerprint;

/// Runs the eviction sweep on a fixed interval.
pub struct SizeMaintainer {
    cache: CacheStore,
    budget_bytes: u64,
    min_evictable_size_bytes: u64,
    sweep_interval: Duration,
    excluded: HashSet<Fingerprint>,
    eviction_log_path: Option<PathBuf>,
}

impl SizeMaintainer {
    pub fn new(cache: CacheStore, budget_bytes: u64, min_evictable_size_bytes: u64) -> Self {
        SizeMaintainer {
            cache,
            budget_bytes,
            min_evictable_size_bytes,
            sweep_interval: Duration::from_secs(30),
            excluded: HashSet::new(),
            eviction_log_path: None,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_eviction_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.eviction_log_path = path;
        self
    }

    /// A fingerprint the maintainer must never evict, e.g. an entry a
    /// currently-open file handle depends on beyond its pin window.
    pub fn exclude(&mut self, fp: Fingerprint) {
        self.excluded.insert(fp);
    }

    pub fn unexclude(&mut self, fp: &Fingerprint) {
        self.excluded.remove(fp);
    }

    /// Run the sweep loop forever; intended to be spawned as its own task.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    /// One eviction pass: evict LRU-by-`last_access` ready, unpinned,
    /// non-excluded entries until under budget or nothing more can be
    /// evicted without dropping below `min_evictable_size_bytes` of slack.
    pub async fn sweep_once(&self) {
        let ready_bytes = self.cache.ready_bytes().await;
        if ready_bytes <= self.budget_bytes {
            return;
        }

        let mut candidates: Vec<_> = self
            .cache
            .ready_entries()
            .await
            .into_iter()
            .filter(|e| !e.pinned && !self.excluded.contains(&e.fingerprint))
            .collect();
        candidates.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.fingerprint.to_hex().cmp(&b.fingerprint.to_hex()))
        });

        let mut freed = 0u64;
        let target_excess = ready_bytes.saturating_sub(self.budget_bytes);

        for candidate in candidates {
            if freed >= target_excess {
                break;
            }
            if candidate.size_bytes < self.min_evictable_size_bytes {
                continue;
            }

            match self.cache.evict(candidate.fingerprint).await {
                Ok(()) => {
                    freed += candidate.size_bytes;
                    self.log_eviction(&candidate.fingerprint, candidate.size_bytes, candidate.last_access)
                        .await;
                }
                Err(e) => {
                    warn!(fingerprint = %candidate.fingerprint, error = %e, "maintainer: eviction attempt failed");
                }
            }
        }

        info!(target: "audiofs::maintainer", freed_bytes = freed, remaining_excess = target_excess.saturating_sub(freed), "maintainer: sweep complete");
    }

    async fn log_eviction(&self, fp: &Fingerprint, size_bytes: u64, last_access: std::time::SystemTime) {
        let age_secs = std::time::SystemTime::now()
            .duration_since(last_access)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        info!(target: "audiofs::maintainer::eviction", fingerprint = %fp, size_bytes, age_secs, "evicted");

        if let Some(path) = &self.eviction_log_path {
            let line = format!("{} {} {} age={}s\n", humantime_now(), fp, size_bytes, age_secs);
            if let Err(e) = append_line(path, &line).await {
                warn!(error = %e, "maintainer: failed to write eviction log");
            }
        }
    }
}

/// `%Y-%m-%dT%H:%M:%SZ`-shaped timestamp without pulling in a datetime
/// crate just for this one log line; good enough for a human skimming an
/// eviction log, not meant for machine parsing.
fn humantime_now() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("t+{secs}s")
}

async fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await
}
