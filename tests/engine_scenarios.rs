//! Cross-module scenarios exercising the cache store, build coordinator, and
//! size maintainer together, since driving a real kernel FUSE mount is
//! outside what a hermetic test suite can assume.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use audiofs::cache::{CacheStore, ProbeResult};
use audiofs::coordinator::BuildCoordinator;
use audiofs::drivers::{BuildSource, Driver, DriverError};
use audiofs::fingerprint::Fingerprint;
use audiofs::maintainer::SizeMaintainer;
use audiofs::source::SourceIdentity;

struct ScriptedDriver {
    calls: Arc<AtomicUsize>,
    bytes: Vec<u8>,
    fail_until_call: usize,
}

impl ScriptedDriver {
    fn always_succeeds(bytes: &[u8]) -> Self {
        ScriptedDriver {
            calls: Arc::new(AtomicUsize::new(0)),
            bytes: bytes.to_vec(),
            fail_until_call: 0,
        }
    }

    fn fails_once_then_succeeds(bytes: &[u8]) -> Self {
        ScriptedDriver {
            calls: Arc::new(AtomicUsize::new(0)),
            bytes: bytes.to_vec(),
            fail_until_call: 1,
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn id(&self) -> &'static str {
        "scripted"
    }
    fn version_tag(&self) -> &'static str {
        "v1"
    }
    fn fingerprint_parameters(&self, _source: &BuildSource) -> Vec<u8> {
        Vec::new()
    }
    async fn estimate_size(&self, _source: &BuildSource) -> Result<u64, DriverError> {
        Ok(self.bytes.len() as u64)
    }
    async fn run_to_sink(&self, _source: &BuildSource, sink_path: &Path) -> Result<(), DriverError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_until_call {
            return Err(DriverError::ProcessFailed {
                program: "scripted".to_string(),
                detail: "forced failure".to_string(),
            });
        }
        tokio::fs::write(sink_path, &self.bytes).await?;
        Ok(())
    }
}

fn identity(n: u64) -> SourceIdentity {
    SourceIdentity {
        device: 1,
        inode: n,
        mtime_nanos: 1,
        size: n,
    }
}

fn source_for(n: u64) -> BuildSource {
    BuildSource::WholeFile {
        flac_path: Path::new("/nonexistent").join(format!("track-{n}.flac")),
    }
}

#[tokio::test]
async fn cold_miss_builds_once_and_reuses_ready_entry() {
    let dir = TempDir::new().unwrap();
    let cache = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
    let coordinator = BuildCoordinator::new(cache.clone());
    let driver = ScriptedDriver::always_succeeds(b"derived bytes");
    let calls = driver.calls.clone();

    let fp = Fingerprint::compute("scripted", "v1", b"", identity(1));
    let source = source_for(1);

    let first = coordinator.get_or_build(fp, &source, &driver).await.unwrap();
    assert_eq!(first.len, 13);
    coordinator.cache().release(first).await;

    let second = coordinator.get_or_build(fp, &source, &driver).await.unwrap();
    assert_eq!(second.len, 13);
    coordinator.cache().release(second).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ready_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().contains(".partial-"))
        .collect();
    assert_eq!(ready_files.len(), 1);
}

#[tokio::test]
async fn ten_concurrent_cold_opens_invoke_driver_exactly_once() {
    let dir = TempDir::new().unwrap();
    let cache = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
    let coordinator = Arc::new(BuildCoordinator::new(cache));
    let driver = Arc::new(ScriptedDriver::always_succeeds(b"ten-way race"));
    let calls = driver.calls.clone();

    let fp = Fingerprint::compute("scripted", "v1", b"", identity(2));
    let source = Arc::new(source_for(2));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let coordinator = coordinator.clone();
        let driver = driver.clone();
        let source = source.clone();
        handles.push(tokio::spawn(async move {
            coordinator.get_or_build(fp, &source, driver.as_ref()).await
        }));
    }

    let mut resolved = Vec::new();
    for h in handles {
        resolved.push(h.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(resolved.iter().all(|h| h.path == resolved[0].path));

    for h in resolved {
        coordinator.cache().release(h).await;
    }
}

#[tokio::test]
async fn eviction_sweep_respects_a_held_pin() {
    let dir = TempDir::new().unwrap();
    let cache = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
    let coordinator = BuildCoordinator::new(cache.clone());

    // Budget holds exactly one entry; A is 10 bytes.
    let driver_a = ScriptedDriver::always_succeeds(b"0123456789");
    let fp_a = Fingerprint::compute("scripted", "v1", b"a", identity(10));
    let handle_a = coordinator.get_or_build(fp_a, &source_for(10), &driver_a).await.unwrap();
    // Held, not released: A is pinned for the rest of this test.

    let driver_b = ScriptedDriver::always_succeeds(b"0123456789");
    let fp_b = Fingerprint::compute("scripted", "v1", b"b", identity(11));
    let handle_b = coordinator.get_or_build(fp_b, &source_for(11), &driver_b).await.unwrap();
    coordinator.cache().release(handle_b).await;

    let maintainer = SizeMaintainer::new(cache.clone(), 10, 0);
    maintainer.sweep_once().await;

    // A is pinned, so the maintainer must evict B instead, even though
    // nothing here ever explicitly pins B as "preferred to keep".
    assert!(matches!(cache.probe(fp_a).await, ProbeResult::Ready { .. }));
    assert!(matches!(cache.probe(fp_b).await, ProbeResult::Absent));

    coordinator.cache().release(handle_a).await;

    let driver_c = ScriptedDriver::always_succeeds(b"0123456789");
    let fp_c = Fingerprint::compute("scripted", "v1", b"c", identity(12));
    let handle_c = coordinator.get_or_build(fp_c, &source_for(12), &driver_c).await.unwrap();
    coordinator.cache().release(handle_c).await;

    maintainer.sweep_once().await;

    // A is now unpinned and is the LRU survivor between {A, C}; C was
    // acquired most recently and must win.
    assert!(matches!(cache.probe(fp_a).await, ProbeResult::Absent));
    assert!(matches!(cache.probe(fp_c).await, ProbeResult::Ready { .. }));
}

#[tokio::test]
async fn driver_failure_surfaces_and_leaves_no_trace_then_retry_succeeds() {
    let dir = TempDir::new().unwrap();
    let cache = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
    let coordinator = BuildCoordinator::new(cache.clone());
    let fp = Fingerprint::compute("scripted", "v1", b"", identity(20));
    let source = source_for(20);

    let failing = ScriptedDriver {
        calls: Arc::new(AtomicUsize::new(0)),
        bytes: b"never written".to_vec(),
        fail_until_call: usize::MAX,
    };
    let err = coordinator.get_or_build(fp, &source, &failing).await.unwrap_err();
    assert!(matches!(err, audiofs::coordinator::CoordinatorError::Driver(_)));
    assert!(matches!(cache.probe(fp).await, ProbeResult::Absent));

    let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
    assert!(remaining.is_empty(), "a failed build must not leave any file behind");

    let succeeding = ScriptedDriver::always_succeeds(b"now it works");
    let handle = coordinator.get_or_build(fp, &source, &succeeding).await.unwrap();
    assert_eq!(handle.len, 12);
    coordinator.cache().release(handle).await;
    assert!(matches!(cache.probe(fp).await, ProbeResult::Ready { .. }));
}

#[tokio::test]
async fn failed_build_ticket_does_not_wedge_a_waiting_sibling() {
    let dir = TempDir::new().unwrap();
    let cache = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
    let coordinator = Arc::new(BuildCoordinator::new(cache));
    let fp = Fingerprint::compute("scripted", "v1", b"", identity(21));
    let source = Arc::new(source_for(21));
    let driver = Arc::new(ScriptedDriver::fails_once_then_succeeds(b"second try"));

    // The second caller joins as a waiter on the first's (failing) ticket.
    let (first, second) = tokio::join!(
        {
            let coordinator = coordinator.clone();
            let driver = driver.clone();
            let source = source.clone();
            tokio::spawn(async move { coordinator.get_or_build(fp, &source, driver.as_ref()).await })
        },
        {
            let coordinator = coordinator.clone();
            let driver = driver.clone();
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                coordinator.get_or_build(fp, &source, driver.as_ref()).await
            })
        },
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.is_err() || second.is_err());

    // Whoever lost the race can retry and this time the ticket is gone, so
    // a fresh build attempt runs and succeeds.
    let handle = coordinator.get_or_build(fp, &source, driver.as_ref()).await.unwrap();
    assert_eq!(handle.len, 10);
    coordinator.cache().release(handle).await;
}
