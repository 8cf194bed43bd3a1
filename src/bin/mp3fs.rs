//! Mounts a `.flac` source tree as a mirror tree of MPEG-1 Layer III files,
//! transcoded at a configurable constant bitrate on first access.

use std::process::ExitCode;
use std::sync::Arc;

use audiofs::adapter::AudioFsAdapter;
use audiofs::cache::CacheStore;
use audiofs::catalog::{Projection, VirtualCatalog};
use audiofs::cli;
use audiofs::coordinator::BuildCoordinator;
use audiofs::drivers::{Driver, Mp3EncodeDriver};
use audiofs::maintainer::SizeMaintainer;

const DEFAULT_BITRATE_KBPS: u32 = 192;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match cli::parse_args(&args, DEFAULT_BITRATE_KBPS) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mp3fs: {e}");
            cli::print_usage("mp3fs", true);
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("mp3fs: failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let handle = runtime.handle().clone();

    let cache = match runtime.block_on(CacheStore::open(config.cache_dir.clone())) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("mp3fs: failed to open cache directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let coordinator = Arc::new(BuildCoordinator::new(cache.clone()));
    let driver: Arc<dyn Driver> = Arc::new(Mp3EncodeDriver {
        bitrate_kbps: config.bitrate_kbps,
    });

    let catalog = Arc::new(VirtualCatalog::new(
        config.source_dir.clone(),
        driver.clone(),
        Projection::Transcode { output_extension: "mp3" },
        config.non_audio_extensions.clone(),
        config.track_name_separator.clone(),
        cache.clone(),
    ));

    let maintainer = SizeMaintainer::new(cache, config.cache_budget_bytes, config.min_evictable_size_bytes)
        .with_eviction_log_path(config.eviction_log_path.clone());
    runtime.spawn(maintainer.run());

    let adapter = AudioFsAdapter::new(catalog, coordinator, driver, handle);

    let options = [
        fuser::MountOption::RO,
        fuser::MountOption::FSName("mp3fs".to_string()),
    ];

    match fuser::mount2(adapter, &config.mount_point, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mp3fs: mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
