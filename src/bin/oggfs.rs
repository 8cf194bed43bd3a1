//! Mounts a `.flac` source tree as a mirror tree of Ogg Vorbis files,
//! transcoded at a configurable target bitrate on first access.

use std::process::ExitCode;
use std::sync::Arc;

use audiofs::adapter::AudioFsAdapter;
use audiofs::cache::CacheStore;
use audiofs::catalog::{Projection, VirtualCatalog};
use audiofs::cli;
use audiofs::coordinator::BuildCoordinator;
use audiofs::drivers::{Driver, OggEncodeDriver};
use audiofs::maintainer::SizeMaintainer;

const DEFAULT_BITRATE_KBPS: u32 = 160;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match cli::parse_args(&args, DEFAULT_BITRATE_KBPS) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("oggfs: {e}");
            cli::print_usage("oggfs", true);
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("oggfs: failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let handle = runtime.handle().clone();

    let cache = match runtime.block_on(CacheStore::open(config.cache_dir.clone())) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("oggfs: failed to open cache directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let coordinator = Arc::new(BuildCoordinator::new(cache.clone()));
    let driver: Arc<dyn Driver> = Arc::new(OggEncodeDriver {
        bitrate_kbps: config.bitrate_kbps,
    });

    let catalog = Arc::new(VirtualCatalog::new(
        config.source_dir.clone(),
        driver.clone(),
        Projection::Transcode { output_extension: "ogg" },
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
        fuser::MountOption::FSName("oggfs".to_string()),
    ];

    match fuser::mount2(adapter, &config.mount_point, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("oggfs: mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
