use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use strata_config::{Config, CorruptChunkPolicy};
use strata_world::{ChunkFiles, ChunkSerializer, EntityRegistry, WorldGeometry, world_dir};

use super::*;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn small_world(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.world.chunk_size = 8;
    config.world.planet_width_chunks = 8;
    config.world.planet_height_chunks = 4;
    config.world.save_root = Some(root.to_path_buf());
    config.streaming.worker_threads = 2;
    config.streaming.settle_ms = 0;
    config.streaming.on_corrupt_chunk = CorruptChunkPolicy::Regenerate;
    config.network.dwell_threshold_ms = 0;
    config
}

fn options(ticks: u64, torch_every: u64) -> RunOptions {
    RunOptions {
        ticks: Some(ticks),
        stop: Arc::new(AtomicBool::new(false)),
        torch_every,
    }
}

fn stored_counter(config: &Config) -> Option<i32> {
    let serializer = ChunkSerializer::new(
        WorldGeometry::from_config(&config.world),
        Arc::new(EntityRegistry::with_builtins()),
    );
    let dir = world_dir(&config.world.save_root(), config.world.seed);
    ChunkFiles::open(dir, serializer)
        .unwrap()
        .load_meta()
        .unwrap()
}

#[test]
fn test_offline_run_persists_world_and_counter() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_world(dir.path());

    let summary = run_offline(&config, &options(90, 30)).unwrap();
    assert_eq!(summary.steps, 90);
    assert_eq!(summary.reason, StopReason::TickLimit);
    let counter = stored_counter(&config).unwrap();
    assert!(counter >= IdAssigner::FIRST_ID + summary.spawned as i32);

    let world = world_dir(dir.path(), config.world.seed);
    let chunks = std::fs::read_dir(&world)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == "chunk"))
        .count();
    assert!(chunks > 0, "no chunk files in {}", world.display());
}

#[test]
fn test_offline_counter_continues_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_world(dir.path());
    run_offline(&config, &options(60, 20)).unwrap();
    let after_first = stored_counter(&config).unwrap();
    let second = run_offline(&config, &options(60, 20)).unwrap();
    let after_second = stored_counter(&config).unwrap();
    assert!(after_second >= after_first + second.spawned as i32);
}

#[test]
fn test_stop_flag_ends_run_before_stepping() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_world(dir.path());
    let opts = options(1_000, 0);
    opts.stop.store(true, Ordering::Relaxed);
    let summary = run_offline(&config, &opts).unwrap();
    assert_eq!(summary.steps, 0);
    assert_eq!(summary.reason, StopReason::Interrupted);
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_world(dir.path());
    config.world.planet_width_chunks = 2;
    let err = run_offline(&config, &options(1, 0)).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn test_client_joins_host_over_loopback() {
    let host_dir = tempfile::tempdir().unwrap();
    let mut config = small_world(host_dir.path());
    config.network.server_port = free_port();

    let host_config = config.clone();
    let host = std::thread::spawn(move || {
        let runtime = Runtime::new().unwrap();
        run_host(&runtime, &host_config, &options(300, 0))
    });

    let client_dir = tempfile::tempdir().unwrap();
    let mut client_config = config.clone();
    client_config.world.save_root = Some(client_dir.path().to_path_buf());
    let runtime = Runtime::new().unwrap();
    let joined = run_join(&runtime, &client_config, &options(60, 0)).unwrap();
    assert_eq!(joined.steps, 60);
    assert_eq!(joined.reason, StopReason::TickLimit);

    let hosted = host.join().unwrap().unwrap();
    assert_eq!(hosted.reason, StopReason::TickLimit);
    assert!(stored_counter(&config).is_some());
    // Clients never write the world locally.
    assert!(!world_dir(client_dir.path(), config.world.seed).exists());
}
