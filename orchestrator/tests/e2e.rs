use std::{
    net::TcpListener,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use comms::specs::{Combiner, OptimizerKind, TrainingSpec, WorkerSpec};
use futures::future::{BoxFuture, FutureExt};
use orchestrator::{
    Aggregator, Environment, FixedDevices, InProcessSpawner, OrchestratorError, RunConfig,
    Spawner,
};
use worker::{FixedHost, ShardStore, SystemHost, WorkerResult};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(ips: &[&str], global_batch_size: usize, data_dir: &Path) -> RunConfig {
    RunConfig {
        ips: ips.iter().map(|s| s.to_string()).collect(),
        base_port: free_port(),
        data_dir: data_dir.to_path_buf(),
        regenerate: true,
        local_device_count: 1,
        connect_timeout_ms: 10_000,
        training: TrainingSpec {
            global_batch_size,
            iterations: 5,
            slot_num: 3,
            max_nnz: 4,
            embedding_vec_size: 4,
            vocabulary_size_per_device: 32,
            combiner: Combiner::Mean,
            optimizer: OptimizerKind::Sgd,
            hidden_units: vec![8],
            data_seed: Some(42),
            ..Default::default()
        },
    }
}

fn local_env(devices: usize) -> Environment {
    Environment {
        host: Box::new(SystemHost),
        devices: Box::new(FixedDevices(devices)),
        spawner: Box::new(InProcessSpawner),
    }
}

/// Counts the workers it is asked to start and fails every one of them.
#[derive(Default, Clone)]
struct RecordingSpawner {
    spawned: Arc<AtomicUsize>,
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, spec: WorkerSpec) -> BoxFuture<'static, WorkerResult> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let result = WorkerResult::failed(spec.task_id(), "not started");
        async move { result }.boxed()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_local_workers_match_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());

    let report = orchestrator::run(&config, &local_env(2)).await.unwrap();

    assert_eq!(report.worker_count, 2);
    assert_eq!(report.iterations, 5);
    assert_eq!(report.max_abs_diff.len(), 5);
    assert!(report.max_abs_diff() <= 1e-4);

    let store = ShardStore::new(dir.path());
    for task_id in 0..2 {
        assert!(store.dataset_path(task_id).exists());
        assert_eq!(store.load_outputs(task_id).unwrap().len(), 5);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restored_shards_match_the_reference_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());
    config.training.optimizer = OptimizerKind::PluginAdam;
    config.training.learning_rate = 0.01;

    let first = orchestrator::run(&config, &local_env(2)).await.unwrap();

    config.regenerate = false;
    config.base_port = free_port();
    let second = orchestrator::run(&config, &local_env(2)).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coalesced_adam_matches_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());
    config.training.optimizer = OptimizerKind::Adam;
    config.training.learning_rate = 0.01;

    let report = orchestrator::run(&config, &local_env(2)).await.unwrap();

    assert_eq!(report.max_abs_diff.len(), 5);
    assert!(report.max_abs_diff() <= 1e-4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_with_several_devices_match_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());
    config.training.combiner = Combiner::Sum;

    let report = orchestrator::run(&config, &local_env(4)).await.unwrap();

    assert_eq!(report.worker_count, 2);
    assert!(report.max_abs_diff() <= 1e-4);

    // Each worker holds 8 rows, split across its 2 devices.
    let store = ShardStore::new(dir.path());
    for task_id in 0..2 {
        let outputs = store.load_outputs(task_id).unwrap();
        assert_eq!(outputs.len(), 5);
        assert!(outputs.iter().all(|o| o.dim() == (8, 3, 4)));
    }
}

#[tokio::test]
async fn missing_host_address_is_named() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&["192.0.2.1", "192.0.2.2"], 16, dir.path());
    let spawner = RecordingSpawner::default();
    let env = Environment {
        host: Box::new(FixedHost::new("203.0.113.9".parse().unwrap(), vec![])),
        devices: Box::new(FixedDevices(1)),
        spawner: Box::new(spawner.clone()),
    };

    let err = orchestrator::run(&config, &env).await.unwrap_err();

    match &err {
        OrchestratorError::AddressResolution { address, ips } => {
            assert_eq!(address, "203.0.113.9");
            assert_eq!(ips, &config.ips);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().contains("203.0.113.9"));
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn indivisible_batch_is_rejected_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&["127.0.0.1"; 3], 17, dir.path());
    let spawner = RecordingSpawner::default();
    let env = Environment {
        host: Box::new(SystemHost),
        devices: Box::new(FixedDevices(3)),
        spawner: Box::new(spawner.clone()),
    };

    let err = orchestrator::run(&config, &env).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Configuration(_)), "{err}");
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
    assert!(!ShardStore::new(dir.path()).dataset_path(0).exists());
}

#[tokio::test]
async fn batch_must_split_across_every_device() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&["127.0.0.1"; 2], 18, dir.path());
    let spawner = RecordingSpawner::default();
    let env = Environment {
        host: Box::new(SystemHost),
        devices: Box::new(FixedDevices(4)),
        spawner: Box::new(spawner.clone()),
    };

    let err = orchestrator::run(&config, &env).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Configuration(_)), "{err}");
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_output_shard_is_a_length_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());
    orchestrator::run(&config, &local_env(2)).await.unwrap();

    let store = ShardStore::new(dir.path());
    let outputs = store.load_outputs(1).unwrap();
    let views: Vec<_> = outputs[..4].iter().map(|o| o.view()).collect();
    store.save_outputs(1, &views).unwrap();

    let aggregator = Aggregator::new(store, config.training.clone(), 2, 2);
    let err = aggregator.cross_validate().await.unwrap_err();

    match err {
        OrchestratorError::LengthMismatch { expected, got, .. } => {
            assert_eq!((expected, got), (5, 4));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aggregation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());
    orchestrator::run(&config, &local_env(2)).await.unwrap();

    let aggregator = Aggregator::new(ShardStore::new(dir.path()), config.training.clone(), 2, 2);
    let first = aggregator.cross_validate().await.unwrap();
    let second = aggregator.cross_validate().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(aggregator.global_dataset().unwrap(), aggregator.global_dataset().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_workers_are_reported_by_task_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&["127.0.0.1", "127.0.0.1"], 16, dir.path());
    // Nothing to restore in an empty directory.
    config.regenerate = false;

    let err = orchestrator::run(&config, &local_env(2)).await.unwrap_err();

    match err {
        OrchestratorError::WorkerFailed(failures) => {
            let ids: Vec<_> = failures.iter().map(|f| f.task_id).collect();
            assert_eq!(ids, [0, 1]);
        }
        other => panic!("unexpected {other:?}"),
    }
}
