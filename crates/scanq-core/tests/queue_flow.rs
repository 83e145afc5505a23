//! End-to-end queue behavior over real directories: every task that
//! enters the tasks directory ends up in exactly one of processed or
//! failed with a sidecar explaining why, the concurrency bound holds,
//! and per-task failures never stop the loop.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::watch;

use scanq_core::clock::SystemClock;
use scanq_core::config::ServiceConfig;
use scanq_core::domain::{Segmentation, Task};
use scanq_core::engine::device::{Device, DevicePreference, FixedProbe};
use scanq_core::engine::{EngineFailure, InferenceEngine};
use scanq_core::scheduler::Scheduler;

fn service_config(root: &Path, max_concurrent: usize, max_attempts: u32) -> Arc<ServiceConfig> {
    let config = ServiceConfig {
        base_dir: root.to_path_buf(),
        tasks_dir: root.join("tasks"),
        inflight_dir: root.join("inflight"),
        processed_dir: root.join("processed"),
        failed_dir: root.join("failed"),
        poll_interval: Duration::from_millis(25),
        max_concurrent_tasks: max_concurrent,
        device_preference: DevicePreference::Auto,
        max_attempts,
        stale_claim_grace: Duration::from_secs(300),
        log_file: None,
        engine: None,
    };
    config.ensure_dirs().unwrap();
    Arc::new(config)
}

fn scheduler(config: &Arc<ServiceConfig>, engine: Arc<dyn InferenceEngine>) -> Scheduler {
    Scheduler::new(
        Arc::clone(config),
        engine,
        Arc::new(FixedProbe(false)),
        Arc::new(SystemClock),
    )
}

/// A real input file for the normalizer's existence probe.
fn scan_fixture(root: &Path) -> String {
    let path = root.join("scan.nii.gz");
    std::fs::write(&path, b"fixture").unwrap();
    path.to_str().unwrap().to_string()
}

fn write_task(config: &ServiceConfig, name: &str, doc: Value) {
    std::fs::write(config.tasks_dir.join(name), doc.to_string()).unwrap();
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

struct HappyEngine;

#[async_trait]
impl InferenceEngine for HappyEngine {
    async fn run(&self, task: &Task, device: Device) -> Result<Segmentation, EngineFailure> {
        Ok(Segmentation {
            output_paths: vec![task.output_directory.join("ct_seg.nii.gz")],
            device_used: device,
        })
    }
}

/// Fails every invocation; counts how often it was asked.
struct GrumpyEngine {
    calls: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for GrumpyEngine {
    async fn run(&self, _task: &Task, _device: Device) -> Result<Segmentation, EngineFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(EngineFailure::engine(format!("synthetic failure #{n}")))
    }
}

/// Tracks the concurrency high-water mark while holding each task briefly.
struct GaugedEngine {
    current: AtomicUsize,
    high_water: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for GaugedEngine {
    async fn run(&self, task: &Task, device: Device) -> Result<Segmentation, EngineFailure> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Segmentation {
            output_paths: vec![task.output_directory.join("ct_seg.nii.gz")],
            device_used: device,
        })
    }
}

#[tokio::test]
async fn valid_task_is_processed_with_a_result_sidecar() {
    let root = TempDir::new().unwrap();
    let config = service_config(root.path(), 1, 3);
    let scan = scan_fixture(root.path());
    write_task(
        &config,
        "ct-1.tsk",
        json!({
            "task_id": "ct-1",
            "input_file": scan,
            "output_directory": root.path().join("out").to_str().unwrap(),
            "segmentation_type": "full"
        }),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler(&config, Arc::new(HappyEngine));
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(shutdown_rx).await }
    });

    let filed = config.processed_dir.join("ct-1.tsk");
    let sidecar = config.processed_dir.join("ct-1_result.json");
    assert!(
        eventually(|| filed.is_file() && sidecar.is_file(), Duration::from_secs(5)).await,
        "task was not filed to processed"
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let report = read_json(&sidecar);
    assert_eq!(report["task_id"], "ct-1");
    assert_eq!(report["status"], "completed");
    assert_eq!(report["device_used"], "cpu");
    assert_eq!(report["attempt_count"], 1);

    // Exactly one backing file: gone from tasks and inflight, not in failed.
    assert!(!config.tasks_dir.join("ct-1.tsk").exists());
    assert!(!config.inflight_dir.join("ct-1.tsk").exists());
    assert!(!config.failed_dir.join("ct-1.tsk").exists());
}

#[tokio::test]
async fn malformed_task_dead_letters_without_stopping_the_loop() {
    let root = TempDir::new().unwrap();
    let config = service_config(root.path(), 1, 3);
    let scan = scan_fixture(root.path());

    // Missing input file; rejected by validation before the engine runs.
    write_task(&config, "bad.json", json!({ "output_directory": "out" }));
    write_task(
        &config,
        "good.tsk",
        json!({
            "task_id": "good",
            "input_file": scan,
            "output_directory": root.path().join("out").to_str().unwrap()
        }),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler(&config, Arc::new(HappyEngine));
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(shutdown_rx).await }
    });

    let rejected = config.failed_dir.join("bad.json");
    let accepted = config.processed_dir.join("good.tsk");
    assert!(
        eventually(|| rejected.is_file() && accepted.is_file(), Duration::from_secs(5)).await,
        "expected bad.json in failed and good.tsk in processed"
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let report = read_json(&config.failed_dir.join("bad_result.json"));
    assert_eq!(report["status"], "failed");
    assert_eq!(report["error_category"], "validation");
    // The rejected document is preserved verbatim in the sidecar.
    assert_eq!(report["document"], json!({ "output_directory": "out" }));
}

#[tokio::test]
async fn engine_failures_retry_up_to_the_budget_then_dead_letter() {
    let root = TempDir::new().unwrap();
    let config = service_config(root.path(), 1, 3);
    let scan = scan_fixture(root.path());
    write_task(
        &config,
        "ct-3.tsk",
        json!({
            "task_id": "ct-3",
            "input_file": scan,
            "output_directory": "out"
        }),
    );

    let engine = Arc::new(GrumpyEngine {
        calls: AtomicUsize::new(0),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler(&config, Arc::clone(&engine) as Arc<dyn InferenceEngine>);
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(shutdown_rx).await }
    });

    let dead = config.failed_dir.join("ct-3.tsk");
    assert!(
        eventually(|| dead.is_file(), Duration::from_secs(10)).await,
        "task never dead-lettered"
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    let report = read_json(&config.failed_dir.join("ct-3_result.json"));
    assert_eq!(report["task_id"], "ct-3");
    assert_eq!(report["error_category"], "engine");
    assert_eq!(report["attempt_count"], 3);

    assert!(!config.tasks_dir.join("ct-3.tsk").exists());
    assert!(!config.inflight_dir.join("ct-3.tsk").exists());
}

#[tokio::test]
async fn concurrent_claims_never_exceed_the_configured_bound() {
    let root = TempDir::new().unwrap();
    let config = service_config(root.path(), 2, 3);
    let scan = scan_fixture(root.path());
    for i in 0..6 {
        write_task(
            &config,
            &format!("ct-{i}.tsk"),
            json!({
                "task_id": format!("ct-{i}"),
                "input_file": scan,
                "output_directory": "out"
            }),
        );
    }

    let engine = Arc::new(GaugedEngine {
        current: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler(&config, Arc::clone(&engine) as Arc<dyn InferenceEngine>);
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(shutdown_rx).await }
    });

    let processed_dir = config.processed_dir.clone();
    let all_done = eventually(
        move || {
            (0..6).all(|i| processed_dir.join(format!("ct-{i}.tsk")).is_file())
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(all_done, "not every task was processed");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let high_water = engine.high_water.load(Ordering::SeqCst);
    assert!(high_water <= 2, "concurrency bound violated: {high_water}");
    assert!(high_water >= 1);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work() {
    let root = TempDir::new().unwrap();
    let config = service_config(root.path(), 1, 3);
    let scan = scan_fixture(root.path());
    write_task(
        &config,
        "slow.tsk",
        json!({
            "task_id": "slow",
            "input_file": scan,
            "output_directory": "out"
        }),
    );

    let engine = Arc::new(GaugedEngine {
        current: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler(&config, Arc::clone(&engine) as Arc<dyn InferenceEngine>);
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(shutdown_rx).await }
    });

    // Let the first cycle claim the task, then ask for shutdown while the
    // engine is still holding it.
    let inflight = config.inflight_dir.join("slow.tsk");
    assert!(
        eventually(|| inflight.is_file(), Duration::from_secs(5)).await,
        "task was never claimed"
    );
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // run() returned only after the worker filed the task.
    assert!(config.processed_dir.join("slow.tsk").is_file());
    assert!(!inflight.exists());
}

#[tokio::test]
async fn abandoned_claims_are_recovered_and_processed() {
    let root = TempDir::new().unwrap();
    let config = {
        let mut config =
            Arc::try_unwrap(service_config(root.path(), 1, 3)).expect("sole owner");
        // Zero grace: anything unowned in inflight is immediately stale.
        config.stale_claim_grace = Duration::ZERO;
        Arc::new(config)
    };
    let scan = scan_fixture(root.path());

    // Simulate a crash: a claim left behind by a previous run.
    std::fs::write(
        config.inflight_dir.join("orphan.tsk"),
        json!({
            "task_id": "orphan",
            "input_file": scan,
            "output_directory": "out"
        })
        .to_string(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler(&config, Arc::new(HappyEngine));
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(shutdown_rx).await }
    });

    let filed = config.processed_dir.join("orphan.tsk");
    assert!(
        eventually(|| filed.is_file(), Duration::from_secs(5)).await,
        "orphaned claim was not recovered"
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // The abandoned attempt counts against the budget: recovery bumped the
    // document to 1, the successful run was attempt 2.
    let report = read_json(&config.processed_dir.join("orphan_result.json"));
    assert_eq!(report["status"], "completed");
    assert_eq!(report["attempt_count"], 2);
}
