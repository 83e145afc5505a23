//! Job scheduler: the concurrency and liveness core.
//!
//! One controlling loop polls the tasks directory at the configured
//! cadence. Each cycle recovers abandoned claims, lists candidates in
//! filename order, claims up to the free capacity, and dispatches one
//! worker per claim. Workers run on their own tasks, bounded by a
//! semaphore sized to `max_concurrent_tasks`; the loop itself never
//! blocks on the engine.
//!
//! The scheduler holds no state that is not reconstructible from the
//! filesystem: the active set exists only to keep the stale sweep off
//! claims this process is still working on.

pub mod claim;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::domain::{ErrorCategory, TaskFailure, TaskId};
use crate::engine::device::DeviceProbe;
use crate::engine::{InferenceEngine, select_device};
use crate::error::ServiceError;
use crate::filing::{FailedAttempt, FilingAgent};
use crate::observability::{CycleStats, QueueSnapshot};
use crate::schema;
use claim::Claim;

#[derive(Clone)]
pub struct Scheduler {
    config: Arc<ServiceConfig>,
    engine: Arc<dyn InferenceEngine>,
    probe: Arc<dyn DeviceProbe>,
    clock: Arc<dyn Clock>,
    filing: Arc<FilingAgent>,
    permits: Arc<Semaphore>,
    /// Claim file names owned by live workers of this process.
    active: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ServiceConfig>,
        engine: Arc<dyn InferenceEngine>,
        probe: Arc<dyn DeviceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let filing = Arc::new(FilingAgent::new(Arc::clone(&config), Arc::clone(&clock)));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            config,
            engine,
            probe,
            clock,
            filing,
            permits,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the polling loop until the shutdown signal flips, then wait
    /// for in-flight work to finish. In-flight tasks are never cancelled;
    /// shutdown only stops new claims.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            tasks_dir = %self.config.tasks_dir.display(),
            interval_s = self.config.poll_interval.as_secs_f64(),
            capacity = self.config.max_concurrent_tasks,
            "scheduler started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.cycle().await {
                Ok(stats) if !stats.is_quiet() => {
                    info!(
                        discovered = stats.discovered,
                        claimed = stats.claimed,
                        recovered = stats.recovered,
                        "poll cycle"
                    );
                }
                Ok(_) => {}
                // Directory listing hiccups are transient; the next cycle
                // retries. Nothing here may abort the loop.
                Err(e) => error!("poll cycle failed: {e}"),
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.drain().await;
        info!("scheduler stopped");
    }

    /// One poll cycle. Public so tests and embedders can drive the
    /// scheduler without the timer.
    pub async fn cycle(&self) -> Result<CycleStats, ServiceError> {
        let mut stats = CycleStats::default();

        {
            let active = self.active.lock().await;
            stats.recovered = claim::recover_stale(&self.config, &active).await?;
        }

        let candidates = claim::list_candidates(&self.config.tasks_dir).await?;
        stats.discovered = candidates.len();

        for name in candidates {
            // Capacity check: no permit, no claim. The permit rides along
            // with the worker and frees the slot whenever it finishes.
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };

            let claimed = match claim::claim_task(&self.config, &name).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(file = %name, "claim failed, retrying next cycle: {e}");
                    continue;
                }
            };
            let Some(claimed) = claimed else {
                // Another claimant won the rename; not an error.
                continue;
            };

            // Track the name the claim actually landed under (a collision
            // in the inflight directory gets an ordinal suffix), so the
            // stale sweep never touches a live claim.
            let claim_name = claimed
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&name)
                .to_string();
            self.active.lock().await.insert(claim_name.clone());
            stats.claimed += 1;

            let worker = self.clone();
            tokio::spawn(async move {
                worker.process(claimed, claim_name).await;
                drop(permit);
            });
        }

        Ok(stats)
    }

    /// Current queue counts, derived entirely from the filesystem.
    pub async fn snapshot(&self) -> Result<QueueSnapshot, ServiceError> {
        QueueSnapshot::scan(&self.config).await
    }

    async fn drain(&self) {
        let slots = self.config.max_concurrent_tasks as u32;
        // Every worker holds one permit; holding all of them means the
        // queue is quiescent.
        let _ = self.permits.acquire_many(slots).await;
    }

    async fn process(&self, claimed: Claim, name: String) {
        if let Err(e) = self.execute(&claimed).await {
            // Filing could not relocate the claim (destination locked,
            // disk full). Leave it where it is; the stale sweep requeues
            // it after the grace period.
            warn!(file = %name, "filing failed, claim left in place: {e}");
        }
        self.active.lock().await.remove(&name);
    }

    async fn execute(&self, claimed: &Claim) -> Result<(), ServiceError> {
        let raw = match tokio::fs::read(&claimed.path).await {
            Ok(raw) => raw,
            Err(e) => {
                // Transient: hand the claim straight back for the next
                // cycle. If even that move fails the stale sweep picks it
                // up after the grace period.
                warn!(path = %claimed.path.display(), "cannot read claim, requeueing: {e}");
                let name = claim_file_name(&claimed.path);
                crate::filing::relocate(&claimed.path, &self.config.tasks_dir, &name).await?;
                return Ok(());
            }
        };
        let started = Instant::now();
        let document: Option<Value> = serde_json::from_slice(&raw).ok();

        let task = match schema::normalize(&raw, self.clock.as_ref()) {
            Ok(task) => task,
            Err(validation) => {
                // Malformed tasks never reach the engine; straight to the
                // filing agent as a non-retriable failure.
                let task_id = document
                    .as_ref()
                    .and_then(|doc| doc.get("task_id"))
                    .and_then(Value::as_str)
                    .map(TaskId::from)
                    .unwrap_or_else(|| TaskId::new(claim_stem(&claimed.path)));
                let prior_attempts = document
                    .as_ref()
                    .and_then(|doc| doc.get("attempt_count"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;

                info!(task_id = %task_id, "task rejected: {validation}");
                self.filing
                    .file_failure(
                        &claimed.path,
                        FailedAttempt {
                            task_id,
                            attempt_count: prior_attempts + 1,
                            failure: TaskFailure::new(
                                ErrorCategory::Validation,
                                validation.to_string(),
                            ),
                            device_used: None,
                            duration: started.elapsed(),
                            document,
                        },
                    )
                    .await?;
                return Ok(());
            }
        };

        let attempt = task.attempt_count + 1;
        info!(task_id = %task.task_id, mode = ?task.mode, attempt, "processing task");

        let device = match select_device(self.config.device_preference, self.probe.as_ref()) {
            Ok(device) => device,
            Err(failure) => {
                self.filing
                    .file_failure(
                        &claimed.path,
                        FailedAttempt {
                            task_id: task.task_id.clone(),
                            attempt_count: attempt,
                            failure,
                            device_used: None,
                            duration: started.elapsed(),
                            document,
                        },
                    )
                    .await?;
                return Ok(());
            }
        };

        // The engine contract says failures come back as values, but a
        // panicking collaborator must not take the loop down either: the
        // invocation runs on its own task and a panic is filed as an
        // engine failure.
        let engine = Arc::clone(&self.engine);
        let engine_task = task.clone();
        let outcome =
            tokio::spawn(async move { engine.run(&engine_task, device).await }).await;
        let duration = started.elapsed();

        match outcome {
            Ok(Ok(segmentation)) => {
                self.filing
                    .file_success(&claimed.path, &task, segmentation, duration)
                    .await?;
            }
            Ok(Err(engine_failure)) => {
                self.filing
                    .file_failure(
                        &claimed.path,
                        FailedAttempt {
                            task_id: task.task_id.clone(),
                            attempt_count: attempt,
                            failure: engine_failure.into(),
                            device_used: Some(device),
                            duration,
                            document,
                        },
                    )
                    .await?;
            }
            Err(join_error) => {
                self.filing
                    .file_failure(
                        &claimed.path,
                        FailedAttempt {
                            task_id: task.task_id.clone(),
                            attempt_count: attempt,
                            failure: TaskFailure::new(
                                ErrorCategory::Engine,
                                format!("inference engine panicked: {join_error}"),
                            ),
                            device_used: Some(device),
                            duration,
                            document,
                        },
                    )
                    .await?;
            }
        }

        Ok(())
    }
}

fn claim_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("task")
        .to_string()
}

fn claim_file_name(path: &std::path::Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("task.json")
        .to_string()
}
