//! Filing agent: terminal bookkeeping for claimed tasks.
//!
//! On success the backing file moves to the processed directory; on
//! failure the retry policy decides between requeueing (attempt count
//! bumped, same task id) and dead-lettering. Every terminally filed task
//! gets a `<stem>_result.json` sidecar next to it.
//!
//! Moves never overwrite: a name collision at the destination picks the
//! next ordinal suffix. Filing an already-filed claim is a no-op, and a
//! filing move that fails leaves the claim in its inflight location for
//! the next cycle to retry.

mod retry;

pub use retry::{Disposition, RetryPolicy};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::domain::{ErrorCategory, Segmentation, Task, TaskFailure, TaskId, TaskReport};
use crate::engine::device::Device;
use crate::error::ServiceError;

/// How a claim was filed, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filed {
    Completed { destination: PathBuf },
    Requeued { attempt_count: u32 },
    DeadLettered { destination: PathBuf },
    /// The claim file was gone already; nothing was duplicated.
    AlreadyFiled,
}

/// Everything the filing agent needs to know about a failed attempt.
#[derive(Debug)]
pub struct FailedAttempt {
    pub task_id: TaskId,

    /// Attempts made so far, including the one that just failed.
    pub attempt_count: u32,

    pub failure: TaskFailure,
    pub device_used: Option<Device>,
    pub duration: Duration,

    /// Parsed backing document. Present for every retriable failure (the
    /// worker parsed it to get this far); may be absent for unparsable
    /// documents, which dead-letter anyway.
    pub document: Option<Value>,
}

pub struct FilingAgent {
    config: Arc<ServiceConfig>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl FilingAgent {
    pub fn new(config: Arc<ServiceConfig>, clock: Arc<dyn Clock>) -> Self {
        let policy = RetryPolicy::new(config.max_attempts);
        Self {
            config,
            policy,
            clock,
        }
    }

    /// File a successful task: move to processed, write the result sidecar.
    pub async fn file_success(
        &self,
        claim_path: &Path,
        task: &Task,
        segmentation: Segmentation,
        duration: Duration,
    ) -> Result<Filed, ServiceError> {
        let name = backing_name(claim_path);
        let Some(destination) = relocate(claim_path, &self.config.processed_dir, name).await?
        else {
            warn!(task_id = %task.task_id, "claim already filed; skipping");
            return Ok(Filed::AlreadyFiled);
        };

        let report = TaskReport::completed(
            task.task_id.clone(),
            &segmentation,
            duration.as_secs_f64(),
            task.attempt_count + 1,
            self.clock.now(),
        );
        write_sidecar(&self.config.processed_dir, &destination, &report).await?;

        info!(
            task_id = %task.task_id,
            device = segmentation.device_used.as_str(),
            duration_s = duration.as_secs_f64(),
            "task completed"
        );
        Ok(Filed::Completed { destination })
    }

    /// File a failed attempt according to the retry policy.
    pub async fn file_failure(
        &self,
        claim_path: &Path,
        outcome: FailedAttempt,
    ) -> Result<Filed, ServiceError> {
        match self
            .policy
            .decide(outcome.failure.category, outcome.attempt_count)
        {
            Disposition::Requeue => self.requeue(claim_path, outcome).await,
            Disposition::DeadLetter { reason } => {
                self.dead_letter(claim_path, outcome, reason).await
            }
        }
    }

    async fn requeue(
        &self,
        claim_path: &Path,
        outcome: FailedAttempt,
    ) -> Result<Filed, ServiceError> {
        // An absent claim was filed already; rewriting would resurrect it.
        if !tokio::fs::try_exists(claim_path).await? {
            warn!(task_id = %outcome.task_id, "claim already filed; skipping");
            return Ok(Filed::AlreadyFiled);
        }

        // Rewrite the claim file in place, then move it back. The queue
        // holds exactly one backing file for the task throughout; a crash
        // between the two steps leaves the claim to the stale sweep.
        if let Some(mut doc) = outcome.document {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert(
                    "task_id".to_string(),
                    Value::String(outcome.task_id.as_str().to_string()),
                );
                obj.insert("attempt_count".to_string(), outcome.attempt_count.into());
            }
            tokio::fs::write(claim_path, serde_json::to_vec_pretty(&doc)?).await?;
        } else {
            warn!(task_id = %outcome.task_id, "requeueing without a parsed document; attempt count not bumped");
        }

        let name = backing_name(claim_path);
        let Some(_) = relocate(claim_path, &self.config.tasks_dir, name).await? else {
            return Ok(Filed::AlreadyFiled);
        };

        info!(
            task_id = %outcome.task_id,
            attempt = outcome.attempt_count,
            category = ?outcome.failure.category,
            "task requeued: {}",
            outcome.failure.message
        );
        Ok(Filed::Requeued {
            attempt_count: outcome.attempt_count,
        })
    }

    async fn dead_letter(
        &self,
        claim_path: &Path,
        outcome: FailedAttempt,
        reason: String,
    ) -> Result<Filed, ServiceError> {
        let name = backing_name(claim_path);
        let Some(destination) = relocate(claim_path, &self.config.failed_dir, name).await? else {
            warn!(task_id = %outcome.task_id, "claim already filed; skipping");
            return Ok(Filed::AlreadyFiled);
        };

        let mut report = TaskReport::failed(
            outcome.task_id.clone(),
            &outcome.failure,
            outcome.duration.as_secs_f64(),
            outcome.attempt_count,
            self.clock.now(),
        );
        if let Some(device) = outcome.device_used {
            report = report.with_device(device);
        }
        // Preserve what the author actually submitted when the document
        // itself was the problem.
        if outcome.failure.category == ErrorCategory::Validation {
            if let Some(doc) = outcome.document {
                report = report.with_document(doc);
            }
        }
        write_sidecar(&self.config.failed_dir, &destination, &report).await?;

        warn!(
            task_id = %outcome.task_id,
            attempt = outcome.attempt_count,
            category = ?outcome.failure.category,
            "task dead-lettered ({reason}): {}",
            outcome.failure.message
        );
        Ok(Filed::DeadLettered { destination })
    }
}

/// Move `src` into `dest_dir` without ever overwriting: collisions get an
/// ordinal suffix. Returns `None` when the source is already gone, which
/// callers treat as "someone else filed it" rather than an error.
pub(crate) async fn relocate(
    src: &Path,
    dest_dir: &Path,
    file_name: &str,
) -> Result<Option<PathBuf>, ServiceError> {
    if !tokio::fs::try_exists(src).await? {
        return Ok(None);
    }

    let (stem, ext) = match file_name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file_name, None),
    };

    let mut candidate = dest_dir.join(file_name);
    let mut ordinal = 0u32;
    while tokio::fs::try_exists(&candidate).await? {
        ordinal += 1;
        let renamed = match ext {
            Some(ext) => format!("{stem}-{ordinal}.{ext}"),
            None => format!("{stem}-{ordinal}"),
        };
        candidate = dest_dir.join(renamed);
    }

    match tokio::fs::rename(src, &candidate).await {
        Ok(()) => Ok(Some(candidate)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn backing_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("task.json")
}

/// Write the `<stem>_result.json` sidecar for a filed document, suffixing
/// on collision like the document move does.
async fn write_sidecar(
    dir: &Path,
    filed_document: &Path,
    report: &TaskReport,
) -> Result<PathBuf, ServiceError> {
    let stem = filed_document
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("task");

    let mut candidate = dir.join(format!("{stem}_result.json"));
    let mut ordinal = 0u32;
    while tokio::fs::try_exists(&candidate).await? {
        ordinal += 1;
        candidate = dir.join(format!("{stem}_result-{ordinal}.json"));
    }

    tokio::fs::write(&candidate, serde_json::to_vec_pretty(report)?).await?;
    Ok(candidate)
}
