//! Outcome model: error taxonomy, failure values, and sidecar reports.
//!
//! Every task that enters the queue eventually produces exactly one
//! `TaskReport` sidecar next to its filed document, in either the
//! processed or the failed directory. The report is the durable audit
//! trail; nothing disappears silently.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::status::TaskStatus;
use crate::engine::device::Device;

/// Operational classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or incomplete task document. Never retried.
    Validation,

    /// File busy, disk contention. Retried via the next poll cycle.
    TransientIo,

    /// Accelerator unavailable. Retriable; may succeed on CPU fallback.
    Device,

    /// The inference engine reported a computation failure. Retriable
    /// up to the attempt budget.
    Engine,

    /// The engine exceeded its configured wall-clock budget.
    Timeout,
}

impl ErrorCategory {
    /// Whether a failure of this category may be requeued.
    pub fn is_retriable(self) -> bool {
        !matches!(self, ErrorCategory::Validation)
    }
}

/// A classified task failure on its way to the filing agent.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl TaskFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Successful engine output: where the artifacts landed and on what device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub output_paths: Vec<PathBuf>,
    pub device_used: Device,
}

/// Sidecar document written alongside a filed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_used: Option<Device>,

    pub duration_seconds: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_paths: Vec<PathBuf>,

    pub attempt_count: u32,

    pub claimed_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Original document content, preserved when a task dead-letters on
    /// validation so the author can see exactly what was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}

impl TaskReport {
    /// Report for a task filed to the processed directory.
    pub fn completed(
        task_id: TaskId,
        segmentation: &Segmentation,
        duration_seconds: f64,
        attempt_count: u32,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            error_category: None,
            error_message: None,
            device_used: Some(segmentation.device_used),
            duration_seconds,
            output_paths: segmentation.output_paths.clone(),
            attempt_count,
            claimed_at: claimed_from(finished_at, duration_seconds),
            finished_at,
            document: None,
        }
    }

    /// Report for a dead-lettered task.
    pub fn failed(
        task_id: TaskId,
        failure: &TaskFailure,
        duration_seconds: f64,
        attempt_count: u32,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            error_category: Some(failure.category),
            error_message: Some(failure.message.clone()),
            device_used: None,
            duration_seconds,
            output_paths: Vec::new(),
            attempt_count,
            claimed_at: claimed_from(finished_at, duration_seconds),
            finished_at,
            document: None,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device_used = Some(device);
        self
    }

    pub fn with_document(mut self, document: serde_json::Value) -> Self {
        self.document = Some(document);
        self
    }
}

/// The claim happened `duration_seconds` before the filing timestamp.
fn claimed_from(finished_at: DateTime<Utc>, duration_seconds: f64) -> DateTime<Utc> {
    let elapsed = chrono::Duration::milliseconds((duration_seconds * 1000.0) as i64);
    finished_at - elapsed
}
