//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of one queued task.
///
/// State transitions:
/// - Pending -> Claimed -> Processing -> Completed
/// - Pending -> Claimed -> Processing -> Pending (requeued, attempt_count bumped)
/// - Pending -> Claimed -> Processing -> Failed (dead-letter)
///
/// Transitions are strictly forward; a task never leaves Completed or
/// Failed. A requeued task is operationally identical to a fresh Pending
/// task except for its non-zero attempt count.
///
/// The filesystem is the source of truth: Pending lives in the tasks
/// directory, Claimed/Processing in the inflight directory, and the two
/// terminal states in the processed and failed directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the tasks directory.
    Pending,

    /// Atomically moved into the inflight directory, not yet dispatched.
    Claimed,

    /// Inference engine invocation in progress.
    Processing,

    /// Filed to the processed directory with a result sidecar.
    Completed,

    /// Filed to the failed directory with a failure sidecar.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Does this task currently occupy a concurrency slot?
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Processing)
    }
}
