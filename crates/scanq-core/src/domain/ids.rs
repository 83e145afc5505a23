//! Task identifiers.
//!
//! Task authors may supply any string id; when a document arrives without
//! one, the service generates a ULID-based id. ULIDs sort by creation time,
//! which keeps generated ids consistent with the queue's filename ordering.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Clock;

/// Identifier of one queued task.
///
/// Preserved verbatim across requeue attempts: a retried task keeps the id
/// it was submitted with, only its attempt count changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generate a fresh id for a document that did not carry one.
    pub fn generate(clock: &dyn Clock) -> Self {
        let timestamp_ms = clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        Self(format!("task-{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
