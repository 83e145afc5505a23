//! Inference engine port.
//!
//! The segmentation computation itself lives behind this trait; the queue
//! only knows the contract: one normalized task in, artifact paths or a
//! classified failure out. Implementations may run in-process or shell out
//! to a separate runtime (see [`command::CommandEngine`]).

pub mod command;
pub mod device;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ErrorCategory, Segmentation, Task, TaskFailure};
use device::Device;

pub use command::CommandEngine;
pub use device::{DevicePreference, DeviceProbe, FixedProbe, SystemProbe, select_device};

/// A classified engine-side failure.
///
/// Implementations convert every internal error to one of these at the
/// boundary; nothing from inside the engine may escape and take the
/// scheduler loop down with it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl EngineFailure {
    pub fn device(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Device,
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Engine,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Timeout,
            message: message.into(),
        }
    }
}

impl From<EngineFailure> for TaskFailure {
    fn from(failure: EngineFailure) -> Self {
        TaskFailure::new(failure.category, failure.message)
    }
}

/// External collaborator contract: one invocation per claimed task.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Run segmentation for one task on the selected device.
    async fn run(&self, task: &Task, device: Device) -> Result<Segmentation, EngineFailure>;
}
