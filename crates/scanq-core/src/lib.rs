//! scanq-core
//!
//! Core building blocks for the scanq daemon: a directory of task
//! descriptor files becomes a durable, low-concurrency job queue in front
//! of a long-running segmentation inference engine.
//!
//! - **domain**: canonical task model, lifecycle states, outcome reports
//! - **schema**: multi-dialect document normalizer and validation
//! - **engine**: inference engine port, device policy, out-of-process client
//! - **filing**: terminal bookkeeping (processed/failed/requeue, sidecars)
//! - **scheduler**: polling loop, atomic claims, bounded dispatch, recovery
//! - **config**: service configuration, loaded once and immutable
//!
//! The filesystem is the source of truth throughout: a task's status is
//! the queue directory its backing file sits in, the only mutation
//! primitive is an atomic rename, and everything the scheduler knows is
//! reconstructible by scanning the directories after a restart.

pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod filing;
pub mod observability;
pub mod schema;
pub mod scheduler;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, ConfigFile, ServiceConfig};
pub use domain::{Task, TaskId, TaskStatus};
pub use engine::{CommandEngine, InferenceEngine};
pub use error::ServiceError;
pub use scheduler::Scheduler;
