use thiserror::Error;

use crate::config::ConfigError;

/// Crate-level error for queue operations.
///
/// Per-task failures travel as [`crate::domain::TaskFailure`] values into
/// the filing agent instead; this type is for the operations around them
/// (filing moves, sidecar writes, startup).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
