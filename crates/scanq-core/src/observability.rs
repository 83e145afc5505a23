//! Queue counts for per-cycle log lines and status views.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::scheduler::claim::{is_sidecar, is_task_file};

/// Point-in-time census of the queue directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub in_flight: usize,
    pub processed: usize,
    pub failed: usize,
}

impl QueueSnapshot {
    /// Count backing documents (not sidecars) in each queue directory.
    pub async fn scan(config: &ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            pending: count_documents(&config.tasks_dir).await?,
            in_flight: count_documents(&config.inflight_dir).await?,
            processed: count_documents(&config.processed_dir).await?,
            failed: count_documents(&config.failed_dir).await?,
        })
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub recovered: usize,
    pub discovered: usize,
    pub claimed: usize,
}

impl CycleStats {
    /// Quiet cycles are not worth a log line.
    pub fn is_quiet(&self) -> bool {
        self.recovered == 0 && self.discovered == 0 && self.claimed == 0
    }
}

async fn count_documents(dir: &Path) -> Result<usize, ServiceError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(name) = entry.file_name().into_string() {
            if is_task_file(&name) && !is_sidecar(&name) {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use tempfile::TempDir;

    #[tokio::test]
    async fn snapshot_counts_documents_but_not_sidecars() {
        let root = TempDir::new().unwrap();
        let config = ConfigFile {
            base_directory: root.path().to_path_buf(),
            ..ConfigFile::default()
        }
        .resolve()
        .unwrap();
        config.ensure_dirs().unwrap();

        tokio::fs::write(config.tasks_dir.join("a.tsk"), "{}")
            .await
            .unwrap();
        tokio::fs::write(config.tasks_dir.join("b.json"), "{}")
            .await
            .unwrap();
        tokio::fs::write(config.processed_dir.join("c.tsk"), "{}")
            .await
            .unwrap();
        tokio::fs::write(config.processed_dir.join("c_result.json"), "{}")
            .await
            .unwrap();
        tokio::fs::write(config.failed_dir.join("d_result.json"), "{}")
            .await
            .unwrap();

        let snapshot = QueueSnapshot::scan(&config).await.unwrap();
        assert_eq!(
            snapshot,
            QueueSnapshot {
                pending: 2,
                in_flight: 0,
                processed: 1,
                failed: 0,
            }
        );
    }

    #[test]
    fn quiet_cycles_are_detected() {
        assert!(CycleStats::default().is_quiet());
        assert!(
            !CycleStats {
                claimed: 1,
                ..CycleStats::default()
            }
            .is_quiet()
        );
    }
}
