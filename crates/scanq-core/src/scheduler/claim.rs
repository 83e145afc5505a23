//! Claiming and crash recovery.
//!
//! A claim is an atomic rename out of the tasks directory into the
//! inflight directory. The rename is the queue's mutual-exclusion point:
//! of two racing claimants, exactly one rename succeeds and the loser
//! sees the source gone. No lock survives a crash, so recovery is just a
//! sweep of the inflight directory for entries nobody is working on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::filing::relocate;

/// The original service consumed `.tsk` files while its task creator
/// wrote `.json`; both are accepted.
const TASK_EXTENSIONS: &[&str] = &["tsk", "json"];

pub(crate) fn is_task_file(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| TASK_EXTENSIONS.iter().any(|t| ext.eq_ignore_ascii_case(t)))
}

pub(crate) fn is_sidecar(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(stem, _)| stem.contains("_result"))
}

/// A claimed backing file sitting in the inflight directory.
#[derive(Debug, Clone)]
pub struct Claim {
    pub path: PathBuf,
}

/// List candidate task files, sorted by filename for FIFO-ish ordering.
pub async fn list_candidates(tasks_dir: &Path) -> Result<Vec<String>, ServiceError> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(tasks_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_task_file(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Atomically claim one candidate. `None` means another claimant won the
/// race (or the file vanished), which is not an error.
pub async fn claim_task(
    config: &ServiceConfig,
    name: &str,
) -> Result<Option<Claim>, ServiceError> {
    let src = config.tasks_dir.join(name);
    Ok(relocate(&src, &config.inflight_dir, name)
        .await?
        .map(|path| Claim { path }))
}

/// Requeue inflight entries abandoned by a crashed run.
///
/// An entry is abandoned when no live worker owns it (`active`) and its
/// last modification is older than the configured grace period. The
/// attempt count is bumped when the document parses, so a task that
/// keeps taking the process down still dead-letters eventually; an
/// unparsable document goes back unchanged and the normalizer rejects it
/// on the next claim.
pub async fn recover_stale(
    config: &ServiceConfig,
    active: &HashSet<String>,
) -> Result<usize, ServiceError> {
    let mut entries = match tokio::fs::read_dir(&config.inflight_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut recovered = 0;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_task_file(&name) || active.contains(&name) {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < config.stale_claim_grace {
            continue;
        }

        let path = entry.path();
        if let Ok(raw) = tokio::fs::read(&path).await {
            if let Ok(mut doc) = serde_json::from_slice::<Value>(&raw) {
                if let Some(obj) = doc.as_object_mut() {
                    let attempts =
                        obj.get("attempt_count").and_then(Value::as_u64).unwrap_or(0) + 1;
                    obj.insert("attempt_count".to_string(), attempts.into());
                    if let Ok(body) = serde_json::to_vec_pretty(&doc) {
                        let _ = tokio::fs::write(&path, body).await;
                    }
                }
            }
        }

        if relocate(&path, &config.tasks_dir, &name).await?.is_some() {
            warn!(file = %name, "requeued abandoned claim");
            recovered += 1;
        }
    }
    Ok(recovered)
}
