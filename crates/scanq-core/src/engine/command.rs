//! Out-of-process engine client.
//!
//! Invokes a configured command once per claimed task: the canonical task
//! document goes in on stdin, the selected device is passed as an argument,
//! and the command replies on stdout with a JSON object listing the
//! artifacts it produced:
//!
//! ```json
//! { "output_paths": ["out/ct_seg.nii.gz", "out/ct_seg.json"] }
//! ```
//!
//! Non-zero exit becomes an engine failure, exceeding the configured
//! wall-clock budget a timeout. The child is killed if the invocation is
//! dropped mid-flight.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::device::Device;
use super::{EngineFailure, InferenceEngine};
use crate::config::EngineConfig;
use crate::domain::{Segmentation, Task};

pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EngineReply {
    output_paths: Vec<std::path::PathBuf>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            config.timeout,
        )
    }
}

#[async_trait]
impl InferenceEngine for CommandEngine {
    async fn run(&self, task: &Task, device: Device) -> Result<Segmentation, EngineFailure> {
        tokio::fs::create_dir_all(&task.output_directory)
            .await
            .map_err(|e| {
                EngineFailure::engine(format!(
                    "cannot create output directory {}: {e}",
                    task.output_directory.display()
                ))
            })?;

        let payload = serde_json::to_vec(task)
            .map_err(|e| EngineFailure::engine(format!("cannot encode task document: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--device")
            .arg(device.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineFailure::engine(format!("cannot spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The engine may exit before consuming stdin; its exit status
            // is authoritative, so a broken pipe here is not an error.
            let _ = stdin.write_all(&payload).await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(EngineFailure::timeout(format!(
                    "inference exceeded {}s budget",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                return Err(EngineFailure::engine(format!(
                    "waiting on {} failed: {e}",
                    self.program
                )));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineFailure::engine(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let reply: EngineReply = serde_json::from_slice(&output.stdout).map_err(|e| {
            EngineFailure::engine(format!("unparsable reply from {}: {e}", self.program))
        })?;

        Ok(Segmentation {
            output_paths: reply.output_paths,
            device_used: device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorCategory, SegMode, TaskId};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn task_in(dir: &std::path::Path) -> Task {
        Task {
            task_id: TaskId::new("t1"),
            input_path: PathBuf::from("scan.nii.gz"),
            output_directory: dir.join("out"),
            mode: SegMode::Full,
            prompts: vec![],
            organ_labels: vec![],
            description: None,
            attempt_count: 0,
        }
    }

    fn shell(script: &str, timeout: Duration) -> CommandEngine {
        CommandEngine::new("sh", vec!["-c".to_string(), script.to_string()], timeout)
    }

    #[tokio::test]
    async fn parses_the_reply_and_records_the_device() {
        let dir = tempdir().unwrap();
        let engine = shell(
            r#"cat > /dev/null; echo '{"output_paths": ["out/ct_seg.nii.gz"]}'"#,
            Duration::from_secs(5),
        );

        let seg = engine.run(&task_in(dir.path()), Device::Cpu).await.unwrap();
        assert_eq!(seg.output_paths, vec![PathBuf::from("out/ct_seg.nii.gz")]);
        assert_eq!(seg.device_used, Device::Cpu);
        // Output directory was created before the engine ran.
        assert!(dir.path().join("out").is_dir());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_engine_failure_with_stderr() {
        let dir = tempdir().unwrap();
        let engine = shell("echo boom >&2; exit 3", Duration::from_secs(5));

        let failure = engine
            .run(&task_in(dir.path()), Device::Cpu)
            .await
            .unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Engine);
        assert!(failure.message.contains("boom"), "{}", failure.message);
    }

    #[tokio::test]
    async fn exceeding_the_budget_is_a_timeout() {
        let dir = tempdir().unwrap();
        let engine = shell("sleep 5", Duration::from_millis(50));

        let failure = engine
            .run(&task_in(dir.path()), Device::Cpu)
            .await
            .unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Timeout);
    }

    #[tokio::test]
    async fn missing_program_is_an_engine_failure() {
        let dir = tempdir().unwrap();
        let engine = CommandEngine::new(
            "/nonexistent/inference-engine",
            vec![],
            Duration::from_secs(1),
        );

        let failure = engine
            .run(&task_in(dir.path()), Device::Cpu)
            .await
            .unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Engine);
    }

    #[tokio::test]
    async fn garbage_reply_is_an_engine_failure() {
        let dir = tempdir().unwrap();
        let engine = shell("cat > /dev/null; echo not-json", Duration::from_secs(5));

        let failure = engine
            .run(&task_in(dir.path()), Device::Cpu)
            .await
            .unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Engine);
        assert!(failure.message.contains("unparsable"), "{}", failure.message);
    }
}
