//! Canonical task model.
//!
//! The normalizer folds both accepted document dialects into this one
//! representation before any scheduling or engine logic runs. Serializing
//! a `Task` emits the canonical dialect, which is also what the engine
//! client receives on stdin.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// One voxel position inside the scan's sampling grid.
pub type Voxel = [i64; 3];

/// What the engine is asked to segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegMode {
    /// Whole-body segmentation over the engine's full label set.
    Full,

    /// Point-guided segmentation driven by per-label prompts.
    Point,

    /// Segmentation restricted to an explicit list of organ labels.
    #[serde(rename = "specific")]
    OrganList,
}

/// An organ identifier, either a numeric engine label or a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelRef {
    Id(u32),
    Name(String),
}

impl std::fmt::Display for LabelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelRef::Id(id) => id.fmt(f),
            LabelRef::Name(name) => name.fmt(f),
        }
    }
}

/// A point-mode hint: one target label with positive/negative voxel clicks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointPrompt {
    #[serde(rename = "target_output_label")]
    pub label: LabelRef,

    #[serde(default)]
    pub positive_points: Vec<Voxel>,

    #[serde(default)]
    pub negative_points: Vec<Voxel>,
}

impl PointPrompt {
    /// Total number of guiding points, positive and negative.
    pub fn point_count(&self) -> usize {
        self.positive_points.len() + self.negative_points.len()
    }
}

/// One unit of queued work, normalized from a task descriptor document.
///
/// `prompts` is non-empty exactly when `mode` is `Point`; `organ_labels`
/// exactly when `mode` is `OrganList`. The normalizer enforces both.
///
/// A task's status is not stored here: the queue directory a backing file
/// sits in is the status, and reports record the terminal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,

    #[serde(rename = "input_file")]
    pub input_path: PathBuf,

    pub output_directory: PathBuf,

    #[serde(rename = "segmentation_type")]
    pub mode: SegMode,

    #[serde(
        rename = "segmentation_prompts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub prompts: Vec<PointPrompt>,

    #[serde(rename = "label_prompt", default, skip_serializing_if = "Vec::is_empty")]
    pub organ_labels: Vec<LabelRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Completed claim attempts so far. 0 for a freshly authored task;
    /// rewritten into the backing document on every requeue.
    #[serde(default)]
    pub attempt_count: u32,
}
