//! Domain model: identifiers, the canonical task, lifecycle states, and
//! outcome reports.

pub mod ids;
pub mod report;
pub mod status;
pub mod task;

pub use ids::TaskId;
pub use report::{ErrorCategory, Segmentation, TaskFailure, TaskReport};
pub use status::TaskStatus;
pub use task::{LabelRef, PointPrompt, SegMode, Task, Voxel};
