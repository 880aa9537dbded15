//! Shared domain enumerations aligned with persisted state.

use serde::{Deserialize, Serialize};

/// Fine-grained pipeline phase of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Rendering,
    Merging,
    Completed,
    Failed,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Rendering => "rendering",
            JobStage::Merging => "merging",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
        }
    }
}

/// Coarse client-facing state mirroring [`JobStage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Queues consumed by the pipeline workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    RenderPage,
    MergeDocument,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::RenderPage => "render_page",
            QueueName::MergeDocument => "merge_document",
        }
    }
}

/// Lifecycle state of a queued task. Completed tasks are removed from the
/// queue, so only live states are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for JobStage {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(JobStage::Pending),
            "rendering" => Ok(JobStage::Rendering),
            "merging" => Ok(JobStage::Merging),
            "completed" => Ok(JobStage::Completed),
            "failed" => Ok(JobStage::Failed),
            _ => Err(()),
        }
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

impl TryFrom<&str> for TaskState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "failed" => Ok(TaskState::Failed),
            _ => Err(()),
        }
    }
}

/// Deterministic task identity for rendering one page of a job.
pub fn render_task_id(job_id: uuid::Uuid, page_index: i32) -> String {
    format!("{job_id}-page-{page_index}")
}

/// Deterministic task identity for merging a job's pages.
pub fn merge_task_id(job_id: uuid::Uuid) -> String {
    format!("{job_id}-merge")
}
