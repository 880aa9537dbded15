//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{
    layout::PageLayout,
    types::{JobStage, JobStatus, TaskState},
};

/// One rendered page, addressed by its slot in the document and the blob key
/// holding its PDF bytes. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageArtifact {
    pub page_index: i32,
    pub storage_key: String,
}

/// One document-generation request, tracked through the render and merge
/// stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub user_id: String,
    pub email: Option<String>,
    /// Page-print quota assigned at creation; opaque to the pipeline until the
    /// merge stage coerces it into the document's print allowance.
    pub assigned_quota: Option<f64>,
    pub total_pages: i32,
    pub completed_pages: i32,
    pub page_artifacts: Vec<PageArtifact>,
    /// Immutable input captured at creation.
    pub layout_pages: Vec<PageLayout>,
    pub stage: JobStage,
    pub status: JobStatus,
    /// Set exactly once when the merge stage finalizes; its presence is the
    /// authoritative "done" signal.
    pub output_document_id: Option<Uuid>,
    /// Last recorded failure, kept for operators; cleared when the reconciler
    /// revives the job.
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl JobRecord {
    /// Distinct page indices covered by persisted artifacts.
    pub fn covered_page_indices(&self) -> std::collections::BTreeSet<i32> {
        self.page_artifacts
            .iter()
            .map(|artifact| artifact.page_index)
            .collect()
    }

    /// Whether every page slot in `[0, total_pages)` has an artifact.
    pub fn all_pages_rendered(&self) -> bool {
        let covered = self.covered_page_indices();
        (0..self.total_pages).all(|index| covered.contains(&index))
    }

    /// Page indices still missing an artifact.
    pub fn missing_page_indices(&self) -> Vec<i32> {
        let covered = self.covered_page_indices();
        (0..self.total_pages)
            .filter(|index| !covered.contains(index))
            .collect()
    }
}

/// Final merged output record, created once per job by the merge worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub storage_key: String,
    pub total_prints: i32,
    pub created_at: OffsetDateTime,
}

/// Maps (user, document) to a remaining-print quota and a single-use session
/// token. Unique on the pair; written via upsert so repeated finalization is
/// safe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessGrantRecord {
    pub id: Uuid,
    pub user_id: String,
    pub document_id: Uuid,
    pub session_token: String,
    pub prints_allowed: i32,
    pub prints_used: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A queued unit of work leased to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub task_id: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
}

/// Snapshot of a task's queue entry, used by the reconciler to decide between
/// retrying in place and enqueueing fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub state: TaskState,
    pub attempts: i32,
}
