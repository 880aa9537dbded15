//! Repository traits describing persistence adapters.
//!
//! All job mutations are expressed as atomic operations against the stored
//! record: conditional transitions report whether the guard matched instead of
//! failing, so callers can treat a lost claim race as a normal no-op.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    entities::{AccessGrantRecord, DocumentRecord, JobRecord, PageArtifact},
    layout::PageLayout,
    types::{JobStage, JobStatus},
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJobParams {
    pub user_id: String,
    pub email: Option<String>,
    pub assigned_quota: Option<f64>,
    pub layout_pages: Vec<PageLayout>,
}

#[derive(Debug, Clone)]
pub struct NewDocumentParams {
    pub storage_key: String,
    pub total_prints: i32,
}

#[derive(Debug, Clone)]
pub struct UpsertAccessGrantParams {
    pub user_id: String,
    pub document_id: Uuid,
    pub session_token: String,
    pub prints_allowed: i32,
}

#[async_trait]
pub trait JobsRepo: Send + Sync {
    /// Create a pending job with `total_pages == layout_pages.len()`.
    async fn create_job(&self, params: NewJobParams) -> Result<JobRecord, RepoError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError>;

    /// Atomically increment `completed_pages`, append the artifact and move
    /// the job into the rendering stage, returning the updated record so the
    /// caller can read the counters back in the same linearization point.
    async fn record_page_artifact(
        &self,
        job_id: Uuid,
        artifact: PageArtifact,
    ) -> Result<JobRecord, RepoError>;

    /// Conditional transition into `merging`, guarded by: no output document
    /// AND stage is `pending` or `rendering`. Returns whether the guard
    /// matched; at most one concurrent caller observes `true`.
    async fn claim_merge_trigger(&self, job_id: Uuid) -> Result<bool, RepoError>;

    /// Merge worker's claim before downloading artifacts: no output document
    /// AND stage is not `completed`. Same match-and-set semantics as
    /// [`Self::claim_merge_trigger`] with a wider guard so a re-delivered or
    /// healed merge task can re-enter the stage.
    async fn claim_merge_run(&self, job_id: Uuid) -> Result<bool, RepoError>;

    /// Final transition: stage/status completed plus the output document
    /// reference, set exactly once.
    async fn finalize_job(&self, job_id: Uuid, document_id: Uuid) -> Result<(), RepoError>;

    /// Mark the job failed and keep the reason for operators. Failed jobs
    /// stay eligible for reconciliation.
    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<(), RepoError>;

    /// Reconciler repair: force the stage/status pair, e.g. to flip a failed
    /// job back into `rendering`/`processing` before re-issuing its tasks.
    async fn reset_job_stage(
        &self,
        job_id: Uuid,
        stage: JobStage,
        status: JobStatus,
    ) -> Result<(), RepoError>;

    /// Drop duplicate artifacts sharing a page index, keeping the first entry
    /// per slot, and re-derive `completed_pages` from the distinct count.
    async fn dedupe_page_artifacts(&self, job_id: Uuid) -> Result<JobRecord, RepoError>;
}

#[async_trait]
pub trait DocumentsRepo: Send + Sync {
    async fn create_document(&self, params: NewDocumentParams)
    -> Result<DocumentRecord, RepoError>;

    async fn find_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, RepoError>;
}

#[async_trait]
pub trait AccessGrantsRepo: Send + Sync {
    /// Insert-or-overwrite keyed on `(user_id, document_id)`; repeated
    /// finalization attempts update the existing grant in place.
    async fn upsert_access_grant(
        &self,
        params: UpsertAccessGrantParams,
    ) -> Result<AccessGrantRecord, RepoError>;

    async fn find_access_grant(
        &self,
        user_id: &str,
        document_id: Uuid,
    ) -> Result<Option<AccessGrantRecord>, RepoError>;
}
