//! The two-stage job pipeline: render-per-page, then merge-all-pages.

mod context;
mod merge_worker;
mod pdf;
mod reconciler;
mod render_worker;
mod runner;
mod submit;

pub use context::WorkerContext;
pub use merge_worker::process_merge_task;
pub use pdf::concat_pages;
pub use reconciler::{HealOutcome, Reconciler};
pub use render_worker::{
    MERGE_TASK_MAX_ATTEMPTS, RENDER_TASK_MAX_ATTEMPTS, process_render_page_task,
};
pub use runner::{PipelineRunner, RunnerConfig, RunnerHandle};
pub use submit::{job_status, submit_job};

use thiserror::Error;

use crate::application::{
    blobs::BlobError, engine::RenderError, queue::QueueError, repos::RepoError,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Merge(#[from] pdf::MergeError),
    #[error("pipeline inconsistency: {0}")]
    Inconsistent(String),
}

impl PipelineError {
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent(message.into())
    }
}
