//! Pipeline entry points: job submission and status reads.

use tracing::info;
use uuid::Uuid;

use crate::application::pipeline::render_worker::RENDER_TASK_MAX_ATTEMPTS;
use crate::application::pipeline::{PipelineError, Reconciler, WorkerContext};
use crate::application::queue::{RenderPageTask, TaskSpec};
use crate::application::repos::{NewJobParams, RepoError};
use crate::domain::entities::JobRecord;
use crate::domain::types::{QueueName, render_task_id};

/// Create a job from validated layouts and fan out one render task per page.
/// Task identities are derived from the job id, so a crash between the insert
/// and the last enqueue leaves a state the reconciler can finish.
pub async fn submit_job(
    ctx: &WorkerContext,
    params: NewJobParams,
) -> Result<JobRecord, PipelineError> {
    if params.layout_pages.is_empty() {
        return Err(RepoError::invalid_input("a job needs at least one page").into());
    }
    for (index, layout) in params.layout_pages.iter().enumerate() {
        layout
            .validate()
            .map_err(|err| RepoError::invalid_input(format!("page {index}: {err}")))?;
    }

    let job = ctx.jobs.create_job(params).await?;

    for page_index in 0..job.total_pages {
        let spec = TaskSpec::new(
            QueueName::RenderPage,
            render_task_id(job.id, page_index),
            &RenderPageTask {
                job_id: job.id,
                page_index,
            },
            RENDER_TASK_MAX_ATTEMPTS,
        )?;
        ctx.queue.enqueue(spec).await?;
    }

    metrics::counter!("pressroom_jobs_submitted_total").increment(1);
    info!(
        target = "application::pipeline::submit",
        job_id = %job.id,
        user_id = %job.user_id,
        pages = job.total_pages,
        "job submitted"
    );
    Ok(job)
}

/// Read a job for a status poll. Every read doubles as a reconciliation
/// opportunity: the reconciler inspects the job and repairs drift before the
/// record is returned, so polling clients drive recovery for free.
pub async fn job_status(
    ctx: &WorkerContext,
    reconciler: &Reconciler,
    job_id: Uuid,
) -> Result<Option<JobRecord>, PipelineError> {
    let outcome = reconciler.heal(ctx, job_id).await;
    tracing::debug!(
        target = "application::pipeline::submit",
        job_id = %job_id,
        outcome = ?outcome,
        "reconciliation piggybacked on status read"
    );
    Ok(ctx.jobs.find_job(job_id).await?)
}
